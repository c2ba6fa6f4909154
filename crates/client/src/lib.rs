//! HTTP transport for the remote job server.
//!
//! Provides [`api::HttpJobApi`], a [`reqwest`]-based implementation of
//! [`chemjobs_core::api::RemoteJobApi`], the JSON wire types it
//! exchanges, and environment-driven connection settings.

pub mod api;
pub mod config;
pub mod wire;
