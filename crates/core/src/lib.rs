//! Shared data model for remote compute jobs.
//!
//! Defines the job categories, server-assigned handles, lifecycle stages
//! and state snapshots exchanged with the remote job service, the
//! per-category output decoders, and the [`api::RemoteJobApi`] trait that
//! transports implement.

pub mod api;
pub mod error;
pub mod output;
pub mod types;
