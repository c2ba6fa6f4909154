//! Contract of the remote job service.
//!
//! [`RemoteJobApi`] is the only way the watcher talks to the server. The
//! HTTP implementation lives in `chemjobs-client`; tests substitute an
//! in-memory fake.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;

use crate::types::{AccountingKey, JobCategory, JobHandle, JobInput, LifecycleStage, StateUpdate};

/// Inputs of one submission call, grouped by category.
///
/// Within a category, inputs keep their insertion order; the server
/// assigns handles in that same order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobBatch {
    groups: BTreeMap<JobCategory, Vec<JobInput>>,
}

impl JobBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, input: JobInput) {
        self.groups.entry(input.category()).or_default().push(input);
    }

    /// Total number of inputs across all categories.
    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.values().all(Vec::is_empty)
    }

    pub fn categories(&self) -> impl Iterator<Item = JobCategory> + '_ {
        self.groups.keys().copied()
    }

    pub fn inputs(&self, category: JobCategory) -> &[JobInput] {
        self.groups.get(&category).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (JobCategory, &[JobInput])> + '_ {
        self.groups.iter().map(|(c, inputs)| (*c, inputs.as_slice()))
    }
}

/// Handles assigned by a submission call, per category, in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmittedBatch {
    groups: BTreeMap<JobCategory, Vec<JobHandle>>,
}

impl SubmittedBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, category: JobCategory, handles: Vec<JobHandle>) {
        self.groups.insert(category, handles);
    }

    pub fn handles(&self, category: JobCategory) -> &[JobHandle] {
        self.groups.get(&category).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Errors from the remote job API layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// The request never produced a response (network, DNS, TLS, timeout).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server answered with a non-success status code.
    #[error("Job server error ({status}): {body}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The server refused the request permanently (e.g. invalid input).
    #[error("Rejected by job server: {0}")]
    Rejected(String),

    /// The response could not be understood.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ApiError {
    /// Whether retrying the same call may succeed.
    ///
    /// Transport failures, `429 Too Many Requests` and 5xx responses are
    /// transient; everything else is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(_) => true,
            ApiError::Server { status, .. } => *status == 429 || *status >= 500,
            ApiError::Rejected(_) | ApiError::Protocol(_) => false,
        }
    }
}

/// Remote job service operations used by the watcher.
#[async_trait]
pub trait RemoteJobApi: Send + Sync {
    /// Submit a batch of inputs and return the handles the server assigned.
    async fn submit_batch(&self, batch: &JobBatch) -> Result<SubmittedBatch, ApiError>;

    /// Fetch the current state of this client's jobs in the given
    /// categories, restricted to the given stages.
    async fn poll_jobs(
        &self,
        categories: &[JobCategory],
        stages: &[LifecycleStage],
    ) -> Result<Vec<StateUpdate>, ApiError>;

    /// Delete jobs on the server, forwarding accounting keys where known.
    async fn delete_jobs(
        &self,
        handles: &[JobHandle],
        accounting_keys: &HashMap<JobHandle, AccountingKey>,
    ) -> Result<(), ApiError>;

    /// Return jobs to the server's queue so another worker can claim them.
    async fn reset_jobs(&self, handles: &[JobHandle]) -> Result<(), ApiError>;
}
