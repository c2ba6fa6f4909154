//! Client-side mirror of one submitted remote job.
//!
//! A [`TrackedJob`] is created by the submission batcher once the server
//! assigned a handle, stored in the watcher's tracking table, and handed
//! to the caller. The status poller drives its lifecycle; the caller can
//! only observe it, wait for its outcome, or cancel it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chemjobs_core::output::{JobOutput, OutputDecoder};
use chemjobs_core::types::{
    AccountingKey, JobCategory, JobHandle, JobInput, LifecycleStage, StateUpdate, Timestamp,
};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::JobError;

/// Final outcome of a tracked job.
pub type JobResult = Result<JobOutput, JobError>;

/// Shared handle to a submitted job. Cheap to clone.
#[derive(Clone)]
pub struct TrackedJob {
    inner: Arc<Inner>,
}

struct Inner {
    input: JobInput,
    handle: JobHandle,
    decoder: OutputDecoder,
    accounting_key: Option<AccountingKey>,
    runtime_budget: Duration,
    submitted_at: Timestamp,
    state: Mutex<JobState>,
    /// Resolved at most once; `None` until the job finished.
    outcome: watch::Sender<Option<JobResult>>,
}

struct JobState {
    stage: LifecycleStage,
    /// Set when the job enters `Fetched`; cleared on reset.
    deadline: Option<Instant>,
    resets: u32,
}

impl TrackedJob {
    pub(crate) fn new(
        input: JobInput,
        handle: JobHandle,
        accounting_key: Option<AccountingKey>,
        runtime_budget: Duration,
    ) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                decoder: handle.category.decoder(),
                input,
                handle,
                accounting_key,
                runtime_budget,
                submitted_at: chrono::Utc::now(),
                state: Mutex::new(JobState {
                    stage: LifecycleStage::Submitted,
                    deadline: None,
                    resets: 0,
                }),
                outcome,
            }),
        }
    }

    pub fn handle(&self) -> JobHandle {
        self.inner.handle
    }

    pub fn category(&self) -> JobCategory {
        self.inner.handle.category
    }

    pub fn input(&self) -> &JobInput {
        &self.inner.input
    }

    pub fn accounting_key(&self) -> Option<AccountingKey> {
        self.inner.accounting_key
    }

    pub fn submitted_at(&self) -> Timestamp {
        self.inner.submitted_at
    }

    /// Last stage observed from the server (or set by a local reset).
    pub fn stage(&self) -> LifecycleStage {
        self.state().stage
    }

    /// How often the job was handed back to the server after its worker
    /// stopped responding.
    pub fn resets(&self) -> u32 {
        self.state().resets
    }

    /// Whether an outcome (success or failure) is available.
    pub fn is_finished(&self) -> bool {
        self.inner.outcome.borrow().is_some()
    }

    /// True if the job was cancelled by the caller or finished with any
    /// failure.
    pub fn is_unsuccessfully_finished(&self) -> bool {
        matches!(*self.inner.outcome.borrow(), Some(Err(_)))
    }

    /// Cancel the job locally.
    ///
    /// Waiters observe [`JobError::Canceled`]. The server-side job is
    /// deleted by the next poll sweep, not by this call.
    pub fn cancel(&self) {
        if self.resolve(Err(JobError::Canceled)) {
            tracing::debug!(handle = %self.inner.handle, "Job canceled by caller");
        }
    }

    /// Wait until the job reached a terminal outcome.
    ///
    /// Every waiter observes the same outcome.
    pub async fn wait(&self) -> JobResult {
        let mut rx = self.inner.outcome.subscribe();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(JobError::ShutDown)),
            // The sender lives in `inner`, which `self` keeps alive.
            Err(_) => Err(JobError::ShutDown),
        };
        result
    }

    // ---- watcher-side transitions ----

    /// Apply a server snapshot and return the resulting local stage.
    ///
    /// Stages only move forward; a stale or repeated snapshot leaves the
    /// job untouched. Entering `Fetched` starts the runtime deadline.
    pub(crate) fn update(&self, update: &StateUpdate) -> LifecycleStage {
        {
            let mut state = self.state();
            if update.stage < state.stage {
                tracing::debug!(
                    handle = %self.inner.handle,
                    local = %state.stage,
                    remote = %update.stage,
                    "Ignoring stale job state",
                );
                return state.stage;
            }
            if update.stage == state.stage {
                return state.stage;
            }
            if update.stage == LifecycleStage::Fetched {
                // A budget too large to represent means no deadline.
                state.deadline = Instant::now().checked_add(self.inner.runtime_budget);
            }
            state.stage = update.stage;
        }

        match update.stage {
            LifecycleStage::Done => {
                let result = match &update.output {
                    Some(raw) => (self.inner.decoder)(raw.clone())
                        .map_err(|e| JobError::Decode(e.to_string())),
                    None => Err(JobError::Decode(
                        "server reported DONE without output".to_string(),
                    )),
                };
                if let Err(e) = &result {
                    tracing::warn!(handle = %self.inner.handle, error = %e, "Job output rejected");
                }
                self.resolve(result);
            }
            LifecycleStage::Crashed => {
                let message = update
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "no error message provided".to_string());
                self.resolve(Err(JobError::Crashed(message)));
            }
            LifecycleStage::Canceled => {
                self.resolve(Err(JobError::CanceledRemotely));
            }
            LifecycleStage::Submitted | LifecycleStage::Fetched => {}
        }

        update.stage
    }

    /// True if the job is `Fetched` and has outlived its runtime budget.
    pub(crate) fn check_running_timeout(&self) -> bool {
        let state = self.state();
        state.stage == LifecycleStage::Fetched
            && state.deadline.is_some_and(|deadline| Instant::now() > deadline)
    }

    /// Return the job to `Submitted`, anticipating that the server
    /// re-enqueues it. Returns the new reset count.
    pub(crate) fn reset(&self) -> u32 {
        let mut state = self.state();
        state.stage = LifecycleStage::Submitted;
        state.deadline = None;
        state.resets += 1;
        state.resets
    }

    /// Resolve the job with a failure decided locally.
    pub(crate) fn fail(&self, error: JobError) {
        self.resolve(Err(error));
    }

    // ---- private helpers ----

    /// Store the outcome unless one is already set. Returns whether this
    /// call resolved the job.
    fn resolve(&self, result: JobResult) -> bool {
        self.inner.outcome.send_if_modified(|outcome| {
            if outcome.is_some() {
                return false;
            }
            *outcome = Some(result);
            true
        })
    }

    fn state(&self) -> MutexGuard<'_, JobState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TrackedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedJob")
            .field("handle", &self.inner.handle)
            .field("stage", &self.stage())
            .field("finished", &self.is_finished())
            .finish()
    }
}
