//! Remote job coordinator.
//!
//! [`JobWatcher`] is the entry point for the rest of the application. It
//! queues submissions for the batcher, lazily (re)starts the batcher and
//! poller tasks, and drives an orderly shutdown that deletes every
//! still-tracked job on the server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chemjobs_core::api::RemoteJobApi;
use chemjobs_core::types::{AccountingKey, JobHandle, JobInput};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WatcherConfig;
use crate::error::{JobError, SubmitError};
use crate::retry::try_and_wait;
use crate::submitter::{PendingQueue, PendingSubmission};
use crate::tracked::TrackedJob;
use crate::{poller, submitter};

/// State shared by the coordinator and both background loops.
pub(crate) struct Shared {
    pub(crate) api: Arc<dyn RemoteJobApi>,
    pub(crate) config: WatcherConfig,
    pub(crate) pending: Arc<PendingQueue>,
    /// Tracking table. Also serialises submit-and-register against polls.
    pub(crate) tracked: tokio::sync::Mutex<HashMap<JobHandle, TrackedJob>>,
    pub(crate) poll_wakeup: Notify,
    /// Master cancellation token, cancelled during shutdown.
    pub(crate) cancel: CancellationToken,
}

/// Background task handles.
#[derive(Default)]
struct Loops {
    submitter: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
}

/// Submits jobs to the remote job server and watches them until they
/// finish.
///
/// Must be used from within a Tokio runtime. Call
/// [`shutdown`](Self::shutdown) before dropping it so that jobs still
/// running remotely are cleaned up.
pub struct JobWatcher {
    shared: Arc<Shared>,
    loops: Mutex<Loops>,
    is_shut_down: AtomicBool,
}

impl JobWatcher {
    pub fn new(api: Arc<dyn RemoteJobApi>, config: WatcherConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                api,
                config,
                pending: Arc::new(PendingQueue::default()),
                tracked: tokio::sync::Mutex::new(HashMap::new()),
                poll_wakeup: Notify::new(),
                cancel: CancellationToken::new(),
            }),
            loops: Mutex::new(Loops::default()),
            is_shut_down: AtomicBool::new(false),
        }
    }

    /// Queue `input` for submission and start watching it.
    ///
    /// The returned future resolves once the server assigned a handle;
    /// the job's own completion is observed via [`TrackedJob::wait`].
    /// `accounting_key` is forwarded to the server when the job is
    /// deleted.
    pub fn submit_and_watch(
        &self,
        input: JobInput,
        accounting_key: Option<AccountingKey>,
    ) -> Result<PendingSubmission, SubmitError> {
        if self.is_shut_down.load(Ordering::SeqCst) {
            return Err(SubmitError::ShutDown);
        }

        let pending = self.shared.pending.enqueue(input, accounting_key);
        if !self.ensure_loops_running() {
            // Shutdown won the race; it may already have drained the queue.
            self.shared.pending.fail_all(SubmitError::ShutDown);
            return Err(SubmitError::ShutDown);
        }
        Ok(pending)
    }

    /// Number of jobs currently tracked (submitted and not yet removed).
    pub async fn tracked_count(&self) -> usize {
        self.shared.tracked.lock().await.len()
    }

    /// Number of submissions waiting for the batcher.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down.load(Ordering::SeqCst)
    }

    /// Stop both loops and clean up server-side state.
    ///
    /// Waits up to `shutdown_grace` per loop (aborting a loop that does
    /// not exit), fails queued submissions, then tries for at most
    /// `cleanup_timeout` to delete every still-tracked job on the server.
    /// Cleanup failures are only logged. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.is_shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down job watcher");
        self.shared.cancel.cancel();

        let loops = {
            let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *loops)
        };
        let grace = self.shared.config.shutdown_grace;
        for (name, handle) in [
            ("submission batcher", loops.submitter),
            ("status poller", loops.poller),
        ] {
            let Some(mut handle) = handle else { continue };
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                tracing::warn!(task = name, "Loop did not stop in time, aborting it");
                handle.abort();
                let _ = handle.await;
            }
        }

        self.shared.pending.fail_all(SubmitError::ShutDown);
        self.delete_leftover_jobs().await;

        tracing::info!("Job watcher shut down complete");
    }

    // ---- private helpers ----

    /// Spawn whichever loop is not running. Returns `false` if the watcher
    /// is shut down.
    fn ensure_loops_running(&self) -> bool {
        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        // Checked under the lock so no loop is spawned after shutdown took it.
        if self.is_shut_down.load(Ordering::SeqCst) {
            return false;
        }

        if needs_spawn(&loops.submitter, "submission batcher") {
            loops.submitter = Some(tokio::spawn(submitter::run(Arc::clone(&self.shared))));
        }
        if needs_spawn(&loops.poller, "status poller") {
            loops.poller = Some(tokio::spawn(poller::run(Arc::clone(&self.shared))));
        }
        true
    }

    /// Best-effort, time-bounded deletion of every tracked job.
    async fn delete_leftover_jobs(&self) {
        let jobs: Vec<(JobHandle, TrackedJob)> =
            self.shared.tracked.lock().await.drain().collect();
        if jobs.is_empty() {
            return;
        }

        let handles: Vec<JobHandle> = jobs.iter().map(|(handle, _)| *handle).collect();
        // Only finished jobs are billed.
        let accounting_keys: HashMap<JobHandle, AccountingKey> = jobs
            .iter()
            .filter(|(_, job)| job.stage().is_terminal())
            .filter_map(|(handle, job)| job.accounting_key().map(|key| (*handle, key)))
            .collect();

        tracing::debug!(count = handles.len(), "Deleting leftover jobs on the server");
        // The master token is already cancelled; the timeout bounds this call.
        let uncancelled = CancellationToken::new();
        let cleanup = try_and_wait(
            &self.shared.config.retry,
            "delete leftover jobs",
            &uncancelled,
            || self.shared.api.delete_jobs(&handles, &accounting_keys),
        );

        match tokio::time::timeout(self.shared.config.cleanup_timeout, cleanup).await {
            Ok(Ok(())) => {
                tracing::info!(count = handles.len(), "Deleted leftover jobs on the server");
            }
            Ok(Err(e)) => {
                tracing::warn!(count = handles.len(), error = %e, "Failed to delete leftover jobs");
            }
            Err(_) => {
                tracing::warn!(count = handles.len(), "Timed out deleting leftover jobs");
            }
        }

        for (_, job) in jobs {
            job.fail(JobError::ShutDown);
        }
    }
}

impl Drop for JobWatcher {
    fn drop(&mut self) {
        // Without an explicit shutdown, at least stop the loops.
        self.shared.cancel.cancel();
    }
}

fn needs_spawn(handle: &Option<JoinHandle<()>>, name: &'static str) -> bool {
    match handle {
        None => true,
        Some(handle) if handle.is_finished() => {
            tracing::warn!(task = name, "Loop exited unexpectedly, restarting it");
            true
        }
        Some(_) => false,
    }
}
