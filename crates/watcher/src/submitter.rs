//! Submission batcher.
//!
//! Callers enqueue [`SubmissionRequest`]s without blocking. A single
//! background task drains the queue, groups the requests by category
//! and turns each drain into one `submit_batch` call, rate-limited by
//! [`WatcherConfig::min_submit_interval`](crate::config::WatcherConfig::min_submit_interval).
//!
//! Submission and registration of the resulting [`TrackedJob`]s happen
//! while holding the tracking-table lock, so the status poller can never
//! see a server handle that is not registered yet.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use chemjobs_core::api::JobBatch;
use chemjobs_core::types::{AccountingKey, JobCategory, JobInput};
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use crate::error::{SubmitError, WatchError};
use crate::retry::try_and_wait;
use crate::tracked::TrackedJob;
use crate::watcher::Shared;

/// A job waiting to be sent to the server.
pub(crate) struct SubmissionRequest {
    id: u64,
    input: JobInput,
    accounting_key: Option<AccountingKey>,
    slot: oneshot::Sender<Result<TrackedJob, SubmitError>>,
}

impl SubmissionRequest {
    fn reject(self, error: SubmitError) {
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.slot.send(Err(error));
    }
}

/// Pending submissions shared between callers and the batcher task.
#[derive(Default)]
pub(crate) struct PendingQueue {
    requests: Mutex<VecDeque<SubmissionRequest>>,
    wakeup: Notify,
    next_id: AtomicU64,
}

impl PendingQueue {
    /// Queue `input` for submission and wake the batcher.
    pub(crate) fn enqueue(
        self: &Arc<Self>,
        input: JobInput,
        accounting_key: Option<AccountingKey>,
    ) -> PendingSubmission {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (slot, rx) = oneshot::channel();
        let category = input.category();

        self.lock().push_back(SubmissionRequest {
            id,
            input,
            accounting_key,
            slot,
        });
        self.wakeup.notify_one();

        PendingSubmission {
            id,
            category,
            queue: Arc::clone(self),
            rx,
            canceled: false,
        }
    }

    /// Remove a still-queued request. Returns `false` once the batcher
    /// already took it.
    fn remove(&self, id: u64) -> bool {
        let mut requests = self.lock();
        match requests.iter().position(|r| r.id == id) {
            Some(index) => {
                requests.remove(index);
                true
            }
            None => false,
        }
    }

    /// Take every queued request whose caller is still waiting.
    pub(crate) fn drain_live(&self) -> Vec<SubmissionRequest> {
        let drained: Vec<_> = self.lock().drain(..).collect();
        let total = drained.len();
        let live: Vec<_> = drained
            .into_iter()
            .filter(|r| !r.slot.is_closed())
            .collect();
        if live.len() < total {
            tracing::debug!(dropped = total - live.len(), "Skipping abandoned submissions");
        }
        live
    }

    /// Put requests back at the front of the queue, keeping their order.
    pub(crate) fn restore(&self, requests: Vec<SubmissionRequest>) {
        let mut queue = self.lock();
        for request in requests.into_iter().rev() {
            queue.push_front(request);
        }
    }

    /// Fail every queued request with `error`.
    pub(crate) fn fail_all(&self, error: SubmitError) {
        let drained: Vec<_> = self.lock().drain(..).collect();
        for request in drained {
            request.reject(error.clone());
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) async fn notified(&self) {
        self.wakeup.notified().await;
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<SubmissionRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Future returned by
/// [`JobWatcher::submit_and_watch`](crate::watcher::JobWatcher::submit_and_watch).
///
/// Resolves once the server assigned a handle to the job, not once the
/// job finished; use [`TrackedJob::wait`] for that.
pub struct PendingSubmission {
    id: u64,
    category: JobCategory,
    queue: Arc<PendingQueue>,
    rx: oneshot::Receiver<Result<TrackedJob, SubmitError>>,
    canceled: bool,
}

impl PendingSubmission {
    pub fn category(&self) -> JobCategory {
        self.category
    }

    /// Withdraw the submission.
    ///
    /// A request still in the queue is removed without any server call.
    /// If the batcher is already submitting it, the resulting job is
    /// cancelled on arrival and deleted by the next poll sweep. Returns
    /// whether the request was still queued.
    pub fn cancel(&mut self) -> bool {
        self.canceled = true;
        self.rx.close();
        self.queue.remove(self.id)
    }
}

impl Future for PendingSubmission {
    type Output = Result<TrackedJob, SubmitError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let canceled = self.canceled;
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            // Handle arrived before the cancel took effect.
            Ok(Ok(job)) if canceled => {
                job.cancel();
                Err(SubmitError::Canceled)
            }
            Ok(result) => result,
            Err(_) if canceled => Err(SubmitError::Canceled),
            Err(_) => Err(SubmitError::ShutDown),
        })
    }
}

impl std::fmt::Debug for PendingSubmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSubmission")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("canceled", &self.canceled)
            .finish()
    }
}

/// Run the batcher loop until the watcher's cancellation token fires.
pub(crate) async fn run(shared: Arc<Shared>) {
    let config = &shared.config;
    tracing::info!(
        min_submit_interval_ms = config.min_submit_interval.as_millis() as u64,
        "Submission batcher started",
    );

    // Treat startup as a submission so the first burst is batched too.
    let mut last_submission = Instant::now();

    loop {
        if shared.cancel.is_cancelled() {
            break;
        }

        if shared.pending.is_empty() {
            // Bounded wait: a lost wakeup only delays, never stalls.
            tokio::select! {
                _ = shared.cancel.cancelled() => break,
                _ = tokio::time::timeout(config.idle_wait, shared.pending.notified()) => {}
            }
            continue;
        }

        let elapsed = last_submission.elapsed();
        if elapsed < config.min_submit_interval {
            tokio::select! {
                _ = shared.cancel.cancelled() => break,
                _ = tokio::time::sleep(config.min_submit_interval - elapsed) => {}
            }
        }

        match submit_pending(&shared).await {
            Ok(None) => {}
            // Any submit call counts towards the rate limit, rejected or not.
            Ok(Some(_)) => last_submission = Instant::now(),
            Err(WatchError::Interrupted) => break,
            Err(e) => {
                tracing::error!(error = %e, "Submission cycle failed");
                last_submission = Instant::now();
            }
        }
    }

    tracing::info!("Submission batcher stopped");
}

/// One activation: drain, submit, register, resolve.
///
/// Returns the number of registered jobs, or `None` if there was nothing
/// to submit and no server call was made.
pub(crate) async fn submit_pending(shared: &Shared) -> Result<Option<usize>, WatchError> {
    // Held until every returned handle is registered.
    let mut tracked = shared.tracked.lock().await;

    let requests = shared.pending.drain_live();
    if requests.is_empty() {
        return Ok(None);
    }

    let mut batch = JobBatch::new();
    for request in &requests {
        batch.push(request.input.clone());
    }
    tracing::debug!(count = batch.len(), "Submitting jobs to server");

    let submitted = match try_and_wait(&shared.config.retry, "submit jobs", &shared.cancel, || {
        shared.api.submit_batch(&batch)
    })
    .await
    {
        Ok(submitted) => submitted,
        Err(e @ WatchError::RetriesExhausted { .. }) => {
            // Keep the requests; the next iteration tries again.
            shared.pending.restore(requests);
            return Err(e);
        }
        Err(WatchError::Api(e)) => {
            tracing::warn!(count = requests.len(), error = %e, "Server rejected job submission");
            for request in requests {
                request.reject(SubmitError::Rejected(e.to_string()));
            }
            return Ok(Some(0));
        }
        Err(WatchError::Interrupted) => {
            for request in requests {
                request.reject(SubmitError::ShutDown);
            }
            return Err(WatchError::Interrupted);
        }
    };

    let mut next_index: HashMap<JobCategory, usize> = HashMap::new();
    let mut registered = 0;

    for request in requests {
        let category = request.input.category();
        let index = next_index.entry(category).or_default();
        let handle = submitted.handles(category).get(*index).copied();
        *index += 1;

        let Some(handle) = handle else {
            tracing::error!(category = %category, "Server assigned no handle to a submitted job");
            request.reject(SubmitError::Rejected(
                "server assigned no handle".to_string(),
            ));
            continue;
        };

        if tracked.contains_key(&handle) {
            tracing::error!(handle = %handle, "Server returned a handle that is already tracked");
            request.reject(SubmitError::Rejected(format!(
                "duplicate handle {handle}"
            )));
            continue;
        }

        let job = TrackedJob::new(
            request.input,
            handle,
            request.accounting_key,
            shared.config.runtime_budget_for(category),
        );
        tracked.insert(handle, job.clone());
        registered += 1;

        if let Err(Ok(job)) = request.slot.send(Ok(job)) {
            // Caller stopped waiting while we were submitting.
            job.cancel();
        }
    }
    drop(tracked);

    tracing::info!(count = registered, "Jobs submitted to server");
    shared.poll_wakeup.notify_one();

    Ok(Some(registered))
}
