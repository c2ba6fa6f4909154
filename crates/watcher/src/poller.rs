//! Status poller.
//!
//! A single background task that keeps every [`TrackedJob`] current:
//! it polls the server for all tracked categories, applies the returned
//! snapshots, hands stuck jobs back to the server, and deletes finished,
//! cancelled and orphaned jobs remotely before dropping them from the
//! tracking table.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chemjobs_core::types::{AccountingKey, JobCategory, JobHandle, LifecycleStage, StateUpdate};

use crate::config::WatcherConfig;
use crate::error::{JobError, WatchError};
use crate::retry::{grow_delay, try_and_wait};
use crate::tracked::TrackedJob;
use crate::watcher::Shared;

/// Stages requested on every poll.
pub(crate) const POLL_STAGES: [LifecycleStage; 5] = LifecycleStage::ALL;

/// Counters describing one poll iteration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PollOutcome {
    /// Tracked jobs removed after reaching an end state.
    pub removed: usize,
    /// Server jobs unknown locally that were deleted.
    pub orphans: usize,
    /// Stuck jobs handed back to the server.
    pub reset: usize,
}

/// Adaptive delay between polls: short while jobs keep finishing, backing
/// off towards [`WatcherConfig::poll_max_interval`] otherwise.
#[derive(Debug)]
pub(crate) struct PollInterval {
    current: Duration,
    empty_iterations: u32,
    initial: Duration,
    max: Duration,
    multiplier: f64,
    stay_at_initial: u32,
}

impl PollInterval {
    pub(crate) fn new(config: &WatcherConfig) -> Self {
        Self {
            current: config.poll_initial_interval,
            empty_iterations: 0,
            initial: config.poll_initial_interval,
            max: config.poll_max_interval,
            multiplier: config.poll_backoff_multiplier,
            stay_at_initial: config.stay_at_initial,
        }
    }

    /// Record whether the last iteration removed any job and return the
    /// delay before the next one.
    pub(crate) fn next(&mut self, progressed: bool) -> Duration {
        if progressed {
            self.empty_iterations = 0;
            self.current = self.initial;
        } else {
            self.empty_iterations += 1;
            if self.empty_iterations > self.stay_at_initial {
                self.current = grow_delay(self.current, self.multiplier, self.max);
            }
        }
        self.current
    }
}

/// Run the poll loop until the watcher's cancellation token fires.
pub(crate) async fn run(shared: Arc<Shared>) {
    let mut interval = PollInterval::new(&shared.config);
    tracing::info!(
        initial_ms = shared.config.poll_initial_interval.as_millis() as u64,
        max_ms = shared.config.poll_max_interval.as_millis() as u64,
        "Status poller started",
    );

    loop {
        if shared.cancel.is_cancelled() {
            break;
        }

        if shared.tracked.lock().await.is_empty() {
            tokio::select! {
                _ = shared.cancel.cancelled() => break,
                _ = tokio::time::timeout(shared.config.idle_wait, shared.poll_wakeup.notified()) => {}
            }
            continue;
        }

        let progressed = match poll_once(&shared).await {
            Ok(outcome) => {
                if outcome != PollOutcome::default() {
                    tracing::debug!(
                        removed = outcome.removed,
                        orphans = outcome.orphans,
                        reset = outcome.reset,
                        "Poll iteration finished",
                    );
                }
                outcome.removed > 0
            }
            Err(WatchError::Interrupted) => break,
            Err(e) => {
                tracing::error!(error = %e, "Poll iteration failed");
                false
            }
        };

        let wait = interval.next(progressed);
        if !progressed {
            tracing::trace!(wait_ms = wait.as_millis() as u64, "No jobs finished");
        }

        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    tracing::info!("Status poller stopped");
}

/// One poll iteration: fetch, apply, reclaim, delete, reset.
pub(crate) async fn poll_once(shared: &Shared) -> Result<PollOutcome, WatchError> {
    let (updates, known) = {
        // Excludes the batcher's submit-and-register section.
        let tracked = shared.tracked.lock().await;
        if tracked.is_empty() {
            return Ok(PollOutcome::default());
        }

        let categories: Vec<JobCategory> = tracked
            .keys()
            .map(|h| h.category)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let updates = try_and_wait(&shared.config.retry, "poll jobs", &shared.cancel, || {
            shared.api.poll_jobs(&categories, &POLL_STAGES)
        })
        .await?;

        let known: HashMap<JobHandle, TrackedJob> = updates
            .iter()
            .filter_map(|u| tracked.get(&u.handle).map(|job| (u.handle, job.clone())))
            .collect();

        (updates, known)
    };

    let mut sweep = Sweep::default();
    let mut to_reset = Vec::new();

    for update in &updates {
        let Some(job) = known.get(&update.handle) else {
            tracing::warn!(
                handle = %update.handle,
                stage = %update.stage,
                "Job found on the server but unknown locally, deleting it",
            );
            if sweep.add(update.handle, None) {
                sweep.orphans += 1;
            }
            continue;
        };

        if apply_update(&shared.config, job, update) {
            to_reset.push(job.handle());
        }
        if job.stage().is_terminal() || job.is_unsuccessfully_finished() {
            sweep.add(job.handle(), job.accounting_key());
        }
    }

    // Jobs cancelled by their caller have no fresh snapshot to report.
    {
        let tracked = shared.tracked.lock().await;
        for (handle, job) in tracked.iter() {
            if job.is_unsuccessfully_finished() {
                sweep.add(*handle, job.accounting_key());
            }
        }
    }

    let removed = sweep.handles.len() - sweep.orphans;
    if !sweep.handles.is_empty() {
        let delete = try_and_wait(&shared.config.retry, "delete jobs", &shared.cancel, || {
            shared
                .api
                .delete_jobs(&sweep.handles, &sweep.accounting_keys)
        })
        .await;

        match delete {
            Ok(()) => {}
            Err(WatchError::Api(e)) => {
                // Permanent refusal: the server reclaims abandoned jobs itself.
                tracing::warn!(
                    count = sweep.handles.len(),
                    error = %e,
                    "Server refused job deletion, dropping jobs locally",
                );
            }
            Err(e) => return Err(e),
        }

        let mut tracked = shared.tracked.lock().await;
        for handle in &sweep.handles {
            tracked.remove(handle);
        }
    }

    if !to_reset.is_empty() {
        try_and_wait(&shared.config.retry, "reset jobs", &shared.cancel, || {
            shared.api.reset_jobs(&to_reset)
        })
        .await?;
    }

    Ok(PollOutcome {
        removed,
        orphans: sweep.orphans,
        reset: to_reset.len(),
    })
}

/// Apply one snapshot to a known job. Returns `true` when the job must be
/// handed back to the server because its worker appears dead.
fn apply_update(config: &WatcherConfig, job: &TrackedJob, update: &StateUpdate) -> bool {
    let stage = job.update(update);
    if stage != LifecycleStage::Fetched || !job.check_running_timeout() {
        return false;
    }

    if job.resets() >= config.max_resets {
        tracing::warn!(
            handle = %job.handle(),
            resets = job.resets(),
            "Job keeps timing out on remote workers, giving up",
        );
        job.fail(JobError::StuckWorker {
            resets: job.resets(),
        });
        return false;
    }

    let resets = job.reset();
    tracing::warn!(
        handle = %job.handle(),
        resets,
        budget_ms = config.runtime_budget_for(job.category()).as_millis() as u64,
        "Job exceeded its runtime budget, remote worker may have died; resetting",
    );
    true
}

/// Handles collected for one delete call.
#[derive(Default)]
struct Sweep {
    handles: Vec<JobHandle>,
    seen: HashSet<JobHandle>,
    accounting_keys: HashMap<JobHandle, AccountingKey>,
    orphans: usize,
}

impl Sweep {
    /// Add a handle once. Returns whether it was new.
    fn add(&mut self, handle: JobHandle, accounting_key: Option<AccountingKey>) -> bool {
        if !self.seen.insert(handle) {
            return false;
        }
        self.handles.push(handle);
        if let Some(key) = accounting_key {
            self.accounting_keys.insert(handle, key);
        }
        true
    }
}
