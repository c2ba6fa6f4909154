#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use chemjobs_core::api::{ApiError, JobBatch, RemoteJobApi, SubmittedBatch};
use chemjobs_core::types::{AccountingKey, JobCategory, JobHandle, LifecycleStage, StateUpdate};
use chemjobs_watcher::{JobWatcher, RetryPolicy, WatcherConfig};

/// A watcher config with short intervals and a bounded retry budget.
pub fn test_config() -> WatcherConfig {
    WatcherConfig {
        min_submit_interval: Duration::from_millis(50),
        idle_wait: Duration::from_secs(1),
        poll_initial_interval: Duration::from_millis(10),
        poll_max_interval: Duration::from_millis(100),
        runtime_budget: Duration::from_secs(60),
        shutdown_grace: Duration::from_secs(1),
        cleanup_timeout: Duration::from_millis(500),
        retry: RetryPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts: Some(3),
        },
        ..Default::default()
    }
}

/// Start a watcher against `server` using [`test_config`].
pub fn start(server: &Arc<FakeJobServer>) -> JobWatcher {
    start_with(server, test_config())
}

pub fn start_with(server: &Arc<FakeJobServer>, config: WatcherConfig) -> JobWatcher {
    JobWatcher::new(server.clone(), config)
}

/// Let the background loops run for a while (time is paused in tests).
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}

/// One recorded `delete_jobs` call.
#[derive(Debug, Clone)]
pub struct DeleteCall {
    pub handles: Vec<JobHandle>,
    pub accounting_keys: HashMap<JobHandle, AccountingKey>,
}

/// In-memory job server recording every call made against it.
#[derive(Default)]
pub struct FakeJobServer {
    state: Mutex<ServerState>,
}

#[derive(Default)]
struct ServerState {
    next_id: u64,
    jobs: BTreeMap<JobHandle, StateUpdate>,
    submit_calls: Vec<JobBatch>,
    poll_calls: usize,
    delete_calls: Vec<DeleteCall>,
    reset_calls: Vec<Vec<JobHandle>>,
    submit_failures: VecDeque<ApiError>,
    submit_delay: Duration,
    delete_delay: Duration,
}

impl FakeJobServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ---- scripting ----

    pub fn set_stage(&self, handle: JobHandle, stage: LifecycleStage) {
        let mut state = self.state.lock().unwrap();
        let job = state.jobs.get_mut(&handle).expect("unknown job");
        job.stage = stage;
    }

    pub fn finish(&self, handle: JobHandle, output: Value) {
        let mut state = self.state.lock().unwrap();
        let job = state.jobs.get_mut(&handle).expect("unknown job");
        job.stage = LifecycleStage::Done;
        job.output = Some(output);
    }

    pub fn crash(&self, handle: JobHandle, message: &str) {
        let mut state = self.state.lock().unwrap();
        let job = state.jobs.get_mut(&handle).expect("unknown job");
        job.stage = LifecycleStage::Crashed;
        job.error_message = Some(message.to_string());
    }

    /// Create a job this client never submitted.
    pub fn add_orphan(&self, category: JobCategory, stage: LifecycleStage) -> JobHandle {
        let mut state = self.state.lock().unwrap();
        let handle = state.allocate(category);
        state.jobs.insert(handle, StateUpdate::new(handle, stage));
        handle
    }

    /// Make the next submit calls fail with `error`, in order.
    pub fn fail_next_submits(&self, count: usize, error: ApiError) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            state.submit_failures.push_back(error.clone());
        }
    }

    /// Delay every submit call after the jobs were created server-side.
    pub fn set_submit_delay(&self, delay: Duration) {
        self.state.lock().unwrap().submit_delay = delay;
    }

    /// Delay every delete call before it takes effect.
    pub fn set_delete_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delete_delay = delay;
    }

    // ---- inspection ----

    pub fn submit_calls(&self) -> Vec<JobBatch> {
        self.state.lock().unwrap().submit_calls.clone()
    }

    pub fn poll_count(&self) -> usize {
        self.state.lock().unwrap().poll_calls
    }

    pub fn delete_calls(&self) -> Vec<DeleteCall> {
        self.state.lock().unwrap().delete_calls.clone()
    }

    pub fn reset_calls(&self) -> Vec<Vec<JobHandle>> {
        self.state.lock().unwrap().reset_calls.clone()
    }

    /// Number of delete calls that named `handle`.
    pub fn times_deleted(&self, handle: JobHandle) -> usize {
        self.delete_calls()
            .iter()
            .filter(|call| call.handles.contains(&handle))
            .count()
    }

    pub fn contains(&self, handle: JobHandle) -> bool {
        self.state.lock().unwrap().jobs.contains_key(&handle)
    }
}

impl ServerState {
    fn allocate(&mut self, category: JobCategory) -> JobHandle {
        self.next_id += 1;
        JobHandle::new(category, self.next_id)
    }
}

#[async_trait]
impl RemoteJobApi for FakeJobServer {
    async fn submit_batch(&self, batch: &JobBatch) -> Result<SubmittedBatch, ApiError> {
        let (submitted, delay) = {
            let mut state = self.state.lock().unwrap();
            state.submit_calls.push(batch.clone());
            if let Some(error) = state.submit_failures.pop_front() {
                return Err(error);
            }

            let mut submitted = SubmittedBatch::new();
            for (category, inputs) in batch.iter() {
                let handles: Vec<JobHandle> = inputs
                    .iter()
                    .map(|_| {
                        let handle = state.allocate(category);
                        state
                            .jobs
                            .insert(handle, StateUpdate::new(handle, LifecycleStage::Submitted));
                        handle
                    })
                    .collect();
                submitted.insert(category, handles);
            }
            (submitted, state.submit_delay)
        };

        // Jobs already exist server-side while the response is in flight.
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(submitted)
    }

    async fn poll_jobs(
        &self,
        categories: &[JobCategory],
        stages: &[LifecycleStage],
    ) -> Result<Vec<StateUpdate>, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.poll_calls += 1;
        Ok(state
            .jobs
            .values()
            .filter(|job| categories.contains(&job.handle.category) && stages.contains(&job.stage))
            .cloned()
            .collect())
    }

    async fn delete_jobs(
        &self,
        handles: &[JobHandle],
        accounting_keys: &HashMap<JobHandle, AccountingKey>,
    ) -> Result<(), ApiError> {
        let delay = self.state.lock().unwrap().delete_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        for handle in handles {
            state.jobs.remove(handle);
        }
        state.delete_calls.push(DeleteCall {
            handles: handles.to_vec(),
            accounting_keys: accounting_keys.clone(),
        });
        Ok(())
    }

    async fn reset_jobs(&self, handles: &[JobHandle]) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        for handle in handles {
            if let Some(job) = state.jobs.get_mut(handle) {
                job.stage = LifecycleStage::Submitted;
            }
        }
        state.reset_calls.push(handles.to_vec());
        Ok(())
    }
}
