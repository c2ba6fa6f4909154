use std::collections::HashMap;
use std::time::Duration;

use chemjobs_core::types::JobCategory;

use crate::retry::RetryPolicy;

/// Tuning knobs for the submission batcher and status poller.
///
/// All fields have defaults suitable for a desktop client talking to a
/// shared job server. Override via [`WatcherConfig::from_env`] or by
/// struct update syntax in tests.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Minimum time between two submission calls (default: 50ms).
    pub min_submit_interval: Duration,
    /// Upper bound on an idle wait for new work (default: 10s).
    pub idle_wait: Duration,
    /// Poll interval right after jobs finished (default: 50ms).
    pub poll_initial_interval: Duration,
    /// Cap for the backed-off poll interval (default: 1s).
    pub poll_max_interval: Duration,
    /// Growth factor of the poll interval while nothing finishes.
    pub poll_backoff_multiplier: f64,
    /// Empty poll iterations tolerated before the interval starts growing.
    pub stay_at_initial: u32,
    /// Expected worst-case runtime of a claimed job (default: 5min).
    pub runtime_budget: Duration,
    /// Per-category overrides of [`runtime_budget`](Self::runtime_budget).
    pub runtime_budgets: HashMap<JobCategory, Duration>,
    /// How often a stuck job is handed back to the server before it is
    /// failed (default: 3).
    pub max_resets: u32,
    /// Time each loop gets to exit on shutdown (default: 5s).
    pub shutdown_grace: Duration,
    /// Time budget of the best-effort remote cleanup on shutdown
    /// (default: 4s).
    pub cleanup_timeout: Duration,
    /// Backoff policy for every remote call made by the loops.
    pub retry: RetryPolicy,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            min_submit_interval: Duration::from_millis(50),
            idle_wait: Duration::from_secs(10),
            poll_initial_interval: Duration::from_millis(50),
            poll_max_interval: Duration::from_secs(1),
            poll_backoff_multiplier: 2.0,
            stay_at_initial: 3,
            runtime_budget: Duration::from_secs(300),
            runtime_budgets: HashMap::new(),
            max_resets: 3,
            shutdown_grace: Duration::from_secs(5),
            cleanup_timeout: Duration::from_millis(4000),
            retry: RetryPolicy::default(),
        }
    }
}

impl WatcherConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                            | Default |
    /// |------------------------------------|---------|
    /// | `CHEMJOBS_MIN_SUBMIT_INTERVAL_MS`  | `50`    |
    /// | `CHEMJOBS_IDLE_WAIT_SECS`          | `10`    |
    /// | `CHEMJOBS_POLL_INITIAL_MS`         | `50`    |
    /// | `CHEMJOBS_POLL_MAX_MS`             | `1000`  |
    /// | `CHEMJOBS_RUNTIME_BUDGET_SECS`     | `300`   |
    /// | `CHEMJOBS_MAX_RESETS`              | `3`     |
    /// | `CHEMJOBS_CLEANUP_TIMEOUT_MS`      | `4000`  |
    ///
    /// A per-category budget can be set with
    /// `CHEMJOBS_RUNTIME_BUDGET_<CATEGORY>_SECS`, e.g.
    /// `CHEMJOBS_RUNTIME_BUDGET_COVARIANCE_TREE_SECS=1800`.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let runtime_budgets = JobCategory::ALL
            .into_iter()
            .filter_map(|category| {
                let var = format!("CHEMJOBS_RUNTIME_BUDGET_{}_SECS", category.as_str());
                env_parse::<u64>(&var).map(|secs| (category, Duration::from_secs(secs)))
            })
            .collect();

        Self {
            min_submit_interval: env_millis("CHEMJOBS_MIN_SUBMIT_INTERVAL_MS")
                .unwrap_or(defaults.min_submit_interval),
            idle_wait: env_parse::<u64>("CHEMJOBS_IDLE_WAIT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_wait),
            poll_initial_interval: env_millis("CHEMJOBS_POLL_INITIAL_MS")
                .unwrap_or(defaults.poll_initial_interval),
            poll_max_interval: env_millis("CHEMJOBS_POLL_MAX_MS")
                .unwrap_or(defaults.poll_max_interval),
            runtime_budget: env_parse::<u64>("CHEMJOBS_RUNTIME_BUDGET_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.runtime_budget),
            runtime_budgets,
            max_resets: env_parse("CHEMJOBS_MAX_RESETS").unwrap_or(defaults.max_resets),
            cleanup_timeout: env_millis("CHEMJOBS_CLEANUP_TIMEOUT_MS")
                .unwrap_or(defaults.cleanup_timeout),
            ..defaults
        }
    }

    /// Runtime budget that applies to jobs of `category`.
    pub fn runtime_budget_for(&self, category: JobCategory) -> Duration {
        self.runtime_budgets
            .get(&category)
            .copied()
            .unwrap_or(self.runtime_budget)
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

/// Read and parse an env var. Unset yields `None`; an unparseable value
/// is logged and also yields `None` so the default applies.
fn env_parse<T>(name: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(var = name, value = %raw, error = %e, "Ignoring invalid watcher setting");
            None
        }
    }
}
