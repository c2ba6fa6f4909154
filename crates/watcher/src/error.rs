use chemjobs_core::api::ApiError;

/// Failure of a remote call made by one of the background loops.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The server answered with a permanent error.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// A transient error persisted past the retry budget.
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ApiError },

    /// The watcher is shutting down.
    #[error("Interrupted by shutdown")]
    Interrupted,
}

/// Why a submission never produced a tracked job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("Job submission rejected: {0}")]
    Rejected(String),

    #[error("Job watcher is shut down")]
    ShutDown,

    #[error("Submission was canceled before it reached the server")]
    Canceled,
}

/// Why a tracked job finished without a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("Remote job crashed: {0}")]
    Crashed(String),

    #[error("Job was canceled on the server")]
    CanceledRemotely,

    #[error("Job was canceled")]
    Canceled,

    #[error("Remote worker stopped responding; gave up after {resets} resets")]
    StuckWorker { resets: u32 },

    #[error("Could not decode job output: {0}")]
    Decode(String),

    #[error("Job watcher shut down before the job finished")]
    ShutDown,
}
