//! Client-side coordinator for long-running remote compute jobs.
//!
//! Two cooperating background loops do the work:
//!
//! - the **submission batcher** ([`submitter`]) turns queued submissions
//!   into as few `submit_batch` calls as possible, and
//! - the **status poller** ([`poller`]) keeps every [`TrackedJob`]
//!   current, resets jobs whose worker died, and deletes finished or
//!   orphaned jobs on the server.
//!
//! [`JobWatcher`] owns both loops and is the only type most callers need.

pub mod config;
pub mod error;
pub mod poller;
pub mod retry;
pub mod submitter;
pub mod tracked;
pub mod watcher;

pub use config::WatcherConfig;
pub use error::{JobError, SubmitError, WatchError};
pub use retry::RetryPolicy;
pub use submitter::PendingSubmission;
pub use tracked::{JobResult, TrackedJob};
pub use watcher::JobWatcher;
