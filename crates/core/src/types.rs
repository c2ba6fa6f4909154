//! Core identifiers and lifecycle types for remote jobs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifier the server assigns to a job within its category.
pub type ServerJobId = u64;

// ---------------------------------------------------------------------------
// JobCategory
// ---------------------------------------------------------------------------

/// The kind of remote computation a job belongs to.
///
/// Each category is backed by its own server-side queue, so polling and
/// deletion are always scoped by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobCategory {
    /// Molecular fingerprint prediction.
    Fingerprint,
    /// Compound-class prediction from a predicted fingerprint.
    CompoundClass,
    /// Covariance-tree (Bayesian network) estimation for a formula.
    CovarianceTree,
    /// De-novo structure candidate generation.
    StructureGeneration,
}

impl JobCategory {
    /// Every category, in wire order.
    pub const ALL: [JobCategory; 4] = [
        JobCategory::Fingerprint,
        JobCategory::CompoundClass,
        JobCategory::CovarianceTree,
        JobCategory::StructureGeneration,
    ];

    /// Wire name used in URLs and JSON bodies.
    pub fn as_str(self) -> &'static str {
        match self {
            JobCategory::Fingerprint => "FINGERPRINT",
            JobCategory::CompoundClass => "COMPOUND_CLASS",
            JobCategory::CovarianceTree => "COVARIANCE_TREE",
            JobCategory::StructureGeneration => "STRUCTURE_GENERATION",
        }
    }
}

impl fmt::Display for JobCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobCategory {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobCategory::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CoreError::Validation(format!("Unknown job category '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// JobHandle
// ---------------------------------------------------------------------------

/// Server-assigned, globally unique key of a submitted job.
///
/// Only the remote job API produces handles; the watcher never invents
/// one locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobHandle {
    pub category: JobCategory,
    pub id: ServerJobId,
}

impl JobHandle {
    pub fn new(category: JobCategory, id: ServerJobId) -> Self {
        Self { category, id }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.id)
    }
}

// ---------------------------------------------------------------------------
// LifecycleStage
// ---------------------------------------------------------------------------

/// Remote lifecycle of a job. The declaration order is the lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStage {
    /// Queued on the server, not yet claimed.
    Submitted,
    /// Claimed by a remote worker but not finished.
    Fetched,
    /// Finished successfully; output is available.
    Done,
    /// The remote worker failed.
    Crashed,
    /// Canceled on the server side.
    Canceled,
}

impl LifecycleStage {
    pub const ALL: [LifecycleStage; 5] = [
        LifecycleStage::Submitted,
        LifecycleStage::Fetched,
        LifecycleStage::Done,
        LifecycleStage::Crashed,
        LifecycleStage::Canceled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LifecycleStage::Done | LifecycleStage::Crashed | LifecycleStage::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleStage::Submitted => "SUBMITTED",
            LifecycleStage::Fetched => "FETCHED",
            LifecycleStage::Done => "DONE",
            LifecycleStage::Crashed => "CRASHED",
            LifecycleStage::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads and snapshots
// ---------------------------------------------------------------------------

/// Caller-supplied job payload. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInput {
    category: JobCategory,
    payload: serde_json::Value,
}

impl JobInput {
    pub fn new(category: JobCategory, payload: serde_json::Value) -> Self {
        Self { category, payload }
    }

    pub fn category(&self) -> JobCategory {
        self.category
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

/// Opaque value the server uses to bill and deduplicate usage when a job
/// is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountingKey(pub i32);

/// Snapshot of one job as reported by a poll call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    pub handle: JobHandle,
    pub stage: LifecycleStage,
    /// Raw result payload, present once the job is `Done`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Server-side failure description for `Crashed` jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StateUpdate {
    pub fn new(handle: JobHandle, stage: LifecycleStage) -> Self {
        Self {
            handle,
            stage,
            output: None,
            error_message: None,
        }
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_ordered_by_lifecycle() {
        assert!(LifecycleStage::Submitted < LifecycleStage::Fetched);
        assert!(LifecycleStage::Fetched < LifecycleStage::Done);
        assert!(LifecycleStage::Fetched < LifecycleStage::Crashed);
        assert!(LifecycleStage::Fetched < LifecycleStage::Canceled);
    }

    #[test]
    fn only_finished_stages_are_terminal() {
        let terminal: Vec<_> = LifecycleStage::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                LifecycleStage::Done,
                LifecycleStage::Crashed,
                LifecycleStage::Canceled
            ]
        );
    }

    #[test]
    fn category_parses_wire_names_case_insensitively() {
        assert_eq!(
            "compound_class".parse::<JobCategory>().unwrap(),
            JobCategory::CompoundClass
        );
        assert_eq!(
            " FINGERPRINT ".parse::<JobCategory>().unwrap(),
            JobCategory::Fingerprint
        );
        assert!("spectrum".parse::<JobCategory>().is_err());
    }

    #[test]
    fn handle_display_includes_category() {
        let handle = JobHandle::new(JobCategory::CovarianceTree, 42);
        assert_eq!(handle.to_string(), "COVARIANCE_TREE/42");
    }

    #[test]
    fn state_update_uses_camel_case_on_the_wire() {
        let update = StateUpdate::new(JobHandle::new(JobCategory::Fingerprint, 7), LifecycleStage::Crashed)
            .with_error("out of memory");
        let json = serde_json::to_value(&update).unwrap();

        assert_eq!(json["stage"], "CRASHED");
        assert_eq!(json["handle"]["category"], "FINGERPRINT");
        assert_eq!(json["errorMessage"], "out of memory");
        assert!(json.get("output").is_none());
    }
}
