//! JSON bodies exchanged with the job server.
//!
//! Kept free of I/O so request shaping and response validation can be
//! tested without a server.

use std::collections::{BTreeMap, HashMap};

use chemjobs_core::api::{ApiError, JobBatch, SubmittedBatch};
use chemjobs_core::types::{
    AccountingKey, JobCategory, JobHandle, LifecycleStage, ServerJobId, StateUpdate,
};
use serde::{Deserialize, Serialize};

/// Body of `POST /api/jobs/{client_id}`.
#[derive(Debug, Serialize)]
pub struct SubmitRequest<'a> {
    pub jobs: BTreeMap<JobCategory, Vec<&'a serde_json::Value>>,
}

/// Response of `POST /api/jobs/{client_id}`.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub jobs: BTreeMap<JobCategory, Vec<AssignedJob>>,
}

/// A single server-assigned job id inside a [`SubmitResponse`].
#[derive(Debug, Deserialize)]
pub struct AssignedJob {
    pub id: ServerJobId,
}

/// One entry of the `GET /api/jobs/{client_id}` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub category: JobCategory,
    pub id: ServerJobId,
    pub stage: LifecycleStage,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl From<JobRecord> for StateUpdate {
    fn from(record: JobRecord) -> Self {
        StateUpdate {
            handle: JobHandle::new(record.category, record.id),
            stage: record.stage,
            output: record.output,
            error_message: record.error_message,
        }
    }
}

/// Body of `DELETE /api/jobs/{client_id}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest<'a> {
    pub jobs: &'a [JobHandle],
    /// Keyed by the handle's display form (`CATEGORY/id`).
    pub accounting_keys: BTreeMap<String, AccountingKey>,
}

/// Body of `PATCH /api/jobs/{client_id}/reset`.
#[derive(Debug, Serialize)]
pub struct ResetRequest<'a> {
    pub jobs: &'a [JobHandle],
}

pub fn submit_request(batch: &JobBatch) -> SubmitRequest<'_> {
    let jobs = batch
        .iter()
        .map(|(category, inputs)| (category, inputs.iter().map(|i| i.payload()).collect()))
        .collect();
    SubmitRequest { jobs }
}

/// Convert a submit response into handles, checking that the server
/// assigned exactly one id per submitted input.
pub fn submitted_batch(
    batch: &JobBatch,
    mut response: SubmitResponse,
) -> Result<SubmittedBatch, ApiError> {
    let mut submitted = SubmittedBatch::new();
    for (category, inputs) in batch.iter() {
        let assigned = response.jobs.remove(&category).unwrap_or_default();
        if assigned.len() != inputs.len() {
            return Err(ApiError::Protocol(format!(
                "Server assigned {} ids for {} {category} inputs",
                assigned.len(),
                inputs.len(),
            )));
        }
        submitted.insert(
            category,
            assigned
                .into_iter()
                .map(|job| JobHandle::new(category, job.id))
                .collect(),
        );
    }
    if let Some(category) = response.jobs.keys().next() {
        return Err(ApiError::Protocol(format!(
            "Server returned ids for unsubmitted category {category}"
        )));
    }
    Ok(submitted)
}

/// Every handle named in a submit response, in category order.
pub fn assigned_handles(response: &SubmitResponse) -> Vec<JobHandle> {
    response
        .jobs
        .iter()
        .flat_map(|(category, assigned)| {
            assigned.iter().map(|job| JobHandle::new(*category, job.id))
        })
        .collect()
}

/// Query parameters for `GET /api/jobs/{client_id}`.
pub fn poll_query(
    categories: &[JobCategory],
    stages: &[LifecycleStage],
) -> [(&'static str, String); 2] {
    [
        ("categories", join(categories.iter().map(|c| c.as_str()))),
        ("stages", join(stages.iter().map(|s| s.as_str()))),
    ]
}

pub fn delete_request<'a>(
    handles: &'a [JobHandle],
    accounting_keys: &HashMap<JobHandle, AccountingKey>,
) -> DeleteRequest<'a> {
    let accounting_keys = handles
        .iter()
        .filter_map(|h| accounting_keys.get(h).map(|key| (h.to_string(), *key)))
        .collect();
    DeleteRequest {
        jobs: handles,
        accounting_keys,
    }
}

fn join<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts.collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chemjobs_core::types::JobInput;
    use serde_json::json;

    use super::*;

    fn two_category_batch() -> JobBatch {
        let mut batch = JobBatch::new();
        batch.push(JobInput::new(JobCategory::Fingerprint, json!({ "ms": 1 })));
        batch.push(JobInput::new(JobCategory::Fingerprint, json!({ "ms": 2 })));
        batch.push(JobInput::new(JobCategory::CovarianceTree, json!({ "formula": "C2H6O" })));
        batch
    }

    #[test]
    fn submit_request_groups_payloads_under_wire_names() {
        let batch = two_category_batch();
        let body = serde_json::to_value(submit_request(&batch)).unwrap();

        assert_eq!(body["jobs"]["FINGERPRINT"], json!([{ "ms": 1 }, { "ms": 2 }]));
        assert_eq!(body["jobs"]["COVARIANCE_TREE"], json!([{ "formula": "C2H6O" }]));
    }

    #[test]
    fn submitted_batch_keeps_input_order() {
        let batch = two_category_batch();
        let response: SubmitResponse = serde_json::from_value(json!({
            "jobs": {
                "FINGERPRINT": [{ "id": 10 }, { "id": 11 }],
                "COVARIANCE_TREE": [{ "id": 3 }],
            }
        }))
        .unwrap();

        let submitted = submitted_batch(&batch, response).unwrap();

        assert_eq!(
            submitted.handles(JobCategory::Fingerprint),
            &[
                JobHandle::new(JobCategory::Fingerprint, 10),
                JobHandle::new(JobCategory::Fingerprint, 11)
            ]
        );
        assert_eq!(submitted.len(), 3);
    }

    #[test]
    fn submitted_batch_rejects_count_mismatch() {
        let batch = two_category_batch();
        let response: SubmitResponse = serde_json::from_value(json!({
            "jobs": {
                "FINGERPRINT": [{ "id": 10 }],
                "COVARIANCE_TREE": [{ "id": 3 }],
            }
        }))
        .unwrap();

        assert_matches!(submitted_batch(&batch, response), Err(ApiError::Protocol(_)));
    }

    #[test]
    fn submitted_batch_rejects_unexpected_category() {
        let batch = two_category_batch();
        let response: SubmitResponse = serde_json::from_value(json!({
            "jobs": {
                "FINGERPRINT": [{ "id": 10 }, { "id": 11 }],
                "COVARIANCE_TREE": [{ "id": 3 }],
                "COMPOUND_CLASS": [{ "id": 4 }],
            }
        }))
        .unwrap();

        assert_matches!(submitted_batch(&batch, response), Err(ApiError::Protocol(msg)) if msg.contains("COMPOUND_CLASS"));
    }

    #[test]
    fn assigned_handles_covers_every_category() {
        let response: SubmitResponse = serde_json::from_value(json!({
            "jobs": {
                "FINGERPRINT": [{ "id": 4 }],
                "COVARIANCE_TREE": [{ "id": 9 }, { "id": 10 }]
            }
        }))
        .unwrap();

        assert_eq!(
            assigned_handles(&response),
            vec![
                JobHandle::new(JobCategory::Fingerprint, 4),
                JobHandle::new(JobCategory::CovarianceTree, 9),
                JobHandle::new(JobCategory::CovarianceTree, 10),
            ]
        );
    }

    #[test]
    fn poll_query_joins_wire_names() {
        let query = poll_query(
            &[JobCategory::Fingerprint, JobCategory::CompoundClass],
            &[LifecycleStage::Done, LifecycleStage::Crashed],
        );
        assert_eq!(query[0], ("categories", "FINGERPRINT,COMPOUND_CLASS".to_string()));
        assert_eq!(query[1], ("stages", "DONE,CRASHED".to_string()));
    }

    #[test]
    fn job_record_becomes_state_update() {
        let record: JobRecord = serde_json::from_value(json!({
            "category": "COMPOUND_CLASS",
            "id": 99,
            "stage": "CRASHED",
            "errorMessage": "worker lost",
        }))
        .unwrap();

        let update = StateUpdate::from(record);
        assert_eq!(update.handle, JobHandle::new(JobCategory::CompoundClass, 99));
        assert_eq!(update.stage, LifecycleStage::Crashed);
        assert_eq!(update.error_message.as_deref(), Some("worker lost"));
    }

    #[test]
    fn delete_request_only_carries_known_accounting_keys() {
        let handles = [
            JobHandle::new(JobCategory::Fingerprint, 1),
            JobHandle::new(JobCategory::Fingerprint, 2),
        ];
        let keys = HashMap::from([(handles[1], AccountingKey(-77))]);

        let body = serde_json::to_value(delete_request(&handles, &keys)).unwrap();

        assert_eq!(body["jobs"].as_array().unwrap().len(), 2);
        assert_eq!(body["accountingKeys"], json!({ "FINGERPRINT/2": -77 }));
    }
}
