//! REST client for the remote job server.
//!
//! Implements [`RemoteJobApi`] over the server's `/api/jobs` endpoints
//! using [`reqwest`]. All jobs are scoped by a per-process client id so
//! that one client can never see or delete another client's jobs.

use std::collections::HashMap;

use async_trait::async_trait;
use chemjobs_core::api::{ApiError, JobBatch, RemoteJobApi, SubmittedBatch};
use chemjobs_core::types::{AccountingKey, JobCategory, JobHandle, LifecycleStage, StateUpdate};

use crate::config::ClientConfig;
use crate::wire::{self, JobRecord, ResetRequest, SubmitResponse};

/// HTTP client for a single job server.
#[derive(Debug)]
pub struct HttpJobApi {
    client: reqwest::Client,
    api_url: String,
    client_id: String,
}

/// Errors raised while constructing an [`HttpJobApi`].
#[derive(Debug, thiserror::Error)]
pub enum ClientBuildError {
    /// The underlying HTTP client could not be built (TLS backend, etc.).
    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    /// The configured base URL is unusable.
    #[error("Invalid job server URL '{0}'")]
    InvalidUrl(String),
}

impl HttpJobApi {
    /// Create a client from configuration with a fresh client id.
    pub fn new(config: &ClientConfig) -> Result<Self, ClientBuildError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Self::with_client(client, config.api_url.clone())
    }

    /// Create a client reusing an existing [`reqwest::Client`]
    /// (useful for sharing a connection pool with other services).
    pub fn with_client(client: reqwest::Client, api_url: String) -> Result<Self, ClientBuildError> {
        if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
            return Err(ClientBuildError::InvalidUrl(api_url));
        }
        let client_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(api_url = %api_url, client_id = %client_id, "Job server client created");
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            client_id,
        })
    }

    /// Identifier scoping all jobs of this client on the server.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Delete every job this client owns on the server, tracked or not.
    ///
    /// Sends a `DELETE /api/jobs/{client_id}/all` request.
    pub async fn delete_all_jobs(&self) -> Result<(), ApiError> {
        let response = self
            .client
            .delete(format!("{}/all", self.jobs_url()))
            .send()
            .await
            .map_err(transport)?;

        Self::check_status(response).await
    }

    // ---- private helpers ----

    fn jobs_url(&self) -> String {
        format!("{}/api/jobs/{}", self.api_url, self.client_id)
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or an [`ApiError::Server`]
    /// containing the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::Server {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Protocol(e.to_string()))
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteJobApi for HttpJobApi {
    /// Sends a `POST /api/jobs/{client_id}` request. A 4xx answer other
    /// than `429` means the server refused the inputs and is reported as
    /// [`ApiError::Rejected`].
    async fn submit_batch(&self, batch: &JobBatch) -> Result<SubmittedBatch, ApiError> {
        let response = self
            .client
            .post(self.jobs_url())
            .json(&wire::submit_request(batch))
            .send()
            .await
            .map_err(transport)?;

        let parsed: SubmitResponse = Self::parse_response(response)
            .await
            .map_err(|e| match e {
                ApiError::Server { status, body } if (400..500).contains(&status) && status != 429 => {
                    ApiError::Rejected(body)
                }
                other => other,
            })?;

        let assigned = wire::assigned_handles(&parsed);
        match wire::submitted_batch(batch, parsed) {
            Ok(submitted) => Ok(submitted),
            Err(e) => {
                // The server created these jobs; nobody will track them.
                tracing::error!(
                    error = %e,
                    assigned = ?assigned,
                    "Submit response does not match the batch, deleting assigned jobs",
                );
                if let Err(cleanup) = self.delete_jobs(&assigned, &HashMap::new()).await {
                    tracing::warn!(
                        error = %cleanup,
                        "Failed to delete jobs from a mismatched submit response",
                    );
                }
                Err(e)
            }
        }
    }

    async fn poll_jobs(
        &self,
        categories: &[JobCategory],
        stages: &[LifecycleStage],
    ) -> Result<Vec<StateUpdate>, ApiError> {
        let response = self
            .client
            .get(self.jobs_url())
            .query(&wire::poll_query(categories, stages))
            .send()
            .await
            .map_err(transport)?;

        let records: Vec<JobRecord> = Self::parse_response(response).await?;
        Ok(records.into_iter().map(StateUpdate::from).collect())
    }

    async fn delete_jobs(
        &self,
        handles: &[JobHandle],
        accounting_keys: &HashMap<JobHandle, AccountingKey>,
    ) -> Result<(), ApiError> {
        if handles.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .delete(self.jobs_url())
            .json(&wire::delete_request(handles, accounting_keys))
            .send()
            .await
            .map_err(transport)?;

        Self::check_status(response).await
    }

    async fn reset_jobs(&self, handles: &[JobHandle]) -> Result<(), ApiError> {
        if handles.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .patch(format!("{}/reset", self.jobs_url()))
            .json(&ResetRequest { jobs: handles })
            .send()
            .await
            .map_err(transport)?;

        Self::check_status(response).await
    }
}

fn transport(e: reqwest::Error) -> ApiError {
    ApiError::Transport(e.to_string())
}
