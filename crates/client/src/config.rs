use std::time::Duration;

/// Connection settings for the remote job server.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base HTTP URL of the job server (default: `http://localhost:8080`).
    pub api_url: String,
    /// Per-request timeout (default: 30 seconds).
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080".into(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                          | Default                 |
    /// |----------------------------------|-------------------------|
    /// | `CHEMJOBS_API_URL`               | `http://localhost:8080` |
    /// | `CHEMJOBS_REQUEST_TIMEOUT_SECS`  | `30`                    |
    ///
    /// Unparseable values fall back to the default with a warning.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let api_url = std::env::var("CHEMJOBS_API_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_url);

        let request_timeout = match std::env::var("CHEMJOBS_REQUEST_TIMEOUT_SECS") {
            Ok(raw) => match raw.parse::<u64>() {
                Ok(secs) => Duration::from_secs(secs),
                Err(e) => {
                    tracing::warn!(value = %raw, error = %e, "Invalid CHEMJOBS_REQUEST_TIMEOUT_SECS, using default");
                    defaults.request_timeout
                }
            },
            Err(_) => defaults.request_timeout,
        };

        Self {
            api_url,
            request_timeout,
        }
    }
}
