//! Diagnostic client for a remote job server.
//!
//! Reads a JSON array of jobs, submits them through a [`JobWatcher`] and
//! prints one line per job once all of them finished:
//!
//! ```text
//! chemjobs-probe jobs.json
//! ```
//!
//! Each entry looks like
//! `{"category": "FINGERPRINT", "payload": {...}, "accountingKey": 7}`.

use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chemjobs_client::api::HttpJobApi;
use chemjobs_client::config::ClientConfig;
use chemjobs_core::types::{AccountingKey, JobCategory, JobInput};
use chemjobs_watcher::{JobWatcher, WatcherConfig};

/// One entry of the jobs file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobEntry {
    category: JobCategory,
    payload: serde_json::Value,
    #[serde(default)]
    accounting_key: Option<AccountingKey>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chemjobs_watcher=debug,chemjobs_probe=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = std::env::args()
        .nth(1)
        .context("usage: chemjobs-probe <jobs.json>")?;
    let jobs = load_jobs(&path)?;

    let client_config = ClientConfig::from_env();
    let api = Arc::new(HttpJobApi::new(&client_config).context("Failed to create job server client")?);
    tracing::info!(
        api_url = %client_config.api_url,
        client_id = api.client_id(),
        jobs = jobs.len(),
        "Probe starting",
    );

    let watcher = JobWatcher::new(api.clone(), WatcherConfig::from_env());

    tokio::select! {
        () = run_jobs(&watcher, jobs) => {}
        () = shutdown_signal() => {
            tracing::info!("Received Ctrl-C, abandoning remaining jobs");
        }
    }

    watcher.shutdown().await;

    // Catch anything submitted but never registered (e.g. an interrupted batch).
    if let Err(e) = api.delete_all_jobs().await {
        tracing::warn!(error = %e, "Final cleanup of server jobs failed");
    }

    tracing::info!("Probe finished");
    Ok(())
}

fn load_jobs(path: &str) -> anyhow::Result<Vec<JobEntry>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {path}"))
}

/// Submit every job, then report each outcome in file order.
async fn run_jobs(watcher: &JobWatcher, jobs: Vec<JobEntry>) {
    let mut pending = Vec::with_capacity(jobs.len());
    for (index, entry) in jobs.into_iter().enumerate() {
        let input = JobInput::new(entry.category, entry.payload);
        match watcher.submit_and_watch(input, entry.accounting_key) {
            Ok(submission) => pending.push((index, submission)),
            Err(e) => println!("{index}\t-\tnot submitted: {e}"),
        }
    }

    for (index, submission) in pending {
        let job = match submission.await {
            Ok(job) => job,
            Err(e) => {
                println!("{index}\t-\tnot submitted: {e}");
                continue;
            }
        };

        let line = match job.wait().await {
            Ok(output) => serde_json::to_string(&output)
                .unwrap_or_else(|e| format!("<unprintable output: {e}>")),
            Err(e) => format!("failed: {e}"),
        };
        println!("{index}\t{}\t{line}", job.handle());
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
}
