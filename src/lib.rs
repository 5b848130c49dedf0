//! runledger -- test-run lifecycle tracking and run-end notifications.
//!
//! This crate records each test execution and its test cases into a SQLite
//! store as they start and finish, classifies outcomes into a fixed state
//! taxonomy, and composes a single run-end notification.

pub mod config;
pub mod harness;
pub mod model;
pub mod notify;
pub mod storage;
pub mod tracker;

use anyhow::{Context, Result};

use crate::config::ReporterConfig;
use crate::harness::Reporter;
use crate::storage::{RunStore, SqliteConnector};
use crate::tracker::Tracker;

/// Open the run store selected by `config`.
pub fn open_store(config: &ReporterConfig) -> Result<RunStore> {
    let credentials = config.database.credentials().clone();
    let path = credentials.database_path();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory: {}", parent.display()))?;
    }
    tracing::debug!(environment = %config.database.environment, path = %path.display(), "opening run store");
    Ok(RunStore::new(
        SqliteConnector,
        credentials,
        config.database.retry_policy(),
    ))
}

/// Build a reporter wired to the configured store and notification sink.
pub fn reporter_from_config(config: &ReporterConfig) -> Result<Reporter> {
    let tracker = Tracker::new(open_store(config)?);
    let reporter = Reporter::new(tracker, config.initiator());

    match config.notify.policy()? {
        Some(policy) => {
            let transport = config.notify.http_transport()?;
            tracing::info!(recipient = %policy.recipient, "run-end notifications enabled");
            Ok(reporter.with_notifications(policy, Box::new(transport)))
        }
        None => Ok(reporter),
    }
}
