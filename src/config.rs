//! TOML configuration for runledger.
//!
//! Loading order: an explicit `--config` path, then the `RUNLEDGER_CONFIG`
//! environment variable, then `./runledger.toml`, then compiled-in defaults.
//! Command-line flags are applied on top by the binary.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::notify::transport::HttpTransport;
use crate::notify::{BusinessHours, NotificationPolicy};
use crate::storage::{Credentials, RetryPolicy};

pub const CONFIG_ENV_VAR: &str = "RUNLEDGER_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "runledger.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReporterConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub run: RunConfig,
}

impl ReporterConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded runledger configuration");
        Ok(config)
    }

    /// Resolve the configuration. An explicit path must load; the other
    /// sources fall through on error.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "RUNLEDGER_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local_path = Path::new(DEFAULT_CONFIG_FILE);
        if local_path.exists() {
            match Self::load(local_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local_path.display(),
                        error = %e,
                        "config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Fill unset values from the process environment.
    pub fn apply_env(&mut self) {
        if self.notify.build_url.is_none() {
            self.notify.build_url = std::env::var("BUILD_URL").ok().filter(|u| !u.is_empty());
        }
    }

    /// Who started the run: config, then `USER`/`USERNAME`.
    pub fn initiator(&self) -> String {
        self.run
            .initiator
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEnvironment {
    #[default]
    Test,
    Qa,
    Prod,
}

impl std::fmt::Display for DatabaseEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Test => write!(f, "test"),
            Self::Qa => write!(f, "qa"),
            Self::Prod => write!(f, "prod"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Which credential set to use.
    pub environment: DatabaseEnvironment,
    pub connect_attempts: u32,
    pub connect_backoff_sec: u64,
    pub test: Credentials,
    pub qa: Credentials,
    pub prod: Credentials,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let local = |schema: &str| Credentials::new("data", "runledger", "", schema);
        Self {
            environment: DatabaseEnvironment::Test,
            connect_attempts: 3,
            connect_backoff_sec: 10,
            test: local("runledger_test"),
            qa: local("runledger_qa"),
            prod: local("runledger_prod"),
        }
    }
}

impl DatabaseConfig {
    pub fn credentials(&self) -> &Credentials {
        match self.environment {
            DatabaseEnvironment::Test => &self.test,
            DatabaseEnvironment::Qa => &self.qa,
            DatabaseEnvironment::Prod => &self.prod,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.connect_attempts,
            backoff: Duration::from_secs(self.connect_backoff_sec),
        }
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    /// Room or channel the run summary goes to.
    pub recipient: Option<String>,
    /// Mentioned on failures during business hours.
    pub owner_to_mention: Option<String>,
    pub notify_on_success: bool,
    /// Link appended to failure messages. Falls back to `BUILD_URL`.
    pub build_url: Option<String>,
    pub business_hours: BusinessHours,
    pub transport: TransportConfig,
}

impl NotifyConfig {
    /// The notification policy, or `None` when notifications are disabled.
    pub fn policy(&self) -> Result<Option<NotificationPolicy>> {
        if !self.enabled {
            return Ok(None);
        }
        let recipient = self
            .recipient
            .clone()
            .filter(|r| !r.is_empty())
            .context("a notification recipient must be set when notifications are enabled")?;

        Ok(Some(NotificationPolicy {
            recipient,
            owner_to_mention: self.owner_to_mention.clone().filter(|o| !o.is_empty()),
            notify_on_success: self.notify_on_success,
            build_url: self.build_url.clone(),
            business_hours: self.business_hours.clone(),
        }))
    }

    pub fn http_transport(&self) -> Result<HttpTransport> {
        let url = self
            .transport
            .url
            .clone()
            .context("notify.transport.url must be set when notifications are enabled")?;
        HttpTransport::new(url, self.transport.auth_token.clone(), self.transport.sender.clone())
            .context("failed to build notification HTTP client")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub url: Option<String>,
    pub auth_token: Option<String>,
    /// Display name of the sender.
    pub sender: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: None,
            auth_token: None,
            sender: "runledger".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging / run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub initiator: Option<String>,
}
