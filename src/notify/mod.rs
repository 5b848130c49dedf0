//! Run-end notifications.
//!
//! Outcomes are collected into a [`RunSummary`] while the run is in flight.
//! At run end, [`NotificationPolicy`] turns the summary into at most one
//! [`NotificationRequest`]; sending it is the job of a
//! [`transport::NotificationTransport`].

pub mod transport;

use chrono::{DateTime, Datelike, FixedOffset, Local, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

const SUCCESS_HEADER: &str = "SUCCESS! The following tests ran successfully:\n+ ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Positive,
    Negative,
}

impl Severity {
    pub fn color(&self) -> &'static str {
        match self {
            Severity::Positive => "green",
            Severity::Negative => "red",
        }
    }
}

/// A composed message, ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub recipient: String,
    pub text: String,
    pub severity: Severity,
}

/// Labels collected during a run. No I/O.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub successes: Vec<String>,
    pub failures: Vec<String>,
    pub errors: Vec<String>,
}

impl RunSummary {
    pub fn record_success(&mut self, address: &str) {
        self.successes.push(address.to_string());
    }

    pub fn record_failure(&mut self, address: &str) {
        self.failures.push(format!("FAILED: {}", address));
    }

    pub fn record_error(&mut self, address: &str) {
        self.errors.push(format!("ERROR: {}", address));
    }

    /// No failures and no errors.
    pub fn was_successful(&self) -> bool {
        self.failures.is_empty() && self.errors.is_empty()
    }
}

/// Which clock the business-hours window is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBasis {
    /// The host's local timezone.
    #[default]
    Local,
    /// A fixed offset from UTC, see [`BusinessHours::utc_offset_minutes`].
    UtcOffset,
}

/// Monday to Friday, `start_hour..=end_hour`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusinessHours {
    pub start_hour: u32,
    /// Inclusive: with 18 the window closes at 18:59.
    pub end_hour: u32,
    pub time_basis: TimeBasis,
    pub utc_offset_minutes: i32,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            start_hour: 9,
            end_hour: 18,
            time_basis: TimeBasis::Local,
            utc_offset_minutes: 0,
        }
    }
}

impl BusinessHours {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let wall = self.wall_clock(now);
        wall.weekday().num_days_from_monday() <= 4
            && (self.start_hour..=self.end_hour).contains(&wall.hour())
    }

    fn wall_clock(&self, now: DateTime<Utc>) -> NaiveDateTime {
        match self.time_basis {
            TimeBasis::Local => now.with_timezone(&Local).naive_local(),
            TimeBasis::UtcOffset => match FixedOffset::east_opt(self.utc_offset_minutes * 60) {
                Some(offset) => now.with_timezone(&offset).naive_local(),
                None => {
                    warn!(offset_minutes = self.utc_offset_minutes, "invalid UTC offset, using UTC");
                    now.naive_utc()
                }
            },
        }
    }
}

/// Decides whether and what to send at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPolicy {
    pub recipient: String,
    pub owner_to_mention: Option<String>,
    pub notify_on_success: bool,
    pub build_url: Option<String>,
    pub business_hours: BusinessHours,
}

impl NotificationPolicy {
    pub fn new(recipient: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            owner_to_mention: None,
            notify_on_success: false,
            build_url: None,
            business_hours: BusinessHours::default(),
        }
    }

    /// Compose the run-end message for the current time.
    pub fn finalize(&self, successful: bool, summary: &RunSummary) -> Option<NotificationRequest> {
        self.compose(
            successful,
            &summary.successes,
            &summary.failures,
            &summary.errors,
            Utc::now(),
        )
    }

    /// Compose the run-end message, if any.
    ///
    /// A failed run lists failures, then errors, optionally preceded by an
    /// `@owner` mention (business hours only) and followed by the build URL.
    /// A successful run produces a message only when `notify_on_success` is
    /// set and something passed.
    pub fn compose(
        &self,
        successful: bool,
        successes: &[String],
        failures: &[String],
        errors: &[String],
        now: DateTime<Utc>,
    ) -> Option<NotificationRequest> {
        let (text, severity) = if !successful {
            let mut text = String::new();
            if let Some(owner) = &self.owner_to_mention {
                if self.business_hours.contains(now) {
                    text.push('@');
                    text.push_str(owner);
                    text.push('\n');
                }
            }
            let body: Vec<&str> = failures
                .iter()
                .chain(errors.iter())
                .map(String::as_str)
                .collect();
            text.push_str(&body.join("\n"));
            if let Some(url) = &self.build_url {
                text.push('\n');
                text.push_str(url);
            }
            (text, Severity::Negative)
        } else if self.notify_on_success && !successes.is_empty() {
            (
                format!("{}{}", SUCCESS_HEADER, successes.join("\n+ ")),
                Severity::Positive,
            )
        } else {
            return None;
        };

        if text.is_empty() {
            return None;
        }

        Some(NotificationRequest {
            recipient: self.recipient.clone(),
            text,
            severity,
        })
    }
}
