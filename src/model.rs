//! Execution and test case records, and the canonical state taxonomy.

use std::str::FromStr;

use chrono::Utc;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Environment label used when a test does not declare one.
pub const NOT_APPLICABLE: &str = "N/A";

/// Wall-clock epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Canonical test case state. `NotRun` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    NotRun,
    Pass,
    Failure,
    Error,
    Blocked,
    Skip,
    Deprecated,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::NotRun => "NOT_RUN",
            State::Pass => "PASS",
            State::Failure => "FAILURE",
            State::Error => "ERROR",
            State::Blocked => "BLOCKED",
            State::Skip => "SKIP",
            State::Deprecated => "DEPRECATED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, State::NotRun)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown test case state '{0}'")]
pub struct UnknownState(pub String);

impl FromStr for State {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_RUN" => Ok(State::NotRun),
            "PASS" => Ok(State::Pass),
            "FAILURE" => Ok(State::Failure),
            "ERROR" => Ok(State::Error),
            "BLOCKED" => Ok(State::Blocked),
            "SKIP" => Ok(State::Skip),
            "DEPRECATED" => Ok(State::Deprecated),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

impl ToSql for State {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for State {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Terminal classification of a finished test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Failure,
    Error,
    Blocked,
    Deprecated,
    Skip,
}

impl Outcome {
    /// Blocked, deprecated and skipped cases stop the current test without
    /// counting against the run.
    pub fn is_skip_class(&self) -> bool {
        matches!(self, Outcome::Blocked | Outcome::Deprecated | Outcome::Skip)
    }
}

impl From<Outcome> for State {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Pass => State::Pass,
            Outcome::Failure => State::Failure,
            Outcome::Error => State::Error,
            Outcome::Blocked => State::Blocked,
            Outcome::Deprecated => State::Deprecated,
            Outcome::Skip => State::Skip,
        }
    }
}

/// One test-run invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPayload {
    pub execution_id: Uuid,
    pub start_time_millis: i64,
    pub runtime_millis: Option<i64>,
    pub initiator: String,
}

impl ExecutionPayload {
    /// A fresh execution starting now.
    pub fn begin(initiator: impl Into<String>) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            start_time_millis: now_millis(),
            runtime_millis: None,
            initiator: initiator.into(),
        }
    }
}

/// One test case's outcome record within an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCasePayload {
    pub test_case_id: Uuid,
    pub execution_id: Uuid,
    pub address: String,
    pub environment_label: String,
    pub state: State,
    pub runtime_millis: Option<i64>,
    pub message: Option<String>,
}

impl TestCasePayload {
    /// A fresh, not yet run test case.
    pub fn begin(
        execution_id: Uuid,
        address: impl Into<String>,
        environment_label: impl Into<String>,
    ) -> Self {
        Self {
            test_case_id: Uuid::new_v4(),
            execution_id,
            address: address.into(),
            environment_label: environment_label.into(),
            state: State::NotRun,
            runtime_millis: None,
            message: None,
        }
    }
}

/// Capability for tests that run against a specific environment
/// (browser, agent, device).
pub trait HasEnvironmentLabel {
    fn environment_label(&self) -> Option<&str> {
        None
    }
}

/// What the tracker needs to know about a test when it starts.
pub trait TestDescriptor: HasEnvironmentLabel {
    /// Fully-qualified test identifier, e.g. `suite.module.Class.test_method`.
    fn address(&self) -> String;
}

/// Environment label of `test`, or [`NOT_APPLICABLE`].
pub fn environment_label_of<T: HasEnvironmentLabel + ?Sized>(test: &T) -> String {
    test.environment_label()
        .unwrap_or(NOT_APPLICABLE)
        .to_string()
}
