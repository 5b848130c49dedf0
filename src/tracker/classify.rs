//! Raw outcome signals and their mapping onto the canonical outcomes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::Outcome;

/// Delimiter the harness inserts before captured log output.
pub const CAPTURED_LOGGING_MARKER: &str =
    "-------------------- >> begin captured logging << --------------------";

/// Non-pass signal reported by the harness for a finished test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Blocked,
    Deprecated,
    Skip,
    Error,
    AssertionFailure,
}

impl Signal {
    /// Map an exception/error type name (optionally path-qualified) to a signal.
    /// Anything unrecognised is a generic error.
    pub fn from_error_type(name: &str) -> Self {
        let short = name
            .rsplit(|c: char| c == '.' || c == ':')
            .next()
            .unwrap_or(name)
            .trim();
        match short {
            "BlockedTest" => Signal::Blocked,
            "DeprecatedTest" => Signal::Deprecated,
            "SkipTest" | "Skipped" => Signal::Skip,
            "AssertionError" | "AssertionFailure" => Signal::AssertionFailure,
            _ => Signal::Error,
        }
    }
}

// First match wins.
const PRECEDENCE: [(Signal, Outcome); 5] = [
    (Signal::Blocked, Outcome::Blocked),
    (Signal::Deprecated, Outcome::Deprecated),
    (Signal::Skip, Outcome::Skip),
    (Signal::Error, Outcome::Error),
    (Signal::AssertionFailure, Outcome::Failure),
];

/// What the harness observed when a test finished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOutcome {
    #[serde(default)]
    pub signals: BTreeSet<Signal>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl RawOutcome {
    pub fn pass() -> Self {
        Self::default()
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self::signalled(Signal::AssertionFailure, detail)
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self::signalled(Signal::Error, detail)
    }

    pub fn signalled(signal: Signal, detail: impl Into<String>) -> Self {
        Self {
            signals: BTreeSet::from([signal]),
            detail: Some(detail.into()),
        }
    }

    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signals.insert(signal);
        self
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

/// Classify a raw outcome. Blocked, deprecated and skip signals take
/// precedence over generic errors, which take precedence over assertion
/// failures; no signal at all is a pass.
pub fn classify(raw: &RawOutcome) -> Outcome {
    PRECEDENCE
        .iter()
        .find(|(signal, _)| raw.signals.contains(signal))
        .map(|(_, outcome)| *outcome)
        .unwrap_or(Outcome::Pass)
}

/// Drop everything from the captured logging marker onward.
pub fn truncate_message(detail: &str) -> &str {
    match detail.find(CAPTURED_LOGGING_MARKER) {
        Some(idx) => &detail[..idx],
        None => detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_signal_is_pass() {
        assert_eq!(classify(&RawOutcome::pass()), Outcome::Pass);
    }

    #[test]
    fn test_single_signals() {
        assert_eq!(classify(&RawOutcome::failure("assert 1 == 2")), Outcome::Failure);
        assert_eq!(classify(&RawOutcome::error("KeyError")), Outcome::Error);
        assert_eq!(classify(&RawOutcome::signalled(Signal::Blocked, "db down")), Outcome::Blocked);
        assert_eq!(
            classify(&RawOutcome::signalled(Signal::Deprecated, "old flow")),
            Outcome::Deprecated
        );
        assert_eq!(classify(&RawOutcome::signalled(Signal::Skip, "n/a")), Outcome::Skip);
    }

    #[test]
    fn test_blocked_beats_generic_error() {
        let raw = RawOutcome::error("env broken").with_signal(Signal::Blocked);
        assert_eq!(classify(&raw), Outcome::Blocked);
    }

    #[test]
    fn test_precedence_order() {
        let raw = RawOutcome::failure("x")
            .with_signal(Signal::Error)
            .with_signal(Signal::Skip)
            .with_signal(Signal::Deprecated);
        assert_eq!(classify(&raw), Outcome::Deprecated);

        let raw = RawOutcome::failure("x").with_signal(Signal::Error);
        assert_eq!(classify(&raw), Outcome::Error);
    }

    #[test]
    fn test_truncates_at_captured_logging() {
        let detail = "assert 1==2\n-------------------- >> begin captured logging << --------------------\nLOTS OF LOG";
        assert_eq!(truncate_message(detail), "assert 1==2\n");
    }

    #[test]
    fn test_truncate_keeps_text_without_marker() {
        assert_eq!(truncate_message("plain failure"), "plain failure");
        assert_eq!(truncate_message(""), "");
    }

    #[test]
    fn test_truncates_at_first_marker() {
        let detail = format!("head{m}middle{m}tail", m = CAPTURED_LOGGING_MARKER);
        assert_eq!(truncate_message(&detail), "head");
    }

    #[test]
    fn test_signal_from_error_type() {
        assert_eq!(Signal::from_error_type("BlockedTest"), Signal::Blocked);
        assert_eq!(
            Signal::from_error_type("suite.errors.DeprecatedTest"),
            Signal::Deprecated
        );
        assert_eq!(Signal::from_error_type("unittest::SkipTest"), Signal::Skip);
        assert_eq!(Signal::from_error_type("AssertionError"), Signal::AssertionFailure);
        assert_eq!(Signal::from_error_type("ValueError"), Signal::Error);
    }

    #[test]
    fn test_raw_outcome_deserializes_with_defaults() {
        let raw: RawOutcome = serde_json::from_str(r#"{"signals":["blocked","error"]}"#).unwrap();
        assert!(raw.detail.is_none());
        assert_eq!(classify(&raw), Outcome::Blocked);
    }
}
