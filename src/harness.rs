//! Test harness adapter: the four lifecycle callbacks.
//!
//! A [`Reporter`] forwards each callback to the [`Tracker`] for persistence
//! and keeps the [`RunSummary`] that feeds the run-end notification.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::{Outcome, NOT_APPLICABLE};
use crate::notify::transport::{deliver, NotificationTransport};
use crate::notify::{NotificationPolicy, NotificationRequest, RunSummary};
use crate::storage::{Connector, SqliteConnector};
use crate::tracker::{
    Directive, FinalizeReport, RawOutcome, Signal, Tracker, TrackerError, TrackerSession,
};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("{event} received out of order: {reason}")]
    OutOfOrder { event: &'static str, reason: &'static str },

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

/// One harness callback, as read from a replay log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HarnessEvent {
    RunBegin {
        #[serde(default)]
        initiator: Option<String>,
    },
    CaseBegin {
        address: String,
        #[serde(default)]
        environment: Option<String>,
    },
    CaseOutcome {
        /// Error type name, e.g. `AssertionError` or `BlockedTest`.
        #[serde(default)]
        error_type: Option<String>,
        #[serde(default)]
        signals: Vec<Signal>,
        #[serde(default)]
        detail: Option<String>,
    },
    RunEnd,
}

impl HarnessEvent {
    fn name(&self) -> &'static str {
        match self {
            HarnessEvent::RunBegin { .. } => "run_begin",
            HarnessEvent::CaseBegin { .. } => "case_begin",
            HarnessEvent::CaseOutcome { .. } => "case_outcome",
            HarnessEvent::RunEnd => "run_end",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub finalize: FinalizeReport,
    pub successful: bool,
    pub notification: Option<NotificationRequest>,
    pub delivered: bool,
}

struct ActiveCase {
    test_case_id: Uuid,
    address: String,
}

pub struct Reporter<C = SqliteConnector> {
    tracker: Tracker<C>,
    policy: Option<NotificationPolicy>,
    transport: Option<Box<dyn NotificationTransport>>,
    default_initiator: String,
    session: Option<TrackerSession>,
    current: Option<ActiveCase>,
    summary: RunSummary,
}

impl<C: Connector> Reporter<C> {
    pub fn new(tracker: Tracker<C>, default_initiator: impl Into<String>) -> Self {
        Self {
            tracker,
            policy: None,
            transport: None,
            default_initiator: default_initiator.into(),
            session: None,
            current: None,
            summary: RunSummary::default(),
        }
    }

    /// Enable run-end notifications.
    pub fn with_notifications(
        mut self,
        policy: NotificationPolicy,
        transport: Box<dyn NotificationTransport>,
    ) -> Self {
        self.policy = Some(policy);
        self.transport = Some(transport);
        self
    }

    pub fn tracker(&self) -> &Tracker<C> {
        &self.tracker
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    pub fn on_run_begin(&mut self, initiator: Option<&str>) -> Result<Uuid, HarnessError> {
        if self.session.is_some() {
            return Err(HarnessError::OutOfOrder {
                event: "run_begin",
                reason: "a run is already in progress",
            });
        }
        let initiator = initiator.unwrap_or(self.default_initiator.as_str());
        let session = self.tracker.begin_execution(initiator)?;
        let execution_id = session.execution_id();
        self.session = Some(session);
        self.summary = RunSummary::default();
        Ok(execution_id)
    }

    pub fn on_case_begin(
        &mut self,
        address: &str,
        environment_label: Option<&str>,
    ) -> Result<Uuid, HarnessError> {
        let session = self.session.as_mut().ok_or(HarnessError::OutOfOrder {
            event: "case_begin",
            reason: "no run has begun",
        })?;
        let label = environment_label.unwrap_or(NOT_APPLICABLE);
        let test_case_id = self.tracker.begin_test_case(session, address, label)?;
        self.current = Some(ActiveCase {
            test_case_id,
            address: address.to_string(),
        });
        Ok(test_case_id)
    }

    /// Record the current case's outcome and tell the harness how to proceed.
    pub fn on_case_outcome(&mut self, raw: &RawOutcome) -> Result<Directive, HarnessError> {
        let session = self.session.as_mut().ok_or(HarnessError::OutOfOrder {
            event: "case_outcome",
            reason: "no run has begun",
        })?;
        let case = self.current.as_ref().ok_or(HarnessError::OutOfOrder {
            event: "case_outcome",
            reason: "no test case has begun",
        })?;

        let recorded = self.tracker.record_outcome(session, case.test_case_id, raw)?;
        match recorded.outcome {
            Outcome::Pass => self.summary.record_success(&case.address),
            Outcome::Failure => self.summary.record_failure(&case.address),
            Outcome::Error => self.summary.record_error(&case.address),
            Outcome::Blocked | Outcome::Deprecated | Outcome::Skip => {}
        }
        Ok(recorded.directive)
    }

    /// Finalize the execution, then compose and deliver the notification.
    pub fn on_run_end(&mut self) -> Result<RunReport, HarnessError> {
        let session = self.session.take().ok_or(HarnessError::OutOfOrder {
            event: "run_end",
            reason: "no run has begun",
        })?;
        self.current = None;

        let finalize = self.tracker.finalize_execution(session)?;
        let successful = self.summary.was_successful();

        let notification = self
            .policy
            .as_ref()
            .and_then(|policy| policy.finalize(successful, &self.summary));
        let delivered = match (&notification, &self.transport) {
            (Some(request), Some(transport)) => deliver(&**transport, request),
            _ => false,
        };

        info!(
            execution_id = %finalize.execution_id,
            successful,
            passed = self.summary.successes.len(),
            failed = self.summary.failures.len(),
            errored = self.summary.errors.len(),
            "run finished"
        );

        Ok(RunReport {
            finalize,
            successful,
            notification,
            delivered,
        })
    }

    /// Dispatch one event. Returns the run report on `run_end`.
    pub fn handle(&mut self, event: HarnessEvent) -> Result<Option<RunReport>, HarnessError> {
        let name = event.name();
        match event {
            HarnessEvent::RunBegin { initiator } => {
                self.on_run_begin(initiator.as_deref())?;
            }
            HarnessEvent::CaseBegin {
                address,
                environment,
            } => {
                self.on_case_begin(&address, environment.as_deref())?;
            }
            HarnessEvent::CaseOutcome {
                error_type,
                signals,
                detail,
            } => {
                let mut raw = RawOutcome {
                    signals: signals.into_iter().collect(),
                    detail,
                };
                if let Some(error_type) = error_type {
                    raw.signals.insert(Signal::from_error_type(&error_type));
                }
                if let Directive::SkipCase { reason } = self.on_case_outcome(&raw)? {
                    warn!(event = name, reason = reason.as_deref().unwrap_or(""), "test case skipped");
                }
            }
            HarnessEvent::RunEnd => return self.on_run_end().map(Some),
        }
        Ok(None)
    }
}
