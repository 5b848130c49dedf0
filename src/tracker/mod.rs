//! Test-run lifecycle tracker.
//!
//! Drives the execution/test case state machine:
//!
//! ```text
//! begin_execution ─▶ begin_test_case ─▶ record_outcome ─┐
//!                          ▲                            │
//!                          └────────────────────────────┘
//!                                       finalize_execution
//! ```
//!
//! Run and case identifiers travel in an explicit [`TrackerSession`] rather
//! than living in the tracker. A session can only be obtained from
//! [`Tracker::begin_execution`] and is consumed by
//! [`Tracker::finalize_execution`], so calls cannot be issued out of order.

pub mod classify;

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use self::classify::{classify, truncate_message, RawOutcome, Signal, CAPTURED_LOGGING_MARKER};

use crate::model::{
    environment_label_of, now_millis, ExecutionPayload, Outcome, State, TestCasePayload,
    TestDescriptor,
};
use crate::storage::{Connector, RunStore, SqliteConnector, StoreError};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("test case {test_case_id} was not started in execution {execution_id}")]
    UnknownTestCase { test_case_id: Uuid, execution_id: Uuid },

    #[error("outcome for test case {test_case_id} was already recorded")]
    AlreadyRecorded { test_case_id: Uuid },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the harness should do with the current test after an outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Continue,
    /// Stop this test case only and treat it as skipped, not failed.
    SkipCase { reason: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub outcome: Outcome,
    pub directive: Directive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeReport {
    pub execution_id: Uuid,
    pub runtime_millis: i64,
    /// Test cases that were started but never reported.
    pub unreported: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy)]
struct CaseProgress {
    started_at_millis: i64,
    reported: bool,
}

/// Per-run identifiers and start times.
#[derive(Debug)]
pub struct TrackerSession {
    execution_id: Uuid,
    start_time_millis: i64,
    current_test_case: Option<Uuid>,
    cases: HashMap<Uuid, CaseProgress>,
}

impl TrackerSession {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn start_time_millis(&self) -> i64 {
        self.start_time_millis
    }

    /// The most recently started test case.
    pub fn current_test_case(&self) -> Option<Uuid> {
        self.current_test_case
    }

    pub fn case_start_time(&self, test_case_id: Uuid) -> Option<i64> {
        self.cases.get(&test_case_id).map(|c| c.started_at_millis)
    }

    pub fn is_reported(&self, test_case_id: Uuid) -> Option<bool> {
        self.cases.get(&test_case_id).map(|c| c.reported)
    }

    fn unreported(&self) -> Vec<Uuid> {
        self.cases
            .iter()
            .filter(|(_, c)| !c.reported)
            .map(|(id, _)| *id)
            .collect()
    }
}

pub struct Tracker<C = SqliteConnector> {
    store: RunStore<C>,
}

impl<C: Connector> Tracker<C> {
    pub fn new(store: RunStore<C>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &RunStore<C> {
        &self.store
    }

    /// Persist a new execution and open its session.
    pub fn begin_execution(&self, initiator: &str) -> Result<TrackerSession, TrackerError> {
        let execution = ExecutionPayload::begin(initiator);
        self.store.insert_execution(&execution)?;
        info!(execution_id = %execution.execution_id, %initiator, "execution started");

        Ok(TrackerSession {
            execution_id: execution.execution_id,
            start_time_millis: execution.start_time_millis,
            current_test_case: None,
            cases: HashMap::new(),
        })
    }

    /// Persist a new test case in `NOT_RUN` and start its clock.
    pub fn begin_test_case(
        &self,
        session: &mut TrackerSession,
        address: &str,
        environment_label: &str,
    ) -> Result<Uuid, TrackerError> {
        let case = TestCasePayload::begin(session.execution_id, address, environment_label);
        self.store.insert_test_case(&case)?;

        session.current_test_case = Some(case.test_case_id);
        session.cases.insert(
            case.test_case_id,
            CaseProgress {
                started_at_millis: now_millis(),
                reported: false,
            },
        );
        debug!(
            execution_id = %session.execution_id,
            test_case_id = %case.test_case_id,
            %address,
            environment = %environment_label,
            "test case started"
        );
        Ok(case.test_case_id)
    }

    /// [`Tracker::begin_test_case`] for a test that describes itself.
    pub fn begin_test<T: TestDescriptor + ?Sized>(
        &self,
        session: &mut TrackerSession,
        test: &T,
    ) -> Result<Uuid, TrackerError> {
        let label = environment_label_of(test);
        self.begin_test_case(session, &test.address(), &label)
    }

    /// Classify and persist the outcome of a started test case. May be
    /// called once per test case; a terminal state is never overwritten.
    pub fn record_outcome(
        &self,
        session: &mut TrackerSession,
        test_case_id: Uuid,
        raw: &RawOutcome,
    ) -> Result<Recorded, TrackerError> {
        let progress = *session
            .cases
            .get(&test_case_id)
            .ok_or(TrackerError::UnknownTestCase {
                test_case_id,
                execution_id: session.execution_id,
            })?;
        if progress.reported {
            warn!(%test_case_id, "outcome recorded twice for the same test case");
            return Err(TrackerError::AlreadyRecorded { test_case_id });
        }

        let outcome = classify(raw);
        let runtime_millis = (now_millis() - progress.started_at_millis).max(0);
        let message = raw.detail().map(truncate_message);

        let changed = self.store.complete_test_case(
            test_case_id,
            session.execution_id,
            outcome.into(),
            runtime_millis,
            message,
        )?;
        if changed == 0 {
            warn!(%test_case_id, "stored test case is no longer NOT_RUN");
            return Err(TrackerError::AlreadyRecorded { test_case_id });
        }

        if let Some(case) = session.cases.get_mut(&test_case_id) {
            case.reported = true;
        }
        info!(
            execution_id = %session.execution_id,
            %test_case_id,
            state = %State::from(outcome),
            runtime_ms = runtime_millis,
            "test case finished"
        );

        let directive = if outcome.is_skip_class() {
            Directive::SkipCase {
                reason: message.map(str::to_owned),
            }
        } else {
            Directive::Continue
        };
        Ok(Recorded { outcome, directive })
    }

    /// Persist the total runtime and close the session.
    pub fn finalize_execution(&self, session: TrackerSession) -> Result<FinalizeReport, TrackerError> {
        let unreported = session.unreported();
        if !unreported.is_empty() {
            warn!(
                execution_id = %session.execution_id,
                count = unreported.len(),
                "finalizing execution with unreported test cases"
            );
        }

        let runtime_millis = (now_millis() - session.start_time_millis).max(0);
        let changed = self
            .store
            .finalize_execution(session.execution_id, runtime_millis)?;
        if changed == 0 {
            warn!(execution_id = %session.execution_id, "execution row missing or already finalized");
        }
        info!(execution_id = %session.execution_id, runtime_ms = runtime_millis, "execution finished");

        Ok(FinalizeReport {
            execution_id: session.execution_id,
            runtime_millis,
            unreported,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HasEnvironmentLabel;
    use crate::storage::tests::{no_backoff, temp_credentials, FlakyConnector};
    use tempfile::TempDir;

    fn tracker(dir: &TempDir) -> Tracker {
        let store = RunStore::new(SqliteConnector, temp_credentials(dir), no_backoff());
        store.initialize().unwrap();
        Tracker::new(store)
    }

    struct LoginTest;
    impl HasEnvironmentLabel for LoginTest {
        fn environment_label(&self) -> Option<&str> {
            Some("firefox")
        }
    }
    impl TestDescriptor for LoginTest {
        fn address(&self) -> String {
            "web.auth.LoginTest.test_login".to_string()
        }
    }

    #[test]
    fn test_state_moves_once_from_not_run() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        let mut session = tracker.begin_execution("ci").unwrap();
        let id = tracker.begin_test_case(&mut session, "pkg.test_a", "N/A").unwrap();

        let stored = tracker.store().fetch_test_case(id).unwrap().unwrap();
        assert_eq!(stored.state, State::NotRun);

        let recorded = tracker
            .record_outcome(&mut session, id, &RawOutcome::failure("assert 1==2"))
            .unwrap();
        assert_eq!(recorded.outcome, Outcome::Failure);
        assert_eq!(recorded.directive, Directive::Continue);

        let stored = tracker.store().fetch_test_case(id).unwrap().unwrap();
        assert_eq!(stored.state, State::Failure);
        assert!(stored.runtime_millis.unwrap() >= 0);
    }

    #[test]
    fn test_round_trip_keeps_identity_fields() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        let mut session = tracker.begin_execution("ci").unwrap();
        let id = tracker.begin_test(&mut session, &LoginTest).unwrap();
        assert_eq!(session.current_test_case(), Some(id));

        let before = tracker.store().fetch_test_case(id).unwrap().unwrap();
        tracker
            .record_outcome(&mut session, id, &RawOutcome::pass())
            .unwrap();
        let after = tracker.store().fetch_test_case(id).unwrap().unwrap();

        assert_eq!(after.test_case_id, before.test_case_id);
        assert_eq!(after.execution_id, session.execution_id());
        assert_eq!(after.address, "web.auth.LoginTest.test_login");
        assert_eq!(after.environment_label, "firefox");
        assert_eq!(after.state, State::Pass);
        assert!(after.message.is_none());
        assert!(after.runtime_millis.is_some());
    }

    #[test]
    fn test_second_outcome_is_rejected() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        let mut session = tracker.begin_execution("ci").unwrap();
        let id = tracker.begin_test_case(&mut session, "pkg.test_a", "N/A").unwrap();

        tracker
            .record_outcome(&mut session, id, &RawOutcome::error("boom"))
            .unwrap();
        let err = tracker
            .record_outcome(&mut session, id, &RawOutcome::pass())
            .unwrap_err();
        assert!(matches!(err, TrackerError::AlreadyRecorded { .. }));

        let stored = tracker.store().fetch_test_case(id).unwrap().unwrap();
        assert_eq!(stored.state, State::Error);
        assert_eq!(stored.message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_terminal_state_in_store_is_not_overwritten() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        let mut session = tracker.begin_execution("ci").unwrap();
        let id = tracker.begin_test_case(&mut session, "pkg.test_a", "N/A").unwrap();

        // Another writer already finished this case.
        tracker
            .store()
            .complete_test_case(id, session.execution_id(), State::Pass, 5, None)
            .unwrap();

        let err = tracker
            .record_outcome(&mut session, id, &RawOutcome::failure("late"))
            .unwrap_err();
        assert!(matches!(err, TrackerError::AlreadyRecorded { .. }));
        let stored = tracker.store().fetch_test_case(id).unwrap().unwrap();
        assert_eq!(stored.state, State::Pass);
    }

    #[test]
    fn test_unknown_test_case_is_rejected() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        let mut session = tracker.begin_execution("ci").unwrap();
        let err = tracker
            .record_outcome(&mut session, Uuid::new_v4(), &RawOutcome::pass())
            .unwrap_err();
        assert!(matches!(err, TrackerError::UnknownTestCase { .. }));
    }

    #[test]
    fn test_skip_class_outcomes_return_skip_directive() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        let mut session = tracker.begin_execution("ci").unwrap();

        for (signal, state) in [
            (Signal::Blocked, State::Blocked),
            (Signal::Deprecated, State::Deprecated),
            (Signal::Skip, State::Skip),
        ] {
            let id = tracker.begin_test_case(&mut session, "pkg.test_s", "N/A").unwrap();
            let raw = RawOutcome::signalled(signal, "not today").with_signal(Signal::Error);
            let recorded = tracker.record_outcome(&mut session, id, &raw).unwrap();
            assert_eq!(
                recorded.directive,
                Directive::SkipCase {
                    reason: Some("not today".to_string())
                }
            );
            let stored = tracker.store().fetch_test_case(id).unwrap().unwrap();
            assert_eq!(stored.state, state);
        }
    }

    #[test]
    fn test_message_is_truncated_before_captured_logging() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        let mut session = tracker.begin_execution("ci").unwrap();
        let id = tracker.begin_test_case(&mut session, "pkg.test_a", "N/A").unwrap();

        let detail = "assert 1==2\n-------------------- >> begin captured logging << --------------------\nLOTS OF LOG";
        tracker
            .record_outcome(&mut session, id, &RawOutcome::failure(detail))
            .unwrap();
        let stored = tracker.store().fetch_test_case(id).unwrap().unwrap();
        assert_eq!(stored.message.as_deref(), Some("assert 1==2\n"));
    }

    #[test]
    fn test_finalize_sets_runtime_and_lists_unreported() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        let mut session = tracker.begin_execution("ci").unwrap();
        let done = tracker.begin_test_case(&mut session, "pkg.done", "N/A").unwrap();
        let dangling = tracker.begin_test_case(&mut session, "pkg.dangling", "N/A").unwrap();
        tracker
            .record_outcome(&mut session, done, &RawOutcome::pass())
            .unwrap();

        let execution_id = session.execution_id();
        let report = tracker.finalize_execution(session).unwrap();
        assert_eq!(report.execution_id, execution_id);
        assert_eq!(report.unreported, vec![dangling]);

        let stored = tracker.store().fetch_execution(execution_id).unwrap().unwrap();
        assert_eq!(stored.runtime_millis, Some(report.runtime_millis));
        assert_eq!(stored.initiator, "ci");
    }

    #[test]
    fn test_begin_execution_surfaces_connection_exhaustion() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(FlakyConnector::new(u32::MAX), temp_credentials(&dir), no_backoff());
        let tracker = Tracker::new(store);
        let err = tracker.begin_execution("ci").unwrap_err();
        assert!(matches!(
            err,
            TrackerError::Store(StoreError::ConnectionExhausted { attempts: 3, .. })
        ));
    }
}
