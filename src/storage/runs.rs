use rusqlite::types::Type;
use rusqlite::{params, Row};
use uuid::Uuid;

use super::{Connector, Credentials, RetryPolicy, SqliteConnector, StoreClient, StoreError};
use crate::model::{ExecutionPayload, State, TestCasePayload};

/// Execution and test case records, one fresh connection per statement.
pub struct RunStore<C = SqliteConnector> {
    connector: C,
    credentials: Credentials,
    retry: RetryPolicy,
}

impl<C: Connector> RunStore<C> {
    pub fn new(connector: C, credentials: Credentials, retry: RetryPolicy) -> Self {
        Self {
            connector,
            credentials,
            retry,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    fn client(&self) -> Result<StoreClient, StoreError> {
        StoreClient::connect(&self.connector, &self.credentials, &self.retry)
    }

    /// Create the schema if it is missing.
    pub fn initialize(&self) -> Result<(), StoreError> {
        self.client()?.apply_schema()
    }

    pub fn insert_execution(&self, execution: &ExecutionPayload) -> Result<(), StoreError> {
        self.client()?.execute(
            "INSERT INTO executions (guid, start_time_ms, runtime_ms, initiator)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                execution.execution_id.to_string(),
                execution.start_time_millis,
                execution.runtime_millis,
                execution.initiator
            ],
        )?;
        Ok(())
    }

    /// Set the execution runtime if it has not been set yet.
    /// Returns the number of rows changed (0 when already finalized).
    pub fn finalize_execution(&self, execution_id: Uuid, runtime_millis: i64) -> Result<usize, StoreError> {
        self.client()?.execute(
            "UPDATE executions SET runtime_ms = ?1 WHERE guid = ?2 AND runtime_ms IS NULL",
            params![runtime_millis, execution_id.to_string()],
        )
    }

    pub fn fetch_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionPayload>, StoreError> {
        self.client()?.fetch_one(
            "SELECT guid, start_time_ms, runtime_ms, initiator FROM executions WHERE guid = ?1",
            params![execution_id.to_string()],
            |row| {
                Ok(ExecutionPayload {
                    execution_id: uuid_column(row, 0)?,
                    start_time_millis: row.get(1)?,
                    runtime_millis: row.get(2)?,
                    initiator: row.get(3)?,
                })
            },
        )
    }

    pub fn insert_test_case(&self, case: &TestCasePayload) -> Result<(), StoreError> {
        self.client()?.execute(
            "INSERT INTO test_cases (guid, execution_guid, address, environment, state, runtime_ms, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                case.test_case_id.to_string(),
                case.execution_id.to_string(),
                case.address,
                case.environment_label,
                case.state,
                case.runtime_millis,
                case.message
            ],
        )?;
        Ok(())
    }

    /// Move a test case out of `NOT_RUN`. Returns the number of rows changed;
    /// 0 means the case does not exist in this execution or is already terminal.
    pub fn complete_test_case(
        &self,
        test_case_id: Uuid,
        execution_id: Uuid,
        state: State,
        runtime_millis: i64,
        message: Option<&str>,
    ) -> Result<usize, StoreError> {
        self.client()?.execute(
            "UPDATE test_cases SET state = ?1, runtime_ms = ?2, message = ?3
             WHERE guid = ?4 AND execution_guid = ?5 AND state = ?6",
            params![
                state,
                runtime_millis,
                message,
                test_case_id.to_string(),
                execution_id.to_string(),
                State::NotRun
            ],
        )
    }

    pub fn fetch_test_case(&self, test_case_id: Uuid) -> Result<Option<TestCasePayload>, StoreError> {
        self.client()?.fetch_one(
            "SELECT guid, execution_guid, address, environment, state, runtime_ms, message
             FROM test_cases WHERE guid = ?1",
            params![test_case_id.to_string()],
            test_case_row,
        )
    }

    pub fn list_test_cases(&self, execution_id: Uuid) -> Result<Vec<TestCasePayload>, StoreError> {
        self.client()?.fetch_all(
            "SELECT guid, execution_guid, address, environment, state, runtime_ms, message
             FROM test_cases WHERE execution_guid = ?1 ORDER BY created_at, rowid",
            params![execution_id.to_string()],
            test_case_row,
        )
    }
}

fn test_case_row(row: &Row<'_>) -> rusqlite::Result<TestCasePayload> {
    Ok(TestCasePayload {
        test_case_id: uuid_column(row, 0)?,
        execution_id: uuid_column(row, 1)?,
        address: row.get(2)?,
        environment_label: row.get(3)?,
        state: row.get(4)?,
        runtime_millis: row.get(5)?,
        message: row.get(6)?,
    })
}

fn uuid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
