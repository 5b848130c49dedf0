//! Database schema for executions and their test cases.

use rusqlite::Connection;

pub const SCHEMA_VERSION: i64 = 1;

/// Create any missing tables. Safe to run repeatedly.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS executions (
            guid TEXT PRIMARY KEY,
            start_time_ms INTEGER NOT NULL,
            runtime_ms INTEGER,
            initiator TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS test_cases (
            guid TEXT PRIMARY KEY,
            execution_guid TEXT NOT NULL,
            address TEXT NOT NULL,
            environment TEXT NOT NULL DEFAULT 'N/A',
            state TEXT NOT NULL DEFAULT 'NOT_RUN',
            runtime_ms INTEGER,
            message TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (execution_guid) REFERENCES executions(guid)
        );

        CREATE INDEX IF NOT EXISTS idx_test_cases_execution ON test_cases(execution_guid);
        CREATE INDEX IF NOT EXISTS idx_test_cases_state ON test_cases(state);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
