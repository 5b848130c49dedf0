//! SQLite storage layer -- connection handling, schema, run records.
//!
//! Every query goes through a [`StoreClient`], which owns exactly one
//! connection and is consumed by the query it runs. The connection (and any
//! prepared statement) is closed before the call returns, on success and on
//! failure alike, so a handle can never outlive the statement it served.

pub mod runs;
pub mod schema;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Params, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub use self::runs::RunStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unable to connect to store after {attempts} attempt(s): {last_error}")]
    ConnectionExhausted { attempts: u32, last_error: String },

    #[error("query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Resolved connection credentials for one database environment.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Directory holding the database files.
    pub host: String,
    pub user: String,
    pub password: String,
    /// Database name; the file is `<host>/<schema>.db`.
    pub schema: String,
}

impl Credentials {
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        schema: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            password: password.into(),
            schema: schema.into(),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.host).join(format!("{}.db", self.schema))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("schema", &self.schema)
            .finish()
    }
}

/// Bounded retry applied to connection establishment only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(10),
        }
    }
}

/// Opens one raw connection. Implementations do not retry.
pub trait Connector {
    fn open(&self, credentials: &Credentials) -> rusqlite::Result<Connection>;
}

/// File-backed SQLite connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteConnector;

impl Connector for SqliteConnector {
    fn open(&self, credentials: &Credentials) -> rusqlite::Result<Connection> {
        let conn = Connection::open(credentials.database_path())?;
        // No transaction is ever opened, so SQLite stays in autocommit mode.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(conn)
    }
}

/// A single-use connection. Each query method consumes the client.
pub struct StoreClient {
    conn: Connection,
}

impl StoreClient {
    /// Connect, retrying up to `policy.attempts` times with `policy.backoff`
    /// between attempts.
    pub fn connect<C: Connector + ?Sized>(
        connector: &C,
        credentials: &Credentials,
        policy: &RetryPolicy,
    ) -> Result<Self, StoreError> {
        let attempts = policy.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match connector.open(credentials) {
                Ok(conn) => {
                    debug!(attempt, host = %credentials.host, schema = %credentials.schema, "store connection established");
                    return Ok(Self { conn });
                }
                Err(e) => {
                    warn!(attempt, attempts, host = %credentials.host, error = %e, "store connection failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        std::thread::sleep(policy.backoff);
                    }
                }
            }
        }

        Err(StoreError::ConnectionExhausted {
            attempts,
            last_error,
        })
    }

    /// Run a query, map every row, then close.
    pub fn fetch_all<T, P, F>(self, sql: &str, params: P, map: F) -> Result<Vec<T>, StoreError>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.run_and_close(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(params, map)?
                .collect::<rusqlite::Result<Vec<T>>>();
            rows
        })
    }

    /// Run a query, map the first row if any, then close.
    pub fn fetch_one<T, P, F>(self, sql: &str, params: P, map: F) -> Result<Option<T>, StoreError>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.run_and_close(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let row = stmt.query_row(params, map).optional();
            row
        })
    }

    /// Execute a statement, then close. Returns the number of changed rows.
    pub fn execute<P: Params>(self, sql: &str, params: P) -> Result<usize, StoreError> {
        self.run_and_close(|conn| conn.execute(sql, params))
    }

    /// Create the tables if they are missing, then close.
    pub fn apply_schema(self) -> Result<(), StoreError> {
        self.run_and_close(schema::migrate)
    }

    fn run_and_close<T>(
        self,
        op: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let result = op(&self.conn);
        self.close();
        result.map_err(StoreError::Query)
    }

    fn close(self) {
        // On failure the handle is handed back and released by its Drop.
        if let Err((_conn, e)) = self.conn.close() {
            warn!(error = %e, "failed to close store connection cleanly");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::TempDir;

    /// Fails the first `failures` opens, then delegates to SQLite.
    pub(crate) struct FlakyConnector {
        pub failures: u32,
        pub calls: Cell<u32>,
    }

    impl FlakyConnector {
        pub fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: Cell::new(0),
            }
        }
    }

    impl Connector for FlakyConnector {
        fn open(&self, credentials: &Credentials) -> rusqlite::Result<Connection> {
            let call = self.calls.get() + 1;
            self.calls.set(call);
            if call <= self.failures {
                return Err(rusqlite::Error::InvalidPath(credentials.database_path()));
            }
            SqliteConnector.open(credentials)
        }
    }

    pub(crate) fn no_backoff() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::ZERO,
        }
    }

    pub(crate) fn temp_credentials(dir: &TempDir) -> Credentials {
        Credentials::new(dir.path().to_string_lossy(), "tester", "secret", "runs")
    }

    #[test]
    fn test_connect_succeeds_on_third_attempt() {
        let dir = TempDir::new().unwrap();
        let connector = FlakyConnector::new(2);
        let client = StoreClient::connect(&connector, &temp_credentials(&dir), &no_backoff());
        assert!(client.is_ok());
        assert_eq!(connector.calls.get(), 3);

        let one: Option<i64> = client
            .unwrap()
            .fetch_one("SELECT 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(one, Some(1));
    }

    #[test]
    fn test_connect_exhausted_after_three_attempts() {
        let dir = TempDir::new().unwrap();
        let connector = FlakyConnector::new(u32::MAX);
        let err = StoreClient::connect(&connector, &temp_credentials(&dir), &no_backoff())
            .err()
            .unwrap();
        assert_eq!(connector.calls.get(), 3);
        assert!(matches!(err, StoreError::ConnectionExhausted { attempts: 3, .. }));
    }

    #[test]
    fn test_query_error_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let connector = FlakyConnector::new(0);
        let client = StoreClient::connect(&connector, &temp_credentials(&dir), &no_backoff()).unwrap();
        let err = client.execute("INSERT INTO no_such_table VALUES (1)", []).unwrap_err();
        assert!(matches!(err, StoreError::Query(_)));
        assert_eq!(connector.calls.get(), 1);
    }

    #[test]
    fn test_each_call_uses_a_fresh_connection() {
        let dir = TempDir::new().unwrap();
        let creds = temp_credentials(&dir);
        let policy = no_backoff();

        StoreClient::connect(&SqliteConnector, &creds, &policy)
            .unwrap()
            .execute("CREATE TABLE t (v INTEGER)", [])
            .unwrap();
        let changed = StoreClient::connect(&SqliteConnector, &creds, &policy)
            .unwrap()
            .execute("INSERT INTO t (v) VALUES (?1), (?2)", [7, 8])
            .unwrap();
        assert_eq!(changed, 2);

        // Autocommit: a separate connection sees the rows.
        let values: Vec<i64> = StoreClient::connect(&SqliteConnector, &creds, &policy)
            .unwrap()
            .fetch_all("SELECT v FROM t ORDER BY v", [], |row| row.get(0))
            .unwrap();
        assert_eq!(values, vec![7, 8]);
    }

    #[test]
    fn test_fetch_one_without_rows_is_none() {
        let dir = TempDir::new().unwrap();
        let creds = temp_credentials(&dir);
        let row: Option<i64> = StoreClient::connect(&SqliteConnector, &creds, &no_backoff())
            .unwrap()
            .fetch_one("SELECT 1 WHERE 0", [], |row| row.get(0))
            .unwrap();
        assert!(row.is_none());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("/tmp", "u", "hunter2", "db");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }
}
