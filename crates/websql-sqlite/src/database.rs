//! A WebSQL-style callback database over SQLite.
//!
//! Transactions are queued and run one at a time by whichever caller finds
//! the queue idle. Each runs as `BEGIN`, the transaction callback, the
//! statement queue in order (statement callbacks may queue more), then
//! `COMMIT`. A failing statement asks its error callback whether to abort;
//! an abort, or a failing `COMMIT`, rolls back and reports through the
//! transaction's error callback.
//!
//! The SQLite handle is locked only while SQLite itself runs. No lock is
//! held while user callbacks run, so callbacks may queue statements or
//! whole new transactions.

#![allow(clippy::result_large_err)]

use crate::connection::{RawConnection, SqliteConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use websql_core::{
    ConnectionError, ConnectionErrorKind, Engine, EngineTransaction, Error, ErrorCallback,
    Result, SqlResultSet, StatementCallback, StatementErrorAction, StatementErrorCallback,
    SuccessCallback, TransactionCallback, TransactionError, TransactionErrorKind, Value,
};

const INFO_TABLE: &str = "__WebKitDatabaseInfoTable__";
const VERSION_KEY: &str = "WebKitDatabaseVersionKey";

/// A SQLite database exposing only callback-driven transactions.
#[derive(Clone)]
pub struct SqliteDatabase {
    shared: Arc<Shared>,
}

struct Shared {
    conn: Mutex<RawConnection>,
    jobs: Mutex<JobQueue>,
    next_txn_id: AtomicU64,
    config: SqliteConfig,
    filename: String,
    version: String,
}

#[derive(Default)]
struct JobQueue {
    pending: VecDeque<Job>,
    running: bool,
}

struct Job {
    callback: TransactionCallback<SqliteTransaction>,
    error_callback: ErrorCallback,
    success_callback: SuccessCallback,
}

impl std::fmt::Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDatabase")
            .field("name", &self.shared.config.name)
            .field("version", &self.shared.version)
            .field("filename", &self.shared.filename)
            .finish_non_exhaustive()
    }
}

impl SqliteDatabase {
    /// Open (or create) a database.
    ///
    /// Fails with a `VersionMismatch` connection error when the database
    /// already records a different non-empty version.
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        if config.name.is_empty() {
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Open,
                message: "WebSQL database name is missing".to_string(),
            }));
        }

        let filename = config.storage.filename(&config.name)?;
        let conn = RawConnection::open(&filename, config.busy_timeout_ms)?;
        apply_quota(&conn, config.max_size)?;
        let version = check_version(&conn, &config.name, &config.version)?;

        tracing::debug!(
            name = %config.name,
            version = %version,
            filename = %filename,
            max_size = config.max_size,
            "Opened WebSQL database"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                conn: Mutex::new(conn),
                jobs: Mutex::new(JobQueue::default()),
                next_txn_id: AtomicU64::new(1),
                config: config.clone(),
                filename,
                version,
            }),
        })
    }

    /// Open a private in-memory database with default settings.
    pub fn open_memory(name: impl Into<String>) -> Result<Self> {
        Self::open(&SqliteConfig::new(name))
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// The version recorded in the database.
    pub fn version(&self) -> &str {
        &self.shared.version
    }

    pub fn display_name(&self) -> &str {
        &self.shared.config.display_name
    }

    pub fn max_size(&self) -> u64 {
        self.shared.config.max_size
    }

    /// The SQLite filename, `:memory:` for in-memory databases.
    pub fn filename(&self) -> &str {
        &self.shared.filename
    }

    fn drain(&self) {
        let _running = RunningGuard(&self.shared.jobs);
        loop {
            let job = {
                let mut jobs = self.shared.jobs.lock().unwrap_or_else(|e| e.into_inner());
                match jobs.pending.pop_front() {
                    Some(job) => job,
                    None => {
                        jobs.running = false;
                        return;
                    }
                }
            };
            self.run_job(job);
        }
    }

    fn run_job(&self, job: Job) {
        let id = self.shared.next_txn_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(TxnState {
            id,
            queue: Mutex::new(StatementQueue::default()),
            abort_requested: AtomicBool::new(false),
            native_abort: self.shared.config.native_abort,
        });
        let tx = SqliteTransaction {
            state: Arc::clone(&state),
        };

        if let Err(err) = self.with_conn(|conn| conn.execute_raw("BEGIN")) {
            tracing::debug!(txn = id, error = %err, "BEGIN failed");
            state.close();
            (job.error_callback)(err);
            return;
        }
        tracing::debug!(txn = id, "BEGIN");
        let _open = OpenTxnGuard { db: self, state: &state };

        (job.callback)(&tx);

        loop {
            if state.abort_requested.load(Ordering::Acquire) {
                self.rollback(&state);
                (job.error_callback)(Error::Transaction(TransactionError::new(
                    TransactionErrorKind::Aborted,
                    "transaction aborted",
                )));
                return;
            }

            let Some(stmt) = state.pop() else {
                break;
            };

            tracing::trace!(txn = id, sql = %stmt.sql, "Executing statement");
            match self.with_conn(|conn| conn.run(&stmt.sql, &stmt.params)) {
                Ok(result) => (stmt.on_success)(&tx, result),
                Err(err) => {
                    tracing::debug!(txn = id, sql = %stmt.sql, error = %err, "Statement failed");
                    let action = (stmt.on_error)(&tx, &err);
                    // Some failures (SQLITE_FULL among them) end the
                    // transaction inside SQLite regardless of the answer.
                    let still_open = self.with_conn(|conn| conn.in_transaction());
                    if action == StatementErrorAction::Abort || !still_open {
                        self.rollback(&state);
                        (job.error_callback)(err);
                        return;
                    }
                }
            }
        }

        match self.with_conn(|conn| conn.execute_raw("COMMIT")) {
            Ok(()) => {
                tracing::debug!(txn = id, "COMMIT");
                state.close();
                (job.success_callback)();
            }
            Err(err) => {
                tracing::debug!(txn = id, error = %err, "COMMIT failed");
                self.rollback(&state);
                (job.error_callback)(err);
            }
        }
    }

    fn rollback(&self, state: &TxnState) {
        let result = self.with_conn(|conn| {
            if conn.in_transaction() {
                conn.execute_raw("ROLLBACK")
            } else {
                Ok(())
            }
        });
        if let Err(err) = result {
            tracing::warn!(txn = state.id, error = %err, "ROLLBACK failed");
        } else {
            tracing::debug!(txn = state.id, "ROLLBACK");
        }
        state.close();
    }

    fn with_conn<T>(&self, f: impl FnOnce(&RawConnection) -> T) -> T {
        let conn = self.shared.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&conn)
    }
}

impl Engine for SqliteDatabase {
    type Transaction = SqliteTransaction;

    fn transaction(
        &self,
        callback: TransactionCallback<SqliteTransaction>,
        error_callback: ErrorCallback,
        success_callback: SuccessCallback,
    ) {
        let start = {
            let mut jobs = self.shared.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.pending.push_back(Job {
                callback,
                error_callback,
                success_callback,
            });
            if jobs.running {
                false
            } else {
                jobs.running = true;
                true
            }
        };
        // Otherwise the caller is inside a callback of the running drain,
        // which picks the job up once the current transaction ends.
        if start {
            self.drain();
        }
    }
}

/// Clears the running flag if a callback unwinds through `drain`.
struct RunningGuard<'a>(&'a Mutex<JobQueue>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let mut jobs = self.0.lock().unwrap_or_else(|e| e.into_inner());
            jobs.running = false;
        }
    }
}

/// Rolls back the open transaction if a callback unwinds through `run_job`.
struct OpenTxnGuard<'a> {
    db: &'a SqliteDatabase,
    state: &'a TxnState,
}

impl Drop for OpenTxnGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::warn!(txn = self.state.id, "Callback panicked inside an open transaction");
            self.db.rollback(self.state);
        }
    }
}

/// An open transaction of a [`SqliteDatabase`].
#[derive(Clone)]
pub struct SqliteTransaction {
    state: Arc<TxnState>,
}

struct TxnState {
    id: u64,
    queue: Mutex<StatementQueue>,
    abort_requested: AtomicBool,
    native_abort: bool,
}

#[derive(Default)]
struct StatementQueue {
    statements: VecDeque<QueuedStatement>,
    closed: bool,
}

struct QueuedStatement {
    sql: String,
    params: Vec<Value>,
    on_success: StatementCallback<SqliteTransaction>,
    on_error: StatementErrorCallback<SqliteTransaction>,
}

impl TxnState {
    fn pop(&self) -> Option<QueuedStatement> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .statements
            .pop_front()
    }

    /// Mark the transaction closed and drop whatever is still queued.
    fn close(&self) {
        let discarded = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.closed = true;
            std::mem::take(&mut queue.statements)
        };
        if !discarded.is_empty() {
            tracing::debug!(
                txn = self.id,
                count = discarded.len(),
                "Discarding statements queued on a closed transaction"
            );
        }
        // Dropped outside the lock: dropping a callback may queue work.
        drop(discarded);
    }
}

impl SqliteTransaction {
    /// Engine-assigned transaction id, for diagnostics.
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Has this transaction committed or rolled back?
    pub fn is_closed(&self) -> bool {
        self.state
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .closed
    }
}

impl std::fmt::Debug for SqliteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTransaction")
            .field("id", &self.state.id)
            .finish_non_exhaustive()
    }
}

impl EngineTransaction for SqliteTransaction {
    type ResultSet = SqlResultSet;

    fn execute_sql(
        &self,
        sql: &str,
        params: Vec<Value>,
        on_success: StatementCallback<Self>,
        on_error: StatementErrorCallback<Self>,
    ) -> Result<()> {
        let mut queue = self.state.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.closed {
            return Err(Error::Transaction(TransactionError::new(
                TransactionErrorKind::Closed,
                format!("transaction {} is no longer open", self.state.id),
            )));
        }
        queue.statements.push_back(QueuedStatement {
            sql: sql.to_string(),
            params,
            on_success,
            on_error,
        });
        Ok(())
    }

    fn abort(&self) -> bool {
        if !self.state.native_abort || self.is_closed() {
            return false;
        }
        tracing::debug!(txn = self.state.id, "Abort requested");
        self.state.abort_requested.store(true, Ordering::Release);
        true
    }
}

fn apply_quota(conn: &RawConnection, max_size: u64) -> Result<()> {
    if max_size == 0 {
        return Ok(());
    }
    let page_size = conn
        .query_scalar("PRAGMA page_size", &[])?
        .and_then(|v| v.as_i64())
        .and_then(|v| u64::try_from(v).ok())
        .filter(|v| *v > 0)
        .unwrap_or(4096);
    let max_pages = max_size.div_ceil(page_size).max(1);
    conn.execute_raw(&format!("PRAGMA max_page_count = {}", max_pages))
}

fn check_version(conn: &RawConnection, name: &str, requested: &str) -> Result<String> {
    conn.execute_raw(&format!(
        "CREATE TABLE IF NOT EXISTS {INFO_TABLE} (\
         key TEXT NOT NULL ON CONFLICT FAIL UNIQUE ON CONFLICT REPLACE, \
         value TEXT NOT NULL ON CONFLICT FAIL)"
    ))?;

    let stored = conn
        .query_scalar(
            &format!("SELECT value FROM {INFO_TABLE} WHERE key = ?"),
            &[Value::from(VERSION_KEY)],
        )?
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();

    if stored.is_empty() {
        if !requested.is_empty() {
            conn.run(
                &format!("INSERT INTO {INFO_TABLE} (key, value) VALUES (?, ?)"),
                &[Value::from(VERSION_KEY), Value::from(requested)],
            )?;
        }
        return Ok(requested.to_string());
    }

    if !requested.is_empty() && stored != requested {
        return Err(Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::VersionMismatch,
            message: format!(
                "database '{}' has version '{}', expected '{}'",
                name, stored, requested
            ),
        }));
    }
    Ok(stored)
}
