//! The boundary to a WebSQL-style callback engine.
//!
//! An engine only offers asynchronous, callback-driven transactions:
//!
//! - [`Engine::transaction`] opens a physical transaction, hands the caller a
//!   transaction object, and later reports exactly one of error or success
//!   for the whole transaction.
//! - [`EngineTransaction::execute_sql`] queues a statement inside an open
//!   transaction. Its error callback decides whether the failure aborts the
//!   transaction.
//! - [`NativeResult`] is the engine's raw per-statement result, normalized by
//!   [`crate::result::normalize_result`].
//!
//! Callbacks run on whichever task drives the engine. An engine must never
//! interleave two physical transactions.

use crate::error::{Error, QueryError, QueryErrorKind, Result};
use crate::row::Row;
use crate::value::Value;

/// What a statement error callback asks the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatementErrorAction {
    /// Roll the whole transaction back and report the error.
    #[default]
    Abort,
    /// Treat the error as handled and keep going.
    Continue,
}

/// Called once the physical transaction is open.
pub type TransactionCallback<T> = Box<dyn FnOnce(&T) + Send>;

/// Called when the physical transaction rolled back.
pub type ErrorCallback = Box<dyn FnOnce(Error) + Send>;

/// Called when the physical transaction committed.
pub type SuccessCallback = Box<dyn FnOnce() + Send>;

/// Called with a statement's native result.
pub type StatementCallback<T> = Box<dyn FnOnce(&T, <T as EngineTransaction>::ResultSet) + Send>;

/// Called when a statement fails.
pub type StatementErrorCallback<T> = Box<dyn FnOnce(&T, &Error) -> StatementErrorAction + Send>;

/// A WebSQL-style database.
pub trait Engine: Send + Sync + 'static {
    /// The transaction object handed to transaction callbacks.
    type Transaction: EngineTransaction;

    /// Open a physical transaction.
    ///
    /// `callback` runs once the transaction is open. Statements it queues,
    /// and statements queued by their own callbacks, run in order. Exactly
    /// one of `error_callback` or `success_callback` runs afterwards.
    fn transaction(
        &self,
        callback: TransactionCallback<Self::Transaction>,
        error_callback: ErrorCallback,
        success_callback: SuccessCallback,
    );
}

/// An open physical transaction.
pub trait EngineTransaction: Clone + Send + Sync + 'static {
    /// The engine's raw per-statement result.
    type ResultSet: NativeResult + Send + 'static;

    /// Queue a statement.
    ///
    /// Returns an error without queueing anything when the transaction has
    /// already closed.
    #[allow(clippy::result_large_err)]
    fn execute_sql(
        &self,
        sql: &str,
        params: Vec<Value>,
        on_success: StatementCallback<Self>,
        on_error: StatementErrorCallback<Self>,
    ) -> Result<()>;

    /// Roll the transaction back without running a statement.
    ///
    /// Returns `false` when the engine has no native abort; callers then
    /// fall back to a statement that always fails.
    fn abort(&self) -> bool {
        false
    }
}

/// The raw result of one statement, as the engine reports it.
pub trait NativeResult {
    /// Rows changed by the statement, when the engine reports it.
    fn rows_affected(&self) -> Option<u64>;

    /// Row id of the inserted row.
    ///
    /// Engines may fail when the statement inserted nothing.
    #[allow(clippy::result_large_err)]
    fn insert_id(&self) -> Result<Option<i64>>;

    /// The row cursor, when the statement produced one.
    fn rows(&self) -> Option<&[Row]>;
}

/// An owned, WebSQL-shaped result set.
///
/// Like `SQLResultSet.insertId`, reading the insert id of a statement that
/// inserted nothing is an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlResultSet {
    rows: Option<Vec<Row>>,
    rows_affected: Option<u64>,
    insert_id: Option<i64>,
}

impl SqlResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = Some(rows);
        self
    }

    pub fn with_rows_affected(mut self, count: u64) -> Self {
        self.rows_affected = Some(count);
        self
    }

    pub fn with_insert_id(mut self, id: i64) -> Self {
        self.insert_id = Some(id);
        self
    }
}

impl NativeResult for SqlResultSet {
    fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }

    fn insert_id(&self) -> Result<Option<i64>> {
        match self.insert_id {
            Some(id) => Ok(Some(id)),
            None => Err(Error::Query(QueryError {
                kind: QueryErrorKind::Database,
                sql: None,
                code: None,
                message: "the statement did not insert a row".to_string(),
            })),
        }
    }

    fn rows(&self) -> Option<&[Row]> {
        self.rows.as_deref()
    }
}
