//! The public entry point: one engine handle behind one serial lock.

use crate::coordinator;
use crate::handle::TransactionHandle;
use crate::lock::SerialLock;
use crate::options::ConnectionOptions;
use std::future::Future;
use websql_core::{Cx, Engine, Error, Outcome, Result, UniformResult, Value};
use websql_sqlite::SqliteDatabase;

/// A serialized connection to a WebSQL-style database.
///
/// Every [`query`](Self::query) and [`transaction`](Self::transaction) runs
/// alone: overlapping calls wait their turn in arrival order and each maps
/// onto exactly one physical engine transaction.
#[derive(Debug)]
pub struct Connection<E: Engine = SqliteDatabase> {
    engine: E,
    lock: SerialLock,
    options: ConnectionOptions,
}

impl Connection<SqliteDatabase> {
    /// Open the SQLite database described by `options`.
    pub fn create(options: ConnectionOptions) -> Result<Self> {
        let config = options.to_sqlite_config()?;
        let engine = SqliteDatabase::open(&config)?;
        tracing::info!(
            name = %options.name,
            version = %engine.version(),
            "WebSQL connection created"
        );
        Ok(Self::with_engine(engine, options))
    }
}

impl<E: Engine> Connection<E> {
    /// Wrap an already opened engine.
    pub fn with_engine(engine: E, options: ConnectionOptions) -> Self {
        Self {
            engine,
            lock: SerialLock::new(),
            options,
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Is an operation running right now?
    pub fn is_busy(&self) -> bool {
        self.lock.is_locked()
    }

    /// Number of operations waiting for their turn.
    pub fn pending(&self) -> usize {
        self.lock.waiting()
    }

    /// Run one statement in its own transaction.
    ///
    /// Resolves to `None` when the engine reported no result at all, which
    /// is distinct from a result with zero rows.
    pub async fn query(
        &self,
        cx: &Cx,
        sql: &str,
        values: &[Value],
    ) -> Outcome<Option<UniformResult>, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        tracing::debug!(sql = %sql, params = values.len(), "WebSQL query");
        coordinator::run_query(&self.engine, &self.lock, sql, values)
            .await
            .map_or_else(Outcome::Err, Outcome::Ok)
    }

    /// Run `body` inside one transaction.
    ///
    /// Statements issued through the handle run in that transaction. If the
    /// body returns an error, or any of its statements fails, nothing it did
    /// is kept and the body's error (or else the engine's) is returned.
    ///
    /// The body should only await its own statements. Awaiting anything
    /// else lets the engine commit underneath it, which is reported as a
    /// `BodyIncomplete` transaction error. A panicking body is rolled back
    /// and reported as a `BodyPanicked` transaction error.
    pub async fn transaction<F, Fut, T>(&self, cx: &Cx, body: F) -> Outcome<T, Error>
    where
        F: FnOnce(TransactionHandle<E::Transaction>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        coordinator::run_transaction(&self.engine, &self.lock, body)
            .await
            .map_or_else(Outcome::Err, Outcome::Ok)
    }
}
