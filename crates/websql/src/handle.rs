//! The capability handed to transaction bodies.

use crate::completion::completion;
use std::fmt;
use std::sync::Weak;
use websql_core::{
    EngineTransaction, Error, Result, StatementErrorAction, TransactionError,
    TransactionErrorKind, UniformResult, Value, codec, normalize_result,
};

/// What a handle needs from the transaction it belongs to.
pub(crate) trait TxnContext<Tx>: Send + Sync {
    /// The open engine transaction, or why it cannot be used.
    fn transaction(&self) -> Result<Tx>;

    /// A statement of this transaction failed; the engine will roll back.
    fn statement_failed(&self);
}

/// Runs statements inside the physical transaction of a
/// [`crate::Connection::transaction`] body.
///
/// The handle stops working once the body has finished or the physical
/// transaction has closed.
pub struct TransactionHandle<Tx: EngineTransaction> {
    op: u64,
    ctx: Weak<dyn TxnContext<Tx>>,
}

impl<Tx: EngineTransaction> TransactionHandle<Tx> {
    pub(crate) fn new(op: u64, ctx: Weak<dyn TxnContext<Tx>>) -> Self {
        Self { op, ctx }
    }

    /// Run a statement inside this transaction.
    ///
    /// A failing statement dooms the whole transaction: the error is
    /// returned here and the transaction rolls back even if the body
    /// carries on.
    pub async fn query(&self, sql: &str, values: &[Value]) -> Result<Option<UniformResult>> {
        let tx = self
            .ctx
            .upgrade()
            .ok_or_else(expired)
            .and_then(|ctx| ctx.transaction())?;

        tracing::trace!(op = self.op, sql = %sql, params = values.len(), "Transaction statement");

        let (completer, done) = completion::<Option<UniformResult>>();
        let on_error_completer = completer.clone();
        let ctx = self.ctx.clone();

        tx.execute_sql(
            sql,
            codec::encode(values),
            Box::new(move |_: &Tx, result: Tx::ResultSet| {
                completer.complete(Ok(normalize_result(Some(&result))));
            }),
            Box::new(move |_: &Tx, err: &Error| {
                // Marked before completing so the body never observes the
                // error while the transaction still looks healthy.
                if let Some(ctx) = ctx.upgrade() {
                    ctx.statement_failed();
                }
                on_error_completer.complete(Err(err.clone()));
                StatementErrorAction::Abort
            }),
        )?;

        done.await
    }

    /// Can this handle still run statements?
    pub fn is_active(&self) -> bool {
        self.ctx
            .upgrade()
            .is_some_and(|ctx| ctx.transaction().is_ok())
    }
}

fn expired() -> Error {
    Error::Transaction(TransactionError::new(
        TransactionErrorKind::HandleExpired,
        "transaction handle used after its transaction finished",
    ))
}

impl<Tx: EngineTransaction> Clone for TransactionHandle<Tx> {
    fn clone(&self) -> Self {
        Self {
            op: self.op,
            ctx: Weak::clone(&self.ctx),
        }
    }
}

impl<Tx: EngineTransaction> fmt::Debug for TransactionHandle<Tx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("op", &self.op)
            .field("active", &self.is_active())
            .finish()
    }
}
