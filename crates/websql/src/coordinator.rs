//! Transaction coordination over a callback engine.
//!
//! Every operation holds the [`SerialLock`] for its whole lifetime and maps
//! onto exactly one physical engine transaction.
//!
//! A transaction body is an ordinary future. It is driven from the engine's
//! own callbacks: polled once the physical transaction opens and again
//! whenever one of its statements completes (through its waker). That keeps
//! the statement queue non-empty for as long as the body is making progress
//! through its own statements, so the engine does not commit underneath it.
//!
//! When the body fails, the transaction must roll back although the engine
//! only rolls back on a failing statement. The coordinator asks for a native
//! abort and, failing that, queues [`FORCED_ABORT_SQL`].

use crate::completion::{Completer, completion};
use crate::handle::{TransactionHandle, TxnContext};
use crate::lock::SerialLock;
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll, Wake, Waker};
use websql_core::{
    Engine, EngineTransaction, Error, Result, StatementErrorAction, TransactionError,
    TransactionErrorKind, UniformResult, Value, codec, normalize_result,
};

/// A statement no engine accepts, used to force a rollback.
pub const FORCED_ABORT_SQL: &str = "!force rollback!";

static NEXT_OPERATION: AtomicU64 = AtomicU64::new(1);

fn next_operation() -> u64 {
    NEXT_OPERATION.fetch_add(1, Ordering::Relaxed)
}

type ResultSetOf<E> = <<E as Engine>::Transaction as EngineTransaction>::ResultSet;

/// Lifecycle of one logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    Idle,
    LockAcquired,
    PhysicalTxnOpen,
    BodyRunning,
    CommitPending,
    AbortForced,
    Committed,
    Aborted,
    LockReleased,
}

impl TransactionPhase {
    /// Is `next` a legal successor of this phase?
    pub fn can_advance_to(self, next: TransactionPhase) -> bool {
        use TransactionPhase::{
            AbortForced, Aborted, BodyRunning, CommitPending, Committed, Idle, LockAcquired,
            LockReleased, PhysicalTxnOpen,
        };
        matches!(
            (self, next),
            (Idle, LockAcquired)
                | (LockAcquired, PhysicalTxnOpen | Aborted)
                | (PhysicalTxnOpen, BodyRunning | Committed | Aborted)
                | (BodyRunning, CommitPending | AbortForced | Committed | Aborted)
                | (CommitPending | AbortForced, Committed | Aborted)
                | (Committed | Aborted, LockReleased)
        )
    }

    /// Has the physical transaction ended?
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            TransactionPhase::Committed | TransactionPhase::Aborted | TransactionPhase::LockReleased
        )
    }
}

fn log_phase(op: u64, from: TransactionPhase, to: TransactionPhase) {
    debug_assert!(
        from.can_advance_to(to),
        "illegal transaction phase change {from:?} -> {to:?}"
    );
    tracing::debug!(op, from = ?from, to = ?to, "Transaction phase");
}

/// Run one statement in its own physical transaction.
pub(crate) async fn run_query<E: Engine>(
    engine: &E,
    lock: &SerialLock,
    sql: &str,
    values: &[Value],
) -> Result<Option<UniformResult>> {
    let op = next_operation();
    let guard = lock.acquire().await;
    log_phase(op, TransactionPhase::Idle, TransactionPhase::LockAcquired);

    let params = codec::encode(values);
    let sql = sql.to_string();
    let (completer, done) = completion::<Option<UniformResult>>();
    let native: Arc<Mutex<Option<ResultSetOf<E>>>> = Arc::new(Mutex::new(None));

    let on_open = {
        let completer = completer.clone();
        let native = Arc::clone(&native);
        move |tx: &E::Transaction| {
            log_phase(
                op,
                TransactionPhase::LockAcquired,
                TransactionPhase::PhysicalTxnOpen,
            );
            let submitted = tx.execute_sql(
                &sql,
                params,
                Box::new(move |_: &E::Transaction, result: ResultSetOf<E>| {
                    *native.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
                }),
                Box::new(|_: &E::Transaction, _: &Error| StatementErrorAction::Abort),
            );
            if let Err(err) = submitted {
                completer.complete(Err(err));
            }
        }
    };
    let on_error = {
        let completer = completer.clone();
        move |err: Error| {
            tracing::debug!(op, error = %err, "Query rolled back");
            completer.complete(Err(err));
        }
    };
    let on_success = move || {
        let result = native.lock().unwrap_or_else(|e| e.into_inner()).take();
        completer.complete(Ok(normalize_result(result.as_ref())));
    };

    engine.transaction(
        Box::new(on_open),
        Box::new(on_error),
        Box::new(on_success),
    );

    let result = done.await;
    let settled = if result.is_ok() {
        TransactionPhase::Committed
    } else {
        TransactionPhase::Aborted
    };
    drop(guard);
    log_phase(op, settled, TransactionPhase::LockReleased);
    result
}

/// Run a transaction body inside one physical transaction.
pub(crate) async fn run_transaction<E, F, Fut, T>(
    engine: &E,
    lock: &SerialLock,
    body: F,
) -> Result<T>
where
    E: Engine,
    F: FnOnce(TransactionHandle<E::Transaction>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let op = next_operation();
    let guard = lock.acquire().await;

    let (completer, done) = completion::<T>();
    let start: BodyStart<E::Transaction, T> =
        Box::new(move |handle: TransactionHandle<E::Transaction>| -> BoxedBody<T> {
            Box::pin(body(handle))
        });
    let driver = BodyDriver::new(op, start, completer);
    let on_open = Arc::clone(&driver);
    let on_error = Arc::clone(&driver);
    let on_success = driver;

    engine.transaction(
        Box::new(move |tx: &E::Transaction| on_open.open(tx)),
        Box::new(move |err: Error| on_error.engine_error(err)),
        Box::new(move || on_success.engine_success()),
    );

    let result = done.await;
    let settled = if result.is_ok() {
        TransactionPhase::Committed
    } else {
        TransactionPhase::Aborted
    };
    drop(guard);
    log_phase(op, settled, TransactionPhase::LockReleased);
    result
}

type BoxedBody<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;
type BodyStart<Tx, T> = Box<dyn FnOnce(TransactionHandle<Tx>) -> BoxedBody<T> + Send>;

/// Drives a transaction body from engine callbacks.
struct BodyDriver<Tx: EngineTransaction, T> {
    op: u64,
    state: Mutex<DriverState<Tx, T>>,
}

struct DriverState<Tx: EngineTransaction, T> {
    phase: TransactionPhase,
    start: Option<BodyStart<Tx, T>>,
    /// `None` while being polled or once finished.
    body: Option<BoxedBody<T>>,
    /// The body's own result.
    outcome: Option<Result<T>>,
    finished: bool,
    tx: Option<Tx>,
    /// A rollback is already on its way.
    aborted: bool,
    closed: bool,
    polling: bool,
    notified: bool,
    completer: Option<Completer<T>>,
}

impl<Tx: EngineTransaction, T: Send + 'static> BodyDriver<Tx, T> {
    fn new(op: u64, start: BodyStart<Tx, T>, completer: Completer<T>) -> Arc<Self> {
        log_phase(op, TransactionPhase::Idle, TransactionPhase::LockAcquired);
        Arc::new(Self {
            op,
            state: Mutex::new(DriverState {
                phase: TransactionPhase::LockAcquired,
                start: Some(start),
                body: None,
                outcome: None,
                finished: false,
                tx: None,
                aborted: false,
                closed: false,
                polling: false,
                notified: false,
                completer: Some(completer),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, DriverState<Tx, T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn advance(&self, state: &mut DriverState<Tx, T>, next: TransactionPhase) {
        log_phase(self.op, state.phase, next);
        state.phase = next;
    }

    /// Transaction callback: start the body.
    fn open(self: &Arc<Self>, tx: &Tx) {
        let start = {
            let mut state = self.state();
            state.tx = Some(tx.clone());
            self.advance(&mut state, TransactionPhase::PhysicalTxnOpen);
            state.start.take()
        };
        let Some(start) = start else {
            return;
        };

        let weak: Weak<dyn TxnContext<Tx>> = Arc::downgrade(self) as Weak<dyn TxnContext<Tx>>;
        let body = start(TransactionHandle::new(self.op, weak));

        {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.body = Some(body);
            self.advance(&mut state, TransactionPhase::BodyRunning);
        }
        self.drive();
    }

    /// Poll the body until it stops making progress.
    ///
    /// Re-entrant calls (a wake while the body is being polled) only leave a
    /// note for the running loop.
    fn drive(self: &Arc<Self>) {
        {
            let mut state = self.state();
            if state.polling {
                state.notified = true;
                return;
            }
            if state.body.is_none() {
                return;
            }
            state.polling = true;
        }

        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);

        loop {
            let body = {
                let mut state = self.state();
                state.notified = false;
                state.body.take()
            };
            let Some(mut body) = body else {
                self.state().polling = false;
                return;
            };

            let polled = panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(&mut cx)))
                .unwrap_or_else(|payload| Poll::Ready(Err(body_panicked(payload.as_ref()))));
            match polled {
                Poll::Ready(result) => {
                    drop(body);
                    self.state().polling = false;
                    self.finish(result);
                    return;
                }
                Poll::Pending => {
                    let mut state = self.state();
                    if state.closed {
                        state.polling = false;
                        drop(state);
                        drop(body);
                        return;
                    }
                    state.body = Some(body);
                    if !state.notified {
                        state.polling = false;
                        return;
                    }
                }
            }
        }
    }

    /// The body returned.
    fn finish(&self, result: Result<T>) {
        let abort_tx = {
            let mut state = self.state();
            state.finished = true;
            let abort_tx = match &result {
                Ok(_) => {
                    if !state.closed {
                        self.advance(&mut state, TransactionPhase::CommitPending);
                    }
                    None
                }
                Err(err) => {
                    tracing::debug!(op = self.op, error = %err, "Transaction body failed");
                    if state.aborted || state.closed {
                        None
                    } else {
                        state.aborted = true;
                        self.advance(&mut state, TransactionPhase::AbortForced);
                        state.tx.clone()
                    }
                }
            };
            state.outcome = Some(result);
            abort_tx
        };

        if let Some(tx) = abort_tx {
            self.force_abort(&tx);
        }
    }

    fn force_abort(&self, tx: &Tx) {
        if tx.abort() {
            tracing::debug!(op = self.op, "Native abort requested");
            return;
        }
        tracing::debug!(op = self.op, sql = FORCED_ABORT_SQL, "Forcing rollback");
        let submitted = tx.execute_sql(
            FORCED_ABORT_SQL,
            Vec::new(),
            Box::new(|_: &Tx, _: Tx::ResultSet| {}),
            Box::new(|_: &Tx, _: &Error| StatementErrorAction::Abort),
        );
        if let Err(err) = submitted {
            tracing::warn!(op = self.op, error = %err, "Could not force a rollback");
        }
    }

    /// Error callback: the physical transaction rolled back.
    fn engine_error(&self, err: Error) {
        let (completer, leftovers, result) = {
            let mut state = self.state();
            state.closed = true;
            state.tx = None;
            self.advance(&mut state, TransactionPhase::Aborted);
            let result = match state.outcome.take() {
                Some(Err(body_err)) if !is_abort_fallout(&body_err) => Err(body_err),
                _ => Err(err),
            };
            let leftovers = (state.body.take(), state.start.take());
            (state.completer.take(), leftovers, result)
        };
        drop(leftovers);
        if let Some(completer) = completer {
            completer.complete(result);
        }
    }

    /// Success callback: the physical transaction committed.
    fn engine_success(&self) {
        let (completer, leftovers, result) = {
            let mut state = self.state();
            state.closed = true;
            state.tx = None;
            self.advance(&mut state, TransactionPhase::Committed);
            let result = match state.outcome.take() {
                Some(Ok(value)) => Ok(value),
                Some(Err(err)) => {
                    tracing::warn!(op = self.op, error = %err, "Engine committed a failed body");
                    Err(err)
                }
                None => Err(Error::Transaction(TransactionError::new(
                    TransactionErrorKind::BodyIncomplete,
                    "the transaction committed while its body was still waiting",
                ))),
            };
            let leftovers = (state.body.take(), state.start.take());
            (state.completer.take(), leftovers, result)
        };
        drop(leftovers);
        if let Some(completer) = completer {
            completer.complete(result);
        }
    }
}

/// Turn a body panic into an ordinary body failure.
fn body_panicked(payload: &(dyn Any + Send)) -> Error {
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload");
    tracing::warn!(panic = message, "Transaction body panicked");
    Error::Transaction(TransactionError::new(
        TransactionErrorKind::BodyPanicked,
        format!("transaction body panicked: {message}"),
    ))
}

/// Errors a body only sees because the transaction was already going down.
fn is_abort_fallout(err: &Error) -> bool {
    err.is_transaction(TransactionErrorKind::Discarded)
        || err.is_transaction(TransactionErrorKind::Closed)
}

impl<Tx: EngineTransaction, T: Send + 'static> Wake for BodyDriver<Tx, T> {
    fn wake(self: Arc<Self>) {
        self.drive();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.drive();
    }
}

impl<Tx: EngineTransaction, T: Send + 'static> TxnContext<Tx> for BodyDriver<Tx, T> {
    fn transaction(&self) -> Result<Tx> {
        let state = self.state();
        if state.finished {
            return Err(Error::Transaction(TransactionError::new(
                TransactionErrorKind::HandleExpired,
                "transaction handle used after its body finished",
            )));
        }
        match (&state.tx, state.closed) {
            (Some(tx), false) => Ok(tx.clone()),
            _ => Err(Error::Transaction(TransactionError::new(
                TransactionErrorKind::Closed,
                "the transaction is no longer open",
            ))),
        }
    }

    fn statement_failed(&self) {
        let mut state = self.state();
        if !state.aborted {
            tracing::debug!(op = self.op, "Statement failed; transaction will roll back");
            state.aborted = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_transitions() {
        use TransactionPhase::*;
        assert!(Idle.can_advance_to(LockAcquired));
        assert!(BodyRunning.can_advance_to(AbortForced));
        assert!(AbortForced.can_advance_to(Aborted));
        assert!(Committed.can_advance_to(LockReleased));
        assert!(!Idle.can_advance_to(Committed));
        assert!(!LockReleased.can_advance_to(LockAcquired));
        assert!(!Committed.can_advance_to(Aborted));
    }

    #[test]
    fn settled_phases() {
        assert!(TransactionPhase::Aborted.is_settled());
        assert!(!TransactionPhase::BodyRunning.is_settled());
    }

    #[test]
    fn forced_abort_sql_is_not_sql() {
        assert!(!FORCED_ABORT_SQL.is_empty());
        assert!(FORCED_ABORT_SQL.starts_with('!'));
    }

    #[test]
    fn fallout_errors() {
        let discarded = Error::Transaction(TransactionError::new(
            TransactionErrorKind::Discarded,
            "gone",
        ));
        assert!(is_abort_fallout(&discarded));
        assert!(!is_abort_fallout(&Error::custom("body error")));
    }

    #[test]
    fn panic_payloads_become_body_errors() {
        let err = body_panicked(&"boom");
        assert!(err.is_transaction(TransactionErrorKind::BodyPanicked));
        assert!(err.to_string().contains("boom"));

        let err = body_panicked(&String::from("owned boom"));
        assert!(err.to_string().contains("owned boom"));

        let err = body_panicked(&42_u32);
        assert!(err.is_transaction(TransactionErrorKind::BodyPanicked));
        assert!(!is_abort_fallout(&err));
    }
}
