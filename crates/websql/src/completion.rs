//! One-shot bridge from engine callbacks to futures.
//!
//! A [`Completer`] may be cloned into several callbacks; the first call to
//! [`Completer::complete`] wins. When every clone is dropped without
//! completing (the engine discarded the callbacks), the waiting future
//! resolves with a `Discarded` transaction error.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use websql_core::{Error, Result, TransactionError, TransactionErrorKind};

struct Slot<T> {
    value: Option<Result<T>>,
    waker: Option<Waker>,
    taken: bool,
}

type Shared<T> = Arc<Mutex<Slot<T>>>;

/// Create a linked completer and future.
pub(crate) fn completion<T>() -> (Completer<T>, Completion<T>) {
    let shared = Arc::new(Mutex::new(Slot {
        value: None,
        waker: None,
        taken: false,
    }));
    (
        Completer {
            inner: Arc::new(CompleterInner {
                shared: Arc::clone(&shared),
            }),
        },
        Completion { shared },
    )
}

fn fill<T>(shared: &Shared<T>, value: Result<T>) {
    let waker = {
        let mut slot = shared.lock().unwrap_or_else(|e| e.into_inner());
        if slot.value.is_some() || slot.taken {
            return;
        }
        slot.value = Some(value);
        slot.waker.take()
    };
    if let Some(waker) = waker {
        waker.wake();
    }
}

/// The sending half.
pub(crate) struct Completer<T> {
    inner: Arc<CompleterInner<T>>,
}

struct CompleterInner<T> {
    shared: Shared<T>,
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Completer<T> {
    /// Resolve the future. Later calls are ignored.
    pub(crate) fn complete(&self, value: Result<T>) {
        fill(&self.inner.shared, value);
    }
}

impl<T> Drop for CompleterInner<T> {
    fn drop(&mut self) {
        fill(
            &self.shared,
            Err(Error::Transaction(TransactionError::new(
                TransactionErrorKind::Discarded,
                "the engine dropped the operation before it completed",
            ))),
        );
    }
}

/// The receiving half.
#[must_use = "futures do nothing unless polled"]
pub(crate) struct Completion<T> {
    shared: Shared<T>,
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(value) = slot.value.take() {
            slot.taken = true;
            return Poll::Ready(value);
        }
        match &slot.waker {
            Some(w) if w.will_wake(cx.waker()) => {}
            _ => slot.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        // Release the waker so it cannot keep its owner alive.
        let mut slot = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        slot.waker = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll_now<T>(fut: &mut Completion<T>) -> Poll<Result<T>> {
        Pin::new(fut).poll(&mut Context::from_waker(Waker::noop()))
    }

    #[test]
    fn first_completion_wins() {
        let (completer, mut fut) = completion::<i32>();
        let other = completer.clone();
        assert!(poll_now(&mut fut).is_pending());
        completer.complete(Ok(1));
        other.complete(Ok(2));
        match poll_now(&mut fut) {
            Poll::Ready(Ok(v)) => assert_eq!(v, 1),
            _ => panic!("expected the first value"),
        }
    }

    #[test]
    fn dropping_all_completers_discards() {
        let (completer, mut fut) = completion::<()>();
        let other = completer.clone();
        drop(completer);
        assert!(poll_now(&mut fut).is_pending());
        drop(other);
        match poll_now(&mut fut) {
            Poll::Ready(Err(err)) => assert!(err.is_transaction(TransactionErrorKind::Discarded)),
            _ => panic!("expected a discarded error"),
        }
    }

    #[test]
    fn completing_then_dropping_keeps_the_value() {
        let (completer, mut fut) = completion::<&'static str>();
        completer.complete(Ok("done"));
        drop(completer);
        assert!(matches!(poll_now(&mut fut), Poll::Ready(Ok("done"))));
    }
}
