//! FIFO serialization lock.
//!
//! At most one logical operation holds the lock. Waiters are served in
//! arrival order, and releasing hands holdership straight to the front
//! waiter, so the lock never looks free while someone is queued.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

/// An async mutual-exclusion lock with strict FIFO hand-off.
#[derive(Debug, Default)]
pub struct SerialLock {
    state: Mutex<LockState>,
}

#[derive(Debug, Default)]
struct LockState {
    held: bool,
    next_ticket: u64,
    waiters: VecDeque<Waiter>,
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    waker: Option<Waker>,
    granted: bool,
}

impl SerialLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for holdership.
    ///
    /// Dropping the returned future before it resolves gives up the place
    /// in the queue (or passes holdership on if it was already granted).
    pub fn acquire(&self) -> Acquire<'_> {
        Acquire {
            lock: self,
            ticket: None,
        }
    }

    /// Is the lock currently held (or granted to a waiter)?
    pub fn is_locked(&self) -> bool {
        self.state().held
    }

    /// Number of queued waiters.
    pub fn waiting(&self) -> usize {
        self.state().waiters.len()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pass holdership to the front waiter, or free the lock.
    fn release(&self) {
        let waker = {
            let mut state = self.state();
            Self::hand_off(&mut state)
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn hand_off(state: &mut LockState) -> Option<Waker> {
        match state.waiters.front_mut() {
            Some(next) => {
                tracing::trace!(ticket = next.ticket, "Serial lock handed off");
                next.granted = true;
                next.waker.take()
            }
            None => {
                state.held = false;
                None
            }
        }
    }
}

/// Future returned by [`SerialLock::acquire`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Acquire<'a> {
    lock: &'a SerialLock,
    ticket: Option<u64>,
}

impl<'a> Future for Acquire<'a> {
    type Output = SerialGuard<'a>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let lock = self.lock;
        let mut state = lock.state();

        let Some(ticket) = self.ticket else {
            if !state.held && state.waiters.is_empty() {
                state.held = true;
                return Poll::Ready(SerialGuard { lock });
            }
            let ticket = state.next_ticket;
            state.next_ticket = state.next_ticket.wrapping_add(1);
            state.waiters.push_back(Waiter {
                ticket,
                waker: Some(cx.waker().clone()),
                granted: false,
            });
            tracing::trace!(ticket, queued = state.waiters.len(), "Waiting for serial lock");
            drop(state);
            self.ticket = Some(ticket);
            return Poll::Pending;
        };

        let Some(index) = state.waiters.iter().position(|w| w.ticket == ticket) else {
            // Only this future removes its own entry.
            unreachable!("serial lock waiter {ticket} vanished");
        };

        if state.waiters[index].granted {
            state.waiters.remove(index);
            drop(state);
            self.ticket = None;
            return Poll::Ready(SerialGuard { lock });
        }

        let waiter = &mut state.waiters[index];
        match &waiter.waker {
            Some(w) if w.will_wake(cx.waker()) => {}
            _ => waiter.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        let Some(ticket) = self.ticket.take() else {
            return;
        };
        let waker = {
            let mut state = self.lock.state();
            let Some(index) = state.waiters.iter().position(|w| w.ticket == ticket) else {
                return;
            };
            let waiter = state.waiters.remove(index);
            match waiter {
                Some(w) if w.granted => {
                    tracing::trace!(ticket, "Granted waiter dropped; passing the lock on");
                    SerialLock::hand_off(&mut state)
                }
                _ => None,
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Proof of holdership. Dropping it releases the lock.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SerialGuard<'a> {
    lock: &'a SerialLock,
}

impl Drop for SerialGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Wake;

    #[derive(Default)]
    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn poll_once<F: Future + Unpin>(fut: &mut F, waker: &Waker) -> Poll<F::Output> {
        Pin::new(fut).poll(&mut Context::from_waker(waker))
    }

    #[test]
    fn uncontended_acquire_is_immediate() {
        let lock = SerialLock::new();
        let mut acquire = lock.acquire();
        let Poll::Ready(guard) = poll_once(&mut acquire, Waker::noop()) else {
            panic!("expected immediate acquisition");
        };
        assert!(lock.is_locked());
        drop(guard);
        assert!(!lock.is_locked());
    }

    #[test]
    fn waiters_are_served_in_arrival_order() {
        let lock = SerialLock::new();
        let noop = Waker::noop();

        let mut first = lock.acquire();
        let Poll::Ready(guard) = poll_once(&mut first, noop) else {
            panic!("first acquire should succeed");
        };

        let mut second = lock.acquire();
        let mut third = lock.acquire();
        assert!(poll_once(&mut second, noop).is_pending());
        assert!(poll_once(&mut third, noop).is_pending());
        assert_eq!(lock.waiting(), 2);

        drop(guard);
        assert!(lock.is_locked(), "hand-off must not free the lock");

        // Third polls first but is still behind second.
        assert!(poll_once(&mut third, noop).is_pending());
        let Poll::Ready(second_guard) = poll_once(&mut second, noop) else {
            panic!("second should hold the lock");
        };
        assert!(poll_once(&mut third, noop).is_pending());

        drop(second_guard);
        let Poll::Ready(third_guard) = poll_once(&mut third, noop) else {
            panic!("third should hold the lock");
        };
        drop(third_guard);
        assert!(!lock.is_locked());
        assert_eq!(lock.waiting(), 0);
    }

    #[test]
    fn newcomers_cannot_barge_past_granted_waiter() {
        let lock = SerialLock::new();
        let noop = Waker::noop();

        let mut first = lock.acquire();
        let Poll::Ready(guard) = poll_once(&mut first, noop) else {
            panic!("first acquire should succeed");
        };
        let mut second = lock.acquire();
        assert!(poll_once(&mut second, noop).is_pending());
        drop(guard);

        let mut late = lock.acquire();
        assert!(poll_once(&mut late, noop).is_pending());
        assert!(poll_once(&mut second, noop).is_ready());
    }

    #[test]
    fn release_wakes_the_next_waiter() {
        let lock = SerialLock::new();
        let counter = Arc::new(CountingWaker::default());
        let waker = Waker::from(Arc::clone(&counter));

        let mut first = lock.acquire();
        let Poll::Ready(guard) = poll_once(&mut first, Waker::noop()) else {
            panic!("first acquire should succeed");
        };
        let mut second = lock.acquire();
        assert!(poll_once(&mut second, &waker).is_pending());
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        drop(guard);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_waiter_leaves_the_queue() {
        let lock = SerialLock::new();
        let noop = Waker::noop();

        let mut first = lock.acquire();
        let Poll::Ready(guard) = poll_once(&mut first, noop) else {
            panic!("first acquire should succeed");
        };
        let mut second = lock.acquire();
        let mut third = lock.acquire();
        assert!(poll_once(&mut second, noop).is_pending());
        assert!(poll_once(&mut third, noop).is_pending());

        drop(second);
        assert_eq!(lock.waiting(), 1);

        drop(guard);
        assert!(poll_once(&mut third, noop).is_ready());
    }

    #[test]
    fn dropped_granted_waiter_passes_the_lock_on() {
        let lock = SerialLock::new();
        let noop = Waker::noop();

        let mut first = lock.acquire();
        let Poll::Ready(guard) = poll_once(&mut first, noop) else {
            panic!("first acquire should succeed");
        };
        let mut second = lock.acquire();
        let mut third = lock.acquire();
        assert!(poll_once(&mut second, noop).is_pending());
        assert!(poll_once(&mut third, noop).is_pending());

        drop(guard);
        drop(second);
        assert!(lock.is_locked());
        let Poll::Ready(third_guard) = poll_once(&mut third, noop) else {
            panic!("third should inherit the lock");
        };
        drop(third_guard);

        let mut last = lock.acquire();
        let Poll::Ready(last_guard) = poll_once(&mut last, noop) else {
            panic!("lock should be free again");
        };
        drop(last_guard);

        let mut lone = lock.acquire();
        assert!(poll_once(&mut lone, noop).is_ready());
    }

    #[test]
    fn dropping_the_only_granted_waiter_frees_the_lock() {
        let lock = SerialLock::new();
        let noop = Waker::noop();
        let mut first = lock.acquire();
        let Poll::Ready(guard) = poll_once(&mut first, noop) else {
            panic!("first acquire should succeed");
        };
        let mut second = lock.acquire();
        assert!(poll_once(&mut second, noop).is_pending());
        drop(guard);
        drop(second);
        assert!(!lock.is_locked());
    }
}
