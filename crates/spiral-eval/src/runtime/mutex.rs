//! Cooperative mutex with a FIFO waiter queue.
//!
//! Acquisition order is ticket-based: a contended acquire takes a ticket and
//! only the head ticket may take the lock once it is released. The guard
//! releases on drop, so `with_lock` releases on every exit path. Recursive
//! acquisition from the same task deadlocks; that is intentional.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

#[derive(Default)]
struct MutexState {
    locked: bool,
    queue: VecDeque<u64>,
    next_ticket: u64,
}

/// A single-threaded cooperative mutex.
#[derive(Clone, Default)]
pub struct CoMutex {
    state: Rc<RefCell<MutexState>>,
}

impl CoMutex {
    pub fn new() -> Self {
        CoMutex::default()
    }

    pub fn is_locked(&self) -> bool {
        self.state.borrow().locked
    }

    pub fn waiting(&self) -> usize {
        self.state.borrow().queue.len()
    }

    /// Resolves to a guard once this caller holds the lock.
    pub fn acquire(&self) -> Acquire {
        Acquire {
            state: self.state.clone(),
            ticket: None,
        }
    }

    /// Acquires, runs `f`, and releases -- also on error-value returns,
    /// since the guard drops either way.
    pub async fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.acquire().await;
        f()
    }
}

/// Future returned by [`CoMutex::acquire`].
pub struct Acquire {
    state: Rc<RefCell<MutexState>>,
    ticket: Option<u64>,
}

impl Future for Acquire {
    type Output = CoMutexGuard;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.state.borrow_mut();
        match this.ticket {
            None => {
                if !state.locked && state.queue.is_empty() {
                    state.locked = true;
                    return Poll::Ready(CoMutexGuard {
                        state: this.state.clone(),
                    });
                }
                let ticket = state.next_ticket;
                state.next_ticket += 1;
                state.queue.push_back(ticket);
                this.ticket = Some(ticket);
                Poll::Pending
            }
            Some(ticket) => {
                if !state.locked && state.queue.front() == Some(&ticket) {
                    state.queue.pop_front();
                    state.locked = true;
                    return Poll::Ready(CoMutexGuard {
                        state: this.state.clone(),
                    });
                }
                Poll::Pending
            }
        }
    }
}

/// Lock guard; releases the mutex on drop.
pub struct CoMutexGuard {
    state: Rc<RefCell<MutexState>>,
}

impl Drop for CoMutexGuard {
    fn drop(&mut self) {
        self.state.borrow_mut().locked = false;
    }
}
