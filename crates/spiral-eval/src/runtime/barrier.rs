//! Fork-join barrier.
//!
//! Created with a positive count. Each `wait` decrements the remaining
//! count; the waiter that brings it to zero releases every queued waiter in
//! FIFO order and re-arms the barrier for the next generation.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

struct BarrierState {
    count: usize,
    remaining: usize,
    generation: u64,
    waiters: VecDeque<Rc<Cell<bool>>>,
}

/// A cooperative fork-join barrier. Clones share the same state.
#[derive(Clone)]
pub struct Barrier {
    state: Rc<RefCell<BarrierState>>,
}

impl Barrier {
    /// Creates a barrier for `count` participants; a zero count behaves as
    /// one.
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        Barrier {
            state: Rc::new(RefCell::new(BarrierState {
                count,
                remaining: count,
                generation: 0,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Suspends until `count` waiters have arrived. The final arrival
    /// releases everyone (queued waiters first, in arrival order) and
    /// starts the next generation.
    pub fn wait(&self) -> BarrierWait {
        BarrierWait {
            state: self.state.clone(),
            flag: None,
        }
    }

    /// Re-arms the barrier with a new count. Waiters already queued keep
    /// waiting for the new generation to fill.
    pub fn reset(&self, count: usize) {
        let mut state = self.state.borrow_mut();
        state.count = count.max(1);
        state.remaining = state.count;
    }

    pub fn waiting(&self) -> usize {
        self.state.borrow().waiters.len()
    }

    pub fn generation(&self) -> u64 {
        self.state.borrow().generation
    }
}

/// Future returned by [`Barrier::wait`].
pub struct BarrierWait {
    state: Rc<RefCell<BarrierState>>,
    flag: Option<Rc<Cell<bool>>>,
}

impl Future for BarrierWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(flag) = &this.flag {
            return if flag.get() {
                Poll::Ready(())
            } else {
                Poll::Pending
            };
        }

        let mut state = this.state.borrow_mut();
        state.remaining -= 1;
        if state.remaining == 0 {
            // Last arrival: release everyone in FIFO order and re-arm.
            for waiter in state.waiters.drain(..) {
                waiter.set(true);
            }
            state.remaining = state.count;
            state.generation += 1;
            Poll::Ready(())
        } else {
            let flag = Rc::new(Cell::new(false));
            state.waiters.push_back(flag.clone());
            this.flag = Some(flag);
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::scheduler::Scheduler;
    use spiral_core::value::Value;

    #[test]
    fn all_waiters_release_when_the_last_arrives() {
        let scheduler = Scheduler::new();
        let barrier = Barrier::new(3);
        let order: Rc<RefCell<Vec<u64>>> = Rc::default();

        let mut ids = Vec::new();
        for i in 0..3u64 {
            let b = barrier.clone();
            let o = order.clone();
            ids.push(scheduler.spawn(async move {
                b.wait().await;
                o.borrow_mut().push(i);
                Value::Void
            }));
        }
        // The first two are parked until the third arrives.
        assert!(!scheduler.is_complete(ids[0]));
        assert!(!scheduler.is_complete(ids[1]));

        let handle = scheduler.clone();
        scheduler.run(async move {
            for id in ids {
                handle.await_task(id).await;
            }
            Value::Void
        });
        // FIFO release: queued waiters resume in arrival order; the final
        // arrival continues after them in its own poll.
        assert_eq!(order.borrow().as_slice(), [2, 0, 1]);
        assert_eq!(barrier.generation(), 1);
        assert_eq!(barrier.waiting(), 0);
    }

    #[test]
    fn barrier_rearms_for_the_next_generation() {
        let scheduler = Scheduler::new();
        let barrier = Barrier::new(2);

        for _ in 0..2 {
            let mut ids = Vec::new();
            for _ in 0..2 {
                let b = barrier.clone();
                ids.push(scheduler.spawn(async move {
                    b.wait().await;
                    Value::Void
                }));
            }
            let handle = scheduler.clone();
            scheduler.run(async move {
                for id in ids {
                    handle.await_task(id).await;
                }
                Value::Void
            });
        }
        assert_eq!(barrier.generation(), 2);
    }

    #[test]
    fn reset_changes_the_required_count() {
        let barrier = Barrier::new(5);
        barrier.reset(1);
        let scheduler = Scheduler::new();
        let b = barrier.clone();
        let out = scheduler.run(async move {
            b.wait().await;
            Value::Int(1)
        });
        assert_eq!(out, Value::Int(1));
    }

    #[test]
    fn zero_count_behaves_as_one() {
        let barrier = Barrier::new(0);
        let scheduler = Scheduler::new();
        let b = barrier.clone();
        let out = scheduler.run(async move {
            b.wait().await;
            Value::Void
        });
        assert_eq!(out, Value::Void);
    }
}
