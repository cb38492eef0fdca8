//! Cooperative task scheduler.
//!
//! A single-threaded polling executor over boxed local futures. Tasks never
//! run in parallel; they interleave at suspension points (channel and mutex
//! waits, barrier waits, explicit yields from the step checkpoint). The
//! executor re-polls runnable tasks every scheduling round, so primitives do
//! not need real wakers -- a blocked future simply stays pending until the
//! shared state it watches changes.
//!
//! The scheduling discipline is a [`ScheduleMode`]:
//! - `Parallel` -- round-robin over live tasks in spawn order, optionally
//!   shuffled by a seeded RNG for deterministic stress interleavings;
//! - `Sequential` -- tasks run in spawn order, one at a time;
//! - `BreadthFirst` -- all currently queued tasks as a wave, then the wave
//!   of tasks they spawned;
//! - `DepthFirst` -- the most recently spawned live task first.
//!
//! A global step budget bounds every run; exhaustion surfaces as a
//! `GlobalStepLimit` error value rather than a hang.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;
use futures::task::noop_waker_ref;
use futures::FutureExt;
use indexmap::IndexMap;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::trace;

use spiral_core::error::ErrorCode;
use spiral_core::value::{ErrorValue, TaskId, Value};

/// Steps between cooperative yields injected by [`Scheduler::checkpoint`].
pub const DEFAULT_YIELD_INTERVAL: u64 = 100;
/// Default global step budget.
pub const DEFAULT_GLOBAL_MAX_STEPS: u64 = 1_000_000;

/// The task id the main program runs under.
pub const MAIN_TASK: TaskId = TaskId(0);

/// Scheduling discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    /// Cooperative round-robin interleaving; `seed` shuffles the per-round
    /// polling order deterministically.
    Parallel { seed: Option<u64> },
    /// Run tasks in spawn order to completion, one at a time.
    Sequential,
    /// Execute all currently queued tasks as a batch, then the next wave.
    BreadthFirst,
    /// Last spawned runs first.
    DepthFirst,
}

impl Default for ScheduleMode {
    fn default() -> Self {
        ScheduleMode::Parallel { seed: None }
    }
}

enum TaskState {
    Running,
    Done(Value),
    Cancelled,
}

struct TaskEntry {
    future: Option<LocalBoxFuture<'static, Value>>,
    state: TaskState,
}

struct SchedulerInner {
    mode: ScheduleMode,
    tasks: IndexMap<TaskId, TaskEntry>,
    next_task: u64,
    global_steps: u64,
    yield_interval: u64,
    global_max_steps: u64,
    current: TaskId,
    disposed: bool,
    rng: Option<ChaCha8Rng>,
    /// Current breadth-first wave; refilled when it drains.
    wave: Vec<TaskId>,
}

/// Cheaply cloneable handle to the shared scheduler state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<RefCell<SchedulerInner>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler::with_mode(ScheduleMode::default())
    }

    pub fn with_mode(mode: ScheduleMode) -> Self {
        let rng = match mode {
            ScheduleMode::Parallel { seed: Some(seed) } => Some(ChaCha8Rng::seed_from_u64(seed)),
            _ => None,
        };
        Scheduler {
            inner: Rc::new(RefCell::new(SchedulerInner {
                mode,
                tasks: IndexMap::new(),
                next_task: 1,
                global_steps: 0,
                yield_interval: DEFAULT_YIELD_INTERVAL,
                global_max_steps: DEFAULT_GLOBAL_MAX_STEPS,
                current: MAIN_TASK,
                disposed: false,
                rng,
                wave: Vec::new(),
            })),
        }
    }

    pub fn with_step_budget(self, max_steps: u64) -> Self {
        self.inner.borrow_mut().global_max_steps = max_steps;
        self
    }

    pub fn with_yield_interval(self, interval: u64) -> Self {
        self.inner.borrow_mut().yield_interval = interval.max(1);
        self
    }

    /// Spawns a task. Under the default (`Parallel`) mode the task starts
    /// eagerly with one immediate poll, which avoids deadlocks in chained
    /// spawn/await patterns.
    pub fn spawn(&self, future: impl Future<Output = Value> + 'static) -> TaskId {
        let (id, eager) = {
            let mut inner = self.inner.borrow_mut();
            let id = TaskId(inner.next_task);
            inner.next_task += 1;
            let state = if inner.disposed {
                TaskState::Cancelled
            } else {
                TaskState::Running
            };
            let disposed = inner.disposed;
            inner.tasks.insert(
                id,
                TaskEntry {
                    future: (!disposed).then(|| future.boxed_local()),
                    state,
                },
            );
            let eager =
                !inner.disposed && matches!(inner.mode, ScheduleMode::Parallel { .. });
            (id, eager)
        };
        trace!(task = %id, "spawned");
        if eager {
            self.poll_task(id);
        }
        id
    }

    /// Future resolving to the task's result (`TaskCancelled` error for a
    /// cancelled or unknown task).
    pub fn await_task(&self, id: TaskId) -> AwaitTask {
        AwaitTask {
            scheduler: self.clone(),
            id,
        }
    }

    /// Marks the task failed with `TaskCancelled` and drops its body.
    pub fn cancel(&self, id: TaskId) {
        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.tasks.get_mut(&id) {
            if matches!(entry.state, TaskState::Running) {
                entry.state = TaskState::Cancelled;
                entry.future = None;
                trace!(task = %id, "cancelled");
            }
        }
    }

    pub fn is_complete(&self, id: TaskId) -> bool {
        let inner = self.inner.borrow();
        match inner.tasks.get(&id) {
            Some(entry) => !matches!(entry.state, TaskState::Running),
            None => true,
        }
    }

    pub fn current_task(&self) -> TaskId {
        self.inner.borrow().current
    }

    pub fn set_current_task(&self, id: TaskId) {
        self.inner.borrow_mut().current = id;
    }

    pub fn active_task_count(&self) -> usize {
        self.inner
            .borrow()
            .tasks
            .values()
            .filter(|t| matches!(t.state, TaskState::Running))
            .count()
    }

    pub fn global_steps(&self) -> u64 {
        self.inner.borrow().global_steps
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.borrow().disposed
    }

    /// Synchronous step accounting: increments the global counter and fails
    /// once the budget is exhausted.
    pub fn check_global_steps(&self) -> Result<(), ErrorValue> {
        let mut inner = self.inner.borrow_mut();
        inner.global_steps += 1;
        if inner.global_steps > inner.global_max_steps {
            return Err(ErrorValue::with_message(
                ErrorCode::GlobalStepLimit,
                format!("exceeded {} global steps", inner.global_max_steps),
            ));
        }
        Ok(())
    }

    /// Async step accounting: like [`Self::check_global_steps`], but also
    /// yields to the executor every `yield_interval` steps.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            scheduler: self.clone(),
            counted: false,
            yielded: false,
            need_yield: false,
        }
    }

    /// Cancels every task and makes later operations fail cleanly.
    pub fn dispose(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.disposed = true;
        for entry in inner.tasks.values_mut() {
            if matches!(entry.state, TaskState::Running) {
                entry.state = TaskState::Cancelled;
                entry.future = None;
            }
        }
    }

    /// Polls one task once. Returns `true` when the task is no longer
    /// runnable.
    fn poll_task(&self, id: TaskId) -> bool {
        let (mut future, previous) = {
            let mut inner = self.inner.borrow_mut();
            if inner.disposed {
                return true;
            }
            let Some(entry) = inner.tasks.get_mut(&id) else {
                return true;
            };
            if !matches!(entry.state, TaskState::Running) {
                return true;
            }
            let Some(future) = entry.future.take() else {
                // Already being polled further up the stack.
                return false;
            };
            let previous = std::mem::replace(&mut inner.current, id);
            (future, previous)
        };

        let waker = noop_waker_ref();
        let mut cx = Context::from_waker(waker);
        let poll = future.as_mut().poll(&mut cx);

        let mut inner = self.inner.borrow_mut();
        inner.current = previous;
        let Some(entry) = inner.tasks.get_mut(&id) else {
            return true;
        };
        match poll {
            Poll::Ready(value) => {
                trace!(task = %id, "completed");
                entry.state = TaskState::Done(value);
                true
            }
            Poll::Pending => {
                if matches!(entry.state, TaskState::Running) {
                    entry.future = Some(future);
                    false
                } else {
                    // Cancelled while running; drop the body.
                    true
                }
            }
        }
    }

    /// Task ids to poll this round, per the scheduling mode.
    fn schedule_order(&self) -> Vec<TaskId> {
        let mut inner = self.inner.borrow_mut();
        let live: Vec<TaskId> = inner
            .tasks
            .iter()
            .filter(|(_, t)| matches!(t.state, TaskState::Running))
            .map(|(id, _)| *id)
            .collect();

        match inner.mode {
            ScheduleMode::Parallel { seed: None } => live,
            ScheduleMode::Parallel { seed: Some(_) } => {
                let mut order = live;
                if let Some(rng) = inner.rng.as_mut() {
                    order.shuffle(rng);
                }
                order
            }
            ScheduleMode::Sequential => live.into_iter().take(1).collect(),
            ScheduleMode::DepthFirst => live.into_iter().next_back().into_iter().collect(),
            ScheduleMode::BreadthFirst => {
                inner.wave.retain(|id| live.contains(id));
                if inner.wave.is_empty() {
                    inner.wave = live;
                }
                inner.wave.clone()
            }
        }
    }

    /// Drives `main` (as the implicit task 0) together with every spawned
    /// task until `main` completes. Budget exhaustion returns a
    /// `GlobalStepLimit` error value.
    pub fn run(&self, main: impl Future<Output = Value> + 'static) -> Value {
        if self.inner.borrow().disposed {
            return Value::error_msg(ErrorCode::TaskCancelled, "scheduler is disposed");
        }
        let mut main = main.boxed_local();
        let waker = noop_waker_ref();

        loop {
            {
                let mut inner = self.inner.borrow_mut();
                inner.global_steps += 1;
                if inner.global_steps > inner.global_max_steps {
                    return Value::error_msg(
                        ErrorCode::GlobalStepLimit,
                        format!("exceeded {} global steps", inner.global_max_steps),
                    );
                }
                inner.current = MAIN_TASK;
            }

            let mut cx = Context::from_waker(waker);
            if let Poll::Ready(value) = main.as_mut().poll(&mut cx) {
                return value;
            }

            for id in self.schedule_order() {
                self.poll_task(id);
            }
        }
    }

    /// Runs every live task to completion without a main future; useful for
    /// draining detached work in tests.
    pub fn run_until_idle(&self) -> Result<(), ErrorValue> {
        while self.active_task_count() > 0 {
            self.check_global_steps()?;
            for id in self.schedule_order() {
                self.poll_task(id);
            }
        }
        Ok(())
    }
}

/// Future returned by [`Scheduler::await_task`].
pub struct AwaitTask {
    scheduler: Scheduler,
    id: TaskId,
}

impl Future for AwaitTask {
    type Output = Value;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let inner = this.scheduler.inner.borrow();
        if inner.disposed {
            return Poll::Ready(Value::error_msg(
                ErrorCode::TaskCancelled,
                "scheduler is disposed",
            ));
        }
        match inner.tasks.get(&this.id) {
            Some(entry) => match &entry.state {
                TaskState::Running => Poll::Pending,
                TaskState::Done(value) => Poll::Ready(value.clone()),
                TaskState::Cancelled => Poll::Ready(Value::error_msg(
                    ErrorCode::TaskCancelled,
                    format!("{} was cancelled", this.id),
                )),
            },
            None => Poll::Ready(Value::error_msg(
                ErrorCode::TaskCancelled,
                format!("{} is unknown", this.id),
            )),
        }
    }
}

/// Future returned by [`Scheduler::checkpoint`].
pub struct Checkpoint {
    scheduler: Scheduler,
    counted: bool,
    yielded: bool,
    need_yield: bool,
}

impl Future for Checkpoint {
    type Output = Result<(), ErrorValue>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.counted {
            this.counted = true;
            let mut inner = this.scheduler.inner.borrow_mut();
            inner.global_steps += 1;
            if inner.global_steps > inner.global_max_steps {
                return Poll::Ready(Err(ErrorValue::with_message(
                    ErrorCode::GlobalStepLimit,
                    format!("exceeded {} global steps", inner.global_max_steps),
                )));
            }
            this.need_yield = inner.global_steps % inner.yield_interval == 0;
        }
        if this.need_yield && !this.yielded {
            this.yielded = true;
            return Poll::Pending;
        }
        Poll::Ready(Ok(()))
    }
}

/// A future that is pending exactly once, handing the executor one
/// scheduling round.
pub fn yield_now() -> YieldNow {
    YieldNow { polled: false }
}

pub struct YieldNow {
    polled: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.polled {
            Poll::Ready(())
        } else {
            this.polled = true;
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_drives_main_to_completion() {
        let scheduler = Scheduler::new();
        let out = scheduler.run(async { Value::Int(7) });
        assert_eq!(out, Value::Int(7));
    }

    #[test]
    fn spawned_tasks_start_eagerly_in_parallel_mode() {
        let scheduler = Scheduler::new();
        let id = scheduler.spawn(async { Value::Int(1) });
        // Completed during the eager first poll, before any run loop.
        assert!(scheduler.is_complete(id));
    }

    #[test]
    fn await_returns_the_stored_result() {
        let scheduler = Scheduler::new();
        let id = scheduler.spawn(async { Value::Int(41) });
        let handle = scheduler.clone();
        let out = scheduler.run(async move { handle.await_task(id).await });
        assert_eq!(out, Value::Int(41));
    }

    #[test]
    fn awaiting_a_pending_task_interleaves() {
        let scheduler = Scheduler::new();
        let handle = scheduler.clone();
        let out = scheduler.run(async move {
            let id = handle.spawn(async {
                yield_now().await;
                yield_now().await;
                Value::Int(9)
            });
            handle.await_task(id).await
        });
        assert_eq!(out, Value::Int(9));
    }

    #[test]
    fn cancel_makes_await_fail() {
        let scheduler = Scheduler::new();
        let id = scheduler.spawn(async {
            yield_now().await;
            Value::Int(1)
        });
        scheduler.cancel(id);
        let handle = scheduler.clone();
        let out = scheduler.run(async move { handle.await_task(id).await });
        assert_eq!(out.as_error().unwrap().code, ErrorCode::TaskCancelled);
    }

    #[test]
    fn step_budget_exhaustion_is_global_step_limit() {
        let scheduler = Scheduler::new().with_step_budget(50);
        let handle = scheduler.clone();
        let out = scheduler.run(async move {
            loop {
                if let Err(e) = handle.checkpoint().await {
                    return Value::Error(e);
                }
            }
        });
        assert_eq!(out.as_error().unwrap().code, ErrorCode::GlobalStepLimit);
    }

    #[test]
    fn checkpoint_yields_at_the_interval() {
        let scheduler = Scheduler::new().with_yield_interval(1);
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::default();

        let o = order.clone();
        let s = scheduler.clone();
        let id = scheduler.spawn(async move {
            o.borrow_mut().push("task:start");
            let _ = s.checkpoint().await;
            o.borrow_mut().push("task:end");
            Value::Void
        });

        let o = order.clone();
        let handle = scheduler.clone();
        scheduler.run(async move {
            o.borrow_mut().push("main");
            handle.await_task(id).await
        });

        // The eager spawn ran up to its checkpoint, then main ran, then the
        // task resumed.
        assert_eq!(
            order.borrow().as_slice(),
            ["task:start", "main", "task:end"]
        );
    }

    #[test]
    fn sequential_mode_runs_in_spawn_order() {
        let scheduler = Scheduler::with_mode(ScheduleMode::Sequential);
        let order: Rc<RefCell<Vec<u64>>> = Rc::default();
        let mut ids = Vec::new();
        for i in 0..3u64 {
            let o = order.clone();
            ids.push(scheduler.spawn(async move {
                yield_now().await;
                o.borrow_mut().push(i);
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
        assert_eq!(order.borrow().as_slice(), [0, 1, 2]);
    }

    #[test]
    fn depth_first_mode_runs_last_spawned_first() {
        let scheduler = Scheduler::with_mode(ScheduleMode::DepthFirst);
        let order: Rc<RefCell<Vec<u64>>> = Rc::default();
        let mut ids = Vec::new();
        for i in 0..3u64 {
            let o = order.clone();
            ids.push(scheduler.spawn(async move {
                yield_now().await;
                o.borrow_mut().push(i);
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
        assert_eq!(order.borrow().as_slice(), [2, 1, 0]);
    }

    #[test]
    fn breadth_first_mode_runs_in_waves() {
        let scheduler = Scheduler::with_mode(ScheduleMode::BreadthFirst);
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::default();

        let mut first_wave = Vec::new();
        for name in ["a", "b"] {
            let o = order.clone();
            let s = scheduler.clone();
            first_wave.push(scheduler.spawn(async move {
                o.borrow_mut().push(name);
                let o2 = o.clone();
                s.spawn(async move {
                    o2.borrow_mut().push("child");
                    Value::Void
                });
                Value::Void
            }));
        }
        let handle = scheduler.clone();
        scheduler.run(async move {
            for id in first_wave {
                handle.await_task(id).await;
            }
            // Drain the children spawned during the first wave.
            yield_now().await;
            yield_now().await;
            Value::Void
        });
        assert_eq!(order.borrow().as_slice(), ["a", "b", "child", "child"]);
    }

    #[test]
    fn seeded_parallel_mode_is_reproducible() {
        let run_with = |seed: u64| {
            let scheduler = Scheduler::with_mode(ScheduleMode::Parallel { seed: Some(seed) });
            let order: Rc<RefCell<Vec<u64>>> = Rc::default();
            let mut ids = Vec::new();
            for i in 0..4u64 {
                let o = order.clone();
                ids.push(scheduler.spawn(async move {
                    yield_now().await;
                    o.borrow_mut().push(i);
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
            let result = order.borrow().clone();
            result
        };
        assert_eq!(run_with(11), run_with(11));
    }

    #[test]
    fn dispose_fails_future_operations_cleanly() {
        let scheduler = Scheduler::new();
        let id = scheduler.spawn(async {
            yield_now().await;
            Value::Int(1)
        });
        scheduler.dispose();
        assert!(scheduler.is_disposed());

        let handle = scheduler.clone();
        let out = handle.run(async move { Value::Void });
        assert_eq!(out.as_error().unwrap().code, ErrorCode::TaskCancelled);

        // A disposed scheduler refuses new work.
        let id2 = scheduler.spawn(async { Value::Int(2) });
        assert!(scheduler.is_complete(id));
        assert!(scheduler.is_complete(id2));
    }

    #[test]
    fn active_task_count_tracks_running_tasks() {
        let scheduler = Scheduler::new();
        assert_eq!(scheduler.active_task_count(), 0);
        let _id = scheduler.spawn(async {
            yield_now().await;
            yield_now().await;
            Value::Void
        });
        assert_eq!(scheduler.active_task_count(), 1);
        scheduler.run_until_idle().unwrap();
        assert_eq!(scheduler.active_task_count(), 0);
    }
}
