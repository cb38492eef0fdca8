//! Cooperative async runtime: scheduler, mutex, cells, channels, barrier,
//! and the effect log.
//!
//! Everything here is single-threaded. Shared state lives behind
//! `Rc<RefCell<...>>`, suspension is explicit (futures return `Pending`
//! until the state they watch changes), and FIFO ordering is enforced with
//! ticket queues rather than wakers.

pub mod barrier;
pub mod cell;
pub mod channel;
pub mod effect_log;
pub mod mutex;
pub mod scheduler;

pub use barrier::{Barrier, BarrierWait};
pub use cell::{RefCellStore, SharedCell};
pub use channel::{Channel, ChannelStore, RecvFuture, SendFuture};
pub use effect_log::{EffectEntry, EffectLog, EffectStats};
pub use mutex::{Acquire, CoMutex, CoMutexGuard};
pub use scheduler::{
    yield_now, AwaitTask, Checkpoint, ScheduleMode, Scheduler, YieldNow,
    DEFAULT_GLOBAL_MAX_STEPS, DEFAULT_YIELD_INTERVAL, MAIN_TASK,
};
