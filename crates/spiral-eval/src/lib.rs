//! Evaluation for SPIRAL documents.
//!
//! The synchronous tree-walking evaluator for the pure and mutation layers,
//! the cooperative async runtime (scheduler, mutex, cells, channels,
//! barrier, effect log), and the asynchronous evaluator for EIR with the
//! async capability.

pub mod async_eval;
pub mod eval;
pub mod literal;
pub mod runtime;

pub use async_eval::AsyncEvaluator;
pub use eval::{Evaluator, DEFAULT_MAX_CALL_DEPTH, DEFAULT_MAX_STEPS};
pub use literal::{convert_literal, json_to_value};
pub use runtime::{
    Barrier, Channel, ChannelStore, CoMutex, EffectEntry, EffectLog, EffectStats, RefCellStore,
    ScheduleMode, Scheduler, SharedCell,
};
