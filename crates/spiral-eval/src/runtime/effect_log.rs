//! Append-only, totally ordered log of effectful operations.
//!
//! Every entry records `(seq, task, op, args, result?, error?)`. Sequence
//! numbers are monotonic across all tasks; within one task the
//! sub-sequence preserves program order because appends happen at the
//! operation's completion point on a single logical thread.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use spiral_core::value::{ErrorValue, TaskId, Value};

/// One logged effect.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectEntry {
    pub seq: u64,
    pub task: TaskId,
    pub op: String,
    pub args: Vec<Value>,
    pub result: Option<Value>,
    pub error: Option<ErrorValue>,
}

/// Aggregate statistics over the log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectStats {
    pub total: usize,
    pub by_op: IndexMap<String, usize>,
    pub by_task: IndexMap<TaskId, usize>,
}

#[derive(Default)]
struct LogInner {
    entries: Vec<EffectEntry>,
    next_seq: u64,
}

/// Shared append-only effect log. Clones view the same entries.
#[derive(Clone, Default)]
pub struct EffectLog {
    inner: Rc<RefCell<LogInner>>,
}

impl EffectLog {
    pub fn new() -> Self {
        EffectLog::default()
    }

    /// Appends a completed operation and returns its sequence number.
    pub fn record(
        &self,
        task: TaskId,
        op: impl Into<String>,
        args: Vec<Value>,
        outcome: Result<Value, ErrorValue>,
    ) -> u64 {
        let mut inner = self.inner.borrow_mut();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let (result, error) = match outcome {
            Ok(v) => (Some(v), None),
            Err(e) => (None, Some(e)),
        };
        inner.entries.push(EffectEntry {
            seq,
            task,
            op: op.into(),
            args,
            result,
            error,
        });
        seq
    }

    /// All entries in total (sequence) order.
    pub fn entries(&self) -> Vec<EffectEntry> {
        self.inner.borrow().entries.clone()
    }

    /// Entries of one task, preserving that task's program order.
    pub fn by_task(&self, task: TaskId) -> Vec<EffectEntry> {
        self.inner
            .borrow()
            .entries
            .iter()
            .filter(|e| e.task == task)
            .cloned()
            .collect()
    }

    /// Removes exactly the given task's entries.
    pub fn discard_task(&self, task: TaskId) {
        self.inner.borrow_mut().entries.retain(|e| e.task != task);
    }

    pub fn stats(&self) -> EffectStats {
        let inner = self.inner.borrow();
        let mut stats = EffectStats {
            total: inner.entries.len(),
            ..EffectStats::default()
        };
        for entry in &inner.entries {
            *stats.by_op.entry(entry.op.clone()).or_insert(0) += 1;
            *stats.by_task.entry(entry.task).or_insert(0) += 1;
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().entries.is_empty()
    }
}
