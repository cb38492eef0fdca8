//! Shared mutable cells and the per-run cell store.
//!
//! A [`SharedCell`] is a single-slot holder whose `read`/`write`/`update`
//! are serialized through an internal [`CoMutex`], so concurrent tasks never
//! interleave inside an update. The `get_unsafe`/`set_unsafe` accessors
//! bypass the serialization for tests and for the synchronous evaluator,
//! which has no concurrent tasks.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use spiral_core::value::Value;

use super::mutex::CoMutex;

/// A mutex-serialized single-value holder.
#[derive(Clone)]
pub struct SharedCell {
    value: Rc<RefCell<Value>>,
    lock: CoMutex,
}

impl SharedCell {
    pub fn new(initial: Value) -> Self {
        SharedCell {
            value: Rc::new(RefCell::new(initial)),
            lock: CoMutex::new(),
        }
    }

    pub async fn read(&self) -> Value {
        let _guard = self.lock.acquire().await;
        self.value.borrow().clone()
    }

    pub async fn write(&self, new: Value) {
        let _guard = self.lock.acquire().await;
        *self.value.borrow_mut() = new;
    }

    /// Applies `f` to the current value and stores the result, returning it.
    pub async fn update(&self, f: impl FnOnce(Value) -> Value) -> Value {
        let _guard = self.lock.acquire().await;
        let current = self.value.borrow().clone();
        let next = f(current);
        *self.value.borrow_mut() = next.clone();
        next
    }

    /// Unserialized read; test/sync-evaluator use only.
    pub fn get_unsafe(&self) -> Value {
        self.value.borrow().clone()
    }

    /// Unserialized write; test/sync-evaluator use only.
    pub fn set_unsafe(&self, new: Value) {
        *self.value.borrow_mut() = new;
    }
}

/// Name -> cell store scoped to one evaluation run.
#[derive(Clone, Default)]
pub struct RefCellStore {
    cells: Rc<RefCell<IndexMap<String, SharedCell>>>,
}

impl RefCellStore {
    pub fn new() -> Self {
        RefCellStore::default()
    }

    /// Returns the named cell, creating it with `initial` on first use.
    pub fn get_or_create(&self, name: &str, initial: Value) -> SharedCell {
        let mut cells = self.cells.borrow_mut();
        cells
            .entry(name.to_string())
            .or_insert_with(|| SharedCell::new(initial))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<SharedCell> {
        self.cells.borrow().get(name).cloned()
    }

    pub fn delete(&self, name: &str) -> bool {
        self.cells.borrow_mut().shift_remove(name).is_some()
    }

    pub fn clear(&self) {
        self.cells.borrow_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.cells.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::scheduler::Scheduler;

    #[test]
    fn read_write_update_roundtrip() {
        let scheduler = Scheduler::new();
        let cell = SharedCell::new(Value::Int(1));
        let c = cell.clone();
        let out = scheduler.run(async move {
            c.write(Value::Int(2)).await;
            let v = c
                .update(|v| match v {
                    Value::Int(i) => Value::Int(i * 10),
                    other => other,
                })
                .await;
            assert_eq!(v, Value::Int(20));
            c.read().await
        });
        assert_eq!(out, Value::Int(20));
    }

    #[test]
    fn concurrent_updates_are_serialized() {
        let scheduler = Scheduler::new();
        let cell = SharedCell::new(Value::Int(0));

        let mut ids = Vec::new();
        for _ in 0..10 {
            let c = cell.clone();
            ids.push(scheduler.spawn(async move {
                c.update(|v| match v {
                    Value::Int(i) => Value::Int(i + 1),
                    other => other,
                })
                .await
            }));
        }
        let handle = scheduler.clone();
        scheduler.run(async move {
            for id in ids {
                handle.await_task(id).await;
            }
            Value::Void
        });
        assert_eq!(cell.get_unsafe(), Value::Int(10));
    }

    #[test]
    fn unsafe_accessors_bypass_the_lock() {
        let cell = SharedCell::new(Value::Int(1));
        cell.set_unsafe(Value::Int(5));
        assert_eq!(cell.get_unsafe(), Value::Int(5));
    }

    #[test]
    fn store_creates_once_and_deletes() {
        let store = RefCellStore::new();
        let a = store.get_or_create("x", Value::Int(1));
        a.set_unsafe(Value::Int(9));
        // Second get_or_create keeps the existing cell and value.
        let b = store.get_or_create("x", Value::Int(0));
        assert_eq!(b.get_unsafe(), Value::Int(9));
        assert_eq!(store.len(), 1);

        assert!(store.delete("x"));
        assert!(!store.delete("x"));
        assert!(store.get("x").is_none());

        store.get_or_create("y", Value::Void);
        store.clear();
        assert!(store.is_empty());
    }
}
