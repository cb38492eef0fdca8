//! Runtime value representation.
//!
//! [`Value`] is the dynamic counterpart of [`crate::types::SpiralType`].
//! Values exist only for the duration of one evaluation; they are never
//! serialized into documents.
//!
//! Sets and maps key their contents by [`hash_value`] -- a deterministic
//! blake3 digest over a tag-prefixed canonical byte encoding -- rather than
//! by host hashing, so membership is stable across runs and platforms.
//! Hash-affecting iteration is always over sorted digests, never over raw
//! map order.

use indexmap::IndexMap;
use std::fmt;
use std::rc::Rc;

use crate::env::ValueEnv;
use crate::error::ErrorCode;
use crate::expr::LambdaParam;
use crate::node::NodeId;
use crate::types::{ChannelKind, SpiralType};

/// Identifier of a spawned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task_{}", self.0)
    }
}

/// Identifier of a channel; rendered `ch_N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch_{}", self.0)
    }
}

/// Completion status snapshot carried by a future value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureStatus {
    Pending,
    Ready,
    Error,
}

/// A future value: the task it tracks plus a status snapshot taken when the
/// value was produced. Scheduler state stays authoritative.
#[derive(Debug, Clone, PartialEq)]
pub struct FutureHandle {
    pub task: TaskId,
    pub status: FutureStatus,
    pub value: Option<Box<Value>>,
}

impl FutureHandle {
    pub fn pending(task: TaskId) -> Self {
        FutureHandle {
            task,
            status: FutureStatus::Pending,
            value: None,
        }
    }
}

/// A closure: lambda parameters, body node, and the lexical environment
/// captured at creation.
#[derive(Debug, Clone)]
pub struct Closure {
    pub params: Vec<LambdaParam>,
    pub body: NodeId,
    pub env: ValueEnv,
}

/// Set of values keyed by content hash, insertion-ordered for display.
#[derive(Debug, Clone, Default)]
pub struct ValueSet {
    items: IndexMap<String, Value>,
}

impl ValueSet {
    pub fn new() -> Self {
        ValueSet::default()
    }

    /// Inserts by content hash; duplicates collapse. Returns `true` when the
    /// element was new.
    pub fn insert(&mut self, value: Value) -> bool {
        self.items.insert(hash_value(&value), value).is_none()
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.items.contains_key(&hash_value(value))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.items.values()
    }

    /// Element hashes in sorted order (the canonical iteration for hashing).
    fn sorted_hashes(&self) -> Vec<&String> {
        let mut keys: Vec<&String> = self.items.keys().collect();
        keys.sort();
        keys
    }
}

impl FromIterator<Value> for ValueSet {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        let mut set = ValueSet::new();
        for v in iter {
            set.insert(v);
        }
        set
    }
}

impl PartialEq for ValueSet {
    fn eq(&self, other: &Self) -> bool {
        self.items.len() == other.items.len()
            && self.items.keys().all(|k| other.items.contains_key(k))
    }
}

/// Map keyed by the content hash of the key value; each entry keeps the
/// original key for iteration.
#[derive(Debug, Clone, Default)]
pub struct ValueMap {
    entries: IndexMap<String, (Value, Value)>,
}

impl ValueMap {
    pub fn new() -> Self {
        ValueMap::default()
    }

    /// Inserts or replaces; returns the previous value for the key.
    pub fn insert(&mut self, key: Value, value: Value) -> Option<Value> {
        self.entries
            .insert(hash_value(&key), (key, value))
            .map(|(_, v)| v)
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.get(&hash_value(key)).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.values().map(|(k, v)| (k, v))
    }
}

impl FromIterator<(Value, Value)> for ValueMap {
    fn from_iter<I: IntoIterator<Item = (Value, Value)>>(iter: I) -> Self {
        let mut map = ValueMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl PartialEq for ValueMap {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().all(|(hash, (_, v))| {
                other.entries.get(hash).is_some_and(|(_, ov)| v == ov)
            })
    }
}

/// An error value: a code, an optional human message, and optional
/// key -> value metadata. Errors propagate through operator composition
/// unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    pub code: ErrorCode,
    pub message: Option<String>,
    pub meta: Option<IndexMap<String, Value>>,
}

impl ErrorValue {
    pub fn new(code: ErrorCode) -> Self {
        ErrorValue {
            code,
            message: None,
            meta: None,
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        ErrorValue {
            code,
            message: Some(message.into()),
            meta: None,
        }
    }

    /// Attaches one metadata entry, creating the map on first use.
    pub fn meta_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta
            .get_or_insert_with(IndexMap::new)
            .insert(key.into(), value);
        self
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(m) => write!(f, "{}: {m}", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Void,
    List(Vec<Value>),
    Set(ValueSet),
    Map(ValueMap),
    /// `option(V | null)`.
    Option(Option<Box<Value>>),
    Opaque {
        name: String,
        payload: Box<Value>,
    },
    Closure(Rc<Closure>),
    /// Self-applying fixed point over a one-argument closure; applying it
    /// reifies recursion as successive call steps.
    Fixpoint(Rc<Closure>),
    /// Handle to a named reference cell.
    Cell {
        cell: String,
    },
    Future(FutureHandle),
    Channel {
        id: ChannelId,
        kind: ChannelKind,
    },
    Task {
        id: TaskId,
        returns: SpiralType,
    },
    Error(ErrorValue),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn some(v: Value) -> Self {
        Value::Option(Some(Box::new(v)))
    }

    pub fn none() -> Self {
        Value::Option(None)
    }

    pub fn error(code: ErrorCode) -> Self {
        Value::Error(ErrorValue::new(code))
    }

    pub fn error_msg(code: ErrorCode, message: impl Into<String>) -> Self {
        Value::Error(ErrorValue::with_message(code, message))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            Value::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Human-readable description of the value's kind.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Void => "void",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
            Value::Option(_) => "option",
            Value::Opaque { .. } => "opaque",
            Value::Closure(_) => "closure",
            Value::Fixpoint(_) => "fixpoint",
            Value::Cell { .. } => "ref",
            Value::Future(_) => "future",
            Value::Channel { .. } => "channel",
            Value::Task { .. } => "task",
            Value::Error(_) => "error",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            // -0.0 and +0.0 compare equal; NaN stays unequal to itself.
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Void, Value::Void) => true,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Option(a), Value::Option(b)) => a == b,
            (
                Value::Opaque { name: an, payload: ap },
                Value::Opaque { name: bn, payload: bp },
            ) => an == bn && ap == bp,
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Fixpoint(a), Value::Fixpoint(b)) => Rc::ptr_eq(a, b),
            (Value::Cell { cell: a }, Value::Cell { cell: b }) => a == b,
            (Value::Future(a), Value::Future(b)) => a.task == b.task,
            (Value::Channel { id: a, .. }, Value::Channel { id: b, .. }) => a == b,
            (Value::Task { id: a, .. }, Value::Task { id: b, .. }) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Void => f.write_str("void"),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
            Value::Set(s) => write!(f, "set(len {})", s.len()),
            Value::Map(m) => write!(f, "map(len {})", m.len()),
            Value::Option(Some(v)) => write!(f, "some({v})"),
            Value::Option(None) => f.write_str("none"),
            Value::Opaque { name, .. } => write!(f, "opaque<{name}>"),
            Value::Closure(c) => write!(f, "closure({})", c.body),
            Value::Fixpoint(c) => write!(f, "fixpoint({})", c.body),
            Value::Cell { cell } => write!(f, "ref({cell})"),
            Value::Future(h) => write!(f, "future({})", h.task),
            Value::Channel { id, kind } => write!(f, "channel({id}, {kind})"),
            Value::Task { id, .. } => write!(f, "task({id})"),
            Value::Error(e) => write!(f, "error({e})"),
        }
    }
}

/// Canonical bit pattern for a float: all zeros collapse to `+0.0` and all
/// NaNs to the canonical quiet NaN, so equal values hash equal.
fn canonical_float_bits(x: f64) -> u64 {
    if x == 0.0 {
        0
    } else if x.is_nan() {
        f64::NAN.to_bits()
    } else {
        x.to_bits()
    }
}

fn write_value(h: &mut blake3::Hasher, v: &Value) {
    match v {
        Value::Bool(b) => {
            h.update(b"b");
            h.update(&[u8::from(*b)]);
        }
        Value::Int(i) => {
            h.update(b"i");
            h.update(&i.to_le_bytes());
        }
        Value::Float(x) => {
            h.update(b"f");
            h.update(&canonical_float_bits(*x).to_le_bytes());
        }
        Value::Str(s) => {
            h.update(b"s");
            h.update(&(s.len() as u64).to_le_bytes());
            h.update(s.as_bytes());
        }
        Value::Void => {
            h.update(b"v");
        }
        Value::List(items) => {
            h.update(b"l");
            h.update(&(items.len() as u64).to_le_bytes());
            for item in items {
                write_value(h, item);
            }
        }
        Value::Set(set) => {
            h.update(b"S");
            h.update(&(set.len() as u64).to_le_bytes());
            for key in set.sorted_hashes() {
                h.update(key.as_bytes());
            }
        }
        Value::Map(map) => {
            h.update(b"m");
            h.update(&(map.len() as u64).to_le_bytes());
            let mut hashes: Vec<&String> = map.entries.keys().collect();
            hashes.sort();
            for key_hash in hashes {
                h.update(key_hash.as_bytes());
                let (_, value) = &map.entries[key_hash.as_str()];
                write_value(h, value);
            }
        }
        Value::Option(inner) => {
            h.update(b"o");
            match inner {
                Some(v) => {
                    h.update(&[1]);
                    write_value(h, v);
                }
                None => {
                    h.update(&[0]);
                }
            }
        }
        Value::Opaque { name, payload } => {
            h.update(b"q");
            h.update(&(name.len() as u64).to_le_bytes());
            h.update(name.as_bytes());
            write_value(h, payload);
        }
        Value::Closure(c) => {
            h.update(b"c");
            h.update(c.body.as_bytes());
            for p in &c.params {
                h.update(p.name.as_bytes());
            }
        }
        Value::Fixpoint(c) => {
            h.update(b"x");
            h.update(c.body.as_bytes());
        }
        Value::Cell { cell } => {
            h.update(b"r");
            h.update(cell.as_bytes());
        }
        Value::Future(handle) => {
            h.update(b"F");
            h.update(&handle.task.0.to_le_bytes());
        }
        Value::Channel { id, .. } => {
            h.update(b"C");
            h.update(&id.0.to_le_bytes());
        }
        Value::Task { id, .. } => {
            h.update(b"t");
            h.update(&id.0.to_le_bytes());
        }
        Value::Error(e) => {
            h.update(b"e");
            h.update(e.code.as_str().as_bytes());
            if let Some(m) = &e.message {
                h.update(m.as_bytes());
            }
        }
    }
}

/// Deterministic content hash of a value, hex-encoded. Used as the key for
/// `set<V>` membership and `map<K, V>` lookup.
pub fn hash_value(v: &Value) -> String {
    let mut hasher = blake3::Hasher::new();
    write_value(&mut hasher, v);
    hasher.finalize().to_hex().to_string()
}
