//! Namespaced operator registry.
//!
//! Operators are pure host functions with a declared signature. They fail by
//! returning an error *value*, never by panicking: any error argument
//! propagates unchanged, wrong arity yields `ArityError`, and contract
//! violations yield the operator's declared error codes.
//!
//! The registry itself is a plain lookup table; operator *sets* are supplied
//! by callers (see [`crate::core_ops`] for the built-in `core` namespace).

use indexmap::IndexMap;
use std::fmt;
use std::rc::Rc;

use crate::error::ErrorCode;
use crate::types::SpiralType;
use crate::value::Value;

/// Host implementation of an operator.
pub type OperatorFn = Rc<dyn Fn(&[Value]) -> Value>;

/// A registered operator: namespaced name, signature, purity, and
/// implementation.
#[derive(Clone)]
pub struct Operator {
    pub ns: String,
    pub name: String,
    pub params: Vec<SpiralType>,
    pub returns: SpiralType,
    pub pure: bool,
    pub run: OperatorFn,
}

impl Operator {
    /// Registry key: `"{ns}:{name}"`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.ns, self.name)
    }

    /// Invokes the operator with error propagation and arity checking.
    ///
    /// Any error argument is returned unchanged; an argument-count mismatch
    /// returns an `ArityError` value; otherwise the implementation runs.
    pub fn invoke(&self, args: &[Value]) -> Value {
        if let Some(err) = args.iter().find(|a| a.is_error()) {
            return err.clone();
        }
        if args.len() != self.params.len() {
            return Value::error_msg(
                ErrorCode::Arity,
                format!(
                    "{} expects {} arguments, got {}",
                    self.key(),
                    self.params.len(),
                    args.len()
                ),
            );
        }
        (self.run)(args)
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("ns", &self.ns)
            .field("name", &self.name)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .field("pure", &self.pure)
            .finish_non_exhaustive()
    }
}

/// Lookup table from `"{ns}:{name}"` to [`Operator`].
#[derive(Debug, Clone, Default)]
pub struct OperatorRegistry {
    ops: IndexMap<String, Operator>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        OperatorRegistry::default()
    }

    /// Registers an operator; a same-keyed operator is replaced.
    pub fn register(&mut self, op: Operator) {
        self.ops.insert(op.key(), op);
    }

    pub fn lookup(&self, ns: &str, name: &str) -> Option<&Operator> {
        self.ops.get(&format!("{ns}:{name}"))
    }

    pub fn contains(&self, ns: &str, name: &str) -> bool {
        self.lookup(ns, name).is_some()
    }

    /// All registered keys in registration order; used for suggestions.
    pub fn names(&self) -> Vec<&str> {
        self.ops.keys().map(String::as_str).collect()
    }

    /// Distinct namespaces in registration order.
    pub fn namespaces(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for op in self.ops.values() {
            if !out.contains(&op.ns.as_str()) {
                out.push(&op.ns);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_identity() -> Operator {
        Operator {
            ns: "test".into(),
            name: "id".into(),
            params: vec![SpiralType::Int],
            returns: SpiralType::Int,
            pure: true,
            run: Rc::new(|args| args[0].clone()),
        }
    }

    #[test]
    fn lookup_registered_operator() {
        let mut reg = OperatorRegistry::new();
        reg.register(mock_identity());
        assert!(reg.lookup("test", "id").is_some());
        assert!(reg.lookup("test", "nope").is_none());
        assert_eq!(reg.namespaces(), vec!["test"]);
    }

    #[test]
    fn invoke_propagates_error_arguments() {
        let op = mock_identity();
        let err = Value::error_msg(ErrorCode::Domain, "boom");
        let out = op.invoke(&[err.clone()]);
        assert_eq!(out, err);
    }

    #[test]
    fn invoke_checks_arity() {
        let op = mock_identity();
        let out = op.invoke(&[Value::Int(1), Value::Int(2)]);
        assert_eq!(out.as_error().unwrap().code, ErrorCode::Arity);
    }

    #[test]
    fn invoke_runs_implementation() {
        let op = mock_identity();
        assert_eq!(op.invoke(&[Value::Int(9)]), Value::Int(9));
    }
}
