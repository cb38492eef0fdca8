//! Persistent, immutable environments.
//!
//! [`Env`] is an Rc-linked frame list: extension allocates one frame and
//! shares the tail, so snapshots (closure captures, let scopes) are O(1) and
//! never invalidated by later extension. Lookup walks innermost-first, which
//! gives shadowing for free.

use indexmap::IndexMap;
use std::fmt;
use std::rc::Rc;

use crate::document::AirDef;
use crate::types::SpiralType;
use crate::value::Value;

struct Frame<T> {
    name: String,
    value: T,
    next: Option<Rc<Frame<T>>>,
}

/// A persistent name -> `T` map.
pub struct Env<T> {
    head: Option<Rc<Frame<T>>>,
}

/// Name -> type environment used by the checker.
pub type TypeEnv = Env<SpiralType>;

/// Name -> value environment used by the evaluators.
pub type ValueEnv = Env<Value>;

impl<T> Env<T> {
    /// The empty environment.
    pub fn empty() -> Self {
        Env { head: None }
    }

    /// A new environment with one extra binding; `self` is unchanged.
    pub fn extend(&self, name: impl Into<String>, value: T) -> Self {
        Env {
            head: Some(Rc::new(Frame {
                name: name.into(),
                value,
                next: self.head.clone(),
            })),
        }
    }

    /// Extends with several bindings; later entries shadow earlier ones.
    pub fn extend_many(&self, bindings: impl IntoIterator<Item = (String, T)>) -> Self {
        let mut env = self.clone();
        for (name, value) in bindings {
            env = env.extend(name, value);
        }
        env
    }

    /// Innermost binding for `name`, if any.
    pub fn lookup(&self, name: &str) -> Option<&T> {
        let mut cur = self.head.as_deref();
        while let Some(frame) = cur {
            if frame.name == name {
                return Some(&frame.value);
            }
            cur = frame.next.as_deref();
        }
        None
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// `true` when no bindings exist at all.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Visible (unshadowed) binding names, innermost first.
    pub fn names(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        let mut cur = self.head.as_deref();
        while let Some(frame) = cur {
            if !seen.contains(&frame.name.as_str()) {
                seen.push(&frame.name);
            }
            cur = frame.next.as_deref();
        }
        seen
    }
}

impl<T> Clone for Env<T> {
    fn clone(&self) -> Self {
        Env {
            head: self.head.clone(),
        }
    }
}

impl<T> Default for Env<T> {
    fn default() -> Self {
        Env::empty()
    }
}

impl<T: fmt::Debug> fmt::Debug for Env<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        let mut cur = self.head.as_deref();
        while let Some(frame) = cur {
            map.entry(&frame.name, &frame.value);
            cur = frame.next.as_deref();
        }
        map.finish()
    }
}

/// Registry of reusable `airDef` definitions keyed by `(ns, name)`.
#[derive(Debug, Clone, Default)]
pub struct DefRegistry {
    defs: IndexMap<(String, String), AirDef>,
}

impl DefRegistry {
    pub fn new() -> Self {
        DefRegistry::default()
    }

    /// Builds a registry from a document's `airDefs` section.
    pub fn from_document(doc: &crate::document::Document) -> Self {
        let mut reg = DefRegistry::new();
        for def in &doc.air_defs {
            reg.register(def.clone());
        }
        reg
    }

    /// Registers a definition; a same-keyed definition is replaced.
    pub fn register(&mut self, def: AirDef) {
        self.defs
            .insert((def.ns.clone(), def.name.clone()), def);
    }

    pub fn lookup(&self, ns: &str, name: &str) -> Option<&AirDef> {
        self.defs.get(&(ns.to_string(), name.to_string()))
    }

    /// All known `ns:name` keys, in registration order. Used for
    /// unknown-definition suggestions.
    pub fn names(&self) -> Vec<String> {
        self.defs
            .keys()
            .map(|(ns, name)| format!("{ns}:{name}"))
            .collect()
    }

    /// Registered definitions in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &AirDef> {
        self.defs.values()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;

    #[test]
    fn empty_env_has_no_bindings() {
        let env: Env<i32> = Env::empty();
        assert_eq!(env.lookup("x"), None);
        assert!(!env.contains("x"));
    }

    #[test]
    fn extension_is_persistent() {
        let base: Env<i32> = Env::empty().extend("x", 1);
        let extended = base.extend("y", 2);
        // The original is untouched by the extension.
        assert_eq!(base.lookup("y"), None);
        assert_eq!(extended.lookup("x"), Some(&1));
        assert_eq!(extended.lookup("y"), Some(&2));
    }

    #[test]
    fn inner_bindings_shadow_outer() {
        let env: Env<i32> = Env::empty().extend("x", 1).extend("x", 2);
        assert_eq!(env.lookup("x"), Some(&2));
        assert_eq!(env.names(), vec!["x"]);
    }

    #[test]
    fn extend_many_applies_in_order() {
        let env: Env<i32> =
            Env::empty().extend_many(vec![("a".to_string(), 1), ("a".to_string(), 2)]);
        assert_eq!(env.lookup("a"), Some(&2));
    }

    #[test]
    fn def_registry_lookup_and_names() {
        let mut reg = DefRegistry::new();
        reg.register(AirDef {
            ns: "math".into(),
            name: "square".into(),
            params: vec!["x".into()],
            result: SpiralType::Int,
            body: Expr::var("x"),
        });
        assert!(reg.lookup("math", "square").is_some());
        assert!(reg.lookup("math", "cube").is_none());
        assert_eq!(reg.names(), vec!["math:square".to_string()]);
    }
}
