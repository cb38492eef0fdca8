//! Desugared expression-tree evaluator.
//!
//! Evaluates the result node of a (desugared) document by walking the
//! expression graph. Runtime failures are error *values* that propagate
//! through composition; only structural problems detected before
//! evaluation (a failed desugar, an undeserializable document) surface as
//! `Err`.
//!
//! Internally evaluation uses `Result<Value, Value>`: the `Err` side
//! carries a propagating error value so `?` implements the propagation
//! rule. Both sides merge to a plain [`Value`] at the public boundary.
//!
//! A step budget (default 10^6 reductions) and a call-depth bound keep
//! pure programs terminating; exhaustion yields a `NonTermination` error
//! value. Async expression kinds are rejected here with a `DomainError`
//! directing callers to the async evaluator.

use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::Value as Json;

use spiral_core::document::Document;
use spiral_core::env::{DefRegistry, ValueEnv};
use spiral_core::error::{ErrorCode, SpiralError};
use spiral_core::expr::{Arg, Expr};
use spiral_core::node::{Node, NodeBody};
use spiral_core::registry::OperatorRegistry;
use spiral_core::value::{Closure, Value};

use spiral_check::desugar::desugar_document;
use spiral_check::diagnostics::suggest_name;
use spiral_check::resolve::navigate;

use crate::literal::{convert_literal, json_to_value};
use crate::runtime::effect_log::EffectLog;
use crate::runtime::cell::RefCellStore;
use crate::runtime::scheduler::MAIN_TASK;

/// Default bound on total evaluation reductions.
pub const DEFAULT_MAX_STEPS: u64 = 1_000_000;
/// Default bound on nested closure applications.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 512;

/// `Err` carries a propagating error value.
type Eval = Result<Value, Value>;

fn merge(result: Eval) -> Value {
    match result {
        Ok(v) | Err(v) => v,
    }
}

fn propagate(v: Value) -> Eval {
    if v.is_error() {
        Err(v)
    } else {
        Ok(v)
    }
}

/// The synchronous evaluator. Holds the operator and definition
/// registries; per-run state is created fresh for every program.
pub struct Evaluator {
    registry: Rc<OperatorRegistry>,
    defs: Rc<DefRegistry>,
    max_steps: u64,
    max_call_depth: usize,
}

struct RunState {
    nodes: IndexMap<String, Node>,
    doc_json: Json,
    steps: u64,
    scope: HashMap<String, Value>,
    /// Top-level node results: reference semantics means a node evaluated
    /// in the empty environment is computed once and shared.
    values: HashMap<String, Value>,
    cells: RefCellStore,
    log: EffectLog,
}

impl RunState {
    fn bare() -> Self {
        RunState {
            nodes: IndexMap::new(),
            doc_json: Json::Null,
            steps: 0,
            scope: HashMap::new(),
            values: HashMap::new(),
            cells: RefCellStore::new(),
            log: EffectLog::new(),
        }
    }
}

impl Evaluator {
    pub fn new(registry: Rc<OperatorRegistry>, defs: Rc<DefRegistry>) -> Self {
        Evaluator {
            registry,
            defs,
            max_steps: DEFAULT_MAX_STEPS,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    /// Desugars and evaluates the document's result node.
    pub fn evaluate_program(&self, doc: &Document) -> Result<Value, SpiralError> {
        self.evaluate_program_traced(doc).map(|(value, _)| value)
    }

    /// Like [`Self::evaluate_program`], also returning the run's effect log.
    pub fn evaluate_program_traced(
        &self,
        doc: &Document,
    ) -> Result<(Value, EffectLog), SpiralError> {
        let doc = self.prepare(doc)?;
        let mut state = RunState {
            doc_json: serde_json::to_value(&doc).map_err(|e| {
                SpiralError::validation(format!("document serialization failed: {e}"))
            })?,
            nodes: doc
                .nodes
                .iter()
                .map(|n| (n.id.clone(), n.clone()))
                .collect(),
            steps: 0,
            scope: HashMap::new(),
            values: HashMap::new(),
            cells: RefCellStore::new(),
            log: EffectLog::new(),
        };
        let value = self.eval_node(&mut state, &doc.result, &ValueEnv::empty(), 0);
        Ok((value, state.log))
    }

    /// Evaluates a bare expression outside any program. An unresolved
    /// reference is an error here, not a value.
    pub fn evaluate_expr(&self, expr: &Expr, env: &ValueEnv) -> Result<Value, SpiralError> {
        let mut state = RunState::bare();
        let value = merge(self.eval(&mut state, expr, env, 0));
        if let Value::Error(e) = &value {
            if e.code == ErrorCode::UnboundIdentifier {
                let name = e
                    .meta
                    .as_ref()
                    .and_then(|m| m.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                return Err(SpiralError::UnboundIdentifier { name });
            }
        }
        Ok(value)
    }

    /// Merges registry definitions into the document and desugars.
    fn prepare(&self, doc: &Document) -> Result<Document, SpiralError> {
        if self.defs.is_empty() {
            return desugar_document(doc);
        }
        let mut doc = doc.clone();
        for def in self.defs.iter() {
            let already = doc
                .air_defs
                .iter()
                .any(|d| d.ns == def.ns && d.name == def.name);
            if !already {
                doc.air_defs.push(def.clone());
            }
        }
        desugar_document(&doc)
    }

    fn step(&self, state: &mut RunState) -> Result<(), Value> {
        state.steps += 1;
        if state.steps > self.max_steps {
            Err(Value::error_msg(
                ErrorCode::NonTermination,
                format!("exceeded {} evaluation steps", self.max_steps),
            ))
        } else {
            Ok(())
        }
    }

    fn unbound(name: &str) -> Value {
        Value::Error(
            spiral_core::value::ErrorValue::with_message(
                ErrorCode::UnboundIdentifier,
                format!("'{name}' is not bound"),
            )
            .meta_entry("name", Value::str(name)),
        )
    }

    /// Resolves a name: lexical environment, then document nodes (evaluated
    /// in the current environment), then the mutable scope.
    fn resolve_name(&self, state: &mut RunState, name: &str, env: &ValueEnv, depth: usize) -> Value {
        if let Some(v) = env.lookup(name) {
            return v.clone();
        }
        if state.nodes.contains_key(name) {
            return self.eval_node(state, name, env, depth);
        }
        if let Some(v) = state.scope.get(name) {
            return v.clone();
        }
        Self::unbound(name)
    }

    fn eval_node(&self, state: &mut RunState, id: &str, env: &ValueEnv, depth: usize) -> Value {
        if let Some(v) = state.values.get(id) {
            return v.clone();
        }
        let Some(node) = state.nodes.get(id).cloned() else {
            return Value::error_msg(
                ErrorCode::Validation,
                format!("node '{id}' does not exist"),
            );
        };
        let value = match node.body {
            NodeBody::Expr { expr, .. } => merge(self.eval(state, &expr, env, depth)),
            NodeBody::Ref { pointer } => match self.resolve_ref_expr(state, id, &pointer) {
                Ok(expr) => merge(self.eval(state, &expr, env, depth)),
                Err(e) => e,
            },
            NodeBody::Blocks { .. } => Value::error_msg(
                ErrorCode::Domain,
                format!("node '{id}' is a block node; the expression evaluator cannot run it"),
            ),
        };
        // Bound nodes evaluate under their construct's environment and are
        // never shared; top-level results are.
        if env.is_empty() {
            state.values.insert(id.to_string(), value.clone());
        }
        value
    }

    /// Local `$ref` chasing; external URIs must be resolved ahead of
    /// evaluation.
    fn resolve_ref_expr(
        &self,
        state: &RunState,
        id: &str,
        pointer: &str,
    ) -> Result<Expr, Value> {
        if !pointer.starts_with('#') {
            return Err(Value::error_msg(
                ErrorCode::Validation,
                format!("node '{id}': external reference '{pointer}' must be resolved before evaluation"),
            ));
        }
        let mut target = match navigate(&state.doc_json, pointer) {
            Ok(v) => v.clone(),
            Err(e) => return Err(Value::error_msg(ErrorCode::Validation, e.to_string())),
        };
        let mut hops = 0;
        while let Some(next) = target.get("$ref").and_then(Json::as_str) {
            if hops >= spiral_check::resolve::DEFAULT_MAX_DEPTH {
                return Err(Value::error_msg(
                    ErrorCode::MaxDepthExceeded,
                    format!("reference chain from '{pointer}' is too deep"),
                ));
            }
            let next = next.to_string();
            target = match navigate(&state.doc_json, &next) {
                Ok(v) => v.clone(),
                Err(e) => return Err(Value::error_msg(ErrorCode::Validation, e.to_string())),
            };
            hops += 1;
        }
        if let Ok(node) = serde_json::from_value::<Node>(target.clone()) {
            if let NodeBody::Expr { expr, .. } = node.body {
                return Ok(expr);
            }
        }
        serde_json::from_value::<Expr>(target).map_err(|e| {
            Value::error_msg(
                ErrorCode::Validation,
                format!("node '{id}': $ref target is not an expression: {e}"),
            )
        })
    }

    /// Evaluates an argument position, converting error values into `Err`
    /// so `?` propagates them.
    fn arg(&self, state: &mut RunState, arg: &Arg, env: &ValueEnv, depth: usize) -> Eval {
        let value = match arg {
            Arg::Inline(e) => merge(self.eval(state, e, env, depth)),
            Arg::Node(id) => self.resolve_name(state, id, env, depth),
        };
        propagate(value)
    }

    fn eval(&self, state: &mut RunState, expr: &Expr, env: &ValueEnv, depth: usize) -> Eval {
        self.step(state)?;

        match expr {
            Expr::Lit { ty, value } => Ok(convert_literal(ty, value)),

            Expr::Ref { id } => Ok(self.resolve_name(state, id, env, depth)),

            Expr::Var { name } => {
                if let Some(v) = env.lookup(name) {
                    return Ok(v.clone());
                }
                if let Some(v) = state.scope.get(name) {
                    return Ok(v.clone());
                }
                Ok(Self::unbound(name))
            }

            Expr::Call { ns, name, args } => {
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    values.push(self.arg(state, a, env, depth)?);
                }
                let Some(op) = self.registry.lookup(ns, name) else {
                    let suggestion = suggest_name(
                        &format!("{ns}:{name}"),
                        self.registry.names().iter().copied(),
                    )
                    .map(|s| format!(" ({s})"))
                    .unwrap_or_default();
                    return Ok(Value::error_msg(
                        ErrorCode::UnknownOperator,
                        format!("unknown operator '{ns}:{name}'{suggestion}"),
                    ));
                };
                Ok(op.invoke(&values))
            }

            Expr::If {
                cond,
                then,
                otherwise,
                ..
            } => match self.arg(state, cond, env, depth)? {
                Value::Bool(true) => self.arg(state, then, env, depth),
                Value::Bool(false) => self.arg(state, otherwise, env, depth),
                other => Ok(Value::error_msg(
                    ErrorCode::Type,
                    format!("if condition must be bool, got {}", other.type_name()),
                )),
            },

            Expr::Let { name, value, body } => {
                let bound = self.arg(state, value, env, depth)?;
                let inner = env.extend(name.clone(), bound);
                self.arg(state, body, &inner, depth)
            }

            Expr::AirRef { ns, name, .. } => Ok(Value::error_msg(
                ErrorCode::Validation,
                format!("airRef '{ns}:{name}' must be desugared before evaluation"),
            )),

            Expr::Predicate { name, value } => {
                let v = self.arg(state, value, env, depth)?;
                if let Some(op) = self.registry.lookup("predicate", name) {
                    return Ok(op.invoke(&[v]));
                }
                match v {
                    Value::Bool(_) => Ok(v),
                    other => Ok(Value::error_msg(
                        ErrorCode::Type,
                        format!("predicate '{name}' needs a bool, got {}", other.type_name()),
                    )),
                }
            }

            Expr::Lambda { params, body, .. } => Ok(Value::Closure(Rc::new(Closure {
                params: params.clone(),
                body: body.clone(),
                env: env.clone(),
            }))),

            Expr::CallExpr { func, args } => {
                let callee = propagate(self.resolve_name(state, func, env, depth))?;
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    values.push(self.arg(state, a, env, depth)?);
                }
                self.apply(state, callee, values, depth)
            }

            Expr::Fix { func, .. } => {
                let wrapped = propagate(self.resolve_name(state, func, env, depth))?;
                match wrapped {
                    Value::Closure(c) if c.params.len() == 1 => Ok(Value::Fixpoint(c)),
                    Value::Closure(_) => Ok(Value::error_msg(
                        ErrorCode::Type,
                        "fix requires a one-argument function",
                    )),
                    other => Ok(Value::error_msg(
                        ErrorCode::Type,
                        format!("fix requires a closure, got {}", other.type_name()),
                    )),
                }
            }

            Expr::Do { exprs } => {
                let mut last = Value::Void;
                for a in exprs {
                    last = self.arg(state, a, env, depth)?;
                }
                Ok(last)
            }

            Expr::Match {
                value,
                cases,
                default,
            } => {
                let scrutinee = self.arg(state, value, env, depth)?;
                for case in cases {
                    if json_to_value(&case.pattern) == scrutinee {
                        return self.arg(state, &case.body, env, depth);
                    }
                }
                match default {
                    Some(d) => self.arg(state, d, env, depth),
                    None => Ok(Value::error_msg(
                        ErrorCode::Domain,
                        format!("no match arm for {scrutinee}"),
                    )),
                }
            }

            Expr::Record { fields } => {
                let mut map = spiral_core::value::ValueMap::new();
                for field in fields {
                    let v = self.arg(state, &field.value, env, depth)?;
                    map.insert(Value::str(&field.name), v);
                }
                Ok(Value::Map(map))
            }

            Expr::ListOf { elements } => {
                let mut out = Vec::with_capacity(elements.len());
                for e in elements {
                    out.push(self.arg(state, e, env, depth)?);
                }
                Ok(Value::List(out))
            }

            Expr::Seq { first, then } => {
                self.arg(state, first, env, depth)?;
                self.arg(state, then, env, depth)
            }

            Expr::Assign { target, value } => {
                let v = self.arg(state, value, env, depth)?;
                if let Some(cell) = state.cells.get(target) {
                    cell.set_unsafe(v.clone());
                }
                state.scope.insert(target.clone(), v);
                Ok(Value::Void)
            }

            Expr::While { cond, body } => {
                loop {
                    match self.arg(state, cond, env, depth)? {
                        Value::Bool(true) => {
                            self.arg(state, body, env, depth)?;
                        }
                        Value::Bool(false) => break,
                        other => {
                            return Ok(Value::error_msg(
                                ErrorCode::Type,
                                format!("while condition must be bool, got {}", other.type_name()),
                            ))
                        }
                    }
                }
                Ok(Value::Void)
            }

            Expr::For {
                var,
                init,
                cond,
                update,
                body,
            } => {
                let initial = self.arg(state, init, env, depth)?;
                state.scope.insert(var.clone(), initial);
                loop {
                    match self.arg(state, cond, env, depth)? {
                        Value::Bool(true) => {}
                        Value::Bool(false) => break,
                        other => {
                            return Ok(Value::error_msg(
                                ErrorCode::Type,
                                format!("for condition must be bool, got {}", other.type_name()),
                            ))
                        }
                    }
                    self.arg(state, body, env, depth)?;
                    let next = self.arg(state, update, env, depth)?;
                    state.scope.insert(var.clone(), next);
                }
                Ok(Value::Void)
            }

            Expr::Iter { var, iter, body } => {
                let items = match self.arg(state, iter, env, depth)? {
                    Value::List(items) => items,
                    other => {
                        return Ok(Value::error_msg(
                            ErrorCode::Type,
                            format!("iter needs a list, got {}", other.type_name()),
                        ))
                    }
                };
                for item in items {
                    state.scope.insert(var.clone(), item);
                    self.arg(state, body, env, depth)?;
                }
                Ok(Value::Void)
            }

            Expr::Effect { op, args } => {
                // Arguments evaluate strictly left to right.
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    values.push(self.arg(state, a, env, depth)?);
                }
                let result = match self.registry.lookup("effect", op) {
                    Some(operator) => operator.invoke(&values),
                    None => Value::Void,
                };
                let outcome = match result.as_error() {
                    Some(e) => Err(e.clone()),
                    None => Ok(result.clone()),
                };
                state.log.record(MAIN_TASK, op.clone(), values, outcome);
                Ok(result)
            }

            Expr::RefCell { target } => {
                let initial = state.scope.get(target).cloned().unwrap_or(Value::Void);
                state.cells.get_or_create(target, initial);
                Ok(Value::Cell {
                    cell: target.clone(),
                })
            }

            Expr::Deref { target } => {
                if let Some(cell) = state.cells.get(target) {
                    return Ok(cell.get_unsafe());
                }
                if let Some(v) = state.scope.get(target) {
                    return Ok(v.clone());
                }
                Ok(Self::unbound(target))
            }

            Expr::Try {
                try_body,
                catch_param,
                catch_body,
                fallback,
            } => {
                let attempt = merge(self.arg(state, try_body, env, depth));
                if !attempt.is_error() {
                    return Ok(attempt);
                }
                let inner = env.extend(catch_param.clone(), attempt);
                let caught = merge(self.arg(state, catch_body, &inner, depth));
                if caught.is_error() {
                    if let Some(f) = fallback {
                        return Ok(merge(self.arg(state, f, env, depth)));
                    }
                }
                Ok(caught)
            }

            Expr::Par { .. }
            | Expr::Spawn { .. }
            | Expr::Await { .. }
            | Expr::Channel { .. }
            | Expr::Send { .. }
            | Expr::Recv { .. }
            | Expr::Select { .. }
            | Expr::Race { .. } => Ok(Value::error_msg(
                ErrorCode::Domain,
                "Async expressions require AsyncEvaluator",
            )),
        }
    }

    fn apply(&self, state: &mut RunState, callee: Value, args: Vec<Value>, depth: usize) -> Eval {
        if depth >= self.max_call_depth {
            return Ok(Value::error_msg(
                ErrorCode::NonTermination,
                format!("exceeded call depth {}", self.max_call_depth),
            ));
        }
        match callee {
            Value::Closure(closure) => {
                if args.len() > closure.params.len() {
                    return Ok(Value::error_msg(
                        ErrorCode::Arity,
                        format!(
                            "closure expects {} arguments, got {}",
                            closure.params.len(),
                            args.len()
                        ),
                    ));
                }
                let mut env = closure.env.clone();
                for (i, param) in closure.params.iter().enumerate() {
                    let value = if i < args.len() {
                        args[i].clone()
                    } else if let Some(default) = &param.default {
                        // Defaults evaluate in the closure's own environment.
                        let v = merge(self.eval(state, default, &closure.env, depth + 1));
                        if v.is_error() {
                            return Ok(v);
                        }
                        v
                    } else if param.optional {
                        Value::none()
                    } else {
                        return Ok(Value::error_msg(
                            ErrorCode::Arity,
                            format!("missing required argument '{}'", param.name),
                        ));
                    };
                    env = env.extend(param.name.clone(), value);
                }
                Ok(self.eval_node(state, &closure.body, &env, depth + 1))
            }
            Value::Fixpoint(closure) => {
                // fix f applied to xs: (f (fix f)) xs, as successive calls.
                let self_value = Value::Fixpoint(closure.clone());
                let unrolled = merge(self.apply(
                    state,
                    Value::Closure(closure),
                    vec![self_value],
                    depth + 1,
                ));
                if unrolled.is_error() {
                    return Ok(unrolled);
                }
                self.apply(state, unrolled, args, depth + 1)
            }
            other => Ok(Value::error_msg(
                ErrorCode::Type,
                format!("'{}' is not callable", other.type_name()),
            )),
        }
    }
}
