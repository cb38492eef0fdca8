//! Asynchronous evaluator: full EIR with the async capability.
//!
//! Expressions evaluate as local futures driven by the cooperative
//! [`Scheduler`]. Every reduction passes through a scheduler checkpoint, so
//! long-running pure work still yields periodically and the global step
//! budget is enforced uniformly.
//!
//! `spawn` starts a task eagerly and evaluates to a future value; `await`,
//! `select`, and `race` block on task completion with optional step-based
//! timeouts (`timeout` of N converts to N scheduler steps); channels, cells,
//! and every async operation append to the run's effect log.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use serde_json::Value as Json;
use tracing::trace;

use spiral_core::document::Document;
use spiral_core::env::{DefRegistry, ValueEnv};
use spiral_core::error::{ErrorCode, SpiralError};
use spiral_core::expr::{Arg, Expr};
use spiral_core::node::{Node, NodeBody};
use spiral_core::registry::OperatorRegistry;
use spiral_core::types::ChannelKind;
use spiral_core::value::{Closure, ErrorValue, FutureHandle, TaskId, Value, ValueMap};

use spiral_check::desugar::desugar_document;
use spiral_check::diagnostics::suggest_name;
use spiral_check::resolve::navigate;

use crate::eval::{DEFAULT_MAX_CALL_DEPTH, DEFAULT_MAX_STEPS};
use crate::literal::{convert_literal, json_to_value};
use crate::runtime::cell::RefCellStore;
use crate::runtime::channel::ChannelStore;
use crate::runtime::effect_log::EffectLog;
use crate::runtime::scheduler::{yield_now, ScheduleMode, Scheduler};

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

fn index_result(index: i64, value: Value) -> Value {
    let mut map = ValueMap::new();
    map.insert(Value::str("index"), Value::Int(index));
    map.insert(Value::str("value"), value);
    Value::Map(map)
}

/// The asynchronous evaluator. Construction mirrors [`crate::eval::Evaluator`];
/// the scheduling mode and budgets are configurable for deterministic tests.
pub struct AsyncEvaluator {
    registry: Rc<OperatorRegistry>,
    defs: Rc<DefRegistry>,
    mode: ScheduleMode,
    global_max_steps: u64,
    yield_interval: Option<u64>,
    max_call_depth: usize,
}

impl AsyncEvaluator {
    pub fn new(registry: Rc<OperatorRegistry>, defs: Rc<DefRegistry>) -> Self {
        AsyncEvaluator {
            registry,
            defs,
            mode: ScheduleMode::default(),
            global_max_steps: DEFAULT_MAX_STEPS,
            yield_interval: None,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }

    pub fn with_mode(mut self, mode: ScheduleMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_step_budget(mut self, max_steps: u64) -> Self {
        self.global_max_steps = max_steps;
        self
    }

    pub fn with_yield_interval(mut self, interval: u64) -> Self {
        self.yield_interval = Some(interval);
        self
    }

    /// Desugars and evaluates the document's result node on a fresh
    /// scheduler, channel store, and cell store.
    pub fn evaluate_program(&self, doc: &Document) -> Result<Value, SpiralError> {
        self.evaluate_program_traced(doc).map(|(v, _)| v)
    }

    /// Like [`Self::evaluate_program`], also returning the run's effect log.
    pub fn evaluate_program_traced(
        &self,
        doc: &Document,
    ) -> Result<(Value, EffectLog), SpiralError> {
        let doc = self.prepare(doc)?;
        let mut scheduler = Scheduler::with_mode(self.mode).with_step_budget(self.global_max_steps);
        if let Some(interval) = self.yield_interval {
            scheduler = scheduler.with_yield_interval(interval);
        }
        let ctx = Rc::new(AsyncCtx {
            nodes: doc
                .nodes
                .iter()
                .map(|n| (n.id.clone(), n.clone()))
                .collect(),
            doc_json: serde_json::to_value(&doc).map_err(|e| {
                SpiralError::validation(format!("document serialization failed: {e}"))
            })?,
            registry: self.registry.clone(),
            scheduler,
            channels: ChannelStore::new(),
            cells: RefCellStore::new(),
            log: EffectLog::new(),
            scope: RefCell::new(HashMap::new()),
            values: RefCell::new(HashMap::new()),
            max_call_depth: self.max_call_depth,
        });
        let main = ctx.clone().eval_node(doc.result.clone(), ValueEnv::empty(), 0);
        let value = ctx.scheduler.run(main);
        Ok((value, ctx.log.clone()))
    }

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
}

/// Shared-node evaluation slot: either still being computed by some task
/// or finished with a value.
enum NodeSlot {
    InFlight,
    Done(Value),
}

struct AsyncCtx {
    nodes: IndexMap<String, Node>,
    doc_json: Json,
    registry: Rc<OperatorRegistry>,
    scheduler: Scheduler,
    channels: ChannelStore,
    cells: RefCellStore,
    log: EffectLog,
    scope: RefCell<HashMap<String, Value>>,
    /// Top-level node results (reference semantics: one evaluation per
    /// node, shared across tasks).
    values: RefCell<HashMap<String, NodeSlot>>,
    max_call_depth: usize,
}

impl AsyncCtx {
    fn unbound(name: &str) -> Value {
        Value::Error(
            ErrorValue::with_message(
                ErrorCode::UnboundIdentifier,
                format!("'{name}' is not bound"),
            )
            .meta_entry("name", Value::str(name)),
        )
    }

    fn task_of(value: &Value) -> Result<TaskId, Value> {
        match value {
            Value::Future(handle) => Ok(handle.task),
            Value::Task { id, .. } => Ok(*id),
            other => Err(Value::error_msg(
                ErrorCode::Type,
                format!("await needs a future or task, got {}", other.type_name()),
            )),
        }
    }

    fn eval_node(
        self: Rc<Self>,
        id: String,
        env: ValueEnv,
        depth: usize,
    ) -> LocalBoxFuture<'static, Value> {
        async move {
            // Shared nodes evaluate once. A second task arriving while the
            // first is still computing parks until the slot resolves.
            loop {
                let parked = match self.values.borrow().get(&id) {
                    Some(NodeSlot::Done(v)) => return v.clone(),
                    Some(NodeSlot::InFlight) => true,
                    None => false,
                };
                if !parked {
                    break;
                }
                if let Err(e) = self.scheduler.checkpoint().await {
                    return Value::Error(e);
                }
                yield_now().await;
            }

            let Some(node) = self.nodes.get(&id).cloned() else {
                return Value::error_msg(
                    ErrorCode::Validation,
                    format!("node '{id}' does not exist"),
                );
            };
            let shared = env.is_empty();
            if shared {
                self.values
                    .borrow_mut()
                    .insert(id.clone(), NodeSlot::InFlight);
            }
            let value = match node.body {
                NodeBody::Expr { expr, .. } => self.clone().eval_value(expr, env, depth).await,
                NodeBody::Ref { pointer } => match self.resolve_ref_expr(&id, &pointer) {
                    Ok(expr) => self.clone().eval_value(expr, env, depth).await,
                    Err(e) => e,
                },
                NodeBody::Blocks { .. } => Value::error_msg(
                    ErrorCode::Domain,
                    format!("node '{id}' is a block node; the expression evaluator cannot run it"),
                ),
            };
            if shared {
                self.values
                    .borrow_mut()
                    .insert(id.clone(), NodeSlot::Done(value.clone()));
            }
            value
        }
        .boxed_local()
    }

    fn resolve_ref_expr(&self, id: &str, pointer: &str) -> Result<Expr, Value> {
        if !pointer.starts_with('#') {
            return Err(Value::error_msg(
                ErrorCode::Validation,
                format!(
                    "node '{id}': external reference '{pointer}' must be resolved before evaluation"
                ),
            ));
        }
        let mut target = match navigate(&self.doc_json, pointer) {
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
            target = match navigate(&self.doc_json, &next) {
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

    async fn resolve_name(self: Rc<Self>, name: String, env: ValueEnv, depth: usize) -> Value {
        if let Some(v) = env.lookup(&name) {
            return v.clone();
        }
        if self.nodes.contains_key(&name) {
            return self.clone().eval_node(name, env, depth).await;
        }
        let scoped = self.scope.borrow().get(&name).cloned();
        match scoped {
            Some(v) => v,
            None => Self::unbound(&name),
        }
    }

    async fn arg(self: Rc<Self>, arg: Arg, env: ValueEnv, depth: usize) -> Eval {
        let value = match arg {
            Arg::Inline(e) => self.eval_value(*e, env, depth).await,
            Arg::Node(id) => self.resolve_name(id, env, depth).await,
        };
        propagate(value)
    }

    fn eval_value(
        self: Rc<Self>,
        expr: Expr,
        env: ValueEnv,
        depth: usize,
    ) -> LocalBoxFuture<'static, Value> {
        async move { merge(self.eval(expr, env, depth).await) }.boxed_local()
    }

    fn eval(
        self: Rc<Self>,
        expr: Expr,
        env: ValueEnv,
        depth: usize,
    ) -> LocalBoxFuture<'static, Eval> {
        async move {
            if let Err(e) = self.scheduler.checkpoint().await {
                return Err(Value::Error(e));
            }

            match expr {
                Expr::Lit { ty, value } => Ok(convert_literal(&ty, &value)),

                Expr::Ref { id } => Ok(self.clone().resolve_name(id, env, depth).await),

                Expr::Var { name } => {
                    if let Some(v) = env.lookup(&name) {
                        return Ok(v.clone());
                    }
                    let scoped = self.scope.borrow().get(&name).cloned();
                    Ok(scoped.unwrap_or_else(|| Self::unbound(&name)))
                }

                Expr::Call { ns, name, args } => {
                    let mut values = Vec::with_capacity(args.len());
                    for a in args {
                        values.push(self.clone().arg(a, env.clone(), depth).await?);
                    }
                    let Some(op) = self.registry.lookup(&ns, &name) else {
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
                } => match self.clone().arg(cond, env.clone(), depth).await? {
                    Value::Bool(true) => self.clone().arg(then, env, depth).await,
                    Value::Bool(false) => self.clone().arg(otherwise, env, depth).await,
                    other => Ok(Value::error_msg(
                        ErrorCode::Type,
                        format!("if condition must be bool, got {}", other.type_name()),
                    )),
                },

                Expr::Let { name, value, body } => {
                    let bound = self.clone().arg(value, env.clone(), depth).await?;
                    let inner = env.extend(name, bound);
                    self.clone().arg(body, inner, depth).await
                }

                Expr::AirRef { ns, name, .. } => Ok(Value::error_msg(
                    ErrorCode::Validation,
                    format!("airRef '{ns}:{name}' must be desugared before evaluation"),
                )),

                Expr::Predicate { name, value } => {
                    let v = self.clone().arg(value, env, depth).await?;
                    if let Some(op) = self.registry.lookup("predicate", &name) {
                        return Ok(op.invoke(&[v]));
                    }
                    match v {
                        Value::Bool(_) => Ok(v),
                        other => Ok(Value::error_msg(
                            ErrorCode::Type,
                            format!(
                                "predicate '{name}' needs a bool, got {}",
                                other.type_name()
                            ),
                        )),
                    }
                }

                Expr::Lambda { params, body, .. } => Ok(Value::Closure(Rc::new(Closure {
                    params,
                    body,
                    env,
                }))),

                Expr::CallExpr { func, args } => {
                    let callee =
                        propagate(self.clone().resolve_name(func, env.clone(), depth).await)?;
                    let mut values = Vec::with_capacity(args.len());
                    for a in args {
                        values.push(self.clone().arg(a, env.clone(), depth).await?);
                    }
                    self.clone().apply(callee, values, depth).await
                }

                Expr::Fix { func, .. } => {
                    let wrapped =
                        propagate(self.clone().resolve_name(func, env, depth).await)?;
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
                        last = self.clone().arg(a, env.clone(), depth).await?;
                    }
                    Ok(last)
                }

                Expr::Match {
                    value,
                    cases,
                    default,
                } => {
                    let scrutinee = self.clone().arg(value, env.clone(), depth).await?;
                    for case in cases {
                        if json_to_value(&case.pattern) == scrutinee {
                            return self.clone().arg(case.body, env, depth).await;
                        }
                    }
                    match default {
                        Some(d) => self.clone().arg(d, env, depth).await,
                        None => Ok(Value::error_msg(
                            ErrorCode::Domain,
                            format!("no match arm for {scrutinee}"),
                        )),
                    }
                }

                Expr::Record { fields } => {
                    let mut map = ValueMap::new();
                    for field in fields {
                        let v = self.clone().arg(field.value, env.clone(), depth).await?;
                        map.insert(Value::str(&field.name), v);
                    }
                    Ok(Value::Map(map))
                }

                Expr::ListOf { elements } => {
                    let mut out = Vec::with_capacity(elements.len());
                    for e in elements {
                        out.push(self.clone().arg(e, env.clone(), depth).await?);
                    }
                    Ok(Value::List(out))
                }

                Expr::Seq { first, then } => {
                    self.clone().arg(first, env.clone(), depth).await?;
                    self.clone().arg(then, env, depth).await
                }

                Expr::Assign { target, value } => {
                    let v = self.clone().arg(value, env, depth).await?;
                    self.scope.borrow_mut().insert(target.clone(), v.clone());
                    if let Some(cell) = self.cells.get(&target) {
                        cell.write(v).await;
                    }
                    Ok(Value::Void)
                }

                Expr::While { cond, body } => {
                    loop {
                        match self.clone().arg(cond.clone(), env.clone(), depth).await? {
                            Value::Bool(true) => {
                                self.clone().arg(body.clone(), env.clone(), depth).await?;
                            }
                            Value::Bool(false) => break,
                            other => {
                                return Ok(Value::error_msg(
                                    ErrorCode::Type,
                                    format!(
                                        "while condition must be bool, got {}",
                                        other.type_name()
                                    ),
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
                    let initial = self.clone().arg(init, env.clone(), depth).await?;
                    self.scope.borrow_mut().insert(var.clone(), initial);
                    loop {
                        match self.clone().arg(cond.clone(), env.clone(), depth).await? {
                            Value::Bool(true) => {}
                            Value::Bool(false) => break,
                            other => {
                                return Ok(Value::error_msg(
                                    ErrorCode::Type,
                                    format!(
                                        "for condition must be bool, got {}",
                                        other.type_name()
                                    ),
                                ))
                            }
                        }
                        self.clone().arg(body.clone(), env.clone(), depth).await?;
                        let next = self.clone().arg(update.clone(), env.clone(), depth).await?;
                        self.scope.borrow_mut().insert(var.clone(), next);
                    }
                    Ok(Value::Void)
                }

                Expr::Iter { var, iter, body } => {
                    let items = match self.clone().arg(iter, env.clone(), depth).await? {
                        Value::List(items) => items,
                        other => {
                            return Ok(Value::error_msg(
                                ErrorCode::Type,
                                format!("iter needs a list, got {}", other.type_name()),
                            ))
                        }
                    };
                    for item in items {
                        self.scope.borrow_mut().insert(var.clone(), item);
                        self.clone().arg(body.clone(), env.clone(), depth).await?;
                    }
                    Ok(Value::Void)
                }

                Expr::Effect { op, args } => {
                    // Arguments evaluate strictly left to right.
                    let mut values = Vec::with_capacity(args.len());
                    for a in args {
                        values.push(self.clone().arg(a, env.clone(), depth).await?);
                    }
                    let result = match self.registry.lookup("effect", &op) {
                        Some(operator) => operator.invoke(&values),
                        None => Value::Void,
                    };
                    let outcome = match result.as_error() {
                        Some(e) => Err(e.clone()),
                        None => Ok(result.clone()),
                    };
                    self.log
                        .record(self.scheduler.current_task(), op, values, outcome);
                    Ok(result)
                }

                Expr::RefCell { target } => {
                    let initial = self
                        .scope
                        .borrow()
                        .get(&target)
                        .cloned()
                        .unwrap_or(Value::Void);
                    self.cells.get_or_create(&target, initial);
                    Ok(Value::Cell { cell: target })
                }

                Expr::Deref { target } => {
                    if let Some(cell) = self.cells.get(&target) {
                        return Ok(cell.read().await);
                    }
                    let scoped = self.scope.borrow().get(&target).cloned();
                    Ok(scoped.unwrap_or_else(|| Self::unbound(&target)))
                }

                Expr::Try {
                    try_body,
                    catch_param,
                    catch_body,
                    fallback,
                } => {
                    let attempt = merge(self.clone().arg(try_body, env.clone(), depth).await);
                    if !attempt.is_error() {
                        return Ok(attempt);
                    }
                    let inner = env.extend(catch_param, attempt);
                    let caught = merge(self.clone().arg(catch_body, inner, depth).await);
                    if caught.is_error() {
                        if let Some(f) = fallback {
                            return Ok(merge(self.clone().arg(f, env, depth).await));
                        }
                    }
                    Ok(caught)
                }

                Expr::Spawn { task } => {
                    let body = self.clone().eval_node(task, ValueEnv::empty(), 0);
                    let id = self.scheduler.spawn(body);
                    trace!(task = %id, "spawned task");
                    Ok(Value::Future(FutureHandle::pending(id)))
                }

                Expr::Await {
                    future,
                    timeout,
                    fallback,
                    return_index,
                } => {
                    let fv = self.clone().arg(future, env.clone(), depth).await?;
                    let task = match Self::task_of(&fv) {
                        Ok(t) => t,
                        Err(e) => return Ok(e),
                    };
                    match self.clone().wait_for_task(task, timeout).await {
                        Some(v) => Ok(if return_index { index_result(0, v) } else { v }),
                        None => {
                            let v = match fallback {
                                Some(f) => merge(self.clone().arg(f, env, depth).await),
                                None => Value::error_msg(
                                    ErrorCode::Timeout,
                                    format!("await on {task} timed out"),
                                ),
                            };
                            Ok(if return_index { index_result(-1, v) } else { v })
                        }
                    }
                }

                Expr::Par { branches } => {
                    let mut tasks = Vec::with_capacity(branches.len());
                    for branch in branches {
                        let body = self.clone().eval_node(branch, ValueEnv::empty(), 0);
                        tasks.push(self.scheduler.spawn(body));
                    }
                    let mut results = Vec::with_capacity(tasks.len());
                    for task in tasks {
                        let v = self.scheduler.await_task(task).await;
                        if v.is_error() {
                            return Ok(v);
                        }
                        results.push(v);
                    }
                    Ok(Value::List(results))
                }

                Expr::Select {
                    futures,
                    timeout,
                    fallback,
                    return_index,
                } => {
                    let mut tasks = Vec::with_capacity(futures.len());
                    for node in futures {
                        let v = self.clone().eval_node(node, ValueEnv::empty(), 0).await;
                        match Self::task_of(&v) {
                            Ok(t) => tasks.push(t),
                            Err(e) => return Ok(e),
                        }
                    }
                    match self.clone().wait_for_first(&tasks, timeout).await {
                        Some((index, v)) => Ok(if return_index {
                            index_result(index as i64, v)
                        } else {
                            v
                        }),
                        None => {
                            let v = match fallback {
                                Some(f) => merge(self.clone().arg(f, env, depth).await),
                                None => Value::error_msg(
                                    ErrorCode::Timeout,
                                    "select timed out with no fallback",
                                ),
                            };
                            Ok(if return_index { index_result(-1, v) } else { v })
                        }
                    }
                }

                Expr::Race { tasks } => {
                    let mut ids = Vec::with_capacity(tasks.len());
                    for node in tasks {
                        let v = self.clone().eval_node(node, ValueEnv::empty(), 0).await;
                        match Self::task_of(&v) {
                            Ok(t) => ids.push(t),
                            Err(e) => return Ok(e),
                        }
                    }
                    match self.clone().wait_for_first(&ids, None).await {
                        Some((index, v)) => {
                            for (i, id) in ids.iter().enumerate() {
                                if i != index {
                                    self.scheduler.cancel(*id);
                                }
                            }
                            Ok(v)
                        }
                        None => Ok(Value::error_msg(ErrorCode::Timeout, "race timed out")),
                    }
                }

                Expr::Channel { buffer_size, .. } => {
                    let capacity = buffer_size.unwrap_or(0);
                    let id = self.channels.create(capacity);
                    let kind = if capacity == 0 {
                        ChannelKind::Rendezvous
                    } else {
                        ChannelKind::Buffered
                    };
                    Ok(Value::Channel { id, kind })
                }

                Expr::Send { channel, value } => {
                    let chv = self.clone().arg(channel, env.clone(), depth).await?;
                    let v = self.clone().arg(value, env, depth).await?;
                    let Value::Channel { id, .. } = chv else {
                        return Ok(Value::error_msg(
                            ErrorCode::Type,
                            format!("send needs a channel, got {}", chv.type_name()),
                        ));
                    };
                    let Some(ch) = self.channels.get(id) else {
                        return Ok(Value::error_msg(
                            ErrorCode::Validation,
                            format!("channel {id} does not exist"),
                        ));
                    };
                    let result = ch.send(v.clone()).await;
                    let outcome = match &result {
                        Ok(()) => Ok(Value::Void),
                        Err(e) => Err(e.clone()),
                    };
                    self.log.record(
                        self.scheduler.current_task(),
                        "send",
                        vec![chv, v],
                        outcome,
                    );
                    Ok(match result {
                        Ok(()) => Value::Void,
                        Err(e) => Value::Error(e),
                    })
                }

                Expr::Recv { channel } => {
                    let chv = self.clone().arg(channel, env, depth).await?;
                    let Value::Channel { id, .. } = chv else {
                        return Ok(Value::error_msg(
                            ErrorCode::Type,
                            format!("recv needs a channel, got {}", chv.type_name()),
                        ));
                    };
                    let Some(ch) = self.channels.get(id) else {
                        return Ok(Value::error_msg(
                            ErrorCode::Validation,
                            format!("channel {id} does not exist"),
                        ));
                    };
                    let result = ch.recv().await;
                    let outcome = result.clone();
                    self.log
                        .record(self.scheduler.current_task(), "recv", vec![chv], outcome);
                    Ok(match result {
                        Ok(v) => v,
                        Err(e) => Value::Error(e),
                    })
                }
            }
        }
        .boxed_local()
    }

    /// Waits for one task, with an optional step-based timeout. `None`
    /// means the timeout fired.
    async fn wait_for_task(self: Rc<Self>, task: TaskId, timeout: Option<u64>) -> Option<Value> {
        let Some(steps) = timeout else {
            return Some(self.scheduler.await_task(task).await);
        };
        let deadline = self.scheduler.global_steps() + steps;
        loop {
            if self.scheduler.is_complete(task) {
                return Some(self.scheduler.await_task(task).await);
            }
            if self.scheduler.global_steps() >= deadline {
                return None;
            }
            if let Err(e) = self.scheduler.checkpoint().await {
                return Some(Value::Error(e));
            }
            yield_now().await;
        }
    }

    /// Waits for the first of several tasks, with an optional step-based
    /// timeout; returns the winner's index and value.
    async fn wait_for_first(
        self: Rc<Self>,
        tasks: &[TaskId],
        timeout: Option<u64>,
    ) -> Option<(usize, Value)> {
        let deadline = timeout.map(|steps| self.scheduler.global_steps() + steps);
        loop {
            for (i, task) in tasks.iter().enumerate() {
                if self.scheduler.is_complete(*task) {
                    return Some((i, self.scheduler.await_task(*task).await));
                }
            }
            if let Some(d) = deadline {
                if self.scheduler.global_steps() >= d {
                    return None;
                }
            }
            if let Err(e) = self.scheduler.checkpoint().await {
                return Some((0, Value::Error(e)));
            }
            yield_now().await;
        }
    }

    fn apply(
        self: Rc<Self>,
        callee: Value,
        args: Vec<Value>,
        depth: usize,
    ) -> LocalBoxFuture<'static, Eval> {
        async move {
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
                            let v = self
                                .clone()
                                .eval_value(default.clone(), closure.env.clone(), depth + 1)
                                .await;
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
                    Ok(self
                        .clone()
                        .eval_node(closure.body.clone(), env, depth + 1)
                        .await)
                }
                Value::Fixpoint(closure) => {
                    let self_value = Value::Fixpoint(closure.clone());
                    let unrolled = merge(
                        self.clone()
                            .apply(Value::Closure(closure), vec![self_value], depth + 1)
                            .await,
                    );
                    if unrolled.is_error() {
                        return Ok(unrolled);
                    }
                    self.clone().apply(unrolled, args, depth + 1).await
                }
                other => Ok(Value::error_msg(
                    ErrorCode::Type,
                    format!("'{}' is not callable", other.type_name()),
                )),
            }
        }
        .boxed_local()
    }
}
