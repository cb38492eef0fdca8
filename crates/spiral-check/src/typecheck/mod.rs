//! Layered bidirectional type checker.
//!
//! [`type_check_program`] walks a document's nodes in source order,
//! threading a growing id -> type map. Dependency order is not required:
//! references are checked against the running map, unresolved-yet references
//! to lambda parameters and bound nodes default to `int`, and anything else
//! unresolved is a validation error.
//!
//! *Bound nodes* -- nodes reachable only through lambda bodies -- are
//! skipped at the top level; their types are recorded when the containing
//! lambda is checked. The EIR extension threads a mutable-slot type map for
//! `assign`/`refCell`/`deref` (see `eir.rs`).

mod eir;
mod rules;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value as Json;
use std::collections::{HashMap, HashSet};

use spiral_core::document::{walk_expr, Document};
use spiral_core::env::{DefRegistry, TypeEnv};
use spiral_core::error::SpiralError;
use spiral_core::expr::{Arg, Expr};
use spiral_core::node::{Node, NodeBody};
use spiral_core::registry::OperatorRegistry;
use spiral_core::types::SpiralType;

use crate::resolve::navigate;

/// Result of checking a program: per-node types plus the result node's type.
#[derive(Debug, Clone, Serialize)]
pub struct ProgramTypes {
    pub node_types: IndexMap<String, SpiralType>,
    pub result_type: SpiralType,
}

/// Type-checks a whole document against an operator registry and a
/// definitions registry.
pub fn type_check_program(
    doc: &Document,
    registry: &OperatorRegistry,
    defs: &DefRegistry,
) -> Result<ProgramTypes, SpiralError> {
    Checker::new(doc, registry, defs)?.run()
}

pub(crate) struct Checker<'a> {
    nodes: IndexMap<String, Node>,
    result: String,
    doc_json: Json,
    registry: &'a OperatorRegistry,
    defs: &'a DefRegistry,
    pub(crate) node_types: IndexMap<String, SpiralType>,
    bound: HashSet<String>,
    lambda_params: HashSet<String>,
    pub(crate) mutable: HashMap<String, SpiralType>,
    /// Id of the node currently being checked, for error context.
    current: String,
}

/// Node ids referenced from within an expression (argument references and
/// direct id positions), restricted to ids that actually name nodes.
fn referenced_node_ids(expr: &Expr, nodes: &IndexMap<String, Node>) -> Vec<String> {
    let mut out = Vec::new();
    walk_expr(expr, &mut |e| {
        for id in e.direct_node_refs() {
            if nodes.contains_key(id) {
                out.push(id.to_string());
            }
        }
        for arg in e.child_args() {
            if let Arg::Node(id) = arg {
                if nodes.contains_key(id) {
                    out.push(id.clone());
                }
            }
        }
    });
    out
}

impl<'a> Checker<'a> {
    fn new(
        doc: &Document,
        registry: &'a OperatorRegistry,
        defs: &'a DefRegistry,
    ) -> Result<Self, SpiralError> {
        let doc_json = serde_json::to_value(doc).map_err(|e| {
            SpiralError::validation(format!("document serialization failed: {e}"))
        })?;

        let nodes: IndexMap<String, Node> = doc
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.clone()))
            .collect();

        let mut lambda_params = HashSet::new();
        for node in nodes.values() {
            if let Some(expr) = node.as_expr() {
                walk_expr(expr, &mut |e| {
                    if let Expr::Lambda { params, .. } = e {
                        for p in params {
                            lambda_params.insert(p.name.clone());
                        }
                    }
                });
            }
        }

        let bound = Self::compute_bound(&nodes, &doc.result);

        Ok(Checker {
            nodes,
            result: doc.result.clone(),
            doc_json,
            registry,
            defs,
            node_types: IndexMap::new(),
            bound,
            lambda_params,
            mutable: HashMap::new(),
            current: String::new(),
        })
    }

    /// Bound nodes: direct lambda-body targets, plus any node referenced
    /// only from bound nodes.
    fn compute_bound(nodes: &IndexMap<String, Node>, result: &str) -> HashSet<String> {
        let mut bound: HashSet<String> = HashSet::new();
        for node in nodes.values() {
            if let Some(expr) = node.as_expr() {
                walk_expr(expr, &mut |e| {
                    if let Expr::Lambda { body, .. } = e {
                        if nodes.contains_key(body) {
                            bound.insert(body.clone());
                        }
                    }
                });
            }
        }

        // referrers[target] = nodes whose expressions mention target
        let mut referrers: HashMap<String, HashSet<String>> = HashMap::new();
        for node in nodes.values() {
            if let Some(expr) = node.as_expr() {
                for target in referenced_node_ids(expr, nodes) {
                    referrers
                        .entry(target)
                        .or_default()
                        .insert(node.id.clone());
                }
            }
        }

        loop {
            let mut changed = false;
            for id in nodes.keys() {
                if bound.contains(id) || id == result {
                    continue;
                }
                if let Some(refs) = referrers.get(id) {
                    if !refs.is_empty() && refs.iter().all(|r| bound.contains(r)) {
                        bound.insert(id.clone());
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        bound
    }

    fn run(mut self) -> Result<ProgramTypes, SpiralError> {
        let ids: Vec<String> = self.nodes.keys().cloned().collect();
        for id in ids {
            if self.bound.contains(&id) {
                continue;
            }
            let node = self.nodes[&id].clone();
            self.check_node(&node)?;
        }

        let result_type = self
            .node_types
            .get(&self.result)
            .cloned()
            .ok_or_else(|| {
                SpiralError::validation(format!(
                    "result node '{}' was never typed",
                    self.result
                ))
            })?;

        Ok(ProgramTypes {
            node_types: self.node_types,
            result_type,
        })
    }

    fn check_node(&mut self, node: &Node) -> Result<(), SpiralError> {
        self.current = node.id.clone();
        match &node.body {
            NodeBody::Expr { expr, ty } => {
                let computed = self.check_expr(expr, &TypeEnv::empty())?;
                if let Some(declared) = ty {
                    if declared != &computed {
                        return Err(SpiralError::TypeMismatch {
                            context: format!("node '{}'", node.id),
                            expected: declared.to_string(),
                            actual: computed.to_string(),
                        });
                    }
                }
                self.node_types.insert(node.id.clone(), computed);
                Ok(())
            }
            NodeBody::Ref { pointer } => {
                let expr = self.resolve_ref_expr(&node.id, pointer)?;
                let computed = self.check_expr(&expr, &TypeEnv::empty())?;
                self.node_types.insert(node.id.clone(), computed);
                Ok(())
            }
            NodeBody::Blocks { ty, .. } => {
                // Block nodes carry their declared type; block-local typing
                // belongs to the lowering verifier.
                self.node_types
                    .insert(node.id.clone(), ty.clone().unwrap_or(SpiralType::Void));
                Ok(())
            }
        }
    }

    /// Resolves a node-level `$ref` to the expression it aliases. Only
    /// local pointers participate in checking; external URIs must be
    /// resolved before the checker runs.
    fn resolve_ref_expr(&self, id: &str, pointer: &str) -> Result<Expr, SpiralError> {
        if !pointer.starts_with('#') {
            return Err(SpiralError::validation_at(
                format!("node '{id}': external reference '{pointer}' must be resolved before type checking"),
                format!("/nodes/{id}"),
            ));
        }
        let mut target = navigate(&self.doc_json, pointer)?.clone();
        let mut hops = 0;
        while let Some(next) = target.get("$ref").and_then(Json::as_str) {
            if hops >= crate::resolve::DEFAULT_MAX_DEPTH {
                return Err(SpiralError::MaxDepthExceeded {
                    uri: pointer.to_string(),
                    limit: crate::resolve::DEFAULT_MAX_DEPTH,
                });
            }
            let next = next.to_string();
            target = navigate(&self.doc_json, &next)?.clone();
            hops += 1;
        }

        // The target is either a full node or a bare expression.
        if let Ok(node) = serde_json::from_value::<Node>(target.clone()) {
            if let NodeBody::Expr { expr, .. } = node.body {
                return Ok(expr);
            }
        }
        serde_json::from_value::<Expr>(target).map_err(|e| {
            SpiralError::validation(format!(
                "node '{id}': $ref target is neither a node nor an expression: {e}"
            ))
        })
    }

    /// The type of a node, computing it on demand for nodes that have not
    /// been visited yet (used by `callExpr` and `fix` targets). Errors in
    /// the referenced node surface to the caller.
    pub(crate) fn node_type_on_demand(
        &mut self,
        id: &str,
    ) -> Result<Option<SpiralType>, SpiralError> {
        if let Some(t) = self.node_types.get(id) {
            return Ok(Some(t.clone()));
        }
        let Some(expr) = self.nodes.get(id).and_then(Node::as_expr).cloned() else {
            return Ok(None);
        };
        let saved = std::mem::replace(&mut self.current, id.to_string());
        let result = self.check_expr(&expr, &TypeEnv::empty());
        self.current = saved;
        let ty = result?;
        self.node_types.insert(id.to_string(), ty.clone());
        Ok(Some(ty))
    }

    pub(crate) fn registry(&self) -> &OperatorRegistry {
        self.registry
    }

    pub(crate) fn defs(&self) -> &DefRegistry {
        self.defs
    }

    pub(crate) fn is_deferred_name(&self, name: &str) -> bool {
        self.lambda_params.contains(name) || self.bound.contains(name)
    }

    pub(crate) fn has_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub(crate) fn node_expr(&self, id: &str) -> Option<&Expr> {
        self.nodes.get(id).and_then(Node::as_expr)
    }

    pub(crate) fn context(&self) -> String {
        format!("node '{}'", self.current)
    }
}
