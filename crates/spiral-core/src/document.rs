//! SPIRAL documents and structural validation.
//!
//! A [`Document`] is an immutable node graph plus reusable `airDef`
//! definitions and a designated result node. Validation enforces the layer
//! contract: id uniqueness and syntax, reference resolvability, and
//! per-layer admissibility of every expression, instruction, and terminator
//! kind. Async kinds additionally require the `"async"` capability.
//!
//! Validation reports aggregate everything that is wrong
//! ([`ValidationReport`], the boundary form) rather than stopping at the
//! first problem; [`Document::validate_strict`] converts the first issue
//! into a [`SpiralError`] for callers that want a `Result`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::SpiralError;
use crate::expr::{Arg, Expr, Layer};
use crate::node::{InstructionClass, Node, NodeBody, NodeId};
use crate::types::SpiralType;

/// Capability string gating async expression kinds.
pub const CAP_ASYNC: &str = "async";
/// Capability string advertising effect support.
pub const CAP_EFFECTS: &str = "effects";

/// A reusable pure definition, desugared into a lambda before checking and
/// evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirDef {
    pub ns: String,
    pub name: String,
    pub params: Vec<String>,
    pub result: SpiralType,
    pub body: Expr,
}

/// A SPIRAL document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Semver `X.Y.Z(-prerelease)?`.
    pub version: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,

    /// Optional advertised function signatures; passed through untouched.
    #[serde(
        rename = "functionSigs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub function_sigs: Option<IndexMap<String, SpiralType>>,

    #[serde(rename = "airDefs", default, skip_serializing_if = "Vec::is_empty")]
    pub air_defs: Vec<AirDef>,

    pub nodes: Vec<Node>,

    /// Id of the node whose value is the document's result.
    pub result: NodeId,
}

/// One problem found by validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

/// Aggregate validation outcome, shaped for the tool boundary:
/// `{valid: false, errors: [{path, message}]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn ok() -> Self {
        ValidationReport {
            valid: true,
            errors: Vec::new(),
        }
    }

    fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.valid = false;
        self.errors.push(ValidationIssue {
            path: path.into(),
            message: message.into(),
        });
    }
}

/// `[a-zA-Z_][a-zA-Z0-9_]*`
pub fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Semver `N.N.N` with an optional non-empty `-prerelease` suffix of
/// alphanumerics, dots, and hyphens.
pub fn is_valid_version(s: &str) -> bool {
    let (core, prerelease) = match s.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (s, None),
    };
    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() != 3 {
        return false;
    }
    if !parts
        .iter()
        .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
    {
        return false;
    }
    match prerelease {
        None => true,
        Some(pre) => {
            !pre.is_empty()
                && pre
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        }
    }
}

/// Applies `f` to `expr` and every inline sub-expression (argument
/// positions, lambda parameter defaults). Does not follow node references.
pub fn walk_expr<'a>(expr: &'a Expr, f: &mut impl FnMut(&'a Expr)) {
    f(expr);
    for arg in expr.child_args() {
        if let Arg::Inline(inner) = arg {
            walk_expr(inner, f);
        }
    }
    if let Expr::Lambda { params, .. } = expr {
        for p in params {
            if let Some(default) = &p.default {
                walk_expr(default, f);
            }
        }
    }
}

/// Names bound somewhere inside `expr`: lambda parameters, let bindings,
/// loop variables, assignment targets, and catch parameters.
fn collect_bound_names(expr: &Expr, out: &mut HashSet<String>) {
    walk_expr(expr, &mut |e| match e {
        Expr::Lambda { params, .. } => {
            for p in params {
                out.insert(p.name.clone());
            }
        }
        Expr::Let { name, .. } => {
            out.insert(name.clone());
        }
        Expr::For { var, .. } | Expr::Iter { var, .. } => {
            out.insert(var.clone());
        }
        Expr::Assign { target, .. } => {
            out.insert(target.clone());
        }
        Expr::Try { catch_param, .. } => {
            out.insert(catch_param.clone());
        }
        _ => {}
    });
}

/// String references made by `expr` that must resolve to a node or a bound
/// name.
fn collect_references(expr: &Expr, out: &mut Vec<String>) {
    walk_expr(expr, &mut |e| {
        for id in e.direct_node_refs() {
            out.push(id.to_string());
        }
        for arg in e.child_args() {
            if let Arg::Node(id) = arg {
                out.push(id.clone());
            }
        }
        // `refCell`/`deref`/`assign` targets name mutable slots; the EIR
        // checker resolves those, not document validation.
    });
}

impl Document {
    /// Creates a document with defaulted optional sections.
    pub fn new(version: impl Into<String>, nodes: Vec<Node>, result: impl Into<String>) -> Self {
        Document {
            version: version.into(),
            capabilities: Vec::new(),
            function_sigs: None,
            air_defs: Vec::new(),
            nodes,
            result: result.into(),
        }
    }

    pub fn with_capability(mut self, cap: impl Into<String>) -> Self {
        self.capabilities.push(cap.into());
        self
    }

    pub fn with_air_defs(mut self, defs: Vec<AirDef>) -> Self {
        self.air_defs = defs;
        self
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.iter().any(|c| c == cap)
    }

    /// Looks a node up by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Id -> node map in document order.
    pub fn node_map(&self) -> IndexMap<&str, &Node> {
        self.nodes.iter().map(|n| (n.id.as_str(), n)).collect()
    }

    /// Validates the document against a layer, aggregating all issues.
    pub fn validate(&self, layer: Layer) -> ValidationReport {
        let mut report = ValidationReport::ok();
        let async_cap = self.has_capability(CAP_ASYNC);

        if !is_valid_version(&self.version) {
            report.push("/version", format!("invalid version '{}'", self.version));
        }

        for (i, def) in self.air_defs.iter().enumerate() {
            let path = format!("/airDefs/{i}");
            if !is_valid_identifier(&def.ns) || !is_valid_identifier(&def.name) {
                report.push(&path, format!("invalid definition name '{}:{}'", def.ns, def.name));
            }
            for p in &def.params {
                if !is_valid_identifier(p) {
                    report.push(&path, format!("invalid parameter name '{p}'"));
                }
            }
            // airDef bodies are AIR expressions regardless of document layer.
            walk_expr(&def.body, &mut |e| {
                if !Layer::Air.admits(e.class(), false) && !matches!(e, Expr::AirRef { .. }) {
                    report.push(
                        format!("{path}/body"),
                        format!("expression kind '{}' is not AIR", e.kind_name()),
                    );
                }
            });
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for (i, node) in self.nodes.iter().enumerate() {
            let path = format!("/nodes/{i}");
            if !is_valid_identifier(&node.id) {
                report.push(&path, format!("invalid node id '{}'", node.id));
            }
            if !seen.insert(node.id.as_str()) {
                report.push(&path, format!("duplicate node id '{}'", node.id));
            }
        }

        // Every name that may legitimately be the target of a string
        // reference: node ids plus names bound by some construct.
        let mut known: HashSet<String> = self.nodes.iter().map(|n| n.id.clone()).collect();
        for def in &self.air_defs {
            for p in &def.params {
                known.insert(p.clone());
            }
        }
        for node in &self.nodes {
            if let Some(expr) = node.as_expr() {
                collect_bound_names(expr, &mut known);
            }
        }

        for (i, node) in self.nodes.iter().enumerate() {
            let path = format!("/nodes/{i}");
            match &node.body {
                NodeBody::Ref { pointer } => {
                    if pointer.is_empty() {
                        report.push(&path, "empty $ref pointer");
                    }
                }
                NodeBody::Expr { expr, .. } => {
                    walk_expr(expr, &mut |e| {
                        if !layer.admits(e.class(), async_cap) {
                            report.push(
                                format!("{path}/expr"),
                                format!(
                                    "expression kind '{}' is not admissible in this document",
                                    e.kind_name()
                                ),
                            );
                        }
                    });
                    let mut refs = Vec::new();
                    collect_references(expr, &mut refs);
                    for r in refs {
                        if !known.contains(&r) {
                            report.push(
                                format!("{path}/expr"),
                                format!("reference to unknown id '{r}'"),
                            );
                        }
                    }
                }
                NodeBody::Blocks { blocks, entry, .. } => {
                    self.validate_blocks(layer, async_cap, &path, blocks, entry, &mut report);
                }
            }
        }

        if !self.result.is_empty() && !seen.contains(self.result.as_str()) {
            report.push("/result", format!("result node '{}' not found", self.result));
        }

        report
    }

    fn validate_blocks(
        &self,
        layer: Layer,
        async_cap: bool,
        path: &str,
        blocks: &[crate::node::BasicBlock],
        entry: &str,
        report: &mut ValidationReport,
    ) {
        let ids: HashSet<&str> = blocks.iter().map(|b| b.id.as_str()).collect();
        if ids.len() != blocks.len() {
            report.push(path, "duplicate block ids");
        }
        if !ids.contains(entry) {
            report.push(path, format!("entry block '{entry}' not found"));
        }
        for block in blocks {
            for inst in &block.instructions {
                let admissible = match inst.class() {
                    InstructionClass::Core => true,
                    InstructionClass::Eir => matches!(layer, Layer::Eir | Layer::Lir),
                    InstructionClass::Async => {
                        matches!(layer, Layer::Eir | Layer::Lir) && async_cap
                    }
                };
                if !admissible {
                    report.push(
                        format!("{path}/blocks/{}", block.id),
                        "instruction kind not admissible in this document",
                    );
                }
                // Expression positions inside blocks use the CIR set.
                if let crate::node::Instruction::Assign { value, .. } = inst {
                    walk_expr(value, &mut |e| {
                        if !Layer::Lir.admits(e.class(), false) {
                            report.push(
                                format!("{path}/blocks/{}", block.id),
                                format!(
                                    "expression kind '{}' is not admissible inside a block",
                                    e.kind_name()
                                ),
                            );
                        }
                    });
                }
            }
            if block.terminator.is_async() && !(matches!(layer, Layer::Eir | Layer::Lir) && async_cap)
            {
                report.push(
                    format!("{path}/blocks/{}", block.id),
                    "async terminator not admissible in this document",
                );
            }
            for succ in block.terminator.successors() {
                if !ids.contains(succ) {
                    report.push(
                        format!("{path}/blocks/{}", block.id),
                        format!("terminator targets unknown block '{succ}'"),
                    );
                }
            }
        }
    }

    /// Validates and converts the first issue into an error.
    pub fn validate_strict(&self, layer: Layer) -> Result<(), SpiralError> {
        let report = self.validate(layer);
        match report.errors.into_iter().next() {
            None => Ok(()),
            Some(issue) => Err(SpiralError::Validation {
                message: issue.message,
                path: Some(issue.path),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{LambdaParam, MatchCase, RecordField};
    use crate::node::{BasicBlock, Instruction, Terminator};
    use proptest::prelude::*;

    fn minimal_doc(layer_exprs: Vec<Node>, result: &str) -> Document {
        Document::new("1.0.0", layer_exprs, result)
    }

    /// One representative expression per kind, for the admissibility sweep.
    fn example_exprs() -> Vec<Expr> {
        vec![
            Expr::int_lit(1),
            Expr::reference("n"),
            Expr::var("x"),
            Expr::call("core", "add", vec![]),
            Expr::If {
                cond: Arg::inline(Expr::bool_lit(true)),
                then: Arg::inline(Expr::int_lit(1)),
                otherwise: Arg::inline(Expr::int_lit(2)),
                ty: None,
            },
            Expr::Let {
                name: "x".into(),
                value: Arg::inline(Expr::int_lit(1)),
                body: Arg::inline(Expr::var("x")),
            },
            Expr::AirRef {
                ns: "m".into(),
                name: "f".into(),
                args: vec![],
            },
            Expr::Predicate {
                name: "positive".into(),
                value: Arg::inline(Expr::int_lit(1)),
            },
            Expr::Lambda {
                params: vec![LambdaParam::named("x")],
                body: "n".into(),
                ty: SpiralType::function(vec![SpiralType::Int], SpiralType::Int),
            },
            Expr::CallExpr {
                func: "n".into(),
                args: vec![],
            },
            Expr::Fix {
                func: "n".into(),
                ty: SpiralType::Int,
            },
            Expr::Do {
                exprs: vec![Arg::inline(Expr::int_lit(1))],
            },
            Expr::Match {
                value: Arg::inline(Expr::int_lit(1)),
                cases: vec![MatchCase {
                    pattern: serde_json::json!(1),
                    body: Arg::inline(Expr::int_lit(1)),
                }],
                default: None,
            },
            Expr::Record {
                fields: vec![RecordField {
                    name: "a".into(),
                    value: Arg::inline(Expr::int_lit(1)),
                }],
            },
            Expr::ListOf {
                elements: vec![Arg::inline(Expr::int_lit(1))],
            },
            Expr::Seq {
                first: Arg::inline(Expr::int_lit(1)),
                then: Arg::inline(Expr::int_lit(2)),
            },
            Expr::Assign {
                target: "x".into(),
                value: Arg::inline(Expr::int_lit(1)),
            },
            Expr::While {
                cond: Arg::inline(Expr::bool_lit(false)),
                body: Arg::inline(Expr::int_lit(1)),
            },
            Expr::For {
                var: "i".into(),
                init: Arg::inline(Expr::int_lit(0)),
                cond: Arg::inline(Expr::bool_lit(false)),
                update: Arg::inline(Expr::int_lit(1)),
                body: Arg::inline(Expr::int_lit(1)),
            },
            Expr::Iter {
                var: "x".into(),
                iter: Arg::inline(Expr::lit(
                    SpiralType::list(SpiralType::Int),
                    serde_json::json!([]),
                )),
                body: Arg::inline(Expr::int_lit(1)),
            },
            Expr::Effect {
                op: "log".into(),
                args: vec![],
            },
            Expr::RefCell { target: "x".into() },
            Expr::Deref { target: "x".into() },
            Expr::Try {
                try_body: Arg::inline(Expr::int_lit(1)),
                catch_param: "e".into(),
                catch_body: Arg::inline(Expr::int_lit(0)),
                fallback: None,
            },
            Expr::Par { branches: vec![] },
            Expr::Spawn { task: "n".into() },
            Expr::Await {
                future: Arg::inline(Expr::int_lit(1)),
                timeout: None,
                fallback: None,
                return_index: false,
            },
            Expr::Channel {
                channel_type: SpiralType::Int,
                buffer_size: Some(1),
            },
            Expr::Send {
                channel: Arg::inline(Expr::int_lit(1)),
                value: Arg::inline(Expr::int_lit(1)),
            },
            Expr::Recv {
                channel: Arg::inline(Expr::int_lit(1)),
            },
            Expr::Select {
                futures: vec![],
                timeout: None,
                fallback: None,
                return_index: false,
            },
            Expr::Race { tasks: vec![] },
        ]
    }

    #[test]
    fn identifier_syntax() {
        assert!(is_valid_identifier("abc"));
        assert!(is_valid_identifier("_x9"));
        assert!(is_valid_identifier("__airdef_math_square"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("9x"));
        assert!(!is_valid_identifier("a-b"));
        assert!(!is_valid_identifier("a b"));
    }

    #[test]
    fn version_syntax() {
        assert!(is_valid_version("1.0.0"));
        assert!(is_valid_version("0.12.3"));
        assert!(is_valid_version("1.0.0-alpha.1"));
        assert!(!is_valid_version("1.0"));
        assert!(!is_valid_version("1.0.0-"));
        assert!(!is_valid_version("v1.0.0"));
        assert!(!is_valid_version("1.0.0.0"));
    }

    #[test]
    fn valid_air_document_passes() {
        let doc = minimal_doc(
            vec![
                Node::expr("a", Expr::int_lit(3)),
                Node::expr(
                    "sum",
                    Expr::call("core", "add", vec![Arg::node("a"), Arg::node("a")]),
                ),
            ],
            "sum",
        );
        let report = doc.validate(Layer::Air);
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn duplicate_ids_rejected() {
        let doc = minimal_doc(
            vec![
                Node::expr("a", Expr::int_lit(1)),
                Node::expr("a", Expr::int_lit(2)),
            ],
            "a",
        );
        let report = doc.validate(Layer::Air);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.message.contains("duplicate")));
    }

    #[test]
    fn unknown_reference_rejected() {
        let doc = minimal_doc(
            vec![Node::expr("a", Expr::reference("missing"))],
            "a",
        );
        let report = doc.validate(Layer::Air);
        assert!(!report.valid);
        assert!(report
            .errors
            .iter()
            .any(|e| e.message.contains("unknown id 'missing'")));
    }

    #[test]
    fn missing_result_rejected() {
        let doc = minimal_doc(vec![Node::expr("a", Expr::int_lit(1))], "nope");
        let report = doc.validate(Layer::Air);
        assert!(!report.valid);
    }

    #[test]
    fn every_kind_outside_its_layer_fails_validation() {
        // Inserting a node of kind K into a minimal document of layer L
        // must fail exactly when L does not admit K.
        for expr in example_exprs() {
            let class = expr.class();
            for layer in [Layer::Air, Layer::Cir, Layer::Eir] {
                // A helper node so references inside the example resolve.
                let doc = minimal_doc(
                    vec![
                        Node::expr("n", Expr::int_lit(0)),
                        Node::expr("probe", expr.clone()),
                    ],
                    "n",
                );
                let report = doc.validate(layer);
                let admitted = layer.admits(class, false);
                assert_eq!(
                    report.valid,
                    admitted,
                    "kind {} in layer {:?}: expected admitted={admitted}, got {:?}",
                    expr.kind_name(),
                    layer,
                    report.errors,
                );
            }
        }
    }

    #[test]
    fn async_kinds_require_capability() {
        let spawn_doc = minimal_doc(
            vec![
                Node::expr("n", Expr::int_lit(0)),
                Node::expr("s", Expr::Spawn { task: "n".into() }),
            ],
            "n",
        );
        assert!(!spawn_doc.validate(Layer::Eir).valid);

        let with_cap = spawn_doc.with_capability(CAP_ASYNC);
        assert!(with_cap.validate(Layer::Eir).valid);
    }

    #[test]
    fn block_node_validation() {
        let good = Node::blocks(
            "main",
            vec![
                BasicBlock::new(
                    "bb0",
                    vec![Instruction::Assign {
                        target: "x".into(),
                        value: Expr::int_lit(1),
                    }],
                    Terminator::Jump { to: "bb1".into() },
                ),
                BasicBlock::new(
                    "bb1",
                    vec![],
                    Terminator::Return {
                        value: Some("x".into()),
                    },
                ),
            ],
            "bb0",
        );
        let doc = minimal_doc(vec![good], "main");
        assert!(doc.validate(Layer::Lir).valid);

        let dangling = Node::blocks(
            "main",
            vec![BasicBlock::new(
                "bb0",
                vec![],
                Terminator::Jump { to: "bb9".into() },
            )],
            "bb0",
        );
        let doc = minimal_doc(vec![dangling], "main");
        let report = doc.validate(Layer::Lir);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.message.contains("bb9")));
    }

    #[test]
    fn assign_value_in_block_rejects_eir_kinds() {
        let node = Node::blocks(
            "main",
            vec![BasicBlock::new(
                "bb0",
                vec![Instruction::Assign {
                    target: "x".into(),
                    value: Expr::Assign {
                        target: "y".into(),
                        value: Arg::inline(Expr::int_lit(1)),
                    },
                }],
                Terminator::Return { value: None },
            )],
            "bb0",
        );
        let doc = minimal_doc(vec![node], "main");
        let report = doc.validate(Layer::Lir);
        assert!(!report.valid);
    }

    #[test]
    fn boundary_report_shape_serializes() {
        let doc = minimal_doc(vec![Node::expr("a", Expr::int_lit(1))], "gone");
        let report = doc.validate(Layer::Air);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["valid"], false);
        assert!(json["errors"][0]["path"].is_string());
        assert!(json["errors"][0]["message"].is_string());
    }

    #[test]
    fn document_serde_roundtrip() {
        let doc = minimal_doc(
            vec![
                Node::expr("a", Expr::int_lit(3)),
                Node::expr("b", Expr::int_lit(4)),
                Node::expr(
                    "sum",
                    Expr::call("core", "add", vec![Arg::node("a"), Arg::node("b")]),
                ),
            ],
            "sum",
        )
        .with_capability(CAP_ASYNC);
        let json = serde_json::to_string(&doc).unwrap();
        let back: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(doc, back);
    }

    proptest! {
        #[test]
        fn generated_identifiers_validate(s in "[a-zA-Z_][a-zA-Z0-9_]{0,12}") {
            prop_assert!(is_valid_identifier(&s));
        }

        #[test]
        fn digit_led_identifiers_fail(s in "[0-9][a-zA-Z0-9_]{0,12}") {
            prop_assert!(!is_valid_identifier(&s));
        }

        #[test]
        fn generated_versions_validate(
            major in 0u32..100,
            minor in 0u32..100,
            patch in 0u32..100,
        ) {
            let version = format!("{}.{}.{}", major, minor, patch);
            prop_assert!(is_valid_version(&version));
        }
    }
}
