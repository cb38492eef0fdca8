//! Desugaring of `airDef` definitions into lambda nodes.
//!
//! Each definition `{ns, name, params, result, body}` becomes two synthetic
//! nodes: a body node `__airdef_{ns}_{name}_body` holding the definition
//! body, and a lambda node `__airdef_{ns}_{name}` typed
//! `fn([int; params], result)`. Every `airRef` expression anywhere in the
//! document (including inside other definition bodies) is rewritten to a
//! `callExpr` against the synthetic lambda.
//!
//! The input document is never mutated; the output is a fresh document with
//! an empty `airDefs` section and nodes ordered `[synthetic..., rewritten...]`.
//! `$ref` and block nodes pass through untouched.

use std::collections::HashSet;

use tracing::trace;

use spiral_core::document::{AirDef, Document};
use spiral_core::error::SpiralError;
use spiral_core::expr::{Arg, Expr, LambdaParam, MatchCase, RecordField};
use spiral_core::node::{Node, NodeBody};
use spiral_core::types::SpiralType;

/// Name of the synthetic lambda node for a definition.
pub fn lambda_node_id(ns: &str, name: &str) -> String {
    format!("__airdef_{ns}_{name}")
}

/// Name of the synthetic body node for a definition.
pub fn body_node_id(ns: &str, name: &str) -> String {
    format!("__airdef_{ns}_{name}_body")
}

fn rewrite_arg(arg: &Arg) -> Arg {
    match arg {
        Arg::Node(id) => Arg::Node(id.clone()),
        Arg::Inline(e) => Arg::Inline(Box::new(rewrite_expr(e))),
    }
}

fn rewrite_args(args: &[Arg]) -> Vec<Arg> {
    args.iter().map(rewrite_arg).collect()
}

/// Rewrites every `airRef` under every composite position to a `callExpr`
/// against its synthetic lambda node.
pub fn rewrite_expr(expr: &Expr) -> Expr {
    match expr {
        Expr::AirRef { ns, name, args } => Expr::CallExpr {
            func: lambda_node_id(ns, name),
            args: args.iter().cloned().map(Arg::Node).collect(),
        },

        Expr::Lit { .. } | Expr::Ref { .. } | Expr::Var { .. } => expr.clone(),

        Expr::Call { ns, name, args } => Expr::Call {
            ns: ns.clone(),
            name: name.clone(),
            args: rewrite_args(args),
        },
        Expr::If {
            cond,
            then,
            otherwise,
            ty,
        } => Expr::If {
            cond: rewrite_arg(cond),
            then: rewrite_arg(then),
            otherwise: rewrite_arg(otherwise),
            ty: ty.clone(),
        },
        Expr::Let { name, value, body } => Expr::Let {
            name: name.clone(),
            value: rewrite_arg(value),
            body: rewrite_arg(body),
        },
        Expr::Predicate { name, value } => Expr::Predicate {
            name: name.clone(),
            value: rewrite_arg(value),
        },

        Expr::Lambda { params, body, ty } => Expr::Lambda {
            params: params
                .iter()
                .map(|p| LambdaParam {
                    name: p.name.clone(),
                    ty: p.ty.clone(),
                    optional: p.optional,
                    default: p.default.as_ref().map(rewrite_expr),
                })
                .collect(),
            body: body.clone(),
            ty: ty.clone(),
        },
        Expr::CallExpr { func, args } => Expr::CallExpr {
            func: func.clone(),
            args: rewrite_args(args),
        },
        Expr::Fix { .. } => expr.clone(),
        Expr::Do { exprs } => Expr::Do {
            exprs: rewrite_args(exprs),
        },
        Expr::Match {
            value,
            cases,
            default,
        } => Expr::Match {
            value: rewrite_arg(value),
            cases: cases
                .iter()
                .map(|c| MatchCase {
                    pattern: c.pattern.clone(),
                    body: rewrite_arg(&c.body),
                })
                .collect(),
            default: default.as_ref().map(rewrite_arg),
        },
        Expr::Record { fields } => Expr::Record {
            fields: fields
                .iter()
                .map(|f| RecordField {
                    name: f.name.clone(),
                    value: rewrite_arg(&f.value),
                })
                .collect(),
        },
        Expr::ListOf { elements } => Expr::ListOf {
            elements: rewrite_args(elements),
        },

        Expr::Seq { first, then } => Expr::Seq {
            first: rewrite_arg(first),
            then: rewrite_arg(then),
        },
        Expr::Assign { target, value } => Expr::Assign {
            target: target.clone(),
            value: rewrite_arg(value),
        },
        Expr::While { cond, body } => Expr::While {
            cond: rewrite_arg(cond),
            body: rewrite_arg(body),
        },
        Expr::For {
            var,
            init,
            cond,
            update,
            body,
        } => Expr::For {
            var: var.clone(),
            init: rewrite_arg(init),
            cond: rewrite_arg(cond),
            update: rewrite_arg(update),
            body: rewrite_arg(body),
        },
        Expr::Iter { var, iter, body } => Expr::Iter {
            var: var.clone(),
            iter: rewrite_arg(iter),
            body: rewrite_arg(body),
        },
        Expr::Effect { op, args } => Expr::Effect {
            op: op.clone(),
            args: rewrite_args(args),
        },
        Expr::RefCell { .. } | Expr::Deref { .. } => expr.clone(),
        Expr::Try {
            try_body,
            catch_param,
            catch_body,
            fallback,
        } => Expr::Try {
            try_body: rewrite_arg(try_body),
            catch_param: catch_param.clone(),
            catch_body: rewrite_arg(catch_body),
            fallback: fallback.as_ref().map(rewrite_arg),
        },

        Expr::Par { .. } | Expr::Spawn { .. } | Expr::Race { .. } => expr.clone(),
        Expr::Await {
            future,
            timeout,
            fallback,
            return_index,
        } => Expr::Await {
            future: rewrite_arg(future),
            timeout: *timeout,
            fallback: fallback.as_ref().map(rewrite_arg),
            return_index: *return_index,
        },
        Expr::Channel { .. } => expr.clone(),
        Expr::Send { channel, value } => Expr::Send {
            channel: rewrite_arg(channel),
            value: rewrite_arg(value),
        },
        Expr::Recv { channel } => Expr::Recv {
            channel: rewrite_arg(channel),
        },
        Expr::Select {
            futures,
            timeout,
            fallback,
            return_index,
        } => Expr::Select {
            futures: futures.clone(),
            timeout: *timeout,
            fallback: fallback.as_ref().map(rewrite_arg),
            return_index: *return_index,
        },
    }
}

fn synthesize_def_nodes(def: &AirDef) -> (Node, Node) {
    let body_id = body_node_id(&def.ns, &def.name);
    let lambda_id = lambda_node_id(&def.ns, &def.name);

    let body_node = Node::expr(body_id.clone(), rewrite_expr(&def.body));

    let fn_type = SpiralType::function(
        def.params.iter().map(|_| SpiralType::Int).collect(),
        def.result.clone(),
    );
    let lambda_node = Node::typed_expr(
        lambda_id,
        Expr::Lambda {
            params: def.params.iter().map(LambdaParam::named).collect(),
            body: body_id,
            ty: fn_type.clone(),
        },
        fn_type,
    );

    (body_node, lambda_node)
}

/// Desugars a document: emits synthetic lambda/body nodes for every
/// `airDef` and rewrites every `airRef` to a `callExpr`.
pub fn desugar_document(doc: &Document) -> Result<Document, SpiralError> {
    let existing: HashSet<&str> = doc.nodes.iter().map(|n| n.id.as_str()).collect();

    let mut synthetic = Vec::with_capacity(doc.air_defs.len() * 2);
    for def in &doc.air_defs {
        let (body_node, lambda_node) = synthesize_def_nodes(def);
        for node in [&body_node, &lambda_node] {
            if existing.contains(node.id.as_str()) {
                return Err(SpiralError::validation(format!(
                    "synthetic node id '{}' collides with an existing node",
                    node.id
                )));
            }
        }
        trace!(ns = %def.ns, name = %def.name, "desugared definition");
        synthetic.push(body_node);
        synthetic.push(lambda_node);
    }

    let rewritten = doc.nodes.iter().map(|node| match &node.body {
        NodeBody::Expr { expr, ty } => Node {
            id: node.id.clone(),
            body: NodeBody::Expr {
                expr: rewrite_expr(expr),
                ty: ty.clone(),
            },
        },
        // $ref and block nodes are resolved later; pass through untouched.
        NodeBody::Ref { .. } | NodeBody::Blocks { .. } => node.clone(),
    });

    let mut nodes = synthetic;
    nodes.extend(rewritten);

    Ok(Document {
        version: doc.version.clone(),
        capabilities: doc.capabilities.clone(),
        function_sigs: doc.function_sigs.clone(),
        air_defs: Vec::new(),
        nodes,
        result: doc.result.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use spiral_core::document::walk_expr;

    fn square_def() -> AirDef {
        AirDef {
            ns: "math".into(),
            name: "square".into(),
            params: vec!["x".into()],
            result: SpiralType::Int,
            body: Expr::call("core", "mul", vec![Arg::node("x"), Arg::node("x")]),
        }
    }

    fn doc_with_airref() -> Document {
        Document::new(
            "1.0.0",
            vec![
                Node::expr("a", Expr::int_lit(5)),
                Node::expr(
                    "sq",
                    Expr::AirRef {
                        ns: "math".into(),
                        name: "square".into(),
                        args: vec!["a".into()],
                    },
                ),
            ],
            "sq",
        )
        .with_air_defs(vec![square_def()])
    }

    fn contains_airref(doc: &Document) -> bool {
        doc.nodes.iter().any(|n| {
            n.as_expr().is_some_and(|e| {
                let mut found = false;
                walk_expr(e, &mut |sub| {
                    if matches!(sub, Expr::AirRef { .. }) {
                        found = true;
                    }
                });
                found
            })
        })
    }

    #[test]
    fn desugared_document_has_no_defs_or_airrefs() {
        let out = desugar_document(&doc_with_airref()).unwrap();
        assert!(out.air_defs.is_empty());
        assert!(!contains_airref(&out));
    }

    #[test]
    fn airref_becomes_callexpr_to_synthetic_lambda() {
        let out = desugar_document(&doc_with_airref()).unwrap();
        let sq = out.node("sq").unwrap().as_expr().unwrap();
        match sq {
            Expr::CallExpr { func, args } => {
                assert_eq!(func, "__airdef_math_square");
                assert_eq!(args, &vec![Arg::node("a")]);
            }
            other => panic!("expected callExpr, got {}", other.kind_name()),
        }
    }

    #[test]
    fn synthetic_lambda_and_body_nodes_are_emitted_first() {
        let out = desugar_document(&doc_with_airref()).unwrap();
        assert_eq!(out.nodes[0].id, "__airdef_math_square_body");
        assert_eq!(out.nodes[1].id, "__airdef_math_square");

        let lambda = out.nodes[1].as_expr().unwrap();
        match lambda {
            Expr::Lambda { params, body, ty } => {
                assert_eq!(params.len(), 1);
                assert_eq!(params[0].name, "x");
                assert_eq!(body, "__airdef_math_square_body");
                assert_eq!(
                    ty,
                    &SpiralType::function(vec![SpiralType::Int], SpiralType::Int)
                );
            }
            other => panic!("expected lambda, got {}", other.kind_name()),
        }
    }

    #[test]
    fn node_ids_stay_unique() {
        let out = desugar_document(&doc_with_airref()).unwrap();
        let mut seen = HashSet::new();
        for n in &out.nodes {
            assert!(seen.insert(n.id.clone()), "duplicate id {}", n.id);
        }
    }

    #[test]
    fn airrefs_are_rewritten_under_composite_positions() {
        let nested = Expr::If {
            cond: Arg::inline(Expr::bool_lit(true)),
            then: Arg::inline(Expr::AirRef {
                ns: "math".into(),
                name: "square".into(),
                args: vec!["a".into()],
            }),
            otherwise: Arg::inline(Expr::Let {
                name: "y".into(),
                value: Arg::inline(Expr::AirRef {
                    ns: "math".into(),
                    name: "square".into(),
                    args: vec!["a".into()],
                }),
                body: Arg::node("y"),
            }),
            ty: None,
        };
        let doc = Document::new(
            "1.0.0",
            vec![Node::expr("a", Expr::int_lit(2)), Node::expr("r", nested)],
            "r",
        )
        .with_air_defs(vec![square_def()]);

        let out = desugar_document(&doc).unwrap();
        assert!(!contains_airref(&out));
    }

    #[test]
    fn airrefs_inside_other_definition_bodies_are_rewritten() {
        let quad = AirDef {
            ns: "math".into(),
            name: "quad".into(),
            params: vec!["x".into()],
            result: SpiralType::Int,
            body: Expr::AirRef {
                ns: "math".into(),
                name: "square".into(),
                args: vec!["x".into()],
            },
        };
        let doc = Document::new("1.0.0", vec![Node::expr("a", Expr::int_lit(1))], "a")
            .with_air_defs(vec![square_def(), quad]);
        let out = desugar_document(&doc).unwrap();
        assert!(!contains_airref(&out));
        assert!(out.node("__airdef_math_quad").is_some());
        assert!(out.node("__airdef_math_quad_body").is_some());
    }

    #[test]
    fn ref_and_block_nodes_pass_through() {
        let doc = Document::new(
            "1.0.0",
            vec![
                Node::expr("a", Expr::int_lit(1)),
                Node::reference("alias", "#/nodes/0"),
            ],
            "a",
        );
        let out = desugar_document(&doc).unwrap();
        assert_eq!(out.node("alias"), doc.node("alias"));
    }

    #[test]
    fn synthetic_id_collision_is_rejected() {
        let doc = Document::new(
            "1.0.0",
            vec![Node::expr("__airdef_math_square", Expr::int_lit(1))],
            "__airdef_math_square",
        )
        .with_air_defs(vec![square_def()]);
        let err = desugar_document(&doc).unwrap_err();
        assert!(err.to_string().contains("collides"));
    }

    #[test]
    fn documents_without_defs_are_unchanged_apart_from_identity() {
        let doc = Document::new("1.0.0", vec![Node::expr("a", Expr::int_lit(1))], "a");
        let out = desugar_document(&doc).unwrap();
        assert_eq!(doc, out);
    }
}
