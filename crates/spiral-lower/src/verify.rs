//! Structural verification of lowered block nodes.
//!
//! Checks the lowering contract: entry at `bb0` with sequential ids, every
//! block reachable (spawn entries count as edges), terminator targets
//! valid, no EIR or async expression left inside an `assign` value, branch
//! arms that reconverge at a shared join block, and a reachable return of
//! the result variable.

use std::collections::HashSet;

use petgraph::algo::has_path_connecting;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;

use spiral_core::document::walk_expr;
use spiral_core::error::SpiralError;
use spiral_core::expr::Layer;
use spiral_core::node::{BasicBlock, Instruction, Node, NodeBody, Terminator};

fn err(message: String) -> SpiralError {
    SpiralError::validation(message)
}

/// The control-flow graph over block ids, including `spawn` entry edges.
fn reachable_from<'a>(graph: &DiGraphMap<&'a str, ()>, start: &'a str) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    let mut dfs = Dfs::new(graph, start);
    while let Some(node) = dfs.next(graph) {
        seen.insert(node);
    }
    seen
}

fn cfg(blocks: &[BasicBlock]) -> DiGraphMap<&str, ()> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for block in blocks {
        graph.add_node(block.id.as_str());
    }
    for block in blocks {
        for succ in block.terminator.successors() {
            graph.add_edge(block.id.as_str(), succ, ());
        }
        for instruction in &block.instructions {
            if let Instruction::Spawn { entry, .. } = instruction {
                graph.add_edge(block.id.as_str(), entry.as_str(), ());
            }
        }
    }
    graph
}

/// Verifies a lowered block node against the lowering invariants.
/// `result_var` is the variable the final return must carry.
pub fn verify_block_node(node: &Node, result_var: &str) -> Result<(), SpiralError> {
    let NodeBody::Blocks { blocks, entry, .. } = &node.body else {
        return Err(err(format!("node '{}' is not a block node", node.id)));
    };

    if entry != "bb0" {
        return Err(err(format!("entry must be bb0, found '{entry}'")));
    }
    if blocks.is_empty() {
        return Err(err("block node has no blocks".into()));
    }

    // Sequential ids in list order.
    for (i, block) in blocks.iter().enumerate() {
        let expected = format!("bb{i}");
        if block.id != expected {
            return Err(err(format!(
                "block ids must be sequential: position {i} holds '{}'",
                block.id
            )));
        }
    }

    let ids: HashSet<&str> = blocks.iter().map(|b| b.id.as_str()).collect();
    for block in blocks {
        for succ in block.terminator.successors() {
            if !ids.contains(succ) {
                return Err(err(format!(
                    "block '{}' targets unknown block '{succ}'",
                    block.id
                )));
            }
        }
    }

    // Every block reachable from the entry.
    let graph = cfg(blocks);
    for block in blocks {
        if block.id != "bb0" && !has_path_connecting(&graph, "bb0", block.id.as_str(), None) {
            return Err(err(format!("block '{}' is unreachable from bb0", block.id)));
        }
    }

    // Assign values stay within the CIR expression subset.
    for block in blocks {
        for instruction in &block.instructions {
            if let Instruction::Assign { value, .. } = instruction {
                let mut offending = None;
                walk_expr(value, &mut |e| {
                    if !Layer::Lir.admits(e.class(), false) && offending.is_none() {
                        offending = Some(e.kind_name());
                    }
                });
                if let Some(kind) = offending {
                    return Err(err(format!(
                        "block '{}': assign value contains non-CIR kind '{kind}'",
                        block.id
                    )));
                }
            }
        }
    }

    // Branch arms must reconverge: some join block is reachable from both
    // (for a loop header that shared block is the loop exit, reached from
    // the body through the back edge). Two arms that each return
    // independently never converge and are rejected.
    for block in blocks {
        if let Terminator::Branch {
            then, otherwise, ..
        } = &block.terminator
        {
            let from_then = reachable_from(&graph, then.as_str());
            let from_else = reachable_from(&graph, otherwise.as_str());
            if from_then.is_disjoint(&from_else) {
                return Err(err(format!(
                    "branch in block '{}': arms '{then}' and '{otherwise}' never reconverge",
                    block.id
                )));
            }
        }
    }

    // Some reachable block returns the result variable.
    let returns_result = blocks.iter().any(|b| {
        matches!(
            &b.terminator,
            Terminator::Return { value: Some(v) } if v == result_var
        ) && has_path_connecting(&graph, "bb0", b.id.as_str(), None)
    });
    if !returns_result {
        return Err(err(format!(
            "no reachable block returns '{result_var}'"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use spiral_core::expr::Expr;

    fn ret(value: &str) -> Terminator {
        Terminator::Return {
            value: Some(value.into()),
        }
    }

    #[test]
    fn accepts_a_minimal_block_node() {
        let node = Node::blocks(
            "main",
            vec![BasicBlock::new(
                "bb0",
                vec![Instruction::Assign {
                    target: "r".into(),
                    value: Expr::int_lit(1),
                }],
                ret("r"),
            )],
            "bb0",
        );
        verify_block_node(&node, "r").unwrap();
    }

    #[test]
    fn rejects_non_sequential_ids() {
        let node = Node::blocks(
            "main",
            vec![
                BasicBlock::new("bb0", vec![], Terminator::Jump { to: "bb2".into() }),
                BasicBlock::new("bb2", vec![], ret("r")),
            ],
            "bb0",
        );
        assert!(verify_block_node(&node, "r").is_err());
    }

    #[test]
    fn rejects_unreachable_blocks() {
        let node = Node::blocks(
            "main",
            vec![
                BasicBlock::new("bb0", vec![], ret("r")),
                BasicBlock::new("bb1", vec![], ret("r")),
            ],
            "bb0",
        );
        let e = verify_block_node(&node, "r").unwrap_err();
        assert!(e.to_string().contains("unreachable"));
    }

    #[test]
    fn rejects_eir_kinds_inside_assign_values() {
        let node = Node::blocks(
            "main",
            vec![BasicBlock::new(
                "bb0",
                vec![Instruction::Assign {
                    target: "r".into(),
                    value: Expr::Deref { target: "x".into() },
                }],
                ret("r"),
            )],
            "bb0",
        );
        assert!(verify_block_node(&node, "r").is_err());
    }

    #[test]
    fn rejects_branch_arms_that_never_reconverge() {
        // Both arms return independently; no join block exists. Every other
        // invariant holds, so only the convergence check can catch this.
        let node = Node::blocks(
            "main",
            vec![
                BasicBlock::new(
                    "bb0",
                    vec![Instruction::Assign {
                        target: "c".into(),
                        value: Expr::bool_lit(true),
                    }],
                    Terminator::Branch {
                        cond: "c".into(),
                        then: "bb1".into(),
                        otherwise: "bb2".into(),
                    },
                ),
                BasicBlock::new(
                    "bb1",
                    vec![Instruction::Assign {
                        target: "r".into(),
                        value: Expr::int_lit(1),
                    }],
                    ret("r"),
                ),
                BasicBlock::new(
                    "bb2",
                    vec![Instruction::Assign {
                        target: "r".into(),
                        value: Expr::int_lit(2),
                    }],
                    ret("r"),
                ),
            ],
            "bb0",
        );
        let e = verify_block_node(&node, "r").unwrap_err();
        assert!(e.to_string().contains("reconverge"), "{e}");
    }

    #[test]
    fn accepts_loop_shaped_branches() {
        // A while-style header: the body's back edge means the exit block
        // is reachable from both arms.
        let node = Node::blocks(
            "main",
            vec![
                BasicBlock::new("bb0", vec![], Terminator::Jump { to: "bb1".into() }),
                BasicBlock::new(
                    "bb1",
                    vec![Instruction::Assign {
                        target: "c".into(),
                        value: Expr::bool_lit(false),
                    }],
                    Terminator::Branch {
                        cond: "c".into(),
                        then: "bb2".into(),
                        otherwise: "bb3".into(),
                    },
                ),
                BasicBlock::new("bb2", vec![], Terminator::Jump { to: "bb1".into() }),
                BasicBlock::new(
                    "bb3",
                    vec![Instruction::Assign {
                        target: "r".into(),
                        value: Expr::int_lit(0),
                    }],
                    ret("r"),
                ),
            ],
            "bb0",
        );
        verify_block_node(&node, "r").unwrap();
    }

    #[test]
    fn rejects_missing_result_return() {
        let node = Node::blocks(
            "main",
            vec![BasicBlock::new("bb0", vec![], ret("other"))],
            "bb0",
        );
        assert!(verify_block_node(&node, "r").is_err());
    }

    #[test]
    fn spawn_entries_count_as_reachability_edges() {
        let node = Node::blocks(
            "main",
            vec![
                BasicBlock::new(
                    "bb0",
                    vec![Instruction::Spawn {
                        target: "t".into(),
                        entry: "bb1".into(),
                        args: None,
                    }],
                    ret("r"),
                ),
                BasicBlock::new("bb1", vec![], ret("task_result")),
            ],
            "bb0",
        );
        verify_block_node(&node, "r").unwrap();
    }
}
