//! Nodes, basic blocks, instructions, and terminators.
//!
//! A document is a flat list of [`Node`]s addressed by string id. A node is
//! either an expression node, a block node (LIR basic blocks plus an entry
//! id), or a `$ref` node resolved lazily through the reference resolver.
//!
//! Blocks follow SSA discipline: straight-line [`Instruction`]s followed by
//! exactly one [`Terminator`].

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::expr::Expr;
use crate::types::SpiralType;

/// Node identifiers are document-unique strings matching
/// `[a-zA-Z_][a-zA-Z0-9_]*`.
pub type NodeId = String;

/// A document node: unique id plus one of the three body forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(flatten)]
    pub body: NodeBody,
}

/// The three node body forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeBody {
    /// Lazy JSON-pointer alias to another node or expression.
    Ref {
        #[serde(rename = "$ref")]
        pointer: String,
    },
    /// Basic-block form (LIR).
    Blocks {
        blocks: Vec<BasicBlock>,
        entry: String,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        ty: Option<SpiralType>,
    },
    /// Expression form.
    Expr {
        expr: Expr,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        ty: Option<SpiralType>,
    },
}

impl Node {
    /// Creates an expression node without a declared type.
    pub fn expr(id: impl Into<String>, expr: Expr) -> Self {
        Node {
            id: id.into(),
            body: NodeBody::Expr { expr, ty: None },
        }
    }

    /// Creates an expression node with a declared type.
    pub fn typed_expr(id: impl Into<String>, expr: Expr, ty: SpiralType) -> Self {
        Node {
            id: id.into(),
            body: NodeBody::Expr {
                expr,
                ty: Some(ty),
            },
        }
    }

    /// Creates a block node.
    pub fn blocks(id: impl Into<String>, blocks: Vec<BasicBlock>, entry: impl Into<String>) -> Self {
        Node {
            id: id.into(),
            body: NodeBody::Blocks {
                blocks,
                entry: entry.into(),
                ty: None,
            },
        }
    }

    /// Creates a `$ref` node.
    pub fn reference(id: impl Into<String>, pointer: impl Into<String>) -> Self {
        Node {
            id: id.into(),
            body: NodeBody::Ref {
                pointer: pointer.into(),
            },
        }
    }

    /// The node's expression, when it is an expression node.
    pub fn as_expr(&self) -> Option<&Expr> {
        match &self.body {
            NodeBody::Expr { expr, .. } => Some(expr),
            _ => None,
        }
    }

    /// The declared type annotation, when present.
    pub fn declared_type(&self) -> Option<&SpiralType> {
        match &self.body {
            NodeBody::Expr { ty, .. } | NodeBody::Blocks { ty, .. } => ty.as_ref(),
            NodeBody::Ref { .. } => None,
        }
    }
}

/// A basic block: straight-line instructions plus exactly one terminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub id: String,
    pub instructions: Vec<Instruction>,
    pub terminator: Terminator,
}

impl BasicBlock {
    pub fn new(
        id: impl Into<String>,
        instructions: Vec<Instruction>,
        terminator: Terminator,
    ) -> Self {
        BasicBlock {
            id: id.into(),
            instructions,
            terminator,
        }
    }
}

/// One `phi` source: the predecessor block and the value id it supplies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhiSource {
    pub block: String,
    pub id: String,
}

/// Channel operations available as LIR instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelOpKind {
    Send,
    Recv,
    TrySend,
    TryRecv,
}

/// Admissibility class of an instruction kind, mirroring
/// [`crate::expr::ExprClass`] for block bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionClass {
    /// `assign` / `op` / `phi` -- allowed in every block-bearing layer.
    Core,
    /// `effect` / `assignRef` -- EIR and above.
    Eir,
    /// `spawn` / `channelOp` / `await` -- EIR with the async capability.
    Async,
}

/// A straight-line instruction inside a basic block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Instruction {
    /// Bind `target` to the value of an expression (CIR subset only in
    /// well-formed LIR).
    Assign { target: String, value: Expr },

    /// Apply a registered operator to already-bound argument ids.
    Op {
        target: String,
        ns: String,
        name: String,
        args: SmallVec<[String; 4]>,
    },

    /// SSA join of per-predecessor values.
    Phi {
        target: String,
        sources: Vec<PhiSource>,
    },

    /// Effectful operation; `target` is absent for void effects.
    Effect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        op: String,
        args: SmallVec<[String; 4]>,
    },

    /// Store through a reference cell.
    AssignRef { target: String, value: String },

    /// Start a task whose body begins at `entry`.
    Spawn {
        target: String,
        entry: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Vec<String>>,
    },

    /// Channel operation; `target` is present for value-producing ops.
    ChannelOp {
        op: ChannelOpKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },

    /// Block on a future and bind its result.
    Await { target: String, future: String },
}

impl Instruction {
    pub fn class(&self) -> InstructionClass {
        match self {
            Instruction::Assign { .. } | Instruction::Op { .. } | Instruction::Phi { .. } => {
                InstructionClass::Core
            }
            Instruction::Effect { .. } | Instruction::AssignRef { .. } => InstructionClass::Eir,
            Instruction::Spawn { .. }
            | Instruction::ChannelOp { .. }
            | Instruction::Await { .. } => InstructionClass::Async,
        }
    }

    /// The id this instruction binds, when it binds one.
    pub fn target(&self) -> Option<&str> {
        match self {
            Instruction::Assign { target, .. }
            | Instruction::Op { target, .. }
            | Instruction::Phi { target, .. }
            | Instruction::AssignRef { target, .. }
            | Instruction::Spawn { target, .. }
            | Instruction::Await { target, .. } => Some(target),
            Instruction::Effect { target, .. } | Instruction::ChannelOp { target, .. } => {
                target.as_deref()
            }
        }
    }
}

/// One forked branch: the block where the branch body starts and the task
/// name bound to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkBranch {
    pub block: String,
    pub task: String,
}

/// A block terminator. Every block ends with exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Terminator {
    Jump {
        to: String,
    },

    Branch {
        cond: String,
        then: String,
        #[serde(rename = "else")]
        otherwise: String,
    },

    Return {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },

    Exit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i64>,
    },

    /// Fan out into concurrent branches, then continue at `continuation`.
    Fork {
        branches: Vec<ForkBranch>,
        continuation: String,
    },

    /// Wait for the named tasks, optionally binding their results.
    Join {
        tasks: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        results: Option<Vec<String>>,
        to: String,
    },

    /// Park until `future` completes, then resume at `resume_block`.
    Suspend {
        future: String,
        #[serde(rename = "resumeBlock")]
        resume_block: String,
    },
}

impl Terminator {
    /// `true` for the async-layer terminators (`fork`/`join`/`suspend`).
    pub fn is_async(&self) -> bool {
        matches!(
            self,
            Terminator::Fork { .. } | Terminator::Join { .. } | Terminator::Suspend { .. }
        )
    }

    /// Successor block ids, in document order.
    pub fn successors(&self) -> Vec<&str> {
        match self {
            Terminator::Jump { to } => vec![to],
            Terminator::Branch {
                then, otherwise, ..
            } => vec![then, otherwise],
            Terminator::Return { .. } | Terminator::Exit { .. } => Vec::new(),
            Terminator::Fork {
                branches,
                continuation,
            } => {
                let mut out: Vec<&str> = branches.iter().map(|b| b.block.as_str()).collect();
                out.push(continuation);
                out
            }
            Terminator::Join { to, .. } => vec![to],
            Terminator::Suspend { resume_block, .. } => vec![resume_block],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn node_body_forms_roundtrip() {
        let nodes = vec![
            Node::expr("a", Expr::int_lit(3)),
            Node::typed_expr("b", Expr::int_lit(4), SpiralType::Int),
            Node::reference("c", "#/nodes/0"),
            Node::blocks(
                "main",
                vec![BasicBlock::new(
                    "bb0",
                    vec![Instruction::Assign {
                        target: "x".into(),
                        value: Expr::int_lit(1),
                    }],
                    Terminator::Return {
                        value: Some("x".into()),
                    },
                )],
                "bb0",
            ),
        ];
        for node in nodes {
            let json = serde_json::to_string(&node).unwrap();
            let back: Node = serde_json::from_str(&json).unwrap();
            assert_eq!(node, back, "roundtrip failed for {json}");
        }
    }

    #[test]
    fn ref_node_serializes_with_dollar_ref() {
        let node = Node::reference("alias", "#/nodes/2");
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["$ref"], "#/nodes/2");
        assert_eq!(json["id"], "alias");
    }

    #[test]
    fn instruction_classes() {
        let assign = Instruction::Assign {
            target: "t".into(),
            value: Expr::int_lit(1),
        };
        let effect = Instruction::Effect {
            target: None,
            op: "log".into(),
            args: smallvec!["t".to_string()],
        };
        let awaiting = Instruction::Await {
            target: "r".into(),
            future: "f".into(),
        };
        assert_eq!(assign.class(), InstructionClass::Core);
        assert_eq!(effect.class(), InstructionClass::Eir);
        assert_eq!(awaiting.class(), InstructionClass::Async);
    }

    #[test]
    fn instruction_serde_kind_tags() {
        let op = Instruction::Op {
            target: "sum".into(),
            ns: "core".into(),
            name: "add".into(),
            args: smallvec!["a".to_string(), "b".to_string()],
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "op");
        assert_eq!(json["args"], serde_json::json!(["a", "b"]));

        let ch = Instruction::ChannelOp {
            op: ChannelOpKind::TrySend,
            target: Some("ok".into()),
            channel: "ch".into(),
            value: Some("v".into()),
        };
        let json = serde_json::to_value(&ch).unwrap();
        assert_eq!(json["kind"], "channelOp");
        assert_eq!(json["op"], "trySend");
    }

    #[test]
    fn terminator_successors() {
        let b = Terminator::Branch {
            cond: "c".into(),
            then: "bb1".into(),
            otherwise: "bb2".into(),
        };
        assert_eq!(b.successors(), vec!["bb1", "bb2"]);

        let f = Terminator::Fork {
            branches: vec![
                ForkBranch {
                    block: "bb3".into(),
                    task: "t0".into(),
                },
                ForkBranch {
                    block: "bb4".into(),
                    task: "t1".into(),
                },
            ],
            continuation: "bb5".into(),
        };
        assert_eq!(f.successors(), vec!["bb3", "bb4", "bb5"]);
        assert!(f.is_async());

        let r = Terminator::Return { value: None };
        assert!(r.successors().is_empty());
        assert!(!r.is_async());
    }

    #[test]
    fn terminator_else_field_name() {
        let b = Terminator::Branch {
            cond: "c".into(),
            then: "bb1".into(),
            otherwise: "bb2".into(),
        };
        let json = serde_json::to_value(&b).unwrap();
        assert_eq!(json["else"], "bb2");
    }
}
