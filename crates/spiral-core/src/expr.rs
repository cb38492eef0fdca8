//! Expression vocabulary for all SPIRAL layers.
//!
//! One wide [`Expr`] enum covers AIR, CIR, EIR, and the async extension.
//! Documents of a given layer admit only a subset of kinds; that subset is
//! enforced by validators (see [`Layer::admits`] and
//! `Document::validate`), not by separate per-layer enums.
//!
//! Serialization is internally tagged on `kind` with camelCase names, so an
//! expression reads as `{"kind": "call", "ns": "core", "name": "add", ...}`.

use serde::{Deserialize, Serialize};

use crate::node::NodeId;
use crate::types::SpiralType;

/// An argument position that is either a node reference (JSON string) or an
/// inline expression (JSON object).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Arg {
    /// Reference to another node, a lambda parameter, or a bound name.
    Node(NodeId),
    /// Inline expression evaluated in place.
    Inline(Box<Expr>),
}

impl Arg {
    pub fn node(id: impl Into<String>) -> Self {
        Arg::Node(id.into())
    }

    pub fn inline(expr: Expr) -> Self {
        Arg::Inline(Box::new(expr))
    }

    /// The referenced node id, when this argument is a reference.
    pub fn as_node(&self) -> Option<&str> {
        match self {
            Arg::Node(id) => Some(id),
            Arg::Inline(_) => None,
        }
    }

    pub fn as_inline(&self) -> Option<&Expr> {
        match self {
            Arg::Node(_) => None,
            Arg::Inline(e) => Some(e),
        }
    }
}

/// A lambda parameter with optional declared type, optionality, and default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LambdaParam {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub ty: Option<SpiralType>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Expr>,
}

impl LambdaParam {
    pub fn named(name: impl Into<String>) -> Self {
        LambdaParam {
            name: name.into(),
            ty: None,
            optional: false,
            default: None,
        }
    }

    pub fn typed(name: impl Into<String>, ty: SpiralType) -> Self {
        LambdaParam {
            name: name.into(),
            ty: Some(ty),
            optional: false,
            default: None,
        }
    }
}

/// One arm of a `match` expression: a literal pattern and a body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCase {
    pub pattern: serde_json::Value,
    pub body: Arg,
}

/// One field of a `record` expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordField {
    pub name: String,
    pub value: Arg,
}

/// A SPIRAL expression of any layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Expr {
    // -- AIR --------------------------------------------------------------
    /// Literal with a declared type and a raw JSON payload; compound
    /// payloads are converted recursively at evaluation time.
    Lit {
        #[serde(rename = "type")]
        ty: SpiralType,
        value: serde_json::Value,
    },

    /// By-name reference to another node or a bound name.
    Ref { id: NodeId },

    /// A name bound inside a lambda body.
    Var { name: String },

    /// Application of a registered operator.
    Call {
        ns: String,
        name: String,
        args: Vec<Arg>,
    },

    /// Conditional; both branches must agree with the declared type
    /// (`int` when absent).
    If {
        cond: Arg,
        then: Arg,
        #[serde(rename = "else")]
        otherwise: Arg,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        ty: Option<SpiralType>,
    },

    /// Lexical binding: `body` is evaluated with `name` bound to `value`.
    Let { name: String, value: Arg, body: Arg },

    /// Pre-desugar reference to a reusable `airDef` definition.
    AirRef {
        ns: String,
        name: String,
        args: Vec<NodeId>,
    },

    /// Named boolean check; always types as `bool`.
    Predicate { name: String, value: Arg },

    // -- CIR --------------------------------------------------------------
    /// Function abstraction; `body` is a node id, `ty` the declared `fn`
    /// type.
    Lambda {
        params: Vec<LambdaParam>,
        body: NodeId,
        #[serde(rename = "type")]
        ty: SpiralType,
    },

    /// Application of a lambda (by node id or bound name).
    CallExpr {
        #[serde(rename = "fn")]
        func: String,
        args: Vec<Arg>,
    },

    /// Fixed-point combinator over a one-argument function whose parameter
    /// and return types coincide.
    Fix {
        #[serde(rename = "fn")]
        func: NodeId,
        #[serde(rename = "type")]
        ty: SpiralType,
    },

    /// Sequence of expressions; the value is the last one's.
    Do { exprs: Vec<Arg> },

    /// Literal-pattern dispatch with an optional default arm.
    Match {
        value: Arg,
        cases: Vec<MatchCase>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Arg>,
    },

    /// Named-field construction; evaluates to a `map<string, T>`.
    Record { fields: Vec<RecordField> },

    /// List construction from element expressions.
    ListOf { elements: Vec<Arg> },

    // -- EIR --------------------------------------------------------------
    /// Two-phase sequencing; the value is `then`'s.
    Seq { first: Arg, then: Arg },

    /// Mutation of a named slot in the mutable scope.
    Assign { target: String, value: Arg },

    While { cond: Arg, body: Arg },

    For {
        var: String,
        init: Arg,
        cond: Arg,
        update: Arg,
        body: Arg,
    },

    /// Iteration over the elements of a list value.
    Iter { var: String, iter: Arg, body: Arg },

    /// Effectful operation dispatched through the `effect` registry;
    /// arguments evaluate strictly left to right.
    Effect { op: String, args: Vec<Arg> },

    /// Takes a reference cell over a mutable slot.
    RefCell { target: String },

    /// Reads through a reference cell.
    Deref { target: String },

    Try {
        #[serde(rename = "tryBody")]
        try_body: Arg,
        #[serde(rename = "catchParam")]
        catch_param: String,
        #[serde(rename = "catchBody")]
        catch_body: Arg,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback: Option<Arg>,
    },

    // -- Async (EIR with capability "async") ------------------------------
    /// Spawn every branch and collect all results.
    Par { branches: Vec<NodeId> },

    /// Spawn a single task; evaluates to a future value.
    Spawn { task: NodeId },

    Await {
        future: Arg,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback: Option<Arg>,
        #[serde(
            rename = "returnIndex",
            default,
            skip_serializing_if = "std::ops::Not::not"
        )]
        return_index: bool,
    },

    /// Channel creation; `buffer_size` 0 (or absent) means rendezvous.
    Channel {
        #[serde(rename = "channelType")]
        channel_type: SpiralType,
        #[serde(
            rename = "bufferSize",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        buffer_size: Option<usize>,
    },

    Send { channel: Arg, value: Arg },

    Recv { channel: Arg },

    /// First of several futures to complete.
    Select {
        futures: Vec<NodeId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback: Option<Arg>,
        #[serde(
            rename = "returnIndex",
            default,
            skip_serializing_if = "std::ops::Not::not"
        )]
        return_index: bool,
    },

    /// First of several tasks to complete; the rest are cancelled.
    Race { tasks: Vec<NodeId> },
}

/// Admissibility class of an expression kind. Classes nest:
/// AIR ⊂ CIR ⊂ EIR, with async kinds gated on the `"async"` capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExprClass {
    Air,
    Cir,
    Eir,
    Async,
}

/// The four document layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Air,
    Cir,
    Eir,
    Lir,
}

impl Layer {
    /// Whether an expression of the given class may appear in a document of
    /// this layer. LIR expression positions use the CIR expression set.
    pub fn admits(self, class: ExprClass, async_capability: bool) -> bool {
        match (self, class) {
            (Layer::Air, ExprClass::Air) => true,
            (Layer::Air, _) => false,
            (Layer::Cir | Layer::Lir, ExprClass::Air | ExprClass::Cir) => true,
            (Layer::Cir | Layer::Lir, _) => false,
            (Layer::Eir, ExprClass::Async) => async_capability,
            (Layer::Eir, _) => true,
        }
    }
}

impl Expr {
    /// The minimal layer class this expression kind belongs to.
    pub fn class(&self) -> ExprClass {
        match self {
            Expr::Lit { .. }
            | Expr::Ref { .. }
            | Expr::Var { .. }
            | Expr::Call { .. }
            | Expr::If { .. }
            | Expr::Let { .. }
            | Expr::AirRef { .. }
            | Expr::Predicate { .. } => ExprClass::Air,

            Expr::Lambda { .. }
            | Expr::CallExpr { .. }
            | Expr::Fix { .. }
            | Expr::Do { .. }
            | Expr::Match { .. }
            | Expr::Record { .. }
            | Expr::ListOf { .. } => ExprClass::Cir,

            Expr::Seq { .. }
            | Expr::Assign { .. }
            | Expr::While { .. }
            | Expr::For { .. }
            | Expr::Iter { .. }
            | Expr::Effect { .. }
            | Expr::RefCell { .. }
            | Expr::Deref { .. }
            | Expr::Try { .. } => ExprClass::Eir,

            Expr::Par { .. }
            | Expr::Spawn { .. }
            | Expr::Await { .. }
            | Expr::Channel { .. }
            | Expr::Send { .. }
            | Expr::Recv { .. }
            | Expr::Select { .. }
            | Expr::Race { .. } => ExprClass::Async,
        }
    }

    /// The document-format kind tag for this expression.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Expr::Lit { .. } => "lit",
            Expr::Ref { .. } => "ref",
            Expr::Var { .. } => "var",
            Expr::Call { .. } => "call",
            Expr::If { .. } => "if",
            Expr::Let { .. } => "let",
            Expr::AirRef { .. } => "airRef",
            Expr::Predicate { .. } => "predicate",
            Expr::Lambda { .. } => "lambda",
            Expr::CallExpr { .. } => "callExpr",
            Expr::Fix { .. } => "fix",
            Expr::Do { .. } => "do",
            Expr::Match { .. } => "match",
            Expr::Record { .. } => "record",
            Expr::ListOf { .. } => "listOf",
            Expr::Seq { .. } => "seq",
            Expr::Assign { .. } => "assign",
            Expr::While { .. } => "while",
            Expr::For { .. } => "for",
            Expr::Iter { .. } => "iter",
            Expr::Effect { .. } => "effect",
            Expr::RefCell { .. } => "refCell",
            Expr::Deref { .. } => "deref",
            Expr::Try { .. } => "try",
            Expr::Par { .. } => "par",
            Expr::Spawn { .. } => "spawn",
            Expr::Await { .. } => "await",
            Expr::Channel { .. } => "channel",
            Expr::Send { .. } => "send",
            Expr::Recv { .. } => "recv",
            Expr::Select { .. } => "select",
            Expr::Race { .. } => "race",
        }
    }

    /// Immediate argument positions (both node references and inline
    /// expressions). Used by validators and the desugarer's traversal.
    pub fn child_args(&self) -> Vec<&Arg> {
        match self {
            Expr::Lit { .. }
            | Expr::Ref { .. }
            | Expr::Var { .. }
            | Expr::AirRef { .. }
            | Expr::Lambda { .. }
            | Expr::Fix { .. }
            | Expr::RefCell { .. }
            | Expr::Deref { .. }
            | Expr::Par { .. }
            | Expr::Spawn { .. }
            | Expr::Channel { .. }
            | Expr::Race { .. } => Vec::new(),

            Expr::Call { args, .. } | Expr::CallExpr { args, .. } => args.iter().collect(),
            Expr::If {
                cond,
                then,
                otherwise,
                ..
            } => vec![cond, then, otherwise],
            Expr::Let { value, body, .. } => vec![value, body],
            Expr::Predicate { value, .. } => vec![value],
            Expr::Do { exprs } => exprs.iter().collect(),
            Expr::Match {
                value,
                cases,
                default,
            } => {
                let mut out = vec![value];
                out.extend(cases.iter().map(|c| &c.body));
                out.extend(default.iter());
                out
            }
            Expr::Record { fields } => fields.iter().map(|f| &f.value).collect(),
            Expr::ListOf { elements } => elements.iter().collect(),
            Expr::Seq { first, then } => vec![first, then],
            Expr::Assign { value, .. } => vec![value],
            Expr::While { cond, body } => vec![cond, body],
            Expr::For {
                init,
                cond,
                update,
                body,
                ..
            } => vec![init, cond, update, body],
            Expr::Iter { iter, body, .. } => vec![iter, body],
            Expr::Effect { args, .. } => args.iter().collect(),
            Expr::Try {
                try_body,
                catch_body,
                fallback,
                ..
            } => {
                let mut out = vec![try_body, catch_body];
                out.extend(fallback.iter());
                out
            }
            Expr::Await {
                future, fallback, ..
            } => {
                let mut out = vec![future];
                out.extend(fallback.iter());
                out
            }
            Expr::Send { channel, value } => vec![channel, value],
            Expr::Recv { channel } => vec![channel],
            Expr::Select { fallback, .. } => fallback.iter().collect(),
        }
    }

    /// Direct node-id references carried outside [`Arg`] positions
    /// (`ref.id`, `lambda.body`, `fix.fn`, `airRef.args`, async id lists).
    pub fn direct_node_refs(&self) -> Vec<&str> {
        match self {
            Expr::Ref { id } => vec![id.as_str()],
            Expr::AirRef { args, .. } => args.iter().map(String::as_str).collect(),
            Expr::Lambda { body, .. } => vec![body.as_str()],
            Expr::CallExpr { func, .. } => vec![func.as_str()],
            Expr::Fix { func, .. } => vec![func.as_str()],
            Expr::Par { branches } => branches.iter().map(String::as_str).collect(),
            Expr::Spawn { task } => vec![task.as_str()],
            Expr::Select { futures, .. } => futures.iter().map(String::as_str).collect(),
            Expr::Race { tasks } => tasks.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    pub fn lit(ty: SpiralType, value: serde_json::Value) -> Self {
        Expr::Lit { ty, value }
    }

    pub fn int_lit(value: i64) -> Self {
        Expr::Lit {
            ty: SpiralType::Int,
            value: serde_json::json!(value),
        }
    }

    pub fn bool_lit(value: bool) -> Self {
        Expr::Lit {
            ty: SpiralType::Bool,
            value: serde_json::json!(value),
        }
    }

    pub fn str_lit(value: &str) -> Self {
        Expr::Lit {
            ty: SpiralType::String,
            value: serde_json::json!(value),
        }
    }

    pub fn reference(id: impl Into<String>) -> Self {
        Expr::Ref { id: id.into() }
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var { name: name.into() }
    }

    pub fn call(ns: impl Into<String>, name: impl Into<String>, args: Vec<Arg>) -> Self {
        Expr::Call {
            ns: ns.into(),
            name: name.into(),
            args,
        }
    }
}
