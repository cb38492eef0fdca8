//! Core data model for the SPIRAL layered IR.
//!
//! Types, runtime values with content-addressed hashing, the wide
//! expression vocabulary, nodes/blocks/documents with layer validation,
//! canonical JSON, persistent environments, and the operator registry.

pub mod canon;
pub mod core_ops;
pub mod document;
pub mod env;
pub mod error;
pub mod expr;
pub mod node;
pub mod registry;
pub mod types;
pub mod value;

// Re-export commonly used types
pub use canon::{canonical_json, document_to_canonical_json};
pub use document::{
    is_valid_identifier, is_valid_version, walk_expr, AirDef, Document, ValidationIssue,
    ValidationReport, CAP_ASYNC, CAP_EFFECTS,
};
pub use env::{DefRegistry, Env, TypeEnv, ValueEnv};
pub use error::{ErrorCode, SpiralError};
pub use expr::{Arg, Expr, ExprClass, LambdaParam, Layer, MatchCase, RecordField};
pub use node::{
    BasicBlock, ChannelOpKind, ForkBranch, Instruction, InstructionClass, Node, NodeBody, NodeId,
    PhiSource, Terminator,
};
pub use registry::{Operator, OperatorFn, OperatorRegistry};
pub use types::{ChannelKind, SpiralType};
pub use value::{
    hash_value, ChannelId, Closure, ErrorValue, FutureHandle, FutureStatus, TaskId, Value,
    ValueMap, ValueSet,
};
