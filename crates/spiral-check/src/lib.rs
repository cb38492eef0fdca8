//! Static checking for SPIRAL documents.
//!
//! Desugaring of `airDef` definitions, RFC 6901 reference resolution with
//! external document loading, human-oriented diagnostics, and the layered
//! bidirectional type checker with its EIR mutation extension.

pub mod desugar;
pub mod diagnostics;
pub mod resolve;
pub mod typecheck;

pub use desugar::{desugar_document, rewrite_expr};
pub use diagnostics::{closest_match, levenshtein, pointer_hint, suggest_name};
pub use resolve::{
    check_air_references, navigate, navigate_with_parent, parse_pointer, reference_cycles,
    RefResolver, DEFAULT_MAX_DEPTH,
};
pub use typecheck::{type_check_program, ProgramTypes};
