//! Error model for SPIRAL.
//!
//! Errors live on two planes, matching how they surface to users:
//! - [`SpiralError`] -- structured errors *returned* by validators, the type
//!   checker, the desugarer, and the reference resolver.
//! - Error *values* ([`crate::value::ErrorValue`]) -- propagated through
//!   evaluation and operator composition as ordinary runtime values.
//!
//! Both planes share the closed [`ErrorCode`] vocabulary, whose string forms
//! are the user-visible codes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The closed set of user-visible error codes.
///
/// The serde / `Display` forms are the exact code strings that appear at the
/// tool boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "TypeError")]
    Type,
    #[serde(rename = "ArityError")]
    Arity,
    #[serde(rename = "DomainError")]
    Domain,
    #[serde(rename = "DivideByZero")]
    DivideByZero,
    #[serde(rename = "UnknownOperator")]
    UnknownOperator,
    #[serde(rename = "UnknownDefinition")]
    UnknownDefinition,
    #[serde(rename = "UnboundIdentifier")]
    UnboundIdentifier,
    #[serde(rename = "ValidationError")]
    Validation,
    #[serde(rename = "NonTermination")]
    NonTermination,
    #[serde(rename = "ChannelClosed")]
    ChannelClosed,
    #[serde(rename = "TaskCancelled")]
    TaskCancelled,
    #[serde(rename = "TimeoutError")]
    Timeout,
    #[serde(rename = "GlobalStepLimit")]
    GlobalStepLimit,
    #[serde(rename = "CircularReference")]
    CircularReference,
    #[serde(rename = "MaxDepthExceeded")]
    MaxDepthExceeded,
    #[serde(rename = "RECURSIVE_REF_IN_AIR")]
    RecursiveRefInAir,
}

impl ErrorCode {
    /// The user-visible code string.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Type => "TypeError",
            ErrorCode::Arity => "ArityError",
            ErrorCode::Domain => "DomainError",
            ErrorCode::DivideByZero => "DivideByZero",
            ErrorCode::UnknownOperator => "UnknownOperator",
            ErrorCode::UnknownDefinition => "UnknownDefinition",
            ErrorCode::UnboundIdentifier => "UnboundIdentifier",
            ErrorCode::Validation => "ValidationError",
            ErrorCode::NonTermination => "NonTermination",
            ErrorCode::ChannelClosed => "ChannelClosed",
            ErrorCode::TaskCancelled => "TaskCancelled",
            ErrorCode::Timeout => "TimeoutError",
            ErrorCode::GlobalStepLimit => "GlobalStepLimit",
            ErrorCode::CircularReference => "CircularReference",
            ErrorCode::MaxDepthExceeded => "MaxDepthExceeded",
            ErrorCode::RecursiveRefInAir => "RECURSIVE_REF_IN_AIR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(" ({s})"),
        None => String::new(),
    }
}

/// Structured errors raised (not propagated as values) by document
/// validation, type checking, desugaring, and reference resolution.
#[derive(Debug, Clone, Error)]
pub enum SpiralError {
    /// Document structure violation: missing node, duplicate id, bad
    /// identifier, inadmissible expression kind for the layer, and so on.
    #[error("validation error: {message}")]
    Validation {
        message: String,
        /// JSON-pointer-ish location within the document, when known.
        path: Option<String>,
    },

    /// Declared or expected type disagrees with the actual type.
    #[error("type mismatch at {context}: expected {expected}, found {actual}")]
    TypeMismatch {
        context: String,
        /// Formatted expected type.
        expected: String,
        /// Formatted actual type.
        actual: String,
    },

    /// Operator, definition, or call applied with the wrong argument count.
    #[error("arity mismatch at {context}: expected {expected} arguments, got {actual}")]
    Arity {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// Operator not present in the registry.
    #[error("unknown operator '{ns}:{name}'{}", suggestion_suffix(.suggestion))]
    UnknownOperator {
        ns: String,
        name: String,
        suggestion: Option<String>,
    },

    /// `airRef` to a definition the registry does not know.
    #[error("unknown definition '{ns}:{name}'{}", suggestion_suffix(.suggestion))]
    UnknownDefinition {
        ns: String,
        name: String,
        suggestion: Option<String>,
    },

    /// A `var` or reference name with no binding in scope.
    #[error("unbound identifier '{name}'")]
    UnboundIdentifier { name: String },

    /// A JSON pointer that cannot be parsed or navigated.
    #[error("invalid reference '{pointer}': {reason}")]
    InvalidPointer { pointer: String, reason: String },

    /// A cycle in the chain of externally loaded documents.
    #[error("circular reference: {}", .chain.join(" -> "))]
    CircularReference { chain: Vec<String> },

    /// External reference loading exceeded the depth bound.
    #[error("maximum reference depth {limit} exceeded while resolving '{uri}'")]
    MaxDepthExceeded { uri: String, limit: usize },

    /// Recursion (local `$ref` or a `ref` cycle) inside an AIR document.
    #[error("recursive reference in AIR document at '{node}'")]
    RecursiveRefInAir { node: String },

    /// An external document could not be fetched or parsed.
    #[error("failed to load '{uri}': {reason}")]
    ExternalLoad { uri: String, reason: String },
}

impl SpiralError {
    /// Shorthand constructor for a pathless validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        SpiralError::Validation {
            message: message.into(),
            path: None,
        }
    }

    /// Validation error anchored at a document path.
    pub fn validation_at(message: impl Into<String>, path: impl Into<String>) -> Self {
        SpiralError::Validation {
            message: message.into(),
            path: Some(path.into()),
        }
    }

    /// The user-visible code this error surfaces under.
    pub fn code(&self) -> ErrorCode {
        match self {
            SpiralError::Validation { .. } => ErrorCode::Validation,
            SpiralError::TypeMismatch { .. } => ErrorCode::Type,
            SpiralError::Arity { .. } => ErrorCode::Arity,
            SpiralError::UnknownOperator { .. } => ErrorCode::UnknownOperator,
            SpiralError::UnknownDefinition { .. } => ErrorCode::UnknownDefinition,
            SpiralError::UnboundIdentifier { .. } => ErrorCode::UnboundIdentifier,
            SpiralError::InvalidPointer { .. } => ErrorCode::Validation,
            SpiralError::CircularReference { .. } => ErrorCode::CircularReference,
            SpiralError::MaxDepthExceeded { .. } => ErrorCode::MaxDepthExceeded,
            SpiralError::RecursiveRefInAir { .. } => ErrorCode::RecursiveRefInAir,
            SpiralError::ExternalLoad { .. } => ErrorCode::Validation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_strings_are_the_user_visible_forms() {
        assert_eq!(ErrorCode::Type.as_str(), "TypeError");
        assert_eq!(ErrorCode::Arity.as_str(), "ArityError");
        assert_eq!(ErrorCode::DivideByZero.as_str(), "DivideByZero");
        assert_eq!(ErrorCode::Timeout.as_str(), "TimeoutError");
        assert_eq!(ErrorCode::RecursiveRefInAir.as_str(), "RECURSIVE_REF_IN_AIR");
    }

    #[test]
    fn serde_uses_code_strings() {
        let json = serde_json::to_string(&ErrorCode::GlobalStepLimit).unwrap();
        assert_eq!(json, "\"GlobalStepLimit\"");
        let back: ErrorCode = serde_json::from_str("\"RECURSIVE_REF_IN_AIR\"").unwrap();
        assert_eq!(back, ErrorCode::RecursiveRefInAir);
    }

    #[test]
    fn unknown_operator_display_includes_suggestion() {
        let err = SpiralError::UnknownOperator {
            ns: "core".into(),
            name: "ad".into(),
            suggestion: Some("did you mean 'add'?".into()),
        };
        let text = err.to_string();
        assert!(text.contains("core:ad"));
        assert!(text.contains("did you mean 'add'?"));
    }

    #[test]
    fn circular_reference_displays_chain() {
        let err = SpiralError::CircularReference {
            chain: vec!["file://a.json".into(), "file://b.json".into(), "file://a.json".into()],
        };
        assert_eq!(
            err.to_string(),
            "circular reference: file://a.json -> file://b.json -> file://a.json"
        );
    }

    #[test]
    fn error_codes_cover_thrown_variants() {
        assert_eq!(
            SpiralError::validation("x").code(),
            ErrorCode::Validation
        );
        assert_eq!(
            SpiralError::UnboundIdentifier { name: "x".into() }.code(),
            ErrorCode::UnboundIdentifier
        );
        assert_eq!(
            SpiralError::MaxDepthExceeded { uri: "u".into(), limit: 10 }.code(),
            ErrorCode::MaxDepthExceeded
        );
    }
}
