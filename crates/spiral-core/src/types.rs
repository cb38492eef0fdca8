//! The SPIRAL type system.
//!
//! A closed sum of sixteen variants: the five primitives, single-element
//! wrappers (`list`, `set`, `option`, `ref`, `future`, `channel`, `task`),
//! and the compound forms (`map`, `opaque`, `fn`, `async`).
//!
//! Equality is structural throughout. `opaque` compares by name, `channel`
//! compares kind and element type, and there is no subtyping anywhere.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Buffering discipline of a channel type or channel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// FIFO buffer with positive capacity.
    Buffered,
    /// Capacity zero: send and receive pair synchronously.
    Rendezvous,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Buffered => f.write_str("buffered"),
            ChannelKind::Rendezvous => f.write_str("rendezvous"),
        }
    }
}

/// A SPIRAL type. Each variant represents a distinct kind of type.
///
/// Serialized internally tagged on `kind` so documents read as
/// `{"kind": "list", "of": {"kind": "int"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SpiralType {
    Bool,
    Int,
    Float,
    String,
    Void,

    /// Homogeneous sequence: `list<T>`.
    List { of: Box<SpiralType> },

    /// Value-hashed set: `set<T>`.
    Set { of: Box<SpiralType> },

    /// Present-or-absent wrapper: `option<T>`.
    Option { of: Box<SpiralType> },

    /// Mutable reference cell: `ref<T>`.
    Ref { of: Box<SpiralType> },

    /// Deferred result of an asynchronous computation: `future<T>`.
    Future { of: Box<SpiralType> },

    /// Communication channel carrying `T`. Equality compares both the
    /// buffering kind and the element type.
    Channel {
        #[serde(rename = "channelKind")]
        channel_kind: ChannelKind,
        of: Box<SpiralType>,
    },

    /// Handle to a spawned task producing `T`.
    Task { of: Box<SpiralType> },

    /// Value-hashed dictionary: `map<K, V>`.
    Map {
        key: Box<SpiralType>,
        value: Box<SpiralType>,
    },

    /// Nominal type known only by name. Compares by name.
    Opaque { name: String },

    /// Function signature. Parameters compare pointwise.
    Fn {
        params: Vec<SpiralType>,
        returns: Box<SpiralType>,
        /// Per-parameter optionality; absent means all required.
        #[serde(
            rename = "optionalParams",
            default,
            skip_serializing_if = "std::option::Option::is_none"
        )]
        optional_params: std::option::Option<Vec<bool>>,
    },

    /// Asynchronous function signature; `returns` is conventionally a
    /// `future<T>`.
    Async {
        params: Vec<SpiralType>,
        returns: Box<SpiralType>,
    },
}

impl SpiralType {
    /// `true` for the five primitive kinds.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            SpiralType::Bool
                | SpiralType::Int
                | SpiralType::Float
                | SpiralType::String
                | SpiralType::Void
        )
    }

    /// Destructures a `fn` type into `(params, returns, optional_params)`.
    pub fn as_fn_parts(
        &self,
    ) -> std::option::Option<(&[SpiralType], &SpiralType, std::option::Option<&[bool]>)> {
        match self {
            SpiralType::Fn {
                params,
                returns,
                optional_params,
            } => Some((params, returns, optional_params.as_deref())),
            _ => None,
        }
    }

    pub fn list(of: SpiralType) -> Self {
        SpiralType::List { of: Box::new(of) }
    }

    pub fn set(of: SpiralType) -> Self {
        SpiralType::Set { of: Box::new(of) }
    }

    pub fn option(of: SpiralType) -> Self {
        SpiralType::Option { of: Box::new(of) }
    }

    pub fn reference(of: SpiralType) -> Self {
        SpiralType::Ref { of: Box::new(of) }
    }

    pub fn future(of: SpiralType) -> Self {
        SpiralType::Future { of: Box::new(of) }
    }

    pub fn task(of: SpiralType) -> Self {
        SpiralType::Task { of: Box::new(of) }
    }

    pub fn channel(channel_kind: ChannelKind, of: SpiralType) -> Self {
        SpiralType::Channel {
            channel_kind,
            of: Box::new(of),
        }
    }

    pub fn map(key: SpiralType, value: SpiralType) -> Self {
        SpiralType::Map {
            key: Box::new(key),
            value: Box::new(value),
        }
    }

    pub fn opaque(name: impl Into<String>) -> Self {
        SpiralType::Opaque { name: name.into() }
    }

    pub fn function(params: Vec<SpiralType>, returns: SpiralType) -> Self {
        SpiralType::Fn {
            params,
            returns: Box::new(returns),
            optional_params: None,
        }
    }

    pub fn function_with_optional(
        params: Vec<SpiralType>,
        returns: SpiralType,
        optional_params: Vec<bool>,
    ) -> Self {
        SpiralType::Fn {
            params,
            returns: Box::new(returns),
            optional_params: Some(optional_params),
        }
    }

    /// An `async` signature returning `future<inner>`.
    pub fn asynchronous(params: Vec<SpiralType>, inner: SpiralType) -> Self {
        SpiralType::Async {
            params,
            returns: Box::new(SpiralType::future(inner)),
        }
    }
}

fn write_params(f: &mut fmt::Formatter<'_>, params: &[SpiralType]) -> fmt::Result {
    for (i, p) in params.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{p}")?;
    }
    Ok(())
}

impl fmt::Display for SpiralType {
    /// Human-readable form used in error messages: `list<int>`,
    /// `fn(int, int) -> int`, `channel<buffered, int>`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpiralType::Bool => f.write_str("bool"),
            SpiralType::Int => f.write_str("int"),
            SpiralType::Float => f.write_str("float"),
            SpiralType::String => f.write_str("string"),
            SpiralType::Void => f.write_str("void"),
            SpiralType::List { of } => write!(f, "list<{of}>"),
            SpiralType::Set { of } => write!(f, "set<{of}>"),
            SpiralType::Option { of } => write!(f, "option<{of}>"),
            SpiralType::Ref { of } => write!(f, "ref<{of}>"),
            SpiralType::Future { of } => write!(f, "future<{of}>"),
            SpiralType::Channel { channel_kind, of } => {
                write!(f, "channel<{channel_kind}, {of}>")
            }
            SpiralType::Task { of } => write!(f, "task<{of}>"),
            SpiralType::Map { key, value } => write!(f, "map<{key}, {value}>"),
            SpiralType::Opaque { name } => write!(f, "opaque<{name}>"),
            SpiralType::Fn {
                params, returns, ..
            } => {
                f.write_str("fn(")?;
                write_params(f, params)?;
                write!(f, ") -> {returns}")
            }
            SpiralType::Async { params, returns } => {
                f.write_str("async(")?;
                write_params(f, params)?;
                write!(f, ") -> {returns}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_equality_recurses() {
        let a = SpiralType::list(SpiralType::map(SpiralType::String, SpiralType::Int));
        let b = SpiralType::list(SpiralType::map(SpiralType::String, SpiralType::Int));
        let c = SpiralType::list(SpiralType::map(SpiralType::String, SpiralType::Bool));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn opaque_compares_by_name() {
        assert_eq!(SpiralType::opaque("handle"), SpiralType::opaque("handle"));
        assert_ne!(SpiralType::opaque("handle"), SpiralType::opaque("socket"));
    }

    #[test]
    fn channel_equality_compares_kind_and_element() {
        let buffered = SpiralType::channel(ChannelKind::Buffered, SpiralType::Int);
        let rendezvous = SpiralType::channel(ChannelKind::Rendezvous, SpiralType::Int);
        let buffered_bool = SpiralType::channel(ChannelKind::Buffered, SpiralType::Bool);
        assert_eq!(
            buffered,
            SpiralType::channel(ChannelKind::Buffered, SpiralType::Int)
        );
        assert_ne!(buffered, rendezvous);
        assert_ne!(buffered, buffered_bool);
    }

    #[test]
    fn fn_compares_params_pointwise_and_return() {
        let f1 = SpiralType::function(vec![SpiralType::Int, SpiralType::Int], SpiralType::Int);
        let f2 = SpiralType::function(vec![SpiralType::Int, SpiralType::Int], SpiralType::Int);
        let f3 = SpiralType::function(vec![SpiralType::Int, SpiralType::Bool], SpiralType::Int);
        let f4 = SpiralType::function(vec![SpiralType::Int, SpiralType::Int], SpiralType::Bool);
        assert_eq!(f1, f2);
        assert_ne!(f1, f3);
        assert_ne!(f1, f4);
    }

    #[test]
    fn display_forms() {
        assert_eq!(SpiralType::Int.to_string(), "int");
        assert_eq!(
            SpiralType::list(SpiralType::Int).to_string(),
            "list<int>"
        );
        assert_eq!(
            SpiralType::function(vec![SpiralType::Int, SpiralType::Int], SpiralType::Int)
                .to_string(),
            "fn(int, int) -> int"
        );
        assert_eq!(
            SpiralType::channel(ChannelKind::Rendezvous, SpiralType::String).to_string(),
            "channel<rendezvous, string>"
        );
        assert_eq!(
            SpiralType::asynchronous(vec![SpiralType::Int], SpiralType::Int).to_string(),
            "async(int) -> future<int>"
        );
    }

    #[test]
    fn serde_roundtrip_primitives_and_wrappers() {
        for ty in [
            SpiralType::Bool,
            SpiralType::Void,
            SpiralType::list(SpiralType::Int),
            SpiralType::set(SpiralType::String),
            SpiralType::option(SpiralType::Float),
            SpiralType::reference(SpiralType::Int),
            SpiralType::future(SpiralType::Bool),
            SpiralType::task(SpiralType::Int),
            SpiralType::channel(ChannelKind::Buffered, SpiralType::Int),
            SpiralType::map(SpiralType::String, SpiralType::Int),
            SpiralType::opaque("blob"),
            SpiralType::function(vec![SpiralType::Int], SpiralType::Int),
            SpiralType::asynchronous(vec![], SpiralType::Void),
        ] {
            let json = serde_json::to_string(&ty).unwrap();
            let back: SpiralType = serde_json::from_str(&json).unwrap();
            assert_eq!(ty, back);
        }
    }

    #[test]
    fn serde_kind_tags() {
        let json = serde_json::to_value(&SpiralType::Int).unwrap();
        assert_eq!(json["kind"], "int");
        let json = serde_json::to_value(&SpiralType::channel(
            ChannelKind::Rendezvous,
            SpiralType::Int,
        ))
        .unwrap();
        assert_eq!(json["kind"], "channel");
        assert_eq!(json["channelKind"], "rendezvous");
        assert_eq!(json["of"]["kind"], "int");
    }

    #[test]
    fn optional_params_omitted_when_absent() {
        let json =
            serde_json::to_value(&SpiralType::function(vec![SpiralType::Int], SpiralType::Int))
                .unwrap();
        assert!(json.get("optionalParams").is_none());

        let with = SpiralType::function_with_optional(
            vec![SpiralType::Int, SpiralType::Int],
            SpiralType::Int,
            vec![false, true],
        );
        let json = serde_json::to_value(&with).unwrap();
        assert_eq!(json["optionalParams"], serde_json::json!([false, true]));
    }
}
