//! Literal conversion: raw JSON payloads into runtime values.
//!
//! Primitive literals route directly; compound literals convert their
//! contents recursively against the declared element types. Shapes that
//! cannot be literals (functions, channels, futures) are type errors.

use serde_json::Value as Json;

use spiral_core::error::ErrorCode;
use spiral_core::types::SpiralType;
use spiral_core::value::{Value, ValueMap, ValueSet};

fn type_error(expected: &str, raw: &Json) -> Value {
    Value::error_msg(
        ErrorCode::Type,
        format!("expected {expected} literal, got {raw}"),
    )
}

/// Best-effort conversion of untyped JSON into a value: integers stay
/// integral, objects become string-keyed maps.
pub fn json_to_value(raw: &Json) -> Value {
    match raw {
        Json::Null => Value::Void,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => Value::Str(s.clone()),
        Json::Array(items) => Value::List(items.iter().map(json_to_value).collect()),
        Json::Object(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (Value::Str(k.clone()), json_to_value(v)))
                .collect(),
        ),
    }
}

/// Converts a literal payload against its declared type. Mismatches are
/// `TypeError` values, never panics.
pub fn convert_literal(ty: &SpiralType, raw: &Json) -> Value {
    match ty {
        SpiralType::Bool => match raw.as_bool() {
            Some(b) => Value::Bool(b),
            None => type_error("bool", raw),
        },
        SpiralType::Int => match raw.as_i64() {
            Some(i) => Value::Int(i),
            None => type_error("int", raw),
        },
        SpiralType::Float => match raw.as_f64() {
            Some(f) => Value::Float(f),
            None => type_error("float", raw),
        },
        SpiralType::String => match raw.as_str() {
            Some(s) => Value::Str(s.to_string()),
            None => type_error("string", raw),
        },
        SpiralType::Void => Value::Void,

        SpiralType::List { of } => match raw.as_array() {
            Some(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    let v = convert_literal(of, item);
                    if v.is_error() {
                        return v;
                    }
                    out.push(v);
                }
                Value::List(out)
            }
            None => type_error("list", raw),
        },

        SpiralType::Set { of } => match raw.as_array() {
            Some(items) => {
                let mut out = ValueSet::new();
                for item in items {
                    let v = convert_literal(of, item);
                    if v.is_error() {
                        return v;
                    }
                    out.insert(v);
                }
                Value::Set(out)
            }
            None => type_error("set", raw),
        },

        SpiralType::Map { key, value } => match raw {
            // Object form: keys are strings.
            Json::Object(entries) => {
                let mut out = ValueMap::new();
                for (k, v) in entries {
                    let converted = convert_literal(value, v);
                    if converted.is_error() {
                        return converted;
                    }
                    out.insert(Value::Str(k.clone()), converted);
                }
                Value::Map(out)
            }
            // Pair-list form: [[k, v], ...] with typed keys.
            Json::Array(pairs) => {
                let mut out = ValueMap::new();
                for pair in pairs {
                    let Some(kv) = pair.as_array().filter(|p| p.len() == 2) else {
                        return type_error("map entry pair", pair);
                    };
                    let k = convert_literal(key, &kv[0]);
                    if k.is_error() {
                        return k;
                    }
                    let v = convert_literal(value, &kv[1]);
                    if v.is_error() {
                        return v;
                    }
                    out.insert(k, v);
                }
                Value::Map(out)
            }
            _ => type_error("map", raw),
        },

        SpiralType::Option { of } => match raw {
            Json::Null => Value::none(),
            other => {
                let v = convert_literal(of, other);
                if v.is_error() {
                    v
                } else {
                    Value::some(v)
                }
            }
        },

        SpiralType::Opaque { name } => Value::Opaque {
            name: name.clone(),
            payload: Box::new(json_to_value(raw)),
        },

        SpiralType::Ref { .. }
        | SpiralType::Future { .. }
        | SpiralType::Channel { .. }
        | SpiralType::Task { .. }
        | SpiralType::Fn { .. }
        | SpiralType::Async { .. } => Value::error_msg(
            ErrorCode::Type,
            format!("'{ty}' values cannot be constructed from a literal"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn primitives_route_directly() {
        assert_eq!(convert_literal(&SpiralType::Int, &json!(3)), Value::Int(3));
        assert_eq!(
            convert_literal(&SpiralType::Bool, &json!(true)),
            Value::Bool(true)
        );
        assert_eq!(
            convert_literal(&SpiralType::Float, &json!(1.5)),
            Value::Float(1.5)
        );
        assert_eq!(
            convert_literal(&SpiralType::String, &json!("hi")),
            Value::str("hi")
        );
        assert_eq!(convert_literal(&SpiralType::Void, &json!(null)), Value::Void);
    }

    #[test]
    fn list_literals_convert_recursively() {
        let out = convert_literal(
            &SpiralType::list(SpiralType::list(SpiralType::Int)),
            &json!([[1, 2], [3]]),
        );
        assert_eq!(
            out,
            Value::List(vec![
                Value::List(vec![Value::Int(1), Value::Int(2)]),
                Value::List(vec![Value::Int(3)]),
            ])
        );
    }

    #[test]
    fn non_array_for_list_literal_is_a_type_error() {
        let out = convert_literal(&SpiralType::list(SpiralType::Int), &json!(5));
        assert_eq!(out.as_error().unwrap().code, ErrorCode::Type);
    }

    #[test]
    fn element_mismatch_propagates() {
        let out = convert_literal(&SpiralType::list(SpiralType::Int), &json!([1, "x"]));
        assert_eq!(out.as_error().unwrap().code, ErrorCode::Type);
    }

    #[test]
    fn set_literals_deduplicate() {
        let out = convert_literal(&SpiralType::set(SpiralType::Int), &json!([1, 1, 2]));
        match out {
            Value::Set(s) => assert_eq!(s.len(), 2),
            other => panic!("expected set, got {other}"),
        }
    }

    #[test]
    fn map_literals_accept_object_and_pair_forms() {
        let obj = convert_literal(
            &SpiralType::map(SpiralType::String, SpiralType::Int),
            &json!({"a": 1, "b": 2}),
        );
        match &obj {
            Value::Map(m) => {
                assert_eq!(m.get(&Value::str("a")), Some(&Value::Int(1)));
                assert_eq!(m.len(), 2);
            }
            other => panic!("expected map, got {other}"),
        }

        let pairs = convert_literal(
            &SpiralType::map(SpiralType::Int, SpiralType::Bool),
            &json!([[1, true], [2, false]]),
        );
        match &pairs {
            Value::Map(m) => assert_eq!(m.get(&Value::Int(2)), Some(&Value::Bool(false))),
            other => panic!("expected map, got {other}"),
        }
    }

    #[test]
    fn option_literals() {
        assert_eq!(
            convert_literal(&SpiralType::option(SpiralType::Int), &json!(null)),
            Value::none()
        );
        assert_eq!(
            convert_literal(&SpiralType::option(SpiralType::Int), &json!(4)),
            Value::some(Value::Int(4))
        );
    }

    #[test]
    fn opaque_keeps_the_raw_payload() {
        let out = convert_literal(&SpiralType::opaque("blob"), &json!({"x": 1}));
        match out {
            Value::Opaque { name, payload } => {
                assert_eq!(name, "blob");
                assert!(matches!(*payload, Value::Map(_)));
            }
            other => panic!("expected opaque, got {other}"),
        }
    }

    #[test]
    fn non_literal_shapes_are_rejected() {
        let out = convert_literal(
            &SpiralType::function(vec![], SpiralType::Int),
            &json!(null),
        );
        assert_eq!(out.as_error().unwrap().code, ErrorCode::Type);
    }
}
