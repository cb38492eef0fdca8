//! Canonical JSON serialization.
//!
//! Tools exchange documents bit-stably: the canonical form emits object keys
//! in a fixed priority order, then the remaining keys alphabetically, with
//! `$ref` always first in any object containing it. Output is compact (no
//! whitespace). Hashing or diffing the canonical string is therefore stable
//! across producers.

use serde_json::Value as Json;

use crate::document::Document;
use crate::error::SpiralError;

/// Schema-style keys emitted before everything else, in this order.
const KEY_PRIORITY: [&str; 37] = [
    "$schema",
    "$id",
    "$ref",
    "$defs",
    "title",
    "description",
    "type",
    "const",
    "enum",
    "default",
    "properties",
    "patternProperties",
    "additionalProperties",
    "required",
    "items",
    "additionalItems",
    "contains",
    "minItems",
    "maxItems",
    "uniqueItems",
    "oneOf",
    "anyOf",
    "allOf",
    "not",
    "if",
    "then",
    "else",
    "discriminator",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "multipleOf",
    "minLength",
    "maxLength",
    "pattern",
    "format",
];

fn key_rank(key: &str) -> (usize, &str) {
    match KEY_PRIORITY.iter().position(|k| *k == key) {
        Some(i) => (i, key),
        None => (KEY_PRIORITY.len(), key),
    }
}

fn write_json(out: &mut String, value: &Json) {
    match value {
        Json::Null => out.push_str("null"),
        Json::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Json::Number(n) => out.push_str(&n.to_string()),
        Json::String(s) => {
            // serde_json's escaping is the canonical one.
            out.push_str(&serde_json::to_string(s).expect("string serialization is infallible"));
        }
        Json::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json(out, item);
            }
            out.push(']');
        }
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| key_rank(a).cmp(&key_rank(b)));
            // $ref always leads when present, ahead even of $schema/$id.
            if let Some(pos) = keys.iter().position(|k| *k == "$ref") {
                let r = keys.remove(pos);
                keys.insert(0, r);
            }
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json(out, &Json::String((*key).clone()));
                out.push(':');
                write_json(out, &map[key.as_str()]);
            }
            out.push('}');
        }
    }
}

/// Renders a JSON value in canonical key order, compact.
pub fn canonical_json(value: &Json) -> String {
    let mut out = String::new();
    write_json(&mut out, value);
    out
}

/// Renders a document in canonical form.
pub fn document_to_canonical_json(doc: &Document) -> Result<String, SpiralError> {
    let value = serde_json::to_value(doc).map_err(|e| SpiralError::Validation {
        message: format!("document serialization failed: {e}"),
        path: None,
    })?;
    Ok(canonical_json(&value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn priority_keys_precede_alphabetical_rest() {
        let value = json!({
            "zeta": 1,
            "type": "object",
            "alpha": 2,
            "title": "t",
        });
        assert_eq!(
            canonical_json(&value),
            r#"{"title":"t","type":"object","alpha":2,"zeta":1}"#
        );
    }

    #[test]
    fn dollar_ref_leads_any_object_containing_it() {
        let value = json!({
            "$schema": "s",
            "$ref": "#/nodes/0",
            "description": "d",
        });
        assert_eq!(
            canonical_json(&value),
            r##"{"$ref":"#/nodes/0","$schema":"s","description":"d"}"##
        );
    }

    #[test]
    fn nesting_is_canonicalized_recursively() {
        let value = json!({
            "b": {"y": 1, "x": 2},
            "a": [{"type": "int", "id": "n"}],
        });
        assert_eq!(
            canonical_json(&value),
            r#"{"a":[{"type":"int","id":"n"}],"b":{"x":2,"y":1}}"#
        );
    }

    #[test]
    fn scalars_render_compact() {
        assert_eq!(canonical_json(&json!(null)), "null");
        assert_eq!(canonical_json(&json!(true)), "true");
        assert_eq!(canonical_json(&json!(3)), "3");
        assert_eq!(canonical_json(&json!("a\"b")), r#""a\"b""#);
        assert_eq!(canonical_json(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let value = json!({
            "nodes": [{"id": "a", "expr": {"kind": "lit", "type": {"kind": "int"}, "value": 3}}],
            "version": "1.0.0",
            "result": "a",
        });
        let once = canonical_json(&value);
        let reparsed: Json = serde_json::from_str(&once).unwrap();
        assert_eq!(canonical_json(&reparsed), once);
    }
}
