//! Canonical JSON signing input
//!
//! Tokens and topic messages are signed over the canonical JSON of their
//! fields: object keys sorted lexicographically at every depth, no
//! insignificant whitespace. Both sides of a verification must byte-agree,
//! so the rendering here is the single source of truth.

use serde_json::Value;

/// Render a JSON value in canonical form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

/// Signing input for a signed object: the canonical form with the
/// `signature` field removed.
pub fn signing_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::Object(map) => {
            let mut stripped = map.clone();
            stripped.remove("signature");
            canonical_json(&Value::Object(stripped)).into_bytes()
        }
        other => canonical_json(other).into_bytes(),
    }
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_value(out, &map[*key]);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_at_every_depth() {
        let v = json!({"b": 1, "a": {"z": true, "m": [1, {"k": "v", "a": null}]}});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":{"m":[1,{"a":null,"k":"v"}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn rendering_is_deterministic() {
        let v = json!({"x": [3, 2, 1], "y": "s"});
        assert_eq!(canonical_json(&v), canonical_json(&v.clone()));
    }

    #[test]
    fn signing_bytes_strip_the_signature_field() {
        let signed = json!({"holder": "abc", "signature": "ff00", "timestamp": 7});
        let unsigned = json!({"holder": "abc", "timestamp": 7});
        assert_eq!(signing_bytes(&signed), signing_bytes(&unsigned));
    }

    #[test]
    fn string_escaping_is_json() {
        let v = json!({"msg": "line\nbreak \"quoted\""});
        let rendered = canonical_json(&v);
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed, v);
    }
}
