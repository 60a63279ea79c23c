//! Canonical JSON encoding.
//!
//! Every structural hash in the protocol (transaction digests, receipt
//! digests, block header hashes, state leaves) is SHA-256 over this
//! encoding, so any two implementations must agree byte for byte:
//! object keys sorted lexicographically at every level, no insignificant
//! whitespace, strings with standard JSON escapes, and numbers in shortest
//! decimal form with integral floats printed without a fractional part.

use serde::Serialize;
use serde_json::Value;

use super::{sha256, Digest};

/// Largest integer exactly representable in an f64 (2^53).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Serialize a value to its canonical JSON string.
pub fn canonical_json<T: Serialize>(value: &T) -> String {
    let v = serde_json::to_value(value).unwrap_or(Value::Null);
    let mut out = String::new();
    write_value(&v, &mut out);
    out
}

/// Canonicalize an already-built JSON value.
pub fn canonical_json_value(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

/// SHA-256 over the canonical JSON encoding of a value.
pub fn hash_canonical<T: Serialize>(value: &T) -> Digest {
    sha256(canonical_json(value).as_bytes())
}

/// SHA-256 over the canonical encoding of a JSON value.
pub fn hash_canonical_value(value: &Value) -> Digest {
    sha256(canonical_json_value(value).as_bytes())
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => write_number(n, out),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

fn write_number(n: &serde_json::Number, out: &mut String) {
    if n.is_u64() || n.is_i64() {
        out.push_str(&n.to_string());
        return;
    }
    // Float: integral values print as plain integers so that e.g. an
    // effectiveness of exactly 1 encodes as "1", not "1.0".
    let f = n.as_f64().unwrap_or(0.0);
    if f.is_finite() && f.fract() == 0.0 && f.abs() < MAX_SAFE_INTEGER {
        out.push_str(&format!("{}", f as i64));
    } else {
        out.push_str(&n.to_string());
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_sorted_recursively() {
        let v = json!({"b": {"z": 1, "a": 2}, "a": 3});
        assert_eq!(canonical_json_value(&v), r#"{"a":3,"b":{"a":2,"z":1}}"#);
    }

    #[test]
    fn no_insignificant_whitespace() {
        let v = json!({"list": [1, 2, 3], "s": "x"});
        assert_eq!(canonical_json_value(&v), r#"{"list":[1,2,3],"s":"x"}"#);
    }

    #[test]
    fn integral_floats_print_without_fraction() {
        let v = json!({"e": 1.0, "half": 0.5, "zero": 0.0});
        assert_eq!(canonical_json_value(&v), r#"{"e":1,"half":0.5,"zero":0}"#);
    }

    #[test]
    fn integers_unchanged() {
        let v = json!({"n": 1000000007u64, "neg": -5});
        assert_eq!(canonical_json_value(&v), r#"{"n":1000000007,"neg":-5}"#);
    }

    #[test]
    fn string_escapes() {
        let v = json!("line\nbreak \"quoted\" \\ tab\t");
        assert_eq!(
            canonical_json_value(&v),
            r#""line\nbreak \"quoted\" \\ tab\t""#
        );
    }

    #[test]
    fn control_characters_escaped() {
        let v = json!("\u{01}");
        assert_eq!(canonical_json_value(&v), "\"\\u0001\"");
    }

    #[test]
    fn hash_is_order_insensitive_for_maps() {
        #[derive(Serialize)]
        struct A {
            x: u64,
            y: &'static str,
        }
        #[derive(Serialize)]
        struct B {
            y: &'static str,
            x: u64,
        }
        let a = hash_canonical(&A { x: 7, y: "v" });
        let b = hash_canonical(&B { y: "v", x: 7 });
        assert_eq!(a, b);
    }

    #[test]
    fn hash_differs_on_value_change() {
        let a = hash_canonical(&json!({"k": 1}));
        let b = hash_canonical(&json!({"k": 2}));
        assert_ne!(a, b);
    }

    #[test]
    fn arrays_keep_order() {
        let a = canonical_json_value(&json!([1, 2]));
        let b = canonical_json_value(&json!([2, 1]));
        assert_ne!(a, b);
    }
}
