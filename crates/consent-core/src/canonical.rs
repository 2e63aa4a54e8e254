//! Canonical JSON encoding for deterministic hashing and signing.
//!
//! Every hash and signature in the ledger is computed over canonical JSON:
//! - Object keys sorted by their UTF-8 bytes
//! - No insignificant whitespace
//! - Strings escaped minimally (`"`, `\`, control characters only)
//! - Numbers written in their shortest round-trip form
//!
//! The same logical value therefore always produces the same bytes, no matter
//! how the surrounding code happened to build its maps.

use serde::Serialize;
use serde_json::Value;

use crate::error::CoreError;

/// Serialize any value into canonical JSON bytes.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CoreError> {
    let value = serde_json::to_value(value).map_err(|e| CoreError::Encoding(e.to_string()))?;
    Ok(canonical_value_bytes(&value))
}

/// Encode an already-built JSON value canonically.
pub fn canonical_value_bytes(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value_to(&mut buf, value);
    buf
}

/// Canonical JSON as a `String`.
pub fn canonical_string(value: &Value) -> String {
    // Only valid UTF-8 is ever written.
    String::from_utf8_lossy(&canonical_value_bytes(value)).into_owned()
}

/// Recursively encode a JSON value.
fn encode_value_to(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.extend_from_slice(b"null"),
        Value::Bool(true) => buf.extend_from_slice(b"true"),
        Value::Bool(false) => buf.extend_from_slice(b"false"),
        Value::Number(n) => buf.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => encode_text(buf, s),
        Value::Array(items) => {
            buf.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    buf.push(b',');
                }
                encode_value_to(buf, item);
            }
            buf.push(b']');
        }
        Value::Object(map) => encode_object(buf, map),
    }
}

/// Encode an object with keys sorted by byte comparison.
fn encode_object(buf: &mut Vec<u8>, map: &serde_json::Map<String, Value>) {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    buf.push(b'{');
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            buf.push(b',');
        }
        encode_text(buf, key);
        buf.push(b':');
        encode_value_to(buf, value);
    }
    buf.push(b'}');
}

/// Encode a string literal with minimal escaping.
fn encode_text(buf: &mut Vec<u8>, s: &str) {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    buf.push(b'"');
    for ch in s.chars() {
        match ch {
            '"' => buf.extend_from_slice(b"\\\""),
            '\\' => buf.extend_from_slice(b"\\\\"),
            '\n' => buf.extend_from_slice(b"\\n"),
            '\r' => buf.extend_from_slice(b"\\r"),
            '\t' => buf.extend_from_slice(b"\\t"),
            '\u{08}' => buf.extend_from_slice(b"\\b"),
            '\u{0c}' => buf.extend_from_slice(b"\\f"),
            c if (c as u32) < 0x20 => {
                let n = c as u32 as usize;
                buf.extend_from_slice(b"\\u00");
                buf.push(HEX[n >> 4]);
                buf.push(HEX[n & 0xf]);
            }
            c => {
                let mut tmp = [0u8; 4];
                buf.extend_from_slice(c.encode_utf8(&mut tmp).as_bytes());
            }
        }
    }
    buf.push(b'"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_are_sorted() {
        let value = json!({"b": 1, "a": {"z": true, "c": null}});
        assert_eq!(canonical_string(&value), r#"{"a":{"c":null,"z":true},"b":1}"#);
    }

    #[test]
    fn test_arrays_keep_order() {
        let value = json!(["z", "a", 3]);
        assert_eq!(canonical_string(&value), r#"["z","a",3]"#);
    }

    #[test]
    fn test_escaping() {
        let value = json!("a\"b\\c\nd\u{1}é");
        assert_eq!(canonical_string(&value), "\"a\\\"b\\\\c\\nd\\u0001é\"");
    }

    #[test]
    fn test_deterministic_for_struct() {
        #[derive(Serialize)]
        struct Payload {
            zeta: u32,
            alpha: &'static str,
        }

        let bytes1 = canonical_json(&Payload { zeta: 7, alpha: "x" }).unwrap();
        let bytes2 = canonical_json(&Payload { zeta: 7, alpha: "x" }).unwrap();
        assert_eq!(bytes1, bytes2);
        assert_eq!(bytes1, br#"{"alpha":"x","zeta":7}"#.to_vec());
    }

    #[test]
    fn test_output_parses_back() {
        let value = json!({"k": [1, 2, {"y": "w", "x": -5}], "s": "tab\there"});
        let parsed: Value = serde_json::from_slice(&canonical_value_bytes(&value)).unwrap();
        assert_eq!(parsed, value);
    }
}
