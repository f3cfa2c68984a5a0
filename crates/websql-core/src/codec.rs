//! Parameter encoding for text-oriented engine channels.
//!
//! WebSQL engines only carry null, boolean, number and string parameters.
//! Binary payloads are smuggled through as `"bin!"` followed by the
//! lowercase hex of the bytes, and absent parameters are sent as NULL.
//! Result values carrying the tag are turned back into bytes.
//!
//! A user string that happens to start with `bin!` followed by valid hex is
//! indistinguishable from an encoded blob and decodes as bytes.

use crate::row::Row;
use crate::value::Value;

/// Prefix marking a hex-encoded binary payload.
pub const BINARY_TAG: &str = "bin!";

/// Encode a parameter list for submission to the engine.
pub fn encode(values: &[Value]) -> Vec<Value> {
    values.iter().map(encode_value).collect()
}

/// Encode a single parameter.
pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Undefined => Value::Null,
        Value::Bytes(bytes) => {
            let mut text = String::with_capacity(BINARY_TAG.len() + bytes.len() * 2);
            text.push_str(BINARY_TAG);
            text.push_str(&hex::encode(bytes));
            Value::Text(text)
        }
        other => other.clone(),
    }
}

/// Decode a single result value.
///
/// Tagged text whose remainder is not valid hex is returned unchanged.
pub fn decode(value: Value) -> Value {
    match value {
        Value::Text(text) => match decode_tagged(&text) {
            Some(bytes) => Value::Bytes(bytes),
            None => Value::Text(text),
        },
        other => other,
    }
}

/// Decode every value of a result row.
pub fn decode_row(row: &Row) -> Row {
    row.map_values(|value| match value {
        Value::Text(text) => decode_tagged(text).map_or_else(|| value.clone(), Value::Bytes),
        other => other.clone(),
    })
}

fn decode_tagged(text: &str) -> Option<Vec<u8>> {
    let payload = text.strip_prefix(BINARY_TAG)?;
    match hex::decode(payload) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            tracing::trace!(error = %err, "tagged text is not valid hex; passing through");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_bytes_with_tag() {
        let encoded = encode(&[Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef])]);
        assert_eq!(encoded, vec![Value::Text("bin!deadbeef".to_string())]);
    }

    #[test]
    fn encodes_undefined_as_null() {
        assert_eq!(
            encode(&[Value::Undefined, Value::Null]),
            vec![Value::Null, Value::Null]
        );
    }

    #[test]
    fn leaves_plain_values_alone() {
        let values = vec![
            Value::BigInt(2),
            Value::Double(0.5),
            Value::Bool(false),
            Value::Text("hello".to_string()),
        ];
        assert_eq!(encode(&values), values);
        assert!(encode(&[]).is_empty());
    }

    #[test]
    fn decodes_tagged_hex() {
        let blob = vec![0u8, 1, 0x7f, 0x80, 0xff];
        let encoded = encode(&[Value::Bytes(blob.clone())]).remove(0);
        assert_eq!(decode(encoded), Value::Bytes(blob));
        assert_eq!(
            decode(Value::Text("bin!".to_string())),
            Value::Bytes(Vec::new())
        );
    }

    #[test]
    fn invalid_hex_passes_through() {
        for text in ["bin!xyz", "bin!abc", "bin"] {
            assert_eq!(
                decode(Value::Text(text.to_string())),
                Value::Text(text.to_string())
            );
        }
    }

    #[test]
    fn lookalike_strings_decode_as_binary() {
        assert_eq!(
            decode(Value::Text("bin!cafe".to_string())),
            Value::Bytes(vec![0xca, 0xfe])
        );
    }

    #[test]
    fn decode_row_touches_only_tagged_text() {
        let row = Row::new(
            vec!["id".to_string(), "data".to_string(), "note".to_string()],
            vec![
                Value::BigInt(1),
                Value::Text("bin!0102".to_string()),
                Value::Text("plain".to_string()),
            ],
        );
        let decoded = decode_row(&row);
        assert_eq!(decoded.get(0), Some(&Value::BigInt(1)));
        assert_eq!(decoded.get_by_name("data"), Some(&Value::Bytes(vec![1, 2])));
        assert_eq!(
            decoded.get_by_name("note"),
            Some(&Value::Text("plain".to_string()))
        );
    }
}
