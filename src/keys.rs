//! Entity-key encoding used as the store index.

use std::collections::BTreeMap;

use thiserror::Error;

pub const KEY_SEPARATOR: char = ';';

/// Entity key columns and their string values.
pub type EntityKeys = BTreeMap<String, String>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("missing key {0}")]
    MissingKey(String),
    #[error("invalid encoded keys '{encoded}': expected {expected} parts, got {actual}")]
    InvalidEncodedKeys {
        encoded: String,
        expected: usize,
        actual: usize,
    },
}

/// Joins the values of `keys` in the order of `key_names`.
///
/// Separators and backslashes inside values are backslash-escaped.
pub fn encode_keys(key_names: &[String], keys: &EntityKeys) -> Result<String, KeyError> {
    let mut out = String::new();
    for (idx, name) in key_names.iter().enumerate() {
        let value = keys
            .get(name)
            .ok_or_else(|| KeyError::MissingKey(name.clone()))?;
        if idx > 0 {
            out.push(KEY_SEPARATOR);
        }
        for c in value.chars() {
            if c == KEY_SEPARATOR || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
    }
    Ok(out)
}

pub fn decode_keys(key_names: &[String], encoded: &str) -> Result<EntityKeys, KeyError> {
    // An empty key list encodes to "", which still splits into one part.
    if key_names.is_empty() && encoded.is_empty() {
        return Ok(EntityKeys::new());
    }
    let parts = split_encoded(encoded);
    if parts.len() != key_names.len() {
        return Err(KeyError::InvalidEncodedKeys {
            encoded: encoded.to_string(),
            expected: key_names.len(),
            actual: parts.len(),
        });
    }
    Ok(key_names
        .iter()
        .cloned()
        .zip(parts)
        .collect())
}

fn split_encoded(encoded: &str) -> Vec<String> {
    let mut parts = vec![String::new()];
    let mut escaped = false;
    for c in encoded.chars() {
        if escaped {
            if let Some(last) = parts.last_mut() {
                last.push(c);
            }
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == KEY_SEPARATOR {
            parts.push(String::new());
        } else if let Some(last) = parts.last_mut() {
            last.push(c);
        }
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn keys(pairs: &[(&str, &str)]) -> EntityKeys {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn encodes_in_declared_order() {
        let k = keys(&[("b", "2"), ("a", "1")]);
        assert_eq!(encode_keys(&names(&["b", "a"]), &k).unwrap(), "2;1");
        assert_eq!(encode_keys(&names(&["a", "b"]), &k).unwrap(), "1;2");
    }

    #[test]
    fn decode_inverts_encode() {
        let cases = [
            (names(&["customer_id"]), keys(&[("customer_id", "customer_7")])),
            (
                names(&["region", "customer_id", "device"]),
                keys(&[("region", "eu"), ("customer_id", "42"), ("device", "")]),
            ),
            (
                names(&["a", "b"]),
                keys(&[("a", "x;y"), ("b", "back\\slash")]),
            ),
        ];
        for (key_names, k) in cases {
            let encoded = encode_keys(&key_names, &k).unwrap();
            assert_eq!(decode_keys(&key_names, &encoded).unwrap(), k);
        }
    }

    #[test]
    fn empty_key_list_round_trips() {
        let encoded = encode_keys(&[], &keys(&[("ignored", "1")])).unwrap();
        assert_eq!(encoded, "");
        assert_eq!(decode_keys(&[], &encoded).unwrap(), EntityKeys::new());
        assert!(decode_keys(&[], "x").is_err());
    }

    #[test]
    fn missing_and_malformed_keys_are_errors() {
        assert_eq!(
            encode_keys(&names(&["a", "b"]), &keys(&[("a", "1")])).unwrap_err(),
            KeyError::MissingKey("b".to_string())
        );
        assert!(matches!(
            decode_keys(&names(&["a", "b"]), "1").unwrap_err(),
            KeyError::InvalidEncodedKeys {
                expected: 2,
                actual: 1,
                ..
            }
        ));
    }
}
