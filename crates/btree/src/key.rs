//! Fixed-width, order-preserving key encoding for indexed column values.

use common::{DbError, DbResult};
use types::{SqlType, Value};

pub const KEY_SIZE: usize = 16;

/// A B+-tree key: a fixed 16-byte array, right zero-padded or truncated from
/// the encoded column value.
pub type Key = [u8; KEY_SIZE];

/// Encodes `value` (of the given column type) into a fixed-width key.
///
/// INT values are encoded as 8-byte big-endian signed integers so that
/// lexicographic byte comparison agrees with numeric order; the remaining
/// bytes stay zero. TEXT values are encoded as raw UTF-8, truncated or
/// zero-padded to [`KEY_SIZE`].
pub fn encode_key(value: &Value, sql_type: &SqlType) -> DbResult<Key> {
    let mut key = [0u8; KEY_SIZE];
    match (value, sql_type) {
        (Value::Int(i), SqlType::Int) => {
            let be = (*i as i64).to_be_bytes();
            key[..8].copy_from_slice(&be);
        }
        (Value::Text(s), SqlType::Text) => {
            let bytes = s.as_bytes();
            let n = bytes.len().min(KEY_SIZE);
            key[..n].copy_from_slice(&bytes[..n]);
        }
        _ => {
            return Err(DbError::Storage(format!(
                "cannot encode value {value:?} as a {sql_type:?} index key"
            )));
        }
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_keys_preserve_numeric_order() {
        let a = encode_key(&Value::Int(-5), &SqlType::Int).unwrap();
        let b = encode_key(&Value::Int(3), &SqlType::Int).unwrap();
        let c = encode_key(&Value::Int(1000), &SqlType::Int).unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn text_keys_truncate_and_pad() {
        let short = encode_key(&Value::Text("ab".into()), &SqlType::Text).unwrap();
        assert_eq!(&short[..2], b"ab");
        assert!(short[2..].iter().all(|&b| b == 0));

        let long = encode_key(
            &Value::Text("this string is definitely too long".into()),
            &SqlType::Text,
        )
        .unwrap();
        assert_eq!(long.len(), KEY_SIZE);
    }

    #[test]
    fn type_mismatch_is_rejected() {
        assert!(encode_key(&Value::Text("x".into()), &SqlType::Int).is_err());
        assert!(encode_key(&Value::Float(1.0), &SqlType::Float).is_err());
    }
}
