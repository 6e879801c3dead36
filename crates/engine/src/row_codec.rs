//! Bit-exact row encoding: schema-ordered INT/FLOAT/TEXT fields to bytes
//! and back. This is the payload that lands inside a data page cell (see
//! `storage::data_page`). The 4-byte cell length prefix is added by the
//! caller, not by this codec.

use catalog::TableSchema;
use common::{DbError, DbResult, RowMap};
use types::{SqlType, Value};

/// Serializes `row` against `schema`, iterating columns in schema
/// (insertion) order. Every column must be present in `row`; `Value::Null`
/// is not itself encoded as a distinct wire form here, callers that need
/// nullable columns should keep `Value::Null` out of the row dict and treat
/// a missing key as null (see `IndexManager`, which already skips columns
/// with no value when maintaining indexes).
pub fn encode_row(schema: &TableSchema, row: &RowMap) -> DbResult<Vec<u8>> {
    let mut out = Vec::new();
    for col in &schema.columns {
        let value = row
            .get(&col.name)
            .ok_or_else(|| DbError::ColumnNotFound(col.name.clone()))?;
        encode_value(&mut out, value, &col.sql_type)?;
    }
    Ok(out)
}

fn encode_value(out: &mut Vec<u8>, value: &Value, sql_type: &SqlType) -> DbResult<()> {
    match (value, sql_type) {
        (Value::Int(i), SqlType::Int) => out.extend_from_slice(&i.to_le_bytes()),
        (Value::Float(f), SqlType::Float) => out.extend_from_slice(&f.to_le_bytes()),
        (Value::Text(s), SqlType::Text) => {
            let bytes = s.as_bytes();
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        _ => {
            return Err(DbError::Decode(format!(
                "value {value:?} does not match column type {sql_type:?}"
            )))
        }
    }
    Ok(())
}

fn decode_value(buf: &[u8], offset: usize, sql_type: &SqlType) -> DbResult<(Value, usize)> {
    match sql_type {
        SqlType::Int => {
            let bytes = buf
                .get(offset..offset + 4)
                .ok_or_else(|| DbError::Decode("truncated int column".into()))?;
            Ok((Value::Int(i32::from_le_bytes(bytes.try_into().unwrap())), offset + 4))
        }
        SqlType::Float => {
            let bytes = buf
                .get(offset..offset + 4)
                .ok_or_else(|| DbError::Decode("truncated float column".into()))?;
            Ok((Value::Float(f32::from_le_bytes(bytes.try_into().unwrap())), offset + 4))
        }
        SqlType::Text => {
            let len_bytes = buf
                .get(offset..offset + 4)
                .ok_or_else(|| DbError::Decode("truncated text length".into()))?;
            let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
            let start = offset + 4;
            let text_bytes = buf
                .get(start..start + len)
                .ok_or_else(|| DbError::Decode("truncated text payload".into()))?;
            let s = std::str::from_utf8(text_bytes)
                .map_err(|e| DbError::Decode(format!("invalid utf-8 in text column: {e}")))?;
            Ok((Value::Text(s.to_string()), start + len))
        }
    }
}

/// Decodes every column of `bytes` against `schema`, in order.
pub fn decode_row(schema: &TableSchema, bytes: &[u8]) -> DbResult<RowMap> {
    let mut row = RowMap::new();
    let mut offset = 0;
    for col in &schema.columns {
        let (value, next) = decode_value(bytes, offset, &col.sql_type)?;
        row.insert(col.name.clone(), value);
        offset = next;
    }
    Ok(row)
}

/// Decodes only `column` out of an encoded row, stepping past the columns
/// that precede it. Used by the index populator, which needs one column's
/// value per row rather than the whole decoded dict.
pub fn decode_column(schema: &TableSchema, bytes: &[u8], column: &str) -> DbResult<Value> {
    let mut offset = 0;
    for col in &schema.columns {
        let (value, next) = decode_value(bytes, offset, &col.sql_type)?;
        if col.name == column {
            return Ok(value);
        }
        offset = next;
    }
    Err(DbError::ColumnNotFound(column.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::ColumnDef;

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            ColumnDef::new("id", SqlType::Int).primary_key(),
            ColumnDef::new("name", SqlType::Text),
            ColumnDef::new("score", SqlType::Float),
        ])
    }

    fn row(id: i32, name: &str, score: f32) -> RowMap {
        RowMap::from_iter([
            ("id".to_string(), Value::Int(id)),
            ("name".to_string(), Value::Text(name.to_string())),
            ("score".to_string(), Value::Float(score)),
        ])
    }

    #[test]
    fn round_trips_all_types() {
        let schema = schema();
        let row = row(7, "hello world", 3.5);
        let bytes = encode_row(&schema, &row).unwrap();
        let back = decode_row(&schema, &bytes).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn decode_column_skips_preceding_columns() {
        let schema = schema();
        let row = row(42, "abc", 1.25);
        let bytes = encode_row(&schema, &row).unwrap();
        assert_eq!(decode_column(&schema, &bytes, "name").unwrap(), Value::Text("abc".into()));
        assert_eq!(decode_column(&schema, &bytes, "score").unwrap(), Value::Float(1.25));
    }

    #[test]
    fn missing_row_column_is_rejected() {
        let schema = schema();
        let mut row = row(1, "x", 0.0);
        row.remove("name");
        assert!(matches!(encode_row(&schema, &row), Err(DbError::ColumnNotFound(_))));
    }

    #[test]
    fn truncated_bytes_fail_decode() {
        let schema = schema();
        assert!(decode_row(&schema, &[0u8; 2]).is_err());
    }
}
