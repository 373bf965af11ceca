//! 分页游标编解码
//!
//! 游标格式：`hex(排序值)-hex(行号)`，未指定排序字段时只有 `hex(行号)`。
//! 字符串按 UTF-8 字节编码，整数与时间按大端 i64，浮点按大端 f64 位模式，行号按大端 i64。

use serde_json::Value;
use trellis_errors::{TrellisError, TrellisResult};

use crate::query::{CursorPosition, FieldKind};

pub fn encode_cursor(sort: Option<(FieldKind, &Value)>, oid: i64) -> TrellisResult<String> {
    let oid_hex = hex::encode(oid.to_be_bytes());
    match sort {
        None => Ok(oid_hex),
        Some((kind, value)) => {
            let value = if value.is_null() {
                kind.missing_sort_value()
            } else {
                value.clone()
            };
            Ok(format!("{}-{oid_hex}", hex::encode(encode_value(kind, &value)?)))
        }
    }
}

/// 解析游标，空串表示从头开始
pub fn decode_cursor(cursor: &str, sort_kind: Option<FieldKind>) -> TrellisResult<Option<CursorPosition>> {
    if cursor.is_empty() {
        return Ok(None);
    }

    let (sort_value, oid_hex) = match (sort_kind, cursor.split_once('-')) {
        (Some(kind), Some((value_hex, oid_hex))) => {
            let bytes = decode_hex(value_hex)?;
            (Some(decode_value(kind, &bytes)?), oid_hex)
        }
        (None, None) => (None, cursor),
        (Some(_), None) => return Err(invalid_cursor("缺少排序值")),
        (None, Some(_)) => return Err(invalid_cursor("未指定排序字段却携带排序值")),
    };

    let oid = i64::from_be_bytes(fixed_width(&decode_hex(oid_hex)?)?);
    Ok(Some(CursorPosition { sort_value, oid }))
}

fn encode_value(kind: FieldKind, value: &Value) -> TrellisResult<Vec<u8>> {
    let mismatch = || TrellisError::internal(format!("排序值 {value} 与字段类型 {kind:?} 不符"));
    match kind {
        FieldKind::Text => value
            .as_str()
            .map(|s| s.as_bytes().to_vec())
            .ok_or_else(mismatch),
        FieldKind::Integer | FieldKind::Timestamp => value
            .as_i64()
            .map(|n| n.to_be_bytes().to_vec())
            .ok_or_else(mismatch),
        FieldKind::Float => value
            .as_f64()
            .map(|f| f.to_bits().to_be_bytes().to_vec())
            .ok_or_else(mismatch),
        FieldKind::Boolean => match value {
            Value::Bool(b) => Ok(vec![u8::from(*b)]),
            Value::Number(n) => Ok(vec![u8::from(n.as_i64() == Some(1))]),
            _ => Err(mismatch()),
        },
    }
}

fn decode_value(kind: FieldKind, bytes: &[u8]) -> TrellisResult<Value> {
    match kind {
        FieldKind::Text => String::from_utf8(bytes.to_vec())
            .map(Value::from)
            .map_err(|_| invalid_cursor("排序值不是合法的 UTF-8")),
        FieldKind::Integer | FieldKind::Timestamp => {
            Ok(Value::from(i64::from_be_bytes(fixed_width(bytes)?)))
        }
        FieldKind::Float => {
            let f = f64::from_bits(u64::from_be_bytes(fixed_width(bytes)?));
            serde_json::Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| invalid_cursor("排序值不是有限浮点数"))
        }
        FieldKind::Boolean => match bytes {
            [0] => Ok(Value::from(0)),
            [1] => Ok(Value::from(1)),
            _ => Err(invalid_cursor("布尔排序值无效")),
        },
    }
}

fn decode_hex(text: &str) -> TrellisResult<Vec<u8>> {
    hex::decode(text).map_err(|e| invalid_cursor(&e.to_string()))
}

fn fixed_width(bytes: &[u8]) -> TrellisResult<[u8; 8]> {
    bytes
        .try_into()
        .map_err(|_| invalid_cursor("数值长度必须为 8 字节"))
}

fn invalid_cursor(reason: &str) -> TrellisError {
    TrellisError::bad_input(format!("分页游标无效: {reason}"))
}
