//! Binlog column values as JSON
//!
//! Row images travel downstream as JSON objects, so every MySQL value the
//! replication stream can carry has to land on a `serde_json::Value`.
//! Conversion is total: values that have no faithful JSON form degrade
//! (bytes to base64, partial JSON diffs to null) instead of failing the
//! stream.

use base64::Engine;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::Value;
use tracing::warn;

/// Convert one decoded binlog value to JSON.
pub fn binlog_value_to_json(value: BinlogValue<'_>) -> serde_json::Value {
    match value {
        BinlogValue::Value(v) => plain_value_to_json(v),
        BinlogValue::Jsonb(jsonb) => match serde_json::Value::try_from(jsonb) {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to decode binary JSON column: {e}");
                serde_json::Value::Null
            }
        },
        BinlogValue::JsonDiff(_) => {
            // Emitted only with binlog_row_value_options=PARTIAL_JSON,
            // which this decoder does not reconstruct.
            warn!("partial JSON diff column is not supported, substituting null");
            serde_json::Value::Null
        }
    }
}

fn plain_value_to_json(value: Value) -> serde_json::Value {
    match value {
        Value::NULL => serde_json::Value::Null,
        Value::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(s) => serde_json::Value::String(s),
            Err(e) => {
                let encoded =
                    base64::engine::general_purpose::STANDARD.encode(e.into_bytes());
                serde_json::Value::String(encoded)
            }
        },
        Value::Int(i) => serde_json::Value::from(i),
        Value::UInt(u) => serde_json::Value::from(u),
        Value::Float(f) => serde_json::Value::from(f),
        Value::Double(d) => serde_json::Value::from(d),
        Value::Date(year, month, day, 0, 0, 0, 0) => {
            serde_json::Value::String(format!("{year:04}-{month:02}-{day:02}"))
        }
        Value::Date(year, month, day, hour, minute, second, 0) => {
            serde_json::Value::String(format!(
                "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
            ))
        }
        Value::Date(year, month, day, hour, minute, second, micros) => {
            serde_json::Value::String(format!(
                "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
            ))
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if negative { "-" } else { "" };
            let hours = days * 24 + u32::from(hours);
            if micros > 0 {
                serde_json::Value::String(format!(
                    "{sign}{hours:02}:{minutes:02}:{seconds:02}.{micros:06}"
                ))
            } else {
                serde_json::Value::String(format!("{sign}{hours:02}:{minutes:02}:{seconds:02}"))
            }
        }
    }
}
