//! Shared event vocabulary for the relay pipeline
//!
//! Everything flowing on the internal queue between the decoder and the
//! coalescer is one of the [`Event`] variants below. Events are immutable
//! values once constructed; the decoder hands them off and keeps no
//! reference. Dispatch is an exhaustive match in both the decoder and the
//! coalescer, so adding a variant is a compile-checked decision point.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub use offset_store::{Offset, SourceKind};

/// Row operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Transaction boundary kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BoundaryKind {
    Commit,
    Rollback,
}

impl fmt::Display for BoundaryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BoundaryKind::Commit => "COMMIT",
            BoundaryKind::Rollback => "ROLLBACK",
        };
        f.write_str(s)
    }
}

/// One logical row mutation.
///
/// INSERT carries `after` only, DELETE carries `before` only, UPDATE
/// carries both. `pk` is a single-entry projection of the primary-key
/// column, or empty when no key could be extracted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowData {
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub pk: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Map<String, Value>>,
}

/// One statement's effect on one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub schema: String,
    pub table: String,
    pub op: Operation,
    pub rows: Vec<RowData>,
}

/// A decoded change-log event.
///
/// - `RowChange` is transactional and must be buffered by transaction id,
///   never published directly.
/// - `Ddl` is non-transactional and published immediately.
/// - `TransactionBoundary` is a control signal for the coalescer and is
///   never published.
/// - `Transaction` is the published aggregate: every row change of one
///   committed transaction, in statement order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RowChange {
        source: SourceKind,
        offset: Offset,
        timestamp: DateTime<Utc>,
        tx_id: String,
        changes: Vec<RowChange>,
    },
    Ddl {
        source: SourceKind,
        offset: Offset,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        tx_id: String,
        query: String,
    },
    TransactionBoundary {
        source: SourceKind,
        offset: Offset,
        timestamp: DateTime<Utc>,
        tx_id: String,
        kind: BoundaryKind,
    },
    Transaction {
        source: SourceKind,
        offset: Offset,
        timestamp: DateTime<Utc>,
        tx_id: String,
        changes: Vec<RowChange>,
    },
}

impl Event {
    pub fn row_change(
        source: SourceKind,
        offset: Offset,
        timestamp: DateTime<Utc>,
        tx_id: impl Into<String>,
        changes: Vec<RowChange>,
    ) -> Self {
        Event::RowChange {
            source,
            offset,
            timestamp,
            tx_id: tx_id.into(),
            changes,
        }
    }

    pub fn ddl(
        source: SourceKind,
        offset: Offset,
        timestamp: DateTime<Utc>,
        tx_id: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Event::Ddl {
            source,
            offset,
            timestamp,
            tx_id: tx_id.into(),
            query: query.into(),
        }
    }

    pub fn boundary(
        source: SourceKind,
        offset: Offset,
        timestamp: DateTime<Utc>,
        tx_id: impl Into<String>,
        kind: BoundaryKind,
    ) -> Self {
        Event::TransactionBoundary {
            source,
            offset,
            timestamp,
            tx_id: tx_id.into(),
            kind,
        }
    }

    pub fn transaction(
        source: SourceKind,
        offset: Offset,
        timestamp: DateTime<Utc>,
        tx_id: impl Into<String>,
        changes: Vec<RowChange>,
    ) -> Self {
        Event::Transaction {
            source,
            offset,
            timestamp,
            tx_id: tx_id.into(),
            changes,
        }
    }

    pub fn source(&self) -> SourceKind {
        match self {
            Event::RowChange { source, .. }
            | Event::Ddl { source, .. }
            | Event::TransactionBoundary { source, .. }
            | Event::Transaction { source, .. } => *source,
        }
    }

    pub fn offset(&self) -> &Offset {
        match self {
            Event::RowChange { offset, .. }
            | Event::Ddl { offset, .. }
            | Event::TransactionBoundary { offset, .. }
            | Event::Transaction { offset, .. } => offset,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::RowChange { timestamp, .. }
            | Event::Ddl { timestamp, .. }
            | Event::TransactionBoundary { timestamp, .. }
            | Event::Transaction { timestamp, .. } => *timestamp,
        }
    }

    pub fn tx_id(&self) -> &str {
        match self {
            Event::RowChange { tx_id, .. }
            | Event::Ddl { tx_id, .. }
            | Event::TransactionBoundary { tx_id, .. }
            | Event::Transaction { tx_id, .. } => tx_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_offset() -> Offset {
        Offset::binlog("binlog.000001", 4)
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let event = Event::ddl(
            SourceKind::MysqlBinlog,
            sample_offset(),
            Utc::now(),
            "",
            "CREATE TABLE users (id INT)",
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "ddl");
        assert_eq!(value["query"], "CREATE TABLE users (id INT)");
        // Empty transaction ids are elided.
        assert!(value.get("tx_id").is_none());
    }

    #[test]
    fn row_data_elides_absent_images() {
        let mut pk = Map::new();
        pk.insert("id".to_string(), json!(1));
        let mut after = Map::new();
        after.insert("id".to_string(), json!(1));
        after.insert("name".to_string(), json!("alice"));

        let row = RowData {
            pk,
            before: None,
            after: Some(after),
        };
        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["pk"]["id"], 1);
        assert_eq!(value["after"]["name"], "alice");
        assert!(value.get("before").is_none());
    }

    #[test]
    fn envelope_accessors_cover_every_variant() {
        let ts = Utc::now();
        let events = vec![
            Event::row_change(SourceKind::MysqlBinlog, sample_offset(), ts, "tx:1", vec![]),
            Event::ddl(SourceKind::MysqlBinlog, sample_offset(), ts, "tx:1", "TRUNCATE t"),
            Event::boundary(
                SourceKind::MysqlBinlog,
                sample_offset(),
                ts,
                "tx:1",
                BoundaryKind::Commit,
            ),
            Event::transaction(SourceKind::MysqlBinlog, sample_offset(), ts, "tx:1", vec![]),
        ];
        for event in events {
            assert_eq!(event.source(), SourceKind::MysqlBinlog);
            assert_eq!(event.offset(), &sample_offset());
            assert_eq!(event.timestamp(), ts);
            assert_eq!(event.tx_id(), "tx:1");
        }
    }

    #[test]
    fn operation_and_boundary_serialize_uppercase() {
        assert_eq!(serde_json::to_value(Operation::Insert).unwrap(), "INSERT");
        assert_eq!(serde_json::to_value(BoundaryKind::Rollback).unwrap(), "ROLLBACK");
        assert_eq!(Operation::Delete.to_string(), "DELETE");
        assert_eq!(BoundaryKind::Commit.to_string(), "COMMIT");
    }
}
