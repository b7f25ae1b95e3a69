//! Binlog Relay Library
//!
//! A CDC agent that tails a MySQL binary log and relays row changes as
//! per-transaction events.
//!
//! # Features
//!
//! - Binlog decoding: Typed events from the MySQL replication stream
//! - Transaction coalescing: One aggregate event per committed transaction
//! - Schema tracking: Per-table column and primary-key metadata, refreshed on DDL
//! - Reliable checkpointing: Resume from the last committed offset after a crash
//! - Backpressure: A bounded queue between the decoder and the coalescer
//!
//! # CLI Usage
//!
//! ```bash
//! # Tail the binlog, resuming from the offset file
//! binlog-relay --config relay.yaml
//!
//! # Resume from an explicit position
//! binlog-relay --config relay.yaml --from mysql:binlog.000042:1337
//! ```

pub mod coalesce;
pub mod config;
pub mod event;
pub mod mysql;
pub mod publish;
pub mod relay;
pub mod testing;

pub use coalesce::Coalescer;
pub use config::{Config, DatabaseConfig, DatabaseKind, RelayConfig, TableConfig};
pub use event::{BoundaryKind, Event, Offset, Operation, RowChange, RowData, SourceKind};
pub use publish::{LogPublisher, Publisher};
pub use relay::run_relay;
