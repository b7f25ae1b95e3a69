//! Replication offset management for binlog-relay
//!
//! An offset is the unit of crash recovery: it names a position in a
//! source's change log up to which every committed transaction has been
//! handed to the publisher. This crate defines the offset value type,
//! ordering and parsing rules, and the durable store the decoder
//! checkpoints through.
//!
//! Offsets are tagged by source kind. Two offsets are comparable only when
//! their tags match; comparing across kinds is a configuration error
//! surfaced as [`OffsetError::KindMismatch`], never a panic.

mod offset;
mod store;

pub use offset::{Offset, OffsetError, SourceKind};
pub use store::{FileOffsetStore, OffsetFile, OffsetStore};
