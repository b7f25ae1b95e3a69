//! MySQL binlog source: replication-stream decoding and schema tracking.

mod decoder;
pub mod metadata;
mod value;

pub use decoder::BinlogDecoder;
pub use metadata::{MetadataCache, MySqlIntrospector, SchemaIntrospector, TableMeta};
