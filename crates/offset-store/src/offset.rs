//! Offset value type: a tagged position within a source's change log.

use std::cmp::Ordering;
use std::fmt;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// The family of change log an offset (or event) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    /// MySQL/MariaDB binary log.
    #[serde(rename = "mysql-binlog")]
    MysqlBinlog,
    /// PostgreSQL write-ahead log. Recognized so offsets stay tagged;
    /// no decoder for it exists yet.
    #[serde(rename = "postgres-wal")]
    PostgresWal,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::MysqlBinlog => "mysql-binlog",
            SourceKind::PostgresWal => "postgres-wal",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised when two offsets of different source kinds are compared.
///
/// Mixing kinds means two unrelated deployments share an offset file or a
/// resume flag pointed at the wrong agent, so this is surfaced loudly
/// instead of ordering arbitrarily.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetError {
    KindMismatch { left: SourceKind, right: SourceKind },
}

impl fmt::Display for OffsetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffsetError::KindMismatch { left, right } => {
                write!(f, "cannot compare {left} offset against {right} offset")
            }
        }
    }
}

impl std::error::Error for OffsetError {}

/// A resumption position in a source's change log.
///
/// Binlog offsets order by file name lexicographically, then by byte
/// position. WAL offsets order by LSN. The serialized form is internally
/// tagged so a persisted offset names its own kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source")]
pub enum Offset {
    #[serde(rename = "mysql-binlog")]
    Binlog { file: String, pos: u32 },
    #[serde(rename = "postgres-wal")]
    Wal { lsn: u64 },
}

impl Offset {
    pub fn binlog(file: impl Into<String>, pos: u32) -> Self {
        Offset::Binlog {
            file: file.into(),
            pos,
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Offset::Binlog { .. } => SourceKind::MysqlBinlog,
            Offset::Wal { .. } => SourceKind::PostgresWal,
        }
    }

    /// Total order within one source kind.
    ///
    /// Returns [`OffsetError::KindMismatch`] when `self` and `other` carry
    /// different tags.
    pub fn compare(&self, other: &Offset) -> Result<Ordering, OffsetError> {
        match (self, other) {
            (
                Offset::Binlog { file: f1, pos: p1 },
                Offset::Binlog { file: f2, pos: p2 },
            ) => match f1.cmp(f2) {
                Ordering::Equal => Ok(p1.cmp(p2)),
                unequal => Ok(unequal),
            },
            (Offset::Wal { lsn: l1 }, Offset::Wal { lsn: l2 }) => Ok(l1.cmp(l2)),
            _ => Err(OffsetError::KindMismatch {
                left: self.kind(),
                right: other.kind(),
            }),
        }
    }

    /// CLI string form, e.g. `mysql:binlog.000002:4571` or `postgres:724019`.
    pub fn to_cli_string(&self) -> String {
        match self {
            Offset::Binlog { file, pos } => format!("mysql:{file}:{pos}"),
            Offset::Wal { lsn } => format!("postgres:{lsn}"),
        }
    }

    /// Parse the CLI string form produced by [`Offset::to_cli_string`].
    pub fn from_cli_string(s: &str) -> Result<Self> {
        let (tag, rest) = s
            .split_once(':')
            .with_context(|| format!("invalid offset '{s}', expected <source>:<position>"))?;
        match tag {
            "mysql" => {
                let (file, pos) = rest.rsplit_once(':').with_context(|| {
                    format!("invalid mysql offset '{s}', expected mysql:<file>:<pos>")
                })?;
                if file.is_empty() {
                    bail!("invalid mysql offset '{s}': empty binlog file name");
                }
                let pos: u32 = pos
                    .parse()
                    .with_context(|| format!("invalid binlog position in offset '{s}'"))?;
                Ok(Offset::binlog(file, pos))
            }
            "postgres" => {
                let lsn: u64 = rest
                    .parse()
                    .with_context(|| format!("invalid LSN in offset '{s}'"))?;
                Ok(Offset::Wal { lsn })
            }
            other => bail!("unknown offset source '{other}' in '{s}'"),
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Offset::Binlog { file, pos } => write!(f, "{file}:{pos}"),
            Offset::Wal { lsn } => write!(f, "{lsn}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binlog_offsets_order_by_file_then_position() {
        let early = Offset::binlog("binlog.000001", 9999);
        let late = Offset::binlog("binlog.000002", 4);

        // File name wins regardless of position.
        assert_eq!(early.compare(&late).unwrap(), Ordering::Less);
        assert_eq!(late.compare(&early).unwrap(), Ordering::Greater);

        let a = Offset::binlog("binlog.000002", 100);
        let b = Offset::binlog("binlog.000002", 200);
        assert_eq!(a.compare(&b).unwrap(), Ordering::Less);
        assert_eq!(b.compare(&a).unwrap(), Ordering::Greater);
        assert_eq!(a.compare(&a).unwrap(), Ordering::Equal);
    }

    #[test]
    fn wal_offsets_order_by_lsn() {
        let a = Offset::Wal { lsn: 10 };
        let b = Offset::Wal { lsn: 20 };
        assert_eq!(a.compare(&b).unwrap(), Ordering::Less);
        assert_eq!(b.compare(&b).unwrap(), Ordering::Equal);
    }

    #[test]
    fn cross_kind_comparison_is_an_error() {
        let binlog = Offset::binlog("binlog.000001", 4);
        let wal = Offset::Wal { lsn: 42 };

        let err = binlog.compare(&wal).unwrap_err();
        assert_eq!(
            err,
            OffsetError::KindMismatch {
                left: SourceKind::MysqlBinlog,
                right: SourceKind::PostgresWal,
            }
        );
        assert!(err.to_string().contains("mysql-binlog"));
        assert!(err.to_string().contains("postgres-wal"));
    }

    #[test]
    fn display_matches_file_colon_pos() {
        let off = Offset::binlog("binlog.000007", 1234);
        assert_eq!(off.to_string(), "binlog.000007:1234");
        assert_eq!(Offset::Wal { lsn: 55 }.to_string(), "55");
    }

    #[test]
    fn cli_string_round_trip() {
        let off = Offset::binlog("binlog.000002", 4571);
        assert_eq!(off.to_cli_string(), "mysql:binlog.000002:4571");
        assert_eq!(Offset::from_cli_string("mysql:binlog.000002:4571").unwrap(), off);

        let wal = Offset::Wal { lsn: 724019 };
        assert_eq!(Offset::from_cli_string(&wal.to_cli_string()).unwrap(), wal);
    }

    #[test]
    fn cli_string_rejects_malformed_input() {
        assert!(Offset::from_cli_string("").is_err());
        assert!(Offset::from_cli_string("mysql").is_err());
        assert!(Offset::from_cli_string("mysql:no-position").is_err());
        assert!(Offset::from_cli_string("mysql::123").is_err());
        assert!(Offset::from_cli_string("mysql:binlog.000001:notanumber").is_err());
        assert!(Offset::from_cli_string("postgres:abc").is_err());
        assert!(Offset::from_cli_string("oracle:scn:1").is_err());
    }

    #[test]
    fn serialized_form_is_tagged_by_source() {
        let off = Offset::binlog("binlog.000002", 4571);
        let json = serde_json::to_value(&off).unwrap();
        assert_eq!(json["source"], "mysql-binlog");
        assert_eq!(json["file"], "binlog.000002");
        assert_eq!(json["pos"], 4571);

        let back: Offset = serde_json::from_value(json).unwrap();
        assert_eq!(back, off);
    }
}
