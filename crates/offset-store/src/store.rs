//! Durable offset storage.
//!
//! The decoder checkpoints through the [`OffsetStore`] trait after every
//! commit boundary and every schema-change event. The file implementation
//! keeps a single small JSON document; a missing file means "cold start
//! from the server's current position" and is not an error.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::offset::{Offset, SourceKind};

/// Storage backend for the resumption offset.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Persist `offset` as the new resumption position.
    async fn save(&self, offset: &Offset) -> Result<()>;

    /// Read the persisted resumption position.
    ///
    /// Returns `Ok(None)` when no offset has been persisted yet.
    async fn load(&self) -> Result<Option<Offset>>;
}

/// On-disk envelope around the offset value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetFile {
    pub offset: Offset,
    /// When this checkpoint was written.
    pub saved_at: DateTime<Utc>,
}

/// Single-file JSON implementation of [`OffsetStore`].
///
/// The write overwrites in place; a crash mid-write can tear the file,
/// which replay from the previous checkpoint absorbs.
pub struct FileOffsetStore {
    path: PathBuf,
    kind: SourceKind,
}

impl FileOffsetStore {
    /// Create a store for offsets of the given source kind at `path`.
    pub fn new(path: impl Into<PathBuf>, kind: SourceKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn save(&self, offset: &Offset) -> Result<()> {
        if offset.kind() != self.kind {
            bail!(
                "offset kind mismatch: store expects {}, got {}",
                self.kind,
                offset.kind()
            );
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create offset directory {}", parent.display())
                })?;
            }
        }

        let envelope = OffsetFile {
            offset: offset.clone(),
            saved_at: Utc::now(),
        };

        std::fs::write(&self.path, serde_json::to_string_pretty(&envelope)?)
            .with_context(|| format!("failed to write offset file {}", self.path.display()))?;
        tracing::debug!("saved offset {} to {}", offset, self.path.display());
        Ok(())
    }

    async fn load(&self) -> Result<Option<Offset>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read offset file {}", self.path.display()))?;
        let envelope: OffsetFile = serde_json::from_str(&content)
            .with_context(|| format!("malformed offset file {}", self.path.display()))?;

        if envelope.offset.kind() != self.kind {
            bail!(
                "offset file {} holds a {} offset, expected {}",
                self.path.display(),
                envelope.offset.kind(),
                self.kind
            );
        }

        Ok(Some(envelope.offset))
    }
}
