//! Publisher boundary
//!
//! The downstream bus client is an external collaborator; the relay only
//! depends on the [`Publisher`] trait. Serialization and delivery
//! guarantees belong to the implementation. The coalescer logs publish
//! failures and moves on; redelivery relies on offset replay after a
//! restart, not on per-message retry.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::event::Event;

/// Downstream sink for finished events.
///
/// Only [`Event::Transaction`] and [`Event::Ddl`] are ever handed to a
/// publisher by the coalescer, but implementations must accept every
/// variant without failing.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: &Event) -> Result<()>;
}

/// Publisher that writes events to the log instead of a bus.
///
/// Stands in at the interface boundary when no bus is wired up, and is
/// handy for smoke-testing a capture setup end to end.
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, event: &Event) -> Result<()> {
        match event {
            Event::Transaction {
                offset,
                tx_id,
                changes,
                ..
            } => {
                let rows: usize = changes.iter().map(|c| c.rows.len()).sum();
                info!(
                    "[publish] tx id={} offset={} changes={} rows={}",
                    tx_id,
                    offset,
                    changes.len(),
                    rows
                );
            }
            Event::Ddl { offset, query, .. } => {
                info!("[publish] ddl offset={} query={}", offset, query);
            }
            Event::RowChange { tx_id, .. } => {
                warn!("[publish] raw row-change event for tx {} reached the publisher", tx_id);
            }
            Event::TransactionBoundary { tx_id, kind, .. } => {
                warn!(
                    "[publish] boundary event ({kind}) for tx {tx_id} reached the publisher"
                );
            }
        }

        let payload = serde_json::to_string(event)?;
        debug!("[publish] payload={payload}");
        Ok(())
    }
}
