//! Transaction coalescing
//!
//! The coalescer is the single consumer of the decoder's event queue. It
//! buffers row changes by transaction id and emits exactly one aggregate
//! [`Event::Transaction`] per commit boundary, in statement order, which is
//! the replay-order guarantee downstream consumers depend on. Rolled-back
//! transactions are discarded. DDL events bypass the buffer entirely.
//!
//! The per-transaction buffer is bounded: a transaction exceeding
//! `max_transaction_changes` is dropped whole and its commit publishes
//! nothing. Partial aggregates are never published.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::event::{BoundaryKind, Event, Offset, RowChange, SourceKind};
use crate::publish::Publisher;

/// Buffers row changes per transaction and publishes commit aggregates.
pub struct Coalescer<P: Publisher> {
    publisher: P,
    max_transaction_changes: usize,
    buffer: HashMap<String, Vec<RowChange>>,
    overflowed: HashSet<String>,
    processed: u64,
}

impl<P: Publisher> Coalescer<P> {
    pub fn new(publisher: P, max_transaction_changes: usize) -> Self {
        Self {
            publisher,
            max_transaction_changes,
            buffer: HashMap::new(),
            overflowed: HashSet::new(),
            processed: 0,
        }
    }

    /// Drain the event queue until it closes or the shutdown signal fires.
    ///
    /// Buffered-but-uncommitted transactions are dropped on exit; replay
    /// from the last committed checkpoint recovers them after a restart.
    pub async fn run(
        &mut self,
        mut shutdown: broadcast::Receiver<()>,
        mut events: mpsc::Receiver<Event>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("coalescer received shutdown signal");
                    break;
                }
                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(event) => self.handle(event).await,
                        None => {
                            info!("event queue closed, coalescer exiting");
                            break;
                        }
                    }
                }
            }
        }

        info!(
            "coalescer stopping, dropping {} buffered transaction(s)",
            self.buffer.len()
        );
        Ok(())
    }

    async fn handle(&mut self, event: Event) {
        self.processed += 1;
        if self.processed % 1000 == 0 {
            let lag = Utc::now().signed_duration_since(event.timestamp());
            info!(
                "[metrics] processed={} lag_ms={}",
                self.processed,
                lag.num_milliseconds()
            );
        }

        match event {
            Event::RowChange { tx_id, changes, .. } => {
                self.buffer_changes(tx_id, changes);
            }
            ddl @ Event::Ddl { .. } => {
                if let Event::Ddl { offset, query, .. } = &ddl {
                    info!("[schema] ddl at {offset}: {query}");
                }
                if let Err(e) = self.publisher.publish(&ddl).await {
                    error!("publish failed for ddl event: {e:#}");
                }
            }
            Event::TransactionBoundary {
                source,
                offset,
                timestamp,
                tx_id,
                kind,
            } => match kind {
                BoundaryKind::Commit => self.commit(source, offset, timestamp, tx_id).await,
                BoundaryKind::Rollback => self.rollback(&tx_id),
            },
            Event::Transaction { tx_id, .. } => {
                warn!("unexpected transaction aggregate for {tx_id} on the queue, ignoring");
            }
        }
    }

    fn buffer_changes(&mut self, tx_id: String, changes: Vec<RowChange>) {
        if self.overflowed.contains(&tx_id) {
            debug!("dropping changes for overflowed transaction {tx_id}");
            return;
        }

        let entry = self.buffer.entry(tx_id.clone()).or_default();
        if entry.len() + changes.len() > self.max_transaction_changes {
            error!(
                "transaction {} exceeded {} buffered changes, dropping it whole",
                tx_id, self.max_transaction_changes
            );
            self.buffer.remove(&tx_id);
            self.overflowed.insert(tx_id);
            return;
        }
        entry.extend(changes);
    }

    async fn commit(
        &mut self,
        source: SourceKind,
        offset: Offset,
        timestamp: DateTime<Utc>,
        tx_id: String,
    ) {
        if self.overflowed.remove(&tx_id) {
            error!(
                "transaction {} overflowed the buffer and was skipped (boundary offset {})",
                tx_id, offset
            );
            return;
        }

        let changes = match self.buffer.remove(&tx_id) {
            Some(changes) if !changes.is_empty() => changes,
            _ => {
                debug!("commit boundary for {tx_id} with no buffered changes");
                return;
            }
        };

        let aggregate = Event::transaction(source, offset, timestamp, tx_id.clone(), changes);
        // The buffer entry stays deleted whatever the publish outcome;
        // redelivery is the replay path's job.
        if let Err(e) = self.publisher.publish(&aggregate).await {
            error!("publish failed for transaction {tx_id}: {e:#}");
        }
    }

    fn rollback(&mut self, tx_id: &str) {
        self.overflowed.remove(tx_id);
        if self.buffer.remove(tx_id).is_some() {
            debug!("discarded rolled-back transaction {tx_id}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{insert_change, RecordingPublisher};
    use offset_store::Offset;

    fn binlog_offset(pos: u32) -> Offset {
        Offset::binlog("binlog.000001", pos)
    }

    fn row_event(tx_id: &str, pos: u32, changes: Vec<RowChange>) -> Event {
        Event::row_change(
            SourceKind::MysqlBinlog,
            binlog_offset(pos),
            Utc::now(),
            tx_id,
            changes,
        )
    }

    fn commit_event(tx_id: &str, pos: u32) -> Event {
        Event::boundary(
            SourceKind::MysqlBinlog,
            binlog_offset(pos),
            Utc::now(),
            tx_id,
            BoundaryKind::Commit,
        )
    }

    fn rollback_event(tx_id: &str, pos: u32) -> Event {
        Event::boundary(
            SourceKind::MysqlBinlog,
            binlog_offset(pos),
            Utc::now(),
            tx_id,
            BoundaryKind::Rollback,
        )
    }

    async fn run_to_completion(
        publisher: RecordingPublisher,
        max_changes: usize,
        events: Vec<Event>,
    ) {
        let (tx, rx) = mpsc::channel(16);
        for event in events {
            tx.send(event).await.unwrap();
        }
        drop(tx);

        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let mut coalescer = Coalescer::new(publisher, max_changes);
        coalescer.run(shutdown_rx, rx).await.unwrap();
    }

    #[tokio::test]
    async fn commit_publishes_one_aggregate_in_order() {
        let publisher = RecordingPublisher::new();
        let first = insert_change("users", 1);
        let second = insert_change("users", 2);

        run_to_completion(
            publisher.clone(),
            10_000,
            vec![
                row_event("tx:100", 100, vec![first.clone()]),
                row_event("tx:100", 150, vec![second.clone()]),
                commit_event("tx:100", 200),
            ],
        )
        .await;

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        match &published[0] {
            Event::Transaction {
                offset,
                tx_id,
                changes,
                ..
            } => {
                assert_eq!(tx_id, "tx:100");
                assert_eq!(offset, &binlog_offset(200));
                assert_eq!(changes, &vec![first, second]);
            }
            other => panic!("expected transaction aggregate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rollback_discards_buffered_changes() {
        let publisher = RecordingPublisher::new();
        run_to_completion(
            publisher.clone(),
            10_000,
            vec![
                row_event("tx:1", 10, vec![insert_change("users", 1)]),
                rollback_event("tx:1", 20),
            ],
        )
        .await;

        assert_eq!(publisher.published_count(), 0);
        assert_eq!(publisher.attempts(), 0);
    }

    #[tokio::test]
    async fn commit_without_changes_publishes_nothing() {
        let publisher = RecordingPublisher::new();
        run_to_completion(publisher.clone(), 10_000, vec![commit_event("gtid:a:1", 30)]).await;
        assert_eq!(publisher.attempts(), 0);
    }

    #[tokio::test]
    async fn ddl_bypasses_the_transaction_buffer() {
        let publisher = RecordingPublisher::new();
        let ddl = Event::ddl(
            SourceKind::MysqlBinlog,
            binlog_offset(50),
            Utc::now(),
            "",
            "ALTER TABLE users ADD COLUMN email TEXT",
        );

        run_to_completion(
            publisher.clone(),
            10_000,
            vec![
                row_event("tx:1", 10, vec![insert_change("users", 1)]),
                ddl.clone(),
            ],
        )
        .await;

        // The DDL is published even though tx:1 never commits.
        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0], ddl);
    }

    #[tokio::test]
    async fn interleaved_transactions_coalesce_independently() {
        let publisher = RecordingPublisher::new();
        let a1 = insert_change("users", 1);
        let b1 = insert_change("orders", 2);
        let a2 = insert_change("users", 3);

        run_to_completion(
            publisher.clone(),
            10_000,
            vec![
                row_event("xid:7", 10, vec![a1.clone()]),
                row_event("xid:8", 20, vec![b1.clone()]),
                row_event("xid:7", 30, vec![a2.clone()]),
                commit_event("xid:8", 40),
                commit_event("xid:7", 50),
            ],
        )
        .await;

        let published = publisher.published();
        assert_eq!(published.len(), 2);
        match (&published[0], &published[1]) {
            (
                Event::Transaction {
                    tx_id: first_id,
                    changes: first_changes,
                    ..
                },
                Event::Transaction {
                    tx_id: second_id,
                    changes: second_changes,
                    ..
                },
            ) => {
                assert_eq!(first_id, "xid:8");
                assert_eq!(first_changes, &vec![b1]);
                assert_eq!(second_id, "xid:7");
                assert_eq!(second_changes, &vec![a1, a2]);
            }
            other => panic!("expected two transaction aggregates, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_failure_is_swallowed_and_entry_dropped() {
        let publisher = RecordingPublisher::new();
        publisher.set_failing(true);

        run_to_completion(
            publisher.clone(),
            10_000,
            vec![
                row_event("tx:1", 10, vec![insert_change("users", 1)]),
                commit_event("tx:1", 20),
                // The entry is gone despite the failure; a second commit is
                // a phantom and does not retry.
                commit_event("tx:1", 30),
            ],
        )
        .await;

        assert_eq!(publisher.attempts(), 1);
        assert_eq!(publisher.published_count(), 0);
    }

    #[tokio::test]
    async fn overflowed_transaction_is_skipped_at_commit() {
        let publisher = RecordingPublisher::new();
        run_to_completion(
            publisher.clone(),
            2,
            vec![
                row_event(
                    "tx:big",
                    10,
                    vec![
                        insert_change("users", 1),
                        insert_change("users", 2),
                        insert_change("users", 3),
                    ],
                ),
                // Later changes for an overflowed transaction are ignored.
                row_event("tx:big", 20, vec![insert_change("users", 4)]),
                commit_event("tx:big", 30),
                // An unrelated transaction is unaffected.
                row_event("tx:ok", 40, vec![insert_change("orders", 5)]),
                commit_event("tx:ok", 50),
            ],
        )
        .await;

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].tx_id(), "tx:ok");
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_loop_with_the_queue_open() {
        let publisher = RecordingPublisher::new();
        let (tx, rx) = mpsc::channel::<Event>(16);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let mut coalescer = Coalescer::new(publisher.clone(), 10_000);
        let handle = tokio::spawn(async move { coalescer.run(shutdown_rx, rx).await });

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        // Keep the sender alive until after the loop exits to prove the
        // shutdown path (not queue closure) terminated it.
        drop(tx);
        assert_eq!(publisher.published_count(), 0);
    }
}
