//! Pipeline tests wiring a synthetic producer to the coalescer through the
//! same bounded queue the decoder uses. No MySQL server involved.

use std::time::Duration;

use binlog_relay::testing::{insert_change, RecordingPublisher};
use binlog_relay::{BoundaryKind, Coalescer, Event, Offset, SourceKind};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};

fn offset(pos: u32) -> Offset {
    Offset::binlog("binlog.000007", pos)
}

fn row(tx_id: &str, pos: u32, table: &str, marker: i64) -> Event {
    Event::row_change(
        SourceKind::MysqlBinlog,
        offset(pos),
        Utc::now(),
        tx_id,
        vec![insert_change(table, marker)],
    )
}

fn commit(tx_id: &str, pos: u32) -> Event {
    Event::boundary(
        SourceKind::MysqlBinlog,
        offset(pos),
        Utc::now(),
        tx_id,
        BoundaryKind::Commit,
    )
}

#[tokio::test]
async fn interleaved_transactions_arrive_as_one_aggregate_each() {
    let publisher = RecordingPublisher::new();
    // Capacity below the event count so the producer blocks on the queue
    // while the coalescer drains it concurrently.
    let (tx, rx) = mpsc::channel(2);
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let producer = tokio::spawn(async move {
        let script = vec![
            row("xid:41", 100, "users", 1),
            row("xid:42", 120, "orders", 2),
            row("xid:41", 140, "users", 3),
            commit("xid:42", 160),
            commit("xid:41", 180),
        ];
        for event in script {
            tx.send(event).await.unwrap();
        }
    });

    let mut coalescer = Coalescer::new(publisher.clone(), 10_000);
    coalescer.run(shutdown_rx, rx).await.unwrap();
    producer.await.unwrap();

    let published = publisher.published();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].tx_id(), "xid:42");
    assert_eq!(published[1].tx_id(), "xid:41");

    // Statement order within the aggregate, boundary offset on the envelope.
    match &published[1] {
        Event::Transaction {
            offset: agg_offset,
            changes,
            ..
        } => {
            assert_eq!(agg_offset, &offset(180));
            assert_eq!(
                changes,
                &vec![insert_change("users", 1), insert_change("users", 3)]
            );
        }
        other => panic!("expected a transaction aggregate, got {other:?}"),
    }
}

#[tokio::test]
async fn closing_the_queue_drains_pending_commits_before_exit() {
    let publisher = RecordingPublisher::new();
    let (tx, rx) = mpsc::channel(8);
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

    tx.send(row("xid:9", 10, "users", 1)).await.unwrap();
    tx.send(commit("xid:9", 20)).await.unwrap();
    // xid:10 never commits before the producer goes away.
    tx.send(row("xid:10", 30, "users", 2)).await.unwrap();
    drop(tx);

    let mut coalescer = Coalescer::new(publisher.clone(), 10_000);
    coalescer.run(shutdown_rx, rx).await.unwrap();

    let published = publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].tx_id(), "xid:9");
}

#[tokio::test]
async fn shutdown_releases_a_producer_stalled_on_a_full_queue() {
    let publisher = RecordingPublisher::new();
    let (tx, rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    tx.send(row("tx:0", 10, "users", 0)).await.unwrap();
    let producer = tokio::spawn(async move {
        // Stalled on the full queue; must not hang once the coalescer exits
        // and the receiver is dropped.
        let _ = tx.send(row("tx:0", 20, "users", 1)).await;
    });

    shutdown_tx.send(()).unwrap();
    let mut coalescer = Coalescer::new(publisher.clone(), 10_000);
    coalescer.run(shutdown_rx, rx).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), producer)
        .await
        .expect("producer stayed blocked after shutdown")
        .unwrap();
    assert_eq!(publisher.published_count(), 0);
}
