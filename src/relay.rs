//! Pipeline wiring
//!
//! One decoder task and one coalescer loop, joined by a bounded queue that
//! provides backpressure. Both observe the same shutdown signal; when the
//! decoder exits it drops its sender, the queue closes, and the coalescer
//! drains whatever is still in flight before returning.

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use offset_store::{FileOffsetStore, Offset, SourceKind};

use crate::coalesce::Coalescer;
use crate::config::Config;
use crate::mysql::BinlogDecoder;
use crate::publish::Publisher;

/// Run the relay until the shutdown signal fires or the decoder stops.
pub async fn run_relay<P: Publisher>(
    config: &Config,
    publisher: P,
    shutdown: &broadcast::Sender<()>,
    start_from: Option<Offset>,
) -> Result<()> {
    let store = FileOffsetStore::new(
        config.relay.offset_path.clone(),
        SourceKind::MysqlBinlog,
    );
    let mut decoder = BinlogDecoder::new(config, Box::new(store), start_from)?;

    let (tx, rx) = mpsc::channel(config.relay.queue_capacity);
    info!(
        "starting relay: queue capacity {}, offset file {}",
        config.relay.queue_capacity,
        config.relay.offset_path.display()
    );

    let decoder_shutdown = shutdown.subscribe();
    let coalescer_shutdown = shutdown.subscribe();

    let decoder_task = tokio::spawn(async move { decoder.run(decoder_shutdown, tx).await });

    let mut coalescer = Coalescer::new(publisher, config.relay.max_transaction_changes);
    coalescer.run(coalescer_shutdown, rx).await?;

    decoder_task
        .await
        .context("decoder task terminated abnormally")??;

    info!("relay stopped");
    Ok(())
}
