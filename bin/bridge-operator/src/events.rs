//! Sources of driver events: the block watcher and L2 notifications on stdin.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use catbridge_btcio::BitcoinClient;
use catbridge_common::retry::{
    policies::ExponentialBackoff, retry_with_backoff, DEFAULT_MAX_RETRIES,
};
use catbridge_exec::state::Event;
use tokio::{
    io::{self, AsyncBufReadExt, BufReader},
    sync::mpsc,
    time,
};
use tracing::*;

/// Emits [`Event::NewBlock`] whenever the chain tip moves.
pub(crate) async fn watch_blocks(
    client: Arc<BitcoinClient>,
    poll_interval: Duration,
    events: mpsc::Sender<Event>,
) -> anyhow::Result<()> {
    let backoff = ExponentialBackoff::default();
    let mut interval = time::interval(poll_interval);
    let mut last = None;

    loop {
        interval.tick().await;
        let height = retry_with_backoff("get_block_count", DEFAULT_MAX_RETRIES, &backoff, || {
            client.get_block_count()
        })
        .await?;
        if last.is_some_and(|last| height <= last) {
            continue;
        }
        last = Some(height);

        let time = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        debug!(%height, "new block");
        if events.send(Event::NewBlock { height, time }).await.is_err() {
            info!("driver gone, block watcher exiting");
            return Ok(());
        }
    }
}

/// Forwards one JSON-encoded [`Event`] per line of stdin.
pub(crate) async fn read_stdin(events: mpsc::Sender<Event>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(&line) {
            Ok(event) => {
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!(%err, "ignoring malformed event"),
        }
    }
    info!("stdin closed");
    Ok(())
}
