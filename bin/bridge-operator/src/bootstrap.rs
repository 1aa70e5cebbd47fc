//! Hooks the operator up to `bitcoind` and runs the driver.

use std::sync::Arc;

use catbridge_btcio::{BitcoinClient, LocalSigner};
use catbridge_covenants::CovenantSet;
use catbridge_exec::{
    config::Config, driver::Driver, index::InMemoryIndex, operator::BridgeOperator,
};
use tokio::sync::mpsc;
use tracing::*;

use crate::{args::Cli, constants::EVENT_QUEUE_SIZE, events, keys::resolve_operator_key};

/// Bootstraps the operator from `config`. Logging needs to be initialized at the call site.
pub(crate) async fn bootstrap(args: Cli, config: Config) -> anyhow::Result<()> {
    let keypair = resolve_operator_key(args.operator_key_path, config.secrets.operator_key)?;
    let operator_pk = keypair.x_only_public_key().0;

    let covenants = CovenantSet::derive(&operator_pk, config.network)?;
    if let Some(expected) = &config.covenants {
        covenants.check_addresses(expected)?;
    }
    let addresses = covenants.addresses();
    info!(
        bridge = %addresses.bridge,
        deposit_aggregator = %addresses.deposit_aggregator,
        withdrawal_expander = %addresses.withdrawal_expander,
        "derived covenants"
    );

    let client = Arc::new(BitcoinClient::new(
        config.bitcoind.url,
        config.bitcoind.user,
        config.bitcoind.password,
    )?);
    let signer = Arc::new(LocalSigner::new(keypair, config.network));
    let operator = BridgeOperator::new(
        client.clone(),
        client.clone(),
        signer,
        covenants,
        keypair,
        config.tx.fee_rate()?,
    );

    let mut driver = Driver::new(
        operator,
        Arc::new(InMemoryIndex::new()),
        config.deposit,
        config.withdrawal,
        config.tx.confirmations,
    );
    let txid = driver.deploy(config.tx.bridge_genesis_amount).await?;
    info!(%txid, "bridge deployed");

    let (tx, rx) = mpsc::channel(EVENT_QUEUE_SIZE);
    let watcher = tokio::spawn(events::watch_blocks(client, config.poll_interval, tx.clone()));
    if !args.no_stdin {
        tokio::spawn(async move {
            if let Err(err) = events::read_stdin(tx).await {
                error!(%err, "could not read events from stdin");
            }
        });
    } else {
        drop(tx);
    }

    let driver_task = tokio::spawn(driver.run(rx));

    watcher.await??;
    let state = driver_task.await?;
    info!(
        deposit_batches = state.deposit_batches.len(),
        withdrawal_batches = state.withdrawal_batches.len(),
        "operator stopped"
    );
    Ok(())
}
