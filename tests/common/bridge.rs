//! This module contains utilities for integration tests related to the bridge.

use std::sync::Arc;

use bitcoin::{Amount, FeeRate, Network, Transaction, TxOut, Txid};
use catbridge_btcio::{LocalSigner, Signer};
use catbridge_covenants::{state::Withdrawal, CovenantSet};
use catbridge_exec::{
    driver::Driver,
    index::InMemoryIndex,
    operator::BridgeOperator,
    policy::{DepositPolicy, WithdrawalPolicy},
};
use catbridge_merkle::expansion::ExpansionTree;
use catbridge_primitives::buf::Buf32;
use catbridge_test_utils::{
    bitcoin::{funding_tx, generate_keypair, random_p2tr_script},
    chain::MockChain,
};
use tracing::debug;

pub(crate) type Operator = BridgeOperator<MockChain, MockChain, LocalSigner>;

pub(crate) type TestDriver = Driver<MockChain, MockChain, LocalSigner, InMemoryIndex>;

/// An operator over an auto-mining chain, its fee wallet funded with `count` outputs of `value`.
pub(crate) fn setup(count: usize, value: u64) -> (Operator, Arc<MockChain>) {
    let operator = generate_keypair();
    let chain = Arc::new(MockChain::new(operator.x_only_public_key().0).with_auto_mine());
    let signer = Arc::new(LocalSigner::new(generate_keypair(), Network::Regtest));

    let funding = funding_tx(
        (0..count)
            .map(|_| TxOut {
                value: Amount::from_sat(value),
                script_pubkey: signer.address().script_pubkey(),
            })
            .collect(),
    );
    let txid = chain.fund(&funding);
    debug!(%txid, %count, %value, "funded fee wallet");

    let covenants = CovenantSet::derive(&operator.x_only_public_key().0, Network::Regtest)
        .expect("derive covenants");
    let operator = BridgeOperator::new(
        chain.clone(),
        chain.clone(),
        signer,
        covenants,
        operator,
        FeeRate::from_sat_per_vb_unchecked(2),
    );
    (operator, chain)
}

/// A driver over [`setup`], spending outputs with a single confirmation.
pub(crate) fn setup_driver(
    count: usize,
    value: u64,
    batch_size: usize,
) -> (TestDriver, Arc<MockChain>) {
    let (operator, chain) = setup(count, value);
    let driver = Driver::new(
        operator,
        Arc::new(InMemoryIndex::new()),
        DepositPolicy {
            batch_size,
            max_age_secs: 3_600,
        },
        WithdrawalPolicy::default(),
        1,
    );
    (driver, chain)
}

/// Publishes `tx` through `operator`.
pub(crate) async fn publish(operator: &Operator, tx: &Transaction) -> anyhow::Result<Txid> {
    Ok(operator.publish(tx).await?)
}

pub(crate) fn l2_address(seed: u8) -> Buf32 {
    Buf32([seed; 32])
}

/// Withdrawals of `amounts` to fresh addresses.
pub(crate) fn withdrawals(amounts: &[u64]) -> Vec<Withdrawal> {
    amounts
        .iter()
        .map(|amount| Withdrawal::new(&random_p2tr_script(), *amount).expect("valid withdrawal"))
        .collect()
}

pub(crate) fn withdrawal_tree(amounts: &[u64]) -> ExpansionTree {
    ExpansionTree::build(&withdrawals(amounts)).expect("build tree")
}
