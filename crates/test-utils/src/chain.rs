//! An in-memory chain that validates spends the way a node would for the bridge's scripts.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use bitcoin::{
    hashes::Hash,
    secp256k1::{Message, XOnlyPublicKey, SECP256K1},
    sighash::{Prevouts, SighashCache},
    taproot, Address, Amount, Network, OutPoint, Transaction, TxOut, Txid,
};
use catbridge_btcio::{ChainProvider, ClientError, ClientResult, UtxoProvider, UtxoQuery};
use catbridge_covenants::{covenant::verify_spend, CovenantError, CovenantSet};
use catbridge_primitives::utxo::Utxo;
use parking_lot::Mutex;
use tracing::*;

#[derive(Debug, Default)]
struct ChainState {
    height: u64,
    txs: HashMap<Txid, (Transaction, Option<u64>)>,
    utxos: BTreeMap<OutPoint, TxOut>,
    locked: HashSet<OutPoint>,
}

/// A single-node chain with a mempool and manual mining.
///
/// Key-path spends are checked against the spent output key. Any other spend must carry a
/// covenant witness whose preimage binds and whose operator signature verifies under `operator`.
/// Spends of the operator's own covenants must in addition decode to a call that is a valid
/// transition, as checked by [`CovenantSet::verify_input`].
#[derive(Debug)]
pub struct MockChain {
    operator: XOnlyPublicKey,
    covenants: Option<CovenantSet>,
    auto_mine: bool,
    state: Mutex<ChainState>,
}

impl MockChain {
    /// Creates an empty chain enforcing the covenants of `operator`.
    ///
    /// Blocks are only mined by [`Self::mine`] unless [`Self::with_auto_mine`] is set.
    pub fn new(operator: XOnlyPublicKey) -> Self {
        // Script pubkeys do not depend on the network.
        let covenants = match CovenantSet::derive(&operator, Network::Regtest) {
            Ok(set) => Some(set),
            Err(e) => {
                warn!(%e, "mock chain cannot derive covenants, only authorization is checked");
                None
            }
        };

        Self {
            operator,
            covenants,
            auto_mine: false,
            state: Mutex::new(ChainState::default()),
        }
    }

    /// Confirms every accepted transaction immediately.
    pub fn with_auto_mine(mut self) -> Self {
        self.auto_mine = true;
        self
    }

    /// Adds a confirmed transaction without validating its inputs.
    pub fn fund(&self, tx: &Transaction) -> Txid {
        let txid = tx.compute_txid();
        let mut state = self.state.lock();
        state.height += 1;
        let height = state.height;
        Self::apply(&mut state, tx, Some(height));
        txid
    }

    /// Confirms the mempool in a new block.
    pub fn mine(&self) -> u64 {
        let mut state = self.state.lock();
        state.height += 1;
        let height = state.height;
        for (_, included) in state.txs.values_mut() {
            if included.is_none() {
                *included = Some(height);
            }
        }
        height
    }

    /// Height of the last mined block.
    pub fn height(&self) -> u64 {
        self.state.lock().height
    }

    /// Whether `txid` was accepted, mined or not.
    pub fn contains(&self, txid: &Txid) -> bool {
        self.state.lock().txs.contains_key(txid)
    }

    /// Whether `outpoint` exists and is not spent by an accepted transaction.
    pub fn is_unspent(&self, outpoint: &OutPoint) -> bool {
        self.state.lock().utxos.contains_key(outpoint)
    }

    /// Unspent outputs locked by `script`, in outpoint order.
    pub fn unspent_for(&self, script: &bitcoin::Script) -> Vec<Utxo> {
        self.state
            .lock()
            .utxos
            .iter()
            .filter(|(_, txout)| txout.script_pubkey.as_script() == script)
            .map(|(outpoint, txout)| {
                Utxo::new(
                    outpoint.txid,
                    outpoint.vout,
                    txout.script_pubkey.clone(),
                    txout.value,
                )
            })
            .collect()
    }

    fn apply(state: &mut ChainState, tx: &Transaction, included: Option<u64>) {
        let txid = tx.compute_txid();
        for txin in &tx.input {
            state.utxos.remove(&txin.previous_output);
            state.locked.remove(&txin.previous_output);
        }
        for (vout, txout) in tx.output.iter().enumerate() {
            if !txout.script_pubkey.is_op_return() {
                state
                    .utxos
                    .insert(OutPoint::new(txid, vout as u32), txout.clone());
            }
        }
        state.txs.insert(txid, (tx.clone(), included));
    }

    fn validate(&self, state: &ChainState, tx: &Transaction) -> ClientResult<()> {
        let prevouts = tx
            .input
            .iter()
            .map(|txin| {
                state
                    .utxos
                    .get(&txin.previous_output)
                    .cloned()
                    .ok_or_else(|| {
                        ClientError::Rejected(format!(
                            "bad-txns-inputs-missingorspent {}",
                            txin.previous_output
                        ))
                    })
            })
            .collect::<ClientResult<Vec<_>>>()?;

        let input_value: Amount = prevouts.iter().map(|txout| txout.value).sum();
        let output_value: Amount = tx.output.iter().map(|txout| txout.value).sum();
        if output_value > input_value {
            return Err(ClientError::Rejected(format!(
                "bad-txns-in-belowout {input_value} < {output_value}"
            )));
        }

        for (index, txin) in tx.input.iter().enumerate() {
            if txin.witness.len() == 1 {
                verify_key_spend(tx, &prevouts, index)?;
                continue;
            }

            let reject = |e: CovenantError| ClientError::Rejected(format!("input {index}: {e}"));
            match &self.covenants {
                Some(covenants) => {
                    covenants
                        .verify_input(tx, &prevouts, index)
                        .map_err(reject)?;
                }
                None => {
                    verify_spend(tx, &prevouts, index, &self.operator).map_err(reject)?;
                }
            }
        }

        Ok(())
    }
}

fn verify_key_spend(tx: &Transaction, prevouts: &[TxOut], index: usize) -> ClientResult<()> {
    let reject = |what: &str| ClientError::Rejected(format!("input {index}: {what}"));

    let output_key = prevouts[index]
        .script_pubkey
        .as_bytes()
        .get(2..34)
        .and_then(|key| XOnlyPublicKey::from_slice(key).ok())
        .ok_or_else(|| reject("spent output is not P2TR"))?;
    let signature = taproot::Signature::from_slice(&tx.input[index].witness[0])
        .map_err(|_| reject("malformed signature"))?;

    let sighash = SighashCache::new(tx)
        .taproot_key_spend_signature_hash(index, &Prevouts::All(prevouts), signature.sighash_type)
        .map_err(|e| reject(&e.to_string()))?;
    let msg = Message::from_digest(sighash.to_byte_array());

    SECP256K1
        .verify_schnorr(&signature.signature, &msg, &output_key)
        .map_err(|_| reject("invalid key-path signature"))
}

#[async_trait]
impl ChainProvider for MockChain {
    async fn broadcast(&self, tx: &Transaction) -> ClientResult<Txid> {
        let txid = tx.compute_txid();
        let mut state = self.state.lock();

        if state.txs.contains_key(&txid) {
            return Ok(txid);
        }

        if let Err(e) = self.validate(&state, tx) {
            warn!(%txid, %e, "mock chain rejected transaction");
            return Err(e);
        }

        let included = if self.auto_mine {
            state.height += 1;
            Some(state.height)
        } else {
            None
        };
        Self::apply(&mut state, tx, included);
        debug!(%txid, "mock chain accepted transaction");

        Ok(txid)
    }

    async fn get_raw_transaction(&self, txid: &Txid) -> ClientResult<Transaction> {
        self.state
            .lock()
            .txs
            .get(txid)
            .map(|(tx, _)| tx.clone())
            .ok_or_else(|| ClientError::NotFound(txid.to_string()))
    }

    async fn get_confirmations(&self, txid: &Txid) -> ClientResult<u64> {
        let state = self.state.lock();
        let (_, included) = state
            .txs
            .get(txid)
            .ok_or_else(|| ClientError::NotFound(txid.to_string()))?;
        Ok(included.map_or(0, |height| state.height - height + 1))
    }
}

#[async_trait]
impl UtxoProvider for MockChain {
    async fn get_utxos(&self, address: &Address, query: UtxoQuery) -> ClientResult<Vec<Utxo>> {
        let locked = self.state.lock().locked.clone();
        let utxos = self
            .unspent_for(&address.script_pubkey())
            .into_iter()
            .filter(|utxo| !locked.contains(&utxo.outpoint()));
        Ok(query.select(utxos))
    }

    async fn mark_spent(&self, outpoint: &OutPoint, _spent_by: &Txid) -> ClientResult<()> {
        let mut state = self.state.lock();
        if state.utxos.contains_key(outpoint) {
            state.locked.insert(*outpoint);
        }
        Ok(())
    }

    async fn add_utxo(&self, utxo: Utxo) -> ClientResult<()> {
        trace!(outpoint = %utxo.outpoint(), "mock chain tracks outputs itself");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::{
        absolute::LockTime, key::TapTweak, transaction::Version, ScriptBuf, Sequence,
        TapSighashType, TxIn, Witness,
    };
    use catbridge_covenants::{preimage::SHPreimage, scripts::CovenantWitness, Covenant};

    use super::*;
    use crate::bitcoin::{funding_tx, generate_keypair, random_p2tr_script, taproot_address};

    fn sign(tx: &mut Transaction, prevouts: &[TxOut], keypair: &bitcoin::secp256k1::Keypair) {
        let tweaked = keypair.tap_tweak(SECP256K1, None).to_inner();
        let sighash = SighashCache::new(&*tx)
            .taproot_key_spend_signature_hash(0, &Prevouts::All(prevouts), TapSighashType::Default)
            .unwrap();
        let signature = taproot::Signature {
            signature: SECP256K1
                .sign_schnorr(&Message::from_digest(sighash.to_byte_array()), &tweaked),
            sighash_type: TapSighashType::Default,
        };
        tx.input[0].witness = Witness::p2tr_key_spend(&signature);
    }

    fn spend(outpoint: OutPoint, value: u64) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: random_p2tr_script(),
            }],
        }
    }

    #[tokio::test]
    async fn test_key_spend_accepted_and_confirmed() {
        let wallet = generate_keypair();
        let chain = MockChain::new(generate_keypair().x_only_public_key().0);

        let prevout = TxOut {
            value: Amount::from_sat(10_000),
            script_pubkey: taproot_address(&wallet).script_pubkey(),
        };
        let funding = funding_tx(vec![prevout.clone()]);
        chain.fund(&funding);

        let utxos = chain
            .get_utxos(&taproot_address(&wallet), UtxoQuery::default())
            .await
            .unwrap();
        assert_eq!(utxos.len(), 1);

        let mut tx = spend(OutPoint::new(funding.compute_txid(), 0), 9_000);
        sign(&mut tx, &[prevout], &wallet);

        let txid = chain.broadcast(&tx).await.unwrap();
        assert!(chain.contains(&txid));
        assert_eq!(chain.get_confirmations(&txid).await.unwrap(), 0);
        assert_eq!(chain.mine(), 2);
        assert_eq!(chain.height(), 2);
        assert_eq!(chain.get_confirmations(&txid).await.unwrap(), 1);
        assert!(!chain.is_unspent(&OutPoint::new(funding.compute_txid(), 0)));

        // Rebroadcast is accepted.
        assert_eq!(chain.broadcast(&tx).await.unwrap(), txid);
    }

    #[tokio::test]
    async fn test_rejects_bad_spends() {
        let wallet = generate_keypair();
        let chain = MockChain::new(generate_keypair().x_only_public_key().0).with_auto_mine();

        let prevout = TxOut {
            value: Amount::from_sat(10_000),
            script_pubkey: taproot_address(&wallet).script_pubkey(),
        };
        let funding = funding_tx(vec![prevout.clone()]);
        chain.fund(&funding);
        let outpoint = OutPoint::new(funding.compute_txid(), 0);

        // Wrong key.
        let mut tx = spend(outpoint, 9_000);
        sign(&mut tx, &[prevout.clone()], &generate_keypair());
        assert!(matches!(chain.broadcast(&tx).await, Err(ClientError::Rejected(_))));

        // Creates value.
        let mut tx = spend(outpoint, 11_000);
        sign(&mut tx, &[prevout.clone()], &wallet);
        assert!(matches!(chain.broadcast(&tx).await, Err(ClientError::Rejected(_))));

        // Not a covenant witness.
        let tx = spend(outpoint, 9_000);
        assert!(matches!(chain.broadcast(&tx).await, Err(ClientError::Rejected(_))));

        // Missing input.
        let mut tx = spend(OutPoint::new(Txid::all_zeros(), 0), 1);
        sign(&mut tx, &[prevout], &wallet);
        assert!(matches!(chain.broadcast(&tx).await, Err(ClientError::Rejected(_))));

        let missing = Txid::all_zeros();
        assert!(matches!(
            chain.get_raw_transaction(&missing).await,
            Err(ClientError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_signed_covenant_spend_without_valid_call() {
        let operator = generate_keypair();
        let xonly = operator.x_only_public_key().0;
        let chain = MockChain::new(xonly).with_auto_mine();
        let covenants = CovenantSet::derive(&xonly, Network::Regtest).unwrap();
        let script = covenants.bridge.script();

        let bridge = covenants.bridge.contract_output(50_000);
        let funding = funding_tx(vec![bridge.clone()]);
        chain.fund(&funding);
        let outpoint = OutPoint::new(funding.compute_txid(), 0);

        let prevouts = vec![bridge];
        let mut tx = spend(outpoint, 49_000);
        let preimage = loop {
            let preimage = SHPreimage::from_tx(&tx, &prevouts, 0, script.leaf_hash()).unwrap();
            if preimage.is_bindable() {
                break preimage;
            }
            tx.input[0].sequence = Sequence(tx.input[0].sequence.0 - 1);
        };

        let msg = Message::from_digest(preimage.sighash().0);
        tx.input[0].witness = CovenantWitness {
            calldata: vec![0xde, 0xad],
            operator_sig: SECP256K1.sign_schnorr(&msg, &operator),
            preimage,
            leaf_script: script.leaf_script().clone(),
            control_block: script.control_block().unwrap(),
        }
        .to_witness()
        .unwrap();

        verify_spend(&tx, &prevouts, 0, &xonly).unwrap();
        let Err(ClientError::Rejected(reason)) = chain.broadcast(&tx).await else {
            panic!("bridge drained");
        };
        assert!(reason.contains("calldata"), "{reason}");
        assert!(chain.is_unspent(&outpoint));
    }

    #[tokio::test]
    async fn test_marked_outputs_are_not_selected() {
        let wallet = generate_keypair();
        let address = taproot_address(&wallet);
        let chain = MockChain::new(generate_keypair().x_only_public_key().0);

        let funding = funding_tx(vec![
            TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: address.script_pubkey(),
            },
            TxOut {
                value: Amount::from_sat(2_000),
                script_pubkey: address.script_pubkey(),
            },
        ]);
        chain.fund(&funding);

        chain
            .mark_spent(&OutPoint::new(funding.compute_txid(), 0), &Txid::all_zeros())
            .await
            .unwrap();
        let utxos = chain
            .get_utxos(&address, UtxoQuery::default())
            .await
            .unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].value, Amount::from_sat(2_000));
    }
}
