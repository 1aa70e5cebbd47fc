//! A fee wallet holding a single taproot key.

use async_trait::async_trait;
use bitcoin::{
    hashes::Hash,
    key::TapTweak,
    secp256k1::{Keypair, Message, SecretKey, XOnlyPublicKey, SECP256K1},
    sighash::{Prevouts, SighashCache},
    taproot, Address, Network, TapSighashType, Transaction, Witness,
};
use tracing::*;

use crate::{
    rpc::error::{ClientError, ClientResult},
    traits::{SignRequest, Signer},
};

/// Signs key-path spends of the untweaked-key P2TR address of a local keypair.
#[derive(Debug, Clone)]
pub struct LocalSigner {
    keypair: Keypair,
    network: Network,
}

impl LocalSigner {
    pub fn new(keypair: Keypair, network: Network) -> Self {
        Self { keypair, network }
    }

    pub fn from_secret_key(secret_key: SecretKey, network: Network) -> Self {
        Self::new(Keypair::from_secret_key(SECP256K1, &secret_key), network)
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

#[async_trait]
impl Signer for LocalSigner {
    fn address(&self) -> Address {
        Address::p2tr(SECP256K1, self.public_key(), None, self.network)
    }

    fn public_key(&self) -> XOnlyPublicKey {
        self.keypair.x_only_public_key().0
    }

    async fn sign_tx(&self, request: SignRequest) -> ClientResult<Transaction> {
        let SignRequest {
            mut tx,
            prevouts,
            inputs,
        } = request;

        if prevouts.len() != tx.input.len() {
            return Err(ClientError::Signing(format!(
                "expected {} prevouts, got {}",
                tx.input.len(),
                prevouts.len()
            )));
        }

        let tweaked = self.keypair.tap_tweak(SECP256K1, None).to_inner();
        let prevouts = Prevouts::All(&prevouts);

        let mut signatures = Vec::with_capacity(inputs.len());
        let mut sighash_cache = SighashCache::new(&tx);
        for &index in &inputs {
            let sighash = sighash_cache
                .taproot_key_spend_signature_hash(index, &prevouts, TapSighashType::Default)
                .map_err(|e| ClientError::Signing(e.to_string()))?;
            let msg = Message::from_digest(sighash.to_byte_array());
            let signature = taproot::Signature {
                signature: SECP256K1.sign_schnorr(&msg, &tweaked),
                sighash_type: TapSighashType::Default,
            };
            signatures.push((index, signature));
        }

        for (index, signature) in signatures {
            tx.input[index].witness = Witness::p2tr_key_spend(&signature);
        }

        trace!(txid = %tx.compute_txid(), inputs = ?inputs, "Signed fee inputs");
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::{
        absolute::LockTime, secp256k1::rand::thread_rng, transaction::Version,
        Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Txid,
    };

    use super::*;

    fn signer() -> LocalSigner {
        LocalSigner::new(Keypair::new(SECP256K1, &mut thread_rng()), Network::Regtest)
    }

    fn spending_tx(inputs: usize) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: (0..inputs)
                .map(|vout| TxIn {
                    previous_output: OutPoint::new(Txid::all_zeros(), vout as u32),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output: vec![TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::new_op_return([0u8; 4]),
            }],
        }
    }

    #[tokio::test]
    async fn test_sign_key_spend() {
        let signer = signer();
        let fee_spk = signer.address().script_pubkey();
        let prevouts = vec![
            TxOut {
                value: Amount::from_sat(5_000),
                script_pubkey: ScriptBuf::new_op_return([1u8; 4]),
            },
            TxOut {
                value: Amount::from_sat(5_000),
                script_pubkey: fee_spk.clone(),
            },
        ];

        let tx = signer
            .sign_tx(SignRequest {
                tx: spending_tx(2),
                prevouts: prevouts.clone(),
                inputs: vec![1],
            })
            .await
            .unwrap();

        assert!(tx.input[0].witness.is_empty());
        assert_eq!(tx.input[1].witness.len(), 1);

        let output_key = XOnlyPublicKey::from_slice(&fee_spk.as_bytes()[2..34]).unwrap();
        let signature = taproot::Signature::from_slice(&tx.input[1].witness[0]).unwrap();
        let sighash = SighashCache::new(&tx)
            .taproot_key_spend_signature_hash(1, &Prevouts::All(&prevouts), TapSighashType::Default)
            .unwrap();
        let msg = Message::from_digest(sighash.to_byte_array());
        assert!(SECP256K1
            .verify_schnorr(&signature.signature, &msg, &output_key)
            .is_ok());
    }

    #[tokio::test]
    async fn test_sign_rejects_missing_prevouts() {
        let signer = signer();
        let res = signer
            .sign_tx(SignRequest {
                tx: spending_tx(2),
                prevouts: vec![],
                inputs: vec![0],
            })
            .await;
        assert!(matches!(res, Err(ClientError::Signing(_))));
    }

    #[tokio::test]
    async fn test_sign_txs_signs_each() {
        let signer = signer();
        let prevout = TxOut {
            value: Amount::from_sat(5_000),
            script_pubkey: signer.address().script_pubkey(),
        };
        let requests = (1..=3)
            .map(|n| SignRequest {
                tx: spending_tx(n),
                prevouts: vec![prevout.clone(); n],
                inputs: (0..n).collect(),
            })
            .collect();

        let signed = signer.sign_txs(requests).await.unwrap();
        assert_eq!(signed.len(), 3);
        assert!(signed
            .iter()
            .all(|tx| tx.input.iter().all(|txin| txin.witness.len() == 1)));
    }
}
