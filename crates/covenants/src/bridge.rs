//! The Bridge covenant.
//!
//! The bridge holds every finalized deposit and commits to a 16-slot tree of batch ids plus the
//! deposit aggregator script it accepts batches from. Each spend recreates the bridge at output
//! `1`, with its state hash in slot `0` of the state output.

use bitcoin::{Network, OutPoint, ScriptBuf, Txid};
use borsh::{BorshDeserialize, BorshSerialize};
use catbridge_merkle::{
    aggregation::AggregationNode,
    batch::{BatchTree, MerkleProof},
    expansion::ExpansionNode,
};
use catbridge_primitives::{
    amount::BitcoinAmount,
    buf::Buf32,
    constants::{EMPTY_BATCH_ID, P2TR_SCRIPT_SIZE},
    hash::sha256_concat,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    covenant::{expect_script, Covenant, SpendContext},
    deposit_aggregator::AGGREGATOR_VOUT,
    errors::{CovenantError, CovenantResult},
    scripts::CovenantScript,
    tx::{state_output, CovenantTx, CovenantTxOut, Prevout},
    withdrawal_expander::WithdrawalExpander,
};

/// Tag distinguishing the bridge leaf script.
pub const BRIDGE_TAG: &[u8] = b"catbridge/bridge";

/// Output index of the bridge contract output in every bridge transaction.
pub const BRIDGE_VOUT: u32 = 1;

/// `sha256(batchesRoot ‖ depositAggregatorSPK)`.
pub fn bridge_state_hash(batches_root: &Buf32, deposit_aggregator_spk: &[u8]) -> Buf32 {
    sha256_concat(&[batches_root.as_ref(), deposit_aggregator_spk])
}

/// The id a finalized batch occupies its slot with.
///
/// Committing the txid of the aggregator root tells apart batches whose trees hash the same.
pub fn batch_id(aggregator_txid: Txid, aggregator_state_hash: &Buf32) -> Buf32 {
    let txid: Buf32 = aggregator_txid.into();
    sha256_concat(&[txid.as_ref(), aggregator_state_hash.as_ref()])
}

/// The committed state of the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeState {
    /// The batch slots.
    pub batches: BatchTree,

    /// Script of the deposit aggregator batches are accepted from.
    pub deposit_aggregator_spk: ScriptBuf,
}

impl BridgeState {
    /// The genesis state: every slot empty.
    pub fn new(deposit_aggregator_spk: ScriptBuf) -> Self {
        Self {
            batches: BatchTree::new(),
            deposit_aggregator_spk,
        }
    }

    /// Root of the batch tree.
    pub fn batches_root(&self) -> Buf32 {
        self.batches.root()
    }

    /// The state hash committed on chain.
    pub fn hash(&self) -> Buf32 {
        bridge_state_hash(&self.batches_root(), self.deposit_aggregator_spk.as_bytes())
    }

    /// A copy of this state with slot `index` set to `batch_id`.
    pub fn with_slot(&self, index: usize, batch_id: Buf32) -> CovenantResult<Self> {
        let mut next = self.clone();
        next.batches.replace(index, batch_id)?;
        Ok(next)
    }

    /// The calldata form of the bridge input being spent from `prev_tx`.
    pub fn input(&self, prev_tx: CovenantTx) -> BridgeInput {
        BridgeInput {
            prev_tx,
            batches_root: self.batches_root(),
            deposit_aggregator_spk: self.deposit_aggregator_spk.to_bytes(),
        }
    }
}

/// The bridge output being spent: its creating transaction and the state it claims to carry.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BridgeInput {
    /// The transaction that created the bridge output.
    pub prev_tx: CovenantTx,

    /// The claimed batch tree root.
    pub batches_root: Buf32,

    /// The claimed deposit aggregator script.
    pub deposit_aggregator_spk: Vec<u8>,
}

/// Methods of the bridge.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum BridgeCall {
    /// Merges a deposit aggregator root into the bridge, spent as input 1.
    FinalizeL1Deposit {
        /// The bridge input.
        bridge: BridgeInput,

        /// Proof of the empty slot the batch is inserted at.
        proof: MerkleProof,

        /// The transaction that created the aggregator root.
        aggregator_tx: CovenantTx,

        /// The aggregator root state.
        aggregator_state: AggregationNode,

        /// Fee inputs after the covenant inputs.
        fee_prevouts: Vec<Prevout>,

        /// Change output, if any.
        change: Option<CovenantTxOut>,
    },

    /// Clears a batch once L2 has credited it.
    FinalizeL2Deposit {
        /// The bridge input.
        bridge: BridgeInput,

        /// Proof of the slot holding the batch.
        proof: MerkleProof,

        /// The batch being cleared.
        batch_id: Buf32,

        /// Fee inputs after the covenant input.
        fee_prevouts: Vec<Prevout>,

        /// Change output, if any.
        change: Option<CovenantTxOut>,
    },

    /// Moves a withdrawal batch into a new withdrawal expander.
    CreateWithdrawal {
        /// The bridge input.
        bridge: BridgeInput,

        /// Root of the withdrawal expansion tree.
        expander_root: ExpansionNode,

        /// Fee inputs after the covenant input.
        fee_prevouts: Vec<Prevout>,

        /// Change output, if any.
        change: Option<CovenantTxOut>,
    },
}

/// The bridge covenant.
#[derive(Debug, Clone)]
pub struct Bridge {
    script: CovenantScript,
    withdrawal_expander_spk: ScriptBuf,
}

impl Bridge {
    /// Derives the bridge for `operator`, paying withdrawals into `expander`.
    pub fn new(
        operator: &bitcoin::secp256k1::XOnlyPublicKey,
        expander: &WithdrawalExpander,
        network: Network,
    ) -> CovenantResult<Self> {
        let withdrawal_expander_spk = expander.script_pubkey();
        let script = CovenantScript::new(
            BRIDGE_TAG,
            Some(&withdrawal_expander_spk),
            operator,
            network,
        )?;

        Ok(Self {
            script,
            withdrawal_expander_spk,
        })
    }

    /// Script of the withdrawal expander this bridge pays into.
    pub fn withdrawal_expander_spk(&self) -> &ScriptBuf {
        &self.withdrawal_expander_spk
    }

    /// Authenticates the bridge input and returns its outpoint and amount.
    fn check_bridge_input(&self, input: &BridgeInput) -> CovenantResult<(OutPoint, BitcoinAmount)> {
        if input.deposit_aggregator_spk.len() != P2TR_SCRIPT_SIZE {
            return Err(CovenantError::Validation(format!(
                "deposit aggregator script must be {P2TR_SCRIPT_SIZE} bytes"
            )));
        }

        let out = input.prev_tx.output(BRIDGE_VOUT)?;
        expect_script(&out.script, &self.script_pubkey(), "bridge input")?;

        let claimed = bridge_state_hash(&input.batches_root, &input.deposit_aggregator_spk);
        if input.prev_tx.state_hash_for(BRIDGE_VOUT)? != claimed {
            return Err(CovenantError::StateMismatch("bridge state"));
        }

        Ok((
            input.prev_tx.outpoint(BRIDGE_VOUT),
            BitcoinAmount::from_sat(out.value),
        ))
    }

    fn next_bridge_outputs(
        &self,
        input: &BridgeInput,
        new_root: &Buf32,
        amount: BitcoinAmount,
    ) -> CovenantResult<Vec<bitcoin::TxOut>> {
        let state = bridge_state_hash(new_root, &input.deposit_aggregator_spk);
        Ok(vec![state_output(&[state])?, self.contract_output(amount.to_sat())])
    }
}

impl Covenant for Bridge {
    type Call = BridgeCall;

    const NAME: &'static str = "bridge";

    fn script(&self) -> &CovenantScript {
        &self.script
    }

    fn check_call(&self, call: &Self::Call, ctx: &SpendContext<'_>) -> CovenantResult<()> {
        ctx.expect_input_index(0)?;

        match call {
            BridgeCall::FinalizeL1Deposit {
                bridge,
                proof,
                aggregator_tx,
                aggregator_state,
                fee_prevouts,
                change,
            } => {
                let (bridge_prevout, bridge_amount) = self.check_bridge_input(bridge)?;

                let agg_out = aggregator_tx.output(AGGREGATOR_VOUT)?;
                if agg_out.script != bridge.deposit_aggregator_spk {
                    return Err(CovenantError::ScriptMismatch("deposit aggregator"));
                }
                let agg_hash = aggregator_state.hash()?;
                if aggregator_tx.state_hash_for(AGGREGATOR_VOUT)? != agg_hash {
                    return Err(CovenantError::StateMismatch("deposit aggregator root"));
                }

                ctx.expect_prevouts(
                    &[bridge_prevout, aggregator_tx.outpoint(AGGREGATOR_VOUT)],
                    fee_prevouts,
                )?;

                let id = batch_id(aggregator_tx.txid(), &agg_hash);
                if id == EMPTY_BATCH_ID {
                    return Err(CovenantError::Validation("batch id is empty".to_string()));
                }
                let new_root = proof
                    .update_root(&EMPTY_BATCH_ID, &id, &bridge.batches_root)
                    .map_err(|_| CovenantError::Validation("slot is not empty".to_string()))?;

                let new_amount =
                    bridge_amount.checked_add_script(BitcoinAmount::from_sat(agg_out.value))?;

                debug!(%id, slot = proof.leaf_index(), %new_amount, "finalize L1 deposit");
                ctx.expect_outputs(
                    self.next_bridge_outputs(bridge, &new_root, new_amount)?,
                    change.as_ref(),
                )
            }

            BridgeCall::FinalizeL2Deposit {
                bridge,
                proof,
                batch_id,
                fee_prevouts,
                change,
            } => {
                let (bridge_prevout, bridge_amount) = self.check_bridge_input(bridge)?;
                ctx.expect_prevouts(&[bridge_prevout], fee_prevouts)?;

                if *batch_id == EMPTY_BATCH_ID {
                    return Err(CovenantError::Validation("batch id is empty".to_string()));
                }
                let new_root = proof
                    .update_root(batch_id, &EMPTY_BATCH_ID, &bridge.batches_root)
                    .map_err(|_| {
                        CovenantError::Validation("batch not present at slot".to_string())
                    })?;

                debug!(%batch_id, slot = proof.leaf_index(), "finalize L2 deposit");
                ctx.expect_outputs(
                    self.next_bridge_outputs(bridge, &new_root, bridge_amount)?,
                    change.as_ref(),
                )
            }

            BridgeCall::CreateWithdrawal {
                bridge,
                expander_root,
                fee_prevouts,
                change,
            } => {
                let (bridge_prevout, bridge_amount) = self.check_bridge_input(bridge)?;
                ctx.expect_prevouts(&[bridge_prevout], fee_prevouts)?;

                let sum = BitcoinAmount::from_sat(expander_root.amount()?);
                sum.encode()?;
                if sum == BitcoinAmount::ZERO {
                    return Err(CovenantError::Validation("empty withdrawal".to_string()));
                }
                let remaining = bridge_amount.checked_sub(sum).ok_or_else(|| {
                    CovenantError::Conservation(format!(
                        "withdrawing {sum} from bridge holding {bridge_amount}"
                    ))
                })?;

                let bridge_hash =
                    bridge_state_hash(&bridge.batches_root, &bridge.deposit_aggregator_spk);
                let outputs = vec![
                    state_output(&[bridge_hash, expander_root.hash()?])?,
                    self.contract_output(remaining.to_sat()),
                    crate::tx::contract_output(&self.withdrawal_expander_spk, sum.to_sat()),
                ];

                debug!(%sum, %remaining, "create withdrawal");
                ctx.expect_outputs(outputs, change.as_ref())
            }
        }
    }
}
