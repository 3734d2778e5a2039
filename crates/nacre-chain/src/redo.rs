//! Ledger validation, block apply and undo.
//!
//! `redo_transaction` replays one transaction into a delta: ring members
//! resolve through the delta's read-through view, unlock windows and key
//! image conflicts are enforced, and on success the transaction's writes
//! land in the delta atomically (a nested child delta is discarded whole
//! on any failure).
//!
//! Block apply defers ring-signature verification: work items collected
//! during the replay are checked on a rayon pool after the replay
//! finishes, and the delta only reaches the persistent index when every
//! signature held.

use crate::chain::ChainState;
use crate::delta::DeltaState;
use crate::utxo::{UtxoRead, UtxoWrite};
use nacre_consensus::{BlockHeaderSummary, ConsensusError, PreparedBlock};
use nacre_currency::{hashing, Currency};
use nacre_primitives::crypto::{self, RingCheckError};
use nacre_primitives::{
    Hash, Height, KeyImage, PublicKey, Reader, Signature, Transaction, TransactionInput, Writer,
};
use rayon::prelude::*;
use tracing::{debug, info};

pub(crate) const BLOCK_GLOBAL_INDICES_PREFIX: u8 = b'b';
pub(crate) const BLOCK_GLOBAL_INDICES_SUFFIX: u8 = b'g';

/// Deferred ring-signature check for one input.
pub(crate) struct RingWorkItem {
    prefix_hash: Hash,
    key_image: KeyImage,
    output_keys: Vec<PublicKey>,
    signatures: Vec<Signature>,
}

fn ring_error(error: RingCheckError) -> ConsensusError {
    match error {
        // A ring member that no longer decodes points at damaged storage,
        // not a malicious signer; the distinction survives into the tag.
        RingCheckError::CorruptedKey => ConsensusError::InputCorruptedSignatures,
        RingCheckError::BadSignature => ConsensusError::InputInvalidSignatures,
    }
}

/// Replay `tx` into `delta`. On success the transaction's writes are
/// merged into `delta` and the global indices assigned to its outputs are
/// appended to `global_indices`. `conflict_height` reports the newest
/// referenced output (or `max_block_height` for an unresolvable index) so
/// callers can tell reorg-sensitive failures from permanent ones.
///
/// With `check_sigs`, signatures are verified inline unless `ring_work`
/// collects them for a deferred parallel pass.
#[allow(clippy::too_many_arguments)]
pub(crate) fn redo_transaction(
    currency: &Currency,
    tx: &Transaction,
    delta: &mut DeltaState<'_>,
    global_indices: &mut Vec<Vec<u32>>,
    conflict_height: &mut Height,
    check_sigs: bool,
    mut ring_work: Option<&mut Vec<RingWorkItem>>,
) -> Result<(), ConsensusError> {
    let block_height = delta.block_height();
    let unlock_timestamp = delta.unlock_timestamp();
    let prefix_hash = if check_sigs {
        hashing::get_transaction_prefix_hash(&tx.prefix)
    } else {
        Hash::ZERO
    };

    *conflict_height = 0;
    let mut my_indices = Vec::with_capacity(tx.prefix.outputs.len());
    let changes = {
        let mut tx_delta = DeltaState::new(block_height, unlock_timestamp, delta);
        for (input_index, input) in tx.prefix.inputs.iter().enumerate() {
            let key_input = match input {
                TransactionInput::Key(key_input) => key_input,
                TransactionInput::Coinbase(_) => continue,
            };
            if let Some(height) = tx_delta.read_keyimage(&key_input.key_image) {
                *conflict_height = height;
                return Err(ConsensusError::InputKeyimageAlreadySpent);
            }
            if key_input.output_indexes.is_empty() {
                // Unreachable past semantic validation.
                return Err(ConsensusError::InputUnknownType);
            }
            let absolute_indexes = match key_input.absolute_output_indexes() {
                Some(indexes) => indexes,
                None => {
                    *conflict_height = currency.max_block_height;
                    return Err(ConsensusError::InputInvalidGlobalIndex);
                }
            };
            let mut output_keys = Vec::with_capacity(absolute_indexes.len());
            for global_index in &absolute_indexes {
                let record = match tx_delta.read_amount_output(key_input.amount, *global_index) {
                    Some(record) => record,
                    None => {
                        *conflict_height = currency.max_block_height;
                        return Err(ConsensusError::InputInvalidGlobalIndex);
                    }
                };
                *conflict_height = (*conflict_height).max(record.height);
                if !currency.is_transaction_spend_time_unlocked(
                    record.unlock_time,
                    block_height,
                    unlock_timestamp,
                ) {
                    return Err(ConsensusError::InputSpendLockedOut);
                }
                output_keys.push(record.public_key);
            }
            if check_sigs {
                let signatures = tx
                    .signatures
                    .get(input_index)
                    .ok_or(ConsensusError::InputInvalidSignatures)?;
                match ring_work.as_deref_mut() {
                    Some(work) => work.push(RingWorkItem {
                        prefix_hash,
                        key_image: key_input.key_image,
                        output_keys: output_keys.clone(),
                        signatures: signatures.clone(),
                    }),
                    None => crypto::check_ring_signature(
                        &prefix_hash,
                        &key_input.key_image,
                        &output_keys,
                        signatures,
                    )
                    .map_err(ring_error)?,
                }
            }
            if key_input.output_indexes.len() == 1 {
                // A one-member ring is a transparent spend; remember it in
                // the wallet-facing hint.
                tx_delta.spend_output(key_input.amount, key_input.output_indexes[0], true);
            }
            tx_delta.store_keyimage(&key_input.key_image, block_height);
        }
        for output in &tx.prefix.outputs {
            match &output.target {
                nacre_primitives::OutputTarget::Key(key_output) => {
                    let global_index = tx_delta.push_amount_output(
                        output.amount,
                        tx.prefix.unlock_time,
                        0,
                        &key_output.key,
                    );
                    my_indices.push(global_index);
                }
            }
        }
        tx_delta.into_changes()
    };
    changes.apply(delta);
    global_indices.push(my_indices);
    Ok(())
}

/// Undo one transaction against a writable state, newest effects first.
pub(crate) fn undo_transaction(state: &mut dyn UtxoWrite, tx: &Transaction) {
    for output in tx.prefix.outputs.iter().rev() {
        match &output.target {
            nacre_primitives::OutputTarget::Key(key_output) => {
                state.pop_amount_output(output.amount, tx.prefix.unlock_time, &key_output.key);
            }
        }
    }
    for input in tx.prefix.inputs.iter().rev() {
        if let TransactionInput::Key(key_input) = input {
            state.delete_keyimage(&key_input.key_image);
            if key_input.output_indexes.len() == 1 {
                state.spend_output(key_input.amount, key_input.output_indexes[0], false);
            }
        }
    }
}

fn block_global_indices_key(block_hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(34);
    key.push(BLOCK_GLOBAL_INDICES_PREFIX);
    key.extend_from_slice(&block_hash.0);
    key.push(BLOCK_GLOBAL_INDICES_SUFFIX);
    key
}

fn serialize_global_indices(indices: &[Vec<u32>]) -> Vec<u8> {
    let mut writer = Writer::new();
    writer.write_varint(indices.len() as u64);
    for per_tx in indices {
        writer.write_varint(per_tx.len() as u64);
        for index in per_tx {
            writer.write_varint(u64::from(*index));
        }
    }
    writer.into_bytes()
}

fn deserialize_global_indices(bytes: &[u8]) -> Vec<Vec<u32>> {
    let mut reader = Reader::new(bytes);
    let outer = reader
        .read_varint()
        .expect("store integrity: malformed block index vector");
    let mut indices = Vec::with_capacity(outer as usize);
    for _ in 0..outer {
        let inner = reader
            .read_varint()
            .expect("store integrity: malformed block index vector");
        let mut per_tx = Vec::with_capacity(inner as usize);
        for _ in 0..inner {
            per_tx.push(
                reader
                    .read_varint()
                    .expect("store integrity: malformed block index vector") as u32,
            );
        }
        indices.push(per_tx);
    }
    indices
}

impl ChainState {
    /// Replay a validated block into the persistent state. Ring signatures
    /// are collected during the replay and verified on the worker pool
    /// before anything is committed.
    pub(crate) fn redo_block(
        &mut self,
        pb: &PreparedBlock,
        info: &BlockHeaderSummary,
    ) -> Result<(), ConsensusError> {
        let check_sigs = !self
            .currency()
            .is_in_sw_checkpoint_zone(info.height.wrapping_add(1));
        let mut ring_work: Vec<RingWorkItem> = Vec::new();
        let mut global_indices: Vec<Vec<u32>> =
            Vec::with_capacity(pb.block.transactions.len() + 1);
        let mut conflict_height = 0;

        let changes = {
            let currency = self.currency();
            let mut delta = DeltaState::new(info.height, info.timestamp, &*self);
            redo_transaction(
                currency,
                &pb.block.header.base_transaction,
                &mut delta,
                &mut global_indices,
                &mut conflict_height,
                false,
                None,
            )?;
            for tx in &pb.block.transactions {
                redo_transaction(
                    currency,
                    tx,
                    &mut delta,
                    &mut global_indices,
                    &mut conflict_height,
                    check_sigs,
                    Some(&mut ring_work),
                )?;
            }
            delta.into_changes()
        };

        if !ring_work.is_empty() {
            let first_failure = ring_work
                .par_iter()
                .find_map_any(|item| {
                    crypto::check_ring_signature(
                        &item.prefix_hash,
                        &item.key_image,
                        &item.output_keys,
                        &item.signatures,
                    )
                    .err()
                })
                .map(ring_error);
            if let Some(error) = first_failure {
                return Err(error);
            }
        }

        changes.apply(self);
        self.pool_mut().bump_version();
        self.store_mut()
            .put(
                &block_global_indices_key(&info.hash),
                &serialize_global_indices(&global_indices),
                true,
            )
            .expect("blockchain database write failed");
        info!(
            height = info.height,
            bid = %info.hash,
            txs = pb.block.transactions.len(),
            "redo_block"
        );
        Ok(())
    }

    /// Reverse one block's effects; the exact mirror of [`Self::redo_block`].
    pub(crate) fn undo_block(&mut self, block_hash: &Hash, block: &nacre_primitives::Block, height: Height) {
        info!(
            height,
            bid = %block_hash,
            new_tip = %block.header.header.previous_block_hash,
            "undo_block"
        );
        for tx in block.transactions.iter().rev() {
            undo_transaction(self, tx);
        }
        undo_transaction(self, &block.header.base_transaction);
        self.store_mut()
            .del(&block_global_indices_key(block_hash), true)
            .expect("blockchain database write failed");
        debug!(height, "undo complete");
    }

    /// Global output indices assigned to a committed block's transactions,
    /// coinbase first, in in-block order.
    pub fn read_block_output_global_indices(&self, block_hash: &Hash) -> Option<Vec<Vec<u32>>> {
        let value = self
            .store()
            .get(&block_global_indices_key(block_hash))
            .expect("blockchain database read failed")?;
        Some(deserialize_global_indices(&value))
    }
}
