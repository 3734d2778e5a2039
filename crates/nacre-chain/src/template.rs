//! Mining block templates.
//!
//! The builder walks the pool from the best fee-per-byte down, replaying
//! each candidate into a fresh delta so the template only ever contains a
//! consistent transaction set, then iterates the coinbase to a fixed point
//! where the declared cumulative size matches the serialized bytes.

use crate::chain::{BlockAddResult, ChainState};
use crate::delta::DeltaState;
use crate::error::{ChainError, ChainResult};
use crate::redo::redo_transaction;
use nacre_consensus::ConsensusError;
use nacre_currency::{append_merge_mining_tag, MergeMiningTag};
use nacre_primitives::{
    AccountAddress, BlockTemplate, Difficulty, Hash, Height, RawBlock,
};
use tracing::{error, info, trace, warn};

/// Fixed-point attempts for the coinbase size.
const TRIES_COUNT: usize = 10;
/// Blocks for which template transactions are remembered after eviction.
const MINING_TX_RETENTION: Height = 3;

impl ChainState {
    /// Assemble a mineable block paying `miner_address`, with `extra_nonce`
    /// folded into the coinbase extra. Returns the template, the required
    /// difficulty and the template height.
    pub fn create_mining_block_template(
        &mut self,
        miner_address: &AccountAddress,
        extra_nonce: &[u8],
    ) -> ChainResult<(BlockTemplate, Difficulty, Height)> {
        self.clear_mining_transactions();
        let height = self.tip_height() + 1;
        let major_version = self.currency().get_block_major_version_for_height(height);

        let (timestamps, cumulative_difficulties) = {
            let tip = self.tip().clone();
            self.difficulty_window(&tip)
        };
        let difficulty =
            self.currency()
                .next_difficulty(height, &timestamps, &cumulative_difficulties);
        if difficulty == 0 {
            error!("difficulty overhead in create_mining_block_template");
            return Err(ChainError::Consensus(ConsensusError::DifficultyOverhead));
        }

        let mut template = BlockTemplate::default();
        template.header.major_version = major_version;
        if major_version == 1 {
            template.header.minor_version =
                if self.currency().upgrade_height_v2 == Height::MAX { 1 } else { 0 };
        } else {
            template.header.minor_version = if self.currency().upgrade_height_v3 == Height::MAX {
                u8::from(major_version == 2)
            } else {
                0
            };
            template.parent_block.major_version = 1;
            template.parent_block.minor_version = 0;
            template.parent_block.transaction_count = 1;
            append_merge_mining_tag(
                &mut template.parent_block.base_transaction.extra,
                &MergeMiningTag::default(),
            );
        }
        template.header.previous_block_hash = self.tip().hash;
        template.header.timestamp = self.clock_now().max(self.next_median_timestamp());

        let effective_size_median = self
            .next_median_size()
            .max(self.currency().block_granted_full_reward_zone_by_block_version(major_version));
        let already_generated_coins = self.tip().already_generated_coins;

        let max_total_size = ((125 * u64::from(effective_size_median)) / 100)
            .min(u64::from(self.currency().max_block_cumulative_size(height)))
            as usize
            - self.currency().miner_tx_blob_reserved_size as usize;

        // Fill from the pool, best fee-per-byte first, against a delta so
        // later candidates see what earlier ones consumed.
        let mut selected: Vec<(Hash, Vec<u8>, u64)> = Vec::new();
        let mut txs_size = 0usize;
        let mut fee: u64 = 0;
        {
            let block_timestamp = template.header.timestamp;
            let mut memory_state = DeltaState::new(height, block_timestamp, &*self);
            for tid in self.pool().ids_fee_descending() {
                let entry = match self.pool().get(&tid) {
                    Some(entry) => entry,
                    None => {
                        debug_assert!(false, "pool fee index points at a missing transaction");
                        continue;
                    }
                };
                let tx_size = entry.binary_tx.len();
                if txs_size + tx_size > max_total_size {
                    continue;
                }
                let mut scratch_indices = Vec::new();
                let mut conflict_height = 0;
                let result = redo_transaction(
                    self.currency(),
                    &entry.tx,
                    &mut memory_state,
                    &mut scratch_indices,
                    &mut conflict_height,
                    true,
                    None,
                );
                if let Err(reason) = result {
                    warn!(tx_id = %tid, %reason, "pooled transaction no longer replays, skipping");
                    continue;
                }
                txs_size += tx_size;
                fee += entry.fee;
                selected.push((tid, entry.binary_tx.clone(), entry.fee));
                trace!(tx_id = %tid, "transaction included in block template");
            }
        }
        for (tid, _, _) in &selected {
            template.transaction_hashes.push(*tid);
        }
        for (tid, binary, _) in &selected {
            self.mining_transactions
                .insert(*tid, (binary.clone(), height));
        }

        // Build the coinbase, then rebuild until its size stops moving.
        let mut rng = rand::thread_rng();
        let currency = self.currency();
        let mut base_transaction = currency
            .construct_miner_tx(
                &mut rng,
                major_version,
                height,
                effective_size_median as usize,
                already_generated_coins,
                txs_size,
                fee,
                miner_address,
                extra_nonce,
                11,
            )
            .ok_or(ChainError::Consensus(ConsensusError::BlockRewardMismatch))?;

        let mut cumulative_size = txs_size + base_transaction.binary_size();
        for try_count in 0..TRIES_COUNT {
            base_transaction = currency
                .construct_miner_tx(
                    &mut rng,
                    major_version,
                    height,
                    effective_size_median as usize,
                    already_generated_coins,
                    cumulative_size,
                    fee,
                    miner_address,
                    extra_nonce,
                    11,
                )
                .ok_or(ChainError::Consensus(ConsensusError::BlockRewardMismatch))?;

            let coinbase_size = base_transaction.binary_size();
            if coinbase_size > cumulative_size - txs_size {
                cumulative_size = txs_size + coinbase_size;
                continue;
            }
            if coinbase_size < cumulative_size - txs_size {
                let delta = cumulative_size - txs_size - coinbase_size;
                base_transaction
                    .prefix
                    .extra
                    .extend(std::iter::repeat(0u8).take(delta));
                if cumulative_size != txs_size + base_transaction.binary_size() {
                    // Padding grew the extra length varint by one byte;
                    // dropping one pad byte usually restores the balance.
                    if cumulative_size + 1 != txs_size + base_transaction.binary_size() {
                        error!(
                            cumulative_size,
                            txs_size,
                            coinbase = base_transaction.binary_size(),
                            "unexpected coinbase size during template build"
                        );
                        return Err(ChainError::Consensus(ConsensusError::CumulativeBlockSizeTooBig));
                    }
                    base_transaction.prefix.extra.pop();
                    if cumulative_size != txs_size + base_transaction.binary_size() {
                        trace!(delta, "no luck padding coinbase extra, retrying");
                        cumulative_size += delta - 1;
                        continue;
                    }
                    trace!(
                        extra = base_transaction.prefix.extra.len(),
                        try_count,
                        "coinbase extra settled"
                    );
                }
            }
            assert_eq!(
                cumulative_size,
                txs_size + base_transaction.binary_size(),
                "coinbase fixed point lost"
            );
            template.base_transaction = base_transaction;
            info!(
                height,
                difficulty,
                txs = template.transaction_hashes.len(),
                size = cumulative_size,
                "built block template"
            );
            return Ok((template, difficulty, height));
        }
        error!(tries = TRIES_COUNT, "failed to stabilize coinbase size");
        Err(ChainError::Consensus(ConsensusError::CumulativeBlockSizeTooBig))
    }

    /// A miner returns a solved template; re-join the transaction bodies
    /// from the pool (or the mining side cache) and run it through the
    /// regular block intake.
    pub fn add_mined_block(
        &mut self,
        raw_template: &[u8],
    ) -> ChainResult<(BlockAddResult, RawBlock)> {
        let template = BlockTemplate::from_bytes(raw_template)?;
        let mut transactions = Vec::with_capacity(template.transaction_hashes.len());
        for tx_hash in &template.transaction_hashes {
            let body = match self.pool().get(tx_hash) {
                Some(entry) => entry.binary_tx.clone(),
                None => match self.mining_transactions.get(tx_hash) {
                    Some((binary, _)) => binary.clone(),
                    None => {
                        warn!(
                            tx_id = %tx_hash,
                            "transaction absent from pool on mined block submit"
                        );
                        return Ok((
                            BlockAddResult::Rejected(ConsensusError::TransactionAbsentInPool),
                            RawBlock::default(),
                        ));
                    }
                },
            };
            transactions.push(body);
        }
        let raw_block = RawBlock {
            block: raw_template.to_vec(),
            transactions,
        };
        let result = self.add_block(raw_block.clone())?;
        Ok((result, raw_block))
    }

    /// Forget template transactions older than the retention window.
    pub(crate) fn clear_mining_transactions(&mut self) {
        let tip_height = self.tip_height();
        self.mining_transactions
            .retain(|_, (_, height)| tip_height <= *height + MINING_TX_RETENTION);
    }
}
