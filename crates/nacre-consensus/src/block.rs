//! Standalone block consensus.
//!
//! Everything about a block that can be judged without touching the UTXO
//! set: sizes, versions, timestamps, coinbase discipline, difficulty,
//! reward and proof of work. The chain-state engine supplies the windowed
//! statistics; ledger validation of the transactions happens afterwards
//! against a delta layer.

use crate::{semantic, BlockHeaderSummary, ConsensusError, PreparedBlock};
use nacre_currency::{hashing, Currency};
use nacre_primitives::{
    Amount, CumulativeDifficulty, OutputTarget, Timestamp, TransactionInput,
};
use nacre_primitives::crypto;
use tracing::warn;

/// Windowed chain statistics ending at the candidate's parent.
#[derive(Clone, Debug, Default)]
pub struct ConsensusWindow {
    /// Median block size over the reward window.
    pub size_median: u32,
    /// Median timestamp over the timestamp-check window; 0 while the chain
    /// is shorter than the window.
    pub timestamp_median: Timestamp,
    /// Timestamps of the difficulty window, oldest first.
    pub timestamps: Vec<Timestamp>,
    /// Cumulative difficulties matching `timestamps`.
    pub cumulative_difficulties: Vec<CumulativeDifficulty>,
}

/// Validate one block against consensus, producing its header summary.
///
/// `prev_info` is the parent's summary (or the pre-genesis phantom),
/// `window` the statistics of the chain segment ending at the parent,
/// `now` the injected wall clock. With `check_pow` off, proof of work is
/// skipped outside the checkpoint zone (used by tests and trusted import).
pub fn check_block_consensus(
    currency: &Currency,
    pb: &PreparedBlock,
    prev_info: &BlockHeaderSummary,
    window: &ConsensusWindow,
    now: Timestamp,
    check_pow: bool,
) -> Result<BlockHeaderSummary, ConsensusError> {
    let block = &pb.block;
    let header = &block.header.header;
    // The phantom pre-genesis parent sits at height MAX and wraps to 0.
    let height = prev_info.height.wrapping_add(1);

    let mut info = BlockHeaderSummary {
        major_version: header.major_version,
        minor_version: header.minor_version,
        previous_block_hash: header.previous_block_hash,
        timestamp: header.timestamp,
        nonce: header.nonce,
        hash: pb.bid,
        height,
        size_median: window.size_median,
        timestamp_median: window.timestamp_median,
        ..Default::default()
    };

    if block.transactions.len() != block.header.transaction_hashes.len()
        || block.transactions.len() != pb.raw_block.transactions.len()
    {
        return Err(ConsensusError::WrongTransactionsCount);
    }

    let reward_zone = currency.block_granted_full_reward_zone_by_block_version(header.major_version);
    info.effective_size_median = info.size_median.max(reward_zone);

    let mut cumulative_size: usize = 0;
    let max_tx_size = currency.max_transaction_allowed_size(info.effective_size_median) as usize;
    for (i, raw_tx) in pb.raw_block.transactions.iter().enumerate() {
        if raw_tx.len() > max_tx_size {
            return Err(ConsensusError::RawTransactionSizeTooBig);
        }
        cumulative_size += raw_tx.len();
        let tid = hashing::get_transaction_hash(&block.transactions[i]);
        if tid != block.header.transaction_hashes[i] {
            return Err(ConsensusError::TransactionAbsentInPool);
        }
    }
    info.block_size = (pb.coinbase_tx_size + cumulative_size) as u32;
    if info.block_size > currency.max_block_cumulative_size(height) {
        return Err(ConsensusError::CumulativeBlockSizeTooBig);
    }

    if header.major_version != currency.get_block_major_version_for_height(height) {
        return Err(ConsensusError::WrongVersion);
    }
    if header.major_version >= 2 {
        if header.major_version == 2 && block.header.parent_block.major_version > 1 {
            return Err(ConsensusError::ParentBlockWrongVersion);
        }
        if pb.parent_block_size > 2048 {
            return Err(ConsensusError::ParentBlockSizeTooBig);
        }
    }

    if header.timestamp > now.saturating_add(currency.get_block_future_time_limit(height)) {
        return Err(ConsensusError::TimestampTooFarInFuture);
    }
    if header.timestamp < info.timestamp_median {
        return Err(ConsensusError::TimestampTooFarInPast);
    }

    // Coinbase discipline.
    let base_tx = &block.header.base_transaction;
    if base_tx.prefix.inputs.len() != 1 {
        return Err(ConsensusError::InputWrongCount);
    }
    let base_input = match &base_tx.prefix.inputs[0] {
        TransactionInput::Coinbase(input) => input,
        TransactionInput::Key(_) => return Err(ConsensusError::InputUnexpectedType),
    };
    if base_input.block_index != height {
        return Err(ConsensusError::BaseInputWrongBlockIndex);
    }
    if base_tx.prefix.unlock_time
        != u64::from(height) + u64::from(currency.mined_money_unlock_window)
    {
        return Err(ConsensusError::WrongTransactionUnlockTime);
    }

    let check_keys = !currency.is_in_sw_checkpoint_zone(height);
    let mut miner_reward: Amount = 0;
    for output in &base_tx.prefix.outputs {
        if output.amount == 0 {
            return Err(ConsensusError::OutputZeroAmount);
        }
        match &output.target {
            OutputTarget::Key(key_output) => {
                if check_keys && !crypto::key_is_valid(&key_output.key) {
                    return Err(ConsensusError::OutputInvalidKey);
                }
            }
        }
        miner_reward = miner_reward
            .checked_add(output.amount)
            .ok_or(ConsensusError::OutputsAmountOverflow)?;
    }

    info.difficulty = currency.next_difficulty(
        height,
        &window.timestamps,
        &window.cumulative_difficulties,
    );
    info.cumulative_difficulty = prev_info.cumulative_difficulty + u128::from(info.difficulty);
    if info.difficulty == 0 {
        return Err(ConsensusError::DifficultyOverhead);
    }

    let mut cumulative_fee: Amount = 0;
    for tx in &block.transactions {
        let fee = semantic::get_tx_fee(tx).ok_or(ConsensusError::WrongAmount)?;
        cumulative_fee = cumulative_fee
            .checked_add(fee)
            .ok_or(ConsensusError::WrongAmount)?;
    }

    let already_generated_coins = prev_info.already_generated_coins;
    let (base_reward, _) = currency
        .get_block_reward(
            header.major_version,
            info.effective_size_median as usize,
            0,
            already_generated_coins,
            0,
        )
        .ok_or(ConsensusError::CumulativeBlockSizeTooBig)?;
    info.base_reward = base_reward;
    let (reward, emission_change) = currency
        .get_block_reward(
            header.major_version,
            info.effective_size_median as usize,
            info.block_size as usize,
            already_generated_coins,
            cumulative_fee,
        )
        .ok_or(ConsensusError::CumulativeBlockSizeTooBig)?;
    info.reward = reward;

    if miner_reward != info.reward {
        warn!(
            height,
            miner_reward,
            expected = info.reward,
            "coinbase pays the wrong reward"
        );
        return Err(ConsensusError::BlockRewardMismatch);
    }
    info.already_generated_coins =
        prev_info.already_generated_coins.wrapping_add(emission_change as u64);
    info.already_generated_transactions =
        prev_info.already_generated_transactions + block.transactions.len() as u64 + 1;
    info.total_fee_amount = cumulative_fee;
    info.transactions_cumulative_size = cumulative_size as u32;

    for tx in &block.transactions {
        semantic::validate_semantic(false, tx, check_keys)?;
    }

    if currency.is_in_sw_checkpoint_zone(height) {
        if currency.check_sw_checkpoint(height, &info.hash).is_err() {
            return Err(ConsensusError::CheckpointBlockHashMismatch);
        }
    } else if check_pow {
        let long_hash = pb
            .long_block_hash
            .unwrap_or_else(|| hashing::get_block_long_hash(&block.header));
        if !currency.check_proof_of_work(&long_hash, &block.header, info.difficulty) {
            return Err(ConsensusError::ProofOfWorkTooWeak);
        }
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nacre_primitives::{Block, RawBlock};

    fn testnet() -> Currency {
        Currency::new(true)
    }

    fn prepared_genesis(currency: &Currency) -> PreparedBlock {
        let raw: RawBlock = currency.genesis_block().to_raw_block();
        PreparedBlock::new(raw).unwrap()
    }

    #[test]
    fn test_genesis_passes() {
        let currency = testnet();
        let pb = prepared_genesis(&currency);
        let info = check_block_consensus(
            &currency,
            &pb,
            &BlockHeaderSummary::pre_genesis(),
            &ConsensusWindow::default(),
            1_000_000,
            true,
        )
        .unwrap();
        assert_eq!(info.height, 0);
        assert_eq!(info.difficulty, 1);
        assert_eq!(info.cumulative_difficulty, 1);
        assert_eq!(info.hash, currency.genesis_block_hash);
        assert!(info.already_generated_coins > 0);
        assert_eq!(info.already_generated_transactions, 1);
    }

    #[test]
    fn test_wrong_transactions_count() {
        let currency = testnet();
        let mut block: Block = currency.genesis_block();
        block.header.transaction_hashes.push(nacre_primitives::Hash::ZERO);
        let pb = PreparedBlock::new(block.to_raw_block()).unwrap();
        assert_eq!(
            check_block_consensus(
                &currency,
                &pb,
                &BlockHeaderSummary::pre_genesis(),
                &ConsensusWindow::default(),
                1_000_000,
                true,
            ),
            Err(ConsensusError::WrongTransactionsCount)
        );
    }

    #[test]
    fn test_wrong_version_rejected() {
        let currency = testnet();
        let mut block = currency.genesis_block();
        block.header.header.major_version = 3;
        let pb = PreparedBlock::new(block.to_raw_block()).unwrap();
        assert_eq!(
            check_block_consensus(
                &currency,
                &pb,
                &BlockHeaderSummary::pre_genesis(),
                &ConsensusWindow::default(),
                1_000_000,
                true,
            ),
            Err(ConsensusError::WrongVersion)
        );
    }

    #[test]
    fn test_timestamp_below_median_rejected() {
        let currency = testnet();
        let pb = prepared_genesis(&currency);
        let window = ConsensusWindow {
            timestamp_median: 5_000,
            ..Default::default()
        };
        assert_eq!(
            check_block_consensus(
                &currency,
                &pb,
                &BlockHeaderSummary::pre_genesis(),
                &window,
                1_000_000,
                true,
            ),
            Err(ConsensusError::TimestampTooFarInPast)
        );
    }

    #[test]
    fn test_timestamp_too_far_in_future_rejected() {
        let currency = testnet();
        let mut block = currency.genesis_block();
        block.header.header.timestamp = 1_000_000;
        let pb = PreparedBlock::new(block.to_raw_block()).unwrap();
        // now = 0, limit far below the block timestamp; genesis checkpoint
        // hash check comes later, so the timestamp fires first.
        assert_eq!(
            check_block_consensus(
                &currency,
                &pb,
                &BlockHeaderSummary::pre_genesis(),
                &ConsensusWindow::default(),
                0,
                true,
            ),
            Err(ConsensusError::TimestampTooFarInFuture)
        );
    }

    #[test]
    fn test_coinbase_wrong_unlock_time_rejected() {
        let currency = testnet();
        let mut block = currency.genesis_block();
        block.header.base_transaction.prefix.unlock_time += 1;
        let pb = PreparedBlock::new(block.to_raw_block()).unwrap();
        assert_eq!(
            check_block_consensus(
                &currency,
                &pb,
                &BlockHeaderSummary::pre_genesis(),
                &ConsensusWindow::default(),
                1_000_000,
                true,
            ),
            Err(ConsensusError::WrongTransactionUnlockTime)
        );
    }

    #[test]
    fn test_coinbase_reward_mismatch_rejected() {
        let currency = testnet();
        let mut block = currency.genesis_block();
        block.header.base_transaction.prefix.outputs[0].amount += 1;
        let pb = PreparedBlock::new(block.to_raw_block()).unwrap();
        assert_eq!(
            check_block_consensus(
                &currency,
                &pb,
                &BlockHeaderSummary::pre_genesis(),
                &ConsensusWindow::default(),
                1_000_000,
                true,
            ),
            Err(ConsensusError::BlockRewardMismatch)
        );
    }

    #[test]
    fn test_checkpoint_mismatch_rejected() {
        let currency = testnet();
        let mut block = currency.genesis_block();
        // Nonce changes the hash but nothing else; the genesis checkpoint
        // must catch it.
        block.header.header.nonce += 1;
        let pb = PreparedBlock::new(block.to_raw_block()).unwrap();
        assert_eq!(
            check_block_consensus(
                &currency,
                &pb,
                &BlockHeaderSummary::pre_genesis(),
                &ConsensusWindow::default(),
                1_000_000,
                true,
            ),
            Err(ConsensusError::CheckpointBlockHashMismatch)
        );
    }
}
