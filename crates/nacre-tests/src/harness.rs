//! Test harness: a chain instance on a temp directory with a steerable
//! clock, plus helpers for mining and state snapshots.

use nacre_chain::{BlockAddResult, ChainConfig, ChainState};
use nacre_consensus::BlockHeaderSummary;
use nacre_currency::params;
use nacre_primitives::{AccountAddress, RawBlock, Timestamp};
use nacre_primitives::crypto;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Starting wall-clock second for test chains; far enough from zero that
/// timestamp medians never go negative-looking.
pub const TEST_GENESIS_TIME: Timestamp = 1_600_000_000;

/// A chain-state instance on a temporary directory.
pub struct TestChain {
    pub chain: ChainState,
    pub clock: Arc<AtomicU32>,
    _temp_dir: TempDir,
}

impl TestChain {
    /// Testnet chain with proof of work disabled and the default pool cap.
    pub fn new() -> Self {
        Self::with_pool_cap(params::MAX_POOL_SIZE)
    }

    /// Same, but with a custom pool byte budget.
    pub fn with_pool_cap(pool_byte_cap: usize) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let config = ChainConfig {
            data_dir: temp_dir.path().to_path_buf(),
            testnet: true,
            check_pow: false,
            pool_byte_cap,
        };
        let mut chain = ChainState::open(config).expect("failed to open chain state");
        let clock = Arc::new(AtomicU32::new(TEST_GENESIS_TIME));
        let handle = Arc::clone(&clock);
        chain.set_clock(Box::new(move || handle.load(Ordering::Relaxed)));
        Self {
            chain,
            clock,
            _temp_dir: temp_dir,
        }
    }

    /// Move the wall clock forward.
    pub fn advance_clock(&self, seconds: u32) {
        self.clock.fetch_add(seconds, Ordering::Relaxed);
    }

    /// A throwaway miner address.
    pub fn miner_address(&self) -> AccountAddress {
        AccountAddress {
            spend_public_key: crypto::keypair_from_seed(b"test miner spend").public_key,
            view_public_key: crypto::keypair_from_seed(b"test miner view").public_key,
        }
    }

    /// Mine one block over the current tip, taking whatever the pool
    /// offers. Panics unless the block is accepted.
    pub fn mine_block(&mut self) -> (BlockHeaderSummary, RawBlock) {
        self.advance_clock(params::DIFFICULTY_TARGET);
        let miner = self.miner_address();
        let (template, _difficulty, _height) = self
            .chain
            .create_mining_block_template(&miner, b"test")
            .expect("template build failed");
        let (result, raw_block) = self
            .chain
            .add_mined_block(&template.to_bytes())
            .expect("add_mined_block failed");
        match result {
            BlockAddResult::Accepted(summary) => (summary, raw_block),
            other => panic!("mined block not accepted: {:?}", other),
        }
    }

    /// Mine empty blocks until the tip reaches `height`.
    pub fn mine_to_height(&mut self, height: u32) {
        while self.chain.tip_height() < height {
            self.mine_block();
        }
    }

    /// Byte image of the consensus state key families (`i`, `a`, `b`),
    /// after flushing the store transaction.
    pub fn state_image(&mut self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.chain.db_commit().expect("commit failed");
        let db = self.chain.database();
        let mut image = Vec::new();
        for prefix in [b"i".as_slice(), b"a".as_slice(), b"b".as_slice()] {
            image.extend(db.iter_prefix(prefix));
        }
        image
    }
}

impl Default for TestChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Every `(amount, gi)` bucket must be a dense prefix `[0, next_gi)`.
pub fn assert_dense_output_buckets(chain: &mut TestChain) {
    use nacre_chain::UtxoRead;
    chain.chain.db_commit().expect("commit failed");
    let db = chain.chain.database();
    let mut per_amount: std::collections::BTreeMap<u64, Vec<u64>> = Default::default();
    for (key, _) in db.iter_prefix(b"a") {
        let (amount, consumed) =
            nacre_storage::keys::read_varint_sqlite4(&key[1..]).expect("malformed key");
        let (global_index, _) =
            nacre_storage::keys::read_varint_sqlite4(&key[1 + consumed..]).expect("malformed key");
        per_amount.entry(amount).or_default().push(global_index);
    }
    for (amount, mut indices) in per_amount {
        indices.sort_unstable();
        let expected: Vec<u64> = (0..indices.len() as u64).collect();
        assert_eq!(indices, expected, "holes in bucket for amount {}", amount);
        assert_eq!(
            chain.chain.next_global_index_for_amount(amount),
            indices.len() as u32,
            "next_gi mismatch for amount {}",
            amount
        );
    }
}
