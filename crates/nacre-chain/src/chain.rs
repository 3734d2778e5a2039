//! The chain-state engine.
//!
//! `ChainState` owns the store transaction, the header chain, the
//! transaction pool and the tip. All mutating entry points run serialized
//! on the caller's single logical thread.

use crate::config::ChainConfig;
use crate::delta::DeltaState;
use crate::error::{ChainError, ChainResult};
use crate::headers::TIP_KEY;
use crate::redo::redo_transaction;
use crate::utxo::UtxoRead;
use nacre_consensus::{
    check_block_consensus, get_tx_fee, validate_semantic, BlockHeaderSummary, ConsensusError,
    PreparedBlock,
};
use nacre_currency::Currency;
use nacre_mempool::{transaction_key_images, PoolTransaction, TransactionPool};
use nacre_primitives::{
    Amount, Block, Hash, Height, RawBlock, Timestamp, Transaction, TransactionInput,
    TransactionPrefix, HEIGHT_NONE,
};
use nacre_storage::{Database, StoreTransaction};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument, warn};

/// ASCII tag of the current database layout. An unknown tag on startup is
/// a hard error; the data directory has to be resynced.
pub const DB_VERSION_CURRENT: &str = "5";
const VERSION_KEY: &[u8] = b"$version";

/// Injectable wall clock.
pub type Clock = Box<dyn Fn() -> Timestamp + Send + Sync>;

fn system_clock() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as Timestamp
}

/// Outcome of offering a block to the engine.
#[derive(Debug)]
pub enum BlockAddResult {
    /// The block extended the main chain or won a reorganization; relay it.
    Accepted(BlockHeaderSummary),
    /// Valid side-chain block, stored but not switched to.
    SideChain(BlockHeaderSummary),
    /// Header already known; nothing to do.
    AlreadyKnown(BlockHeaderSummary),
    /// Parent unknown; the block cannot be judged yet.
    Orphan,
    /// Failed ledger replay; state-dependent, a future reorg may differ.
    Rejected(ConsensusError),
    /// Violates consensus; the relaying peer deserves a ban.
    Banned(ConsensusError),
    /// Not even decodable.
    Malformed(String),
}

/// Outcome of offering a transaction to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddTransactionResult {
    /// Admitted; relay to everyone.
    BroadcastAll,
    AlreadyInPool,
    /// Loses the fee-per-byte competition against the pool.
    IncreaseFee,
    /// A key image is already spent on the main chain.
    OutputAlreadySpent { conflict_height: Height },
    /// Ledger replay failed; soft failure, a reorg can change the verdict.
    FailedToRedo {
        reason: ConsensusError,
        conflict_height: Height,
    },
    /// Structurally invalid; the relaying peer deserves a ban.
    Ban(ConsensusError),
}

/// The chain-state engine.
pub struct ChainState {
    currency: Currency,
    config: ChainConfig,
    store: StoreTransaction,
    pool: TransactionPool,
    next_gi_cache: RwLock<HashMap<Amount, u32>>,
    tip: BlockHeaderSummary,
    next_median_size: u32,
    next_median_timestamp: Timestamp,
    /// Template transactions kept around for a few blocks so a late miner
    /// submit still finds bodies already evicted from the pool.
    pub(crate) mining_transactions: HashMap<Hash, (Vec<u8>, Height)>,
    clock: Clock,
}

impl ChainState {
    /// Open (or create) the chain database under the config's data
    /// directory and bootstrap genesis into an empty one.
    pub fn open(config: ChainConfig) -> ChainResult<Self> {
        let currency = Currency::new(config.testnet);
        let database = Database::open(config.data_dir.join("blockchain"))?;
        let mut store = StoreTransaction::new(database);

        match store.get(VERSION_KEY)? {
            None => {
                store.put(VERSION_KEY, DB_VERSION_CURRENT.as_bytes(), true)?;
            }
            Some(version) if version == DB_VERSION_CURRENT.as_bytes() => {}
            Some(version) => {
                return Err(ChainError::DatabaseFormat(
                    String::from_utf8_lossy(&version).into_owned(),
                ));
            }
        }

        let mut chain = Self {
            currency,
            config,
            store,
            pool: TransactionPool::new(),
            next_gi_cache: RwLock::new(HashMap::new()),
            tip: BlockHeaderSummary::pre_genesis(),
            next_median_size: 0,
            next_median_timestamp: 0,
            mining_transactions: HashMap::new(),
            clock: Box::new(system_clock),
        };

        match chain.store.get(TIP_KEY)? {
            Some(tip_hash) => {
                let hash = Hash::from_slice(&tip_hash)
                    .expect("store integrity: malformed tip pointer");
                chain.tip = chain
                    .read_header(&hash)
                    .expect("store integrity: tip header missing");
                chain.tip_changed();
            }
            None => {
                let genesis_raw = chain.currency.genesis_block().to_raw_block();
                let added = chain.add_block(genesis_raw)?;
                assert!(
                    matches!(added, BlockAddResult::Accepted(_)),
                    "genesis block failed to add: {:?}",
                    added
                );
                chain.db_commit()?;
            }
        }

        info!(
            height = chain.tip.height,
            bid = %chain.tip.hash,
            cumulative_difficulty = chain.tip.cumulative_difficulty,
            "chain state ready"
        );
        Ok(chain)
    }

    /// Replace the wall clock, mainly for tests.
    pub fn set_clock(&mut self, clock: Clock) {
        self.clock = clock;
    }

    /// Change the pool byte budget; applies from the next admission.
    pub fn set_pool_byte_cap(&mut self, cap: usize) {
        self.config.pool_byte_cap = cap;
    }

    // --- Internal accessors shared across the impl modules ---

    pub(crate) fn store(&self) -> &StoreTransaction {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut StoreTransaction {
        &mut self.store
    }

    pub(crate) fn pool_mut(&mut self) -> &mut TransactionPool {
        &mut self.pool
    }

    pub(crate) fn next_gi_cache(&self) -> &RwLock<HashMap<Amount, u32>> {
        &self.next_gi_cache
    }

    pub(crate) fn next_median_size(&self) -> u32 {
        self.next_median_size
    }

    pub(crate) fn next_median_timestamp(&self) -> Timestamp {
        self.next_median_timestamp
    }

    pub(crate) fn clock_now(&self) -> Timestamp {
        (self.clock)()
    }

    // --- Public queries ---

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// The transaction pool, read-only.
    pub fn pool(&self) -> &TransactionPool {
        &self.pool
    }

    pub fn tip(&self) -> &BlockHeaderSummary {
        &self.tip
    }

    pub fn tip_height(&self) -> Height {
        self.tip.height
    }

    /// Shared handle on the underlying database, for observers.
    pub fn database(&self) -> Database {
        self.store.database().clone()
    }

    /// Flush the store transaction. Driven by an external timer in the
    /// node; tests call it directly.
    pub fn db_commit(&mut self) -> ChainResult<()> {
        self.store.commit()?;
        Ok(())
    }

    /// Max height among the outputs a transaction's inputs reference.
    pub fn get_largest_referenced_height(&self, prefix: &TransactionPrefix) -> Option<Height> {
        let mut largest_indices: HashMap<Amount, u32> = HashMap::new();
        for input in &prefix.inputs {
            if let TransactionInput::Key(key_input) = input {
                let absolute = key_input.absolute_output_indexes()?;
                let largest = *absolute.last()?;
                let entry = largest_indices.entry(key_input.amount).or_insert(0);
                if largest > *entry {
                    *entry = largest;
                }
            }
        }
        let mut max_height: Height = 0;
        for (amount, global_index) in largest_indices {
            let record = self.read_amount_output(amount, global_index)?;
            max_height = max_height.max(record.height);
        }
        Some(max_height)
    }

    // --- Tip bookkeeping ---

    pub(crate) fn tip_changed(&mut self) {
        let tip = self.tip.clone();
        let (size_median, timestamp_median) = self.calculate_consensus_values(&tip);
        self.next_median_size = size_median;
        self.next_median_timestamp = timestamp_median;
    }

    fn advance_tip(&mut self, info: &BlockHeaderSummary) {
        self.set_main_chain_hash(info.height, &info.hash);
        self.store
            .put(TIP_KEY, &info.hash.0, false)
            .expect("blockchain database write failed");
        self.tip = info.clone();
        self.tip_changed();
    }

    // --- Block intake ---

    /// Offer a raw block. Serialized with every other mutation; never call
    /// concurrently.
    #[instrument(skip(self, raw_block))]
    pub fn add_block(&mut self, raw_block: RawBlock) -> ChainResult<BlockAddResult> {
        let pb = match PreparedBlock::new(raw_block) {
            Ok(pb) => pb,
            Err(error) => {
                warn!(%error, "received undecodable block");
                return Ok(BlockAddResult::Malformed(error.to_string()));
            }
        };
        if let Some(known) = self.read_header(&pb.bid) {
            return Ok(BlockAddResult::AlreadyKnown(known));
        }

        let prev_hash = pb.block.header.header.previous_block_hash;
        let prev_info = if self.tip.height == HEIGHT_NONE {
            if prev_hash != Hash::ZERO {
                return Ok(BlockAddResult::Orphan);
            }
            BlockHeaderSummary::pre_genesis()
        } else {
            match self.read_header(&prev_hash) {
                Some(parent) => parent,
                None => return Ok(BlockAddResult::Orphan),
            }
        };

        let window = self.consensus_window(&prev_info);
        let now = self.clock_now();
        let info = match check_block_consensus(
            &self.currency,
            &pb,
            &prev_info,
            &window,
            now,
            self.config.check_pow,
        ) {
            Ok(info) => info,
            Err(error) => {
                warn!(bid = %pb.bid, %error, "block failed consensus");
                return Ok(BlockAddResult::Banned(error));
            }
        };

        self.store_header(&info);
        self.store_raw_block(&pb.bid, &pb.raw_block);

        if prev_info.hash == self.tip.hash {
            if let Err(error) = self.redo_block(&pb, &info) {
                warn!(bid = %pb.bid, %error, "block failed ledger replay");
                self.forget_block(&info.hash);
                return Ok(BlockAddResult::Rejected(error));
            }
            self.advance_tip(&info);
            return Ok(BlockAddResult::Accepted(info));
        }

        if info.cumulative_difficulty > self.tip.cumulative_difficulty {
            return self.reorganize_to(info);
        }
        debug!(bid = %info.hash, height = info.height, "stored side-chain block");
        Ok(BlockAddResult::SideChain(info))
    }

    /// Drop a stored header and body again, after a failed replay.
    fn forget_block(&mut self, hash: &Hash) {
        self.store
            .del(&crate::headers::header_key(hash), true)
            .expect("blockchain database write failed");
        self.store
            .del(&crate::headers::raw_block_key(hash), true)
            .expect("blockchain database write failed");
    }

    /// Undo the tip block, restoring the state to its parent. The block is
    /// forgotten entirely and may be offered again later.
    pub fn undo_tip_block(&mut self) -> ChainResult<()> {
        assert!(
            self.tip.height != HEIGHT_NONE,
            "undo_tip_block on an empty chain"
        );
        let tip_info = self.tip.clone();
        let raw = self
            .read_raw_block(&tip_info.hash)
            .expect("store integrity: tip block body missing");
        let block = Block::from_raw_block(&raw).expect("store integrity: stored block undecodable");
        self.undo_block(&tip_info.hash, &block, tip_info.height);
        self.clear_main_chain_hash(tip_info.height);
        self.forget_block(&tip_info.hash);
        if tip_info.height == 0 {
            self.store
                .del(TIP_KEY, true)
                .expect("blockchain database write failed");
            self.tip = BlockHeaderSummary::pre_genesis();
        } else {
            let parent = self
                .read_header(&tip_info.previous_block_hash)
                .expect("store integrity: parent header missing");
            self.store
                .put(TIP_KEY, &parent.hash.0, false)
                .expect("blockchain database write failed");
            self.tip = parent;
        }
        self.tip_changed();
        Ok(())
    }

    // --- Reorganization ---

    /// Switch the main chain to the branch ending at `new_tip`.
    fn reorganize_to(&mut self, new_tip: BlockHeaderSummary) -> ChainResult<BlockAddResult> {
        // Walk the branch back to the fork point on the main chain.
        let mut branch: Vec<BlockHeaderSummary> = Vec::new();
        let mut cursor = new_tip.clone();
        let fork = loop {
            if self.main_chain_hash(cursor.height) == Some(cursor.hash) {
                break cursor;
            }
            branch.push(cursor.clone());
            cursor = match self.read_header(&cursor.previous_block_hash) {
                Some(parent) => parent,
                None => return Ok(BlockAddResult::SideChain(new_tip)),
            };
        };
        for summary in &branch {
            if self.read_raw_block(&summary.hash).is_none() {
                return Ok(BlockAddResult::SideChain(new_tip));
            }
        }

        info!(
            from = %self.tip.hash,
            to = %new_tip.hash,
            fork_height = fork.height,
            undone = self.tip.height - fork.height,
            applied = branch.len(),
            "reorganizing"
        );

        // Unwind the current main chain down to the fork point.
        let mut old_chain: Vec<BlockHeaderSummary> = Vec::new();
        let mut undone_transactions: Vec<(Hash, Transaction, Vec<u8>)> = Vec::new();
        while self.tip.height != fork.height {
            let tip_info = self.tip.clone();
            let raw = self
                .read_raw_block(&tip_info.hash)
                .expect("store integrity: main-chain block body missing");
            let block = Block::from_raw_block(&raw)
                .expect("store integrity: stored block undecodable");
            self.undo_block(&tip_info.hash, &block, tip_info.height);
            self.clear_main_chain_hash(tip_info.height);
            for (i, tx) in block.transactions.iter().enumerate() {
                undone_transactions.push((
                    block.header.transaction_hashes[i],
                    tx.clone(),
                    raw.transactions[i].clone(),
                ));
            }
            old_chain.push(tip_info.clone());
            self.tip = self
                .read_header(&tip_info.previous_block_hash)
                .expect("store integrity: parent header missing");
        }

        // Replay the new branch, oldest first.
        let mut new_branch_txids: HashSet<Hash> = HashSet::new();
        let mut applied: Vec<BlockHeaderSummary> = Vec::new();
        let mut failure: Option<ConsensusError> = None;
        for summary in branch.iter().rev() {
            let raw = self
                .read_raw_block(&summary.hash)
                .expect("store integrity: branch block body missing");
            let pb = PreparedBlock::new(raw)
                .expect("store integrity: stored block undecodable");
            match self.redo_block(&pb, summary) {
                Ok(()) => {
                    new_branch_txids.extend(pb.block.header.transaction_hashes.iter().copied());
                    self.set_main_chain_hash(summary.height, &summary.hash);
                    self.tip = summary.clone();
                    applied.push(summary.clone());
                }
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }

        if let Some(error) = failure {
            warn!(%error, "reorganization failed, restoring previous chain");
            // Unwind what we applied of the losing branch.
            for summary in applied.iter().rev() {
                let raw = self.read_raw_block(&summary.hash).unwrap();
                let block = Block::from_raw_block(&raw).unwrap();
                self.undo_block(&summary.hash, &block, summary.height);
                self.clear_main_chain_hash(summary.height);
            }
            self.tip = fork;
            // Replay the original main chain; it validated before, so a
            // failure here means the store is corrupt.
            for summary in old_chain.iter().rev() {
                let raw = self
                    .read_raw_block(&summary.hash)
                    .expect("store integrity: old main block body missing");
                let pb = PreparedBlock::new(raw).expect("store integrity: block undecodable");
                self.redo_block(&pb, summary)
                    .expect("store integrity: old main chain fails to replay");
                self.set_main_chain_hash(summary.height, &summary.hash);
                self.tip = summary.clone();
            }
            self.store
                .put(TIP_KEY, &self.tip.hash.0, false)
                .expect("blockchain database write failed");
            self.tip_changed();
            return Ok(BlockAddResult::Rejected(error));
        }

        self.store
            .put(TIP_KEY, &self.tip.hash.0, false)
            .expect("blockchain database write failed");
        self.tip_changed();

        undone_transactions.retain(|(tid, _, _)| !new_branch_txids.contains(tid));
        self.on_reorganization(undone_transactions, true);
        info!(height = self.tip.height, bid = %self.tip.hash, "reorganization complete");
        Ok(BlockAddResult::Accepted(self.tip.clone()))
    }

    /// Resynchronize the pool after a chain switch: every pooled
    /// transaction plus every transaction from undone blocks is re-offered
    /// against the new chain; whatever fails is silently dropped.
    pub fn on_reorganization(
        &mut self,
        undone_transactions: Vec<(Hash, Transaction, Vec<u8>)>,
        undone_blocks: bool,
    ) {
        if undone_blocks {
            let previous_pool = self.pool.drain();
            for (tid, entry) in previous_pool {
                let _ = self.add_transaction_internal(
                    tid,
                    entry.tx,
                    entry.binary_tx,
                    entry.timestamp,
                    true,
                );
            }
        }
        for (tid, tx, binary_tx) in undone_transactions {
            let _ = self.add_transaction_internal(tid, tx, binary_tx, self.clock_now(), true);
        }
        self.pool.bump_version();
    }

    // --- Pool admission ---

    /// Offer a transaction for pool admission and relay.
    #[instrument(skip(self, tx, binary_tx), fields(tx_id = %tid))]
    pub fn add_transaction(
        &mut self,
        tid: Hash,
        tx: Transaction,
        binary_tx: Vec<u8>,
        now: Timestamp,
    ) -> AddTransactionResult {
        self.add_transaction_internal(tid, tx, binary_tx, now, true)
    }

    fn add_transaction_internal(
        &mut self,
        tid: Hash,
        tx: Transaction,
        binary_tx: Vec<u8>,
        arrival: Timestamp,
        check_sigs: bool,
    ) -> AddTransactionResult {
        if self.pool.contains(&tid) {
            return AddTransactionResult::AlreadyInPool;
        }
        let my_size = binary_tx.len();
        if my_size == 0 {
            return AddTransactionResult::Ban(ConsensusError::WrongAmount);
        }
        let my_fee = match get_tx_fee(&tx) {
            Some(fee) => fee,
            None => return AddTransactionResult::Ban(ConsensusError::WrongAmount),
        };
        let my_fee_per_byte = my_fee / my_size as u64;
        let pool_cap = self.config.pool_byte_cap;

        // Fee floor: a pool that would overflow only accepts transactions
        // beating its floor in the (fee-per-byte, id) order.
        if self.pool.total_size() + my_size > pool_cap {
            if let Some((min_fee_per_byte, min_id)) = self.pool.min_fee_per_byte() {
                if (my_fee_per_byte, tid) <= (min_fee_per_byte, min_id) {
                    return AddTransactionResult::IncreaseFee;
                }
            }
        }

        // Key-image competition against pooled transactions.
        for key_image in transaction_key_images(&tx) {
            if let Some(other_id) = self.pool.keyimage_spender(&key_image) {
                let other = self.pool.get(&other_id).expect("pool index desynchronized");
                if (my_fee_per_byte, tid) <= (other.fee_per_byte(), other_id) {
                    return AddTransactionResult::IncreaseFee;
                }
                // May displace the loser; the heavy validation below still
                // has to pass first.
                break;
            }
        }

        // Main-chain double spends are permanent rejects.
        for key_image in transaction_key_images(&tx) {
            if let Some(conflict_height) = self.read_keyimage(&key_image) {
                return AddTransactionResult::OutputAlreadySpent { conflict_height };
            }
        }

        let semantic_fee = match validate_semantic(false, &tx, check_sigs) {
            Ok(fee) => fee,
            Err(error) => {
                warn!(tx_id = %tid, %error, "transaction failed semantic validation");
                return AddTransactionResult::Ban(error);
            }
        };
        if semantic_fee != my_fee {
            warn!(tx_id = %tid, my_fee, semantic_fee, "inconsistent fee computation");
        }

        let mut conflict_height = 0;
        let redo_result = {
            let mut memory_state =
                DeltaState::new(self.tip.height + 1, self.tip.timestamp, &*self);
            let mut scratch_indices = Vec::new();
            redo_transaction(
                &self.currency,
                &tx,
                &mut memory_state,
                &mut scratch_indices,
                &mut conflict_height,
                check_sigs,
                None,
            )
        };
        if let Err(reason) = redo_result {
            debug!(tx_id = %tid, %reason, "transaction failed ledger replay");
            return AddTransactionResult::FailedToRedo {
                reason,
                conflict_height,
            };
        }

        // Displace every losing double-spender, then insert.
        for key_image in transaction_key_images(&tx) {
            if let Some(other_id) = self.pool.keyimage_spender(&key_image) {
                self.remove_from_pool(&other_id);
            }
        }
        self.pool.insert(
            tid,
            PoolTransaction::new(tx, binary_tx, my_fee, arrival),
        );
        let evicted = self.pool.evict_to_cap(pool_cap, my_size);
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted pool floor transactions");
        }

        let (min_fee_per_byte, _) = self.pool.min_fee_per_byte().unwrap_or_default();
        info!(
            tx_id = %tid,
            size = my_size,
            fee = my_fee,
            fee_per_byte = my_fee_per_byte,
            pool_size = self.pool.total_size(),
            count = self.pool.len(),
            min_fee_per_byte,
            "added transaction to pool"
        );
        AddTransactionResult::BroadcastAll
    }

    pub(crate) fn remove_from_pool(&mut self, tid: &Hash) {
        self.pool.remove(tid);
    }
}
