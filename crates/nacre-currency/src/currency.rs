//! The `Currency` object: every consensus rule that is a pure function of
//! its inputs, plus the deterministic genesis block.

use crate::hashing;
use crate::params;
use nacre_primitives::crypto;
use nacre_primitives::{
    AccountAddress, Amount, Block, BlockTemplate, CoinbaseInput, Hash, Height, KeyOutput, KeyPair,
    OutputTarget, SignedAmount, Timestamp, Transaction, TransactionInput, TransactionOutput,
    UnlockMoment, Writer,
};
use rand::{CryptoRng, RngCore};
use tracing::debug;

/// Transaction extra field tags.
pub const TX_EXTRA_TAG_PADDING: u8 = 0x00;
pub const TX_EXTRA_TAG_PUBKEY: u8 = 0x01;
pub const TX_EXTRA_TAG_NONCE: u8 = 0x02;
pub const TX_EXTRA_TAG_MERGE_MINING: u8 = 0x03;

/// Merge-mining commitment carried in a parent block's coinbase extra.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct MergeMiningTag {
    pub depth: u64,
    pub merkle_root: Hash,
}

/// Consensus parameters and pure rules of one network (main or test).
pub struct Currency {
    pub is_testnet: bool,
    pub max_block_height: Height,
    pub max_block_blob_size: u32,
    pub max_tx_size: u32,
    pub public_address_base58_prefix: u64,
    pub mined_money_unlock_window: Height,
    pub timestamp_check_window: Height,
    pub timestamp_check_window_v2: Height,
    pub block_future_time_limit: Timestamp,
    pub block_future_time_limit_v2: Timestamp,
    pub money_supply: Amount,
    pub emission_speed_factor: u32,
    pub reward_blocks_window: Height,
    pub block_granted_full_reward_zone: u32,
    pub miner_tx_blob_reserved_size: u32,
    pub minimum_fee: Amount,
    pub default_dust_threshold: Amount,
    pub difficulty_target: Timestamp,
    pub difficulty_window: usize,
    pub difficulty_lag: usize,
    pub difficulty_cut: usize,
    pub difficulty_window_v2: u64,
    pub difficulty_blocks_count_v2: u64,
    pub max_block_size_initial: u64,
    pub max_block_size_growth_speed_numerator: u64,
    pub max_block_size_growth_speed_denominator: u64,
    pub locked_tx_allowed_delta_seconds: Timestamp,
    pub locked_tx_allowed_delta_blocks: Height,
    pub upgrade_height_v2: Height,
    pub upgrade_height_v3: Height,
    pub upgrade_height_v4: Height,
    pub hardfork_v1_height: Height,
    pub hardfork_v2_height: Height,
    pub current_transaction_version: u8,
    pub genesis_block_template: BlockTemplate,
    pub genesis_block_hash: Hash,
}

impl Currency {
    pub fn new(is_testnet: bool) -> Self {
        let difficulty_target = if is_testnet { 1 } else { params::DIFFICULTY_TARGET };
        let mut currency = Self {
            is_testnet,
            max_block_height: params::MAX_BLOCK_NUMBER,
            max_block_blob_size: params::MAX_BLOCK_BLOB_SIZE,
            max_tx_size: params::MAX_TX_SIZE,
            public_address_base58_prefix: params::PUBLIC_ADDRESS_BASE58_PREFIX,
            mined_money_unlock_window: params::MINED_MONEY_UNLOCK_WINDOW,
            timestamp_check_window: params::BLOCKCHAIN_TIMESTAMP_CHECK_WINDOW,
            timestamp_check_window_v2: params::BLOCKCHAIN_TIMESTAMP_CHECK_WINDOW_V2,
            block_future_time_limit: params::BLOCK_FUTURE_TIME_LIMIT,
            block_future_time_limit_v2: params::BLOCK_FUTURE_TIME_LIMIT_V2,
            money_supply: params::MONEY_SUPPLY,
            emission_speed_factor: params::EMISSION_SPEED_FACTOR,
            reward_blocks_window: params::REWARD_BLOCKS_WINDOW,
            block_granted_full_reward_zone: params::BLOCK_GRANTED_FULL_REWARD_ZONE,
            miner_tx_blob_reserved_size: params::COINBASE_BLOB_RESERVED_SIZE,
            minimum_fee: params::MINIMUM_FEE,
            default_dust_threshold: params::DEFAULT_DUST_THRESHOLD,
            difficulty_target,
            difficulty_window: params::difficulty_window(difficulty_target),
            difficulty_lag: params::DIFFICULTY_LAG,
            difficulty_cut: params::DIFFICULTY_CUT,
            difficulty_window_v2: params::DIFFICULTY_WINDOW_V2,
            difficulty_blocks_count_v2: params::DIFFICULTY_BLOCKS_COUNT_V2,
            max_block_size_initial: params::MAX_BLOCK_SIZE_INITIAL,
            max_block_size_growth_speed_numerator: params::MAX_BLOCK_SIZE_GROWTH_SPEED_NUMERATOR,
            max_block_size_growth_speed_denominator: params::max_block_size_growth_speed_denominator(
                difficulty_target,
            ),
            locked_tx_allowed_delta_seconds: params::locked_tx_allowed_delta_seconds(
                difficulty_target,
            ),
            locked_tx_allowed_delta_blocks: params::LOCKED_TX_ALLOWED_DELTA_BLOCKS,
            upgrade_height_v2: if is_testnet { 0 } else { params::UPGRADE_HEIGHT_V2 },
            upgrade_height_v3: if is_testnet {
                Height::MAX
            } else {
                params::UPGRADE_HEIGHT_V3
            },
            upgrade_height_v4: params::UPGRADE_HEIGHT_V4,
            hardfork_v1_height: params::HARDFORK_V1_HEIGHT,
            hardfork_v2_height: params::HARDFORK_V2_HEIGHT,
            current_transaction_version: params::CURRENT_TRANSACTION_VERSION,
            genesis_block_template: BlockTemplate::default(),
            genesis_block_hash: Hash::ZERO,
        };

        currency.genesis_block_template = currency.build_genesis_template();
        currency.genesis_block_hash = hashing::get_block_hash(&currency.genesis_block_template);
        debug!(
            genesis = %currency.genesis_block_hash,
            testnet = is_testnet,
            "currency initialized"
        );
        currency
    }

    fn build_genesis_template(&self) -> BlockTemplate {
        let spend = crypto::keypair_from_seed(b"nacre genesis spend key");
        let view = crypto::keypair_from_seed(b"nacre genesis view key");
        let tx_key = crypto::keypair_from_seed(b"nacre genesis transaction key");
        let miner_address = AccountAddress {
            spend_public_key: spend.public_key,
            view_public_key: view.public_key,
        };
        let effective_median_size =
            self.block_granted_full_reward_zone_by_block_version(1) as usize;
        let base_transaction = self
            .construct_miner_tx_with_key(tx_key, 1, 0, effective_median_size, 0, 0, 0,
                &miner_address, &[], 11)
            .expect("genesis coinbase construction cannot fail");

        let mut template = BlockTemplate::default();
        template.header.major_version = 1;
        template.header.minor_version = 0;
        template.header.timestamp = 0;
        template.header.nonce = if self.is_testnet { 71 } else { 70 };
        template.base_transaction = base_transaction;
        template
    }

    /// Genesis as a parsed block, for bootstrapping an empty database.
    pub fn genesis_block(&self) -> Block {
        Block {
            header: self.genesis_block_template.clone(),
            transactions: Vec::new(),
        }
    }

    // --- Version schedule ---

    /// Block major version expected at `height`. The block at an upgrade
    /// height still carries the old version.
    pub fn get_block_major_version_for_height(&self, height: Height) -> u8 {
        if height <= self.upgrade_height_v2 {
            1
        } else if height <= self.upgrade_height_v3 {
            2
        } else if height <= self.upgrade_height_v4 {
            3
        } else {
            4
        }
    }

    pub fn block_granted_full_reward_zone_by_block_version(&self, major_version: u8) -> u32 {
        if major_version >= 3 {
            self.block_granted_full_reward_zone
        } else if major_version == 2 {
            params::BLOCK_GRANTED_FULL_REWARD_ZONE_V2
        } else {
            params::BLOCK_GRANTED_FULL_REWARD_ZONE_V1
        }
    }

    // --- Reward curve ---

    fn calc_base_reward(&self, major_version: u8, already_generated_coins: Amount) -> Amount {
        let mut base_reward =
            (self.money_supply - already_generated_coins) >> self.emission_speed_factor;
        if major_version >= 4 && base_reward >= params::REWARD_SCATTER_V2 {
            base_reward /= params::REWARD_SCATTER_V2;
        }
        base_reward
    }

    /// Block reward and emission delta for a block of `current_block_size`
    /// bytes against `effective_median_size`. `None` when the block is more
    /// than twice the median and earns nothing.
    pub fn get_block_reward(
        &self,
        major_version: u8,
        effective_median_size: usize,
        current_block_size: usize,
        already_generated_coins: Amount,
        fee: Amount,
    ) -> Option<(Amount, SignedAmount)> {
        assert!(already_generated_coins <= self.money_supply);
        if current_block_size > 2 * effective_median_size {
            return None;
        }
        let base_reward = self.calc_base_reward(major_version, already_generated_coins);
        let penalized_base_reward =
            get_penalized_amount(base_reward, effective_median_size, current_block_size);
        let penalized_fee = if major_version >= 2 {
            get_penalized_amount(fee, effective_median_size, current_block_size)
        } else {
            fee
        };
        let emission_change =
            penalized_base_reward as SignedAmount - (fee - penalized_fee) as SignedAmount;
        Some((penalized_base_reward + penalized_fee, emission_change))
    }

    // --- Size limits ---

    pub fn max_block_cumulative_size(&self, height: Height) -> u32 {
        let max_size = self.max_block_size_initial
            + (u64::from(height) * self.max_block_size_growth_speed_numerator)
                / self.max_block_size_growth_speed_denominator;
        max_size as u32
    }

    pub fn max_transaction_allowed_size(&self, effective_block_size_median: u32) -> u32 {
        assert!(effective_block_size_median * 2 > self.miner_tx_blob_reserved_size);
        self.max_tx_size
            .min(effective_block_size_median * 2 - self.miner_tx_blob_reserved_size)
    }

    // --- Unlock and timestamp windows ---

    /// Whether an output locked until `unlock_time` may be spent at
    /// `block_height` / `block_time`.
    pub fn is_transaction_spend_time_unlocked(
        &self,
        unlock_time: UnlockMoment,
        block_height: Height,
        block_time: Timestamp,
    ) -> bool {
        if unlock_time < u64::from(self.max_block_height) {
            u64::from(block_height) + u64::from(self.locked_tx_allowed_delta_blocks) >= unlock_time
        } else {
            u64::from(block_time) + u64::from(self.locked_tx_allowed_delta_seconds) >= unlock_time
        }
    }

    pub fn get_timestamp_check_window(&self, height: Height) -> Height {
        if height >= self.hardfork_v2_height {
            self.timestamp_check_window_v2
        } else {
            self.timestamp_check_window
        }
    }

    pub fn get_block_future_time_limit(&self, height: Height) -> Timestamp {
        if height >= self.hardfork_v2_height {
            self.block_future_time_limit_v2
        } else {
            self.block_future_time_limit
        }
    }

    pub fn get_difficulty_blocks_count(&self, height: Height) -> Height {
        if height <= self.hardfork_v2_height {
            (self.difficulty_window + self.difficulty_lag) as Height
        } else {
            self.difficulty_blocks_count_v2 as Height
        }
    }

    // --- Checkpoints ---

    fn sw_checkpoint_last_height(&self) -> Height {
        params::CHECKPOINTS.last().map(|cp| cp.height).unwrap_or(0)
    }

    pub fn is_in_sw_checkpoint_zone(&self, height: Height) -> bool {
        if self.is_testnet {
            return height == 0;
        }
        height <= self.sw_checkpoint_last_height()
    }

    /// Returns `Ok(is_checkpoint)` when `hash` is consistent with the
    /// checkpoint table at `height`, `Err(())` on a mismatch.
    pub fn check_sw_checkpoint(&self, height: Height, hash: &Hash) -> Result<bool, ()> {
        if height == 0 {
            return if *hash == self.genesis_block_hash {
                Ok(true)
            } else {
                Err(())
            };
        }
        if self.is_testnet {
            return Ok(false);
        }
        match params::CHECKPOINTS.iter().find(|cp| cp.height == height) {
            None => Ok(false),
            Some(cp) => {
                if hex::encode(hash.0) == cp.hash {
                    Ok(true)
                } else {
                    Err(())
                }
            }
        }
    }

    pub fn last_sw_checkpoint(&self) -> (Height, Hash) {
        match params::CHECKPOINTS.last() {
            None => (0, self.genesis_block_hash),
            Some(cp) => {
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(cp.hash, &mut bytes).expect("checkpoint table hash invalid");
                (cp.height, Hash(bytes))
            }
        }
    }

    // --- Coinbase construction ---

    /// Build a miner transaction paying `fee` plus the block reward for the
    /// given sizes to `miner_address`.
    #[allow(clippy::too_many_arguments)]
    pub fn construct_miner_tx<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        major_version: u8,
        height: Height,
        effective_median_size: usize,
        already_generated_coins: Amount,
        current_block_size: usize,
        fee: Amount,
        miner_address: &AccountAddress,
        extra_nonce: &[u8],
        max_outs: usize,
    ) -> Option<Transaction> {
        let tx_key = crypto::random_keypair(rng);
        self.construct_miner_tx_with_key(
            tx_key,
            major_version,
            height,
            effective_median_size,
            already_generated_coins,
            current_block_size,
            fee,
            miner_address,
            extra_nonce,
            max_outs,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn construct_miner_tx_with_key(
        &self,
        tx_key: KeyPair,
        major_version: u8,
        height: Height,
        effective_median_size: usize,
        already_generated_coins: Amount,
        current_block_size: usize,
        fee: Amount,
        miner_address: &AccountAddress,
        extra_nonce: &[u8],
        max_outs: usize,
    ) -> Option<Transaction> {
        let mut extra = Vec::new();
        extra.push(TX_EXTRA_TAG_PUBKEY);
        extra.extend_from_slice(&tx_key.public_key.0);
        if !extra_nonce.is_empty() {
            if extra_nonce.len() > 255 {
                return None;
            }
            extra.push(TX_EXTRA_TAG_NONCE);
            extra.push(extra_nonce.len() as u8);
            extra.extend_from_slice(extra_nonce);
        }

        let (block_reward, _emission_change) = self.get_block_reward(
            major_version,
            effective_median_size,
            current_block_size,
            already_generated_coins,
            fee,
        )?;

        let mut out_amounts = decompose_amount(block_reward, self.default_dust_threshold);
        let max_outs = max_outs.max(1);
        while out_amounts.len() > max_outs {
            let last = out_amounts.pop().unwrap();
            let len = out_amounts.len();
            out_amounts[len - 1] += last;
        }

        let derivation =
            crypto::generate_key_derivation(&miner_address.view_public_key, &tx_key.secret_key)?;

        let mut outputs = Vec::with_capacity(out_amounts.len());
        let mut summary_amounts: Amount = 0;
        for (index, amount) in out_amounts.iter().enumerate() {
            let out_key = crypto::derive_public_key(
                &derivation,
                index as u64,
                &miner_address.spend_public_key,
            )?;
            summary_amounts += amount;
            outputs.push(TransactionOutput {
                amount: *amount,
                target: OutputTarget::Key(KeyOutput { key: out_key }),
            });
        }
        if summary_amounts != block_reward {
            return None;
        }

        Some(Transaction {
            prefix: nacre_primitives::TransactionPrefix {
                version: self.current_transaction_version,
                unlock_time: u64::from(height) + u64::from(self.mined_money_unlock_window),
                inputs: vec![TransactionInput::Coinbase(CoinbaseInput {
                    block_index: height,
                })],
                outputs,
                extra,
            },
            signatures: Vec::new(),
        })
    }

    // --- Proof of work ---

    fn check_proof_of_work_v1(
        &self,
        long_block_hash: &Hash,
        block: &BlockTemplate,
        current_difficulty: u64,
    ) -> bool {
        if block.header.major_version != 1 {
            return false;
        }
        crypto::check_hash(long_block_hash, current_difficulty)
    }

    fn check_proof_of_work_v2(
        &self,
        long_block_hash: &Hash,
        block: &BlockTemplate,
        current_difficulty: u64,
    ) -> bool {
        if block.header.major_version < 2 {
            return false;
        }
        let mm_tag = match get_merge_mining_tag(&block.parent_block.base_transaction.extra) {
            Some(tag) => tag,
            None => return false,
        };
        if block.parent_block.blockchain_branch.len() > 256 {
            return false;
        }
        let aux_root = crypto::tree_hash_from_branch(
            &block.parent_block.blockchain_branch,
            &hashing::get_auxiliary_block_header_hash(block),
        );
        if aux_root != mm_tag.merkle_root {
            return false;
        }
        crypto::check_hash(long_block_hash, current_difficulty)
    }

    pub fn check_proof_of_work(
        &self,
        long_block_hash: &Hash,
        block: &BlockTemplate,
        current_difficulty: u64,
    ) -> bool {
        match block.header.major_version {
            1 => self.check_proof_of_work_v1(long_block_hash, block, current_difficulty),
            2..=4 => self.check_proof_of_work_v2(long_block_hash, block, current_difficulty),
            _ => false,
        }
    }
}

/// Reward after the quadratic over-median-size penalty.
fn get_penalized_amount(amount: Amount, median_size: usize, current_block_size: usize) -> Amount {
    assert!(current_block_size <= 2 * median_size);
    assert!(median_size <= u32::MAX as usize);
    assert!(current_block_size <= u32::MAX as usize);
    if amount == 0 {
        return 0;
    }
    if current_block_size <= median_size {
        return amount;
    }
    let median = median_size as u128;
    let block_size = current_block_size as u128;
    let multiplier = block_size * (2 * median - block_size);
    let penalized = (u128::from(amount) * multiplier) / median / median;
    debug_assert!(penalized < u128::from(amount));
    penalized as Amount
}

/// Split an amount into denominations of a single decimal digit each.
/// Digits below `dust_threshold` are merged into one leading dust output.
pub fn decompose_amount(amount: Amount, dust_threshold: Amount) -> Vec<Amount> {
    let mut chunks = Vec::new();
    let mut dust: Amount = 0;
    let mut order: Amount = 1;
    let mut rest = amount;
    while rest > 0 {
        let digit = rest % 10;
        rest /= 10;
        let chunk = digit * order;
        // Top digit cannot overflow: digit * order <= amount.
        order = order.saturating_mul(10);
        if chunk == 0 {
            continue;
        }
        if chunk < dust_threshold {
            dust += chunk;
        } else {
            chunks.push(chunk);
        }
    }
    let mut out = Vec::with_capacity(chunks.len() + 1);
    if dust > 0 {
        out.push(dust);
    }
    out.extend(chunks);
    out
}

/// Whether an amount is undesirable as a ring member denomination.
pub fn is_dust(amount: Amount) -> bool {
    if amount < 1_000_000 {
        return true;
    }
    let mut rest = amount;
    while rest % 10 == 0 {
        rest /= 10;
    }
    rest > 9
}

/// Render an amount with decimal point and thousands separators.
pub fn format_amount(number_of_decimal_places: usize, amount: Amount) -> String {
    let decimal: Amount = 10u64.pow(number_of_decimal_places as u32);
    let integer_part = amount / decimal;
    let fraction_part = amount % decimal;

    let mut integer_text = String::new();
    let mut rest = integer_part;
    while rest >= 1000 {
        integer_text = format!("'{:03}{}", rest % 1000, integer_text);
        rest /= 1000;
    }
    integer_text = format!("{}{}", rest, integer_text);

    if fraction_part == 0 {
        return integer_text;
    }
    let fraction_text = format!("{:0width$}", fraction_part, width = number_of_decimal_places);
    let fraction_text = fraction_text.trim_end_matches('0');
    format!("{}.{}", integer_text, fraction_text)
}

/// Parse an amount written with an optional decimal point and optional
/// thousands separators.
pub fn parse_amount(number_of_decimal_places: usize, text: &str) -> Option<Amount> {
    let cleaned: String = text.trim().chars().filter(|c| *c != '\'').collect();
    let (integer_text, fraction_text) = match cleaned.split_once('.') {
        Some((i, f)) => (i, f.trim_end_matches('0')),
        None => (cleaned.as_str(), ""),
    };
    if fraction_text.len() > number_of_decimal_places {
        return None;
    }
    if integer_text.is_empty() && fraction_text.is_empty() {
        return None;
    }
    if !integer_text.chars().all(|c| c.is_ascii_digit())
        || !fraction_text.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    let decimal: Amount = 10u64.pow(number_of_decimal_places as u32);
    let integer_part: Amount = if integer_text.is_empty() {
        0
    } else {
        integer_text.parse().ok()?
    };
    let mut fraction_part: Amount = 0;
    if !fraction_text.is_empty() {
        fraction_part = fraction_text.parse().ok()?;
        fraction_part *= 10u64.pow((number_of_decimal_places - fraction_text.len()) as u32);
    }
    integer_part
        .checked_mul(decimal)?
        .checked_add(fraction_part)
}

/// Find the transaction public key in an extra field.
pub fn get_transaction_public_key(extra: &[u8]) -> Option<nacre_primitives::PublicKey> {
    let mut pos = 0usize;
    while pos < extra.len() {
        match extra[pos] {
            TX_EXTRA_TAG_PADDING => return None,
            TX_EXTRA_TAG_PUBKEY => {
                return nacre_primitives::PublicKey::from_slice(extra.get(pos + 1..pos + 33)?);
            }
            TX_EXTRA_TAG_NONCE => {
                let len = *extra.get(pos + 1)? as usize;
                pos += 2 + len;
            }
            TX_EXTRA_TAG_MERGE_MINING => {
                // Skip the varint depth plus the 32-byte root.
                let mut skip = pos + 1;
                while *extra.get(skip)? & 0x80 != 0 {
                    skip += 1;
                }
                pos = skip + 1 + 32;
            }
            _ => return None,
        }
    }
    None
}

/// Find the merge-mining tag in a transaction extra field.
pub fn get_merge_mining_tag(extra: &[u8]) -> Option<MergeMiningTag> {
    let mut pos = 0usize;
    while pos < extra.len() {
        match extra[pos] {
            TX_EXTRA_TAG_PADDING => return None,
            TX_EXTRA_TAG_PUBKEY => pos += 1 + 32,
            TX_EXTRA_TAG_NONCE => {
                let len = *extra.get(pos + 1)? as usize;
                pos += 2 + len;
            }
            TX_EXTRA_TAG_MERGE_MINING => {
                let mut reader = nacre_primitives::Reader::new(extra.get(pos + 1..)?);
                let depth = reader.read_varint().ok()?;
                let root = Hash::from_slice(reader.read_exact(32).ok()?)?;
                return Some(MergeMiningTag {
                    depth,
                    merkle_root: root,
                });
            }
            _ => return None,
        }
    }
    None
}

/// Append a merge-mining tag to a transaction extra field.
pub fn append_merge_mining_tag(extra: &mut Vec<u8>, tag: &MergeMiningTag) {
    extra.push(TX_EXTRA_TAG_MERGE_MINING);
    let mut writer = Writer::new();
    writer.write_varint(tag.depth);
    extra.extend_from_slice(&writer.into_bytes());
    extra.extend_from_slice(&tag.merkle_root.0);
}
