//! Network constants.

use nacre_primitives::{Amount, Height, Timestamp};

/// Base58 prefix tag of public addresses.
pub const PUBLIC_ADDRESS_BASE58_PREFIX: u64 = 0x2756;

/// Target seconds between blocks.
pub const DIFFICULTY_TARGET: Timestamp = 120;
/// Window of the v2 (weighted) difficulty algorithm.
pub const DIFFICULTY_WINDOW_V2: u64 = 120;
/// Blocks needed by the v2 algorithm: window plus one edge.
pub const DIFFICULTY_BLOCKS_COUNT_V2: u64 = DIFFICULTY_WINDOW_V2 + 1;
/// Reward divisor applied from block major version 4 on.
pub const REWARD_SCATTER_V2: Amount = 60;

/// Blocks in the timestamp-median window.
pub const BLOCKCHAIN_TIMESTAMP_CHECK_WINDOW: Height = 60;
/// Same, after the second hard fork.
pub const BLOCKCHAIN_TIMESTAMP_CHECK_WINDOW_V2: Height = 11;

/// How far ahead of local time a block timestamp may run.
pub const BLOCK_FUTURE_TIME_LIMIT: Timestamp = 60 * 60 * 2;
/// Same, after the second hard fork.
pub const BLOCK_FUTURE_TIME_LIMIT_V2: Timestamp = DIFFICULTY_TARGET * 3;

/// Heights at or above this value are treated as timestamps in unlock fields.
pub const MAX_BLOCK_NUMBER: Height = 500_000_000;
/// Hard cap on a serialized block.
pub const MAX_BLOCK_BLOB_SIZE: u32 = 500_000_000;
/// Hard cap on a serialized transaction.
pub const MAX_TX_SIZE: u32 = 1_000_000_000;

/// Coinbase outputs stay locked for this many blocks.
pub const MINED_MONEY_UNLOCK_WINDOW: Height = 10;
/// Blocks in the block-size median window.
pub const REWARD_BLOCKS_WINDOW: Height = 100;

/// Block-size zone with no reward penalty, by era.
pub const BLOCK_GRANTED_FULL_REWARD_ZONE: u32 = 100_000;
pub const BLOCK_GRANTED_FULL_REWARD_ZONE_V2: u32 = 20_000;
pub const BLOCK_GRANTED_FULL_REWARD_ZONE_V1: u32 = 10_000;

/// Bytes reserved in a block template for coinbase growth.
pub const COINBASE_BLOB_RESERVED_SIZE: u32 = 600;
/// Decimal places of the display unit.
pub const DISPLAY_DECIMAL_POINT: usize = 10;

/// Total emission.
pub const MONEY_SUPPLY: Amount = Amount::MAX;
/// Emission curve shift: base reward is the remaining supply >> this.
pub const EMISSION_SPEED_FACTOR: u32 = 16;

pub const MINIMUM_FEE: Amount = 1_000_000;
pub const DEFAULT_DUST_THRESHOLD: Amount = 1_000_000;

/// First retarget correction fork.
pub const HARDFORK_V1_HEIGHT: Height = 7_070;
/// Switch to the weighted difficulty algorithm.
pub const HARDFORK_V2_HEIGHT: Height = 7_080;

/// Block major version upgrade heights. A block *at* the upgrade height
/// still carries the old version.
pub const UPGRADE_HEIGHT_V2: Height = 1;
pub const UPGRADE_HEIGHT_V3: Height = 2;
pub const UPGRADE_HEIGHT_V4: Height = HARDFORK_V2_HEIGHT;

pub const fn expected_blocks_per_day(difficulty_target: Timestamp) -> Height {
    (24 * 60 * 60 / difficulty_target) as Height
}

pub const fn difficulty_window(difficulty_target: Timestamp) -> usize {
    expected_blocks_per_day(difficulty_target) as usize
}

/// Outliers trimmed from each side of the classic difficulty window.
pub const DIFFICULTY_CUT: usize = 60;
pub const DIFFICULTY_LAG: usize = 15;

pub const MAX_BLOCK_SIZE_INITIAL: u64 = 20 * 1024;
pub const MAX_BLOCK_SIZE_GROWTH_SPEED_NUMERATOR: u64 = 100 * 1024;

pub const fn max_block_size_growth_speed_denominator(difficulty_target: Timestamp) -> u64 {
    (365 * 24 * 60 * 60 / difficulty_target) as u64
}

/// Slack allowed when deciding whether an unlock moment has passed.
pub const LOCKED_TX_ALLOWED_DELTA_BLOCKS: Height = 1;

pub const fn locked_tx_allowed_delta_seconds(difficulty_target: Timestamp) -> Timestamp {
    difficulty_target * LOCKED_TX_ALLOWED_DELTA_BLOCKS as Timestamp
}

/// Seconds a transaction may sit in the pool before expiry.
pub const MEMPOOL_TX_LIVETIME: u32 = 60 * 60 * 24;

/// Hard cap on pooled transaction bytes.
pub const MAX_POOL_SIZE: usize = 2_000_000;

pub const CURRENT_TRANSACTION_VERSION: u8 = 1;

/// Hard-coded checkpoint entry.
pub struct CheckpointData {
    pub height: Height,
    pub hash: &'static str,
}

/// Trusted block hashes below which proof of work is not re-verified.
/// Genesis is handled separately; entries here are later anchor points.
pub const CHECKPOINTS: &[CheckpointData] = &[];
