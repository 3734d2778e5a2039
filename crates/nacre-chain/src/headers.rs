//! Header-summary chain and windowed statistics.
//!
//! Key families:
//!
//! | prefix | suffix          | value                      |
//! |--------|-----------------|----------------------------|
//! | `h`    | block hash (32) | header summary             |
//! | `c`    | varint(height)  | main-chain block hash      |
//! | `t`    | —               | tip block hash             |
//! | `B`    | block hash (32) | raw block bytes            |
//!
//! Summaries and bodies are kept for side-chain blocks too; only the `c`
//! index and the tip pointer say which branch is authoritative.

use crate::chain::ChainState;
use nacre_consensus::{BlockHeaderSummary, ConsensusWindow};
use nacre_primitives::{Hash, Height, RawBlock, Timestamp, HEIGHT_NONE};
use nacre_storage::keys::write_varint_sqlite4;

pub(crate) const HEADER_PREFIX: u8 = b'h';
pub(crate) const MAIN_CHAIN_PREFIX: u8 = b'c';
pub(crate) const RAW_BLOCK_PREFIX: u8 = b'B';
pub(crate) const TIP_KEY: &[u8] = b"t";

pub(crate) fn header_key(hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(HEADER_PREFIX);
    key.extend_from_slice(&hash.0);
    key
}

pub(crate) fn main_chain_key(height: Height) -> Vec<u8> {
    let mut key = Vec::with_capacity(6);
    key.push(MAIN_CHAIN_PREFIX);
    write_varint_sqlite4(u64::from(height), &mut key);
    key
}

pub(crate) fn raw_block_key(hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(RAW_BLOCK_PREFIX);
    key.extend_from_slice(&hash.0);
    key
}

impl ChainState {
    /// Summary of any known block, main chain or side chain.
    pub fn read_header(&self, hash: &Hash) -> Option<BlockHeaderSummary> {
        let value = self
            .store()
            .get(&header_key(hash))
            .expect("blockchain database read failed")?;
        Some(
            BlockHeaderSummary::from_bytes(&value)
                .expect("store integrity: malformed header summary"),
        )
    }

    pub(crate) fn store_header(&mut self, summary: &BlockHeaderSummary) {
        self.store_mut()
            .put(&header_key(&summary.hash), &summary.to_bytes(), false)
            .expect("blockchain database write failed");
    }

    /// Main-chain block hash at `height`.
    pub fn main_chain_hash(&self, height: Height) -> Option<Hash> {
        let value = self
            .store()
            .get(&main_chain_key(height))
            .expect("blockchain database read failed")?;
        Hash::from_slice(&value)
    }

    pub(crate) fn set_main_chain_hash(&mut self, height: Height, hash: &Hash) {
        self.store_mut()
            .put(&main_chain_key(height), &hash.0, false)
            .expect("blockchain database write failed");
    }

    pub(crate) fn clear_main_chain_hash(&mut self, height: Height) {
        self.store_mut()
            .del(&main_chain_key(height), true)
            .expect("blockchain database write failed");
    }

    pub(crate) fn store_raw_block(&mut self, hash: &Hash, raw: &RawBlock) {
        let mut writer = nacre_primitives::Writer::new();
        writer.write_blob(&raw.block);
        writer.write_varint(raw.transactions.len() as u64);
        for tx in &raw.transactions {
            writer.write_blob(tx);
        }
        self.store_mut()
            .put(&raw_block_key(hash), &writer.into_bytes(), false)
            .expect("blockchain database write failed");
    }

    /// Stored body of any known block.
    pub fn read_raw_block(&self, hash: &Hash) -> Option<RawBlock> {
        let value = self
            .store()
            .get(&raw_block_key(hash))
            .expect("blockchain database read failed")?;
        let mut reader = nacre_primitives::Reader::new(&value);
        let block = reader.read_blob().expect("store integrity: malformed raw block");
        let count = reader.read_varint().expect("store integrity: malformed raw block");
        let mut transactions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            transactions.push(reader.read_blob().expect("store integrity: malformed raw block"));
        }
        Some(RawBlock {
            block,
            transactions,
        })
    }

    /// Up to `count` summaries of the branch ending at `from` (inclusive),
    /// oldest first. Walks previous-hash links, so it works for side
    /// chains as well as the main chain.
    pub(crate) fn tip_segment(
        &self,
        from: &BlockHeaderSummary,
        count: Height,
    ) -> Vec<BlockHeaderSummary> {
        let mut segment = Vec::with_capacity(count as usize);
        if from.height == HEIGHT_NONE || count == 0 {
            return segment;
        }
        let mut current = from.clone();
        loop {
            segment.push(current.clone());
            if segment.len() as Height >= count || current.height == 0 {
                break;
            }
            current = match self.read_header(&current.previous_block_hash) {
                Some(parent) => parent,
                None => break,
            };
        }
        segment.reverse();
        segment
    }

    /// Medians of the windows ending at `prev_info`: block sizes over the
    /// reward window, timestamps over the version-dependent check window
    /// (zero while the chain is shorter than the window).
    pub(crate) fn calculate_consensus_values(
        &self,
        prev_info: &BlockHeaderSummary,
    ) -> (u32, Timestamp) {
        let size_window = self.tip_segment(prev_info, self.currency().reward_blocks_window);
        let mut sizes: Vec<u32> = size_window.iter().map(|s| s.block_size).collect();
        let next_median_size = median_value(&mut sizes);

        let next_height = prev_info.height.wrapping_add(1);
        let check_window = self.currency().get_timestamp_check_window(next_height);
        let timestamp_window = self.tip_segment(prev_info, check_window);
        let next_median_timestamp = if timestamp_window.len() as Height >= check_window {
            let mut timestamps: Vec<Timestamp> =
                timestamp_window.iter().map(|s| s.timestamp).collect();
            median_value(&mut timestamps)
        } else {
            0
        };
        (next_median_size, next_median_timestamp)
    }

    /// Difficulty window ending at `prev_info`, excluding genesis, sized
    /// for the block after it.
    pub(crate) fn difficulty_window(
        &self,
        prev_info: &BlockHeaderSummary,
    ) -> (Vec<Timestamp>, Vec<u128>) {
        let next_height = prev_info.height.wrapping_add(1);
        let blocks_count = if prev_info.height == HEIGHT_NONE {
            0
        } else {
            prev_info
                .height
                .min(self.currency().get_difficulty_blocks_count(next_height))
        };
        let segment = self.tip_segment(prev_info, blocks_count);
        let timestamps = segment.iter().map(|s| s.timestamp).collect();
        let difficulties = segment.iter().map(|s| s.cumulative_difficulty).collect();
        (timestamps, difficulties)
    }

    /// Full consensus window for validating a child of `prev_info`,
    /// reusing the cached tip medians when the parent is the tip.
    pub(crate) fn consensus_window(&self, prev_info: &BlockHeaderSummary) -> ConsensusWindow {
        let (size_median, timestamp_median) = if prev_info.hash == self.tip().hash {
            (self.next_median_size(), self.next_median_timestamp())
        } else {
            self.calculate_consensus_values(prev_info)
        };
        let (timestamps, cumulative_difficulties) = self.difficulty_window(prev_info);
        ConsensusWindow {
            size_median,
            timestamp_median,
            timestamps,
            cumulative_difficulties,
        }
    }
}

/// Median of a slice; sorts in place. Zero for an empty slice, mean of the
/// middle pair for even lengths.
pub(crate) fn median_value<T>(values: &mut [T]) -> T
where
    T: Copy + Ord + Default + std::ops::Add<Output = T> + std::ops::Div<Output = T> + From<u8>,
{
    if values.is_empty() {
        return T::default();
    }
    values.sort_unstable();
    let middle = values.len() / 2;
    if values.len() % 2 == 1 {
        values[middle]
    } else {
        (values[middle - 1] + values[middle]) / T::from(2u8)
    }
}
