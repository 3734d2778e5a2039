//! Per-block header summaries.

use nacre_primitives::{
    Amount, CodecError, CodecResult, CumulativeDifficulty, Difficulty, Hash, Height, Reader,
    Timestamp, Writer, HEIGHT_NONE,
};

/// Everything the engine remembers about a committed or side-chain block
/// header: identity, consensus-derived values and the windowed statistics
/// its validation fixed.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BlockHeaderSummary {
    pub major_version: u8,
    pub minor_version: u8,
    pub previous_block_hash: Hash,
    pub timestamp: Timestamp,
    pub nonce: u32,
    pub hash: Hash,
    pub height: Height,
    pub difficulty: Difficulty,
    pub cumulative_difficulty: CumulativeDifficulty,
    pub base_reward: Amount,
    pub reward: Amount,
    pub block_size: u32,
    pub transactions_cumulative_size: u32,
    pub already_generated_coins: Amount,
    pub already_generated_transactions: u64,
    pub size_median: u32,
    pub timestamp_median: Timestamp,
    pub effective_size_median: u32,
    pub total_fee_amount: Amount,
}

impl BlockHeaderSummary {
    /// The phantom parent of genesis: height wraps to 0 when incremented,
    /// everything else is zero.
    pub fn pre_genesis() -> Self {
        Self {
            height: HEIGHT_NONE,
            ..Default::default()
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        writer.write_varint(u64::from(self.major_version));
        writer.write_varint(u64::from(self.minor_version));
        writer.write_bytes(&self.previous_block_hash.0);
        writer.write_varint(u64::from(self.timestamp));
        writer.write_varint(u64::from(self.nonce));
        writer.write_bytes(&self.hash.0);
        writer.write_varint(u64::from(self.height));
        writer.write_varint(self.difficulty);
        writer.write_varint((self.cumulative_difficulty >> 64) as u64);
        writer.write_varint(self.cumulative_difficulty as u64);
        writer.write_varint(self.base_reward);
        writer.write_varint(self.reward);
        writer.write_varint(u64::from(self.block_size));
        writer.write_varint(u64::from(self.transactions_cumulative_size));
        writer.write_varint(self.already_generated_coins);
        writer.write_varint(self.already_generated_transactions);
        writer.write_varint(u64::from(self.size_median));
        writer.write_varint(u64::from(self.timestamp_median));
        writer.write_varint(u64::from(self.effective_size_median));
        writer.write_varint(self.total_fee_amount);
        writer.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        let mut reader = Reader::new(bytes);
        let summary = Self {
            major_version: reader.read_varint()? as u8,
            minor_version: reader.read_varint()? as u8,
            previous_block_hash: read_hash(&mut reader)?,
            timestamp: reader.read_varint()? as Timestamp,
            nonce: reader.read_varint()? as u32,
            hash: read_hash(&mut reader)?,
            height: reader.read_varint()? as Height,
            difficulty: reader.read_varint()?,
            cumulative_difficulty: {
                let high = reader.read_varint()?;
                let low = reader.read_varint()?;
                (u128::from(high) << 64) | u128::from(low)
            },
            base_reward: reader.read_varint()?,
            reward: reader.read_varint()?,
            block_size: reader.read_varint()? as u32,
            transactions_cumulative_size: reader.read_varint()? as u32,
            already_generated_coins: reader.read_varint()?,
            already_generated_transactions: reader.read_varint()?,
            size_median: reader.read_varint()? as u32,
            timestamp_median: reader.read_varint()? as Timestamp,
            effective_size_median: reader.read_varint()? as u32,
            total_fee_amount: reader.read_varint()?,
        };
        if !reader.is_empty() {
            return Err(CodecError::TrailingBytes);
        }
        Ok(summary)
    }
}

fn read_hash(reader: &mut Reader<'_>) -> CodecResult<Hash> {
    Ok(Hash(reader.read_exact(32)?.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_round_trip() {
        let summary = BlockHeaderSummary {
            major_version: 2,
            minor_version: 1,
            previous_block_hash: Hash([3u8; 32]),
            timestamp: 1_700_000,
            nonce: 0xdead_beef,
            hash: Hash([4u8; 32]),
            height: 12_345,
            difficulty: 777,
            cumulative_difficulty: (1u128 << 100) + 42,
            base_reward: 1_000_000,
            reward: 1_000_500,
            block_size: 2_048,
            transactions_cumulative_size: 1_536,
            already_generated_coins: u64::MAX / 3,
            already_generated_transactions: 99,
            size_median: 10_000,
            timestamp_median: 1_699_000,
            effective_size_median: 20_000,
            total_fee_amount: 500,
        };
        let parsed = BlockHeaderSummary::from_bytes(&summary.to_bytes()).unwrap();
        assert_eq!(parsed, summary);
    }

    #[test]
    fn test_pre_genesis_height_wraps_to_zero() {
        let parent = BlockHeaderSummary::pre_genesis();
        assert_eq!(parent.height.wrapping_add(1), 0);
        assert_eq!(parent.cumulative_difficulty, 0);
    }
}
