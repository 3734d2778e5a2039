//! Parsed and pre-hashed blocks.

use nacre_currency::hashing;
use nacre_primitives::{Block, CodecResult, Hash, RawBlock};

/// A raw block parsed once, with the sizes and hashes every later check
/// needs. Construction performs no consensus validation beyond decoding.
#[derive(Clone, Debug)]
pub struct PreparedBlock {
    pub block: Block,
    pub raw_block: RawBlock,
    /// Block identity hash.
    pub bid: Hash,
    /// Serialized size of the coinbase transaction.
    pub coinbase_tx_size: usize,
    /// Serialized size of the merge-mining parent section (version >= 2).
    pub parent_block_size: usize,
    /// Proof-of-work hash, computed lazily by the validator unless a miner
    /// already supplied it.
    pub long_block_hash: Option<Hash>,
}

impl PreparedBlock {
    pub fn new(raw_block: RawBlock) -> CodecResult<Self> {
        let block = Block::from_raw_block(&raw_block)?;
        let bid = hashing::get_block_hash(&block.header);
        let coinbase_tx_size = block.header.base_transaction.binary_size();
        let parent_block_size = if block.header.header.major_version >= 2 {
            block.header.parent_block.binary_size()
        } else {
            0
        };
        Ok(Self {
            block,
            raw_block,
            bid,
            coinbase_tx_size,
            parent_block_size,
            long_block_hash: None,
        })
    }

    /// Attach a precomputed proof-of-work hash.
    pub fn with_long_hash(mut self, long_hash: Hash) -> Self {
        self.long_block_hash = Some(long_hash);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nacre_primitives::{Block, BlockHeader, BlockTemplate};

    #[test]
    fn test_prepare_computes_sizes() {
        let block = Block {
            header: BlockTemplate {
                header: BlockHeader {
                    major_version: 1,
                    ..Default::default()
                },
                ..Default::default()
            },
            transactions: Vec::new(),
        };
        let prepared = PreparedBlock::new(block.to_raw_block()).unwrap();
        assert_eq!(prepared.bid, hashing::get_block_hash(&block.header));
        assert!(prepared.coinbase_tx_size > 0);
        assert_eq!(prepared.parent_block_size, 0);
        assert!(prepared.long_block_hash.is_none());
    }

    #[test]
    fn test_prepare_rejects_garbage() {
        let raw = RawBlock {
            block: vec![0xff, 0x00, 0x13],
            transactions: Vec::new(),
        };
        assert!(PreparedBlock::new(raw).is_err());
    }
}
