//! Chain object hashing rules.
//!
//! A block's identity covers the header, the merkle root of its transaction
//! hashes and, from major version 2 on, the serialized merge-mining parent
//! block. The long (proof-of-work) hash variant is selected by version.

use nacre_primitives::crypto;
use nacre_primitives::{BlockTemplate, Hash, Transaction, TransactionPrefix, Writer};

/// Identity hash of a transaction body.
pub fn get_transaction_hash(tx: &Transaction) -> Hash {
    crypto::fast_hash(&tx.to_bytes())
}

/// Hash of the signed part of a transaction; the ring-signature message.
pub fn get_transaction_prefix_hash(prefix: &TransactionPrefix) -> Hash {
    crypto::fast_hash(&prefix.to_bytes())
}

/// Merkle root over coinbase plus transaction hashes.
fn get_transaction_tree_hash(template: &BlockTemplate) -> Hash {
    let mut hashes = Vec::with_capacity(template.transaction_hashes.len() + 1);
    hashes.push(get_transaction_hash(&template.base_transaction));
    hashes.extend_from_slice(&template.transaction_hashes);
    crypto::tree_hash(&hashes)
}

/// The header bytes that both the block id and the proof of work cover.
pub fn get_block_hashing_blob(template: &BlockTemplate) -> Vec<u8> {
    let mut writer = Writer::new();
    template.header.write(&mut writer);
    let tree_root = get_transaction_tree_hash(template);
    writer.write_bytes(&tree_root.0);
    writer.write_varint(template.transaction_hashes.len() as u64 + 1);
    writer.into_bytes()
}

fn get_parent_block_blob(template: &BlockTemplate) -> Vec<u8> {
    let mut writer = Writer::new();
    template.parent_block.write(&mut writer);
    writer.into_bytes()
}

/// Block identity hash.
pub fn get_block_hash(template: &BlockTemplate) -> Hash {
    let mut blob = get_block_hashing_blob(template);
    if template.header.major_version >= 2 {
        blob.extend_from_slice(&get_parent_block_blob(template));
    }
    crypto::fast_hash(&blob)
}

/// Hash a merge-mined (auxiliary) block commits to in the parent chain.
pub fn get_auxiliary_block_header_hash(template: &BlockTemplate) -> Hash {
    crypto::fast_hash(&get_block_hashing_blob(template))
}

/// Proof-of-work hash. Version 1 mines the block itself; versions 2 and 3
/// mine the merge-mining parent; version 4 uses the lightweight variant on
/// the parent.
pub fn get_block_long_hash(template: &BlockTemplate) -> Hash {
    match template.header.major_version {
        1 => crypto::slow_hash(&get_block_hashing_blob(template)),
        2 | 3 => crypto::slow_hash(&get_parent_block_blob(template)),
        _ => crypto::slow_hash_lite(&get_parent_block_blob(template)),
    }
}
