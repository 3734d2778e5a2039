//! # nacre-primitives
//!
//! Core chain types for the Nacre node.
//!
//! This crate provides:
//! - Opaque 32/64-byte value types (hashes, keys, key images, signatures)
//! - The transaction and block model (coinbase/key inputs as sum types)
//! - The binary codec used for hashing and persistence
//! - Pure cryptography: fast hash, tree hash, ring signatures, PoW hashing

pub mod crypto;
mod serialize;
mod types;

pub use serialize::{CodecError, CodecResult, Reader, Writer};
pub use types::{
    AccountAddress, Amount, Block, BlockHeader, BlockTemplate, CoinbaseInput, CumulativeDifficulty,
    Difficulty, Hash, Height, KeyImage, KeyInput, KeyOutput, KeyPair, OutputTarget, ParentBlock,
    PublicKey, RawBlock, SecretKey, SignedAmount, Signature, Timestamp, Transaction, TransactionInput,
    TransactionOutput, TransactionPrefix, UnlockMoment, HEIGHT_NONE,
};
