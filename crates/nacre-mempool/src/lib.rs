//! # nacre-mempool
//!
//! The in-memory transaction pool of the Nacre node.
//!
//! This crate owns the pool's data structure: transactions indexed by id,
//! by claimed key image, and by fee-per-byte with deterministic id
//! tie-breaking, plus the byte-budget eviction policy. Admission *policy*
//! (semantic and ledger validation, fee competition) lives in the
//! chain-state engine, which drives this structure.

mod pool;

pub use pool::{transaction_key_images, PoolTransaction, TransactionPool};
