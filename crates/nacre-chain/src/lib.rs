//! # nacre-chain
//!
//! The chain-state engine of the Nacre node.
//!
//! One [`ChainState`] owns the persistent UTXO / key-image index, the
//! header-summary chain, the transaction pool and the block template
//! machinery. All mutating entry points — block apply, undo, reorg switch,
//! pool admission — run on a single logical thread; only ring-signature
//! verification during block apply fans out to a worker pool, and that is
//! synchronous to the caller.

mod chain;
mod config;
mod delta;
mod error;
mod headers;
mod random;
mod redo;
mod template;
mod utxo;

pub use chain::{
    AddTransactionResult, BlockAddResult, ChainState, Clock, DB_VERSION_CURRENT,
};
pub use config::ChainConfig;
pub use delta::{DeltaChanges, DeltaState};
pub use error::{ChainError, ChainResult};
pub use random::RandomOutput;
pub use utxo::{OutputRecord, UtxoRead, UtxoWrite};
