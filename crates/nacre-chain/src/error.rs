//! Engine-level errors.
//!
//! Consensus rejections travel as values inside the add-block/add-tx
//! results; `ChainError` covers what makes the engine itself unusable.

use nacre_consensus::ConsensusError;
use nacre_primitives::CodecError;
use nacre_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("blockchain database format unknown (version={0}), delete the data directory to resync")]
    DatabaseFormat(String),

    #[error("consensus failure outside validation: {0}")]
    Consensus(ConsensusError),
}

pub type ChainResult<T> = Result<T, ChainError>;
