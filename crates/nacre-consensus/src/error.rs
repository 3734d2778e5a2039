//! Consensus rejection taxonomy.
//!
//! Rejections are values, never panics; panics are reserved for integrity
//! violations in the state layer. The `Display` form of each variant is the
//! stable tag that callers log and relay, so variants must not be renamed.

use thiserror::Error;

/// Reason a block or transaction fails consensus.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("WRONG_TRANSACTIONS_COUNT")]
    WrongTransactionsCount,
    #[error("RAW_TRANSACTION_SIZE_TOO_BIG")]
    RawTransactionSizeTooBig,
    #[error("TRANSACTION_ABSENT_IN_POOL")]
    TransactionAbsentInPool,
    #[error("CUMULATIVE_BLOCK_SIZE_TOO_BIG")]
    CumulativeBlockSizeTooBig,
    #[error("WRONG_VERSION")]
    WrongVersion,
    #[error("PARENT_BLOCK_WRONG_VERSION")]
    ParentBlockWrongVersion,
    #[error("PARENT_BLOCK_SIZE_TOO_BIG")]
    ParentBlockSizeTooBig,
    #[error("TIMESTAMP_TOO_FAR_IN_FUTURE")]
    TimestampTooFarInFuture,
    #[error("TIMESTAMP_TOO_FAR_IN_PAST")]
    TimestampTooFarInPast,
    #[error("EMPTY_INPUTS")]
    EmptyInputs,
    #[error("INPUT_WRONG_COUNT")]
    InputWrongCount,
    #[error("INPUT_UNEXPECTED_TYPE")]
    InputUnexpectedType,
    #[error("BASE_INPUT_WRONG_BLOCK_INDEX")]
    BaseInputWrongBlockIndex,
    #[error("WRONG_TRANSACTION_UNLOCK_TIME")]
    WrongTransactionUnlockTime,
    #[error("OUTPUT_ZERO_AMOUNT")]
    OutputZeroAmount,
    #[error("OUTPUT_UNKNOWN_TYPE")]
    OutputUnknownType,
    #[error("OUTPUT_INVALID_KEY")]
    OutputInvalidKey,
    #[error("OUTPUTS_AMOUNT_OVERFLOW")]
    OutputsAmountOverflow,
    #[error("INPUT_UNKNOWN_TYPE")]
    InputUnknownType,
    #[error("INPUT_IDENTICAL_KEYIMAGES")]
    InputIdenticalKeyimages,
    #[error("INPUT_EMPTY_OUTPUT_USAGE")]
    InputEmptyOutputUsage,
    #[error("INPUT_IDENTICAL_OUTPUT_INDEXES")]
    InputIdenticalOutputIndexes,
    #[error("INPUTS_AMOUNT_OVERFLOW")]
    InputsAmountOverflow,
    #[error("WRONG_AMOUNT")]
    WrongAmount,
    #[error("BLOCK_REWARD_MISMATCH")]
    BlockRewardMismatch,
    #[error("DIFFICULTY_OVERHEAD")]
    DifficultyOverhead,
    #[error("CHECKPOINT_BLOCK_HASH_MISMATCH")]
    CheckpointBlockHashMismatch,
    #[error("PROOF_OF_WORK_TOO_WEAK")]
    ProofOfWorkTooWeak,
    #[error("INPUT_KEYIMAGE_ALREADY_SPENT")]
    InputKeyimageAlreadySpent,
    #[error("INPUT_INVALID_GLOBAL_INDEX")]
    InputInvalidGlobalIndex,
    #[error("INPUT_SPEND_LOCKED_OUT")]
    InputSpendLockedOut,
    #[error("INPUT_INVALID_SIGNATURES")]
    InputInvalidSignatures,
    #[error("INPUT_CORRUPTED_SIGNATURES")]
    InputCorruptedSignatures,
}
