//! Chain value types and the transaction/block model.

use std::fmt;

/// Atomic currency units.
pub type Amount = u64;
/// Signed amount, used for emission deltas.
pub type SignedAmount = i64;
/// Block height.
pub type Height = u32;
/// Unix timestamp in seconds.
pub type Timestamp = u32;
/// Per-block difficulty.
pub type Difficulty = u64;
/// Chain-selection accumulator; difficulty sums overflow 64 bits.
pub type CumulativeDifficulty = u128;
/// Either a block height (below the height threshold) or a unix timestamp.
pub type UnlockMoment = u64;

/// Sentinel meaning "no height".
pub const HEIGHT_NONE: Height = Height::MAX;

macro_rules! pod_bytes {
    ($(#[$doc:meta])* $name:ident, $len:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// All-zero value.
            pub const ZERO: Self = Self([0u8; $len]);

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn from_slice(slice: &[u8]) -> Option<Self> {
                if slice.len() != $len {
                    return None;
                }
                let mut out = [0u8; $len];
                out.copy_from_slice(slice);
                Some(Self(out))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::ZERO
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

pod_bytes!(
    /// 32-byte hash digest.
    Hash, 32
);
pod_bytes!(
    /// Compressed group element.
    PublicKey, 32
);
pod_bytes!(
    /// Secret scalar.
    SecretKey, 32
);
pod_bytes!(
    /// One-way image of a spent output's key; the double-spend detector.
    KeyImage, 32
);
pod_bytes!(
    /// Ring signature element: challenge scalar followed by response scalar.
    Signature, 64
);

/// Public spend/view key pair forming a wallet address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct AccountAddress {
    pub spend_public_key: PublicKey,
    pub view_public_key: PublicKey,
}

/// Secret/public key pair.
#[derive(Clone, Copy)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub secret_key: SecretKey,
}

/// Coinbase input: mints the block subsidy at a given height.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct CoinbaseInput {
    pub block_index: Height,
}

/// Key input: spends one output out of a ring of candidates.
///
/// `output_indexes` are stored as differences; the first element is an
/// absolute global index and every further element is an offset from the
/// previous absolute index.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct KeyInput {
    pub amount: Amount,
    pub output_indexes: Vec<u32>,
    pub key_image: KeyImage,
}

/// Transaction input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionInput {
    Coinbase(CoinbaseInput),
    Key(KeyInput),
}

/// One-time destination key.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct KeyOutput {
    pub key: PublicKey,
}

/// Output destination. Only key outputs exist today; the enum leaves room
/// for future target kinds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputTarget {
    Key(KeyOutput),
}

/// Transaction output: an amount bound to a destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionOutput {
    pub amount: Amount,
    pub target: OutputTarget,
}

/// Everything of a transaction that is covered by ring signatures.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct TransactionPrefix {
    pub version: u8,
    pub unlock_time: UnlockMoment,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub extra: Vec<u8>,
}

/// A full transaction: prefix plus one signature vector per input.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Transaction {
    pub prefix: TransactionPrefix,
    pub signatures: Vec<Vec<Signature>>,
}

/// Fields of a block header that participate in proof of work.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub major_version: u8,
    pub minor_version: u8,
    pub nonce: u32,
    pub timestamp: Timestamp,
    pub previous_block_hash: Hash,
}

/// Merge-mining parent block carried by blocks of major version >= 2.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ParentBlock {
    pub major_version: u8,
    pub minor_version: u8,
    pub previous_block_hash: Hash,
    pub transaction_count: u16,
    pub base_transaction_branch: Vec<Hash>,
    pub base_transaction: TransactionPrefix,
    pub blockchain_branch: Vec<Hash>,
}

/// A mineable block: header, optional parent block, coinbase, and the
/// hashes of the transactions it commits to.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BlockTemplate {
    pub header: BlockHeader,
    pub parent_block: ParentBlock,
    pub base_transaction: Transaction,
    pub transaction_hashes: Vec<Hash>,
}

/// A block as it travels the wire: serialized template plus serialized
/// transaction bodies in template order.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct RawBlock {
    pub block: Vec<u8>,
    pub transactions: Vec<Vec<u8>>,
}

/// A parsed block.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Block {
    pub header: BlockTemplate,
    pub transactions: Vec<Transaction>,
}

impl Transaction {
    /// Total of all output amounts; `None` on 64-bit overflow.
    pub fn sum_outputs(&self) -> Option<Amount> {
        self.prefix
            .outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.amount))
    }

    /// Total of all key-input amounts; `None` on 64-bit overflow.
    pub fn sum_inputs(&self) -> Option<Amount> {
        self.prefix.inputs.iter().try_fold(0u64, |acc, input| {
            let amount = match input {
                TransactionInput::Coinbase(_) => 0,
                TransactionInput::Key(key_input) => key_input.amount,
            };
            acc.checked_add(amount)
        })
    }
}

impl KeyInput {
    /// Expand differential `output_indexes` into absolute global indices.
    ///
    /// Returns `None` when the accumulated index overflows u32.
    pub fn absolute_output_indexes(&self) -> Option<Vec<u32>> {
        let mut absolute = Vec::with_capacity(self.output_indexes.len());
        let mut current = 0u32;
        for (i, offset) in self.output_indexes.iter().enumerate() {
            current = if i == 0 {
                *offset
            } else {
                current.checked_add(*offset)?
            };
            absolute.push(current);
        }
        Some(absolute)
    }
}
