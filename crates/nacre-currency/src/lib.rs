//! # nacre-currency
//!
//! Pure consensus rules of the Nacre currency: the block-version schedule,
//! the reward curve with its median-size penalty, both difficulty
//! retargeting algorithms, timestamp windows, coinbase construction,
//! proof-of-work dispatch and address encoding.
//!
//! Nothing here touches storage; every function is a pure computation over
//! its arguments so the chain-state engine and tests can drive them freely.

mod address;
mod currency;
mod difficulty;
pub mod hashing;
pub mod params;

pub use address::{AddressError, encode_address, parse_address};
pub use currency::{
    append_merge_mining_tag, decompose_amount, format_amount, get_merge_mining_tag,
    get_transaction_public_key, is_dust, parse_amount, Currency, MergeMiningTag,
    TX_EXTRA_TAG_MERGE_MINING, TX_EXTRA_TAG_NONCE, TX_EXTRA_TAG_PADDING, TX_EXTRA_TAG_PUBKEY,
};
