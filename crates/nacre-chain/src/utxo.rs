//! Persistent UTXO / key-image index.
//!
//! Key families, all inside the engine's single store transaction:
//!
//! | prefix | suffix                                  | value          |
//! |--------|-----------------------------------------|----------------|
//! | `i`    | key image (32)                          | height         |
//! | `a`    | varint(amount) ‖ varint(global_index)   | output record  |
//!
//! The varints are SQLite4-ordered, so within an amount the records sort
//! by global index and a reverse cursor lands on the bucket tail.

use crate::chain::ChainState;
use nacre_primitives::{
    Amount, CodecError, CodecResult, Height, KeyImage, PublicKey, Reader, UnlockMoment, Writer,
};
use nacre_storage::keys::{read_varint_sqlite4, write_varint_sqlite4};

pub(crate) const KEYIMAGE_PREFIX: u8 = b'i';
pub(crate) const AMOUNT_OUTPUT_PREFIX: u8 = b'a';

/// One output in an amount bucket.
///
/// `spent` is a wallet-facing hint maintained for fully transparent
/// (single-member-ring) spends; consensus never reads it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputRecord {
    pub unlock_time: UnlockMoment,
    pub public_key: PublicKey,
    pub height: Height,
    pub spent: bool,
}

impl OutputRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        writer.write_varint(self.unlock_time);
        writer.write_bytes(&self.public_key.0);
        writer.write_varint(u64::from(self.height));
        writer.write_u8(u8::from(self.spent));
        writer.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        let mut reader = Reader::new(bytes);
        let record = Self {
            unlock_time: reader.read_varint()?,
            public_key: PublicKey(reader.read_exact(32)?.try_into().unwrap()),
            height: reader.read_varint()? as Height,
            spent: reader.read_u8()? != 0,
        };
        if !reader.is_empty() {
            return Err(CodecError::TrailingBytes);
        }
        Ok(record)
    }
}

/// Read access to chain state, satisfied by both the persistent index and
/// the in-memory delta layers stacked over it.
pub trait UtxoRead {
    /// Height at which a key image was spent on this view, if at all.
    fn read_keyimage(&self, key_image: &KeyImage) -> Option<Height>;
    /// Output record at `(amount, global_index)`.
    fn read_amount_output(&self, amount: Amount, global_index: u32) -> Option<OutputRecord>;
    /// Next free global index in the amount's bucket.
    fn next_global_index_for_amount(&self, amount: Amount) -> u32;
}

/// Mutation access; violations of the index invariants abort.
pub trait UtxoWrite: UtxoRead {
    /// Record a key image. Double insertion is an integrity violation.
    fn store_keyimage(&mut self, key_image: &KeyImage, height: Height);
    /// Remove a key image that must exist.
    fn delete_keyimage(&mut self, key_image: &KeyImage);
    /// Append an output at the bucket tail, returning its global index.
    fn push_amount_output(
        &mut self,
        amount: Amount,
        unlock_time: UnlockMoment,
        height: Height,
        public_key: &PublicKey,
    ) -> u32;
    /// Remove the bucket tail, which must match `(unlock_time, public_key)`.
    fn pop_amount_output(&mut self, amount: Amount, unlock_time: UnlockMoment, public_key: &PublicKey);
    /// Flip the spent hint; silently ignores a missing record.
    fn spend_output(&mut self, amount: Amount, global_index: u32, spent: bool);
}

pub(crate) fn keyimage_key(key_image: &KeyImage) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(KEYIMAGE_PREFIX);
    key.extend_from_slice(&key_image.0);
    key
}

pub(crate) fn amount_prefix(amount: Amount) -> Vec<u8> {
    let mut key = Vec::with_capacity(10);
    key.push(AMOUNT_OUTPUT_PREFIX);
    write_varint_sqlite4(amount, &mut key);
    key
}

pub(crate) fn amount_output_key(amount: Amount, global_index: u32) -> Vec<u8> {
    let mut key = amount_prefix(amount);
    write_varint_sqlite4(u64::from(global_index), &mut key);
    key
}

/// Decode the global index from an `a`-family key, given its bucket prefix.
pub(crate) fn global_index_from_key(key: &[u8], prefix_len: usize) -> u32 {
    let (value, consumed) = read_varint_sqlite4(&key[prefix_len..])
        .expect("store integrity: malformed amount-output key");
    assert_eq!(
        prefix_len + consumed,
        key.len(),
        "store integrity: trailing bytes in amount-output key"
    );
    value as u32
}

impl UtxoRead for ChainState {
    fn read_keyimage(&self, key_image: &KeyImage) -> Option<Height> {
        let value = self
            .store()
            .get(&keyimage_key(key_image))
            .expect("blockchain database read failed")?;
        let mut reader = Reader::new(&value);
        let height = reader
            .read_varint()
            .expect("store integrity: malformed key-image value") as Height;
        Some(height)
    }

    fn read_amount_output(&self, amount: Amount, global_index: u32) -> Option<OutputRecord> {
        let value = self
            .store()
            .get(&amount_output_key(amount, global_index))
            .expect("blockchain database read failed")?;
        Some(
            OutputRecord::from_bytes(&value)
                .expect("store integrity: malformed output record"),
        )
    }

    fn next_global_index_for_amount(&self, amount: Amount) -> u32 {
        if let Some(next) = self.next_gi_cache().read().get(&amount) {
            return *next;
        }
        let prefix = amount_prefix(amount);
        let next = match self.store().last_in_prefix(&prefix) {
            Some((key, _)) => global_index_from_key(&key, prefix.len()) + 1,
            None => 0,
        };
        self.next_gi_cache().write().insert(amount, next);
        next
    }
}

impl UtxoWrite for ChainState {
    fn store_keyimage(&mut self, key_image: &KeyImage, height: Height) {
        let mut writer = Writer::new();
        writer.write_varint(u64::from(height));
        self.store_mut()
            .put(&keyimage_key(key_image), &writer.into_bytes(), true)
            .expect("blockchain database write failed");
        // A pooled transaction claiming this image is now in conflict with
        // the chain and leaves the pool.
        if let Some(spender) = self.pool().keyimage_spender(key_image) {
            self.remove_from_pool(&spender);
        }
    }

    fn delete_keyimage(&mut self, key_image: &KeyImage) {
        self.store_mut()
            .del(&keyimage_key(key_image), true)
            .expect("blockchain database write failed");
    }

    fn push_amount_output(
        &mut self,
        amount: Amount,
        unlock_time: UnlockMoment,
        height: Height,
        public_key: &PublicKey,
    ) -> u32 {
        let global_index = self.next_global_index_for_amount(amount);
        let record = OutputRecord {
            unlock_time,
            public_key: *public_key,
            height,
            spent: false,
        };
        self.store_mut()
            .put(
                &amount_output_key(amount, global_index),
                &record.to_bytes(),
                true,
            )
            .expect("blockchain database write failed");
        self.next_gi_cache().write().insert(amount, global_index + 1);
        global_index
    }

    fn pop_amount_output(&mut self, amount: Amount, unlock_time: UnlockMoment, public_key: &PublicKey) {
        let next = self.next_global_index_for_amount(amount);
        assert!(next != 0, "pop_amount_output underflow for amount {}", amount);
        let global_index = next - 1;
        let record = self
            .read_amount_output(amount, global_index)
            .expect("pop_amount_output element does not exist");
        // Tail mismatch means the undo path and the stored chain disagree.
        assert!(
            !record.spent && record.unlock_time == unlock_time && record.public_key == *public_key,
            "pop_amount_output popping wrong element at amount {} index {}",
            amount,
            global_index
        );
        self.store_mut()
            .del(&amount_output_key(amount, global_index), true)
            .expect("blockchain database write failed");
        self.next_gi_cache().write().insert(amount, global_index);
    }

    fn spend_output(&mut self, amount: Amount, global_index: u32, spent: bool) {
        let mut record = match self.read_amount_output(amount, global_index) {
            Some(record) => record,
            None => return,
        };
        record.spent = spent;
        self.store_mut()
            .put(
                &amount_output_key(amount, global_index),
                &record.to_bytes(),
                false,
            )
            .expect("blockchain database write failed");
    }
}
