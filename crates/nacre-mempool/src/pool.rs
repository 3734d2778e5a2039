//! Transaction pool structure.

use nacre_primitives::{Amount, Hash, KeyImage, Timestamp, Transaction, TransactionInput};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// A transaction held in the pool.
#[derive(Clone, Debug)]
pub struct PoolTransaction {
    pub tx: Transaction,
    pub binary_tx: Vec<u8>,
    pub fee: Amount,
    /// Arrival time, informational only; ordering is by fee and id.
    pub timestamp: Timestamp,
}

impl PoolTransaction {
    pub fn new(tx: Transaction, binary_tx: Vec<u8>, fee: Amount, timestamp: Timestamp) -> Self {
        Self {
            tx,
            binary_tx,
            fee,
            timestamp,
        }
    }

    /// Integer fee per byte. The pair (fee_per_byte, id), both ascending,
    /// is the pool's total order; fractional comparison is deliberately
    /// not used.
    pub fn fee_per_byte(&self) -> Amount {
        self.fee / self.binary_tx.len() as u64
    }
}

/// Key images claimed by a transaction's key inputs, in input order.
pub fn transaction_key_images(tx: &Transaction) -> Vec<KeyImage> {
    tx.prefix
        .inputs
        .iter()
        .filter_map(|input| match input {
            TransactionInput::Key(key_input) => Some(key_input.key_image),
            TransactionInput::Coinbase(_) => None,
        })
        .collect()
}

/// Bounded multi-index pool of verified transactions.
///
/// Three indices are kept in lockstep: by id, by claimed key image, and an
/// ordered (fee-per-byte, id) structure used for the admission floor,
/// eviction and template building. Index desynchronization is a
/// programming error and aborts.
#[derive(Default)]
pub struct TransactionPool {
    by_id: HashMap<Hash, PoolTransaction>,
    by_keyimage: HashMap<KeyImage, Hash>,
    by_fee: BTreeMap<Amount, BTreeSet<Hash>>,
    total_size: usize,
    version: u64,
}

impl TransactionPool {
    pub fn new() -> Self {
        Self {
            version: 1,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Total serialized bytes currently pooled.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Counter incremented on every change that could alter a block
    /// template built from this pool.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn bump_version(&mut self) {
        self.version += 1;
    }

    pub fn contains(&self, tx_id: &Hash) -> bool {
        self.by_id.contains_key(tx_id)
    }

    pub fn get(&self, tx_id: &Hash) -> Option<&PoolTransaction> {
        self.by_id.get(tx_id)
    }

    /// Which pooled transaction, if any, claims this key image.
    pub fn keyimage_spender(&self, key_image: &KeyImage) -> Option<Hash> {
        self.by_keyimage.get(key_image).copied()
    }

    /// The pool floor: smallest fee-per-byte, smallest id within it.
    pub fn min_fee_per_byte(&self) -> Option<(Amount, Hash)> {
        let (fee_per_byte, ids) = self.by_fee.iter().next()?;
        let id = ids.iter().next().expect("fee index holds no empty sets");
        Some((*fee_per_byte, *id))
    }

    /// Pool ids from the best fee-per-byte down; within a bucket larger
    /// ids first, mirroring reverse iteration of the ascending order.
    pub fn ids_fee_descending(&self) -> Vec<Hash> {
        self.by_fee
            .iter()
            .rev()
            .flat_map(|(_, ids)| ids.iter().rev().copied())
            .collect()
    }

    /// All ids, unordered.
    pub fn all_ids(&self) -> Vec<Hash> {
        self.by_id.keys().copied().collect()
    }

    /// Insert a fully validated transaction into all indices.
    pub fn insert(&mut self, tx_id: Hash, entry: PoolTransaction) {
        let mut all_inserted = true;
        for key_image in transaction_key_images(&entry.tx) {
            if self.by_keyimage.insert(key_image, tx_id).is_some() {
                all_inserted = false;
            }
        }
        let fee_per_byte = entry.fee_per_byte();
        let size = entry.binary_tx.len();
        if self.by_id.insert(tx_id, entry).is_some() {
            all_inserted = false;
        }
        if !self.by_fee.entry(fee_per_byte).or_default().insert(tx_id) {
            all_inserted = false;
        }
        assert!(all_inserted, "pool index desynchronized on insert");
        self.total_size += size;
        self.version += 1;
    }

    /// Remove a transaction from all indices.
    pub fn remove(&mut self, tx_id: &Hash) -> Option<PoolTransaction> {
        let entry = self.by_id.remove(tx_id)?;
        let mut all_erased = true;
        for key_image in transaction_key_images(&entry.tx) {
            if self.by_keyimage.remove(&key_image).is_none() {
                all_erased = false;
            }
        }
        let fee_per_byte = entry.fee_per_byte();
        match self.by_fee.get_mut(&fee_per_byte) {
            Some(ids) => {
                if !ids.remove(tx_id) {
                    all_erased = false;
                }
                if ids.is_empty() {
                    self.by_fee.remove(&fee_per_byte);
                }
            }
            None => all_erased = false,
        }
        assert!(all_erased, "pool index desynchronized on remove");
        self.total_size -= entry.binary_tx.len();
        self.version += 1;
        debug!(
            tx_id = %tx_id,
            size = entry.binary_tx.len(),
            pool_size = self.total_size,
            count = self.by_id.len(),
            "removed transaction from pool"
        );
        Some(entry)
    }

    /// Evict floor entries until the pool fits `cap`, except that the
    /// newest admission (of `newest_size` bytes) may keep the pool above
    /// the cap when evicting the floor would overshoot below
    /// `cap - newest_size`.
    pub fn evict_to_cap(&mut self, cap: usize, newest_size: usize) -> Vec<(Hash, PoolTransaction)> {
        let mut evicted = Vec::new();
        while self.total_size > cap {
            let (_, floor_id) = self
                .min_fee_per_byte()
                .expect("pool above cap cannot be empty");
            let floor_size = self.by_id[&floor_id].binary_tx.len();
            if self.total_size - floor_size < cap.saturating_sub(newest_size) {
                break;
            }
            let entry = self.remove(&floor_id).unwrap();
            evicted.push((floor_id, entry));
        }
        evicted
    }

    /// Drop every entry, handing them back for re-validation.
    pub fn drain(&mut self) -> Vec<(Hash, PoolTransaction)> {
        let ids = self.all_ids();
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.remove(&id) {
                entries.push((id, entry));
            }
        }
        entries
    }
}
