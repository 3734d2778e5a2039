//! In-memory delta layer.
//!
//! A [`DeltaState`] stacks a tentative set of key-image insertions, output
//! appends and spent marks over a parent view. Reads fall through to the
//! parent; writes stay local until the delta is detached into
//! [`DeltaChanges`] and replayed onto the parent. Deltas nest: transaction
//! validation runs in a child delta so a failing transaction vanishes
//! without a trace.

use crate::utxo::{OutputRecord, UtxoRead, UtxoWrite};
use nacre_primitives::{Amount, Height, KeyImage, PublicKey, Timestamp, UnlockMoment};
use std::collections::{BTreeMap, HashMap};

/// Buffered chain-state mutations over a borrowed parent view.
pub struct DeltaState<'a> {
    parent: &'a dyn UtxoRead,
    block_height: Height,
    unlock_timestamp: Timestamp,
    keyimages: HashMap<KeyImage, Height>,
    amounts: BTreeMap<Amount, Vec<(UnlockMoment, PublicKey)>>,
    /// Amounts in the order outputs were appended, for deterministic replay.
    append_order: Vec<Amount>,
    spent_marks: Vec<(Amount, u32, bool)>,
}

/// A delta detached from its parent borrow, ready to be applied.
pub struct DeltaChanges {
    block_height: Height,
    keyimages: HashMap<KeyImage, Height>,
    amounts: BTreeMap<Amount, Vec<(UnlockMoment, PublicKey)>>,
    append_order: Vec<Amount>,
    spent_marks: Vec<(Amount, u32, bool)>,
}

impl<'a> DeltaState<'a> {
    pub fn new(block_height: Height, unlock_timestamp: Timestamp, parent: &'a dyn UtxoRead) -> Self {
        Self {
            parent,
            block_height,
            unlock_timestamp,
            keyimages: HashMap::new(),
            amounts: BTreeMap::new(),
            append_order: Vec::new(),
            spent_marks: Vec::new(),
        }
    }

    pub fn block_height(&self) -> Height {
        self.block_height
    }

    pub fn unlock_timestamp(&self) -> Timestamp {
        self.unlock_timestamp
    }

    /// Reset for a fresh block at `new_height`.
    pub fn clear(&mut self, new_height: Height) {
        self.block_height = new_height;
        self.keyimages.clear();
        self.amounts.clear();
        self.append_order.clear();
        self.spent_marks.clear();
    }

    /// Detach the buffered mutations, releasing the parent borrow.
    pub fn into_changes(self) -> DeltaChanges {
        DeltaChanges {
            block_height: self.block_height,
            keyimages: self.keyimages,
            amounts: self.amounts,
            append_order: self.append_order,
            spent_marks: self.spent_marks,
        }
    }
}

impl DeltaChanges {
    /// Replay onto the parent: key images first, then output appends in
    /// the order they were produced, then spent marks.
    pub fn apply(&self, parent: &mut dyn UtxoWrite) {
        for (key_image, height) in &self.keyimages {
            parent.store_keyimage(key_image, *height);
        }
        let mut cursors: HashMap<Amount, usize> = HashMap::new();
        for amount in &self.append_order {
            let cursor = cursors.entry(*amount).or_insert(0);
            let (unlock_time, public_key) = self.amounts[amount][*cursor];
            *cursor += 1;
            parent.push_amount_output(*amount, unlock_time, self.block_height, &public_key);
        }
        for (amount, global_index, spent) in &self.spent_marks {
            parent.spend_output(*amount, *global_index, *spent);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keyimages.is_empty() && self.append_order.is_empty() && self.spent_marks.is_empty()
    }
}

impl UtxoRead for DeltaState<'_> {
    fn read_keyimage(&self, key_image: &KeyImage) -> Option<Height> {
        match self.keyimages.get(key_image) {
            // Local hits report the delta's nominal height.
            Some(_) => Some(self.block_height),
            None => self.parent.read_keyimage(key_image),
        }
    }

    fn read_amount_output(&self, amount: Amount, global_index: u32) -> Option<OutputRecord> {
        let parent_next = self.parent.next_global_index_for_amount(amount);
        if global_index < parent_next {
            return self.parent.read_amount_output(amount, global_index);
        }
        let local = self.amounts.get(&amount)?;
        let (unlock_time, public_key) = local.get((global_index - parent_next) as usize)?;
        Some(OutputRecord {
            unlock_time: *unlock_time,
            public_key: *public_key,
            height: self.block_height,
            // Spending an output created inside the same delta is
            // prohibited, so local records are never spent.
            spent: false,
        })
    }

    fn next_global_index_for_amount(&self, amount: Amount) -> u32 {
        let parent_next = self.parent.next_global_index_for_amount(amount);
        match self.amounts.get(&amount) {
            Some(local) => parent_next + local.len() as u32,
            None => parent_next,
        }
    }
}

impl UtxoWrite for DeltaState<'_> {
    fn store_keyimage(&mut self, key_image: &KeyImage, height: Height) {
        let previous = self.keyimages.insert(*key_image, height);
        assert!(
            previous.is_none(),
            "delta integrity: duplicate key image {}",
            key_image
        );
    }

    fn delete_keyimage(&mut self, key_image: &KeyImage) {
        assert!(
            self.keyimages.remove(key_image).is_some(),
            "delta integrity: deleting unknown key image {}",
            key_image
        );
    }

    fn push_amount_output(
        &mut self,
        amount: Amount,
        unlock_time: UnlockMoment,
        _height: Height,
        public_key: &PublicKey,
    ) -> u32 {
        let parent_next = self.parent.next_global_index_for_amount(amount);
        let local = self.amounts.entry(amount).or_default();
        local.push((unlock_time, *public_key));
        self.append_order.push(amount);
        parent_next + local.len() as u32 - 1
    }

    fn pop_amount_output(&mut self, amount: Amount, unlock_time: UnlockMoment, public_key: &PublicKey) {
        let local = self.amounts.get_mut(&amount);
        let local = local.expect("delta pop_amount_output underflow");
        let tail = local.last().expect("delta pop_amount_output underflow");
        assert!(
            tail.0 == unlock_time && tail.1 == *public_key,
            "delta pop_amount_output wrong element"
        );
        local.pop();
        if local.is_empty() {
            self.amounts.remove(&amount);
        }
        let position = self
            .append_order
            .iter()
            .rposition(|a| *a == amount)
            .expect("delta pop_amount_output order desync");
        self.append_order.remove(position);
    }

    fn spend_output(&mut self, amount: Amount, global_index: u32, spent: bool) {
        self.spent_marks.push((amount, global_index, spent));
    }
}
