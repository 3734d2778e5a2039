//! Buffered store transaction.
//!
//! The chain-state engine performs every mutation through one long-lived
//! [`StoreTransaction`]. Writes accumulate in an ordered overlay, reads see
//! the overlay before the committed database, and `commit` flushes the
//! whole overlay as a single atomic RocksDB batch.

use crate::{Database, StorageResult};
use std::collections::BTreeMap;
use std::ops::Bound;
use tracing::debug;

/// Pending overlay entry.
#[derive(Debug, Clone)]
enum Pending {
    Put(Vec<u8>),
    Delete,
}

/// A read-your-writes transaction over a [`Database`].
pub struct StoreTransaction {
    db: Database,
    pending: BTreeMap<Vec<u8>, Pending>,
}

impl StoreTransaction {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            pending: BTreeMap::new(),
        }
    }

    /// The underlying database handle.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Number of uncommitted operations.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        match self.pending.get(key) {
            Some(Pending::Put(value)) => Ok(Some(value.clone())),
            Some(Pending::Delete) => Ok(None),
            None => self.db.get(key),
        }
    }

    /// Write a value. With `must_not_exist`, overwriting an existing key is
    /// an integrity violation and aborts.
    pub fn put(&mut self, key: &[u8], value: &[u8], must_not_exist: bool) -> StorageResult<()> {
        if must_not_exist {
            assert!(
                self.get(key)?.is_none(),
                "store integrity: key {} already exists",
                hex::encode(key)
            );
        }
        self.pending.insert(key.to_vec(), Pending::Put(value.to_vec()));
        Ok(())
    }

    /// Delete a key. With `must_exist`, deleting a missing key is an
    /// integrity violation and aborts.
    pub fn del(&mut self, key: &[u8], must_exist: bool) -> StorageResult<()> {
        if must_exist {
            assert!(
                self.get(key)?.is_some(),
                "store integrity: key {} does not exist",
                hex::encode(key)
            );
        }
        self.pending.insert(key.to_vec(), Pending::Delete);
        Ok(())
    }

    /// Flush the overlay as one atomic batch and clear it.
    pub fn commit(&mut self) -> StorageResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut batch = rocksdb::WriteBatch::default();
        for (key, op) in &self.pending {
            match op {
                Pending::Put(value) => batch.put(key, value),
                Pending::Delete => batch.delete(key),
            }
        }
        debug!(operations = self.pending.len(), "committing store transaction");
        self.db.write(batch)?;
        self.pending.clear();
        Ok(())
    }

    /// Merged view of all pairs whose key starts with `prefix`, key order.
    pub fn iter_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let committed = self.db.iter_prefix(prefix);
        let mut merged = Vec::with_capacity(committed.len());
        let mut overlay = self.pending_range(prefix).peekable();

        for (key, value) in committed {
            // Emit overlay-only keys that sort before this committed key.
            while let Some((pending_key, _)) = overlay.peek() {
                if **pending_key < key {
                    let (pending_key, op) = overlay.next().unwrap();
                    if let Pending::Put(pending_value) = op {
                        merged.push((pending_key.clone(), pending_value.clone()));
                    }
                } else {
                    break;
                }
            }
            match overlay.peek() {
                Some((pending_key, op)) if **pending_key == key => {
                    match op {
                        Pending::Put(pending_value) => {
                            merged.push((key, pending_value.clone()));
                        }
                        Pending::Delete => {}
                    }
                    overlay.next();
                }
                _ => merged.push((key, value)),
            }
        }
        for (pending_key, op) in overlay {
            if let Pending::Put(pending_value) = op {
                merged.push((pending_key.clone(), pending_value.clone()));
            }
        }
        merged
    }

    /// Merged greatest key starting with `prefix`.
    pub fn last_in_prefix(&self, prefix: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let committed = match self.db.last_in_prefix(prefix) {
            // The committed tail may be shadowed by a pending delete; fall
            // back to the merged scan in that rare case (undo before commit).
            Some((key, _)) if matches!(self.pending.get(&key), Some(Pending::Delete)) => {
                return self.iter_prefix(prefix).pop();
            }
            other => other,
        };
        let overlay = self
            .pending_range(prefix)
            .rev()
            .find_map(|(key, op)| match op {
                Pending::Put(value) => Some((key.clone(), value.clone())),
                Pending::Delete => None,
            });
        match (committed, overlay) {
            (None, overlay) => overlay,
            (committed, None) => committed,
            (Some(committed), Some(overlay)) => {
                if overlay.0 >= committed.0 {
                    Some(overlay)
                } else {
                    Some(committed)
                }
            }
        }
    }

    fn pending_range(
        &self,
        prefix: &[u8],
    ) -> impl DoubleEndedIterator<Item = (&Vec<u8>, &Pending)> + '_ {
        let lower = Bound::Included(prefix.to_vec());
        let upper = match crate::database::prefix_upper_bound(prefix) {
            Some(bound) => Bound::Excluded(bound),
            None => Bound::Unbounded,
        };
        self.pending.range((lower, upper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_txn() -> (StoreTransaction, TempDir) {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(tmp.path()).unwrap();
        (StoreTransaction::new(db), tmp)
    }

    #[test]
    fn test_read_your_writes() {
        let (mut txn, _tmp) = open_txn();
        txn.put(b"k", b"v", true).unwrap();
        assert_eq!(txn.get(b"k").unwrap(), Some(b"v".to_vec()));
        // Not visible in the committed database yet.
        assert_eq!(txn.database().get(b"k").unwrap(), None);
        txn.commit().unwrap();
        assert_eq!(txn.database().get(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(txn.pending_len(), 0);
    }

    #[test]
    fn test_delete_shadows_committed() {
        let (mut txn, _tmp) = open_txn();
        txn.put(b"k", b"v", true).unwrap();
        txn.commit().unwrap();
        txn.del(b"k", true).unwrap();
        assert_eq!(txn.get(b"k").unwrap(), None);
        txn.commit().unwrap();
        assert_eq!(txn.database().get(b"k").unwrap(), None);
    }

    #[test]
    #[should_panic(expected = "already exists")]
    fn test_put_must_not_exist_panics_on_duplicate() {
        let (mut txn, _tmp) = open_txn();
        txn.put(b"k", b"v", true).unwrap();
        let _ = txn.put(b"k", b"w", true);
    }

    #[test]
    #[should_panic(expected = "does not exist")]
    fn test_del_must_exist_panics_on_missing() {
        let (mut txn, _tmp) = open_txn();
        let _ = txn.del(b"k", true);
    }

    #[test]
    fn test_merged_prefix_iteration() {
        let (mut txn, _tmp) = open_txn();
        txn.put(b"a1", b"1", true).unwrap();
        txn.put(b"a3", b"3", true).unwrap();
        txn.commit().unwrap();
        txn.put(b"a2", b"2", true).unwrap();
        txn.put(b"a3", b"3x", false).unwrap();
        txn.del(b"a1", true).unwrap();
        txn.put(b"a4", b"4", true).unwrap();
        let pairs = txn.iter_prefix(b"a");
        assert_eq!(
            pairs,
            vec![
                (b"a2".to_vec(), b"2".to_vec()),
                (b"a3".to_vec(), b"3x".to_vec()),
                (b"a4".to_vec(), b"4".to_vec()),
            ]
        );
    }

    #[test]
    fn test_merged_last_in_prefix() {
        let (mut txn, _tmp) = open_txn();
        assert_eq!(txn.last_in_prefix(b"a"), None);
        txn.put(b"a1", b"1", true).unwrap();
        txn.commit().unwrap();
        // Pending key beyond the committed tail wins.
        txn.put(b"a5", b"5", true).unwrap();
        assert_eq!(txn.last_in_prefix(b"a").unwrap().0, b"a5".to_vec());
        // Deleting the pending tail exposes the committed one again.
        txn.del(b"a5", true).unwrap();
        assert_eq!(txn.last_in_prefix(b"a").unwrap().0, b"a1".to_vec());
        // Deleting the committed tail exposes nothing.
        txn.del(b"a1", true).unwrap();
        assert_eq!(txn.last_in_prefix(b"a"), None);
    }
}
