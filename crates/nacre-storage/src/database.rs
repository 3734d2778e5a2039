//! RocksDB database implementation.
//!
//! The chain state keeps everything in one keyspace and namespaces with
//! one-byte key prefixes, so a single default column family is enough.
//! RocksDB holds a lock file in the data directory, which also serves as
//! the exclusive-ownership lock for the whole chain database.

use crate::StorageResult;
use rocksdb::{BlockBasedOptions, Cache, Options, DB};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// RocksDB database wrapper.
pub struct Database {
    db: Arc<DB>,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let path = path.as_ref();
        info!("Opening database at {:?}", path);

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(256);
        opts.set_keep_log_file_num(1);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_write_buffer_number(4);

        // A bounded shared block cache; the default grows without limit.
        let block_cache = Cache::new_lru_cache(64 * 1024 * 1024);
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(&block_cache);
        block_opts.set_cache_index_and_filter_blocks(true);
        opts.set_block_based_table_factory(&block_opts);

        let db = DB::open(&opts, path)?;
        debug!("Database opened successfully");

        Ok(Self { db: Arc::new(db) })
    }

    /// Open a database in read-only mode.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let path = path.as_ref();
        info!("Opening database in read-only mode at {:?}", path);
        let opts = Options::default();
        let db = DB::open_for_read_only(&opts, path, false)?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    /// Apply a prepared RocksDB write batch atomically.
    pub fn write(&self, batch: rocksdb::WriteBatch) -> StorageResult<()> {
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// All committed pairs whose key starts with `prefix`, in key order.
    pub fn iter_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mode = rocksdb::IteratorMode::From(prefix, rocksdb::Direction::Forward);
        self.db
            .iterator(mode)
            .filter_map(|item| item.ok())
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.to_vec(), value.to_vec()))
            .collect()
    }

    /// The greatest committed key starting with `prefix`. Reverse cursor,
    /// touches a single entry.
    pub fn last_in_prefix(&self, prefix: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let mut iter = self.db.raw_iterator();
        match prefix_upper_bound(prefix) {
            Some(bound) => {
                // Position at the last key <= bound, then step off an exact
                // bound hit, which is by construction not inside the prefix.
                iter.seek_for_prev(&bound);
                if iter.valid() && iter.key() == Some(bound.as_slice()) {
                    iter.prev();
                }
            }
            None => iter.seek_to_last(),
        }
        if iter.valid() {
            let key = iter.key().expect("valid iterator has a key");
            if key.starts_with(prefix) {
                return Some((key.to_vec(), iter.value().unwrap().to_vec()));
            }
        }
        None
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
        }
    }
}

/// Smallest byte string greater than every key starting with `prefix`, or
/// `None` when no such string exists (prefix of all 0xff).
pub(crate) fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(bound);
        }
        bound.pop();
    }
    None
}
