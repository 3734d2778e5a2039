//! # nacre-storage
//!
//! Ordered key-value storage for the Nacre node.
//!
//! This crate provides:
//! - A RocksDB-backed [`Database`] over a single byte keyspace
//! - [`StoreTransaction`], a buffered overlay giving read-your-writes
//!   semantics and one atomic commit
//! - SQLite4-style ordered varints for composite keys, so lexicographic
//!   key order equals numeric order on the encoded fields

mod database;
mod error;
pub mod keys;
mod transaction;

pub use database::Database;
pub use error::{StorageError, StorageResult};
pub use transaction::StoreTransaction;
