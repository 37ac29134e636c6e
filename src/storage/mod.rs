//! Per-database keyed-bytes storage with prefix and range scans, behind two interchangeable
//! backends.
//!
//! The storage engine holds a namespace: a mapping from [database id](DatabaseId) to an ordered
//! mapping from key bytes to value bytes. Keys within a database are kept in lexicographic order,
//! which is what makes prefix scans over the PBFT operation log enumerate operations in apply
//! order.
//!
//! Two backends implement the same [`StorageEngine`] contract: [`MemStorage`], backed by ordered
//! maps, and [`DiskStorage`], backed by a single rocksdb keystore whose physical keys are
//! `database id ∥ 0x00 ∥ key`.
//!
//! ## Concurrency
//!
//! Both backends follow a single-writer / multi-reader discipline over the whole namespace: reads
//! may run concurrently with each other, and any mutation is exclusive. Snapshot creation is a
//! read; snapshot loading is a write and takes the exclusive lock.

pub mod disk_storage;

pub mod mem_storage;

pub(crate) mod snapshot;

use std::fmt::{self, Display, Formatter};

use regex::bytes::Regex;

use crate::types::basic::DatabaseId;

pub use disk_storage::DiskStorage;
pub use mem_storage::MemStorage;

/// Largest key the engine accepts, in bytes.
pub const MAX_KEY_SIZE: usize = 4 * 1024;

/// Largest value the engine accepts, in bytes.
pub const MAX_VALUE_SIZE: usize = 256 * 1024;

/// Outcome of a storage mutation. These are the recoverable error kinds: the CRUD service maps
/// them to typed response codes for the client. A storage-medium failure during a required write
/// is not represented here; it is fatal.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StorageResult {
    Ok,
    Exists,
    NotFound,
    KeyTooLarge,
    ValueTooLarge,
}

impl StorageResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, StorageResult::Ok)
    }
}

impl Display for StorageResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StorageResult::Ok => write!(f, "ok"),
            StorageResult::Exists => write!(f, "record exists"),
            StorageResult::NotFound => write!(f, "record not found"),
            StorageResult::KeyTooLarge => write!(f, "key too large"),
            StorageResult::ValueTooLarge => write!(f, "value too large"),
        }
    }
}

/// Number of keys in a database and the total size of their values.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct DatabaseSize {
    pub keys: u64,
    pub bytes: u64,
}

/// The contract shared by both storage backends.
pub trait StorageEngine: Send + Sync {
    /// Insert a new record. Fails with [`StorageResult::Exists`] if the key is already present;
    /// never overwrites.
    fn create(&self, db: &DatabaseId, key: &[u8], value: &[u8]) -> StorageResult;

    fn read(&self, db: &DatabaseId, key: &[u8]) -> Option<Vec<u8>>;

    /// Replace the value of an existing record. Requires a prior entry.
    fn update(&self, db: &DatabaseId, key: &[u8], value: &[u8]) -> StorageResult;

    fn remove(&self, db: &DatabaseId, key: &[u8]) -> StorageResult;

    /// Drop an entire database.
    fn remove_db(&self, db: &DatabaseId) -> StorageResult;

    fn has(&self, db: &DatabaseId, key: &[u8]) -> bool;

    /// All keys of `db`, in ascending key order.
    fn get_keys(&self, db: &DatabaseId) -> Vec<Vec<u8>>;

    fn get_size(&self, db: &DatabaseId) -> DatabaseSize;

    /// Keys of `db` whose byte-prefix equals `prefix`, in ascending key order.
    fn get_keys_starting_with(&self, db: &DatabaseId, prefix: &[u8]) -> Vec<Vec<u8>>;

    /// Delete the keys of `db` in the half-open range `[begin, end)`.
    fn remove_range(&self, db: &DatabaseId, begin: &[u8], end: &[u8]);

    /// Find records whose keys match an anchored regular expression.
    ///
    /// Literals at the beginning of `pattern` are used to bound where the scan starts and (if no
    /// `end` is given) where it ends; the remainder of the pattern is matched against the suffix
    /// of each key following the literal prefix, anchored at its start.
    fn get_matching(&self, db: &DatabaseId, pattern: &str, end: Option<&[u8]>) -> Vec<(Vec<u8>, Vec<u8>)>;

    /// Serialize the entire namespace and store it as the latest snapshot inside the engine.
    fn create_snapshot(&self) -> bool;

    /// The latest stored snapshot blob. This is the blob itself, not a reference to live state.
    fn get_snapshot(&self) -> Option<Vec<u8>>;

    /// Replace the current state with the blob's contents and set it as the latest snapshot.
    fn load_snapshot(&self, blob: &[u8]) -> bool;
}

/// The longest literal prefix of `pattern`: everything before the first regex metacharacter.
pub(crate) fn make_start_prefix(pattern: &str) -> &str {
    const METACHARACTERS: &[char] = &['[', '\\', '^', '$', '.', '|', '?', '*', '+', '(', ')'];
    match pattern.find(METACHARACTERS) {
        Some(pos) => &pattern[..pos],
        None => pattern,
    }
}

/// An end bound for a scan beginning at `start_prefix`, formed by incrementing its last byte.
pub(crate) fn make_end_prefix(start_prefix: &[u8]) -> Vec<u8> {
    let mut end_prefix = start_prefix.to_vec();
    if let Some(last) = end_prefix.last_mut() {
        assert!(*last < 0x7f);
        *last += 1;
    }
    end_prefix
}

/// Compile the non-literal remainder of `pattern` into a regex anchored at the start of the key
/// suffix it will be matched against. `None` if the pattern does not compile, in which case the
/// caller logs and returns no matches.
pub(crate) fn compile_suffix_pattern(pattern: &str, fixed_size: usize) -> Option<Regex> {
    let suffix = if fixed_size < pattern.len() {
        &pattern[fixed_size..]
    } else {
        ".*"
    };
    match Regex::new(&format!("^(?:{})", suffix)) {
        Ok(regex) => Some(regex),
        Err(err) => {
            log::warn!("discarding get_matching pattern that does not compile: {}", err);
            None
        }
    }
}
