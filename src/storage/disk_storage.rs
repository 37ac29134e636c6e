/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The on-disk storage backend: a single rocksdb keystore holding every database in the namespace.
//!
//! The physical key of a record is `database id ∥ 0x00 ∥ key`. Database ids never contain the NUL
//! byte, so the mapping is unambiguous, and rocksdb's lexicographic key order over physical keys
//! agrees with per-database key order. That is the invariant that lets prefix scans over one
//! database work by seeking to its physical prefix.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use rocksdb::{Direction, IteratorMode, WriteOptions, DB};

use crate::types::basic::DatabaseId;

use super::snapshot::{self, Namespace};
use super::{
    compile_suffix_pattern, make_end_prefix, make_start_prefix, DatabaseSize, StorageEngine,
    StorageResult, MAX_KEY_SIZE, MAX_VALUE_SIZE,
};

const SEPARATOR: u8 = 0x00;

/// The name of the file, next to the rocksdb directory, holding the latest snapshot blob.
const SNAPSHOT_FILE: &str = "SNAPSHOT";

/// A durable implementation of [`StorageEngine`]. Every required write is synced before the call
/// returns, which is what makes the PBFT log authoritative across restarts.
pub struct DiskStorage {
    db: DB,
    snapshot_file: PathBuf,
    // rocksdb is internally thread-safe; this lock enforces the namespace-wide single-writer /
    // multi-reader discipline (e.g. a create's existence check and put must be one exclusive
    // critical section).
    lock: RwLock<()>,
}

impl DiskStorage {
    /// Open (or create) the keystore rooted at `dir`.
    pub fn open(dir: &Path) -> Result<DiskStorage, rocksdb::Error> {
        let _ = fs::create_dir_all(dir);
        let db = DB::open_default(dir.join("db"))?;
        Ok(DiskStorage {
            db,
            snapshot_file: dir.join(SNAPSHOT_FILE),
            lock: RwLock::new(()),
        })
    }

    fn physical_key(db: &DatabaseId, key: &[u8]) -> Vec<u8> {
        debug_assert!(!db.as_bytes().contains(&SEPARATOR));
        let mut physical = Vec::with_capacity(db.as_bytes().len() + 1 + key.len());
        physical.extend_from_slice(db.as_bytes());
        physical.push(SEPARATOR);
        physical.extend_from_slice(key);
        physical
    }

    fn db_prefix(db: &DatabaseId) -> Vec<u8> {
        Self::physical_key(db, &[])
    }

    fn sync_write_options() -> WriteOptions {
        let mut options = WriteOptions::default();
        options.set_sync(true);
        options
    }

    fn get(&self, physical_key: &[u8]) -> Option<Vec<u8>> {
        self.db
            .get(physical_key)
            .unwrap_or_else(|err| panic!("storage medium failure on read: {}", err))
    }

    fn put(&self, physical_key: &[u8], value: &[u8]) {
        self.db
            .put_opt(physical_key, value, &Self::sync_write_options())
            .unwrap_or_else(|err| panic!("storage medium failure on write: {}", err))
    }

    fn delete(&self, physical_key: &[u8]) {
        self.db
            .delete_opt(physical_key, &Self::sync_write_options())
            .unwrap_or_else(|err| panic!("storage medium failure on delete: {}", err))
    }

    /// All physical entries starting at `start` (inclusive) while `keep` holds, split back into
    /// logical `(key, value)` pairs by stripping `strip` leading bytes.
    fn scan(
        &self,
        start: &[u8],
        strip: usize,
        mut keep: impl FnMut(&[u8]) -> bool,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut entries = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(start, Direction::Forward))
        {
            let (physical_key, value) =
                item.unwrap_or_else(|err| panic!("storage medium failure on scan: {}", err));
            if !keep(&physical_key) {
                break;
            }
            entries.push((physical_key[strip..].to_vec(), value.to_vec()));
        }
        entries
    }

    /// The entire namespace, decoded from physical keys. Used by snapshotting.
    fn whole_namespace(&self) -> Namespace {
        let mut namespace = Namespace::new();
        for (physical_key, value) in self.scan(&[], 0, |_| true) {
            let Some(split) = physical_key.iter().position(|byte| *byte == SEPARATOR) else {
                continue;
            };
            let db = DatabaseId::new(String::from_utf8_lossy(&physical_key[..split]).into_owned());
            namespace
                .entry(db)
                .or_default()
                .insert(physical_key[split + 1..].to_vec(), value);
        }
        namespace
    }
}

impl StorageEngine for DiskStorage {
    fn create(&self, db: &DatabaseId, key: &[u8], value: &[u8]) -> StorageResult {
        let _guard = self.lock.write().unwrap();

        if value.len() > MAX_VALUE_SIZE {
            return StorageResult::ValueTooLarge;
        }

        if key.len() > MAX_KEY_SIZE {
            return StorageResult::KeyTooLarge;
        }

        let physical_key = Self::physical_key(db, key);
        if self.get(&physical_key).is_some() {
            return StorageResult::Exists;
        }
        self.put(&physical_key, value);

        StorageResult::Ok
    }

    fn read(&self, db: &DatabaseId, key: &[u8]) -> Option<Vec<u8>> {
        let _guard = self.lock.read().unwrap();
        self.get(&Self::physical_key(db, key))
    }

    fn update(&self, db: &DatabaseId, key: &[u8], value: &[u8]) -> StorageResult {
        let _guard = self.lock.write().unwrap();

        if value.len() > MAX_VALUE_SIZE {
            return StorageResult::ValueTooLarge;
        }

        let physical_key = Self::physical_key(db, key);
        if self.get(&physical_key).is_none() {
            return StorageResult::NotFound;
        }
        self.put(&physical_key, value);

        StorageResult::Ok
    }

    fn remove(&self, db: &DatabaseId, key: &[u8]) -> StorageResult {
        let _guard = self.lock.write().unwrap();

        let physical_key = Self::physical_key(db, key);
        if self.get(&physical_key).is_none() {
            return StorageResult::NotFound;
        }
        self.delete(&physical_key);

        StorageResult::Ok
    }

    fn remove_db(&self, db: &DatabaseId) -> StorageResult {
        let _guard = self.lock.write().unwrap();

        let prefix = Self::db_prefix(db);
        let doomed = self.scan(&prefix, 0, |physical_key| physical_key.starts_with(&prefix));
        if doomed.is_empty() {
            return StorageResult::NotFound;
        }
        for (physical_key, _) in doomed {
            self.delete(&physical_key);
        }

        StorageResult::Ok
    }

    fn has(&self, db: &DatabaseId, key: &[u8]) -> bool {
        let _guard = self.lock.read().unwrap();
        self.get(&Self::physical_key(db, key)).is_some()
    }

    fn get_keys(&self, db: &DatabaseId) -> Vec<Vec<u8>> {
        let _guard = self.lock.read().unwrap();

        let prefix = Self::db_prefix(db);
        self.scan(&prefix, prefix.len(), |physical_key| {
            physical_key.starts_with(&prefix)
        })
        .into_iter()
        .map(|(key, _)| key)
        .collect()
    }

    fn get_size(&self, db: &DatabaseId) -> DatabaseSize {
        let _guard = self.lock.read().unwrap();

        let prefix = Self::db_prefix(db);
        let entries = self.scan(&prefix, prefix.len(), |physical_key| {
            physical_key.starts_with(&prefix)
        });
        DatabaseSize {
            keys: entries.len() as u64,
            bytes: entries.iter().map(|(_, value)| value.len() as u64).sum(),
        }
    }

    fn get_keys_starting_with(&self, db: &DatabaseId, prefix: &[u8]) -> Vec<Vec<u8>> {
        let _guard = self.lock.read().unwrap();

        let physical_prefix = Self::physical_key(db, prefix);
        self.scan(&physical_prefix, Self::db_prefix(db).len(), |physical_key| {
            physical_key.starts_with(&physical_prefix)
        })
        .into_iter()
        .map(|(key, _)| key)
        .collect()
    }

    fn remove_range(&self, db: &DatabaseId, begin: &[u8], end: &[u8]) {
        let _guard = self.lock.write().unwrap();

        let physical_begin = Self::physical_key(db, begin);
        let physical_end = Self::physical_key(db, end);
        let doomed = self.scan(&physical_begin, 0, |physical_key| {
            physical_key < physical_end.as_slice()
        });
        for (physical_key, _) in doomed {
            self.delete(&physical_key);
        }
    }

    fn get_matching(&self, db: &DatabaseId, pattern: &str, end: Option<&[u8]>) -> Vec<(Vec<u8>, Vec<u8>)> {
        let start_key = make_start_prefix(pattern).as_bytes();
        let end_key = match end {
            Some(end) => end.to_vec(),
            None => make_end_prefix(start_key),
        };
        let fixed_size = start_key.len();
        let regex = match compile_suffix_pattern(pattern, fixed_size) {
            Some(regex) => regex,
            None => return Vec::new(),
        };

        let _guard = self.lock.read().unwrap();

        let db_prefix = Self::db_prefix(db);
        let physical_start = Self::physical_key(db, start_key);
        let physical_end = Self::physical_key(db, &end_key);
        self.scan(&physical_start, db_prefix.len(), |physical_key| {
            physical_key.starts_with(&db_prefix)
                && (end_key.is_empty() || physical_key < physical_end.as_slice())
        })
        .into_iter()
        .filter(|(key, _)| key.len() >= fixed_size && regex.is_match(&key[fixed_size..]))
        .collect()
    }

    fn create_snapshot(&self) -> bool {
        let _guard = self.lock.read().unwrap();

        let blob = snapshot::encode(&self.whole_namespace());
        let tmp = self.snapshot_file.with_extension("tmp");
        if let Err(err) = fs::write(&tmp, &blob).and_then(|()| fs::rename(&tmp, &self.snapshot_file)) {
            log::warn!("failed to persist snapshot: {}", err);
            return false;
        }

        true
    }

    fn get_snapshot(&self) -> Option<Vec<u8>> {
        let _guard = self.lock.read().unwrap();
        fs::read(&self.snapshot_file).ok()
    }

    fn load_snapshot(&self, blob: &[u8]) -> bool {
        let namespace = match snapshot::decode(blob) {
            Some(namespace) => namespace,
            None => {
                log::warn!("rejecting snapshot that does not decode");
                return false;
            }
        };

        // Loading mutates the whole namespace, so it takes the exclusive lock.
        let _guard = self.lock.write().unwrap();

        for (physical_key, _) in self.scan(&[], 0, |_| true) {
            self.delete(&physical_key);
        }
        for (db, inner_db) in &namespace {
            for (key, value) in inner_db {
                self.put(&Self::physical_key(db, key), value);
            }
        }

        let tmp = self.snapshot_file.with_extension("tmp");
        if let Err(err) = fs::write(&tmp, blob).and_then(|()| fs::rename(&tmp, &self.snapshot_file)) {
            log::warn!("failed to persist loaded snapshot: {}", err);
        }

        true
    }
}
