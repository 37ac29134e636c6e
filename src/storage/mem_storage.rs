/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The in-memory storage backend: one ordered map per database, behind a readers-writer lock.

use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

use crate::types::basic::DatabaseId;

use super::snapshot::{self, Namespace};
use super::{
    compile_suffix_pattern, make_end_prefix, make_start_prefix, DatabaseSize, StorageEngine,
    StorageResult, MAX_KEY_SIZE, MAX_VALUE_SIZE,
};

/// A volatile implementation of [`StorageEngine`]. State does not survive the process, which makes
/// this backend suitable for tests and for operating a replica that relies on its peers for
/// catch-up after a restart.
pub struct MemStorage {
    namespace: RwLock<Namespace>,
    latest_snapshot: Mutex<Option<Vec<u8>>>,
}

impl MemStorage {
    /// Create a new, empty `MemStorage`.
    pub fn new() -> MemStorage {
        MemStorage {
            namespace: RwLock::new(BTreeMap::new()),
            latest_snapshot: Mutex::new(None),
        }
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        MemStorage::new()
    }
}

impl StorageEngine for MemStorage {
    fn create(&self, db: &DatabaseId, key: &[u8], value: &[u8]) -> StorageResult {
        let mut namespace = self.namespace.write().unwrap();

        if value.len() > MAX_VALUE_SIZE {
            return StorageResult::ValueTooLarge;
        }

        if key.len() > MAX_KEY_SIZE {
            return StorageResult::KeyTooLarge;
        }

        let inner_db = namespace.entry(db.clone()).or_default();
        if inner_db.contains_key(key) {
            return StorageResult::Exists;
        }
        inner_db.insert(key.to_vec(), value.to_vec());

        StorageResult::Ok
    }

    fn read(&self, db: &DatabaseId, key: &[u8]) -> Option<Vec<u8>> {
        let namespace = self.namespace.read().unwrap();
        namespace.get(db)?.get(key).cloned()
    }

    fn update(&self, db: &DatabaseId, key: &[u8], value: &[u8]) -> StorageResult {
        let mut namespace = self.namespace.write().unwrap();

        if value.len() > MAX_VALUE_SIZE {
            return StorageResult::ValueTooLarge;
        }

        match namespace.get_mut(db).and_then(|inner_db| inner_db.get_mut(key)) {
            Some(stored) => {
                *stored = value.to_vec();
                StorageResult::Ok
            }
            None => StorageResult::NotFound,
        }
    }

    fn remove(&self, db: &DatabaseId, key: &[u8]) -> StorageResult {
        let mut namespace = self.namespace.write().unwrap();

        match namespace.get_mut(db) {
            Some(inner_db) => {
                if inner_db.remove(key).is_some() {
                    StorageResult::Ok
                } else {
                    StorageResult::NotFound
                }
            }
            None => StorageResult::NotFound,
        }
    }

    fn remove_db(&self, db: &DatabaseId) -> StorageResult {
        let mut namespace = self.namespace.write().unwrap();

        if namespace.remove(db).is_some() {
            StorageResult::Ok
        } else {
            StorageResult::NotFound
        }
    }

    fn has(&self, db: &DatabaseId, key: &[u8]) -> bool {
        let namespace = self.namespace.read().unwrap();
        namespace.get(db).is_some_and(|inner_db| inner_db.contains_key(key))
    }

    fn get_keys(&self, db: &DatabaseId) -> Vec<Vec<u8>> {
        let namespace = self.namespace.read().unwrap();
        match namespace.get(db) {
            Some(inner_db) => inner_db.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    fn get_size(&self, db: &DatabaseId) -> DatabaseSize {
        let namespace = self.namespace.read().unwrap();
        match namespace.get(db) {
            Some(inner_db) => DatabaseSize {
                keys: inner_db.len() as u64,
                bytes: inner_db.values().map(|value| value.len() as u64).sum(),
            },
            None => DatabaseSize::default(),
        }
    }

    fn get_keys_starting_with(&self, db: &DatabaseId, prefix: &[u8]) -> Vec<Vec<u8>> {
        let namespace = self.namespace.read().unwrap();
        match namespace.get(db) {
            Some(inner_db) => inner_db
                .range(prefix.to_vec()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, _)| key.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    fn remove_range(&self, db: &DatabaseId, begin: &[u8], end: &[u8]) {
        if begin >= end {
            return;
        }

        let mut namespace = self.namespace.write().unwrap();

        if let Some(inner_db) = namespace.get_mut(db) {
            let doomed: Vec<Vec<u8>> = inner_db
                .range(begin.to_vec()..end.to_vec())
                .map(|(key, _)| key.clone())
                .collect();
            for key in doomed {
                inner_db.remove(&key);
            }
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

        let namespace = self.namespace.read().unwrap();
        let mut matches = Vec::new();
        if let Some(inner_db) = namespace.get(db) {
            for (key, value) in inner_db.range(start_key.to_vec()..) {
                if !end_key.is_empty() && key.as_slice() >= end_key.as_slice() {
                    break;
                }
                if key.len() >= fixed_size && regex.is_match(&key[fixed_size..]) {
                    matches.push((key.clone(), value.clone()));
                }
            }
        }

        matches
    }

    fn create_snapshot(&self) -> bool {
        let namespace = self.namespace.read().unwrap();
        let blob = snapshot::encode(&namespace);
        *self.latest_snapshot.lock().unwrap() = Some(blob);
        true
    }

    fn get_snapshot(&self) -> Option<Vec<u8>> {
        self.latest_snapshot.lock().unwrap().clone()
    }

    fn load_snapshot(&self, blob: &[u8]) -> bool {
        let loaded = match snapshot::decode(blob) {
            Some(namespace) => namespace,
            None => {
                log::warn!("rejecting snapshot that does not decode");
                return false;
            }
        };

        // Loading mutates the whole namespace, so it takes the exclusive lock.
        let mut namespace = self.namespace.write().unwrap();
        *namespace = loaded;
        *self.latest_snapshot.lock().unwrap() = Some(blob.to_vec());

        true
    }
}
