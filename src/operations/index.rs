/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The store of in-memory handles to persistent operations.
//!
//! The index is owned by the [agreement driver](crate::agreement) and guards its map with a mutex.
//! It keeps no authoritative state of its own: a record materializes on first reference, resuming
//! whatever the storage log already holds for its prefix, so a fresh index over the same storage
//! is equivalent to the one that was dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::storage::StorageEngine;
use crate::types::basic::{DatabaseId, RequestHash, SequenceNumber, ViewNumber};

use super::{key_for_sequence, OperationKey, PersistentOperation};

pub struct OperationIndex {
    storage: Arc<dyn StorageEngine>,
    operations_db: DatabaseId,
    peers_size: usize,
    held_operations: Mutex<HashMap<OperationKey, Arc<PersistentOperation>>>,
}

impl OperationIndex {
    pub fn new(storage: Arc<dyn StorageEngine>, operations_db: DatabaseId, peers_size: usize) -> OperationIndex {
        OperationIndex {
            storage,
            operations_db,
            peers_size,
            held_operations: Mutex::new(HashMap::new()),
        }
    }

    /// Look up the operation identified by `(view, sequence, request_hash)`, creating its record
    /// on first reference.
    pub fn find_or_construct(
        &self,
        view: ViewNumber,
        sequence: SequenceNumber,
        request_hash: RequestHash,
    ) -> Arc<PersistentOperation> {
        let mut held_operations = self.held_operations.lock().unwrap();

        let key = OperationKey {
            view,
            sequence,
            request_hash,
        };
        held_operations
            .entry(key)
            .or_insert_with(|| {
                log::debug!("creating operation for seq {} view {} req {}", sequence, view, request_hash);
                Arc::new(PersistentOperation::new(
                    view,
                    sequence,
                    request_hash,
                    self.storage.clone(),
                    self.operations_db.clone(),
                    self.peers_size,
                ))
            })
            .clone()
    }

    /// Drop every operation with a sequence number at or below `sequence`, in memory and in
    /// storage. This is what a checkpoint subsystem calls once the operations' effects are covered
    /// by a stable snapshot.
    pub fn delete_operations_until(&self, sequence: SequenceNumber) {
        let mut held_operations = self.held_operations.lock().unwrap();

        let before = held_operations.len();
        held_operations.retain(|_, op| op.get_sequence() > sequence);
        log::debug!("cleared {} old operation records", before - held_operations.len());

        self.storage.remove_range(
            &self.operations_db,
            key_for_sequence(SequenceNumber::new(0)).as_bytes(),
            key_for_sequence(sequence + 1).as_bytes(),
        );
    }

    /// The prepared operations with sequence numbers above `sequence`, at most one per sequence
    /// number. If there are multiple for a sequence number we return the one in the most recent
    /// view; there cannot be multiple prepared operations with distinct request hashes, because
    /// the conflicting pre-prepares would not have been accepted. This is what a view-change
    /// subsystem consumes.
    pub fn prepared_operations_since(&self, sequence: SequenceNumber) -> BTreeMap<SequenceNumber, Arc<PersistentOperation>> {
        let held_operations = self.held_operations.lock().unwrap();

        let mut result: BTreeMap<SequenceNumber, Arc<PersistentOperation>> = BTreeMap::new();
        for op in held_operations.values() {
            if op.get_sequence() > sequence && op.is_prepared() {
                match result.get(&op.get_sequence()) {
                    Some(existing) if existing.get_view() >= op.get_view() => {}
                    _ => {
                        result.insert(op.get_sequence(), op.clone());
                    }
                }
            }
        }

        result
    }

    pub fn held_operations_count(&self) -> usize {
        self.held_operations.lock().unwrap().len()
    }

    /// The highest sequence number any persisted operation record mentions. Because operation-log
    /// keys sort in sequence order, this is readable off the last key of the operations database.
    /// A primary resuming after a restart issues sequence numbers from here.
    pub fn highest_sequence(&self) -> Option<SequenceNumber> {
        let keys = self.storage.get_keys(&self.operations_db);
        let last = keys.last()?;
        let digits = std::str::from_utf8(last.get(..20)?).ok()?;
        digits.parse().ok().map(SequenceNumber::new)
    }
}
