/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The durable record of one PBFT agreement instance.
//!
//! ## Persistence
//!
//! All state lives in the operations database under the operation's prefix:
//! * `{prefix}_stage` → ASCII integer `{0, 1, 2}` for `{prepare, commit, execute}`,
//! * `{prefix}_request` → the serialized client envelope, once known,
//! * `{prefix}_{msg type}_{sender}` → the signed envelope carrying that sender's vote.
//!
//! There is no in-memory authoritative copy. The one transient piece of in-memory state is a
//! parsed copy of the request, which is rederivable from storage, and the id of the client session
//! waiting on the result, which deliberately does not survive a restart.
//!
//! ## Error bands
//!
//! Recording a message of an inappropriate type is rejected non-fatally. An illegal stage
//! transition, reading a request that was never recorded, or a storage-medium failure while
//! persisting a vote are protocol violations: the invariants of the replicated log can no longer
//! be trusted, so these panic out of the calling thread for the process supervisor to observe.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::messages::{ConfigMsg, DatabaseMsg, Envelope, PbftMsg, PbftMsgKind};
use crate::session::SessionId;
use crate::storage::{StorageEngine, StorageResult};
use crate::types::basic::{DatabaseId, RequestHash, SequenceNumber, ViewNumber};
use crate::types::peers::honest_majority_size;

use super::{generate_key, generate_prefix, OperationKey, OperationStage};

const STAGE_KEY: &str = "stage";
const REQUEST_KEY: &str = "request";

/// The parsed copy of the recorded request, cached so repeated accessors do not re-read storage.
struct TransientRequest {
    envelope: Envelope,
    database_msg: Option<DatabaseMsg>,
    config_msg: Option<ConfigMsg>,
}

/// One PBFT instance `(view, sequence, request hash)` with durable votes and stage.
pub struct PersistentOperation {
    view: ViewNumber,
    sequence: SequenceNumber,
    request_hash: RequestHash,
    peers_size: usize,
    storage: Arc<dyn StorageEngine>,
    operations_db: DatabaseId,
    prefix: String,
    transient_request: Mutex<Option<TransientRequest>>,
    session: Mutex<Option<SessionId>>,
}

impl PersistentOperation {
    /// Create the record, or resume the one already persisted under the same prefix.
    pub fn new(
        view: ViewNumber,
        sequence: SequenceNumber,
        request_hash: RequestHash,
        storage: Arc<dyn StorageEngine>,
        operations_db: DatabaseId,
        peers_size: usize,
    ) -> PersistentOperation {
        let prefix = generate_prefix(view, sequence, &request_hash.base64());

        let response = storage.create(
            &operations_db,
            generate_key(&prefix, STAGE_KEY).as_bytes(),
            OperationStage::Prepare.storage_value().as_bytes(),
        );
        match response {
            StorageResult::Ok => {
                log::info!("created persistent operation with prefix {}; this is our first record of it", prefix)
            }
            StorageResult::Exists => {
                log::info!("created persistent operation with prefix {}; using existing records", prefix)
            }
            other => panic!("failed to write stage of new persistent operation: {}", other),
        }

        PersistentOperation {
            view,
            sequence,
            request_hash,
            peers_size,
            storage,
            operations_db,
            prefix,
            transient_request: Mutex::new(None),
            session: Mutex::new(None),
        }
    }

    pub fn get_view(&self) -> ViewNumber {
        self.view
    }

    pub fn get_sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn get_request_hash(&self) -> &RequestHash {
        &self.request_hash
    }

    pub fn get_operation_key(&self) -> OperationKey {
        OperationKey {
            view: self.view,
            sequence: self.sequence,
            request_hash: self.request_hash,
        }
    }

    /// Store the id of a session that waits on the result of the operation (will not persist
    /// across crashes).
    pub fn set_session(&self, session: SessionId) {
        *self.session.lock().unwrap() = Some(session);
    }

    pub fn session(&self) -> Option<SessionId> {
        *self.session.lock().unwrap()
    }

    pub fn has_session(&self) -> bool {
        self.session.lock().unwrap().is_some()
    }

    /// Save a PBFT message about this operation. Only pre-prepares, prepares and commits can be
    /// recorded; a message of any other kind is rejected without effect. A duplicate from the same
    /// sender is silently ignored, so no `(type, sender)` pair is ever counted twice.
    pub fn record_pbft_msg(&self, msg: &PbftMsg, encoded_msg: &Envelope) {
        let typed_prefix = match msg.kind.storage_tag() {
            Some(tag) => self.typed_prefix(tag),
            None => {
                log::error!("tried to record a pbft message with inappropriate type: {}", msg.kind.name());
                return;
            }
        };

        let response = self.storage.create(
            &self.operations_db,
            generate_key(&typed_prefix, &encoded_msg.sender_id()).as_bytes(),
            &encoded_msg.try_to_vec().unwrap(),
        );
        match response {
            StorageResult::Ok => {
                log::debug!("saved {} from {} for operation {}", msg.kind.name(), encoded_msg.sender_id(), self.prefix)
            }
            StorageResult::Exists => {
                log::debug!("ignored duplicate {} from {} for operation {}", msg.kind.name(), encoded_msg.sender_id(), self.prefix)
            }
            other => panic!("failed to write pbft message: {}", other),
        }
    }

    /// Record the request that this operation is for. The caller is responsible for checking that
    /// the request's hash actually matches this operation's hash. Idempotent: once a request is
    /// known, further calls are no-ops.
    pub fn record_request(&self, encoded_request: &Envelope) {
        if self.transient_request.lock().unwrap().is_some() {
            log::debug!("ignoring record of request for operation {} because we already have one", self.prefix);
            return;
        }

        let response = self.storage.create(
            &self.operations_db,
            generate_key(&self.prefix, REQUEST_KEY).as_bytes(),
            &encoded_request.try_to_vec().unwrap(),
        );
        match response {
            StorageResult::Ok => log::debug!("recorded request for operation {}", self.prefix),
            StorageResult::Exists => {
                log::debug!("ignoring record of request for operation {} because we already have one", self.prefix)
            }
            other => panic!("failed to write request for operation {}: {}", self.prefix, other),
        }

        // This will allow future calls to record_request to short circuit.
        self.load_transient_request();
    }

    pub fn get_stage(&self) -> OperationStage {
        let response = self
            .storage
            .read(&self.operations_db, generate_key(&self.prefix, STAGE_KEY).as_bytes());
        let Some(value) = response else {
            panic!("failed to read stage of operation {} from storage", self.prefix);
        };
        String::from_utf8(value)
            .ok()
            .and_then(|value| OperationStage::from_storage_value(&value))
            .unwrap_or_else(|| panic!("stored stage of operation {} does not parse", self.prefix))
    }

    /// Advance the operation to the next stage, checking that doing so is legal. Stage movement is
    /// strictly `prepare → commit → execute`; any other transition is a protocol violation.
    pub fn advance_operation_stage(&self, new_stage: OperationStage) {
        match new_stage {
            OperationStage::Prepare => panic!("cannot advance to initial stage"),
            OperationStage::Commit => {
                if !self.is_preprepared() || self.get_stage() != OperationStage::Prepare {
                    panic!("illegal move to commit phase for operation {}", self.prefix);
                }
            }
            OperationStage::Execute => {
                if !self.is_committed() || self.get_stage() != OperationStage::Commit {
                    panic!("illegal move to execute phase for operation {}", self.prefix);
                }
            }
        }

        let response = self.storage.update(
            &self.operations_db,
            generate_key(&self.prefix, STAGE_KEY).as_bytes(),
            new_stage.storage_value().as_bytes(),
        );
        if !response.is_ok() {
            panic!("failed to write operation stage update: {}", response);
        }
    }

    /// Have we seen a pre-prepare for this operation?
    pub fn is_preprepared(&self) -> bool {
        !self.keys_of_kind(PbftMsgKind::PrePrepare).is_empty()
    }

    /// Is this operation prepared (as defined in the PBFT paper) at this node?
    pub fn is_prepared(&self) -> bool {
        self.keys_of_kind(PbftMsgKind::Prepare).len() >= honest_majority_size(self.peers_size)
            && self.is_preprepared()
            && self.has_request()
    }

    /// Is this operation committed-local (as defined in the PBFT paper) at this node?
    pub fn is_committed(&self) -> bool {
        self.keys_of_kind(PbftMsgKind::Commit).len() >= honest_majority_size(self.peers_size)
            && self.is_prepared()
    }

    /// Do we know the full request associated with this operation?
    pub fn has_request(&self) -> bool {
        self.load_transient_request();
        self.transient_request.lock().unwrap().is_some()
    }

    /// Do we know the full request, and is it a database request?
    pub fn has_db_request(&self) -> bool {
        self.load_transient_request();
        self.transient_request
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|transient| transient.database_msg.is_some())
    }

    /// Do we know the full request, and is it a cluster-configuration request?
    pub fn has_config_request(&self) -> bool {
        self.load_transient_request();
        self.transient_request
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|transient| transient.config_msg.is_some())
    }

    /// The signed envelope containing the request associated with this operation.
    ///
    /// # Panics
    ///
    /// Calling this without a recorded request is a programming error, and panics.
    pub fn get_request(&self) -> Envelope {
        self.load_transient_request();
        match self.transient_request.lock().unwrap().as_ref() {
            Some(transient) => transient.envelope.clone(),
            None => panic!("tried to get request of operation {}; we have no such request", self.prefix),
        }
    }

    /// The parsed database request associated with this operation.
    ///
    /// # Panics
    ///
    /// Calling this without a recorded database request is a programming error, and panics.
    pub fn get_database_msg(&self) -> DatabaseMsg {
        self.load_transient_request();
        match self
            .transient_request
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|transient| transient.database_msg.clone())
        {
            Some(database_msg) => database_msg,
            None => panic!("tried to get database request of operation {}; we have no such request", self.prefix),
        }
    }

    /// The parsed cluster-configuration request associated with this operation.
    ///
    /// # Panics
    ///
    /// Calling this without a recorded configuration request is a programming error, and panics.
    pub fn get_config_request(&self) -> ConfigMsg {
        self.load_transient_request();
        match self
            .transient_request
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|transient| transient.config_msg.clone())
        {
            Some(config_msg) => config_msg,
            None => panic!("tried to get config request of operation {}; we have no such request", self.prefix),
        }
    }

    /// The single canonical pre-prepare envelope. If more than one is present, the first in key
    /// order is chosen; duplicates cannot occur in a non-Byzantine run, and under Byzantine
    /// behavior the protocol layer detects the equivocation separately.
    pub fn get_preprepare(&self) -> Envelope {
        let keys = self.keys_of_kind(PbftMsgKind::PrePrepare);
        let Some(first) = keys.first() else {
            panic!("tried to fetch a preprepare that we don't have for operation {}", self.prefix);
        };

        self.storage
            .read(&self.operations_db, first)
            .and_then(|bytes| Envelope::try_from_slice(&bytes).ok())
            .unwrap_or_else(|| {
                panic!("failed to parse or fetch preprepare that we supposedly have? {}", self.prefix)
            })
    }

    /// All recorded prepares, as a mapping from sender peer-id to the signed envelope.
    pub fn get_prepares(&self) -> BTreeMap<String, Envelope> {
        let typed_prefix = self.typed_prefix(PbftMsgKind::Prepare.storage_tag().unwrap());
        let mut result = BTreeMap::new();

        for key in self.keys_of_kind(PbftMsgKind::Prepare) {
            let envelope = self
                .storage
                .read(&self.operations_db, &key)
                .and_then(|bytes| Envelope::try_from_slice(&bytes).ok())
                .unwrap_or_else(|| {
                    panic!("failed to parse or fetch prepare that we supposedly have? {}", self.prefix)
                });
            let sender = String::from_utf8_lossy(&key[typed_prefix.len() + 1..]).into_owned();
            result.insert(sender, envelope);
        }

        result
    }

    fn typed_prefix(&self, storage_tag: u8) -> String {
        format!("{}_{}", self.prefix, storage_tag)
    }

    fn keys_of_kind(&self, kind: PbftMsgKind) -> Vec<Vec<u8>> {
        let typed_prefix = self.typed_prefix(kind.storage_tag().unwrap());
        self.storage
            .get_keys_starting_with(&self.operations_db, typed_prefix.as_bytes())
    }

    fn load_transient_request(&self) {
        let mut transient = self.transient_request.lock().unwrap();
        if transient.is_some() {
            return;
        }

        let response = self
            .storage
            .read(&self.operations_db, generate_key(&self.prefix, REQUEST_KEY).as_bytes());
        let Some(bytes) = response else {
            return;
        };

        let envelope = Envelope::try_from_slice(&bytes)
            .unwrap_or_else(|_| panic!("stored request of operation {} does not parse", self.prefix));
        let database_msg = envelope.to_database_msg();
        let config_msg = envelope.to_config_msg();

        *transient = Some(TransientRequest {
            envelope,
            database_msg,
            config_msg,
        });
    }
}
