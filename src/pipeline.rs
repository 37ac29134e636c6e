/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The execution pipeline: applies committed operations to the CRUD service in strict sequence
//! order.
//!
//! The pipeline's durable state is a single counter, `next_request_sequence`, plus one
//! accepted-for-apply record per committed operation that has not been executed yet, both stored
//! in the pipeline's own database. An operation arriving ahead of its turn waits in the log; an
//! operation arriving at its turn triggers a drain that executes every consecutively-numbered
//! waiting operation. Because the counter is persisted before an apply becomes visible, a
//! restarted replica resumes draining exactly where it stopped.
//!
//! The in-memory side table `operations_awaiting_result` remembers which live operation (and
//! therefore which client session) each pending sequence number belongs to. It is rebuilt
//! implicitly: after a restart the table is empty, so replayed operations are applied without a
//! response path, which is exactly what a crashed replica owes its clients.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use borsh::{BorshDeserialize, BorshSerialize};
use threadpool::ThreadPool;

use crate::crud::CrudService;
use crate::events::{ApplyOperationEvent, Event, InstallCheckpointEvent};
use crate::messages::{DatabaseMsg, Envelope};
use crate::operations::PersistentOperation;
use crate::session::{SessionId, SessionTable};
use crate::storage::{StorageEngine, StorageResult};
use crate::types::basic::{DatabaseId, SequenceNumber};

const NEXT_REQUEST_SEQUENCE_KEY: &str = "next_request_sequence";

/// The accepted-for-apply record of one committed operation. The caller id travels with the
/// request so that a replica replaying the record after a restart authorizes it exactly like the
/// replicas that never crashed.
#[derive(BorshSerialize, BorshDeserialize)]
struct AcceptedRequest {
    caller_id: String,
    request: DatabaseMsg,
}

/// Number of worker threads used to post responses and execute-handler notifications outside the
/// pipeline lock.
const RESPONSE_WORKERS: usize = 4;

/// Callback fired after an operation has been applied, with the operation that was executed. The
/// agreement layer registers this to observe execution (e.g. to trigger checkpoint proposals).
pub type ExecuteHandler = Arc<dyn Fn(Arc<PersistentOperation>) + Send + Sync>;

struct PipelineState {
    next_request_sequence: SequenceNumber,
    /// Sequence number at which the next checkpoint should be captured. Zero when no checkpoint
    /// is armed.
    next_checkpoint: SequenceNumber,
    /// Sequence number of the checkpoint most recently captured or installed.
    last_checkpoint: SequenceNumber,
    operations_awaiting_result: HashMap<u64, Arc<PersistentOperation>>,
}

pub struct ExecutionPipeline {
    storage: Arc<dyn StorageEngine>,
    crud: Arc<CrudService>,
    pipeline_db: DatabaseId,
    sessions: Arc<SessionTable>,
    workers: ThreadPool,
    state: Mutex<PipelineState>,
    execute_handler: Mutex<Option<ExecuteHandler>>,
    event_publisher: Mutex<Option<Sender<Event>>>,
}

impl ExecutionPipeline {
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        crud: Arc<CrudService>,
        pipeline_db: DatabaseId,
        sessions: Arc<SessionTable>,
        event_publisher: Option<Sender<Event>>,
    ) -> ExecutionPipeline {
        let next_request_sequence = load_next_request_sequence(storage.as_ref(), &pipeline_db);

        ExecutionPipeline {
            storage,
            crud,
            pipeline_db,
            sessions,
            workers: ThreadPool::new(RESPONSE_WORKERS),
            state: Mutex::new(PipelineState {
                next_request_sequence,
                next_checkpoint: SequenceNumber::new(0),
                last_checkpoint: SequenceNumber::new(0),
                operations_awaiting_result: HashMap::new(),
            }),
            execute_handler: Mutex::new(None),
            event_publisher: Mutex::new(event_publisher),
        }
    }

    /// Accept a committed operation for apply.
    ///
    /// The acceptance is persisted first; a duplicate acceptance is not an error, because a view
    /// change may re-commit operations that were already committed in earlier views. Then, if the
    /// operation's sequence number is in the past it is discarded, if it is in the future it
    /// waits, and if it is exactly the next one the drain loop runs.
    pub fn apply_operation(&self, op: Arc<PersistentOperation>) {
        let mut state = self.state.lock().unwrap();

        let sequence = op.get_sequence();
        // A committed operation that carried no database request still occupies its sequence
        // number; a null request fills the hole so the stream stays gapless.
        let accepted = AcceptedRequest {
            caller_id: op.get_request().sender_id(),
            request: if op.has_db_request() {
                op.get_database_msg()
            } else {
                DatabaseMsg::null()
            },
        };

        match self.storage.create(
            &self.pipeline_db,
            sequence.int().to_string().as_bytes(),
            &accepted.try_to_vec().unwrap(),
        ) {
            StorageResult::Ok => (),
            StorageResult::Exists => {
                log::warn!("operation {} was already accepted for apply, possible duplicate?", sequence)
            }
            other => panic!("failed to store accepted operation {}: {}", sequence, other),
        }

        if sequence < state.next_request_sequence {
            // Before a checkpoint we already installed, or already applied.
            log::debug!("discarding operation {} before next sequence {}", sequence, state.next_request_sequence);
            self.storage
                .remove(&self.pipeline_db, sequence.int().to_string().as_bytes());
            return;
        }

        // Store the requester's operation for the eventual response.
        state.operations_awaiting_result.insert(sequence.int(), op);

        self.process_awaiting_operations(&mut state);
    }

    /// Bypass the pipeline for a strict read-only request. Returns `true` and forwards to the
    /// CRUD service only for a quick read; any other request type returns `false` untouched, and
    /// the caller must route it through ordinary consensus.
    pub fn apply_operation_now(&self, msg: &Envelope, session: Option<SessionId>) -> bool {
        if let Some(db_msg) = msg.to_database_msg() {
            if db_msg.is_quick_read() {
                log::debug!("handling quick read");

                let response = self.crud.handle_request(&msg.sender_id(), &db_msg, session);
                if let Some(session_id) = session {
                    let sessions = self.sessions.clone();
                    self.workers.execute(move || {
                        sessions.deliver(session_id, Envelope::wrap_database_response(&response))
                    });
                }

                return true;
            }
        }

        false
    }

    /// Install a checkpoint: replace the service state with `data` and jump the pipeline to the
    /// sequence number after it. This is how a lagging replica catches up without replaying from
    /// genesis. Returns `false` (leaving the pipeline untouched) if the state blob is rejected.
    pub fn set_service_state(&self, sequence: SequenceNumber, data: &[u8]) -> bool {
        let mut state = self.state.lock().unwrap();

        if !self.crud.load_state(data) {
            return false;
        }
        state.last_checkpoint = sequence;

        // Remove all backlogged requests prior to the checkpoint.
        let mut seq = state.next_request_sequence;
        while seq <= sequence {
            self.storage
                .remove(&self.pipeline_db, seq.int().to_string().as_bytes());
            state.operations_awaiting_result.remove(&seq.int());
            seq += 1;
        }

        state.next_request_sequence = seq;
        self.save_next_request_sequence(&state);
        self.emit(Event::InstallCheckpoint(InstallCheckpointEvent {
            timestamp: SystemTime::now(),
            sequence,
        }));

        self.process_awaiting_operations(&mut state);
        true
    }

    /// The saved state blob for a checkpoint at `sequence`, if that is the checkpoint we hold.
    pub fn get_service_state(&self, sequence: SequenceNumber) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        if sequence == state.last_checkpoint {
            self.crud.get_saved_state()
        } else {
            None
        }
    }

    /// Arm a checkpoint: when the operation with this sequence number is applied, the CRUD
    /// service's state is captured.
    pub fn save_service_state_at(&self, sequence: SequenceNumber) {
        self.state.lock().unwrap().next_checkpoint = sequence;
    }

    /// How many requests this replica has applied so far.
    pub fn applied_requests_count(&self) -> u64 {
        self.state.lock().unwrap().next_request_sequence.int() - 1
    }

    pub fn register_execute_handler(&self, handler: ExecuteHandler) {
        *self.execute_handler.lock().unwrap() = Some(handler);
    }

    fn process_awaiting_operations(&self, state: &mut PipelineState) {
        loop {
            let next = state.next_request_sequence;
            let key = next.int().to_string();

            let Some(bytes) = self.storage.read(&self.pipeline_db, key.as_bytes()) else {
                break;
            };
            let accepted = AcceptedRequest::try_from_slice(&bytes)
                .unwrap_or_else(|_| panic!("stored request at sequence {} does not parse", next));

            log::info!("executing {} request at sequence {}", accepted.request.body.name(), next);

            let op = state.operations_awaiting_result.remove(&next.int());
            let session = match &op {
                Some(op) => op.session(),
                None => {
                    // No pending operation: this request was loaded from the log, probably after
                    // a restart, and its client is gone.
                    log::info!("we do not have a pending operation for sequence {}", next);
                    None
                }
            };

            let response = self
                .crud
                .handle_request(&accepted.caller_id, &accepted.request, session);
            self.emit(Event::ApplyOperation(ApplyOperationEvent {
                timestamp: SystemTime::now(),
                sequence: next,
            }));

            if let Some(session_id) = session {
                let sessions = self.sessions.clone();
                self.workers.execute(move || {
                    sessions.deliver(session_id, Envelope::wrap_database_response(&response))
                });
            }

            if let Some(op) = op {
                if let Some(handler) = self.execute_handler.lock().unwrap().clone() {
                    self.workers.execute(move || (*handler)(op));
                }
            }

            if !self.storage.remove(&self.pipeline_db, key.as_bytes()).is_ok() {
                panic!("failed to remove applied request {} from storage", next);
            }

            if next == state.next_checkpoint && self.crud.save_state() {
                state.last_checkpoint = next;
            }

            state.next_request_sequence += 1;
            self.save_next_request_sequence(state);
        }
    }

    fn save_next_request_sequence(&self, state: &PipelineState) {
        let result = self.storage.update(
            &self.pipeline_db,
            NEXT_REQUEST_SEQUENCE_KEY.as_bytes(),
            state.next_request_sequence.int().to_string().as_bytes(),
        );
        if !result.is_ok() {
            panic!("failed to save next_request_sequence: {}", result);
        }
        log::debug!("updated: next_request_sequence: {}", state.next_request_sequence);
    }

    fn emit(&self, event: Event) {
        if let Some(publisher) = self.event_publisher.lock().unwrap().as_ref() {
            let _ = publisher.send(event);
        }
    }
}

/// Read the persisted next sequence number, creating it (initialized to 1) on the first start over
/// this storage.
pub(crate) fn load_next_request_sequence(
    storage: &dyn StorageEngine,
    pipeline_db: &DatabaseId,
) -> SequenceNumber {
    if let Some(value) = storage.read(pipeline_db, NEXT_REQUEST_SEQUENCE_KEY.as_bytes()) {
        let parsed = String::from_utf8(value).ok().and_then(|value| value.parse().ok());
        let Some(next) = parsed else {
            panic!("stored next_request_sequence does not parse");
        };
        log::debug!("read: next_request_sequence: {}", next);
        return SequenceNumber::new(next);
    }

    let result = storage.create(pipeline_db, NEXT_REQUEST_SEQUENCE_KEY.as_bytes(), b"1");
    if !result.is_ok() {
        panic!("failed to create {}: {}", NEXT_REQUEST_SEQUENCE_KEY, result);
    }
    SequenceNumber::new(1)
}
