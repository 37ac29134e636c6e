/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The agreement driver: the dispatcher between the transport and the operation records.
//!
//! The driver's contract is narrow. An inbound PBFT message is routed to the operation record it
//! concerns (creating the record on first reference); an inbound client request is either turned
//! into a pre-prepare (on the primary) or forwarded to the primary. After any record update the
//! driver re-evaluates the operation's stage, advancing `prepare → commit` when the operation
//! first becomes prepared and `commit → execute` when it first becomes committed, and hands
//! operations entering `execute` to the [execution pipeline](crate::pipeline).
//!
//! Every vote this replica casts (its pre-prepare as primary, its prepares and commits as a
//! backup) is recorded durably in the operation log *before* it is broadcast, so a restart
//! cannot un-say anything the cluster may already have heard.
//!
//! The driver keeps no authoritative state beyond its [operation index](crate::operations): the
//! accepted-pre-prepare table guards against equivocating primaries, and the forwarded-session
//! table remembers which client is waiting on a request this backup forwarded to the primary.
//! Both are advisory and empty after a restart.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use ed25519_dalek::VerifyingKey;

use crate::events::{
    AdvanceStageEvent, CommitEvent, Event, PrepareEvent, ReceiveCommitEvent, ReceivePrePrepareEvent,
    ReceivePrepareEvent,
};
use crate::messages::{Envelope, Payload, PbftMsg, PbftMsgKind};
use crate::networking::{Network, NetworkHandle};
use crate::operations::{OperationIndex, OperationKey, OperationStage, PersistentOperation};
use crate::pipeline::ExecutionPipeline;
use crate::session::SessionId;
use crate::storage::StorageEngine;
use crate::types::basic::{DatabaseId, RequestHash, SequenceNumber, ViewNumber};
use crate::types::keypair::Keypair;
use crate::types::peers::PeerSet;

pub struct AgreementDriver<N: Network> {
    index: OperationIndex,
    pipeline: Arc<ExecutionPipeline>,
    keypair: Keypair,
    peers: PeerSet,
    view: ViewNumber,
    // Serializes message handler bodies. Quorum checks and stage advancement are check-then-act
    // over storage; two handlers interleaving on the same operation could both observe the
    // enabling condition and advance twice. The lock is never held across blocking I/O:
    // Network::send and Network::broadcast are non-blocking by contract.
    handler_lock: Mutex<()>,
    next_issued_sequence: Mutex<SequenceNumber>,
    // (view, sequence) → the operation whose pre-prepare we accepted. At most one request hash is
    // ever accepted per slot; a conflicting pre-prepare is an equivocating primary.
    accepted_preprepares: Mutex<HashMap<(u64, u64), OperationKey>>,
    // Clients whose requests we forwarded to the primary, waiting for the pre-prepare to come
    // back so their session can be attached to the operation.
    sessions_waiting_on_forwarded_requests: Mutex<HashMap<RequestHash, SessionId>>,
    network: Mutex<NetworkHandle<N>>,
    event_publisher: Mutex<Option<Sender<Event>>>,
}

impl<N: Network> AgreementDriver<N> {
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        operations_db: DatabaseId,
        pipeline: Arc<ExecutionPipeline>,
        keypair: Keypair,
        peers: PeerSet,
        view: ViewNumber,
        network: N,
        event_publisher: Option<Sender<Event>>,
    ) -> AgreementDriver<N> {
        let index = OperationIndex::new(storage, operations_db, peers.len());

        // A primary resuming over an existing log must not reuse sequence numbers it already
        // assigned. The log's prefix ordering makes its highest sequence cheap to find.
        let next_issued_sequence = index
            .highest_sequence()
            .map(|sequence| sequence + 1)
            .unwrap_or(SequenceNumber::new(1));

        AgreementDriver {
            index,
            pipeline,
            keypair,
            peers,
            view,
            handler_lock: Mutex::new(()),
            next_issued_sequence: Mutex::new(next_issued_sequence),
            accepted_preprepares: Mutex::new(HashMap::new()),
            sessions_waiting_on_forwarded_requests: Mutex::new(HashMap::new()),
            network: Mutex::new(NetworkHandle::new(network)),
            event_publisher: Mutex::new(event_publisher),
        }
    }

    pub fn current_view(&self) -> ViewNumber {
        self.view
    }

    pub fn primary(&self) -> VerifyingKey {
        self.peers.primary(self.view)
    }

    pub fn is_primary(&self) -> bool {
        self.primary() == self.keypair.public()
    }

    /// Route one decoded, signature-checked envelope. `session` is the id of the client session
    /// it arrived on, if it arrived on one.
    pub fn handle_message(&self, envelope: Envelope, session: Option<SessionId>) {
        let _guard = self.handler_lock.lock().unwrap();

        match &envelope.payload {
            Payload::PbftMsg(_) => match envelope.to_pbft_msg() {
                Some(msg) => self.handle_pbft_msg(msg, envelope),
                None => log::warn!("dropping pbft message that does not parse"),
            },
            Payload::DatabaseMsg(_) | Payload::PbftInternalRequest(_) => {
                self.handle_client_request(envelope, session)
            }
            Payload::DatabaseResponse(_) => {
                log::warn!("no handler for inbound database response; dropping")
            }
        }
    }

    fn handle_pbft_msg(&self, msg: PbftMsg, envelope: Envelope) {
        match msg.kind {
            PbftMsgKind::PrePrepare => self.handle_preprepare(&msg, &envelope),
            PbftMsgKind::Prepare => self.handle_prepare(&msg, &envelope),
            PbftMsgKind::Commit => self.handle_commit(&msg, &envelope),
            other => log::warn!("no handler for pbft message type {}; dropping", other.name()),
        }
    }

    /// A client request envelope. On the primary this starts a new agreement instance; on a
    /// backup it is forwarded to the primary.
    fn handle_client_request(&self, envelope: Envelope, session: Option<SessionId>) {
        let request_hash = envelope.hash();

        if !self.is_primary() {
            log::debug!("forwarding client request {} to the primary", request_hash);
            if let Some(session) = session {
                self.sessions_waiting_on_forwarded_requests
                    .lock()
                    .unwrap()
                    .insert(request_hash, session);
            }
            self.network.lock().unwrap().send(self.primary(), envelope);
            return;
        }

        let sequence = {
            let mut next = self.next_issued_sequence.lock().unwrap();
            let sequence = *next;
            *next += 1;
            sequence
        };

        let op = self.index.find_or_construct(self.view, sequence, request_hash);
        op.record_request(&envelope);
        if let Some(session) = session {
            op.set_session(session);
        }

        self.do_preprepare(&op, envelope);
    }

    /// Propose the operation to the cluster. Our own pre-prepare is processed locally first, which
    /// records it durably before any other replica can hear of it.
    fn do_preprepare(&self, op: &Arc<PersistentOperation>, request: Envelope) {
        log::debug!("doing preprepare for operation {}", op.get_sequence());

        let msg = PbftMsg {
            kind: PbftMsgKind::PrePrepare,
            view: op.get_view(),
            sequence: op.get_sequence(),
            request_hash: *op.get_request_hash(),
            request: Some(request),
        };
        let encoded = self.wrap_message(&msg);

        self.handle_preprepare(&msg, &encoded);
        self.network.lock().unwrap().broadcast(encoded);
    }

    fn handle_preprepare(&self, msg: &PbftMsg, envelope: &Envelope) {
        // If we've already accepted a pre-prepare for this (view, sequence) and it's not this
        // one, reject it. Getting the same pre-prepare more than once is fine.
        let log_key = (msg.view.int(), msg.sequence.int());
        if let Some(accepted) = self.accepted_preprepares.lock().unwrap().get(&log_key) {
            if accepted.request_hash != msg.request_hash {
                log::debug!("rejecting preprepare because I've already accepted a conflicting one");
                return;
            }
        }

        let op = self.index.find_or_construct(msg.view, msg.sequence, msg.request_hash);
        op.record_pbft_msg(msg, envelope);
        self.maybe_record_request(msg, &op);

        // This assignment will be redundant if we've seen this pre-prepare before, but that's
        // fine.
        self.accepted_preprepares
            .lock()
            .unwrap()
            .insert(log_key, op.get_operation_key());

        if let Some(session) = self
            .sessions_waiting_on_forwarded_requests
            .lock()
            .unwrap()
            .remove(&msg.request_hash)
        {
            if !op.has_session() {
                op.set_session(session);
            }
        }

        self.emit(Event::ReceivePrePrepare(ReceivePrePrepareEvent {
            timestamp: SystemTime::now(),
            origin: envelope.sender_id(),
            view: msg.view,
            sequence: msg.sequence,
            request_hash: msg.request_hash,
        }));

        self.do_preprepared(&op);
        self.maybe_advance_operation_state(&op);
    }

    /// We have a pre-prepare for the operation: cast our own prepare vote. Re-broadcasting on a
    /// duplicate pre-prepare is harmless; the durable record ignores the duplicate vote.
    fn do_preprepared(&self, op: &Arc<PersistentOperation>) {
        log::debug!("entering prepare phase for operation {}", op.get_sequence());

        let msg = self.common_message_setup(op, PbftMsgKind::Prepare);
        let encoded = self.wrap_message(&msg);
        op.record_pbft_msg(&msg, &encoded);
        self.network.lock().unwrap().broadcast(encoded);

        self.emit(Event::Prepare(PrepareEvent {
            timestamp: SystemTime::now(),
            view: msg.view,
            sequence: msg.sequence,
            request_hash: msg.request_hash,
        }));
    }

    fn handle_prepare(&self, msg: &PbftMsg, envelope: &Envelope) {
        // Prepare messages are never rejected, assuming the sanity checks passed.
        let op = self.index.find_or_construct(msg.view, msg.sequence, msg.request_hash);
        op.record_pbft_msg(msg, envelope);
        self.maybe_record_request(msg, &op);

        self.emit(Event::ReceivePrepare(ReceivePrepareEvent {
            timestamp: SystemTime::now(),
            origin: envelope.sender_id(),
            view: msg.view,
            sequence: msg.sequence,
            request_hash: msg.request_hash,
        }));

        self.maybe_advance_operation_state(&op);
    }

    fn handle_commit(&self, msg: &PbftMsg, envelope: &Envelope) {
        // Commit messages are never rejected, assuming the sanity checks passed.
        let op = self.index.find_or_construct(msg.view, msg.sequence, msg.request_hash);
        op.record_pbft_msg(msg, envelope);
        self.maybe_record_request(msg, &op);

        self.emit(Event::ReceiveCommit(ReceiveCommitEvent {
            timestamp: SystemTime::now(),
            origin: envelope.sender_id(),
            view: msg.view,
            sequence: msg.sequence,
            request_hash: msg.request_hash,
        }));

        self.maybe_advance_operation_state(&op);
    }

    fn maybe_record_request(&self, msg: &PbftMsg, op: &Arc<PersistentOperation>) {
        if let Some(request) = &msg.request {
            if !op.has_request() {
                if request.hash() != msg.request_hash {
                    log::info!("not recording request because its hash does not match");
                    return;
                }
                op.record_request(request);
            }
        }
    }

    /// Advance the operation's stage if a quorum has formed. A replica may observe the enabling
    /// condition many times; the stage checks make each advance happen exactly once.
    fn maybe_advance_operation_state(&self, op: &Arc<PersistentOperation>) {
        if op.get_stage() == OperationStage::Prepare && op.is_prepared() {
            self.do_prepared(op);
        }

        if op.get_stage() == OperationStage::Commit && op.is_committed() {
            self.do_committed(op);
        }
    }

    /// The operation is prepared: advance to the commit stage and cast our commit vote.
    fn do_prepared(&self, op: &Arc<PersistentOperation>) {
        log::debug!("entering commit phase for operation {}", op.get_sequence());
        op.advance_operation_stage(OperationStage::Commit);
        self.emit(Event::AdvanceStage(AdvanceStageEvent {
            timestamp: SystemTime::now(),
            sequence: op.get_sequence(),
            stage: OperationStage::Commit,
        }));

        let msg = self.common_message_setup(op, PbftMsgKind::Commit);
        let encoded = self.wrap_message(&msg);
        op.record_pbft_msg(&msg, &encoded);
        self.network.lock().unwrap().broadcast(encoded);

        self.emit(Event::Commit(CommitEvent {
            timestamp: SystemTime::now(),
            view: msg.view,
            sequence: msg.sequence,
            request_hash: msg.request_hash,
        }));
    }

    /// The operation is committed-local: advance to the execute stage and hand it to the
    /// pipeline.
    fn do_committed(&self, op: &Arc<PersistentOperation>) {
        log::debug!("operation {} is committed-local", op.get_sequence());
        op.advance_operation_stage(OperationStage::Execute);
        self.emit(Event::AdvanceStage(AdvanceStageEvent {
            timestamp: SystemTime::now(),
            sequence: op.get_sequence(),
            stage: OperationStage::Execute,
        }));

        self.pipeline.apply_operation(op.clone());
    }

    fn common_message_setup(&self, op: &Arc<PersistentOperation>, kind: PbftMsgKind) -> PbftMsg {
        PbftMsg {
            kind,
            view: op.get_view(),
            sequence: op.get_sequence(),
            request_hash: *op.get_request_hash(),
            request: None,
        }
    }

    fn wrap_message(&self, msg: &PbftMsg) -> Envelope {
        let mut envelope = Envelope::wrap_pbft_msg(msg);
        envelope.sign(&self.keypair);
        envelope
    }

    fn emit(&self, event: Event) {
        if let Some(publisher) = self.event_publisher.lock().unwrap().as_ref() {
            let _ = publisher.send(event);
        }
    }

    /* ↓↓↓ Accessors for the subsystems that consume the log's invariants ↓↓↓ */

    /// Drop every operation with a sequence number at or below `sequence`. Called by a checkpoint
    /// subsystem once a stable snapshot covers them.
    pub fn delete_operations_until(&self, sequence: SequenceNumber) {
        self.index.delete_operations_until(sequence)
    }

    /// The prepared operations above `sequence`, one per sequence number. Consumed by a
    /// view-change subsystem.
    pub fn prepared_operations_since(
        &self,
        sequence: SequenceNumber,
    ) -> std::collections::BTreeMap<SequenceNumber, Arc<PersistentOperation>> {
        self.index.prepared_operations_since(sequence)
    }

    pub fn held_operations_count(&self) -> usize {
        self.index.held_operations_count()
    }
}
