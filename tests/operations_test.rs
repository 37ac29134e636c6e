//! Tests of the durable operation record and the operation index: quorum accounting, stage
//! movement, idempotence, and crash resilience.

mod common;

use std::sync::Arc;

use common::{database_msg, signed_database_envelope, signed_pbft_envelope, signing_keys};
use ed25519_dalek::SigningKey;

use pbft_rs::messages::{DatabaseMsgBody, Envelope, PbftMsg, PbftMsgKind};
use pbft_rs::operations::{OperationIndex, OperationStage, PersistentOperation};
use pbft_rs::storage::{MemStorage, StorageEngine};
use pbft_rs::types::basic::{DatabaseId, RequestHash, SequenceNumber, ViewNumber};

fn ops_db() -> DatabaseId {
    DatabaseId::new("pbft_operations_data")
}

fn fresh_storage() -> Arc<dyn StorageEngine> {
    Arc::new(MemStorage::new())
}

/// A client request plus the four-replica cluster the scenarios below run against.
struct Fixture {
    storage: Arc<dyn StorageEngine>,
    replicas: Vec<SigningKey>,
    request: Envelope,
    request_hash: RequestHash,
}

impl Fixture {
    fn new() -> Fixture {
        let replicas = signing_keys(4);
        let client = SigningKey::from_bytes(&[7u8; 32]);
        let request = signed_database_envelope(
            &client,
            &database_msg("db1", 1, DatabaseMsgBody::Create { key: b"k".to_vec(), value: b"v".to_vec() }),
        );
        let request_hash = request.hash();
        Fixture {
            storage: fresh_storage(),
            replicas,
            request,
            request_hash,
        }
    }

    fn operation(&self) -> PersistentOperation {
        PersistentOperation::new(
            ViewNumber::new(0),
            SequenceNumber::new(1),
            self.request_hash,
            self.storage.clone(),
            ops_db(),
            self.replicas.len(),
        )
    }

    fn vote(&self, kind: PbftMsgKind) -> PbftMsg {
        PbftMsg {
            kind,
            view: ViewNumber::new(0),
            sequence: SequenceNumber::new(1),
            request_hash: self.request_hash,
            request: None,
        }
    }

    fn record_vote(&self, op: &PersistentOperation, kind: PbftMsgKind, replica: usize) {
        let msg = self.vote(kind);
        op.record_pbft_msg(&msg, &signed_pbft_envelope(&self.replicas[replica], &msg));
    }
}

#[test]
fn quorum_formation_with_four_peers() {
    let fixture = Fixture::new();
    let op = fixture.operation();

    fixture.record_vote(&op, PbftMsgKind::PrePrepare, 0);
    assert!(op.is_preprepared());
    assert!(!op.is_prepared());

    // honest_majority(4) = 3: two prepares are not enough.
    fixture.record_vote(&op, PbftMsgKind::Prepare, 0);
    fixture.record_vote(&op, PbftMsgKind::Prepare, 1);
    assert!(!op.is_prepared());

    fixture.record_vote(&op, PbftMsgKind::Prepare, 2);
    op.record_request(&fixture.request);
    assert!(op.is_prepared());
    assert!(!op.is_committed());

    fixture.record_vote(&op, PbftMsgKind::Commit, 0);
    fixture.record_vote(&op, PbftMsgKind::Commit, 1);
    assert!(!op.is_committed());
    fixture.record_vote(&op, PbftMsgKind::Commit, 2);
    assert!(op.is_committed());
}

#[test]
fn a_quorum_needs_distinct_senders() {
    let fixture = Fixture::new();
    let op = fixture.operation();

    fixture.record_vote(&op, PbftMsgKind::PrePrepare, 0);
    op.record_request(&fixture.request);

    // The same prepare recorded three times still counts once.
    fixture.record_vote(&op, PbftMsgKind::Prepare, 0);
    fixture.record_vote(&op, PbftMsgKind::Prepare, 0);
    fixture.record_vote(&op, PbftMsgKind::Prepare, 0);
    fixture.record_vote(&op, PbftMsgKind::Prepare, 1);
    assert!(!op.is_prepared());

    fixture.record_vote(&op, PbftMsgKind::Prepare, 2);
    assert!(op.is_prepared());
}

#[test]
fn prepares_without_a_request_do_not_prepare() {
    let fixture = Fixture::new();
    let op = fixture.operation();

    fixture.record_vote(&op, PbftMsgKind::PrePrepare, 0);
    for replica in 0..3 {
        fixture.record_vote(&op, PbftMsgKind::Prepare, replica);
    }
    assert!(!op.is_prepared());

    op.record_request(&fixture.request);
    assert!(op.is_prepared());
}

#[test]
fn stages_move_forward_one_at_a_time() {
    let fixture = Fixture::new();
    let op = fixture.operation();
    assert_eq!(op.get_stage(), OperationStage::Prepare);

    fixture.record_vote(&op, PbftMsgKind::PrePrepare, 0);
    op.record_request(&fixture.request);
    for replica in 0..3 {
        fixture.record_vote(&op, PbftMsgKind::Prepare, replica);
    }
    op.advance_operation_stage(OperationStage::Commit);
    assert_eq!(op.get_stage(), OperationStage::Commit);

    for replica in 0..3 {
        fixture.record_vote(&op, PbftMsgKind::Commit, replica);
    }
    op.advance_operation_stage(OperationStage::Execute);
    assert_eq!(op.get_stage(), OperationStage::Execute);
}

#[test]
#[should_panic(expected = "cannot advance to initial stage")]
fn regressing_to_the_initial_stage_is_fatal() {
    let fixture = Fixture::new();
    let op = fixture.operation();
    op.advance_operation_stage(OperationStage::Prepare);
}

#[test]
#[should_panic(expected = "illegal move to commit phase")]
fn advancing_without_a_preprepare_is_fatal() {
    let fixture = Fixture::new();
    let op = fixture.operation();
    op.advance_operation_stage(OperationStage::Commit);
}

#[test]
#[should_panic(expected = "illegal move to execute phase")]
fn skipping_the_commit_stage_is_fatal() {
    let fixture = Fixture::new();
    let op = fixture.operation();
    fixture.record_vote(&op, PbftMsgKind::PrePrepare, 0);
    op.advance_operation_stage(OperationStage::Execute);
}

#[test]
fn inappropriate_message_kinds_are_rejected_without_effect() {
    let fixture = Fixture::new();
    let op = fixture.operation();

    let msg = fixture.vote(PbftMsgKind::Checkpoint);
    op.record_pbft_msg(&msg, &signed_pbft_envelope(&fixture.replicas[0], &msg));
    let msg = fixture.vote(PbftMsgKind::ViewChange);
    op.record_pbft_msg(&msg, &signed_pbft_envelope(&fixture.replicas[0], &msg));

    assert!(!op.is_preprepared());
    assert_eq!(op.get_stage(), OperationStage::Prepare);
}

#[test]
fn the_request_is_write_once() {
    let fixture = Fixture::new();
    let op = fixture.operation();

    op.record_request(&fixture.request);

    let client = SigningKey::from_bytes(&[9u8; 32]);
    let other_request = signed_database_envelope(
        &client,
        &database_msg("db1", 2, DatabaseMsgBody::Delete { key: b"k".to_vec() }),
    );
    op.record_request(&other_request);

    assert_eq!(op.get_request(), fixture.request);
}

#[test]
#[should_panic(expected = "we have no such request")]
fn reading_an_unrecorded_request_is_fatal() {
    let fixture = Fixture::new();
    let op = fixture.operation();
    op.get_request();
}

#[test]
fn request_kind_accessors() {
    let fixture = Fixture::new();
    let op = fixture.operation();
    assert!(!op.has_request());
    assert!(!op.has_db_request());
    assert!(!op.has_config_request());

    op.record_request(&fixture.request);
    assert!(op.has_request());
    assert!(op.has_db_request());
    assert!(!op.has_config_request());
    assert_eq!(op.get_database_msg().header.db_uuid, DatabaseId::new("db1"));
}

#[test]
fn prepares_are_keyed_by_sender() {
    let fixture = Fixture::new();
    let op = fixture.operation();

    fixture.record_vote(&op, PbftMsgKind::PrePrepare, 0);
    fixture.record_vote(&op, PbftMsgKind::Prepare, 1);
    fixture.record_vote(&op, PbftMsgKind::Prepare, 2);

    let prepares = op.get_prepares();
    assert_eq!(prepares.len(), 2);
    for replica in [1, 2] {
        let sender = common::caller_id(&fixture.replicas[replica]);
        assert!(prepares.contains_key(&sender), "missing prepare from {}", sender);
    }

    let preprepare = op.get_preprepare();
    assert_eq!(preprepare.sender_id(), common::caller_id(&fixture.replicas[0]));
}

#[test]
fn a_restarted_record_answers_identically() {
    let fixture = Fixture::new();
    {
        let op = fixture.operation();
        fixture.record_vote(&op, PbftMsgKind::PrePrepare, 0);
        op.record_request(&fixture.request);
        for replica in 0..3 {
            fixture.record_vote(&op, PbftMsgKind::Prepare, replica);
        }
        op.advance_operation_stage(OperationStage::Commit);
        fixture.record_vote(&op, PbftMsgKind::Commit, 0);
        fixture.record_vote(&op, PbftMsgKind::Commit, 1);
    }

    // Same storage, fresh record: the in-memory handle held nothing authoritative.
    let op = fixture.operation();
    assert!(op.is_preprepared());
    assert!(op.is_prepared());
    assert!(!op.is_committed());
    assert_eq!(op.get_stage(), OperationStage::Commit);
    assert!(op.has_request());
    assert_eq!(op.get_request(), fixture.request);
    assert_eq!(op.get_prepares().len(), 3);

    // One more commit completes the quorum the restart interrupted.
    fixture.record_vote(&op, PbftMsgKind::Commit, 2);
    assert!(op.is_committed());
}

/* ↓↓↓ Operation index ↓↓↓ */

#[test]
fn the_index_hands_out_one_record_per_operation() {
    let fixture = Fixture::new();
    let index = OperationIndex::new(fixture.storage.clone(), ops_db(), 4);

    let a = index.find_or_construct(ViewNumber::new(0), SequenceNumber::new(1), fixture.request_hash);
    let b = index.find_or_construct(ViewNumber::new(0), SequenceNumber::new(1), fixture.request_hash);
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(index.held_operations_count(), 1);

    index.find_or_construct(ViewNumber::new(0), SequenceNumber::new(2), fixture.request_hash);
    assert_eq!(index.held_operations_count(), 2);
}

#[test]
fn deleting_until_a_sequence_clears_memory_and_storage() {
    let fixture = Fixture::new();
    let index = OperationIndex::new(fixture.storage.clone(), ops_db(), 4);

    for sequence in 1..=3u64 {
        let op = index.find_or_construct(ViewNumber::new(0), SequenceNumber::new(sequence), fixture.request_hash);
        let msg = PbftMsg {
            kind: PbftMsgKind::PrePrepare,
            view: ViewNumber::new(0),
            sequence: SequenceNumber::new(sequence),
            request_hash: fixture.request_hash,
            request: None,
        };
        op.record_pbft_msg(&msg, &signed_pbft_envelope(&fixture.replicas[0], &msg));
    }
    assert_eq!(index.highest_sequence(), Some(SequenceNumber::new(3)));

    index.delete_operations_until(SequenceNumber::new(2));
    assert_eq!(index.held_operations_count(), 1);

    // Only sequence 3's records remain in the log.
    let remaining = fixture.storage.get_keys(&ops_db());
    assert!(!remaining.is_empty());
    for key in remaining {
        assert!(key.starts_with(b"00000000000000000003"));
    }
    assert_eq!(index.highest_sequence(), Some(SequenceNumber::new(3)));
}

#[test]
fn prepared_operations_are_reported_for_view_change() {
    let fixture = Fixture::new();
    let index = OperationIndex::new(fixture.storage.clone(), ops_db(), 4);

    // Sequence 2 reaches prepared; sequence 3 only gets a pre-prepare.
    let prepared = index.find_or_construct(ViewNumber::new(0), SequenceNumber::new(2), fixture.request_hash);
    for (kind, replica) in [
        (PbftMsgKind::PrePrepare, 0),
        (PbftMsgKind::Prepare, 0),
        (PbftMsgKind::Prepare, 1),
        (PbftMsgKind::Prepare, 2),
    ] {
        let msg = PbftMsg {
            kind,
            view: ViewNumber::new(0),
            sequence: SequenceNumber::new(2),
            request_hash: fixture.request_hash,
            request: None,
        };
        prepared.record_pbft_msg(&msg, &signed_pbft_envelope(&fixture.replicas[replica], &msg));
    }
    prepared.record_request(&fixture.request);

    let unprepared = index.find_or_construct(ViewNumber::new(0), SequenceNumber::new(3), fixture.request_hash);
    let msg = PbftMsg {
        kind: PbftMsgKind::PrePrepare,
        view: ViewNumber::new(0),
        sequence: SequenceNumber::new(3),
        request_hash: fixture.request_hash,
        request: None,
    };
    unprepared.record_pbft_msg(&msg, &signed_pbft_envelope(&fixture.replicas[0], &msg));

    let since_genesis = index.prepared_operations_since(SequenceNumber::new(0));
    assert_eq!(since_genesis.len(), 1);
    assert!(since_genesis.contains_key(&SequenceNumber::new(2)));

    assert!(index.prepared_operations_since(SequenceNumber::new(2)).is_empty());
}
