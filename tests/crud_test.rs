//! Tests of the CRUD service: database lifecycle, the owner/writer ACL, subscriptions, and state
//! capture.

mod common;

use std::sync::Arc;

use common::{caller_id, database_msg, signing_keys};
use common::sessions::TestSession;

use pbft_rs::crud::CrudService;
use pbft_rs::messages::{DatabaseMsgBody, DatabaseResponseBody};
use pbft_rs::session::SessionTable;
use pbft_rs::storage::{MemStorage, StorageEngine};
use pbft_rs::types::basic::DatabaseId;

fn perms_db() -> DatabaseId {
    DatabaseId::new("database_permissions")
}

struct Fixture {
    storage: Arc<dyn StorageEngine>,
    sessions: Arc<SessionTable>,
    crud: CrudService,
    owner: String,
    other: String,
}

impl Fixture {
    fn new() -> Fixture {
        let storage: Arc<dyn StorageEngine> = Arc::new(MemStorage::new());
        let sessions = Arc::new(SessionTable::new());
        let crud = CrudService::new(storage.clone(), perms_db(), sessions.clone());
        let keys = signing_keys(2);
        Fixture {
            storage,
            sessions,
            crud,
            owner: caller_id(&keys[0]),
            other: caller_id(&keys[1]),
        }
    }

    fn request(&self, caller: &str, body: DatabaseMsgBody) -> DatabaseResponseBody {
        self.crud
            .handle_request(caller, &database_msg("db1", 1, body), None)
            .body
    }
}

fn error(message: &str) -> DatabaseResponseBody {
    DatabaseResponseBody::Error {
        message: message.to_string(),
    }
}

#[test]
fn database_lifecycle() {
    let fixture = Fixture::new();

    assert_eq!(fixture.request(&fixture.owner, DatabaseMsgBody::HasDb), DatabaseResponseBody::Has { has: false });
    assert_eq!(fixture.request(&fixture.owner, DatabaseMsgBody::CreateDb), DatabaseResponseBody::Ack);
    assert_eq!(fixture.request(&fixture.owner, DatabaseMsgBody::CreateDb), error("database exists"));
    assert_eq!(fixture.request(&fixture.owner, DatabaseMsgBody::HasDb), DatabaseResponseBody::Has { has: true });

    fixture.request(&fixture.owner, DatabaseMsgBody::Create { key: b"k".to_vec(), value: b"v".to_vec() });
    assert_eq!(fixture.request(&fixture.other, DatabaseMsgBody::DeleteDb), error("access denied"));
    assert_eq!(fixture.request(&fixture.owner, DatabaseMsgBody::DeleteDb), DatabaseResponseBody::Ack);
    assert_eq!(fixture.request(&fixture.owner, DatabaseMsgBody::HasDb), DatabaseResponseBody::Has { has: false });
    assert!(fixture.storage.get_keys(&DatabaseId::new("db1")).is_empty());
}

#[test]
fn writes_require_an_existing_database() {
    let fixture = Fixture::new();
    assert_eq!(
        fixture.request(&fixture.owner, DatabaseMsgBody::Create { key: b"k".to_vec(), value: b"v".to_vec() }),
        error("database not found")
    );
}

#[test]
fn only_writers_may_mutate() {
    let fixture = Fixture::new();
    fixture.request(&fixture.owner, DatabaseMsgBody::CreateDb);

    assert_eq!(
        fixture.request(&fixture.other, DatabaseMsgBody::Create { key: b"k".to_vec(), value: b"v".to_vec() }),
        error("access denied")
    );

    // Reads are unrestricted.
    fixture.request(&fixture.owner, DatabaseMsgBody::Create { key: b"k".to_vec(), value: b"v".to_vec() });
    assert_eq!(
        fixture.request(&fixture.other, DatabaseMsgBody::Read { key: b"k".to_vec() }),
        DatabaseResponseBody::Value { value: Some(b"v".to_vec()) }
    );

    // Only the owner may extend the writer set; then the new writer may mutate.
    assert_eq!(
        fixture.request(&fixture.other, DatabaseMsgBody::AddWriters { writers: vec![fixture.other.clone()] }),
        error("access denied")
    );
    assert_eq!(
        fixture.request(&fixture.owner, DatabaseMsgBody::AddWriters { writers: vec![fixture.other.clone()] }),
        DatabaseResponseBody::Ack
    );
    assert_eq!(
        fixture.request(&fixture.other, DatabaseMsgBody::Update { key: b"k".to_vec(), value: b"v2".to_vec() }),
        DatabaseResponseBody::Ack
    );

    assert_eq!(
        fixture.request(&fixture.owner, DatabaseMsgBody::Writers),
        DatabaseResponseBody::Writers { owner: fixture.owner.clone(), writers: vec![fixture.other.clone()] }
    );

    assert_eq!(
        fixture.request(&fixture.owner, DatabaseMsgBody::RemoveWriters { writers: vec![fixture.other.clone()] }),
        DatabaseResponseBody::Ack
    );
    assert_eq!(
        fixture.request(&fixture.other, DatabaseMsgBody::Delete { key: b"k".to_vec() }),
        error("access denied")
    );
}

#[test]
fn the_owner_is_never_listed_as_a_writer() {
    let fixture = Fixture::new();
    fixture.request(&fixture.owner, DatabaseMsgBody::CreateDb);
    fixture.request(&fixture.owner, DatabaseMsgBody::AddWriters { writers: vec![fixture.owner.clone()] });
    assert_eq!(
        fixture.request(&fixture.owner, DatabaseMsgBody::Writers),
        DatabaseResponseBody::Writers { owner: fixture.owner.clone(), writers: Vec::new() }
    );
}

#[test]
fn storage_results_map_to_typed_responses() {
    let fixture = Fixture::new();
    fixture.request(&fixture.owner, DatabaseMsgBody::CreateDb);

    fixture.request(&fixture.owner, DatabaseMsgBody::Create { key: b"k".to_vec(), value: b"v".to_vec() });
    assert_eq!(
        fixture.request(&fixture.owner, DatabaseMsgBody::Create { key: b"k".to_vec(), value: b"v2".to_vec() }),
        error("record exists")
    );
    assert_eq!(
        fixture.request(&fixture.owner, DatabaseMsgBody::Update { key: b"missing".to_vec(), value: b"v".to_vec() }),
        error("record not found")
    );
    assert_eq!(
        fixture.request(&fixture.owner, DatabaseMsgBody::Delete { key: b"missing".to_vec() }),
        error("record not found")
    );
}

#[test]
fn reads_keys_and_size() {
    let fixture = Fixture::new();
    fixture.request(&fixture.owner, DatabaseMsgBody::CreateDb);
    fixture.request(&fixture.owner, DatabaseMsgBody::Create { key: b"a".to_vec(), value: b"12".to_vec() });
    fixture.request(&fixture.owner, DatabaseMsgBody::Create { key: b"b".to_vec(), value: b"345".to_vec() });

    assert_eq!(
        fixture.request(&fixture.other, DatabaseMsgBody::Has { key: b"a".to_vec() }),
        DatabaseResponseBody::Has { has: true }
    );
    assert_eq!(
        fixture.request(&fixture.other, DatabaseMsgBody::Keys),
        DatabaseResponseBody::Keys { keys: vec![b"a".to_vec(), b"b".to_vec()] }
    );
    assert_eq!(
        fixture.request(&fixture.other, DatabaseMsgBody::Size),
        DatabaseResponseBody::Size { keys: 2, bytes: 5 }
    );
    assert_eq!(
        fixture.request(&fixture.other, DatabaseMsgBody::Read { key: b"missing".to_vec() }),
        DatabaseResponseBody::Value { value: None }
    );
}

#[test]
fn null_requests_change_nothing() {
    let fixture = Fixture::new();
    assert_eq!(fixture.request(&fixture.owner, DatabaseMsgBody::Null), DatabaseResponseBody::Ack);
    assert!(fixture.storage.get_keys(&perms_db()).is_empty());
}

#[test]
fn subscribers_hear_about_commits() {
    let fixture = Fixture::new();
    fixture.request(&fixture.owner, DatabaseMsgBody::CreateDb);

    let session = Arc::new(TestSession::new());
    let session_id = fixture.sessions.insert(session.clone());
    fixture.crud.handle_request(
        &fixture.other,
        &database_msg("db1", 42, DatabaseMsgBody::Subscribe { key: b"k".to_vec() }),
        Some(session_id),
    );

    fixture.request(&fixture.owner, DatabaseMsgBody::Create { key: b"k".to_vec(), value: b"v1".to_vec() });
    fixture.request(&fixture.owner, DatabaseMsgBody::Update { key: b"k".to_vec(), value: b"v2".to_vec() });
    fixture.request(&fixture.owner, DatabaseMsgBody::Delete { key: b"k".to_vec() });

    let updates = session.responses();
    assert_eq!(updates.len(), 3);
    // Each update echoes the nonce the subscription was registered with.
    assert!(updates.iter().all(|update| update.header.nonce.int() == 42));
    assert_eq!(updates[0].body, DatabaseResponseBody::Value { value: Some(b"v1".to_vec()) });
    assert_eq!(updates[1].body, DatabaseResponseBody::Value { value: Some(b"v2".to_vec()) });
    assert_eq!(updates[2].body, DatabaseResponseBody::Value { value: None });

    // Changes to other keys are not reported.
    fixture.request(&fixture.owner, DatabaseMsgBody::Create { key: b"unrelated".to_vec(), value: b"v".to_vec() });
    assert_eq!(session.responses().len(), 3);
}

#[test]
fn unsubscribing_and_dead_sessions_stop_notifications() {
    let fixture = Fixture::new();
    fixture.request(&fixture.owner, DatabaseMsgBody::CreateDb);

    let subscriber = Arc::new(TestSession::new());
    let subscriber_id = fixture.sessions.insert(subscriber.clone());
    let quitter = Arc::new(TestSession::new());
    let quitter_id = fixture.sessions.insert(quitter.clone());

    for (id, nonce) in [(subscriber_id, 1), (quitter_id, 2)] {
        fixture.crud.handle_request(
            &fixture.other,
            &database_msg("db1", nonce, DatabaseMsgBody::Subscribe { key: b"k".to_vec() }),
            Some(id),
        );
    }

    fixture.crud.handle_request(
        &fixture.other,
        &database_msg("db1", 1, DatabaseMsgBody::Unsubscribe { key: b"k".to_vec() }),
        Some(subscriber_id),
    );
    quitter.close();

    fixture.request(&fixture.owner, DatabaseMsgBody::Create { key: b"k".to_vec(), value: b"v".to_vec() });
    assert!(subscriber.responses().is_empty());
    assert!(quitter.responses().is_empty());
}

#[test]
fn state_round_trips_through_save_and_load() {
    let fixture = Fixture::new();
    fixture.request(&fixture.owner, DatabaseMsgBody::CreateDb);
    fixture.request(&fixture.owner, DatabaseMsgBody::Create { key: b"k".to_vec(), value: b"v".to_vec() });

    assert!(fixture.crud.save_state());
    let state = fixture.crud.get_saved_state().unwrap();

    // Diverge, then restore. The ACL comes back along with the data.
    fixture.request(&fixture.owner, DatabaseMsgBody::AddWriters { writers: vec![fixture.other.clone()] });
    fixture.request(&fixture.owner, DatabaseMsgBody::Delete { key: b"k".to_vec() });
    assert!(fixture.crud.load_state(&state));

    assert_eq!(
        fixture.request(&fixture.other, DatabaseMsgBody::Read { key: b"k".to_vec() }),
        DatabaseResponseBody::Value { value: Some(b"v".to_vec()) }
    );
    assert_eq!(
        fixture.request(&fixture.owner, DatabaseMsgBody::Writers),
        DatabaseResponseBody::Writers { owner: fixture.owner.clone(), writers: Vec::new() }
    );
}
