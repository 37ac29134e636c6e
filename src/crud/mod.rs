//! The CRUD service: authorized key-value operations on named databases.
//!
//! The [execution pipeline](crate::pipeline) drives this service with consensus-ordered requests;
//! quick reads reach it directly, bypassing the log. The service itself holds no state of its own:
//! user data and per-database permissions both live in the [storage engine](crate::storage), whose
//! readers-writer lock provides the single-writer / multi-reader discipline.
//!
//! ## Permissions
//!
//! Every database has exactly one owner (the caller that created it) and a set of writers. Only
//! the owner may change the writer set or delete the database; mutations require the caller to be
//! the owner or a writer; reads are unrestricted.

pub(crate) mod subscriptions;

use std::sync::Arc;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::messages::{DatabaseMsg, DatabaseMsgBody, DatabaseResponse, DatabaseResponseBody};
use crate::session::{SessionId, SessionTable};
use crate::storage::{StorageEngine, StorageResult};
use crate::types::basic::DatabaseId;

use subscriptions::SubscriptionManager;

const ACCESS_DENIED: &str = "access denied";
const DATABASE_EXISTS: &str = "database exists";
const DATABASE_NOT_FOUND: &str = "database not found";

/// The permissions record of one database, stored in the permissions database under the database's
/// id.
#[derive(Clone, PartialEq, BorshSerialize, BorshDeserialize)]
struct DbPermissions {
    owner: String,
    writers: Vec<String>,
}

impl DbPermissions {
    fn is_owner(&self, caller_id: &str) -> bool {
        self.owner == caller_id
    }

    fn is_writer(&self, caller_id: &str) -> bool {
        self.is_owner(caller_id) || self.writers.iter().any(|writer| writer == caller_id)
    }
}

pub struct CrudService {
    storage: Arc<dyn StorageEngine>,
    permissions_db: DatabaseId,
    subscription_manager: SubscriptionManager,
}

impl CrudService {
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        permissions_db: DatabaseId,
        sessions: Arc<SessionTable>,
    ) -> CrudService {
        CrudService {
            storage,
            permissions_db,
            subscription_manager: SubscriptionManager::new(sessions),
        }
    }

    /// Apply a decoded database request on behalf of `caller_id` and build the response. The
    /// caller id is the textual identity of the client that signed the request envelope; requests
    /// replayed from the log after a restart carry an empty caller id and are applied without a
    /// session.
    pub fn handle_request(
        &self,
        caller_id: &str,
        request: &DatabaseMsg,
        session: Option<SessionId>,
    ) -> DatabaseResponse {
        let db = &request.header.db_uuid;

        let body = match &request.body {
            DatabaseMsgBody::CreateDb => self.handle_create_db(caller_id, db),
            DatabaseMsgBody::DeleteDb => self.handle_delete_db(caller_id, db),
            DatabaseMsgBody::HasDb => DatabaseResponseBody::Has {
                has: self.get_database_permissions(db).is_some(),
            },
            DatabaseMsgBody::Create { key, value } => self.handle_create(caller_id, db, key, value),
            DatabaseMsgBody::Read { key } | DatabaseMsgBody::QuickRead { key } => {
                DatabaseResponseBody::Value {
                    value: self.storage.read(db, key),
                }
            }
            DatabaseMsgBody::Update { key, value } => self.handle_update(caller_id, db, key, value),
            DatabaseMsgBody::Delete { key } => self.handle_delete(caller_id, db, key),
            DatabaseMsgBody::Has { key } => DatabaseResponseBody::Has {
                has: self.storage.has(db, key),
            },
            DatabaseMsgBody::Keys => DatabaseResponseBody::Keys {
                keys: self.storage.get_keys(db),
            },
            DatabaseMsgBody::Size => {
                let size = self.storage.get_size(db);
                DatabaseResponseBody::Size {
                    keys: size.keys,
                    bytes: size.bytes,
                }
            }
            DatabaseMsgBody::Subscribe { key } => self.handle_subscribe(db, key, request, session),
            DatabaseMsgBody::Unsubscribe { key } => self.handle_unsubscribe(db, key, session),
            DatabaseMsgBody::Writers => self.handle_writers(db),
            DatabaseMsgBody::AddWriters { writers } => self.handle_add_writers(caller_id, db, writers),
            DatabaseMsgBody::RemoveWriters { writers } => {
                self.handle_remove_writers(caller_id, db, writers)
            }
            // A null operation fills a sequence hole; executing it changes nothing.
            DatabaseMsgBody::Null => DatabaseResponseBody::Ack,
        };

        DatabaseResponse {
            header: request.header.clone(),
            body,
        }
    }

    /// Serialize the entire keyspace (user data and permissions included) and keep it as the
    /// saved state.
    pub fn save_state(&self) -> bool {
        self.storage.create_snapshot()
    }

    pub fn get_saved_state(&self) -> Option<Vec<u8>> {
        self.storage.get_snapshot()
    }

    /// Replace the entire keyspace with `state`, previously captured by [`save_state`](Self::save_state)
    /// on some replica.
    pub fn load_state(&self, state: &[u8]) -> bool {
        self.storage.load_snapshot(state)
    }

    fn handle_create_db(&self, caller_id: &str, db: &DatabaseId) -> DatabaseResponseBody {
        let permissions = DbPermissions {
            owner: caller_id.to_string(),
            writers: Vec::new(),
        };
        match self.storage.create(
            &self.permissions_db,
            db.as_bytes(),
            &permissions.try_to_vec().unwrap(),
        ) {
            StorageResult::Ok => DatabaseResponseBody::Ack,
            StorageResult::Exists => error_response(DATABASE_EXISTS),
            other => error_response(&other.to_string()),
        }
    }

    fn handle_delete_db(&self, caller_id: &str, db: &DatabaseId) -> DatabaseResponseBody {
        let Some(permissions) = self.get_database_permissions(db) else {
            return error_response(DATABASE_NOT_FOUND);
        };
        if !permissions.is_owner(caller_id) {
            return error_response(ACCESS_DENIED);
        }

        self.storage.remove(&self.permissions_db, db.as_bytes());
        // The database may never have had a record written to it, in which case there is nothing
        // to drop.
        self.storage.remove_db(db);
        DatabaseResponseBody::Ack
    }

    fn handle_create(
        &self,
        caller_id: &str,
        db: &DatabaseId,
        key: &[u8],
        value: &[u8],
    ) -> DatabaseResponseBody {
        match self.check_writer(caller_id, db) {
            Ok(()) => (),
            Err(denied) => return denied,
        }
        let result = self.storage.create(db, key, value);
        if result.is_ok() {
            self.subscription_manager.inspect_commit(db, key, Some(value));
        }
        ack_or_error(result)
    }

    fn handle_update(
        &self,
        caller_id: &str,
        db: &DatabaseId,
        key: &[u8],
        value: &[u8],
    ) -> DatabaseResponseBody {
        match self.check_writer(caller_id, db) {
            Ok(()) => (),
            Err(denied) => return denied,
        }
        let result = self.storage.update(db, key, value);
        if result.is_ok() {
            self.subscription_manager.inspect_commit(db, key, Some(value));
        }
        ack_or_error(result)
    }

    fn handle_delete(&self, caller_id: &str, db: &DatabaseId, key: &[u8]) -> DatabaseResponseBody {
        match self.check_writer(caller_id, db) {
            Ok(()) => (),
            Err(denied) => return denied,
        }
        let result = self.storage.remove(db, key);
        if result.is_ok() {
            self.subscription_manager.inspect_commit(db, key, None);
        }
        ack_or_error(result)
    }

    fn handle_subscribe(
        &self,
        db: &DatabaseId,
        key: &[u8],
        request: &DatabaseMsg,
        session: Option<SessionId>,
    ) -> DatabaseResponseBody {
        let Some(session) = session else {
            // A subscription with nowhere to deliver updates is meaningless; this happens when a
            // subscribe is replayed from the log after a restart.
            log::debug!("ignoring subscribe without a live session");
            return DatabaseResponseBody::Ack;
        };
        self.subscription_manager
            .subscribe(db, key, session, request.header.nonce);
        DatabaseResponseBody::Ack
    }

    fn handle_unsubscribe(
        &self,
        db: &DatabaseId,
        key: &[u8],
        session: Option<SessionId>,
    ) -> DatabaseResponseBody {
        if let Some(session) = session {
            self.subscription_manager.unsubscribe(db, key, session);
        }
        DatabaseResponseBody::Ack
    }

    fn handle_writers(&self, db: &DatabaseId) -> DatabaseResponseBody {
        match self.get_database_permissions(db) {
            Some(permissions) => DatabaseResponseBody::Writers {
                owner: permissions.owner,
                writers: permissions.writers,
            },
            None => error_response(DATABASE_NOT_FOUND),
        }
    }

    fn handle_add_writers(
        &self,
        caller_id: &str,
        db: &DatabaseId,
        writers: &[String],
    ) -> DatabaseResponseBody {
        self.mutate_writers(caller_id, db, |permissions| {
            for writer in writers {
                // The owner is implicitly a writer and is never listed.
                if writer != &permissions.owner && !permissions.writers.contains(writer) {
                    permissions.writers.push(writer.clone());
                }
            }
        })
    }

    fn handle_remove_writers(
        &self,
        caller_id: &str,
        db: &DatabaseId,
        writers: &[String],
    ) -> DatabaseResponseBody {
        self.mutate_writers(caller_id, db, |permissions| {
            permissions.writers.retain(|writer| !writers.contains(writer));
        })
    }

    /// Only the owner may modify the writer set.
    fn mutate_writers(
        &self,
        caller_id: &str,
        db: &DatabaseId,
        mutate: impl FnOnce(&mut DbPermissions),
    ) -> DatabaseResponseBody {
        let Some(mut permissions) = self.get_database_permissions(db) else {
            return error_response(DATABASE_NOT_FOUND);
        };
        if !permissions.is_owner(caller_id) {
            return error_response(ACCESS_DENIED);
        }

        mutate(&mut permissions);
        let result = self.storage.update(
            &self.permissions_db,
            db.as_bytes(),
            &permissions.try_to_vec().unwrap(),
        );
        ack_or_error(result)
    }

    fn check_writer(&self, caller_id: &str, db: &DatabaseId) -> Result<(), DatabaseResponseBody> {
        let Some(permissions) = self.get_database_permissions(db) else {
            return Err(error_response(DATABASE_NOT_FOUND));
        };
        if !permissions.is_writer(caller_id) {
            return Err(error_response(ACCESS_DENIED));
        }
        Ok(())
    }

    fn get_database_permissions(&self, db: &DatabaseId) -> Option<DbPermissions> {
        let bytes = self.storage.read(&self.permissions_db, db.as_bytes())?;
        match DbPermissions::try_from_slice(&bytes) {
            Ok(permissions) => Some(permissions),
            Err(_) => panic!("stored permissions of database {} do not parse", db),
        }
    }
}

fn error_response(message: &str) -> DatabaseResponseBody {
    DatabaseResponseBody::Error {
        message: message.to_string(),
    }
}

fn ack_or_error(result: StorageResult) -> DatabaseResponseBody {
    if result.is_ok() {
        DatabaseResponseBody::Ack
    } else {
        error_response(&result.to_string())
    }
}
