/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Keeps track of which sessions want to hear about changes to which keys.
//!
//! Subscriptions are in-memory only: they name live sessions, and sessions do not survive the
//! process. A closed session is pruned the first time a notification fails to find it open.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::messages::{DatabaseHeader, DatabaseResponse, DatabaseResponseBody, Envelope};
use crate::session::{SessionId, SessionTable};
use crate::types::basic::{DatabaseId, Nonce};

pub(crate) struct SubscriptionManager {
    sessions: Arc<SessionTable>,
    // (database, key) → the sessions subscribed to it, each with the nonce to echo back.
    subscriptions: Mutex<HashMap<(DatabaseId, Vec<u8>), HashMap<SessionId, Nonce>>>,
}

impl SubscriptionManager {
    pub(crate) fn new(sessions: Arc<SessionTable>) -> SubscriptionManager {
        SubscriptionManager {
            sessions,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn subscribe(&self, db: &DatabaseId, key: &[u8], session: SessionId, nonce: Nonce) {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        subscriptions
            .entry((db.clone(), key.to_vec()))
            .or_default()
            .insert(session, nonce);
    }

    pub(crate) fn unsubscribe(&self, db: &DatabaseId, key: &[u8], session: SessionId) {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        if let Some(subscribers) = subscriptions.get_mut(&(db.clone(), key.to_vec())) {
            subscribers.remove(&session);
            if subscribers.is_empty() {
                subscriptions.remove(&(db.clone(), key.to_vec()));
            }
        }
    }

    /// Tell every subscriber of `(db, key)` about its new value (`None` = the key was deleted).
    /// Sessions that have gone away are dropped from the subscription.
    pub(crate) fn inspect_commit(&self, db: &DatabaseId, key: &[u8], new_value: Option<&[u8]>) {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let Some(subscribers) = subscriptions.get_mut(&(db.clone(), key.to_vec())) else {
            return;
        };

        subscribers.retain(|session_id, nonce| {
            match self.sessions.get(*session_id) {
                Some(session) if session.is_open() => {
                    let update = DatabaseResponse {
                        header: DatabaseHeader {
                            db_uuid: db.clone(),
                            nonce: *nonce,
                        },
                        body: DatabaseResponseBody::Value {
                            value: new_value.map(|value| value.to_vec()),
                        },
                    };
                    session.send_message(Envelope::wrap_database_response(&update));
                    true
                }
                _ => {
                    log::debug!("pruning subscription of dead session {}", session_id);
                    false
                }
            }
        });
    }
}
