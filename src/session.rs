/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The seam between the core and the transport's client connections.
//!
//! The transport registers each connection it accepts in the [`SessionTable`] and hands the
//! resulting [`SessionId`] in with every decoded envelope. Components that may need to respond
//! later (operation records, subscriptions) hold only the id; at response time they look the
//! session up again and check [`Session::is_open`]. A session that has been closed in the
//! meantime silently swallows the response; ordering and replicated state are unaffected.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::messages::Envelope;

/// One transport-level connection to a client or peer. Sessions carry messages, not durable state.
///
/// `send_message` must not block on the network: implementations queue the envelope and return.
pub trait Session: Send + Sync {
    fn send_message(&self, envelope: Envelope);

    fn is_open(&self) -> bool;
}

/// Stable identifier of a session in the [`SessionTable`]. Ids are never reused within a process
/// lifetime, so a stale id held by an old operation can never reach a newer connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// The table of live sessions, keyed by id.
pub struct SessionTable {
    sessions: RwLock<HashMap<SessionId, Arc<dyn Session>>>,
    next_id: AtomicU64,
}

impl SessionTable {
    pub fn new() -> SessionTable {
        SessionTable {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn insert(&self, session: Arc<dyn Session>) -> SessionId {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sessions.write().unwrap().insert(id, session);
        id
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<dyn Session>> {
        self.sessions.read().unwrap().get(&id).cloned()
    }

    /// Drop a session from the table, e.g. after the transport closed it or its idle timer fired.
    pub fn remove(&self, id: SessionId) -> Option<Arc<dyn Session>> {
        self.sessions.write().unwrap().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().unwrap().is_empty()
    }

    /// Post `envelope` back through session `id`, if that session is still around and open. A
    /// dropped or closed session suppresses the response silently.
    pub fn deliver(&self, id: SessionId, envelope: Envelope) {
        match self.get(id) {
            Some(session) if session.is_open() => session.send_message(envelope),
            _ => log::debug!("dropping response because session {} is gone", id),
        }
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        SessionTable::new()
    }
}
