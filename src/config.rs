/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration as specified by the operator. This is split up into smaller, subsystem specific
//! config structs before being passed to components.

use ed25519_dalek::SigningKey;

use crate::types::basic::{DatabaseId, ViewNumber};
use crate::types::peers::PeerSet;

#[derive(Clone)]
pub struct Configuration {
    pub identity: IdentityConfig,
    pub databases: DatabaseConfig,
    /// Whether the default logging handlers defined in the `logging` module should be fired for
    /// every event.
    pub log_events: bool,
}

#[derive(Clone)]
pub struct IdentityConfig {
    pub my_signing_key: SigningKey,
    pub peers: PeerSet,
    /// The view the cluster currently operates in. View changes are driven by a subsystem outside
    /// this crate; the core treats the view as fixed for its lifetime.
    pub view: ViewNumber,
}

/// The distinguished database ids the core stores its own state under. `operations_db` and
/// `pipeline_db` live in the log storage; `permissions_db` lives in the state storage next to the
/// user databases (so checkpoints capture the ACLs along with the data). None of these ids should
/// be handed out to clients.
#[derive(Clone)]
pub struct DatabaseConfig {
    /// Holds the PBFT operation log: stages, requests, and votes.
    pub operations_db: DatabaseId,
    /// Holds the execution pipeline's state: accepted-for-apply records and the next request
    /// sequence.
    pub pipeline_db: DatabaseId,
    /// Holds one permissions record per user database.
    pub permissions_db: DatabaseId,
}

impl Default for DatabaseConfig {
    fn default() -> DatabaseConfig {
        DatabaseConfig {
            operations_db: DatabaseId::new("pbft_operations_data"),
            pipeline_db: DatabaseId::new("pbft_service_state"),
            permissions_db: DatabaseId::new("database_permissions"),
        }
    }
}
