//! pbft_rs is a Rust implementation of a PBFT-replicated CRUD key-value service. A small cluster of
//! mutually-distrusting replicas agrees on a total order for client requests using the three-phase
//! PBFT protocol (pre-prepare, prepare, commit), records every vote durably before counting it, and
//! applies committed requests to a per-database keyspace strictly in sequence order.
//!
//! ## Architecture
//!
//! The crate is built from four components, in dependency order:
//! 1. The [storage engine](storage), which provides per-database keyed bytes with prefix/range scans
//!    and snapshots, behind two interchangeable backends.
//! 2. The [operation record](operations), which wraps one PBFT instance
//!    `(view, sequence, request hash)` and persists its votes and stage.
//! 3. The [agreement driver](agreement), which routes incoming PBFT messages to operation records
//!    and advances their stages when quorums form.
//! 4. The [execution pipeline](pipeline), which applies committed operations to the
//!    [CRUD service](crud) in sequence order and posts responses back to client sessions.
//!
//! View change and checkpoint garbage collection are not implemented here; the crate provides the
//! durable proofs and accessors those subsystems consume.

pub mod agreement;

pub mod config;

pub mod crud;

pub mod events;

pub mod messages;

pub mod networking;

pub mod operations;

pub mod pipeline;

pub mod replica;

pub mod session;

pub mod storage;

pub mod types;

pub(crate) mod event_bus;

pub(crate) mod logging;

// Re-exports
pub use replica::Replica;
pub use storage::StorageEngine;
