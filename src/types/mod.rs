//! Inert types shared across the subsystems of pbft_rs.
//!
//! The types defined in [`basic`] follow the newtype pattern: they are sent around and inspected,
//! but have no active behavior. [`peers`] defines the replica set and the quorum arithmetic shared
//! by all replicas, and [`keypair`] wraps the signing key used to stamp outbound envelopes.

pub mod basic;

pub mod keypair;

pub mod peers;
