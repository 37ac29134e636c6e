/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Basic "inert" types: those that are sent around and inspected, but have no active behavior.
//!
//! These types follow the newtype pattern, and the API for using them is defined in this module.

use std::fmt::{self, Debug, Display, Formatter};
use std::ops::{Add, AddAssign};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};

/// A monotonic epoch identifier naming the current primary. Changes across view changes (which are
/// out of scope for this crate; the view carried here is the one the cluster was configured with or
/// has been told about).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct ViewNumber(u64);

impl ViewNumber {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn init() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for ViewNumber {
    type Output = ViewNumber;

    fn add(self, rhs: u64) -> Self::Output {
        ViewNumber(self.0.add(rhs))
    }
}

/// A monotonic integer assigned by the primary to totally order committed operations. The first
/// operation a fresh cluster executes has sequence number 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for SequenceNumber {
    type Output = SequenceNumber;

    fn add(self, rhs: u64) -> Self::Output {
        SequenceNumber(self.0.add(rhs))
    }
}

impl AddAssign<u64> for SequenceNumber {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

/// A content-addressable identifier for a client request envelope, binding a
/// `(view, sequence, request hash)` triple to exactly one payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct RequestHash([u8; 32]);

impl RequestHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Hash an already-serialized envelope. All replicas must agree on this function, since the
    /// hash is part of the identity of every operation.
    pub fn compute(serialized_envelope: &[u8]) -> RequestHash {
        let mut hasher = Sha256::new();
        hasher.update(serialized_envelope);
        RequestHash(hasher.finalize().into())
    }

    /// The textual form of the hash, used in storage keys and log lines. Standard Base64 without
    /// padding: the alphabet does not contain the `_` that separates storage key segments.
    pub fn base64(&self) -> String {
        STANDARD_NO_PAD.encode(self.0)
    }
}

impl Display for RequestHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base64())
    }
}

impl Debug for RequestHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base64())
    }
}

/// Name of one database inside the storage engine's namespace. One distinguished id holds the PBFT
/// operation log, one holds the execution pipeline's state, and one holds per-database permissions;
/// all other ids hold user data.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, BorshDeserialize, BorshSerialize)]
pub struct DatabaseId(String);

impl DatabaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Display for DatabaseId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-chosen number echoed in responses so the client can match them to its requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct Nonce(u64);

impl Nonce {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

/// Signature represented in bytes.
#[derive(Clone, Copy, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub const fn init() -> Self {
        Self([0u8; 64])
    }

    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}
