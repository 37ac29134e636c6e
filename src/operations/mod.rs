//! Durable records of in-flight PBFT operations.
//!
//! One [`PersistentOperation`](operation::PersistentOperation) wraps a single agreement instance,
//! identified by `(view, sequence, request hash)`. Everything known about the instance, from its
//! stage to every vote received about it, is persisted under the
//! operation's [key prefix](generate_prefix) in the operations database *before* it is allowed to
//! count toward a quorum, so a replica that crashes and restarts cannot forget a vote it already
//! contributed.
//!
//! The [`OperationIndex`](index::OperationIndex) owns the in-memory handles to these records. It
//! is a cache over the storage log: dropping it and constructing a fresh one over the same storage
//! yields records that answer identically.

pub mod index;

pub mod operation;

pub use index::OperationIndex;
pub use operation::PersistentOperation;

use std::fmt::{self, Display, Formatter};

use crate::types::basic::{RequestHash, SequenceNumber, ViewNumber};

/// The phase an operation is currently in:
/// * `Prepare`: waiting for a pre-prepare and `2f + 1` prepares,
/// * `Commit`: prepared, waiting for `2f + 1` commits,
/// * `Execute`: committed-local, ready to be executed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OperationStage {
    Prepare,
    Commit,
    Execute,
}

impl OperationStage {
    /// The ASCII integer stored under the operation's stage key.
    pub(crate) fn storage_value(&self) -> &'static str {
        match self {
            OperationStage::Prepare => "0",
            OperationStage::Commit => "1",
            OperationStage::Execute => "2",
        }
    }

    pub(crate) fn from_storage_value(value: &str) -> Option<OperationStage> {
        match value {
            "0" => Some(OperationStage::Prepare),
            "1" => Some(OperationStage::Commit),
            "2" => Some(OperationStage::Execute),
            _ => None,
        }
    }
}

impl Display for OperationStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OperationStage::Prepare => write!(f, "prepare"),
            OperationStage::Commit => write!(f, "commit"),
            OperationStage::Execute => write!(f, "execute"),
        }
    }
}

/// The triple that uniquely identifies a PBFT operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct OperationKey {
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub request_hash: RequestHash,
}

/// The textual prefix under which an operation's durable records are addressed.
///
/// Integers are formatted to 20 digits, the maximum length of a 64 bit unsigned integer. They need
/// to have constant length so that the lexicographic order of prefixes agrees with the numeric
/// order of `(sequence, request hash, view)`, which is what lets prefix scans enumerate operations
/// in apply order.
pub fn generate_prefix(view: ViewNumber, sequence: SequenceNumber, request_hash: &str) -> String {
    format!("{:020}_{}_{:020}", sequence.int(), request_hash, view.int())
}

/// A storage key under an operation's prefix.
pub(crate) fn generate_key(prefix: &str, key: &str) -> String {
    format!("{}_{}", prefix, key)
}

/// The smallest key an operation with the given sequence number could be stored under. Every key
/// of every operation with a smaller sequence number sorts strictly before it.
pub fn key_for_sequence(sequence: SequenceNumber) -> String {
    format!("{:020}", sequence.int())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_format() {
        let prefix = generate_prefix(ViewNumber::new(7), SequenceNumber::new(42), "h");
        assert_eq!(prefix, "00000000000000000042_h_00000000000000000007");
    }

    #[test]
    fn prefixes_sort_in_sequence_order() {
        let at_42 = generate_prefix(ViewNumber::new(7), SequenceNumber::new(42), "h");
        assert!(generate_prefix(ViewNumber::new(0), SequenceNumber::new(41), "h") < at_42);
        assert!(at_42 < generate_prefix(ViewNumber::new(0), SequenceNumber::new(43), "h"));
    }
}
