/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The snapshot wire format shared by both storage backends.
//!
//! A snapshot blob is the Borsh serialization of the whole namespace: a map from database id to an
//! ordered map from key bytes to value bytes. Borsh writes maps as length-prefixed sequences of
//! entries in key order, so the encoding is deterministic and portable across backends: a blob
//! captured from [`MemStorage`](super::MemStorage) loads into
//! [`DiskStorage`](super::DiskStorage) and vice versa.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::DatabaseId;

/// The decoded form of a snapshot: every database and every record in it.
pub(crate) type Namespace = BTreeMap<DatabaseId, BTreeMap<Vec<u8>, Vec<u8>>>;

pub(crate) fn encode(namespace: &Namespace) -> Vec<u8> {
    namespace.try_to_vec().unwrap()
}

/// `None` if the blob does not parse; the caller logs and rejects the snapshot.
pub(crate) fn decode(blob: &[u8]) -> Option<Namespace> {
    Namespace::try_from_slice(blob).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut namespace = Namespace::new();
        namespace
            .entry(DatabaseId::new("db1"))
            .or_default()
            .insert(b"k".to_vec(), b"v".to_vec());
        namespace
            .entry(DatabaseId::new("db2"))
            .or_default()
            .insert(vec![0xff, 0x00], Vec::new());

        let blob = encode(&namespace);
        assert_eq!(decode(&blob), Some(namespace));
    }

    #[test]
    fn garbage_does_not_decode() {
        assert_eq!(decode(&[0xde, 0xad, 0xbe]), None);
    }
}
