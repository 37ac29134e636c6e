//! Helpers shared by the integration tests: deterministic identities, signed envelopes, and the
//! in-process network and session fakes.

// Each integration test binary compiles this module but uses its own subset of the helpers.
#![allow(dead_code)]

pub(crate) mod logging;
pub(crate) mod network;
pub(crate) mod sessions;

use ed25519_dalek::SigningKey;
use rand::rngs::StdRng;
use rand::SeedableRng;

use pbft_rs::messages::{DatabaseHeader, DatabaseMsg, DatabaseMsgBody, Envelope, PbftMsg};
use pbft_rs::types::basic::{DatabaseId, Nonce};
use pbft_rs::types::keypair::Keypair;
use pbft_rs::types::peers::PeerSet;

/// Deterministic signing keys, so test runs are reproducible.
pub(crate) fn signing_keys(n: usize) -> Vec<SigningKey> {
    (0..n)
        .map(|i| SigningKey::generate(&mut StdRng::seed_from_u64(0xC0FFEE + i as u64)))
        .collect()
}

pub(crate) fn peer_set(keys: &[SigningKey]) -> PeerSet {
    let mut peers = PeerSet::new();
    for key in keys {
        peers.put(&key.verifying_key());
    }
    peers
}

pub(crate) fn database_msg(db: &str, nonce: u64, body: DatabaseMsgBody) -> DatabaseMsg {
    DatabaseMsg {
        header: DatabaseHeader {
            db_uuid: DatabaseId::new(db),
            nonce: Nonce::new(nonce),
        },
        body,
    }
}

/// A client request envelope, stamped and signed by `signer`.
pub(crate) fn signed_database_envelope(signer: &SigningKey, msg: &DatabaseMsg) -> Envelope {
    let mut envelope = Envelope::wrap_database_msg(msg);
    envelope.sign(&Keypair::new(signer.clone()));
    envelope
}

/// A consensus message envelope, stamped and signed by `signer`.
pub(crate) fn signed_pbft_envelope(signer: &SigningKey, msg: &PbftMsg) -> Envelope {
    let mut envelope = Envelope::wrap_pbft_msg(msg);
    envelope.sign(&Keypair::new(signer.clone()));
    envelope
}

/// The textual caller id a request signed by `signer` carries.
pub(crate) fn caller_id(signer: &SigningKey) -> String {
    pbft_rs::types::peers::peer_id(&signer.verifying_key())
}
