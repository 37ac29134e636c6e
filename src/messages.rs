/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for structured messages that are sent between replicas and clients.
//!
//! All inter-node and client traffic travels inside a signed [`Envelope`]. The envelope's payload
//! bytes are opaque at the transport layer; the payload case says how to decode them. The three
//! decoded forms are [`DatabaseMsg`] (a client's CRUD request), [`PbftMsg`] (a consensus vote or
//! proposal), and [`ConfigMsg`] (an internal cluster-configuration request).

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::types::basic::{DatabaseId, Nonce, RequestHash, SequenceNumber, SignatureBytes, ViewNumber};
use crate::types::keypair::Keypair;
use crate::types::peers::peer_id;

/// A signed wrapper around every message the core sends or receives.
///
/// An envelope with an empty `sender` has not been stamped yet; [`Envelope::sign`] stamps it with
/// the local replica's identity and signs it. An inbound envelope with a non-empty sender whose
/// signature does not verify must be dropped silently by the transport.
#[derive(Clone, PartialEq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Envelope {
    pub sender: Vec<u8>,
    pub signature: SignatureBytes,
    pub payload: Payload,
}

/// The payload cases an envelope selects among. The carried bytes are the Borsh serialization of
/// the corresponding decoded type.
#[derive(Clone, PartialEq, Debug, BorshSerialize, BorshDeserialize)]
pub enum Payload {
    DatabaseMsg(Vec<u8>),
    DatabaseResponse(Vec<u8>),
    PbftMsg(Vec<u8>),
    PbftInternalRequest(Vec<u8>),
}

impl Payload {
    pub fn name(&self) -> &'static str {
        match self {
            Payload::DatabaseMsg(_) => "DatabaseMsg",
            Payload::DatabaseResponse(_) => "DatabaseResponse",
            Payload::PbftMsg(_) => "PbftMsg",
            Payload::PbftInternalRequest(_) => "PbftInternalRequest",
        }
    }
}

impl Envelope {
    /// Wrap an unsigned payload. The envelope must be [signed](Envelope::sign) before it is handed
    /// to the transport.
    pub fn wrap(payload: Payload) -> Envelope {
        Envelope {
            sender: Vec::new(),
            signature: SignatureBytes::init(),
            payload,
        }
    }

    pub fn wrap_database_msg(msg: &DatabaseMsg) -> Envelope {
        Envelope::wrap(Payload::DatabaseMsg(msg.try_to_vec().unwrap()))
    }

    pub fn wrap_database_response(response: &DatabaseResponse) -> Envelope {
        Envelope::wrap(Payload::DatabaseResponse(response.try_to_vec().unwrap()))
    }

    pub fn wrap_pbft_msg(msg: &PbftMsg) -> Envelope {
        Envelope::wrap(Payload::PbftMsg(msg.try_to_vec().unwrap()))
    }

    pub fn wrap_config_msg(msg: &ConfigMsg) -> Envelope {
        Envelope::wrap(Payload::PbftInternalRequest(msg.try_to_vec().unwrap()))
    }

    /// The values the signature is over: everything except the signature itself.
    fn signed_bytes(&self) -> Vec<u8> {
        (&self.sender, &self.payload).try_to_vec().unwrap()
    }

    /// Stamp the envelope with the signer's identity (if it has no sender yet) and sign it.
    pub fn sign(&mut self, keypair: &Keypair) {
        if self.sender.is_empty() {
            self.sender = keypair.public().to_bytes().to_vec();
        }
        self.signature = keypair.sign(&self.signed_bytes());
    }

    /// Verifies the envelope's signature against its claimed sender. An envelope with an empty or
    /// malformed sender is never correctly signed.
    pub fn is_correctly_signed(&self) -> bool {
        match self.sender_key() {
            Some(sender) => {
                let signature = Signature::from_bytes(&self.signature.bytes());
                sender.verify(&self.signed_bytes(), &signature).is_ok()
            }
            None => false,
        }
    }

    /// The sender's verifying key, if the envelope has been stamped with a well-formed one.
    pub fn sender_key(&self) -> Option<VerifyingKey> {
        let bytes: [u8; 32] = self.sender.as_slice().try_into().ok()?;
        VerifyingKey::from_bytes(&bytes).ok()
    }

    /// The textual form of the sender identity. Empty for an unstamped envelope.
    pub fn sender_id(&self) -> String {
        match self.sender_key() {
            Some(sender) => peer_id(&sender),
            None => String::new(),
        }
    }

    /// The content hash binding this envelope to an operation.
    pub fn hash(&self) -> RequestHash {
        RequestHash::compute(&self.try_to_vec().unwrap())
    }

    /// Decode the payload as a [`DatabaseMsg`]. `None` if the payload selects a different case or
    /// the bytes do not parse.
    pub fn to_database_msg(&self) -> Option<DatabaseMsg> {
        match &self.payload {
            Payload::DatabaseMsg(bytes) => DatabaseMsg::try_from_slice(bytes).ok(),
            _ => None,
        }
    }

    pub fn to_database_response(&self) -> Option<DatabaseResponse> {
        match &self.payload {
            Payload::DatabaseResponse(bytes) => DatabaseResponse::try_from_slice(bytes).ok(),
            _ => None,
        }
    }

    pub fn to_pbft_msg(&self) -> Option<PbftMsg> {
        match &self.payload {
            Payload::PbftMsg(bytes) => PbftMsg::try_from_slice(bytes).ok(),
            _ => None,
        }
    }

    pub fn to_config_msg(&self) -> Option<ConfigMsg> {
        match &self.payload {
            Payload::PbftInternalRequest(bytes) => ConfigMsg::try_from_slice(bytes).ok(),
            _ => None,
        }
    }
}

/// A message of the three-phase agreement protocol, concerning the operation identified by
/// `(view, sequence, request_hash)`.
#[derive(Clone, PartialEq, Debug, BorshSerialize, BorshDeserialize)]
pub struct PbftMsg {
    pub kind: PbftMsgKind,
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub request_hash: RequestHash,
    /// The client request envelope, carried only on a pre-prepare so replicas that have not seen
    /// the request can record it.
    pub request: Option<Envelope>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, BorshSerialize, BorshDeserialize)]
pub enum PbftMsgKind {
    PrePrepare,
    Prepare,
    Commit,
    Checkpoint,
    ViewChange,
    NewView,
}

impl PbftMsgKind {
    /// The byte identifying this message type in operation-log storage keys. Only the three
    /// phases of per-operation agreement are ever persisted there.
    pub(crate) fn storage_tag(&self) -> Option<u8> {
        match self {
            PbftMsgKind::PrePrepare => Some(0),
            PbftMsgKind::Prepare => Some(1),
            PbftMsgKind::Commit => Some(2),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PbftMsgKind::PrePrepare => "PrePrepare",
            PbftMsgKind::Prepare => "Prepare",
            PbftMsgKind::Commit => "Commit",
            PbftMsgKind::Checkpoint => "Checkpoint",
            PbftMsgKind::ViewChange => "ViewChange",
            PbftMsgKind::NewView => "NewView",
        }
    }
}

/// The header every database request and response carries: the database it concerns and a
/// client-chosen nonce echoed back in the response.
#[derive(Clone, PartialEq, Debug, BorshSerialize, BorshDeserialize)]
pub struct DatabaseHeader {
    pub db_uuid: DatabaseId,
    pub nonce: Nonce,
}

/// A decoded client request against a named database.
#[derive(Clone, PartialEq, Debug, BorshSerialize, BorshDeserialize)]
pub struct DatabaseMsg {
    pub header: DatabaseHeader,
    pub body: DatabaseMsgBody,
}

#[derive(Clone, PartialEq, Debug, BorshSerialize, BorshDeserialize)]
pub enum DatabaseMsgBody {
    Create { key: Vec<u8>, value: Vec<u8> },
    Read { key: Vec<u8> },
    Update { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Has { key: Vec<u8> },
    Keys,
    Size,
    Subscribe { key: Vec<u8> },
    Unsubscribe { key: Vec<u8> },
    QuickRead { key: Vec<u8> },
    CreateDb,
    DeleteDb,
    HasDb,
    Writers,
    AddWriters { writers: Vec<String> },
    RemoveWriters { writers: Vec<String> },
    /// Fills a sequence-number hole left by a committed operation that carried no database
    /// request. Executing it changes nothing.
    Null,
}

impl DatabaseMsgBody {
    pub fn name(&self) -> &'static str {
        match self {
            DatabaseMsgBody::Create { .. } => "Create",
            DatabaseMsgBody::Read { .. } => "Read",
            DatabaseMsgBody::Update { .. } => "Update",
            DatabaseMsgBody::Delete { .. } => "Delete",
            DatabaseMsgBody::Has { .. } => "Has",
            DatabaseMsgBody::Keys => "Keys",
            DatabaseMsgBody::Size => "Size",
            DatabaseMsgBody::Subscribe { .. } => "Subscribe",
            DatabaseMsgBody::Unsubscribe { .. } => "Unsubscribe",
            DatabaseMsgBody::QuickRead { .. } => "QuickRead",
            DatabaseMsgBody::CreateDb => "CreateDb",
            DatabaseMsgBody::DeleteDb => "DeleteDb",
            DatabaseMsgBody::HasDb => "HasDb",
            DatabaseMsgBody::Writers => "Writers",
            DatabaseMsgBody::AddWriters { .. } => "AddWriters",
            DatabaseMsgBody::RemoveWriters { .. } => "RemoveWriters",
            DatabaseMsgBody::Null => "Null",
        }
    }
}

impl DatabaseMsg {
    pub fn is_quick_read(&self) -> bool {
        matches!(self.body, DatabaseMsgBody::QuickRead { .. })
    }

    /// A null message filling a gap in the sequence stream.
    pub fn null() -> DatabaseMsg {
        DatabaseMsg {
            header: DatabaseHeader {
                db_uuid: DatabaseId::new(""),
                nonce: Nonce::new(0),
            },
            body: DatabaseMsgBody::Null,
        }
    }
}

/// A reply to a [`DatabaseMsg`], echoing its header.
#[derive(Clone, PartialEq, Debug, BorshSerialize, BorshDeserialize)]
pub struct DatabaseResponse {
    pub header: DatabaseHeader,
    pub body: DatabaseResponseBody,
}

#[derive(Clone, PartialEq, Debug, BorshSerialize, BorshDeserialize)]
pub enum DatabaseResponseBody {
    /// The request succeeded and there is nothing to return.
    Ack,
    Value { value: Option<Vec<u8>> },
    Has { has: bool },
    Keys { keys: Vec<Vec<u8>> },
    Size { keys: u64, bytes: u64 },
    Writers { owner: String, writers: Vec<String> },
    Error { message: String },
}

/// An internal cluster-configuration request (e.g. a membership change). The configuration bytes
/// are opaque to this crate; the subsystems that consume them (view change, peer management) live
/// outside it.
#[derive(Clone, PartialEq, Debug, BorshSerialize, BorshDeserialize)]
pub struct ConfigMsg {
    pub configuration: Vec<u8>,
}
