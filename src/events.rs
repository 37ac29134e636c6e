/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of events that can occur inside the replica, and handlers the library user can
//! register for them.
//!
//! Events are published by the [agreement driver](crate::agreement) and the
//! [execution pipeline](crate::pipeline) over a channel to the event bus thread, which triggers
//! the execution of the registered handlers. If logging is enabled in the replica's
//! [configuration](crate::config::Configuration), the default logging handlers defined in the
//! `logging` module are fired for every event as well.

use std::time::SystemTime;

use crate::operations::OperationStage;
use crate::types::basic::{RequestHash, SequenceNumber, ViewNumber};

/// Pointer to a handler closure, parametrised by the event type.
pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

pub enum Event {
    // Votes received from peers.
    ReceivePrePrepare(ReceivePrePrepareEvent),
    ReceivePrepare(ReceivePrepareEvent),
    ReceiveCommit(ReceiveCommitEvent),

    // Votes this replica broadcasts.
    Prepare(PrepareEvent),
    Commit(CommitEvent),

    // Operation lifecycle.
    AdvanceStage(AdvanceStageEvent),
    ApplyOperation(ApplyOperationEvent),
    InstallCheckpoint(InstallCheckpointEvent),
}

/// A pre-prepare for the given operation was received and recorded.
pub struct ReceivePrePrepareEvent {
    pub timestamp: SystemTime,
    pub origin: String,
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub request_hash: RequestHash,
}

/// A prepare vote from `origin` was received and recorded.
pub struct ReceivePrepareEvent {
    pub timestamp: SystemTime,
    pub origin: String,
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub request_hash: RequestHash,
}

/// A commit vote from `origin` was received and recorded.
pub struct ReceiveCommitEvent {
    pub timestamp: SystemTime,
    pub origin: String,
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub request_hash: RequestHash,
}

/// This replica durably recorded and broadcast its own prepare vote.
pub struct PrepareEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub request_hash: RequestHash,
}

/// This replica durably recorded and broadcast its own commit vote.
pub struct CommitEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub request_hash: RequestHash,
}

/// An operation's stage advanced after a quorum formed.
pub struct AdvanceStageEvent {
    pub timestamp: SystemTime,
    pub sequence: SequenceNumber,
    pub stage: OperationStage,
}

/// A committed operation was handed to the CRUD service.
pub struct ApplyOperationEvent {
    pub timestamp: SystemTime,
    pub sequence: SequenceNumber,
}

/// A checkpoint was installed and the pipeline jumped to the sequence after it.
pub struct InstallCheckpointEvent {
    pub timestamp: SystemTime,
    pub sequence: SequenceNumber,
}

/// The user-defined handlers to fire for each event type. Every field defaults to `None`.
#[derive(Default)]
pub struct EventHandlerSet {
    pub receive_preprepare_handler: Option<HandlerPtr<ReceivePrePrepareEvent>>,
    pub receive_prepare_handler: Option<HandlerPtr<ReceivePrepareEvent>>,
    pub receive_commit_handler: Option<HandlerPtr<ReceiveCommitEvent>>,
    pub prepare_handler: Option<HandlerPtr<PrepareEvent>>,
    pub commit_handler: Option<HandlerPtr<CommitEvent>>,
    pub advance_stage_handler: Option<HandlerPtr<AdvanceStageEvent>>,
    pub apply_operation_handler: Option<HandlerPtr<ApplyOperationEvent>>,
    pub install_checkpoint_handler: Option<HandlerPtr<InstallCheckpointEvent>>,
}
