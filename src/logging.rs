/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the replica's
//! [config](crate::config::Configuration).
//!
//! pbft_rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values
//! are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. Request hashes are printed as the
//! first seven characters of their Base64 encoding.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const RECEIVE_PREPREPARE: &str = "ReceivePrePrepare";
pub const RECEIVE_PREPARE: &str = "ReceivePrepare";
pub const RECEIVE_COMMIT: &str = "ReceiveCommit";

pub const PREPARE: &str = "Prepare";
pub const COMMIT: &str = "Commit";

pub const ADVANCE_STAGE: &str = "AdvanceStage";
pub const APPLY_OPERATION: &str = "ApplyOperation";
pub const INSTALL_CHECKPOINT: &str = "InstallCheckpoint";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for ReceivePrePrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &ReceivePrePrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_PREPREPARE,
                secs_since_unix_epoch(event.timestamp),
                first_seven_chars(&event.origin),
                event.view,
                event.sequence,
                first_seven_base64_chars(&event.request_hash.bytes()),
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceivePrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &ReceivePrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_PREPARE,
                secs_since_unix_epoch(event.timestamp),
                first_seven_chars(&event.origin),
                event.view,
                event.sequence,
                first_seven_base64_chars(&event.request_hash.bytes()),
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveCommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &ReceiveCommitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_COMMIT,
                secs_since_unix_epoch(event.timestamp),
                first_seven_chars(&event.origin),
                event.view,
                event.sequence,
                first_seven_base64_chars(&event.request_hash.bytes()),
            )
        };
        Box::new(logger)
    }
}

impl Logger for PrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &PrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PREPARE,
                secs_since_unix_epoch(event.timestamp),
                event.view,
                event.sequence,
                first_seven_base64_chars(&event.request_hash.bytes()),
            )
        };
        Box::new(logger)
    }
}

impl Logger for CommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &CommitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                COMMIT,
                secs_since_unix_epoch(event.timestamp),
                event.view,
                event.sequence,
                first_seven_base64_chars(&event.request_hash.bytes()),
            )
        };
        Box::new(logger)
    }
}

impl Logger for AdvanceStageEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &AdvanceStageEvent| {
            log::info!(
                "{}, {}, {}, {}",
                ADVANCE_STAGE,
                secs_since_unix_epoch(event.timestamp),
                event.sequence,
                event.stage,
            )
        };
        Box::new(logger)
    }
}

impl Logger for ApplyOperationEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &ApplyOperationEvent| {
            log::info!(
                "{}, {}, {}",
                APPLY_OPERATION,
                secs_since_unix_epoch(event.timestamp),
                event.sequence,
            )
        };
        Box::new(logger)
    }
}

impl Logger for InstallCheckpointEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &InstallCheckpointEvent| {
            log::info!(
                "{}, {}, {}",
                INSTALL_CHECKPOINT,
                secs_since_unix_epoch(event.timestamp),
                event.sequence,
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first
// 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn first_seven_chars(string: &str) -> String {
    if string.len() > 7 {
        string[0..7].to_string()
    } else {
        string.to_string()
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Event occured before the Unix Epoch.")
        .as_secs()
}
