/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Thread that receives events emitted by the agreement driver and execution pipeline and passes
//! them to event handlers.
//!
//! When the thread receives a message containing an [event](crate::events::Event), it triggers the
//! execution of all handlers defined for the contained event type. The handlers for each event
//! type are stored in [`EventHandlers`]: the user-defined handler passed to
//! [`Replica::start`](crate::replica::Replica::start), and, if logging is enabled in the replica's
//! configuration, the default logging handler defined in [logging](crate::logging).

use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

use crate::events::*;
use crate::logging::Logger;

/// Stores the two optional handlers enabled for an event type that implements the [`Logger`]
/// trait: one user-defined handler and one logging handler.
pub(crate) struct HandlerPair<T: Logger> {
    pub(crate) user_defined_handler: Option<HandlerPtr<T>>,
    pub(crate) logging_handler: Option<HandlerPtr<T>>,
}

impl<T: Logger> HandlerPair<T> {
    /// Creates a new `HandlerPair` with the user-defined handler, and the default logging handler
    /// if logging is enabled.
    fn new(log: bool, user_defined_handler: Option<HandlerPtr<T>>) -> HandlerPair<T> {
        HandlerPair {
            user_defined_handler,
            logging_handler: if log { Some(T::get_logger()) } else { None },
        }
    }

    fn fire(&self, event: &T) {
        self.user_defined_handler.iter().for_each(|handler| handler(event));
        self.logging_handler.iter().for_each(|handler| handler(event));
    }
}

/// Stores the `HandlerPair` of user-defined and optional logging handlers for each pre-defined
/// event type from [events](crate::events).
pub(crate) struct EventHandlers {
    pub(crate) receive_preprepare_handlers: HandlerPair<ReceivePrePrepareEvent>,
    pub(crate) receive_prepare_handlers: HandlerPair<ReceivePrepareEvent>,
    pub(crate) receive_commit_handlers: HandlerPair<ReceiveCommitEvent>,
    pub(crate) prepare_handlers: HandlerPair<PrepareEvent>,
    pub(crate) commit_handlers: HandlerPair<CommitEvent>,
    pub(crate) advance_stage_handlers: HandlerPair<AdvanceStageEvent>,
    pub(crate) apply_operation_handlers: HandlerPair<ApplyOperationEvent>,
    pub(crate) install_checkpoint_handlers: HandlerPair<InstallCheckpointEvent>,
}

impl EventHandlers {
    pub(crate) fn new(log: bool, handlers: EventHandlerSet) -> EventHandlers {
        EventHandlers {
            receive_preprepare_handlers: HandlerPair::new(log, handlers.receive_preprepare_handler),
            receive_prepare_handlers: HandlerPair::new(log, handlers.receive_prepare_handler),
            receive_commit_handlers: HandlerPair::new(log, handlers.receive_commit_handler),
            prepare_handlers: HandlerPair::new(log, handlers.prepare_handler),
            commit_handlers: HandlerPair::new(log, handlers.commit_handler),
            advance_stage_handlers: HandlerPair::new(log, handlers.advance_stage_handler),
            apply_operation_handlers: HandlerPair::new(log, handlers.apply_operation_handler),
            install_checkpoint_handlers: HandlerPair::new(log, handlers.install_checkpoint_handler),
        }
    }

    /// Triggers the execution of the handlers defined for a given event type.
    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::ReceivePrePrepare(ev) => self.receive_preprepare_handlers.fire(&ev),
            Event::ReceivePrepare(ev) => self.receive_prepare_handlers.fire(&ev),
            Event::ReceiveCommit(ev) => self.receive_commit_handlers.fire(&ev),
            Event::Prepare(ev) => self.prepare_handlers.fire(&ev),
            Event::Commit(ev) => self.commit_handlers.fire(&ev),
            Event::AdvanceStage(ev) => self.advance_stage_handlers.fire(&ev),
            Event::ApplyOperation(ev) => self.apply_operation_handlers.fire(&ev),
            Event::InstallCheckpoint(ev) => self.install_checkpoint_handlers.fire(&ev),
        }
    }
}

/// Starts the event bus thread, which runs an infinite loop until a shutdown signal is received
/// from the parent thread. In each iteration of the loop, the thread checks if it received any
/// event notifications, and if so, triggers the execution of the handlers defined for the event.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event_bus thread disconnected from main thread")
            }
        }

        match event_subscriber.try_recv() {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(TryRecvError::Empty) => std::thread::yield_now(),
            Err(TryRecvError::Disconnected) => {
                panic!("the event publishers disconnected from the channel")
            }
        }
    })
}
