/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that [initialize](Replica::initialize) and [start](Replica::start) a replica, as well
//! as [the type](Replica) which keeps the replica alive.
//!
//! pbft_rs works to safely replicate a CRUD database in multiple processes. In our terminology,
//! these processes are called 'replicas', and each replica is uniquely identified by an Ed25519
//! public key.
//!
//! A started replica owns three threads: the poller, which takes signed envelopes off the
//! [network](crate::networking::Network) and drops the incorrectly signed ones; the driver thread,
//! which feeds inbound envelopes to the [agreement driver](crate::agreement); and the event bus,
//! which fires registered handlers for the [events](crate::events) the other threads publish. The
//! transport layer hands client envelopes in directly through
//! [`handle_client_request`](Replica::handle_client_request), tagging each with the id of the
//! session it arrived on so responses can find their way back.
//!
//! Dropping the `Replica` shuts the threads down in dependency order and joins them.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::agreement::AgreementDriver;
use crate::config::Configuration;
use crate::crud::CrudService;
use crate::event_bus::{start_event_bus, EventHandlers};
use crate::events::EventHandlerSet;
use crate::messages::Envelope;
use crate::networking::{start_polling, Network};
use crate::pipeline::{self, ExecutionPipeline};
use crate::session::{SessionId, SessionTable};
use crate::storage::StorageEngine;
use crate::types::keypair::Keypair;

pub struct Replica<N: Network> {
    crud: Arc<CrudService>,
    pipeline: Arc<ExecutionPipeline>,
    driver: Arc<AgreementDriver<N>>,
    sessions: Arc<SessionTable>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    driver_thread: Option<JoinHandle<()>>,
    driver_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Sender<()>,
}

impl<N: Network> Replica<N> {
    /// Seed the durable state a replica needs before its first start over `log_storage`. Calling
    /// this over storage that has already been initialized changes nothing.
    pub fn initialize(log_storage: &dyn StorageEngine, config: &Configuration) {
        pipeline::load_next_request_sequence(log_storage, &config.databases.pipeline_db);
    }

    /// Start the replica.
    ///
    /// `state_storage` holds the service state: user databases and their permissions. This is the
    /// engine that checkpoints snapshot and restore. `log_storage` holds the PBFT operation log
    /// and the pipeline's progress, which must *not* be replaced when a checkpoint is installed.
    /// The two may be different backends (e.g. a volatile service state in front of a durable
    /// log).
    pub fn start(
        config: Configuration,
        state_storage: Arc<dyn StorageEngine>,
        log_storage: Arc<dyn StorageEngine>,
        mut network: N,
        handlers: EventHandlerSet,
    ) -> Replica<N> {
        network.init_peer_set(config.identity.peers.clone());

        let sessions = Arc::new(SessionTable::new());
        let (event_publisher, event_subscriber) = mpsc::channel();

        let crud = Arc::new(CrudService::new(
            state_storage,
            config.databases.permissions_db.clone(),
            sessions.clone(),
        ));
        let pipeline = Arc::new(ExecutionPipeline::new(
            log_storage.clone(),
            crud.clone(),
            config.databases.pipeline_db.clone(),
            sessions.clone(),
            Some(event_publisher.clone()),
        ));
        let driver = Arc::new(AgreementDriver::new(
            log_storage,
            config.databases.operations_db.clone(),
            pipeline.clone(),
            Keypair::new(config.identity.my_signing_key.clone()),
            config.identity.peers.clone(),
            config.identity.view,
            network.clone(),
            Some(event_publisher),
        ));

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let (poller, inbound) = start_polling(network, poller_shutdown_receiver);

        let (driver_shutdown, driver_shutdown_receiver) = mpsc::channel();
        let driver_thread = start_driver_thread(driver.clone(), inbound, driver_shutdown_receiver);

        let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
        let event_bus = start_event_bus(
            EventHandlers::new(config.log_events, handlers),
            event_subscriber,
            event_bus_shutdown_receiver,
        );

        Replica {
            crud,
            pipeline,
            driver,
            sessions,
            poller: Some(poller),
            poller_shutdown,
            driver_thread: Some(driver_thread),
            driver_shutdown,
            event_bus: Some(event_bus),
            event_bus_shutdown,
        }
    }

    /// Entry point for the transport layer: a decoded envelope from a client session. Quick reads
    /// bypass consensus entirely; everything else goes through the agreement driver.
    pub fn handle_client_request(&self, envelope: Envelope, session: Option<SessionId>) {
        if !envelope.is_correctly_signed() {
            log::debug!("dropping client envelope with missing or invalid signature");
            return;
        }

        if self.pipeline.apply_operation_now(&envelope, session) {
            return;
        }

        self.driver.handle_message(envelope, session);
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn crud(&self) -> &Arc<CrudService> {
        &self.crud
    }

    pub fn pipeline(&self) -> &Arc<ExecutionPipeline> {
        &self.pipeline
    }

    pub fn driver(&self) -> &Arc<AgreementDriver<N>> {
        &self.driver
    }
}

impl<N: Network> Drop for Replica<N> {
    fn drop(&mut self) {
        // Safety: the order of thread shutdown in this function is important, as the threads make
        // assumptions about the validity of their channels based on it. The driver thread
        // receives envelopes from the poller, and assumes that the poller will live longer than
        // it does.

        self.event_bus_shutdown.send(()).unwrap();
        self.event_bus.take().unwrap().join().unwrap();

        self.driver_shutdown.send(()).unwrap();
        self.driver_thread.take().unwrap().join().unwrap();

        self.poller_shutdown.send(()).unwrap();
        self.poller.take().unwrap().join().unwrap();
    }
}

/// Spawns the driver thread, which feeds envelopes from the poller to the agreement driver until
/// a shutdown signal is received.
fn start_driver_thread<N: Network>(
    driver: Arc<AgreementDriver<N>>,
    inbound: Receiver<Envelope>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => panic!("driver thread disconnected from main thread"),
        }

        match inbound.try_recv() {
            Ok(envelope) => driver.handle_message(envelope, None),
            Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
            Err(TryRecvError::Disconnected) => panic!("the poller thread disconnected from the channel"),
        }
    })
}
