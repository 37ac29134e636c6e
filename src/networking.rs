/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait for pluggable peer-to-peer (P2P) networking.
//!
//! Main trait: [`Network`].
//!
//! The core never opens connections itself; the library user provides an implementation of
//! `Network` that carries signed [envelopes](Envelope) between replicas. Test harnesses are free
//! to wrap one `Network` inside another (for example, to reorder or drop messages), because the
//! core only ever talks to the trait.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ed25519_dalek::VerifyingKey;

use crate::messages::Envelope;
use crate::types::peers::PeerSet;

/// Trait for pluggable peer-to-peer (P2P) networking.
pub trait Network: Clone + Send + 'static {
    /// Inform the network provider of the peer set on wake-up.
    fn init_peer_set(&mut self, peers: PeerSet);

    /// Send an envelope to all peers without blocking. Whether the broadcast loops back to the
    /// local replica is up to the implementation; the agreement driver processes its own votes
    /// directly, and duplicate deliveries are no-ops.
    fn broadcast(&mut self, envelope: Envelope);

    /// Send an envelope to the specified peer without blocking.
    fn send(&mut self, peer: VerifyingKey, envelope: Envelope);

    /// Receive an envelope from any peer. Returns immediately with a None if no envelope is
    /// available now.
    fn recv(&mut self) -> Option<Envelope>;
}

/// Spawns the poller thread, which polls the network for inbound envelopes, verifies their
/// signatures, and forwards them to the returned receiver. Envelopes with a non-empty sender but
/// an invalid signature are dropped silently; the sender will retry.
pub(crate) fn start_polling<N: Network>(
    mut network: N,
    shutdown_signal: Receiver<()>,
) -> (JoinHandle<()>, Receiver<Envelope>) {
    let (to_driver, from_poller) = mpsc::channel::<Envelope>();

    let poller = thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => panic!("poller thread disconnected from main thread"),
        }

        match network.recv() {
            Some(envelope) => {
                if envelope.is_correctly_signed() {
                    // The driver thread owning the receiving end may have shut down first.
                    let _ = to_driver.send(envelope);
                } else {
                    log::debug!("dropping envelope with missing or invalid signature");
                }
            }
            None => thread::sleep(Duration::from_millis(5)),
        }
    });

    (poller, from_poller)
}

/// A sending handle over a `Network`, shareable between the components that emit messages.
#[derive(Clone)]
pub(crate) struct NetworkHandle<N: Network> {
    network: N,
}

impl<N: Network> NetworkHandle<N> {
    pub(crate) fn new(network: N) -> NetworkHandle<N> {
        NetworkHandle { network }
    }

    pub(crate) fn broadcast(&mut self, envelope: Envelope) {
        self.network.broadcast(envelope)
    }

    pub(crate) fn send(&mut self, peer: VerifyingKey, envelope: Envelope) {
        self.network.send(peer, envelope)
    }
}
