//! An in-process [`Network`] over channels, plus a lossy middleware wrapper used to simulate a
//! faulty replica. The middleware lives here, over the network seam, precisely so the core never
//! has to know it exists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use ed25519_dalek::VerifyingKey;

use pbft_rs::messages::Envelope;
use pbft_rs::networking::Network;
use pbft_rs::types::peers::PeerSet;

/// One endpoint of a fully-connected in-process network. Broadcasts go to every *other* endpoint;
/// the agreement driver handles its own votes locally.
#[derive(Clone)]
pub(crate) struct MockNetwork {
    my_key: [u8; 32],
    peers: Arc<Mutex<HashMap<[u8; 32], Sender<Envelope>>>>,
    inbox: Arc<Mutex<Receiver<Envelope>>>,
}

/// Create one connected [`MockNetwork`] per key, in the same order as `keys`.
pub(crate) fn mock_networks(keys: &[VerifyingKey]) -> Vec<MockNetwork> {
    let mut senders = HashMap::new();
    let mut inboxes = Vec::new();
    for key in keys {
        let (sender, inbox) = channel();
        senders.insert(key.to_bytes(), sender);
        inboxes.push(inbox);
    }

    let senders = Arc::new(Mutex::new(senders));
    keys.iter()
        .zip(inboxes)
        .map(|(key, inbox)| MockNetwork {
            my_key: key.to_bytes(),
            peers: senders.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
        })
        .collect()
}

impl Network for MockNetwork {
    fn init_peer_set(&mut self, _peers: PeerSet) {}

    fn broadcast(&mut self, envelope: Envelope) {
        for (key, sender) in self.peers.lock().unwrap().iter() {
            if *key != self.my_key {
                // A test may have shut one endpoint down already.
                let _ = sender.send(envelope.clone());
            }
        }
    }

    fn send(&mut self, peer: VerifyingKey, envelope: Envelope) {
        if let Some(sender) = self.peers.lock().unwrap().get(&peer.to_bytes()) {
            let _ = sender.send(envelope);
        }
    }

    fn recv(&mut self) -> Option<Envelope> {
        self.inbox.lock().unwrap().try_recv().ok()
    }
}

/// Middleware over any [`Network`] that can be told to drop all outbound traffic, turning its
/// replica into a silent faulty node.
#[derive(Clone)]
pub(crate) struct LossyNetwork<N: Network> {
    inner: N,
    mute_outbound: Arc<AtomicBool>,
}

impl<N: Network> LossyNetwork<N> {
    pub(crate) fn new(inner: N) -> LossyNetwork<N> {
        LossyNetwork {
            inner,
            mute_outbound: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn mute(&self) {
        self.mute_outbound.store(true, Ordering::Relaxed);
    }
}

impl<N: Network> Network for LossyNetwork<N> {
    fn init_peer_set(&mut self, peers: PeerSet) {
        self.inner.init_peer_set(peers)
    }

    fn broadcast(&mut self, envelope: Envelope) {
        if !self.mute_outbound.load(Ordering::Relaxed) {
            self.inner.broadcast(envelope)
        }
    }

    fn send(&mut self, peer: VerifyingKey, envelope: Envelope) {
        if !self.mute_outbound.load(Ordering::Relaxed) {
            self.inner.send(peer, envelope)
        }
    }

    fn recv(&mut self) -> Option<Envelope> {
        self.inner.recv()
    }
}
