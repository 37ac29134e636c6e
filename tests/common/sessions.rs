//! A [`Session`] implementation that captures everything sent through it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use pbft_rs::messages::{DatabaseResponse, Envelope};
use pbft_rs::session::Session;

pub(crate) struct TestSession {
    open: AtomicBool,
    outbox: Mutex<Vec<Envelope>>,
}

impl TestSession {
    pub(crate) fn new() -> TestSession {
        TestSession {
            open: AtomicBool::new(true),
            outbox: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
    }

    pub(crate) fn sent(&self) -> Vec<Envelope> {
        self.outbox.lock().unwrap().clone()
    }

    pub(crate) fn responses(&self) -> Vec<DatabaseResponse> {
        self.sent()
            .iter()
            .filter_map(|envelope| envelope.to_database_response())
            .collect()
    }
}

impl Session for TestSession {
    fn send_message(&self, envelope: Envelope) {
        self.outbox.lock().unwrap().push(envelope);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}
