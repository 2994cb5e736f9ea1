//! In-memory transport driven step by step from tests

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{Connection, Transport, TransportError};

enum Outcome {
    Fail,
    Accept(ScriptedConnection),
}

/// Each `open` consumes the next scripted outcome. With nothing scripted the
/// handshake never completes.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    outcomes: Mutex<VecDeque<Outcome>>,
    opens: AtomicUsize,
    addresses: Mutex<Vec<String>>,
}

/// Server side of an accepted scripted connection
pub(crate) struct Remote {
    frames: mpsc::UnboundedSender<Result<String, TransportError>>,
    sent: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

struct ScriptedConnection {
    frames: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    sent: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail(&self) {
        self.outcomes.lock().unwrap().push_back(Outcome::Fail);
    }

    pub(crate) fn accept(&self) -> Remote {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        self.outcomes.lock().unwrap().push_back(Outcome::Accept(ScriptedConnection {
            frames: frames_rx,
            sent: sent_tx,
            closed: closed.clone(),
        }));

        Remote {
            frames: frames_tx,
            sent: sent_rx,
            closed,
        }
    }

    /// Number of `open` calls so far, including pending ones
    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn addresses(&self) -> Vec<String> {
        self.addresses.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, address: &str) -> Result<Box<dyn Connection>, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.addresses.lock().unwrap().push(address.to_string());

        let next = self.outcomes.lock().unwrap().pop_front();
        match next {
            Some(Outcome::Accept(connection)) => Ok(Box::new(connection)),
            Some(Outcome::Fail) => Err(TransportError::Connect("connection refused".to_string())),
            None => std::future::pending().await,
        }
    }
}

impl Remote {
    pub(crate) fn push(&self, text: &str) {
        let _ = self.frames.send(Ok(text.to_string()));
    }

    pub(crate) fn push_json(&self, value: serde_json::Value) {
        self.push(&value.to_string());
    }

    pub(crate) fn break_with(&self, error: TransportError) {
        let _ = self.frames.send(Err(error));
    }

    /// Peer closes: the client sees end of stream
    pub(crate) fn hang_up(self) {
        drop(self);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) async fn next_sent(&mut self) -> Option<String> {
        self.sent.recv().await
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.frames.recv().await
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.sent
            .send(text)
            .map_err(|_| TransportError::Send("remote gone".to_string()))
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Drop for ScriptedConnection {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
