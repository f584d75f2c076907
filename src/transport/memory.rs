//! In-memory transport.
//!
//! Each dial consumes the next scripted [`DialOutcome`] (accepting when the
//! script is empty). Accepted dials hand a [`MemoryPeer`] to the
//! [`MemoryListener`], which plays the server side: it pushes frames to the
//! client and reads what the client wrote.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use url::Url;

use super::{Transport, TransportConnection, TransportError, TransportEvent};

/// Scripted result of one dial
#[derive(Debug, Clone)]
pub enum DialOutcome {
    Accept,
    Refuse(TransportError),
    /// Never completes; exercises the connection timeout
    Hang,
}

/// What the client wrote, as seen by the peer
#[derive(Debug, Clone, PartialEq, Eq)]
enum ClientEvent {
    Text(String),
    Closed { code: u16, reason: String },
}

#[derive(Clone)]
pub struct MemoryTransport {
    script: Arc<Mutex<VecDeque<DialOutcome>>>,
    dials: Arc<AtomicU32>,
    accepted: mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryListener) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let transport = Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            dials: Arc::new(AtomicU32::new(0)),
            accepted,
        };
        (transport, MemoryListener { rx })
    }

    /// Queue the outcome of a future dial.
    pub fn push_outcome(&self, outcome: DialOutcome) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
    }

    /// Refuse the next `count` dials with a connection error.
    pub fn refuse_next(&self, count: usize) {
        for _ in 0..count {
            self.push_outcome(DialOutcome::Refuse(TransportError::Connect(
                "connection refused".to_string(),
            )));
        }
    }

    /// Total dials attempted so far
    pub fn dial_count(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, url: &Url) -> Result<Box<dyn TransportConnection>, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        let outcome = self
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or(DialOutcome::Accept);

        match outcome {
            DialOutcome::Accept => {
                let (to_client, incoming) = mpsc::unbounded_channel();
                let (outgoing, from_client) = mpsc::unbounded_channel();

                let peer = MemoryPeer {
                    url: url.clone(),
                    to_client,
                    from_client,
                };
                self.accepted
                    .send(peer)
                    .map_err(|_| TransportError::Connect("memory listener dropped".to_string()))?;

                Ok(Box::new(MemoryConnection { incoming, outgoing }))
            }
            DialOutcome::Refuse(error) => Err(error),
            DialOutcome::Hang => std::future::pending().await,
        }
    }
}

/// Receives the server side of each accepted dial
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryListener {
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.rx.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.rx.try_recv().ok()
    }
}

/// Server side of one in-memory connection. Dropping it looks like an
/// abrupt network loss to the client.
pub struct MemoryPeer {
    url: Url,
    to_client: mpsc::UnboundedSender<TransportEvent>,
    from_client: mpsc::UnboundedReceiver<ClientEvent>,
}

impl MemoryPeer {
    /// URL the client dialed
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(TransportEvent::Text(text.into())).is_ok()
    }

    pub fn send_json(&self, value: Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Complete the handshake with a `connection_established` frame.
    pub fn establish(&self, connection_id: &str) -> bool {
        self.send_json(json!({
            "type": "connection_established",
            "channel": "system",
            "data": {
                "connection_id": connection_id,
                "user_id": null,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }))
    }

    /// Push a data frame for `channel`.
    pub fn publish(&self, kind: &str, channel: &str, data: Value) -> bool {
        self.send_json(json!({ "type": kind, "channel": channel, "data": data }))
    }

    /// Send a close frame to the client.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.to_client
            .send(TransportEvent::Closed {
                code,
                reason: reason.to_string(),
            })
            .is_ok()
    }

    /// Next JSON frame written by the client; `None` once it closed.
    pub async fn recv_json(&mut self) -> Option<Value> {
        loop {
            match self.from_client.recv().await? {
                ClientEvent::Text(text) => match serde_json::from_str(&text) {
                    Ok(value) => return Some(value),
                    Err(e) => tracing::warn!(error = %e, "Client wrote non-JSON frame"),
                },
                ClientEvent::Closed { .. } => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv_json`](Self::recv_json).
    pub fn try_recv_json(&mut self) -> Option<Value> {
        match self.from_client.try_recv().ok()? {
            ClientEvent::Text(text) => serde_json::from_str(&text).ok(),
            ClientEvent::Closed { .. } => None,
        }
    }

    /// Wait for the client's close frame, skipping data frames.
    pub async fn recv_close(&mut self) -> Option<(u16, String)> {
        loop {
            if let ClientEvent::Closed { code, reason } = self.from_client.recv().await? {
                return Some((code, reason));
            }
        }
    }
}

struct MemoryConnection {
    incoming: mpsc::UnboundedReceiver<TransportEvent>,
    outgoing: mpsc::UnboundedSender<ClientEvent>,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.outgoing
            .send(ClientEvent::Text(text))
            .map_err(|_| TransportError::Send("memory peer dropped".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<TransportEvent, TransportError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let _ = self.outgoing.send(ClientEvent::Closed {
            code,
            reason: reason.to_string(),
        });
        self.incoming.close();
    }
}
