//! Lifecycle events of persistent, WebSocket-style connections.
//!
//! The embedding server owns the upgrade handshake and frame codec. It reports
//! each connection's open, message, error and close events to a
//! [`ConnectionHub`], and every event enters the pipeline as a correlation of
//! its own. Whatever the terminal replies to an event goes back to that
//! connection as one frame; empty replies send nothing.

use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use relay_core::{CorrelationId, EventKind, RelayError, Reply, Request, ResponseSink, Task};
use serde_json::{json, Value};

use crate::server::RelayHandle;

/// Outbound half of one persistent connection.
pub trait Connection: Send + Sync {
    fn send(&self, frame: Bytes) -> Result<(), RelayError>;
}

struct Peer {
    path: String,
    connection: Arc<dyn Connection>,
}

/// Registry of open connections feeding their events into a relay.
pub struct ConnectionHub {
    relay: RelayHandle,
    peers: RwLock<HashMap<u64, Peer>>,
    next_id: AtomicU64,
    tag: String,
}

impl ConnectionHub {
    /// Events are published with the relay's initial tag unless
    /// [`with_tag`](Self::with_tag) says otherwise.
    pub fn new(relay: RelayHandle) -> Self {
        let tag = relay.config().initial_tag.clone();
        Self {
            relay,
            peers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tag,
        }
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_string();
        self
    }

    /// Registers a connection accepted on `path` and raises its open event.
    pub fn open(&self, path: &str, connection: Arc<dyn Connection>) -> Result<u64, RelayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut peers) = self.peers.write() {
            peers.insert(
                id,
                Peer {
                    path: path.to_string(),
                    connection,
                },
            );
        }
        tracing::debug!("ConnectionHub: connection {} opened on {}", id, path);

        if let Err(e) = self.raise(id, EventKind::Open, Bytes::new(), None) {
            self.forget(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Raises a message event carrying `payload` as the request body.
    pub fn message(&self, id: u64, payload: impl Into<Bytes>) -> Result<CorrelationId, RelayError> {
        self.raise(id, EventKind::Message, payload.into(), None)
    }

    /// Raises an error event. The task data is
    /// `{"errorCode": {"name": name, "value": code}}`.
    pub fn error(&self, id: u64, name: &str, code: i32) -> Result<CorrelationId, RelayError> {
        let data = json!({ "errorCode": { "name": name, "value": code } });
        self.raise(id, EventKind::Error, Bytes::new(), Some(data))
    }

    /// Unregisters the connection and raises its close event. The task data
    /// is `{"status": status, "reason": reason}`; replies are dropped.
    pub fn close(&self, id: u64, status: u16, reason: &str) -> Result<CorrelationId, RelayError> {
        let peer = self.forget(id).ok_or(RelayError::UnknownConnection(id))?;
        tracing::debug!("ConnectionHub: connection {} closed ({})", id, status);

        let data = json!({ "status": status, "reason": reason });
        let request = Request::connection_event(EventKind::Close, id, peer.path);
        self.publish(request, None, Some(data))
    }

    /// Sends one frame to one open connection.
    pub fn send(&self, id: u64, frame: impl Into<Bytes>) -> Result<(), RelayError> {
        let connection = self
            .connection(id)
            .ok_or(RelayError::UnknownConnection(id))?;
        connection.send(frame.into())
    }

    /// Sends `frame` to every open connection. Returns how many accepted it.
    pub fn broadcast(&self, frame: impl Into<Bytes>) -> usize {
        let frame = frame.into();
        let connections: Vec<(u64, Arc<dyn Connection>)> = match self.peers.read() {
            Ok(peers) => peers
                .iter()
                .map(|(id, peer)| (*id, peer.connection.clone()))
                .collect(),
            Err(_) => return 0,
        };

        let mut sent = 0;
        for (id, connection) in connections {
            match connection.send(frame.clone()) {
                Ok(()) => sent += 1,
                Err(e) => tracing::debug!("ConnectionHub: broadcast to {} failed: {}", id, e),
            }
        }
        sent
    }

    pub fn len(&self) -> usize {
        self.peers.read().map(|peers| peers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn connection(&self, id: u64) -> Option<Arc<dyn Connection>> {
        let peers = self.peers.read().ok()?;
        peers.get(&id).map(|peer| peer.connection.clone())
    }

    fn forget(&self, id: u64) -> Option<Peer> {
        self.peers.write().ok()?.remove(&id)
    }

    fn raise(
        &self,
        id: u64,
        event: EventKind,
        body: Bytes,
        data: Option<Value>,
    ) -> Result<CorrelationId, RelayError> {
        let (path, connection) = {
            let peers = self.peers.read().map_err(|_| RelayError::UnknownConnection(id))?;
            let peer = peers.get(&id).ok_or(RelayError::UnknownConnection(id))?;
            (peer.path.clone(), peer.connection.clone())
        };
        let request = Request::connection_event(event, id, path).with_body(body);
        self.publish(request, Some(connection), data)
    }

    fn publish(
        &self,
        request: Request,
        connection: Option<Arc<dyn Connection>>,
        data: Option<Value>,
    ) -> Result<CorrelationId, RelayError> {
        let sink = Arc::new(ConnectionSink { connection });
        let correlation = self.relay.open(request, sink);
        let id = correlation.id();
        let mut task = Task::new(correlation, &self.tag);
        if let Some(data) = data {
            task.set_data(data);
        }
        self.relay.publish(task)?;
        Ok(id)
    }
}

/// Forwards the reply to an event back to its connection as one frame.
struct ConnectionSink {
    connection: Option<Arc<dyn Connection>>,
}

impl ResponseSink for ConnectionSink {
    fn write(&self, reply: Reply) -> Result<(), RelayError> {
        match &self.connection {
            Some(connection) if !reply.body.is_empty() => connection.send(reply.body),
            _ => Ok(()),
        }
    }

    // Connections have no status line to carry a fallback on.
    fn fallback(&self, _error: &RelayError) -> Reply {
        Reply::new(500)
    }
}
