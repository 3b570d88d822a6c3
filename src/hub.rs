use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Per-client outbound queue depth. A client that cannot drain this many
/// envelopes is considered slow and is disconnected; senders never block.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 128;

/// Typed event delivered to connected clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(
        event_type: impl Into<String>,
        session_id: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Envelope {
            event_type: event_type.into(),
            session_id,
            payload,
        }
    }
}

struct ClientHandle {
    user_id: String,
    tx: mpsc::Sender<String>,
}

struct HubInner {
    clients: Mutex<HashMap<u64, ClientHandle>>,
    next_id: AtomicU64,
}

/// Process-local registry of live WebSocket clients keyed by user identity.
/// One user may hold several connections (several devices); each gets its own
/// bounded queue. Delivery serializes the envelope once and fans the string
/// out; writes within one client are FIFO, across clients unordered.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Hub {
            inner: Arc::new(HubInner {
                clients: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Admit a connection for `user_id`. The returned receiver yields
    /// pre-serialized envelope JSON; a `None` from it means the hub dropped
    /// the client (slow consumer or shutdown) and the socket should close
    /// with a normal-closure frame.
    pub fn register(&self, user_id: &str) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.clients.lock().unwrap().insert(
            id,
            ClientHandle {
                user_id: user_id.to_string(),
                tx,
            },
        );
        tracing::debug!("realtime client {id} connected for user {user_id}");
        (id, rx)
    }

    pub fn unregister(&self, conn_id: u64) {
        self.inner.clients.lock().unwrap().remove(&conn_id);
    }

    pub fn connection_count(&self) -> usize {
        self.inner.clients.lock().unwrap().len()
    }

    pub fn broadcast(&self, envelope: &Envelope) {
        self.deliver(envelope, |_| true);
    }

    pub fn send_to_user(&self, user_id: &str, envelope: &Envelope) {
        self.deliver(envelope, |uid| uid == user_id);
    }

    pub fn send_to_users(&self, user_ids: &[String], envelope: &Envelope) {
        self.deliver(envelope, |uid| user_ids.iter().any(|u| u == uid));
    }

    /// Drop every client. Writer tasks observe the closed queue and emit a
    /// normal-closure frame before exiting.
    pub fn close_all(&self) {
        self.inner.clients.lock().unwrap().clear();
    }

    fn deliver(&self, envelope: &Envelope, target: impl Fn(&str) -> bool) {
        let text = match serde_json::to_string(envelope) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("failed to serialize envelope {}: {e}", envelope.event_type);
                return;
            }
        };
        let mut clients = self.inner.clients.lock().unwrap();
        let mut slow: Vec<u64> = Vec::new();
        for (id, client) in clients.iter() {
            if !target(&client.user_id) {
                continue;
            }
            if client.tx.try_send(text.clone()).is_err() {
                slow.push(*id);
            }
        }
        for id in slow {
            if let Some(client) = clients.remove(&id) {
                tracing::warn!(
                    "dropping slow realtime client for user {} (queue full)",
                    client.user_id
                );
            }
        }
    }
}
