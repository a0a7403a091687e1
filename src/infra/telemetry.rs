//! The telemetry broker: one in-process bus fanned out to WebSocket
//! observers, persisted best-effort into the event store.
//!
//! Every observer owns a bounded queue. A client that stops draining it is
//! disconnected rather than allowed to block the broker or other clients.

use {
    crate::{
        domain::telemetry::{Event, Kind, Timestamp},
        infra::{metrics, store::EventStore},
    },
    futures::future::BoxFuture,
    std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    tokio::sync::{broadcast, mpsc},
};

/// Builds the `INITIAL_*_STATE` snapshot messages a freshly connected
/// observer receives before any live events.
pub type Hydrator = Box<dyn Fn() -> BoxFuture<'static, serde_json::Value> + Send + Sync>;

struct Client {
    id: u64,
    queue: mpsc::Sender<String>,
}

pub struct Broker {
    node_id: String,
    store: Option<Arc<EventStore>>,
    clients: Mutex<Vec<Client>>,
    tap: broadcast::Sender<Event>,
    hydrators: Mutex<Vec<Hydrator>>,
    queue_capacity: usize,
    next_client: AtomicU64,
}

impl Broker {
    pub fn new(node_id: impl Into<String>, store: Option<Arc<EventStore>>, queue_capacity: usize) -> Self {
        let (tap, _) = broadcast::channel(1024);
        Self {
            node_id: node_id.into(),
            store,
            clients: Mutex::new(Vec::new()),
            tap,
            hydrators: Mutex::new(Vec::new()),
            queue_capacity,
            next_client: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Registers a snapshot source consulted on every `CLIENT_CONNECT`.
    pub fn add_hydrator(&self, hydrator: Hydrator) {
        self.hydrators.lock().unwrap().push(hydrator);
    }

    /// Publishes one event: persists it (best effort), taps it to in-process
    /// subscribers, and fans it out to every observer queue. Slow observers
    /// are dropped here.
    pub fn emit(&self, kind: Kind) {
        let event = Event {
            node_id: self.node_id.clone(),
            timestamp: Timestamp::now(),
            kind,
        };

        if let Some(store) = &self.store {
            let store = Arc::clone(store);
            let persisted = event.clone();
            tokio::spawn(async move {
                if let Err(err) = store.store_event(&persisted).await {
                    metrics::store_write("error");
                    tracing::warn!(?err, "failed to persist telemetry event");
                }
            });
        }

        let _ = self.tap.send(event.clone());

        let serialized = match serde_json::to_string(&event) {
            Ok(serialized) => serialized,
            Err(err) => {
                tracing::error!(?err, "unserializable telemetry event");
                return;
            }
        };
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|client| match client.queue.try_send(serialized.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(client = client.id, "telemetry client too slow, disconnecting");
                metrics::telemetry_client_too_slow();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// In-process subscription (fraud detector, tests). Per-publisher order
    /// is preserved; laggards see `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tap.subscribe()
    }

    /// Registers an observer queue. Dropping the receiver unregisters it on
    /// the next emit.
    pub fn register_client(&self) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        self.clients.lock().unwrap().push(Client { id, queue: tx });
        metrics::telemetry_client_connected();
        (id, rx)
    }

    pub fn unregister_client(&self, id: u64) {
        self.clients.lock().unwrap().retain(|client| client.id != id);
        metrics::telemetry_client_disconnected();
    }

    /// The snapshot messages for a new observer, in registration order.
    pub async fn snapshots(&self) -> Vec<String> {
        let futures: Vec<_> = {
            let hydrators = self.hydrators.lock().unwrap();
            hydrators.iter().map(|hydrator| hydrator()).collect()
        };
        let mut messages = Vec::with_capacity(futures.len());
        for future in futures {
            match serde_json::to_string(&future.await) {
                Ok(message) => messages.push(message),
                Err(err) => tracing::warn!(?err, "unserializable hydration snapshot"),
            }
        }
        messages
    }
}
