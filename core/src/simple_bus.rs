//! In-process pub/sub hub backing [`SimpleBusClient`](crate::SimpleBusClient).
//!
//! A `SimpleBus` is owned by whoever creates it and shared by `Arc`; there is
//! no process-wide instance. Connections exchange JSON wire bytes routed by
//! exact recipient name within a namespace.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{BusError, Result};

/// Lifecycle and data events delivered to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    Data(Vec<u8>),
    Error(String),
    Close,
    End,
}

/// The hub. Create one per logical bus and hand clones of the `Arc` to every
/// gateway that should see the same traffic.
#[derive(Debug)]
pub struct SimpleBus {
    // "<namespace>/<filter>" -> connection ids
    routes: DashMap<String, HashSet<u64>>,
    connections: DashMap<u64, mpsc::UnboundedSender<ConnectionEvent>>,
    next_id: AtomicU64,
    accepting: AtomicBool,
}

impl Default for SimpleBus {
    fn default() -> Self {
        Self {
            routes: DashMap::new(),
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
        }
    }
}

fn route_key(namespace: &str, filter: &str) -> String {
    format!("{}/{}", namespace, filter)
}

impl SimpleBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a connection handle. Nothing is registered until
    /// [`SimpleBusConnection::start`].
    pub fn connection(self: &Arc<Self>, namespace: impl Into<String>) -> SimpleBusConnection {
        SimpleBusConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            namespace: namespace.into(),
            bus: Arc::clone(self),
            events: Mutex::new(None),
            filters: Mutex::new(HashSet::new()),
        }
    }

    /// When false, new connections fail their handshake.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Drop a connection from the hub side: it receives `Error(reason)`,
    /// `Close` and `End`, and its routes are removed.
    pub fn kick(&self, connection_id: u64, reason: &str) {
        if let Some((_, tx)) = self.connections.remove(&connection_id) {
            let _ = tx.send(ConnectionEvent::Error(reason.to_string()));
            let _ = tx.send(ConnectionEvent::Close);
            let _ = tx.send(ConnectionEvent::End);
        }
        self.forget_routes(connection_id);
    }

    /// Shut the hub down; every connection receives `End`.
    pub fn shutdown(&self) {
        for entry in self.connections.iter() {
            let _ = entry.value().send(ConnectionEvent::End);
        }
        self.connections.clear();
        self.routes.clear();
        info!("Simple bus shut down");
    }

    fn forget_routes(&self, connection_id: u64) {
        for mut entry in self.routes.iter_mut() {
            entry.value_mut().remove(&connection_id);
        }
        self.routes.retain(|_, ids| !ids.is_empty());
    }

    fn route(&self, namespace: &str, target: &str, bytes: &[u8]) -> usize {
        let Some(ids) = self
            .routes
            .get(&route_key(namespace, target))
            .map(|ids| ids.value().clone())
        else {
            return 0;
        };
        let mut delivered = 0;
        for id in ids {
            if let Some(tx) = self.connections.get(&id) {
                if tx.send(ConnectionEvent::Data(bytes.to_vec())).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

/// One client's view of a [`SimpleBus`].
#[derive(Debug)]
pub struct SimpleBusConnection {
    id: u64,
    namespace: String,
    bus: Arc<SimpleBus>,
    events: Mutex<Option<mpsc::UnboundedSender<ConnectionEvent>>>,
    filters: Mutex<HashSet<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimpleBusConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// True between `start()` and `stop()`, unless the hub dropped the
    /// connection in the meantime.
    pub fn is_started(&self) -> bool {
        lock(&self.events).is_some() && self.bus.connections.contains_key(&self.id)
    }

    /// Register with the hub. Returns the receiver of this connection's
    /// events, starting with `Connect`.
    pub async fn start(&self) -> Result<mpsc::UnboundedReceiver<ConnectionEvent>> {
        if !self.bus.accepting.load(Ordering::SeqCst) {
            return Err(BusError::Connection(format!(
                "simple bus refused connection {}",
                self.id
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ConnectionEvent::Connect);
        self.bus.connections.insert(self.id, tx.clone());
        *lock(&self.events) = Some(tx);
        debug!(connection = self.id, namespace = %self.namespace, "Simple bus connection started");
        Ok(rx)
    }

    fn ensure_started(&self) -> Result<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(BusError::Connection(format!(
                "simple bus connection {} is not started",
                self.id
            )))
        }
    }

    pub fn subscribe(&self, filter: &str) -> Result<()> {
        self.ensure_started()?;
        if lock(&self.filters).insert(filter.to_string()) {
            self.bus
                .routes
                .entry(route_key(&self.namespace, filter))
                .or_default()
                .insert(self.id);
        }
        Ok(())
    }

    pub fn unsubscribe(&self, filter: &str) {
        if lock(&self.filters).remove(filter) {
            let key = route_key(&self.namespace, filter);
            if let Some(mut ids) = self.bus.routes.get_mut(&key) {
                ids.remove(&self.id);
            }
            self.bus.routes.remove_if(&key, |_, ids| ids.is_empty());
        }
    }

    /// Publish wire bytes to every connection subscribed to `target`.
    /// Returns the number of connections reached.
    pub fn post(&self, target: &str, bytes: &[u8]) -> Result<usize> {
        self.ensure_started()?;
        Ok(self.bus.route(&self.namespace, target, bytes))
    }

    /// Deregister from the hub. The event receiver sees `Close` and `End`
    /// (unless the hub already sent them) and then ends.
    pub fn stop(&self) {
        let Some(tx) = lock(&self.events).take() else {
            return;
        };
        let registered = self.bus.connections.remove(&self.id).is_some();
        self.bus.forget_routes(self.id);
        lock(&self.filters).clear();
        if registered {
            let _ = tx.send(ConnectionEvent::Close);
            let _ = tx.send(ConnectionEvent::End);
        }
        debug!(connection = self.id, "Simple bus connection stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_by_target_within_namespace() {
        let bus = SimpleBus::new();
        let a = bus.connection("ns");
        let b = bus.connection("ns");
        let other = bus.connection("elsewhere");
        let _rx_a = a.start().await.unwrap();
        let mut rx_b = b.start().await.unwrap();
        let mut rx_other = other.start().await.unwrap();
        b.subscribe("worker").unwrap();
        other.subscribe("worker").unwrap();

        assert_eq!(a.post("worker", b"hi").unwrap(), 1);
        assert_eq!(rx_b.recv().await, Some(ConnectionEvent::Connect));
        assert_eq!(rx_b.recv().await, Some(ConnectionEvent::Data(b"hi".to_vec())));
        assert_eq!(rx_other.recv().await, Some(ConnectionEvent::Connect));
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn refused_handshake() {
        let bus = SimpleBus::new();
        bus.set_accepting(false);
        let conn = bus.connection("ns");
        assert!(matches!(conn.start().await, Err(BusError::Connection(_))));
        assert!(!conn.is_started());
        assert!(conn.post("x", b"").is_err());
    }

    #[tokio::test]
    async fn stop_ends_event_stream() {
        let bus = SimpleBus::new();
        let conn = bus.connection("ns");
        let mut rx = conn.start().await.unwrap();
        conn.subscribe("me").unwrap();
        conn.stop();

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        assert_eq!(
            events,
            vec![
                ConnectionEvent::Connect,
                ConnectionEvent::Close,
                ConnectionEvent::End
            ]
        );
        assert_eq!(bus.connection_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_ends_every_connection() {
        let bus = SimpleBus::new();
        let a = bus.connection("ns");
        let mut rx = a.start().await.unwrap();
        a.subscribe("me").unwrap();

        bus.shutdown();
        assert_eq!(bus.connection_count(), 0);
        assert_eq!(rx.recv().await, Some(ConnectionEvent::Connect));
        assert_eq!(rx.recv().await, Some(ConnectionEvent::End));
        assert!(!a.is_started());
        assert!(a.post("me", b"x").is_err());
    }

    #[tokio::test]
    async fn kicked_connection_can_no_longer_post() {
        let bus = SimpleBus::new();
        let kicked = bus.connection("ns");
        let listener = bus.connection("ns");
        let mut rx = kicked.start().await.unwrap();
        let _rx_listener = listener.start().await.unwrap();
        listener.subscribe("me").unwrap();

        bus.kick(kicked.id(), "maintenance");
        assert!(!kicked.is_started());
        assert!(matches!(kicked.post("me", b"x"), Err(BusError::Connection(_))));
        assert!(kicked.subscribe("again").is_err());
        assert_eq!(listener.post("me", b"x").unwrap(), 1);

        // Stopping after a kick still ends the event stream.
        kicked.stop();
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        assert_eq!(
            events,
            vec![
                ConnectionEvent::Connect,
                ConnectionEvent::Error("maintenance".into()),
                ConnectionEvent::Close,
                ConnectionEvent::End
            ]
        );
    }

    #[tokio::test]
    async fn unsubscribe_stops_routing() {
        let bus = SimpleBus::new();
        let sender = bus.connection("ns");
        let receiver = bus.connection("ns");
        let _tx_rx = sender.start().await.unwrap();
        let _rx = receiver.start().await.unwrap();
        receiver.subscribe("me").unwrap();
        receiver.unsubscribe("me");
        assert_eq!(sender.post("me", b"x").unwrap(), 0);
    }
}
