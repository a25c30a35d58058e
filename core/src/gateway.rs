//! Transport-agnostic gateway: lifecycle, local short-circuit and subscriptions.
//!
//! A [`BusGateway`] owns one transport handle and one [`MessageStream`]. The
//! routing rules live here once; concrete adapters only implement
//! [`BusTransport`].
//!
//! ```text
//!  app ──post()──▶ BusGateway ──post_remote()──▶ transport ──▶ remote bus
//!                     │  sender == target: stop here
//!  app ◀──next()── MessageStream ◀──push()── inbound handler ◀── remote bus
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, debug_span, error, info, info_span, warn, Instrument};

use crate::message::{DistributedMessage, RecipientId};
use crate::stream::MessageStream;
use crate::{BusError, Result};

/// Transport-specific primitives behind a [`BusGateway`].
///
/// Implementations are constructed by their own `load(settings)` function and
/// must not perform I/O until [`connect`](BusTransport::connect).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BusTransport: Send + Sync + 'static {
    /// Identifier stamped on log lines and outgoing messages.
    fn transporter_id(&self) -> &'static str;

    /// Perform the connection handshake and register the inbound data
    /// handler. Every message received afterwards goes into `sink`.
    async fn connect(&self, sink: MessageStream) -> Result<()>;

    /// Publish a message to the remote bus. Only called for messages whose
    /// sender and target differ.
    async fn post_remote(&self, message: &DistributedMessage) -> Result<()>;

    /// Start delivering messages addressed to `recipient` into the sink
    /// registered by `connect`.
    async fn subscribe_to_bus(&self, recipient: &str) -> Result<Subscription>;

    async fn unsubscribe_from_bus(&self, _subscription: &Subscription) -> Result<()> {
        Ok(())
    }

    /// Close the connection. Safe to call on a transport that never connected.
    async fn close(&self) -> Result<()>;
}

/// Handle for one recipient's transport-level subscription.
///
/// Dropping it cancels the delivery task, if the transport attached one.
pub struct Subscription {
    recipient: RecipientId,
    topic: String,
    task: Option<AbortHandle>,
}

impl Subscription {
    pub fn new(recipient: impl Into<RecipientId>, topic: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            topic: topic.into(),
            task: None,
        }
    }

    /// Tie a delivery task to this subscription's lifetime.
    pub fn with_task(mut self, handle: &JoinHandle<()>) -> Self {
        self.task = Some(handle.abort_handle());
        self
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("recipient", &self.recipient)
            .field("topic", &self.topic)
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

/// Lifecycle of a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    /// Transport handle constructed, never enabled.
    Loaded,
    /// Connect handshake in flight.
    Connecting,
    /// Posts and subscriptions are permitted.
    Started,
    /// Disabled, or the last connect attempt failed. `enable()` may retry.
    Stopped,
}

impl GatewayState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => GatewayState::Loaded,
            1 => GatewayState::Connecting,
            2 => GatewayState::Started,
            _ => GatewayState::Stopped,
        }
    }
}

/// Memoized result of an enable attempt. Every caller of
/// [`BusGateway::enable`] during the same attempt gets a clone of it.
pub type EnableFuture = Shared<BoxFuture<'static, Result<()>>>;

struct Inner<T> {
    name: RecipientId,
    transport: T,
    state: AtomicU8,
    // Bumped by every enable attempt and every disable. Only written while
    // `started` is locked, together with `state`.
    generation: AtomicU64,
    // Write-once per attempt; cleared on failure and on disable.
    started: Mutex<Option<EnableFuture>>,
    // Serializes connect and close on the transport. Holds the generation of
    // the attempt whose connection is open, if any.
    connected_by: tokio::sync::Mutex<Option<u64>>,
    locale_targets: DashMap<RecipientId, Subscription>,
    output_stream: MessageStream,
}

/// Gateway between local code and one pub/sub transport.
///
/// Cloning is cheap and every clone refers to the same gateway.
pub struct BusGateway<T: BusTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: BusTransport> Clone for BusGateway<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: BusTransport> BusGateway<T> {
    /// Wrap a loaded transport. `name` is the gateway's own recipient name and
    /// is subscribed automatically by [`enable`](Self::enable).
    pub fn new(name: impl Into<RecipientId>, transport: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                transport,
                state: AtomicU8::new(GatewayState::Loaded as u8),
                generation: AtomicU64::new(0),
                started: Mutex::new(None),
                connected_by: tokio::sync::Mutex::new(None),
                locale_targets: DashMap::new(),
                output_stream: MessageStream::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn transporter_id(&self) -> &'static str {
        self.inner.transport.transporter_id()
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn state(&self) -> GatewayState {
        GatewayState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_started(&self) -> bool {
        self.state() == GatewayState::Started
    }

    /// Recipients currently subscribed through this gateway, sorted.
    pub fn locale_targets(&self) -> Vec<RecipientId> {
        let mut names: Vec<RecipientId> = self
            .inner
            .locale_targets
            .iter()
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn is_subscribed(&self, recipient: &str) -> bool {
        self.inner.locale_targets.contains_key(recipient)
    }

    /// The inbound message sink. Available before `enable()` so readers can
    /// attach early.
    pub fn output_stream(&self) -> MessageStream {
        self.inner.output_stream.clone()
    }

    fn set_state(&self, state: GatewayState) {
        self.inner.state.store(state as u8, Ordering::SeqCst);
    }

    fn started_slot(&self) -> MutexGuard<'_, Option<EnableFuture>> {
        self.inner
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    /// Connect the transport, subscribe the gateway's own name and start
    /// feeding the output stream.
    ///
    /// Single-flight: while an attempt is pending or after it succeeded, every
    /// call returns the same future and the transport connects only once. A
    /// failed attempt resolves to the transport's error and leaves the
    /// gateway unstarted; calling `enable()` again retries.
    pub fn enable(&self) -> EnableFuture {
        let mut slot = self.started_slot();
        if let Some(pending) = slot.as_ref() {
            return pending.clone();
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let span = info_span!(
            "bus.enable",
            gateway = %self.inner.name,
            transporter = self.transporter_id(),
            generation
        );
        let attempt = async move {
            let inner = weak
                .upgrade()
                .ok_or_else(|| BusError::Connection("gateway dropped before enable ran".into()))?;
            BusGateway { inner }.start(generation).await
        }
        .instrument(span)
        .boxed()
        .shared();

        self.set_state(GatewayState::Connecting);
        *slot = Some(attempt.clone());
        attempt
    }

    async fn start(&self, generation: u64) -> Result<()> {
        let mut connected_by = self.inner.connected_by.lock().await;
        // Left open by an attempt that a disable or a later enable() superseded.
        self.close_if_stale(&mut connected_by).await;

        let current = {
            let _slot = self.started_slot();
            let current = self.is_current(generation);
            if current {
                self.inner.output_stream.reopen();
            }
            current
        };
        if !current {
            return Err(disabled_during_connect());
        }

        if let Err(e) = self.inner.transport.connect(self.output_stream()).await {
            error!(error = %e, "Transport connect failed");
            self.abandon_attempt(generation);
            return Err(e);
        }
        *connected_by = Some(generation);

        let current = {
            let _slot = self.started_slot();
            let current = self.is_current(generation);
            if current {
                self.set_state(GatewayState::Started);
            }
            current
        };
        if !current {
            warn!("Gateway disabled while connecting; closing transport");
            self.close_transport(&mut connected_by).await;
            return Err(disabled_during_connect());
        }

        let own_name = self.inner.name.clone();
        if let Err(e) = self.subscribe(&own_name).await {
            error!(error = %e, "Default self-subscription failed");
            self.close_transport(&mut connected_by).await;
            self.abandon_attempt(generation);
            return Err(e);
        }

        info!("Gateway started");
        Ok(())
    }

    async fn close_transport(&self, connected_by: &mut Option<u64>) {
        if let Err(e) = self.inner.transport.close().await {
            warn!(gateway = %self.inner.name, error = %e, "Failed to close transport");
        }
        *connected_by = None;
    }

    async fn close_if_stale(&self, connected_by: &mut Option<u64>) {
        if let Some(owner) = *connected_by {
            if !self.is_current(owner) {
                self.close_transport(connected_by).await;
            }
        }
    }

    /// Roll back a failed attempt, unless a disable or a newer attempt has
    /// already taken over.
    fn abandon_attempt(&self, generation: u64) {
        let mut slot = self.started_slot();
        if !self.is_current(generation) {
            return;
        }
        self.set_state(GatewayState::Stopped);
        self.inner.locale_targets.clear();
        *slot = None;
    }

    /// Close the transport. A no-op when the gateway was never enabled or is
    /// already stopped. Buffered messages stay in the output stream; readers
    /// see the end of the stream once they drain it.
    ///
    /// Disabling during a pending `enable()` does not wait for the handshake:
    /// the pending attempt fails and closes whatever it opened.
    pub async fn disable(&self) {
        let previous = {
            let mut slot = self.started_slot();
            let previous = self.state();
            if matches!(previous, GatewayState::Loaded | GatewayState::Stopped) {
                debug!(gateway = %self.inner.name, "Gateway not enabled; nothing to disable");
                return;
            }
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            self.set_state(GatewayState::Stopped);
            *slot = None;
            self.inner.locale_targets.clear();
            self.inner.output_stream.close();
            previous
        };

        if previous == GatewayState::Started {
            let mut connected_by = self.inner.connected_by.lock().await;
            self.close_if_stale(&mut connected_by).await;
        } else if let Ok(mut connected_by) = self.inner.connected_by.try_lock() {
            // Nothing is connecting right now; an attempt that holds the lock
            // closes its own connection once it sees it was superseded.
            self.close_if_stale(&mut connected_by).await;
        }
        info!(gateway = %self.inner.name, ?previous, "Gateway disabled");
    }

    fn ensure_started(&self, operation: &str) -> Result<()> {
        if self.is_started() {
            return Ok(());
        }
        error!(
            gateway = %self.inner.name,
            state = ?self.state(),
            operation,
            "Gateway used before enable() completed"
        );
        Err(BusError::NotStarted(self.inner.name.clone()))
    }

    /// Send a message. Messages addressed to their own sender are dropped
    /// here without touching the transport. Publish failures are returned
    /// to the caller; nothing is buffered or retried.
    pub async fn post(&self, message: &DistributedMessage) -> Result<()> {
        self.ensure_started("post")?;

        if message.is_loopback() {
            debug!(
                gateway = %self.inner.name,
                recipient = %message.target(),
                "Local short-circuit; not posting to bus"
            );
            return Ok(());
        }

        let span = debug_span!(
            "bus.post",
            gateway = %self.inner.name,
            sender = %message.sender(),
            recipient = %message.target()
        );
        self.inner
            .transport
            .post_remote(message)
            .instrument(span)
            .await
    }

    /// Route messages addressed to `recipient` into the output stream.
    /// Subscribing a name twice keeps the first subscription.
    pub async fn subscribe(&self, recipient: &str) -> Result<()> {
        self.ensure_started("subscribe")?;
        let generation = self.inner.generation.load(Ordering::SeqCst);
        if recipient.is_empty() {
            return Err(BusError::Subscription("recipient name is empty".into()));
        }
        if self.inner.locale_targets.contains_key(recipient) {
            debug!(gateway = %self.inner.name, recipient, "Already subscribed");
            return Ok(());
        }

        let span = info_span!("bus.subscribe", gateway = %self.inner.name, recipient);
        let subscription = self
            .inner
            .transport
            .subscribe_to_bus(recipient)
            .instrument(span)
            .await?;

        let rejected = {
            let _slot = self.started_slot();
            if !self.is_current(generation) || !self.is_started() {
                Some((subscription, true))
            } else {
                match self.inner.locale_targets.entry(recipient.to_string()) {
                    // A concurrent subscribe for the same name got there first.
                    Entry::Occupied(_) => Some((subscription, false)),
                    Entry::Vacant(slot) => {
                        slot.insert(subscription);
                        None
                    }
                }
            }
        };
        let Some((extra, disabled)) = rejected else {
            info!(gateway = %self.inner.name, recipient, "Subscribed");
            return Ok(());
        };
        if let Err(e) = self.inner.transport.unsubscribe_from_bus(&extra).await {
            warn!(recipient, error = %e, "Failed to release unused subscription");
        }
        if disabled {
            warn!(gateway = %self.inner.name, recipient, "Gateway disabled while subscribing");
            return Err(BusError::NotStarted(self.inner.name.clone()));
        }
        Ok(())
    }

    /// Stop routing messages for `recipient`. Returns whether it was subscribed.
    pub async fn unsubscribe(&self, recipient: &str) -> Result<bool> {
        let Some((_, subscription)) = self.inner.locale_targets.remove(recipient) else {
            return Ok(false);
        };
        self.inner
            .transport
            .unsubscribe_from_bus(&subscription)
            .await?;
        info!(gateway = %self.inner.name, recipient, "Unsubscribed");
        Ok(true)
    }
}

fn disabled_during_connect() -> BusError {
    BusError::Connection("gateway was disabled during connect".into())
}
