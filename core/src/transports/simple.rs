use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::gateway::{BusTransport, Subscription};
use crate::message::DistributedMessage;
use crate::settings::{setting_or, SettingsSource};
use crate::simple_bus::{ConnectionEvent, SimpleBus, SimpleBusConnection};
use crate::stream::MessageStream;
use crate::Result;

/// Adapter over one [`SimpleBusConnection`].
///
/// Reads `bus.simple.namespace` (default `"default"`); needs no host or port.
pub struct SimpleBusTransport {
    connection: SimpleBusConnection,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SimpleBusTransport {
    pub fn load(bus: &Arc<SimpleBus>, settings: &dyn SettingsSource) -> Self {
        let namespace: String =
            setting_or(settings, &["bus", "simple", "namespace"], "default".to_string());
        Self {
            connection: bus.connection(namespace),
            pump: Mutex::new(None),
        }
    }

    pub fn connection(&self) -> &SimpleBusConnection {
        &self.connection
    }
}

/// Forward connection events into the gateway's output stream until the
/// connection ends.
async fn pump_events(
    connection_id: u64,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    sink: MessageStream,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Data(bytes) => match DistributedMessage::from_bytes(&bytes) {
                Ok(message) => {
                    if !sink.push(message) {
                        debug!(connection = connection_id, "Output stream closed; dropping message");
                    }
                }
                Err(e) => {
                    warn!(connection = connection_id, error = %e, "Dropping undecodable simple bus data");
                }
            },
            ConnectionEvent::Connect => info!(connection = connection_id, "Simple bus connected"),
            ConnectionEvent::End => info!(connection = connection_id, "Simple bus stream ended"),
            ConnectionEvent::Error(reason) => warn!(
                connection = connection_id,
                reason = %reason,
                "Simple bus error; gateway may need to be re-enabled"
            ),
            ConnectionEvent::Close => warn!(
                connection = connection_id,
                "Simple bus connection closed; gateway may need to be re-enabled"
            ),
        }
    }
}

#[async_trait]
impl BusTransport for SimpleBusTransport {
    fn transporter_id(&self) -> &'static str {
        "simple"
    }

    async fn connect(&self, sink: MessageStream) -> Result<()> {
        let events = self.connection.start().await?;
        let handle = tokio::spawn(pump_events(self.connection.id(), events, sink));
        let previous = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(stale) = previous {
            stale.abort();
        }
        Ok(())
    }

    async fn post_remote(&self, message: &DistributedMessage) -> Result<()> {
        let bytes = message.to_bytes()?;
        let reached = self.connection.post(message.target(), &bytes)?;
        debug!(recipient = %message.target(), reached, "Posted to simple bus");
        Ok(())
    }

    async fn subscribe_to_bus(&self, recipient: &str) -> Result<Subscription> {
        self.connection.subscribe(recipient)?;
        Ok(Subscription::new(recipient, recipient))
    }

    async fn unsubscribe_from_bus(&self, subscription: &Subscription) -> Result<()> {
        self.connection.unsubscribe(subscription.topic());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connection.stop();
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // The pump ends on its own once the stopped connection's channel drains.
        if let Some(handle) = pump {
            let _ = handle.await;
        }
        Ok(())
    }
}
