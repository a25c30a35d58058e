use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use busgate_core::settings::SettingsSource;
use busgate_core::{
    BusError, BusGateway, BusTransport, DistributedMessage, MessageStream, NetworkSettings,
    QueueBroker, QueueRecord, Subscription,
};

use crate::serve_with_shutdown;

/// How long open subscriber streams get to finish before the server is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Listener {
    sink: Option<MessageStream>,
    local_addr: Option<SocketAddr>,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
    // recipient -> broker subscriber id
    subscribers: HashMap<String, u64>,
}

/// Adapter that owns the queue broker and serves it on `host:port`.
///
/// Reads `bus.queue_server.host` / `bus.queue_server.port`. Port 0 binds an
/// ephemeral port; see [`QueueServerTransport::local_addr`].
pub struct QueueServerTransport {
    network: NetworkSettings,
    broker: Arc<QueueBroker>,
    listener: Mutex<Listener>,
}

/// Gateway that hosts the broker other gateways connect to.
pub type QueueLibBusServer = BusGateway<QueueServerTransport>;

impl QueueServerTransport {
    pub fn load(settings: &dyn SettingsSource) -> Self {
        Self::with_network(NetworkSettings::from_settings(settings, "queue_server"))
    }

    pub fn with_network(network: NetworkSettings) -> Self {
        Self {
            network,
            broker: Arc::new(QueueBroker::new()),
            listener: Mutex::new(Listener::default()),
        }
    }

    pub fn network(&self) -> &NetworkSettings {
        &self.network
    }

    pub fn broker(&self) -> &Arc<QueueBroker> {
        &self.broker
    }

    /// Address actually bound while connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener().local_addr
    }

    fn listener(&self) -> MutexGuard<'_, Listener> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sink(&self) -> busgate_core::Result<MessageStream> {
        self.listener().sink.clone().ok_or_else(|| {
            BusError::Connection(format!(
                "queue broker is not listening on {}",
                self.network.bind_addr()
            ))
        })
    }
}

#[async_trait]
impl BusTransport for QueueServerTransport {
    fn transporter_id(&self) -> &'static str {
        "queue-server"
    }

    async fn connect(&self, sink: MessageStream) -> busgate_core::Result<()> {
        let addr = self.network.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| BusError::Connection(format!("failed to bind {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let broker = Arc::clone(&self.broker);
        let server = tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = serve_with_shutdown(listener, broker, shutdown).await {
                error!(error = %e, "Queue broker server stopped with error");
            }
        });
        info!(%local_addr, "Queue broker listening");

        let mut state = self.listener();
        state.sink = Some(sink);
        state.local_addr = Some(local_addr);
        state.shutdown = Some(shutdown_tx);
        state.server = Some(server);
        Ok(())
    }

    async fn post_remote(&self, message: &DistributedMessage) -> busgate_core::Result<()> {
        let record = QueueRecord::from_message(message)?;
        let delivered = self.broker.publish(record);
        debug!(recipient = %message.target(), delivered, "Published to local broker");
        Ok(())
    }

    async fn subscribe_to_bus(&self, recipient: &str) -> busgate_core::Result<Subscription> {
        let sink = self.sink()?;
        let mut subscriber = self.broker.subscribe(recipient);
        self.listener()
            .subscribers
            .insert(recipient.to_string(), subscriber.id());
        let path = recipient.to_string();

        let handle = tokio::spawn(async move {
            while let Some(delivery) = subscriber.recv().await {
                match delivery.record().clone().into_message() {
                    Ok(message) => {
                        if !sink.push(message) {
                            debug!(path = %path, "Output stream closed; dropping record");
                        }
                    }
                    Err(e) => warn!(path = %path, error = %e, "Dropping invalid queue record"),
                }
                delivery.accept();
            }
        });

        Ok(Subscription::new(recipient, recipient).with_task(&handle))
    }

    async fn unsubscribe_from_bus(&self, subscription: &Subscription) -> busgate_core::Result<()> {
        let id = self.listener().subscribers.remove(subscription.topic());
        if let Some(id) = id {
            self.broker.unsubscribe(subscription.topic(), id);
        }
        Ok(())
    }

    async fn close(&self) -> busgate_core::Result<()> {
        let (shutdown, server, subscribers) = {
            let mut state = self.listener();
            state.sink = None;
            state.local_addr = None;
            (
                state.shutdown.take(),
                state.server.take(),
                std::mem::take(&mut state.subscribers),
            )
        };
        for (path, id) in subscribers {
            self.broker.unsubscribe(&path, id);
        }
        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }
        if let Some(mut server) = server {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Err(BusError::Connection(format!("broker task failed: {}", e)))
                }
                Err(_) => {
                    warn!("Subscribers still attached after grace period; aborting broker");
                    server.abort();
                }
            }
            info!(addr = %self.network.bind_addr(), "Queue broker stopped");
        }
        Ok(())
    }
}
