use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use busgate_proto::{
    queue_broker_client::QueueBrokerClient, subscriber_frame, Accept, HeartbeatRequest, Open,
    SubscriberFrame,
};

use crate::gateway::{BusTransport, Subscription};
use crate::message::DistributedMessage;
use crate::queue::QueueRecord;
use crate::settings::{NetworkSettings, SettingsSource};
use crate::stream::MessageStream;
use crate::{BusError, Result};

#[derive(Default)]
struct Connection {
    client: Option<QueueBrokerClient<Channel>>,
    sink: Option<MessageStream>,
}

/// Adapter for a remote queue broker reached over gRPC.
///
/// Reads `bus.queue.host` / `bus.queue.port`.
pub struct QueueClientTransport {
    network: NetworkSettings,
    connection: Mutex<Connection>,
}

impl QueueClientTransport {
    pub fn load(settings: &dyn SettingsSource) -> Self {
        Self::with_network(NetworkSettings::from_settings(settings, "queue"))
    }

    pub fn with_network(network: NetworkSettings) -> Self {
        Self {
            network,
            connection: Mutex::new(Connection::default()),
        }
    }

    pub fn network(&self) -> &NetworkSettings {
        &self.network
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connected(&self) -> Result<(QueueBrokerClient<Channel>, MessageStream)> {
        let connection = self.connection();
        match (&connection.client, &connection.sink) {
            (Some(client), Some(sink)) => Ok((client.clone(), sink.clone())),
            _ => Err(BusError::Connection(format!(
                "not connected to queue broker at {}",
                self.network.endpoint()
            ))),
        }
    }
}

fn accept_frame(delivery_id: u64) -> SubscriberFrame {
    SubscriberFrame {
        frame: Some(subscriber_frame::Frame::Accept(Accept { delivery_id })),
    }
}

#[async_trait]
impl BusTransport for QueueClientTransport {
    fn transporter_id(&self) -> &'static str {
        "queue-client"
    }

    async fn connect(&self, sink: MessageStream) -> Result<()> {
        let endpoint = self.network.endpoint();
        let mut client = QueueBrokerClient::connect(endpoint.clone()).await?;
        let pong = client
            .heartbeat(HeartbeatRequest {
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
            })
            .await
            .map_err(|s| BusError::Connection(format!("broker handshake failed: {}", s)))?
            .into_inner();
        info!(endpoint = %endpoint, status = %pong.status, "Connected to queue broker");

        let mut connection = self.connection();
        connection.client = Some(client);
        connection.sink = Some(sink);
        Ok(())
    }

    async fn post_remote(&self, message: &DistributedMessage) -> Result<()> {
        let (mut client, _) = self.connected()?;
        let request = QueueRecord::from_message(message)?.to_publish_request()?;
        let ack = client.publish(request).await?.into_inner();
        debug!(recipient = %message.target(), delivered = ack.delivered, "Published to queue broker");
        Ok(())
    }

    async fn subscribe_to_bus(&self, recipient: &str) -> Result<Subscription> {
        let (mut client, sink) = self.connected()?;

        // Queue the Open frame before the call so the broker can answer headers.
        let (tx, rx) = mpsc::channel::<SubscriberFrame>(16);
        tx.send(SubscriberFrame {
            frame: Some(subscriber_frame::Frame::Open(Open {
                path: recipient.to_string(),
            })),
        })
        .await
        .map_err(|e| BusError::Subscription(e.to_string()))?;
        let mut inbound = client
            .subscribe(ReceiverStream::new(rx))
            .await
            .map_err(|s| BusError::Subscription(s.to_string()))?
            .into_inner();

        let path = recipient.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(frame)) => {
                        let delivery_id = frame.delivery_id;
                        match QueueRecord::from_frame(frame).and_then(QueueRecord::into_message) {
                            Ok(message) => {
                                if !sink.push(message) {
                                    debug!(path = %path, "Output stream closed; dropping record");
                                }
                            }
                            Err(e) => {
                                warn!(path = %path, error = %e, "Dropping invalid queue record")
                            }
                        }
                        // Invalid records are accepted too, or they would stall the queue.
                        if tx.send(accept_frame(delivery_id)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!(path = %path, "Queue subscription ended by broker");
                        break;
                    }
                    Err(status) => {
                        warn!(
                            path = %path,
                            error = %status,
                            "Queue subscription failed; gateway may need to be re-enabled"
                        );
                        break;
                    }
                }
            }
        });

        Ok(Subscription::new(recipient, recipient).with_task(&handle))
    }

    async fn close(&self) -> Result<()> {
        let mut connection = self.connection();
        if connection.client.take().is_some() {
            info!(endpoint = %self.network.endpoint(), "Disconnected from queue broker");
        }
        connection.sink = None;
        Ok(())
    }
}
