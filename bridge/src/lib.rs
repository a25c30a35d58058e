use std::{future::Future, net::SocketAddr, pin::Pin, sync::Arc};

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use busgate_core::{BusError, QueueBroker, QueueRecord};
use busgate_proto::{
    queue_broker_server::{self, QueueBrokerServer},
    subscriber_frame, HeartbeatRequest, HeartbeatResponse, PublishAck, PublishRequest,
    RecordFrame, SubscriberFrame,
};

mod server_gateway;

pub use server_gateway::{QueueLibBusServer, QueueServerTransport};

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("bind failed: {0}")]
    Bind(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<BridgeError> for BusError {
    fn from(e: BridgeError) -> Self {
        BusError::Connection(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// gRPC face of a [`QueueBroker`].
#[derive(Clone)]
pub struct QueueBrokerService {
    broker: Arc<QueueBroker>,
}

impl QueueBrokerService {
    pub fn new(broker: Arc<QueueBroker>) -> Self {
        Self { broker }
    }
}

fn open_path(frame: Option<SubscriberFrame>) -> std::result::Result<String, Status> {
    match frame.and_then(|f| f.frame) {
        Some(subscriber_frame::Frame::Open(open)) if !open.path.is_empty() => Ok(open.path),
        _ => Err(Status::invalid_argument(
            "first subscriber frame must be Open with a non-empty path",
        )),
    }
}

#[tonic::async_trait]
impl queue_broker_server::QueueBroker for QueueBrokerService {
    async fn publish(
        &self,
        request: Request<PublishRequest>,
    ) -> std::result::Result<Response<PublishAck>, Status> {
        let record = QueueRecord::from_publish_request(request.into_inner())
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let delivered = self.broker.publish(record) as u64;
        Ok(Response::new(PublishAck { delivered }))
    }

    type SubscribeStream = Pin<
        Box<dyn futures_core::Stream<Item = std::result::Result<RecordFrame, Status>> + Send>,
    >;

    async fn subscribe(
        &self,
        request: Request<tonic::Streaming<SubscriberFrame>>,
    ) -> std::result::Result<Response<Self::SubscribeStream>, Status> {
        let mut inbound = request.into_inner();
        let path = open_path(inbound.message().await?)?;

        let (tx, rx) = mpsc::channel::<std::result::Result<RecordFrame, Status>>(16);
        let broker = Arc::clone(&self.broker);
        let mut subscriber = broker.subscribe(&path);
        info!(path = %path, subscriber = subscriber.id(), "Queue subscription opened");

        tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    delivery = subscriber.recv() => delivery,
                    _ = tx.closed() => None,
                };
                let Some(delivery) = delivery else { break };

                let frame = match delivery.record().to_frame(delivery.id()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(path = %path, error = %e, "Skipping unencodable record");
                        delivery.accept();
                        continue;
                    }
                };
                if tx.send(Ok(frame)).await.is_err() {
                    delivery.accept();
                    break;
                }

                // The next record waits until the subscriber acknowledges this one.
                match inbound.message().await {
                    Ok(Some(SubscriberFrame {
                        frame: Some(subscriber_frame::Frame::Accept(accept)),
                    })) if accept.delivery_id == delivery.id() => delivery.accept(),
                    Ok(Some(_)) => {
                        warn!(path = %path, "Unexpected subscriber frame; closing subscription");
                        delivery.accept();
                        break;
                    }
                    Ok(None) | Err(_) => {
                        debug!(path = %path, "Subscriber went away");
                        delivery.accept();
                        break;
                    }
                }
            }
            broker.unsubscribe(&path, subscriber.id());
            info!(path = %path, "Queue subscription closed");
        });

        let outbound = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(outbound) as Self::SubscribeStream))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> std::result::Result<Response<HeartbeatResponse>, Status> {
        Ok(Response::new(HeartbeatResponse {
            timestamp_ms: request.into_inner().timestamp_ms,
            status: "ok".into(),
        }))
    }
}

/// Serve `broker` on an already-bound listener until `shutdown` resolves.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    broker: Arc<QueueBroker>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let svc = QueueBrokerService::new(broker);
    tonic::transport::Server::builder()
        .add_service(QueueBrokerServer::new(svc))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
        .map_err(|e| BridgeError::Internal(e.to_string()))
}

pub async fn start_server(addr: SocketAddr, broker: Arc<QueueBroker>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| BridgeError::Bind(format!("{}: {}", addr, e)))?;
    info!(%addr, "Starting Busgate queue broker gRPC server");
    serve_with_shutdown(listener, broker, std::future::pending()).await
}
