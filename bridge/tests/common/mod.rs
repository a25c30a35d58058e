//! Shared helpers for queue gateway integration tests.
#![allow(dead_code)]

use std::time::Duration;

use busgate_bridge::{QueueLibBusServer, QueueServerTransport};
use busgate_core::{
    DistributedMessage, MessageStream, NetworkSettings, QueueClientTransport, QueueLibBusClient,
};

pub fn loopback(port: u16) -> NetworkSettings {
    NetworkSettings {
        host: "127.0.0.1".into(),
        port,
    }
}

/// Enable a server gateway on an ephemeral localhost port.
pub async fn start_server(name: &str) -> QueueLibBusServer {
    let server = QueueLibBusServer::new(name, QueueServerTransport::with_network(loopback(0)));
    server.enable().await.expect("server enable");
    server
}

/// Build (but do not enable) a client gateway pointed at `server`.
pub fn client_for(name: &str, server: &QueueLibBusServer) -> QueueLibBusClient {
    let addr = server
        .transport()
        .local_addr()
        .expect("server is listening");
    QueueLibBusClient::new(
        name,
        QueueClientTransport::with_network(loopback(addr.port())),
    )
}

pub async fn next(stream: &MessageStream) -> DistributedMessage {
    tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("timed out waiting for message")
        .expect("stream closed")
}
