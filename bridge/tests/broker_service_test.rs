mod common;

use std::sync::Arc;
use std::time::Duration;

use busgate_bridge::QueueBrokerService;
use busgate_core::{DistributedMessage, QueueBroker, QueueRecord};
use busgate_proto::{
    queue_broker_client::QueueBrokerClient, queue_broker_server::QueueBroker as _,
    subscriber_frame, Accept, HeartbeatRequest, Open, PublishRequest, SubscriberFrame,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Code, Request};

use common::start_server;

fn open(path: &str) -> SubscriberFrame {
    SubscriberFrame {
        frame: Some(subscriber_frame::Frame::Open(Open { path: path.into() })),
    }
}

fn accept(delivery_id: u64) -> SubscriberFrame {
    SubscriberFrame {
        frame: Some(subscriber_frame::Frame::Accept(Accept { delivery_id })),
    }
}

fn record(path: &str, n: i64) -> QueueRecord {
    let msg = DistributedMessage::new("test", path, "queue", n).unwrap();
    QueueRecord::from_message(&msg).unwrap()
}

#[tokio::test]
async fn heartbeat_echoes_timestamp() {
    let svc = QueueBrokerService::new(Arc::new(QueueBroker::new()));
    let resp = svc
        .heartbeat(Request::new(HeartbeatRequest { timestamp_ms: 12345 }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(resp.status, "ok");
    assert_eq!(resp.timestamp_ms, 12345);
}

#[tokio::test]
async fn publish_without_subscribers_delivers_nowhere() {
    let svc = QueueBrokerService::new(Arc::new(QueueBroker::new()));
    let request = record("nobody", 1).to_publish_request().unwrap();
    let ack = svc.publish(Request::new(request)).await.unwrap().into_inner();
    assert_eq!(ack.delivered, 0);
}

#[tokio::test]
async fn publish_rejects_malformed_value() {
    let svc = QueueBrokerService::new(Arc::new(QueueBroker::new()));
    let status = svc
        .publish(Request::new(PublishRequest {
            path: "x".into(),
            event: "message".into(),
            value: b"not json".to_vec(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn subscribe_requires_open_first() {
    let server = start_server("hub").await;
    let addr = server.transport().local_addr().unwrap();
    let mut client = QueueBrokerClient::connect(format!("http://{}", addr))
        .await
        .unwrap();

    let (tx, rx) = mpsc::channel(4);
    tx.send(accept(1)).await.unwrap();
    let status = client
        .subscribe(ReceiverStream::new(rx))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    drop(tx);
    drop(client);
    server.disable().await;
}

#[tokio::test]
async fn unaccepted_record_holds_back_the_next() {
    let server = start_server("hub").await;
    let addr = server.transport().local_addr().unwrap();
    let mut client = QueueBrokerClient::connect(format!("http://{}", addr))
        .await
        .unwrap();

    let (tx, rx) = mpsc::channel(4);
    tx.send(open("jobs")).await.unwrap();
    let mut inbound = client
        .subscribe(ReceiverStream::new(rx))
        .await
        .unwrap()
        .into_inner();

    let broker = server.transport().broker();
    assert_eq!(broker.publish(record("jobs", 1)), 1);
    assert_eq!(broker.publish(record("jobs", 2)), 1);

    let first = inbound.message().await.unwrap().unwrap();
    assert_eq!(first.delivery_id, 1);
    assert!(
        tokio::time::timeout(Duration::from_millis(200), inbound.message())
            .await
            .is_err(),
        "second record must wait for accept"
    );

    tx.send(accept(first.delivery_id)).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), inbound.message())
        .await
        .expect("second record after accept")
        .unwrap()
        .unwrap();
    assert_eq!(second.delivery_id, 2);
    let value: serde_json::Value = serde_json::from_slice(&second.value).unwrap();
    assert_eq!(value["payload"], serde_json::json!(2));

    drop(tx);
    drop(inbound);
    drop(client);
    server.disable().await;
}
