// Busgate Core Library
// Distributed message-bus gateway: routing, lifecycle and transport adapters

pub mod dispatch;
pub mod gateway;
pub mod message;
pub mod queue;
pub mod settings;
pub mod simple_bus;
pub mod stream;
pub mod telemetry;
pub mod transports;

// Export core types
pub use dispatch::{LocalDispatcher, MessageHandler};
pub use gateway::{BusGateway, BusTransport, EnableFuture, GatewayState, Subscription};
pub use message::{DistributedMessage, RecipientId, TransportId};
pub use queue::{QueueBroker, QueueDelivery, QueueRecord, QueueSubscriber};
pub use settings::{NetworkSettings, Settings, SettingsSource};
pub use simple_bus::{ConnectionEvent, SimpleBus, SimpleBusConnection};
pub use stream::MessageStream;
pub use transports::{
    QueueClientTransport, QueueLibBusClient, SimpleBusClient, SimpleBusTransport,
};

// Error types
use thiserror::Error;

/// Errors surfaced by gateways and transports.
///
/// Every variant carries plain strings so the error is `Clone`: a single
/// enable attempt hands the same error to all of its concurrent waiters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Gateway {0} is not started")]
    NotStarted(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for BusError {
    fn from(e: toml::de::Error) -> Self {
        BusError::Config(e.to_string())
    }
}

impl From<tonic::Status> for BusError {
    fn from(s: tonic::Status) -> Self {
        BusError::Delivery(format!("{}: {}", s.code(), s.message()))
    }
}

impl From<tonic::transport::Error> for BusError {
    fn from(e: tonic::transport::Error) -> Self {
        BusError::Connection(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
