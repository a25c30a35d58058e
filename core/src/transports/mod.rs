//! Concrete transport adapters.
//!
//! Each adapter is constructed with `load(settings)`, which reads its
//! connection settings and builds the underlying handle without doing I/O,
//! and is then wrapped in a [`BusGateway`].

mod queue_client;
mod simple;

pub use queue_client::QueueClientTransport;
pub use simple::SimpleBusTransport;

use crate::gateway::BusGateway;

/// Gateway over an in-process [`SimpleBus`](crate::SimpleBus).
pub type SimpleBusClient = BusGateway<SimpleBusTransport>;

/// Gateway over a remote queue broker reached through gRPC.
pub type QueueLibBusClient = BusGateway<QueueClientTransport>;
