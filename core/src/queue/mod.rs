//! Queue broker engine and the record shape it carries.
//!
//! Used in-process by the queue server gateway and exposed over gRPC by the
//! bridge crate; the queue client gateway speaks to it through
//! `busgate_proto`.

mod broker;
mod record;

pub use broker::{QueueBroker, QueueDelivery, QueueSubscriber};
pub use record::{QueueRecord, MESSAGE_EVENT};
