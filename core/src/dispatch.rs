// Local dispatch of inbound messages to named handlers
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{DistributedMessage, MessageStream, Result};

/// Local endpoint that consumes messages addressed to one recipient name.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: DistributedMessage) -> Result<()>;
}

/// Routes messages drained from a [`MessageStream`] to the handler registered
/// under `message.target()`.
#[derive(Default, Clone)]
pub struct LocalDispatcher {
    handlers: Arc<DashMap<String, Arc<dyn MessageHandler>>>,
}

impl LocalDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same name.
    pub fn register(&self, recipient: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let recipient = recipient.into();
        info!(recipient = %recipient, "Registered local handler");
        self.handlers.insert(recipient, handler);
    }

    pub fn unregister(&self, recipient: &str) -> bool {
        self.handlers.remove(recipient).is_some()
    }

    pub fn recipients(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Deliver one message. Returns false when no handler is registered.
    /// Handler errors are logged, never propagated.
    pub async fn dispatch(&self, message: DistributedMessage) -> bool {
        let handler = match self.handlers.get(message.target()) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                warn!(
                    recipient = %message.target(),
                    sender = %message.sender(),
                    "No local handler; dropping message"
                );
                return false;
            }
        };
        let recipient = message.target().to_string();
        if let Err(e) = handler.handle(message).await {
            warn!(recipient = %recipient, error = %e, "Local handler failed");
        } else {
            debug!(recipient = %recipient, "Message dispatched");
        }
        true
    }

    /// Drain `stream` until it is closed, dispatching every message.
    /// Returns the number of messages handed to a handler.
    pub async fn run(&self, stream: MessageStream) -> usize {
        let mut dispatched = 0;
        while let Some(message) = stream.next().await {
            if self.dispatch(message).await {
                dispatched += 1;
            }
        }
        info!(dispatched, "Dispatcher stopped; stream closed");
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BusError;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<DistributedMessage>);

    #[async_trait]
    impl MessageHandler for Forward {
        async fn handle(&self, message: DistributedMessage) -> Result<()> {
            let _ = self.0.send(message);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl MessageHandler for Failing {
        async fn handle(&self, _message: DistributedMessage) -> Result<()> {
            Err(BusError::Delivery("handler exploded".into()))
        }
    }

    fn msg(target: &str, n: i64) -> DistributedMessage {
        DistributedMessage::new("remote", target, "test", n).unwrap()
    }

    #[tokio::test]
    async fn dispatches_by_target_and_survives_failures() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = LocalDispatcher::new();
        dispatcher.register("worker", Arc::new(Forward(tx)));
        dispatcher.register("broken", Arc::new(Failing));

        let stream = MessageStream::new();
        stream.push(msg("broken", 1));
        stream.push(msg("nobody", 2));
        stream.push(msg("worker", 3));
        stream.close();

        assert_eq!(dispatcher.run(stream).await, 2);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.payload(), &serde_json::json!(3));
    }

    #[test]
    fn register_and_unregister() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let dispatcher = LocalDispatcher::new();
        dispatcher.register("b", Arc::new(Forward(tx.clone())));
        dispatcher.register("a", Arc::new(Forward(tx)));
        assert_eq!(dispatcher.recipients(), vec!["a", "b"]);
        assert!(dispatcher.unregister("a"));
        assert!(!dispatcher.unregister("a"));
    }
}
