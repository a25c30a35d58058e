//! Output fan-in channel between transport callbacks and the application.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::Stream;
use tokio::sync::Notify;

use crate::message::DistributedMessage;

struct Shared {
    queue: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    messages: VecDeque<DistributedMessage>,
    closed: bool,
}

/// Unbounded FIFO of inbound messages.
///
/// Many producers push (one per transport subscription); readers compete for
/// messages. Clones share the same queue, so a message is handed to exactly
/// one reader: this is fan-in, not broadcast. Fan-out, when needed, belongs in
/// the application (e.g. a [`LocalDispatcher`](crate::LocalDispatcher)).
///
/// Closing the stream stops readers from waiting once the buffer is drained;
/// buffered messages stay readable.
#[derive(Clone)]
pub struct MessageStream {
    shared: Arc<Shared>,
}

impl Default for MessageStream {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStream {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // The queue holds plain data; a panicked holder can't leave it torn.
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message. Returns false (and drops the message) when closed.
    pub fn push(&self, message: DistributedMessage) -> bool {
        {
            let mut state = self.state();
            if state.closed {
                return false;
            }
            state.messages.push_back(message);
        }
        self.shared.notify.notify_waiters();
        true
    }

    pub fn try_next(&self) -> Option<DistributedMessage> {
        self.state().messages.pop_front()
    }

    /// Wait for the next message. Resolves to `None` once the stream is
    /// closed and drained.
    pub async fn next(&self) -> Option<DistributedMessage> {
        loop {
            // Register interest before checking so a concurrent push can't be missed.
            let notified = self.shared.notify.notified();
            {
                let mut state = self.state();
                if let Some(message) = state.messages.pop_front() {
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.state().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().messages.is_empty()
    }

    /// Copy of the buffered messages, oldest first, without consuming them.
    pub fn snapshot(&self) -> Vec<DistributedMessage> {
        self.state().messages.iter().cloned().collect()
    }

    /// Take every buffered message, oldest first.
    pub fn drain(&self) -> Vec<DistributedMessage> {
        self.state().messages.drain(..).collect()
    }

    pub fn close(&self) {
        self.state().closed = true;
        self.shared.notify.notify_waiters();
    }

    pub fn reopen(&self) {
        self.state().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Adapt into a `futures::Stream` that ends when the stream is closed and drained.
    pub fn into_stream(self) -> impl Stream<Item = DistributedMessage> + Send + 'static {
        futures::stream::unfold(self, |stream| async move {
            let message = stream.next().await?;
            Some((message, stream))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    fn msg(n: i64) -> DistributedMessage {
        DistributedMessage::new("a", "b", "test", n).unwrap()
    }

    #[test]
    fn preserves_push_order() {
        let stream = MessageStream::new();
        for n in 0..5 {
            assert!(stream.push(msg(n)));
        }
        let payloads: Vec<i64> = stream
            .drain()
            .iter()
            .map(|m| m.payload().as_i64().unwrap())
            .collect();
        assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
        assert!(stream.is_empty());
    }

    #[test]
    fn clones_compete_for_messages() {
        let reader_a = MessageStream::new();
        let reader_b = reader_a.clone();
        reader_a.push(msg(1));
        reader_a.push(msg(2));

        let first = reader_a.try_next().unwrap();
        let second = reader_b.try_next().unwrap();
        assert_eq!(first.payload(), &serde_json::json!(1));
        assert_eq!(second.payload(), &serde_json::json!(2));
        assert!(reader_a.try_next().is_none());
        assert!(reader_b.try_next().is_none());
    }

    #[test]
    fn closed_stream_keeps_buffer_but_rejects_pushes() {
        let stream = MessageStream::new();
        stream.push(msg(1));
        stream.close();
        assert!(!stream.push(msg(2)));
        assert_eq!(stream.snapshot().len(), 1);
        stream.reopen();
        assert!(stream.push(msg(3)));
        assert_eq!(stream.len(), 2);
    }

    #[tokio::test]
    async fn next_wakes_on_push() {
        let stream = MessageStream::new();
        let producer = stream.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(msg(7));
        });
        let received = tokio::time::timeout(Duration::from_millis(500), stream.next())
            .await
            .expect("timeout")
            .expect("stream closed");
        assert_eq!(received.payload(), &serde_json::json!(7));
    }

    #[tokio::test]
    async fn next_ends_after_close() {
        let stream = MessageStream::new();
        stream.push(msg(1));
        stream.close();
        let collected: Vec<_> = stream.clone().into_stream().collect().await;
        assert_eq!(collected.len(), 1);
        assert!(stream.next().await.is_none());
    }
}
