use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::QueueRecord;

#[derive(Debug)]
struct SubscriberSlot {
    id: u64,
    tx: mpsc::UnboundedSender<QueueRecord>,
}

/// Path-addressed queue with per-subscriber acknowledgement.
///
/// Every subscriber of a path receives each record published to it. A
/// subscriber holds at most one unacknowledged delivery: the next record is
/// only handed out after the previous one was [`accept`](QueueDelivery::accept)ed.
#[derive(Debug, Default)]
pub struct QueueBroker {
    // path -> subscribers
    subscribers: DashMap<String, Vec<SubscriberSlot>>,
    next_subscriber: AtomicU64,
}

impl QueueBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a record for every live subscriber of its path. Returns how
    /// many subscribers it was queued for.
    pub fn publish(&self, record: QueueRecord) -> usize {
        let (queued, emptied) = match self.subscribers.get_mut(&record.path) {
            Some(mut slots) => {
                slots.retain(|slot| !slot.tx.is_closed());
                let mut queued = 0;
                for slot in slots.iter() {
                    if slot.tx.send(record.clone()).is_ok() {
                        queued += 1;
                    }
                }
                (queued, slots.is_empty())
            }
            None => {
                debug!(path = %record.path, "No subscribers for path");
                return 0;
            }
        };
        if emptied {
            self.subscribers
                .remove_if(&record.path, |_, slots| slots.is_empty());
        }
        debug!(path = %record.path, queued, "Record published");
        queued
    }

    pub fn subscribe(&self, path: &str) -> QueueSubscriber {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .entry(path.to_string())
            .or_default()
            .push(SubscriberSlot { id, tx });
        debug!(path, subscriber = id, "Queue subscriber added");
        QueueSubscriber {
            id,
            path: path.to_string(),
            rx,
            credit: Arc::new(Semaphore::new(1)),
            next_delivery: 0,
        }
    }

    pub fn unsubscribe(&self, path: &str, subscriber_id: u64) {
        if let Some(mut slots) = self.subscribers.get_mut(path) {
            slots.retain(|slot| slot.id != subscriber_id);
        }
        self.subscribers.remove_if(path, |_, slots| slots.is_empty());
    }

    /// Paths that currently have subscribers, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.subscribers.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    pub fn subscriber_count(&self, path: &str) -> usize {
        self.subscribers
            .get(path)
            .map(|slots| slots.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

/// Receiving end of one subscription.
#[derive(Debug)]
pub struct QueueSubscriber {
    id: u64,
    path: String,
    rx: mpsc::UnboundedReceiver<QueueRecord>,
    credit: Arc<Semaphore>,
    next_delivery: u64,
}

impl QueueSubscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the next record. Blocks while the previous delivery is
    /// unaccepted; resolves to `None` when the broker is gone.
    pub async fn recv(&mut self) -> Option<QueueDelivery> {
        let permit = Arc::clone(&self.credit).acquire_owned().await.ok()?;
        let record = self.rx.recv().await?;
        self.next_delivery += 1;
        Some(QueueDelivery {
            id: self.next_delivery,
            record,
            permit: Some(permit),
        })
    }
}

/// A record handed to a subscriber, pending acknowledgement.
#[derive(Debug)]
pub struct QueueDelivery {
    id: u64,
    record: QueueRecord,
    permit: Option<OwnedSemaphorePermit>,
}

impl QueueDelivery {
    /// Per-subscriber sequence number, starting at 1.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn record(&self) -> &QueueRecord {
        &self.record
    }

    /// Acknowledge the record, releasing the subscriber's next delivery.
    pub fn accept(mut self) {
        drop(self.permit.take());
    }
}

impl Drop for QueueDelivery {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            warn!(
                path = %self.record.path,
                delivery = self.id,
                "Delivery dropped without accept(); subscriber is stalled"
            );
            permit.forget();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MESSAGE_EVENT;
    use serde_json::json;
    use std::time::Duration;

    fn record(path: &str, n: i64) -> QueueRecord {
        QueueRecord {
            path: path.into(),
            event: MESSAGE_EVENT.into(),
            value: json!(n),
            published_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn every_subscriber_gets_each_record() {
        let broker = QueueBroker::new();
        let mut s1 = broker.subscribe("worker");
        let mut s2 = broker.subscribe("worker");
        assert_eq!(broker.publish(record("worker", 1)), 2);
        assert_eq!(broker.publish(record("other", 2)), 0);

        let d1 = s1.recv().await.unwrap();
        let d2 = s2.recv().await.unwrap();
        assert_eq!(d1.record().value, json!(1));
        assert_eq!(d2.record().value, json!(1));
        d1.accept();
        d2.accept();
    }

    #[tokio::test]
    async fn next_delivery_waits_for_accept() {
        let broker = QueueBroker::new();
        let mut sub = broker.subscribe("worker");
        broker.publish(record("worker", 1));
        broker.publish(record("worker", 2));

        let first = sub.recv().await.unwrap();
        assert_eq!(first.id(), 1);
        let blocked = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(blocked.is_err(), "second record must wait for accept");

        first.accept();
        let second = tokio::time::timeout(Duration::from_millis(500), sub.recv())
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(second.id(), 2);
        assert_eq!(second.record().value, json!(2));
        second.accept();
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let broker = QueueBroker::new();
        let sub = broker.subscribe("worker");
        assert_eq!(broker.subscriber_count("worker"), 1);
        drop(sub);
        assert_eq!(broker.subscriber_count("worker"), 0);
        assert_eq!(broker.publish(record("worker", 1)), 0);
        assert!(broker.paths().is_empty(), "emptied path is forgotten");
    }

    #[tokio::test]
    async fn unsubscribe_removes_path() {
        let broker = QueueBroker::new();
        let sub = broker.subscribe("worker");
        let other = broker.subscribe("other");
        broker.unsubscribe("worker", sub.id());
        assert_eq!(broker.subscriber_count("worker"), 0);
        assert_eq!(broker.paths(), vec!["other".to_string()]);
        drop(other);
    }
}
