//! Update publisher — best-effort fan-out of task events to live subscribers.
//!
//! Each subscriber owns a bounded channel. `publish` never waits: a full
//! channel means the subscriber is not ready and the event is skipped for
//! it; a closed channel removes the subscriber. A periodic heartbeat drops
//! subscribers that have not acknowledged since the previous check and
//! pings the rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use super::model::UpdateEvent;
use crate::config::PublisherConfig;

/// What a subscriber receives.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(UpdateEvent),
    /// Heartbeat probe; answer with `Subscription::ack`.
    Ping,
}

struct SubscriberSlot {
    tx: mpsc::Sender<Outbound>,
    alive: Arc<AtomicBool>,
}

/// Receiving end handed to one connected client.
pub struct Subscription {
    id: Uuid,
    rx: mpsc::Receiver<Outbound>,
    alive: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event or ping. `None` once the publisher dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }

    /// Mark the subscriber live for the current heartbeat interval.
    pub fn ack(&self) {
        self.alive.store(true, Ordering::Release);
    }
}

/// Result of one heartbeat check.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub pinged: usize,
    pub dropped: usize,
}

/// Fan-out hub for task update events.
pub struct UpdatePublisher {
    subscribers: RwLock<HashMap<Uuid, SubscriberSlot>>,
    config: PublisherConfig,
}

impl UpdatePublisher {
    pub fn new(config: PublisherConfig) -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            config,
        })
    }

    /// Register a new subscriber. It starts out acknowledged.
    pub async fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        let alive = Arc::new(AtomicBool::new(true));
        let id = Uuid::new_v4();

        self.subscribers.write().await.insert(
            id,
            SubscriberSlot {
                tx,
                alive: Arc::clone(&alive),
            },
        );
        debug!(subscriber = %id, "Subscriber registered");

        Subscription { id, rx, alive }
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        if self.subscribers.write().await.remove(&id).is_some() {
            debug!(subscriber = %id, "Subscriber removed");
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Deliver `event` to every ready subscriber. Returns how many received it.
    pub async fn publish(&self, event: UpdateEvent) -> usize {
        let label = event.label();
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let subscribers = self.subscribers.read().await;
            for (id, slot) in subscribers.iter() {
                match slot.tx.try_send(Outbound::Event(event.clone())) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(subscriber = %id, event = label, "Subscriber not ready, skipping");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in &closed {
                subscribers.remove(id);
            }
        }

        debug!(event = label, delivered, "Update published");
        delivered
    }

    /// Drop subscribers that missed the last ping; ping the others.
    pub async fn heartbeat(&self) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();
        let mut subscribers = self.subscribers.write().await;

        subscribers.retain(|id, slot| {
            if !slot.alive.swap(false, Ordering::AcqRel) {
                info!(subscriber = %id, "Dropping unresponsive subscriber");
                report.dropped += 1;
                return false;
            }
            match slot.tx.try_send(Outbound::Ping) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {
                    report.pinged += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    report.dropped += 1;
                    false
                }
            }
        });

        report
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        self.config.heartbeat_interval
    }
}

/// Spawn the periodic heartbeat check.
pub fn spawn_heartbeat(publisher: Arc<UpdatePublisher>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(publisher.heartbeat_interval());
        // The first tick completes immediately; skip it so new subscribers get a full interval.
        interval.tick().await;
        loop {
            interval.tick().await;
            let report = publisher.heartbeat().await;
            if report.dropped > 0 {
                info!(dropped = report.dropped, live = report.pinged, "Heartbeat check");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Classification, PendingMessage};
    use crate::tasks::model::TaskRecord;

    fn event() -> UpdateEvent {
        UpdateEvent::NewTasks {
            tasks: vec![TaskRecord::from_classified(
                PendingMessage::new("s", "a@b.com", "b", "1"),
                Classification::new(vec![], 0.8),
            )],
        }
    }

    fn publisher(buffer: usize) -> Arc<UpdatePublisher> {
        UpdatePublisher::new(PublisherConfig {
            subscriber_buffer: buffer,
            ..PublisherConfig::default()
        })
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let publisher = publisher(8);
        let mut a = publisher.subscribe().await;
        let mut b = publisher.subscribe().await;

        assert_eq!(publisher.publish(event()).await, 2);
        assert!(matches!(a.recv().await, Some(Outbound::Event(UpdateEvent::NewTasks { .. }))));
        assert!(matches!(b.recv().await, Some(Outbound::Event(UpdateEvent::NewTasks { .. }))));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_fine() {
        let publisher = publisher(8);
        assert_eq!(publisher.publish(event()).await, 0);
    }

    #[tokio::test]
    async fn full_subscriber_is_skipped_not_blocking() {
        let publisher = publisher(1);
        let mut slow = publisher.subscribe().await;
        let mut fast = publisher.subscribe().await;

        assert_eq!(publisher.publish(event()).await, 2);
        fast.recv().await.unwrap();

        // `slow` has not drained its single slot.
        assert_eq!(publisher.publish(event()).await, 1);
        assert!(fast.recv().await.is_some());

        assert!(slow.try_recv().is_some());
        assert!(slow.try_recv().is_none());
        assert_eq!(publisher.subscriber_count().await, 2);
    }

    #[tokio::test]
    async fn closed_subscriber_is_removed() {
        let publisher = publisher(8);
        let sub = publisher.subscribe().await;
        drop(sub);
        assert_eq!(publisher.publish(event()).await, 0);
        assert_eq!(publisher.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn heartbeat_drops_unacknowledged() {
        let publisher = publisher(8);
        let mut responsive = publisher.subscribe().await;
        let mut silent = publisher.subscribe().await;

        let first = publisher.heartbeat().await;
        assert_eq!(first, HeartbeatReport { pinged: 2, dropped: 0 });
        assert!(matches!(responsive.recv().await, Some(Outbound::Ping)));
        assert!(matches!(silent.recv().await, Some(Outbound::Ping)));

        responsive.ack();

        let second = publisher.heartbeat().await;
        assert_eq!(second, HeartbeatReport { pinged: 1, dropped: 1 });
        assert_eq!(publisher.subscriber_count().await, 1);

        // The silent subscriber's channel is closed once its slot is gone.
        assert!(silent.recv().await.is_none());
        assert!(matches!(responsive.recv().await, Some(Outbound::Ping)));
    }

    #[tokio::test]
    async fn unsubscribe_removes() {
        let publisher = publisher(8);
        let sub = publisher.subscribe().await;
        publisher.unsubscribe(sub.id()).await;
        assert_eq!(publisher.subscriber_count().await, 0);
    }
}
