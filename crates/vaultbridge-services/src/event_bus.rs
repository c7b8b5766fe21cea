//! Typed publish/subscribe dispatcher.
//!
//! Every subscription owns an unbounded queue and a delivery task, so a
//! slow handler only delays its own subscription. Within one topic, events
//! reach each handler in publish order. Nothing is persisted: a handler
//! registered after a publish never sees that event.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::events::{Event, Topic};

/// Receives events for one subscription.
///
/// Handlers run on the subscription's delivery task and should only hand
/// work off (append to a queue, submit to a pool). Blocking here stalls
/// this subscription, not the publisher.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: Event);
}

impl<F> EventHandler for F
where
    F: Fn(Event) + Send + Sync + 'static,
{
    fn handle(&self, event: Event) {
        self(event)
    }
}

type Subscribers = HashMap<Topic, Vec<mpsc::UnboundedSender<Event>>>;

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `topic`. Must be called inside a tokio runtime.
    pub fn subscribe(&self, topic: Topic, handler: impl EventHandler) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(|| handler.handle(event))).is_err() {
                    tracing::error!(?topic, "event handler panicked, event dropped");
                }
            }
        });

        self.lock().entry(topic).or_default().push(tx);
    }

    /// Hand `event` to every current subscriber of its topic.
    ///
    /// Returns the number of subscribers it was queued for.
    pub fn publish(&self, event: Event) -> usize {
        let topic = event.topic();
        // The lock is held while queueing so concurrent publishers cannot
        // interleave differently for different subscribers.
        let mut subscribers = self.lock();
        let Some(senders) = subscribers.get_mut(&topic) else {
            tracing::debug!(?topic, "no subscribers for event");
            return 0;
        };

        senders.retain(|tx| !tx.is_closed());
        let delivered = senders
            .iter()
            .filter(|tx| tx.send(event.clone()).is_ok())
            .count();

        tracing::trace!(?topic, delivered, "event published");
        delivered
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.lock().get(&topic).map(Vec::len).unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use vaultbridge_core::{MessageMetadata, TransportMessage};

    fn part(n: u8) -> Event {
        let metadata = MessageMetadata::data_store_part("req", "ds", "key");
        Event::DataStorePartAvailable(TransportMessage::new(metadata, vec![n].into()))
    }

    fn collect(bus: &EventBus, topic: Topic) -> UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(topic, move |event| {
            let _ = tx.send(event);
        });
        rx
    }

    async fn next(rx: &mut UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("bus dropped")
    }

    #[tokio::test]
    async fn delivers_to_every_subscriber() {
        let bus = EventBus::new();
        let mut a = collect(&bus, Topic::WorkloadCompleted);
        let mut b = collect(&bus, Topic::WorkloadCompleted);

        assert_eq!(bus.publish(Event::WorkloadCompleted), 2);
        assert!(matches!(next(&mut a).await, Event::WorkloadCompleted));
        assert!(matches!(next(&mut b).await, Event::WorkloadCompleted));
    }

    #[tokio::test]
    async fn per_topic_order_follows_publish_order() {
        let bus = EventBus::new();
        let mut rx = collect(&bus, Topic::DataStorePartAvailable);

        for n in 0..50u8 {
            bus.publish(part(n));
        }
        for n in 0..50u8 {
            match next(&mut rx).await {
                Event::DataStorePartAvailable(msg) => assert_eq!(msg.data(), &[n]),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn no_replay_for_late_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(Event::WorkloadCompleted), 0);

        let mut rx = collect(&bus, Topic::WorkloadCompleted);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn other_topics_are_not_delivered() {
        let bus = EventBus::new();
        let mut rx = collect(&bus, Topic::WorkloadCompleted);
        assert_eq!(bus.publish(part(1)), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_handler_does_not_block_other_topics() {
        let bus = EventBus::new();
        bus.subscribe(Topic::DataStorePartAvailable, |_event| {
            std::thread::sleep(Duration::from_millis(500));
        });
        let mut fast = collect(&bus, Topic::WorkloadCompleted);

        bus.publish(part(1));
        bus.publish(Event::WorkloadCompleted);

        let started = std::time::Instant::now();
        next(&mut fast).await;
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn panicking_handler_keeps_subscription_alive() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(Topic::DataStorePartAvailable, move |event| {
            if let Event::DataStorePartAvailable(msg) = &event {
                if msg.data() == [0] {
                    panic!("boom");
                }
            }
            let _ = tx.send(event);
        });

        bus.publish(part(0));
        bus.publish(part(1));
        match next(&mut rx).await {
            Event::DataStorePartAvailable(msg) => assert_eq!(msg.data(), &[1]),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(bus.subscriber_count(Topic::DataStorePartAvailable), 1);
    }
}
