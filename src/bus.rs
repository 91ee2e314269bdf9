//! Topic-addressed publish/subscribe dispatcher.
//!
//! Handlers run synchronously on the publishing thread, outside the bus lock,
//! so a handler may publish or unsubscribe without deadlocking. One-shot
//! subscriptions are removed from the table in the same critical section that
//! selects them for delivery: a racing [`Bus::unsubscribe`] either removes the
//! handler before it is selected (no delivery) or finds it already gone (no-op).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

/// Callback invoked with each message published on a subscribed topic.
pub type Handler<M> = Arc<dyn Fn(&M) + Send + Sync>;

/// Handle returned by [`Bus::subscribe`] and [`Bus::subscribe_once`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    topic: String,
    id: u64,
}

struct Entry<M> {
    id: u64,
    handler: Handler<M>,
    once: bool,
}

/// Process-local message bus.
pub struct Bus<M> {
    topics: Mutex<HashMap<String, Vec<Entry<M>>>>,
    next_id: AtomicU64,
}

impl<M> Default for Bus<M> {
    fn default() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<M> Bus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&M) + Send + Sync + 'static,
    {
        self.insert(topic.into(), Arc::new(handler), false)
    }

    /// Subscribe for at most one delivery.
    pub fn subscribe_once<F>(&self, topic: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&M) + Send + Sync + 'static,
    {
        self.insert(topic.into(), Arc::new(handler), true)
    }

    /// Remove a subscription. Returns `false` when it was already gone,
    /// which covers fired one-shot handlers and repeated calls.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut topics = self.lock();
        let Some(entries) = topics.get_mut(&subscription.topic) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != subscription.id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            topics.remove(&subscription.topic);
        }
        removed
    }

    /// Deliver `message` to every current subscriber of `topic`.
    ///
    /// Returns the number of handlers invoked. Messages published with no
    /// subscriber are dropped.
    pub fn publish(&self, topic: &str, message: &M) -> usize {
        let handlers: Vec<Handler<M>> = {
            let mut topics = self.lock();
            let Some(entries) = topics.get_mut(topic) else {
                trace!(topic, "no subscribers");
                return 0;
            };
            let handlers = entries.iter().map(|e| Arc::clone(&e.handler)).collect();
            entries.retain(|entry| !entry.once);
            if entries.is_empty() {
                topics.remove(topic);
            }
            handlers
        };

        for handler in &handlers {
            handler(message);
        }
        handlers.len()
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().get(topic).map_or(0, Vec::len)
    }

    fn insert(&self, topic: String, handler: Handler<M>, once: bool) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(topic.clone())
            .or_default()
            .push(Entry { id, handler, once });
        Subscription { topic, id }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Entry<M>>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[test]
    fn delivers_to_every_subscriber_of_topic() {
        let bus: Bus<u32> = Bus::new();
        let a = counter();
        let b = counter();
        let other = counter();
        {
            let a = Arc::clone(&a);
            bus.subscribe("t", move |m| {
                a.fetch_add(*m as usize, Ordering::SeqCst);
            });
        }
        {
            let b = Arc::clone(&b);
            bus.subscribe("t", move |m| {
                b.fetch_add(*m as usize, Ordering::SeqCst);
            });
        }
        {
            let other = Arc::clone(&other);
            bus.subscribe("u", move |_| {
                other.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(bus.publish("t", &5), 2);
        assert_eq!(a.load(Ordering::SeqCst), 5);
        assert_eq!(b.load(Ordering::SeqCst), 5);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn preserves_publish_order_per_subscriber() {
        let bus: Bus<u32> = Bus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe("t", move |m| sink.lock().unwrap().push(*m));
        for i in 0..50 {
            bus.publish("t", &i);
        }
        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn once_subscription_fires_at_most_once() {
        let bus: Bus<u32> = Bus::new();
        let hits = counter();
        let h = Arc::clone(&hits);
        let sub = bus.subscribe_once("reply", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.publish("reply", &1), 1);
        assert_eq!(bus.publish("reply", &2), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!bus.unsubscribe(&sub));
        assert_eq!(bus.subscriber_count("reply"), 0);
    }

    #[test]
    fn double_unsubscribe_is_a_no_op() {
        let bus: Bus<u32> = Bus::new();
        let sub = bus.subscribe("t", |_| {});
        assert!(bus.unsubscribe(&sub));
        assert!(!bus.unsubscribe(&sub));
        assert_eq!(bus.publish("t", &1), 0);
    }

    #[test]
    fn unsubscribing_one_handle_keeps_the_others() {
        let bus: Bus<u32> = Bus::new();
        let first = bus.subscribe("t", |_| {});
        let _second = bus.subscribe("t", |_| {});
        bus.unsubscribe(&first);
        assert_eq!(bus.subscriber_count("t"), 1);
    }

    #[test]
    fn handler_may_publish_reentrantly() {
        let bus: Arc<Bus<u32>> = Arc::new(Bus::new());
        let hits = counter();
        {
            let inner = Arc::clone(&bus);
            bus.subscribe("ping", move |m| {
                inner.publish("pong", m);
            });
        }
        {
            let h = Arc::clone(&hits);
            bus.subscribe("pong", move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        bus.publish("ping", &1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_publishers_deliver_once_subscription_once() {
        for _ in 0..20 {
            let bus: Arc<Bus<u32>> = Arc::new(Bus::new());
            let hits = counter();
            let h = Arc::clone(&hits);
            let sub = bus.subscribe_once("race", move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            });

            let publishers: Vec<_> = (0..8)
                .map(|i| {
                    let bus = Arc::clone(&bus);
                    thread::spawn(move || {
                        bus.publish("race", &i);
                    })
                })
                .collect();
            let racer = {
                let bus = Arc::clone(&bus);
                thread::spawn(move || bus.unsubscribe(&sub))
            };
            for p in publishers {
                p.join().unwrap();
            }
            let unsubscribed = racer.join().unwrap();

            let delivered = hits.load(Ordering::SeqCst);
            assert!(delivered <= 1);
            // Exactly one side wins the handler.
            assert_eq!(delivered == 1, !unsubscribed);
            assert_eq!(bus.subscriber_count("race"), 0);
        }
    }
}
