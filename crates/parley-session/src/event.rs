//! Typed listener registries.
//!
//! An [`EventChannel`] delivers each emitted value to its listeners
//! synchronously, in subscription order. Subscribing hands back a
//! [`Subscription`] whose `unsubscribe` can be called any number of times.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::RwLock;
use tokio::sync::mpsc;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    listeners: RwLock<BTreeMap<u64, Listener<T>>>,
    next_id: AtomicU64,
}

pub struct EventChannel<T> {
    registry: Arc<Registry<T>>,
}

impl<T> Clone for EventChannel<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T> Default for EventChannel<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Registry {
                listeners: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

impl<T: Send + Sync + 'static> EventChannel<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.listeners.write().insert(id, Arc::new(listener));
        let registry: Arc<dyn Unsubscribe> = self.registry.clone();
        Subscription {
            id,
            registry: Arc::downgrade(&registry),
            active: AtomicBool::new(true),
        }
    }

    /// Calls every listener with `event`. Listeners run outside the registry
    /// lock, so they may subscribe or unsubscribe while being notified.
    pub fn emit(&self, event: &T) {
        let listeners: Vec<Listener<T>> = self.registry.listeners.read().values().cloned().collect();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registry.listeners.read().len()
    }
}

impl<T: Clone + Send + Sync + 'static> EventChannel<T> {
    /// Bridges the channel into an async receiver. The listener is removed
    /// when the returned stream is dropped.
    pub fn stream(&self) -> EventStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |event: &T| {
            let _ = tx.send(event.clone());
        });
        EventStream { rx, subscription }
    }
}

trait Unsubscribe: Send + Sync {
    fn remove(&self, id: u64) -> bool;
}

impl<T> Unsubscribe for Registry<T> {
    fn remove(&self, id: u64) -> bool {
        self.listeners.write().remove(&id).is_some()
    }
}

pub struct Subscription {
    id: u64,
    registry: Weak<dyn Unsubscribe>,
    active: AtomicBool,
}

impl Subscription {
    /// Removes the listener. Returns `true` only for the call that actually
    /// removed it.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        match self.registry.upgrade() {
            Some(registry) => registry.remove(self.id),
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.registry.strong_count() > 0
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

pub struct EventStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
    subscription: Subscription,
}

impl<T> EventStream<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for EventStream<T> {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test_timeout::timeout]
    fn listeners_run_in_subscription_order() {
        let channel = EventChannel::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&seen);
        let second = Arc::clone(&seen);
        let _a = channel.subscribe(move |value| first.lock().push(("a", *value)));
        let _b = channel.subscribe(move |value| second.lock().push(("b", *value)));

        channel.emit(&1);
        channel.emit(&2);
        assert_eq!(*seen.lock(), vec![("a", 1), ("b", 1), ("a", 2), ("b", 2)]);
    }

    #[test_timeout::timeout]
    fn unsubscribe_is_idempotent() {
        let channel = EventChannel::<u32>::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        let subscription = channel.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let other = channel.subscribe(|_| {});

        assert!(subscription.unsubscribe());
        assert!(!subscription.unsubscribe());
        assert!(!subscription.is_active());
        assert!(other.is_active());
        assert_eq!(channel.listener_count(), 1);

        channel.emit(&7);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test_timeout::timeout]
    fn listener_may_unsubscribe_itself_while_notified() {
        let channel = EventChannel::<u32>::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&slot);
        let subscription = channel.subscribe(move |_| {
            if let Some(subscription) = inner.lock().as_ref() {
                subscription.unsubscribe();
            }
        });
        *slot.lock() = Some(subscription);

        channel.emit(&1);
        assert_eq!(channel.listener_count(), 0);
    }

    #[test_timeout::timeout]
    fn unsubscribe_after_channel_dropped_is_harmless() {
        let channel = EventChannel::<u32>::new();
        let subscription = channel.subscribe(|_| {});
        drop(channel);
        assert!(!subscription.unsubscribe());
    }

    #[test_timeout::tokio_timeout_test]
    async fn stream_receives_and_detaches_on_drop() {
        let channel = EventChannel::<String>::new();
        let mut stream = channel.stream();
        channel.emit(&"hello".to_string());
        assert_eq!(stream.recv().await.as_deref(), Some("hello"));
        drop(stream);
        assert_eq!(channel.listener_count(), 0);
    }
}
