use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Process-wide value with lock-free reads and explicit change notification.
///
/// Created at application start; [`StateStore::shutdown`] drops every
/// subscriber at application shutdown or test teardown. Subscribers run on
/// the thread that made the change, outside any internal lock, so they may
/// read the store again.
pub struct StateStore<T> {
    value: ArcSwap<T>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber<T>)>>,
    next_subscription: AtomicU64,
}

impl<T> StateStore<T> {
    pub fn new(initial: T) -> Self {
        Self {
            value: ArcSwap::from_pointee(initial),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn get(&self) -> Arc<T> {
        self.value.load_full()
    }

    pub fn set(&self, value: T) -> Arc<T> {
        let value = Arc::new(value);
        self.value.store(value.clone());
        self.notify(&value);
        value
    }

    /// Replaces the value with `apply(current)`.
    ///
    /// `apply` may run more than once when updates race.
    pub fn update<F>(&self, apply: F) -> Arc<T>
    where
        F: Fn(&T) -> T,
    {
        let mut next = None;
        self.value.rcu(|current| {
            let value = Arc::new(apply(current));
            next = Some(value.clone());
            value
        });

        let next = next.unwrap_or_else(|| self.value.load_full());
        self.notify(&next);
        next
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((id, Arc::new(subscriber)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn shutdown(&self) {
        self.subscribers.lock().clear();
    }

    fn notify(&self, value: &T) {
        let subscribers = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, subscriber)| subscriber.clone())
            .collect::<Vec<_>>();
        for subscriber in subscribers {
            subscriber(value);
        }
    }
}

impl<T: Default> Default for StateStore<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
