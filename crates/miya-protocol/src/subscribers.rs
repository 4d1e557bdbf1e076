//! Callback registry with explicit subscription ids

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Error a subscriber may report back to the registry
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

type Callback<T> = Arc<dyn Fn(&T) -> Result<(), SubscriberError> + Send + Sync>;

/// Registered callbacks for values of type `T`
///
/// A failing or panicking subscriber is logged and skipped; it never
/// prevents delivery to the others and never unwinds into the caller of
/// [`notify`](Self::notify).
pub struct SubscriberRegistry<T> {
    name: &'static str,
    callbacks: DashMap<SubscriptionId, Callback<T>>,
    next_id: AtomicU64,
}

impl<T> SubscriberRegistry<T> {
    /// `name` identifies the registry in log output
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            callbacks: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&T) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.insert(id, Arc::new(callback));
        tracing::debug!("Added {} subscriber {}", self.name, id);
        id
    }

    /// Remove a subscriber; returns `false` if the id was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.callbacks.remove(&id).is_some();
        if removed {
            tracing::debug!("Removed {} subscriber {}", self.name, id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn clear(&self) {
        self.callbacks.clear();
    }

    /// Deliver `value` to every subscriber, returning how many succeeded
    pub fn notify(&self, value: &T) -> usize {
        // Snapshot first so callbacks may (un)subscribe without deadlocking
        // the map shards.
        let snapshot: Vec<(SubscriptionId, Callback<T>)> = self
            .callbacks
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut delivered = 0;
        for (id, callback) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| callback(value))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::error!("{} subscriber {} failed: {}", self.name, id, e);
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!("{} subscriber {} panicked: {}", self.name, id, message);
                }
            }
        }
        delivered
    }
}

impl<T> std::fmt::Debug for SubscriberRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("name", &self.name)
            .field("subscribers", &self.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_subscribe_notify_unsubscribe() {
        let registry = SubscriberRegistry::<u32>::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let id = {
            let seen = seen.clone();
            registry.subscribe(move |v| {
                seen.lock().unwrap().push(*v);
                Ok(())
            })
        };
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.notify(&1), 1);

        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        assert_eq!(registry.notify(&2), 0);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = SubscriberRegistry::<()>::new("test");
        let a = registry.subscribe(|_| Ok(()));
        let b = registry.subscribe(|_| Ok(()));
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_failures_are_isolated() {
        let registry = SubscriberRegistry::<&'static str>::new("test");
        let hits = Arc::new(AtomicU64::new(0));

        registry.subscribe(|_| Err("refused".into()));
        registry.subscribe(|_| panic!("subscriber bug"));
        {
            let hits = hits.clone();
            registry.subscribe(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        assert_eq!(registry.notify(&"frame"), 1);
        assert_eq!(registry.notify(&"frame"), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let registry = Arc::new(SubscriberRegistry::<()>::new("test"));
        let slot = Arc::new(Mutex::new(None));
        let id = {
            let registry = registry.clone();
            let slot = slot.clone();
            registry.clone().subscribe(move |_| {
                if let Some(id) = slot.lock().unwrap().take() {
                    registry.unsubscribe(id);
                }
                Ok(())
            })
        };
        *slot.lock().unwrap() = Some(id);

        registry.notify(&());
        assert!(registry.is_empty());
    }
}
