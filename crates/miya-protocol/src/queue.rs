//! Bounded drop-oldest queue for received frames

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Default number of frames held before the oldest are evicted
pub const DEFAULT_CAPACITY: usize = 100;

/// Bounded FIFO that evicts the oldest entry instead of blocking the producer
///
/// The read loop must never stall on a slow consumer, so `push` is
/// synchronous and always succeeds.
#[derive(Debug)]
pub struct FrameQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    evicted: AtomicU64,
}

impl<T> FrameQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            evicted: AtomicU64::new(0),
        }
    }

    /// Append an item, evicting the oldest when full
    ///
    /// Returns `true` if an item was evicted.
    pub fn push(&self, item: T) -> bool {
        let evicted = {
            let mut items = self.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front();
                true
            } else {
                false
            };
            items.push_back(item);
            evicted
        };
        if evicted {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_waiters();
        evicted
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Wait up to `timeout` for the next item
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push in between is not missed
            notified.as_mut().enable();

            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of items dropped due to overflow
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        // The critical sections cannot panic, so a poisoned lock still holds
        // a consistent deque.
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> Default for FrameQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let queue = FrameQueue::new(4);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_overflow_keeps_newest() {
        let queue = FrameQueue::new(100);
        for i in 0..150u32 {
            queue.push(i);
        }
        assert_eq!(queue.len(), 100);
        assert_eq!(queue.evicted(), 50);

        let drained: Vec<u32> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(drained, (50..150).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let queue = FrameQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        assert!(!queue.push('a'));
        assert!(queue.push('b'));
        assert_eq!(queue.try_pop(), Some('b'));
    }

    #[test]
    fn test_clear() {
        let queue = FrameQueue::default();
        queue.push(1);
        queue.push(2);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), DEFAULT_CAPACITY);
    }

    #[tokio::test]
    async fn test_recv_timeout_returns_buffered() {
        let queue = FrameQueue::new(2);
        queue.push(7);
        assert_eq!(queue.recv_timeout(Duration::from_millis(10)).await, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_timeout_expires() {
        let queue: FrameQueue<u8> = FrameQueue::new(2);
        let start = Instant::now();
        assert_eq!(queue.recv_timeout(Duration::from_secs(1)).await, None);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_recv_timeout_wakes_on_push() {
        let queue = Arc::new(FrameQueue::new(8));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv_timeout(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(42u8);
        assert_eq!(consumer.await.unwrap(), Some(42));
    }
}
