//! Bounded drop-oldest channel between layers
//!
//! Producers never block: when the buffer is full the oldest queued event
//! is discarded to make room for the newest. Events carry their own TTL, so
//! a stale event sitting at the head is worth less than a fresh one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use crate::health::HealthCounters;

struct Shared<T> {
    capacity: usize,
    buffer: Mutex<VecDeque<T>>,
    notify: Notify,
    dropped_count: AtomicU64,
}

impl<T> Shared<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        // A poisoned buffer still holds valid events
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Producer half; cheap to clone
pub struct EventSender<T> {
    shared: Arc<Shared<T>>,
}

/// Consumer half
pub struct EventReceiver<T> {
    shared: Arc<Shared<T>>,
}

/// Create a bounded channel holding at most `capacity` events (minimum 1)
pub fn channel<T>(capacity: usize) -> (EventSender<T>, EventReceiver<T>) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        capacity,
        buffer: Mutex::new(VecDeque::with_capacity(capacity)),
        notify: Notify::new(),
        dropped_count: AtomicU64::new(0),
    });
    (
        EventSender {
            shared: shared.clone(),
        },
        EventReceiver { shared },
    )
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> EventSender<T> {
    /// Enqueue without blocking; returns the evicted event if the buffer was full
    pub fn send(&self, event: T) -> Option<T> {
        let evicted = {
            let mut buffer = self.shared.lock();
            let evicted = if buffer.len() >= self.shared.capacity {
                buffer.pop_front()
            } else {
                None
            };
            buffer.push_back(event);
            evicted
        };

        if evicted.is_some() {
            self.shared.dropped_count.fetch_add(1, Ordering::Relaxed);
            debug!(
                capacity = self.shared.capacity,
                "Dropped oldest event due to backpressure"
            );
        }

        self.shared.notify.notify_one();
        evicted
    }

    /// Enqueue and charge any eviction to the producing layer's counters
    pub fn emit(&self, event: T, health: &HealthCounters) {
        if self.send(event).is_some() {
            health.increment_queue_drops();
        }
    }

    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped_count.load(Ordering::Relaxed)
    }
}

impl<T> EventReceiver<T> {
    /// Wait for the next event
    pub async fn recv(&self) -> T {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(event) = self.try_recv() {
                return event;
            }
            notified.await;
        }
    }

    /// Wait for the next event, giving up after `timeout`
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.recv()).await.ok()
    }

    /// Take the next event without waiting
    pub fn try_recv(&self) -> Option<T> {
        self.shared.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_channel_drops_oldest() {
        let (tx, rx) = channel::<&str>(1);
        let health = HealthCounters::new();

        tx.emit("old", &health);
        tx.emit("new", &health);

        assert_eq!(rx.len(), 1);
        assert_eq!(rx.try_recv(), Some("new"));
        assert_eq!(rx.try_recv(), None);
        assert_eq!(health.queue_drops(), 1);
        assert_eq!(tx.dropped_count(), 1);
    }

    #[test]
    fn test_zero_capacity_holds_one_event() {
        let (tx, rx) = channel::<u32>(0);
        assert_eq!(tx.send(1), None);
        assert_eq!(tx.send(2), Some(1));
        assert_eq!(rx.try_recv(), Some(2));
    }

    #[tokio::test]
    async fn test_never_exceeds_capacity() {
        let (tx, rx) = channel::<u32>(3);
        for i in 0..10 {
            tx.send(i);
            assert!(rx.len() <= 3);
        }
        assert_eq!(rx.try_recv(), Some(7));
        assert_eq!(rx.try_recv(), Some(8));
        assert_eq!(rx.try_recv(), Some(9));
        assert_eq!(tx.dropped_count(), 7);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_send() {
        let (tx, rx) = channel::<u32>(4);
        let handle = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(42);
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_recv_timeout_expires() {
        let (_tx, rx) = channel::<u32>(4);
        let got = rx.recv_timeout(Duration::from_millis(20)).await;
        assert!(got.is_none());
    }
}
