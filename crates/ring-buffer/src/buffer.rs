//! Drop-Oldest Buffer Implementation

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::{BufferError, BufferStats};

/// Default buffer capacity (10 frames, well under a second of camera feed)
pub const DEFAULT_CAPACITY: usize = 10;

/// Which buffered entry the consumer takes next
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumeOrder {
    /// Newest entry; everything older is discarded as superseded
    #[default]
    Latest,
    /// Oldest entry first
    Fifo,
}

/// Result of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Admitted without eviction
    Stored,
    /// Admitted after evicting the oldest entry
    EvictedOldest,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    stats: BufferStats,
}

/// Bounded buffer with drop-oldest overflow.
///
/// Any number of producers may push; exactly one consumer should call
/// [`FrameBuffer::recv`]. Pushing never blocks beyond a short critical
/// section, and the consumer never blocks a producer.
pub struct FrameBuffer<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> FrameBuffer<T> {
    /// Create a new buffer with given capacity
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                stats: BufferStats::default(),
            }),
            notify: Notify::new(),
            capacity,
        })
    }

    /// Create a buffer with default capacity
    pub fn with_default_capacity() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(DEFAULT_CAPACITY),
                closed: false,
                stats: BufferStats::default(),
            }),
            notify: Notify::new(),
            capacity: DEFAULT_CAPACITY,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        // No user code runs under the lock, so a poisoned guard still holds
        // consistent data.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push an entry, evicting the oldest one if the buffer is full
    pub fn push(&self, item: T) -> Result<PushOutcome, BufferError> {
        let outcome = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(BufferError::Closed);
            }

            let outcome = if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                inner.stats.evicted += 1;
                PushOutcome::EvictedOldest
            } else {
                PushOutcome::Stored
            };

            inner.items.push_back(item);
            inner.stats.total_written += 1;
            outcome
        };

        self.notify.notify_one();
        Ok(outcome)
    }

    /// Take the next entry without waiting
    pub fn try_pop(&self, order: ConsumeOrder) -> Option<T> {
        let mut inner = self.lock();
        let item = match order {
            ConsumeOrder::Fifo => inner.items.pop_front(),
            ConsumeOrder::Latest => {
                let item = inner.items.pop_back();
                let stale = inner.items.len() as u64;
                inner.items.clear();
                inner.stats.superseded += stale;
                item
            }
        };
        if item.is_some() {
            inner.stats.consumed += 1;
        }
        item
    }

    /// Wait for the next entry.
    ///
    /// Returns `None` once the buffer is closed and drained.
    pub async fn recv(&self, order: ConsumeOrder) -> Option<T> {
        loop {
            if let Some(item) = self.try_pop(order) {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            // notify_one stores a permit when nobody is waiting, so a push
            // between the checks above and this await is not lost.
            self.notify.notified().await;
        }
    }

    /// Close the buffer; further pushes fail and the consumer wakes up
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    /// Discard everything currently buffered, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let dropped = inner.items.len();
        inner.items.clear();
        inner.stats.superseded += dropped as u64;
        dropped
    }

    /// Whether [`FrameBuffer::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Get the number of entries currently in the buffer
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if buffer is full
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// Get the buffer capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get fill ratio (0.0 to 1.0)
    pub fn fill_ratio(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    /// Counters since creation
    pub fn stats(&self) -> BufferStats {
        self.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(
            FrameBuffer::<u32>::new(0).err(),
            Some(BufferError::ZeroCapacity)
        );
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let buffer = FrameBuffer::new(3).unwrap();
        for i in 0..3 {
            assert_eq!(buffer.push(i).unwrap(), PushOutcome::Stored);
        }
        assert!(buffer.is_full());
        assert_eq!(buffer.push(3).unwrap(), PushOutcome::EvictedOldest);
        assert_eq!(buffer.push(4).unwrap(), PushOutcome::EvictedOldest);

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.try_pop(ConsumeOrder::Fifo), Some(2));
        assert_eq!(buffer.try_pop(ConsumeOrder::Fifo), Some(3));
        assert_eq!(buffer.try_pop(ConsumeOrder::Fifo), Some(4));
        assert_eq!(buffer.try_pop(ConsumeOrder::Fifo), None);

        let stats = buffer.stats();
        assert_eq!(stats.total_written, 5);
        assert_eq!(stats.evicted, 2);
        assert_eq!(stats.consumed, 3);
    }

    #[test]
    fn test_latest_discards_stale_entries() {
        let buffer = FrameBuffer::new(5).unwrap();
        for i in 0..4 {
            buffer.push(i).unwrap();
        }
        assert_eq!(buffer.try_pop(ConsumeOrder::Latest), Some(3));
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().superseded, 3);
    }

    #[test]
    fn test_fill_ratio() {
        let buffer = FrameBuffer::new(4).unwrap();
        assert_eq!(buffer.fill_ratio(), 0.0);
        buffer.push(1).unwrap();
        buffer.push(2).unwrap();
        assert!((buffer.fill_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_push_after_close_fails() {
        let buffer = FrameBuffer::new(2).unwrap();
        buffer.close();
        assert_eq!(buffer.push(1), Err(BufferError::Closed));
    }

    #[tokio::test]
    async fn test_recv_waits_for_push() {
        let buffer = Arc::new(FrameBuffer::new(2).unwrap());
        let consumer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.recv(ConsumeOrder::Latest).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.push(7u32).unwrap();

        assert_eq!(consumer.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_recv_drains_then_ends_after_close() {
        let buffer = FrameBuffer::new(4).unwrap();
        buffer.push(1u32).unwrap();
        buffer.push(2u32).unwrap();
        buffer.close();

        assert_eq!(buffer.recv(ConsumeOrder::Fifo).await, Some(1));
        assert_eq!(buffer.recv(ConsumeOrder::Fifo).await, Some(2));
        assert_eq!(buffer.recv(ConsumeOrder::Fifo).await, None);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumer() {
        let buffer = Arc::new(FrameBuffer::<u32>::new(2).unwrap());
        let consumer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.recv(ConsumeOrder::Fifo).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.close();

        assert_eq!(consumer.await.unwrap(), None);
    }

    proptest! {
        #[test]
        fn prop_retains_newest_entries(capacity in 1usize..16, count in 0usize..64) {
            let buffer = FrameBuffer::new(capacity).unwrap();
            for i in 0..count {
                buffer.push(i).unwrap();
            }

            prop_assert!(buffer.len() <= capacity);
            let kept = count.min(capacity);
            let mut drained = Vec::new();
            while let Some(item) = buffer.try_pop(ConsumeOrder::Fifo) {
                drained.push(item);
            }
            let expected: Vec<usize> = (count - kept..count).collect();
            prop_assert_eq!(drained, expected);
            prop_assert_eq!(buffer.stats().evicted as usize, count - kept);
        }
    }
}
