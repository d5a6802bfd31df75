//! Bounded FIFO hand-off between the watcher and the control loop.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Error, Result};

/// Default queue capacity.
pub const QUEUE_CAPACITY: usize = 64;

struct Inner<T> {
    items: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
}

/// FIFO queue with a non-blocking producer and suspending consumers.
///
/// Consumers waiting in [`ReadingQueue::pop`] are served in the order they
/// started waiting. When the queue is full the oldest item is discarded.
pub struct ReadingQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
}

impl<T> std::fmt::Debug for ReadingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadingQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T> Default for ReadingQueue<T> {
    fn default() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }
}

impl<T> ReadingQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                waiters: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue `item`, handing it straight to the oldest waiting consumer if
    /// there is one.
    pub fn push(&self, item: T) {
        let mut inner = self.lock();
        let mut item = item;
        while let Some(waiter) = inner.waiters.pop_front() {
            match waiter.send(item) {
                Ok(()) => return,
                Err(returned) => item = returned,
            }
        }
        if inner.items.len() >= self.capacity {
            inner.items.pop_front();
            warn!(capacity = self.capacity, "Reading queue full, dropped oldest item");
        }
        inner.items.push_back(item);
    }

    /// Dequeue the next item, waiting until one is pushed or `cancel` fires.
    pub async fn pop(&self, cancel: &CancellationToken) -> Result<T> {
        let mut rx = {
            let mut inner = self.lock();
            if let Some(item) = inner.items.pop_front() {
                return Ok(item);
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(tx);
            rx
        };

        tokio::select! {
            biased;
            item = &mut rx => item.map_err(|_| Error::Cancelled),
            _ = cancel.cancelled() => {
                rx.close();
                // An item sent before close() must not be lost.
                if let Ok(item) = rx.try_recv() {
                    self.lock().items.push_front(item);
                }
                Err(Error::Cancelled)
            }
        }
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = ReadingQueue::new();
        let cancel = CancellationToken::new();
        for i in 1..=3 {
            queue.push(i);
        }
        assert_eq!(queue.pop(&cancel).await.unwrap(), 1);
        assert_eq!(queue.pop(&cancel).await.unwrap(), 2);
        assert_eq!(queue.pop(&cancel).await.unwrap(), 3);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(ReadingQueue::new());
        let cancel = CancellationToken::new();

        let consumer = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.pop(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!consumer.is_finished());

        queue.push(7);
        assert_eq!(consumer.await.unwrap().unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_served_in_request_order() {
        let queue = Arc::new(ReadingQueue::new());
        let cancel = CancellationToken::new();

        let mut consumers = Vec::new();
        for _ in 0..3 {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            consumers.push(tokio::spawn(async move { queue.pop(&cancel).await }));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for i in 1..=3 {
            queue.push(i);
        }
        let mut got = Vec::new();
        for consumer in consumers {
            got.push(consumer.await.unwrap().unwrap());
        }
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unblocks_consumer() {
        let queue: Arc<ReadingQueue<u32>> = Arc::new(ReadingQueue::new());
        let cancel = CancellationToken::new();

        let consumer = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.pop(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert!(matches!(consumer.await.unwrap(), Err(Error::Cancelled)));

        // The cancelled waiter is skipped.
        queue.push(1);
        assert_eq!(queue.try_pop(), Some(1));
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let queue = ReadingQueue::with_capacity(2);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }
}
