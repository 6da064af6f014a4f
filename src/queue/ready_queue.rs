use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Bounded lock-free FIFO with an async wake-up for consumers.
pub struct ReadyQueue<T> {
    queue: SegQueue<T>,
    capacity: usize,
    size: AtomicUsize,
    notify: Notify,
}

impl<T> ReadyQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: SegQueue::new(),
            capacity,
            size: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    /// Push an item, handing it back if the queue is at capacity.
    pub fn push(&self, item: T) -> Result<(), T> {
        let reserved = self
            .size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
                (size < self.capacity).then_some(size + 1)
            });
        match reserved {
            Ok(_) => {
                self.queue.push(item);
                self.notify.notify_one();
                Ok(())
            }
            Err(_) => Err(item),
        }
    }

    pub fn pop(&self) -> Option<T> {
        let item = self.queue.pop()?;
        self.size.fetch_sub(1, Ordering::AcqRel);
        Some(item)
    }

    /// Wait up to `max_wait` for an item.
    ///
    /// A push that lands between the failed `pop` and the wait is not lost:
    /// `Notify` stores one permit when nobody is waiting.
    pub async fn pop_timeout(&self, max_wait: Duration) -> Option<T> {
        if let Some(item) = self.pop() {
            return Some(item);
        }
        let _ = tokio::time::timeout(max_wait, self.notify.notified()).await;
        self.pop()
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }
}
