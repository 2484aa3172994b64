//! Bounded drop-oldest queue feeding the per-port workers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A bounded FIFO whose `push` never blocks: when full, the oldest item is
/// evicted and handed back to the caller.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Append an item, returning the evicted oldest item if the queue was full.
    ///
    /// Pushing to a closed queue hands the item straight back.
    pub fn push(&self, item: T) -> Result<Option<T>, T> {
        if self.is_closed() {
            return Err(item);
        }

        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };
        self.notify.notify_one();
        Ok(evicted)
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Wait for the next item; `None` once the queue is closed
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            if self.is_closed() {
                return None;
            }
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            notified.await;
        }
    }

    /// Inspect the head without removing it
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.items.lock().front().map(f)
    }

    /// Close the queue and return whatever was still waiting
    pub fn close(&self) -> Vec<T> {
        self.closed.store(true, Ordering::SeqCst);
        let rest = self.items.lock().drain(..).collect();
        self.notify.notify_waiters();
        rest
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_drop_oldest() {
        let queue = BoundedQueue::new(2);
        assert_eq!(queue.push(1), Ok(None));
        assert_eq!(queue.push(2), Ok(None));
        assert_eq!(queue.push(3), Ok(Some(1)));
        assert_eq!(queue.peek_with(|v| *v), Some(2));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[tokio::test]
    async fn test_pop_waits_and_close_wakes() {
        let queue = Arc::new(BoundedQueue::new(4));

        let q = Arc::clone(&queue);
        let waiter = tokio::spawn(async move { q.pop().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push("a").unwrap();
        assert_eq!(waiter.await.unwrap(), Some("a"));

        let q = Arc::clone(&queue);
        let waiter = tokio::spawn(async move { q.pop().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push("left").unwrap();
        // The waiter may or may not have taken "left" before close
        let rest = queue.close();
        let popped = waiter.await.unwrap();
        assert!(popped.is_some() || rest == vec!["left"]);
        assert_eq!(queue.push("late"), Err("late"));
    }
}
