//! [`WorkQueue`] – competitive FIFO of upstream events.
//!
//! Unlike a broadcast bus, every event pushed here is handed to exactly one
//! consumer: the first Worker session whose loop pops it. Events pushed while
//! no Worker is connected simply wait.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::Notify;

/// One queued upstream event, ready to be wrapped in a `start` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub event: String,
    pub data: Value,
}

struct Inner {
    items: Mutex<VecDeque<QueuedEvent>>,
    available: Notify,
}

/// Shared work queue. Clone it cheaply – all clones share the same FIFO.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::new()),
                available: Notify::new(),
            }),
        }
    }

    fn items(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedEvent>> {
        self.inner.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event and wake one waiting consumer.
    pub fn push(&self, event: QueuedEvent) {
        self.items().push_back(event);
        self.inner.available.notify_one();
    }

    /// Put an event back at the head of the queue (its delivery failed).
    pub fn requeue(&self, event: QueuedEvent) {
        self.items().push_front(event);
        self.inner.available.notify_one();
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<QueuedEvent> {
        self.items().pop_front()
    }

    /// Wait for the next event.
    ///
    /// Cancel-safe: an event is only removed from the queue in the same
    /// synchronous step that returns it, so dropping this future inside a
    /// `select!` never loses an event.
    pub async fn pop(&self) -> QueuedEvent {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(event) = self.try_pop() {
                return event;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn event(n: u64) -> QueuedEvent {
        QueuedEvent {
            event: "message_create".into(),
            data: json!({ "n": n }),
        }
    }

    #[test]
    fn fifo_order() {
        let queue = WorkQueue::new();
        queue.push(event(1));
        queue.push(event(2));
        assert_eq!(queue.try_pop(), Some(event(1)));
        assert_eq!(queue.try_pop(), Some(event(2)));
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn requeue_goes_to_the_front() {
        let queue = WorkQueue::new();
        queue.push(event(2));
        queue.requeue(event(1));
        assert_eq!(queue.try_pop(), Some(event(1)));
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = WorkQueue::new();
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(event(7));
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer must wake")
            .unwrap();
        assert_eq!(got, event(7));
    }

    /// Many competing consumers: every event is taken exactly once.
    #[tokio::test]
    async fn competing_consumers_never_duplicate() {
        let queue = WorkQueue::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut consumers = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            let tx = tx.clone();
            consumers.push(tokio::spawn(async move {
                loop {
                    let e = queue.pop().await;
                    if tx.send(e).is_err() {
                        break;
                    }
                }
            }));
        }
        for n in 0..100 {
            queue.push(event(n));
        }
        let mut seen = Vec::new();
        for _ in 0..100 {
            let e = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(e.data["n"].as_u64().unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        assert!(queue.is_empty());
        for c in consumers {
            c.abort();
        }
    }

    #[tokio::test]
    async fn dropped_pop_does_not_lose_events() {
        let queue = WorkQueue::new();
        // A pop that is cancelled before anything arrives.
        let _ = tokio::time::timeout(Duration::from_millis(10), queue.pop()).await;
        queue.push(event(1));
        assert_eq!(queue.pop().await, event(1));
    }
}
