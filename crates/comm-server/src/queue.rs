use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// What to do when a push would exceed capacity. The reliable channel
/// cannot silently lose frames without corrupting ordering for its
/// consumer, so it rejects and lets the caller disconnect the peer; the
/// unreliable channel already promises best-effort delivery, so it just
/// drops the oldest queued frame to make room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    RejectOnFull,
    DropOldestOnFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    DroppedOldest,
    Rejected,
}

struct Inner {
    queue: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    capacity: usize,
    policy: Policy,
    closed: AtomicBool,
}

/// A bounded outbound frame queue shared between the producer (the
/// central task, or a pump copying frames across the mesh) and the
/// consumer (the per-channel write pump). Cloning shares the same
/// underlying buffer, mirroring a channel's sender/receiver split
/// without needing two distinct handle types.
#[derive(Clone)]
pub struct OutboundQueue {
    inner: Arc<Inner>,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: Policy) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
                notify: Notify::new(),
                capacity,
                policy,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue a frame, applying this queue's overflow policy. Never
    /// blocks.
    pub fn push(&self, frame: Vec<u8>) -> PushOutcome {
        let mut queue = self.inner.queue.lock().unwrap();
        if queue.len() < self.inner.capacity {
            queue.push_back(frame);
            drop(queue);
            self.inner.notify.notify_one();
            return PushOutcome::Enqueued;
        }
        match self.inner.policy {
            Policy::RejectOnFull => PushOutcome::Rejected,
            Policy::DropOldestOnFull => {
                queue.pop_front();
                queue.push_back(frame);
                drop(queue);
                self.inner.notify.notify_one();
                PushOutcome::DroppedOldest
            }
        }
    }

    /// Wait for and remove the next frame. Returns `None` once the queue
    /// has been closed and drained.
    pub async fn pop(&self) -> Option<Vec<u8>> {
        loop {
            {
                let mut queue = self.inner.queue.lock().unwrap();
                if let Some(frame) = queue.pop_front() {
                    return Some(frame);
                }
                if self.inner.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Wake any pending `pop` so it observes the closed state and exits.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_under_capacity_enqueues() {
        let q = OutboundQueue::new(2, Policy::RejectOnFull);
        assert_eq!(q.push(vec![1]), PushOutcome::Enqueued);
        assert_eq!(q.push(vec![2]), PushOutcome::Enqueued);
    }

    #[test]
    fn reject_on_full_rejects_without_mutating_queue() {
        let q = OutboundQueue::new(1, Policy::RejectOnFull);
        assert_eq!(q.push(vec![1]), PushOutcome::Enqueued);
        assert_eq!(q.push(vec![2]), PushOutcome::Rejected);
    }

    #[test]
    fn drop_oldest_makes_room_for_newest() {
        let q = OutboundQueue::new(1, Policy::DropOldestOnFull);
        assert_eq!(q.push(vec![1]), PushOutcome::Enqueued);
        assert_eq!(q.push(vec![2]), PushOutcome::DroppedOldest);
    }

    #[tokio::test]
    async fn pop_returns_frames_in_order() {
        let q = OutboundQueue::new(4, Policy::RejectOnFull);
        q.push(vec![1]);
        q.push(vec![2]);
        assert_eq!(q.pop().await, Some(vec![1]));
        assert_eq!(q.pop().await, Some(vec![2]));
    }

    #[tokio::test]
    async fn pop_returns_none_after_close_and_drain() {
        let q = OutboundQueue::new(4, Policy::RejectOnFull);
        q.push(vec![1]);
        q.close();
        assert_eq!(q.pop().await, Some(vec![1]));
        assert_eq!(q.pop().await, None);
    }

    #[tokio::test]
    async fn pop_wakes_on_push_after_waiting() {
        let q = OutboundQueue::new(4, Policy::RejectOnFull);
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.pop().await });
        tokio::task::yield_now().await;
        q.push(vec![9]);
        assert_eq!(handle.await.unwrap(), Some(vec![9]));
    }
}
