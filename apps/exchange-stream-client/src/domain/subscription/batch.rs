//! Batched Subscription Queue
//!
//! Pending subscribe and unsubscribe operations accumulate here and are
//! drained periodically into a single request each. Adding a key that is
//! already queued in the opposite direction cancels both entries.

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::SubscriptionKey;

/// Result of queuing one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The key was appended to its queue.
    Queued,
    /// The key was already queued in the same direction.
    Duplicate,
    /// The key was queued in the opposite direction; both entries were removed.
    Cancelled,
}

/// Items taken from the queues by one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchDrain {
    /// Keys to subscribe, in insertion order.
    pub subscribe: Vec<SubscriptionKey>,
    /// Keys to unsubscribe, in insertion order.
    pub unsubscribe: Vec<SubscriptionKey>,
}

impl BatchDrain {
    /// Check if the drain took nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }
}

#[derive(Debug, Default)]
struct Queues {
    subscribe: VecDeque<SubscriptionKey>,
    unsubscribe: VecDeque<SubscriptionKey>,
}

/// Remove `key` from `queue` if present.
fn take(queue: &mut VecDeque<SubscriptionKey>, key: &SubscriptionKey) -> bool {
    if let Some(pos) = queue.iter().position(|k| k == key) {
        queue.remove(pos);
        true
    } else {
        false
    }
}

fn push(
    same: &mut VecDeque<SubscriptionKey>,
    opposite: &mut VecDeque<SubscriptionKey>,
    key: SubscriptionKey,
) -> EnqueueOutcome {
    if take(opposite, &key) {
        EnqueueOutcome::Cancelled
    } else if same.contains(&key) {
        EnqueueOutcome::Duplicate
    } else {
        same.push_back(key);
        EnqueueOutcome::Queued
    }
}

/// Subscribe/unsubscribe queues with cancel-out, shared by callers and the
/// periodic drain task.
#[derive(Debug, Default)]
pub struct BatchQueue {
    queues: Mutex<Queues>,
}

impl BatchQueue {
    /// Create empty queues.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a subscribe, cancelling a pending unsubscribe for the same key.
    pub fn enqueue_subscribe(&self, key: SubscriptionKey) -> EnqueueOutcome {
        let mut q = self.queues.lock();
        let Queues {
            subscribe,
            unsubscribe,
        } = &mut *q;
        push(subscribe, unsubscribe, key)
    }

    /// Queue an unsubscribe, cancelling a pending subscribe for the same key.
    pub fn enqueue_unsubscribe(&self, key: SubscriptionKey) -> EnqueueOutcome {
        let mut q = self.queues.lock();
        let Queues {
            subscribe,
            unsubscribe,
        } = &mut *q;
        push(unsubscribe, subscribe, key)
    }

    /// Take at most `max` items from each queue.
    pub fn drain(&self, max: usize) -> BatchDrain {
        let mut q = self.queues.lock();
        let sub_n = q.subscribe.len().min(max);
        let unsub_n = q.unsubscribe.len().min(max);

        BatchDrain {
            subscribe: q.subscribe.drain(..sub_n).collect(),
            unsubscribe: q.unsubscribe.drain(..unsub_n).collect(),
        }
    }

    /// Put drained items back at the front of their queues.
    ///
    /// Items that were queued in the opposite direction since the drain
    /// cancel out as they would on enqueue.
    pub fn requeue(&self, drained: BatchDrain) {
        let mut q = self.queues.lock();
        let Queues {
            subscribe,
            unsubscribe,
        } = &mut *q;

        for key in drained.subscribe.into_iter().rev() {
            if !take(unsubscribe, &key) && !subscribe.contains(&key) {
                subscribe.push_front(key);
            }
        }
        for key in drained.unsubscribe.into_iter().rev() {
            if !take(subscribe, &key) && !unsubscribe.contains(&key) {
                unsubscribe.push_front(key);
            }
        }
    }

    /// Whether `key` is waiting to be subscribed.
    #[must_use]
    pub fn is_subscribe_queued(&self, key: &SubscriptionKey) -> bool {
        self.queues.lock().subscribe.contains(key)
    }

    /// Number of pending `(subscribe, unsubscribe)` items.
    #[must_use]
    pub fn pending(&self) -> (usize, usize) {
        let q = self.queues.lock();
        (q.subscribe.len(), q.unsubscribe.len())
    }

    /// Whether both queues are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending() == (0, 0)
    }

    /// Drop everything queued.
    pub fn clear(&self) {
        let mut q = self.queues.lock();
        q.subscribe.clear();
        q.unsubscribe.clear();
    }
}
