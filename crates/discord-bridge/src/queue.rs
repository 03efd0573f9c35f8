//! Bounded FIFO between the event adapter (producer) and the listener (consumer).
//!
//! A `std::sync::Mutex` guards the buffer and is never held across an await;
//! two [`Notify`]s wake the consumer when an item arrives and the producer (or
//! anyone waiting for the queue to drain) when a slot frees up.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// What the producer does when the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for the consumer to free a slot.
    #[default]
    Block,
    /// Evict the oldest buffered item to make room.
    DropOldest,
    /// Discard the incoming item.
    DropNewest,
}

/// Result of a successful [`BoundedQueue::push`].
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    Enqueued,
    /// The item was enqueued after evicting this one.
    DroppedOldest(T),
    /// The queue was full; this item was not enqueued.
    DroppedNewest(T),
}

/// The queue was closed; the rejected item is handed back.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueClosed<T>(pub T);

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    item_added: Notify,
    slot_freed: Notify,
}

impl<T> BoundedQueue<T> {
    /// Create a queue. A capacity of zero is raised to one.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            policy,
            item_added: Notify::new(),
            slot_freed: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Enqueue an item, applying the overflow policy when full.
    ///
    /// Under [`OverflowPolicy::Block`] this waits until a slot frees up or the
    /// queue is closed. Dropping the returned future while it waits leaves the
    /// queue untouched.
    pub async fn push(&self, item: T) -> Result<PushOutcome<T>, QueueClosed<T>> {
        loop {
            let freed = self.slot_freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            {
                let mut state = self.state();
                if state.closed {
                    return Err(QueueClosed(item));
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(item);
                    drop(state);
                    self.item_added.notify_waiters();
                    return Ok(PushOutcome::Enqueued);
                }
                match self.policy {
                    OverflowPolicy::Block => {}
                    OverflowPolicy::DropNewest => return Ok(PushOutcome::DroppedNewest(item)),
                    OverflowPolicy::DropOldest => {
                        let evicted = state.items.pop_front();
                        state.items.push_back(item);
                        drop(state);
                        self.item_added.notify_waiters();
                        return Ok(match evicted {
                            Some(old) => PushOutcome::DroppedOldest(old),
                            None => PushOutcome::Enqueued,
                        });
                    }
                }
            }

            freed.await;
        }
    }

    /// Dequeue the oldest item, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and fully drained. Cancel-safe:
    /// an item is only removed in the same poll that returns it.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let added = self.item_added.notified();
            tokio::pin!(added);
            added.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.slot_freed.notify_waiters();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }

            added.await;
        }
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.state().items.pop_front();
        if item.is_some() {
            self.slot_freed.notify_waiters();
        }
        item
    }

    /// Refuse further pushes. Buffered items can still be popped.
    pub fn close(&self) {
        self.state().closed = true;
        self.item_added.notify_waiters();
        self.slot_freed.notify_waiters();
    }

    /// Discard everything buffered. Returns how many items were dropped.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut state = self.state();
            let n = state.items.len();
            state.items.clear();
            n
        };
        self.slot_freed.notify_waiters();
        dropped
    }

    /// Wait until the queue holds no items.
    pub async fn wait_empty(&self) {
        loop {
            let freed = self.slot_freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            if self.is_empty() {
                return;
            }
            freed.await;
        }
    }
}
