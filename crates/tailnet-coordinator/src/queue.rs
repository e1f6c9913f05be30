//! Bounded drop-oldest queue feeding one peer's outbound stream

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Single-consumer queue that never blocks producers.
///
/// When full, pushing discards the oldest entry. Node updates are
/// last-writer-wins, so a slow peer still converges on the newest state
/// without holding up anyone else.
#[derive(Debug)]
pub struct UpdateQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

impl<T> UpdateQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an item. Returns false if the queue is closed.
    pub fn push(&self, item: T) -> bool {
        {
            let mut state = self.state();
            if state.closed {
                return false;
            }
            if state.items.len() >= self.capacity {
                state.items.pop_front();
                state.dropped += 1;
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for at least one item and take up to `max` of them.
    ///
    /// Returns `None` once the queue is closed; items still queued at that
    /// point are discarded.
    pub async fn pop_batch(&self, max: usize) -> Option<Vec<T>> {
        loop {
            {
                let mut state = self.state();
                if state.closed {
                    return None;
                }
                if !state.items.is_empty() {
                    let n = state.items.len().min(max.max(1));
                    return Some(state.items.drain(..n).collect());
                }
            }
            self.notify.notified().await;
        }
    }

    /// Take everything queued without waiting
    pub fn drain(&self) -> Vec<T> {
        self.state().items.drain(..).collect()
    }

    /// Close the queue and wake the consumer
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.state().dropped
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
