//! The reconciliation work queue.
//!
//! Watch handlers enqueue keys; a worker pops them. Keys already pending are
//! not enqueued again, so a burst of events for one service collapses into a
//! single reconciliation. A key popped for processing may be re-enqueued
//! while it is being worked on.

use ahash::AHashSet;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use trellis_controller_core::ResourceId;

/// A unit of reconciliation work.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    /// Sync the shadow service for one user service, then rebuild.
    Service(ResourceId),
    /// Rebuild the topology and configuration only.
    Refresh,
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Service(id) => write!(f, "{id}"),
            Self::Refresh => "refresh".fmt(f),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct WorkQueue(Arc<Inner>);

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<Key>,
    pending: AHashSet<Key>,
    closed: bool,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a key unless an identical key is already pending.
    pub fn push(&self, key: Key) {
        {
            let mut state = self.0.state.lock();
            if state.closed || !state.pending.insert(key.clone()) {
                return;
            }
            state.queue.push_back(key);
        }
        self.0.notify.notify_one();
    }

    /// Pops the next key, waiting for one to arrive.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Key> {
        loop {
            let notified = self.0.notify.notified();
            {
                let mut state = self.0.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.pending.remove(&key);
                    return Some(key);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Closes the queue; pending keys remain poppable.
    pub fn close(&self) {
        self.0.state.lock().closed = true;
        self.0.notify.notify_waiters();
        // A waiter between its queue check and its first poll misses
        // notify_waiters; the stored permit catches it.
        self.0.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.0.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deduplicates_pending_keys() {
        let queue = WorkQueue::new();
        let key = Key::Service(ResourceId::new("a", "foo"));
        queue.push(key.clone());
        queue.push(key.clone());
        queue.push(Key::Refresh);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop().await, Some(key.clone()));
        // The key is no longer pending once popped, so it can re-enter.
        queue.push(key.clone());
        assert_eq!(queue.pop().await, Some(Key::Refresh));
        assert_eq!(queue.pop().await, Some(key));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = WorkQueue::new();
        queue.push(Key::Refresh);
        queue.close();
        assert_eq!(queue.pop().await, Some(Key::Refresh));
        assert_eq!(queue.pop().await, None);
        queue.push(Key::Refresh);
        assert_eq!(queue.pop().await, None, "closed queue rejects new keys");
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = WorkQueue::new();
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(Key::Refresh);
        assert_eq!(popper.await.unwrap(), Some(Key::Refresh));
    }
}
