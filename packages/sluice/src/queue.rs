//! Action Queue - the ordered buffer between `dispatch` and the drain loop.
//!
//! Strict FIFO with no priorities and no cancellation. Every enqueue and
//! dequeue is reported synchronously to subscribers; the store subscribes to
//! wake its drain task.
//!
//! The queue itself is not synchronized. The store owns it behind a mutex and
//! only the drain task dequeues.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::trace;

use crate::core::Action;
use crate::error::{Result, SluiceError};

/// What happened to the entry a subscriber is told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOp {
    Enqueued,
    Dequeued,
}

/// Called with the operation, the affected action and the queue length after it.
type Subscriber = Arc<dyn Fn(QueueOp, &Action, usize) + Send + Sync>;

/// An action plus the channel that settles its caller's future.
///
/// Resolving consumes the entry, so it can be settled at most once.
pub struct QueuedEntry {
    action: Action,
    settle: Option<oneshot::Sender<Action>>,
}

impl QueuedEntry {
    pub fn new(action: Action, settle: oneshot::Sender<Action>) -> Self {
        Self {
            action,
            settle: Some(settle),
        }
    }

    /// An entry nobody is waiting on (timed and internal dispatches).
    pub fn detached(action: Action) -> Self {
        Self {
            action,
            settle: None,
        }
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    /// Settle the caller's future with the processed action.
    pub fn resolve(self) {
        if let Some(tx) = self.settle {
            // The caller may have stopped waiting; that is fine.
            let _ = tx.send(self.action);
        }
    }
}

impl std::fmt::Debug for QueuedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedEntry")
            .field("action", &self.action)
            .field("awaited", &self.settle.is_some())
            .finish()
    }
}

/// FIFO action queue with enqueue/dequeue subscriptions.
#[derive(Default)]
pub struct ActionQueue {
    entries: VecDeque<QueuedEntry>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber: u64,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail, then notify subscribers.
    pub fn enqueue(&mut self, entry: QueuedEntry) {
        trace!(action_type = %entry.action().action_type(), "enqueue");
        self.entries.push_back(entry);
        if let Some(entry) = self.entries.back() {
            self.notify(QueueOp::Enqueued, entry.action());
        }
    }

    /// Remove and return the head.
    ///
    /// Fails with [`SluiceError::EmptyQueue`]; callers check [`is_empty`](Self::is_empty) first.
    pub fn dequeue(&mut self) -> Result<QueuedEntry> {
        let entry = self.entries.pop_front().ok_or(SluiceError::EmptyQueue)?;
        trace!(action_type = %entry.action().action_type(), "dequeue");
        self.notify(QueueOp::Dequeued, entry.action());
        Ok(entry)
    }

    /// Look at the head without removing it.
    pub fn peek(&self) -> Option<&Action> {
        self.entries.front().map(QueuedEntry::action)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Subscribe to enqueue/dequeue events. Returns an id for [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe<F>(&mut self, f: F) -> u64
    where
        F: Fn(QueueOp, &Action, usize) + Send + Sync + 'static,
    {
        let id = self.next_subscriber;
        self.next_subscriber += 1;
        self.subscribers.insert(id, Arc::new(f));
        id
    }

    pub fn unsubscribe(&mut self, id: u64) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    fn notify(&self, op: QueueOp, action: &Action) {
        let depth = self.entries.len();
        for subscriber in self.subscribers.values() {
            subscriber(op, action, depth);
        }
    }
}

impl std::fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionQueue")
            .field("len", &self.entries.len())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ActionSpec;
    use std::sync::Mutex;

    fn entry(action_type: &str) -> QueuedEntry {
        QueuedEntry::detached(Action::stamp(ActionSpec::new(action_type), "test"))
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = ActionQueue::new();
        queue.enqueue(entry("a"));
        queue.enqueue(entry("b"));
        queue.enqueue(entry("c"));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peek().map(|a| a.action_type()), Some("a"));

        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue().ok())
            .map(|e| e.action().action_type().to_string())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_dequeue_empty_fails() {
        let mut queue = ActionQueue::new();
        assert!(matches!(queue.dequeue(), Err(SluiceError::EmptyQueue)));
    }

    #[test]
    fn test_peek_is_non_destructive() {
        let mut queue = ActionQueue::new();
        queue.enqueue(entry("a"));
        assert!(queue.peek().is_some());
        assert!(queue.peek().is_some());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_subscribers_see_both_ops() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut queue = ActionQueue::new();
        let sink = seen.clone();
        let id = queue.subscribe(move |op, action, depth| {
            sink.lock()
                .unwrap()
                .push((op, action.action_type().to_string(), depth));
        });

        queue.enqueue(entry("a"));
        queue.enqueue(entry("b"));
        queue.dequeue().unwrap();

        // Subscribers run after the entry is in (or out of) the queue.
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (QueueOp::Enqueued, "a".to_string(), 1),
                (QueueOp::Enqueued, "b".to_string(), 2),
                (QueueOp::Dequeued, "a".to_string(), 1)
            ]
        );

        assert!(queue.unsubscribe(id));
        queue.enqueue(entry("c"));
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_resolve_settles_caller() {
        let (tx, rx) = oneshot::channel();
        let queued = QueuedEntry::new(Action::stamp(ActionSpec::new("a"), "test"), tx);
        queued.resolve();
        let action = rx.await.unwrap();
        assert_eq!(action.action_type(), "a");
    }
}
