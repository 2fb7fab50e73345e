//! Tasks waiting for host resources.

use crate::model::Task;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// FIFO of tasks blocked on admission. A task appears at most once.
///
/// Only the engine's dispatcher mutates the queue, so a peek followed by a
/// dequeue sees the same head.
#[derive(Debug, Default)]
pub struct WaitingQueue {
    entries: Mutex<VecDeque<Task>>,
}

impl WaitingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `task` to the back. Returns false if it is already queued.
    pub fn enqueue(&self, task: Task) -> bool {
        let mut entries = self.lock();
        if entries.iter().any(|t| t.arn == task.arn) {
            return false;
        }
        entries.push_back(task);
        true
    }

    pub fn peek_front(&self) -> Option<Task> {
        self.lock().front().cloned()
    }

    pub fn dequeue(&self) -> Option<Task> {
        self.lock().pop_front()
    }

    /// Remove a task from anywhere in the queue, keeping the others in order.
    pub fn remove(&self, arn: &str) -> bool {
        let mut entries = self.lock();
        match entries.iter().position(|t| t.arn == arn) {
            Some(idx) => entries.remove(idx).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, arn: &str) -> bool {
        self.lock().iter().any(|t| t.arn == arn)
    }

    pub fn get(&self, arn: &str) -> Option<Task> {
        self.lock().iter().find(|t| t.arn == arn).cloned()
    }

    /// Apply `f` to a queued task in place.
    pub fn update(&self, arn: &str, f: impl FnOnce(&mut Task)) -> bool {
        let mut entries = self.lock();
        match entries.iter_mut().find(|t| t.arn == arn) {
            Some(task) => {
                f(task);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Queued tasks in order, for listing and persistence.
    pub fn tasks(&self) -> Vec<Task> {
        self.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Container;

    fn make_task(arn: &str) -> Task {
        Task::new(arn, vec![Container::new("app", "busybox")])
    }

    #[test]
    fn test_fifo_order() {
        let q = WaitingQueue::new();
        q.enqueue(make_task("a"));
        q.enqueue(make_task("b"));
        assert_eq!(q.peek_front().map(|t| t.arn), Some("a".to_string()));
        assert_eq!(q.dequeue().map(|t| t.arn), Some("a".to_string()));
        assert_eq!(q.dequeue().map(|t| t.arn), Some("b".to_string()));
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn test_remove_preserves_order() {
        let q = WaitingQueue::new();
        for arn in ["a", "b", "c"] {
            q.enqueue(make_task(arn));
        }
        assert!(q.remove("b"));
        assert!(!q.remove("b"));
        assert_eq!(q.dequeue().map(|t| t.arn), Some("a".to_string()));
        assert_eq!(q.dequeue().map(|t| t.arn), Some("c".to_string()));
    }

    #[test]
    fn test_enqueue_at_most_once() {
        let q = WaitingQueue::new();
        assert!(q.enqueue(make_task("a")));
        assert!(!q.enqueue(make_task("a")));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_update_in_place() {
        let q = WaitingQueue::new();
        q.enqueue(make_task("a"));
        assert!(q.update("a", |t| t.family = "web".to_string()));
        assert_eq!(q.get("a").map(|t| t.family), Some("web".to_string()));
        assert!(!q.update("missing", |_| {}));
    }
}
