//! Tiered task queue: priority ordering across tiers, stable FIFO within
//! one, bounded size with a typed overflow error.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::types::{IngestError, Priority, Task};

struct QueueInner {
    high: VecDeque<Task>,
    medium: VecDeque<Task>,
    low: VecDeque<Task>,
}

impl QueueInner {
    fn len(&self) -> usize {
        self.high.len() + self.medium.len() + self.low.len()
    }

    fn tier_mut(&mut self, priority: Priority) -> &mut VecDeque<Task> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Medium => &mut self.medium,
            Priority::Low => &mut self.low,
        }
    }
}

pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    notify: Notify,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                high: VecDeque::new(),
                medium: VecDeque::new(),
                low: VecDeque::new(),
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Enqueue at the back of the task's priority tier. Overflow rejects
    /// with `QueueFull` instead of blocking the scheduler.
    pub fn push(&self, task: Task) -> Result<(), IngestError> {
        {
            let mut inner = self.inner.lock().expect("task queue lock");
            if inner.len() >= self.capacity {
                return Err(IngestError::QueueFull);
            }
            let priority = task.priority;
            inner.tier_mut(priority).push_back(task);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Requeue at the front of the tier. Used for tasks reclaimed from a
    /// stuck worker; existing work is never dropped for capacity.
    pub fn push_front(&self, task: Task) {
        {
            let mut inner = self.inner.lock().expect("task queue lock");
            let priority = task.priority;
            inner.tier_mut(priority).push_front(task);
        }
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<Task> {
        let mut inner = self.inner.lock().expect("task queue lock");
        inner
            .high
            .pop_front()
            .or_else(|| inner.medium.pop_front())
            .or_else(|| inner.low.pop_front())
    }

    /// Wait for the next task; `None` when cancelled.
    pub async fn recv(&self, cancel: &CancellationToken) -> Option<Task> {
        loop {
            if let Some(task) = self.pop() {
                return Some(task);
            }
            let notified = self.notify.notified();
            // A push may have landed between the pop and registering.
            if let Some(task) = self.pop() {
                return Some(task);
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("task queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Depths per tier: (high, medium, low).
    pub fn depths(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock().expect("task queue lock");
        (inner.high.len(), inner.medium.len(), inner.low.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::mailboxes::tests::sample_mailbox;
    use crate::types::TaskKind;

    fn task(id: &str, priority: Priority) -> Task {
        let mut t = Task::new(sample_mailbox(id), priority, TaskKind::Poll, 2);
        t.id = id.to_string();
        t
    }

    #[test]
    fn test_priority_order_across_tiers() {
        let q = TaskQueue::new(100);
        q.push(task("low-1", Priority::Low)).unwrap();
        q.push(task("high-1", Priority::High)).unwrap();
        q.push(task("med-1", Priority::Medium)).unwrap();
        q.push(task("high-2", Priority::High)).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| q.pop().map(|t| t.id)).collect();
        assert_eq!(order, vec!["high-1", "high-2", "med-1", "low-1"]);
    }

    #[test]
    fn test_fifo_within_tier() {
        let q = TaskQueue::new(100);
        for i in 0..5 {
            q.push(task(&format!("t-{}", i), Priority::Medium)).unwrap();
        }
        for i in 0..5 {
            assert_eq!(q.pop().unwrap().id, format!("t-{}", i));
        }
    }

    #[test]
    fn test_overflow_rejects_with_typed_error() {
        let q = TaskQueue::new(2);
        q.push(task("a", Priority::Low)).unwrap();
        q.push(task("b", Priority::Low)).unwrap();
        let err = q.push(task("c", Priority::Low)).unwrap_err();
        assert!(matches!(err, IngestError::QueueFull));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_push_front_jumps_its_tier() {
        let q = TaskQueue::new(100);
        q.push(task("m-1", Priority::Medium)).unwrap();
        q.push(task("m-2", Priority::Medium)).unwrap();
        q.push_front(task("reclaimed", Priority::Medium));
        // Higher tiers still win over a front-requeued medium task.
        q.push(task("h-1", Priority::High)).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| q.pop().map(|t| t.id)).collect();
        assert_eq!(order, vec!["h-1", "reclaimed", "m-1", "m-2"]);
    }

    #[tokio::test]
    async fn test_recv_returns_none_on_cancel() {
        let q = TaskQueue::new(10);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(q.recv(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let q = std::sync::Arc::new(TaskQueue::new(10));
        let cancel = CancellationToken::new();

        let q2 = q.clone();
        let handle = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            q2.recv(&cancel).await.map(|t| t.id)
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.push(task("wake", Priority::Low)).unwrap();

        let got = handle.await.unwrap();
        assert_eq!(got.as_deref(), Some("wake"));

        cancel.cancel();
        assert!(q.recv(&cancel).await.is_none());
    }
}
