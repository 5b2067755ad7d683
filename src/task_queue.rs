//! Bounded priority task queue
//!
//! Pending tasks are ordered by `(priority, submission order)`: strict
//! priority between classes, FIFO within a class, no aging. Handlers push
//! and block while the queue is at capacity; workers pop and block while
//! it is empty; shutdown wakes everybody. Like the connection queue, tasks
//! already queued when shutdown fires are still drained, so every handler
//! blocked on a rendezvous is eventually answered.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::task::{Task, TaskKind};

struct QueuedTask {
    // (priority, seq) ascending; seq is assigned at push time, which equals
    // creation order because handlers submit immediately after construction.
    key: (u8, u64),
    task: Arc<Task>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the smallest key is at the top.
        other.key.cmp(&self.key)
    }
}

struct Inner {
    heap: BinaryHeap<QueuedTask>,
    next_seq: u64,
    shutdown: bool,
}

/// Bounded, shutdown-aware priority queue of tasks.
pub(crate) struct TaskQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl TaskQueue {
    pub(crate) fn new(capacity: usize) -> TaskQueue {
        assert!(capacity > 0);
        TaskQueue {
            capacity,
            inner: Mutex::new(Inner {
                heap: BinaryHeap::with_capacity(capacity),
                next_seq: 0,
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn enqueue_locked(inner: &mut Inner, task: Arc<Task>) {
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(QueuedTask {
            key: (task.priority() as u8, seq),
            task,
        });
    }

    /// Submit a task, blocking while the queue is at capacity.
    ///
    /// On shutdown-abort the task is handed back; the submitting handler
    /// reports the failure itself rather than waiting on a rendezvous that
    /// no worker will ever complete.
    pub(crate) fn push(&self, task: Arc<Task>) -> Result<(), Arc<Task>> {
        let mut inner = self.inner.lock();
        while inner.heap.len() >= self.capacity && !inner.shutdown {
            debug!("task queue full, handler waiting");
            self.not_full.wait(&mut inner);
        }
        if inner.shutdown {
            return Err(task);
        }
        Self::enqueue_locked(&mut inner, task);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue a [`TaskKind::Shutdown`] pseudo-task.
    ///
    /// Exempt from the capacity bound and the shutdown abort: these are
    /// pushed after the flag goes up, one per worker, and must always land.
    /// They carry low priority, so the entire user backlog drains first.
    pub(crate) fn push_shutdown(&self) {
        let task = Task::shutdown();
        debug_assert!(matches!(task.kind(), TaskKind::Shutdown));
        let mut inner = self.inner.lock();
        Self::enqueue_locked(&mut inner, task);
        self.not_empty.notify_one();
    }

    /// Take the highest-priority task, blocking while the queue is empty.
    ///
    /// Returns `None` only when shutdown has been signalled and nothing is
    /// left to drain.
    pub(crate) fn pop(&self) -> Option<Arc<Task>> {
        let mut inner = self.inner.lock();
        while inner.heap.is_empty() && !inner.shutdown {
            self.not_empty.wait(&mut inner);
        }
        let entry = inner.heap.pop();
        if entry.is_some() {
            self.not_full.notify_one();
        }
        entry.map(|e| e.task)
    }

    /// Signal shutdown and wake every blocked pusher and popper.
    pub(crate) fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Priority, TaskKind, TaskResult};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    struct SocketFactory {
        listener: TcpListener,
    }

    impl SocketFactory {
        fn new() -> SocketFactory {
            SocketFactory {
                listener: TcpListener::bind("127.0.0.1:0").unwrap(),
            }
        }

        fn task(&self, name: &str, priority: Priority) -> Arc<Task> {
            let client = TcpStream::connect(self.listener.local_addr().unwrap()).unwrap();
            let (server, _) = self.listener.accept().unwrap();
            drop(client);
            Task::new(
                TaskKind::Upload { name: name.into() },
                "alice",
                priority,
                Arc::new(server),
            )
        }
    }

    fn name_of(task: &Task) -> String {
        match task.kind() {
            TaskKind::Upload { name } => name.clone(),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn strict_priority_fifo_within_class() {
        let sockets = SocketFactory::new();
        let queue = TaskQueue::new(8);

        queue.push(sockets.task("med-1", Priority::Medium)).unwrap();
        queue.push(sockets.task("low-1", Priority::Low)).unwrap();
        queue.push(sockets.task("high-1", Priority::High)).unwrap();
        queue.push(sockets.task("high-2", Priority::High)).unwrap();
        queue.push(sockets.task("med-2", Priority::Medium)).unwrap();

        let order: Vec<String> = (0..5).map(|_| name_of(&queue.pop().unwrap())).collect();
        assert_eq!(order, ["high-1", "high-2", "med-1", "med-2", "low-1"]);
    }

    #[test]
    fn push_blocks_at_capacity() {
        let sockets = SocketFactory::new();
        let queue = Arc::new(TaskQueue::new(1));
        queue.push(sockets.task("a", Priority::Medium)).unwrap();

        let blocked = Arc::new(AtomicBool::new(true));
        let pusher = {
            let queue = queue.clone();
            let blocked = blocked.clone();
            let task = sockets.task("b", Priority::Medium);
            thread::spawn(move || {
                queue.push(task).unwrap();
                blocked.store(false, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(blocked.load(Ordering::SeqCst));
        queue.pop().unwrap();
        pusher.join().unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn pop_blocks_until_a_push() {
        let sockets = SocketFactory::new();
        let queue = Arc::new(TaskQueue::new(2));
        let popper = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(50));
        queue.push(sockets.task("a", Priority::High)).unwrap();
        let task = popper.join().unwrap().unwrap();
        assert_eq!(name_of(&task), "a");
    }

    #[test]
    fn shutdown_aborts_waiters_but_drains_backlog() {
        let sockets = SocketFactory::new();
        let queue = Arc::new(TaskQueue::new(4));
        queue.push(sockets.task("pending", Priority::Medium)).unwrap();

        queue.shutdown();
        assert!(queue.push(sockets.task("late", Priority::High)).is_err());

        // The backlog still drains so its handler gets an answer.
        assert_eq!(name_of(&queue.pop().unwrap()), "pending");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn shutdown_tasks_bypass_capacity_and_sort_last() {
        let sockets = SocketFactory::new();
        let queue = TaskQueue::new(1);
        queue.push(sockets.task("user-work", Priority::Low)).unwrap();
        queue.shutdown();
        queue.push_shutdown();

        assert_eq!(name_of(&queue.pop().unwrap()), "user-work");
        let last = queue.pop().unwrap();
        assert!(matches!(last.kind(), TaskKind::Shutdown));
        last.start();
        last.complete(TaskResult::message("worker exiting"));
        assert!(queue.pop().is_none());
    }
}
