//! Task rendezvous
//!
//! A task is the one-shot synchronous hand-off between a handler and a
//! worker. The handler constructs it `Pending`, submits it to the task
//! queue and blocks on [`Task::wait`]; the worker that dequeues it owns it
//! until it publishes exactly one terminal state and signals. The client
//! socket rides along as a shared handle: the worker reads and writes body
//! bytes on it directly, which is safe because the handler is parked on the
//! rendezvous for exactly that interval.

use std::net::TcpStream;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::protocol::MAX_MESSAGE_LEN;

/// Scheduling priority. Lower discriminant sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Serviced before everything else.
    High = 1,
    /// The default.
    Medium = 2,
    /// May starve under sustained high-priority load; that is accepted.
    Low = 3,
}

/// What a task does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Receive a file body from the client and store it.
    Upload {
        /// Client-supplied name, sanitized by the worker before use.
        name: String,
    },
    /// Stream a stored file back to the client.
    Download {
        /// Client-supplied name, sanitized by the worker before use.
        name: String,
    },
    /// Remove a stored file.
    Delete {
        /// Client-supplied name, sanitized by the worker before use.
        name: String,
    },
    /// Produce the user's file listing.
    List,
    /// Pseudo-task that makes the receiving worker thread exit.
    Shutdown,
}

/// Result payload of a successfully completed task.
#[derive(Debug, Default)]
pub struct TaskResult {
    /// Human-readable status, capped at [`MAX_MESSAGE_LEN`] bytes.
    pub message: String,
    /// Raw bytes the handler forwards verbatim (the LIST listing).
    pub payload: Option<Vec<u8>>,
}

impl TaskResult {
    /// A plain success message with no payload.
    pub fn message(text: impl Into<String>) -> Self {
        TaskResult {
            message: truncate_message(text.into()),
            payload: None,
        }
    }

    /// A success carrying bytes for the handler to forward verbatim.
    pub fn with_payload(text: impl Into<String>, payload: Vec<u8>) -> Self {
        TaskResult {
            message: truncate_message(text.into()),
            payload: Some(payload),
        }
    }
}

#[derive(Debug)]
enum TaskState {
    Pending,
    InProgress,
    Completed(TaskResult),
    Failed(String),
}

/// The rendezvous record.
#[derive(Debug)]
pub struct Task {
    kind: TaskKind,
    user: String,
    priority: Priority,
    conn: Option<Arc<TcpStream>>,
    state: Mutex<TaskState>,
    done: Condvar,
}

impl Task {
    /// Create a pending task bound to a client connection.
    pub fn new(kind: TaskKind, user: impl Into<String>, priority: Priority, conn: Arc<TcpStream>) -> Arc<Task> {
        Arc::new(Task {
            kind,
            user: user.into(),
            priority,
            conn: Some(conn),
            state: Mutex::new(TaskState::Pending),
            done: Condvar::new(),
        })
    }

    /// Create the shutdown pseudo-task used to drain a worker thread.
    pub fn shutdown() -> Arc<Task> {
        Arc::new(Task {
            kind: TaskKind::Shutdown,
            user: "system".to_string(),
            // Low priority so the pending user backlog drains first and
            // every waiting handler gets its completion.
            priority: Priority::Low,
            conn: None,
            state: Mutex::new(TaskState::Pending),
            done: Condvar::new(),
        })
    }

    /// The operation this task performs.
    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    /// The owning username.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Scheduling priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// The client connection, absent only on [`TaskKind::Shutdown`].
    pub fn conn(&self) -> Option<&Arc<TcpStream>> {
        self.conn.as_ref()
    }

    /// Mark the task in-progress. Called once by the worker that dequeued it.
    pub fn start(&self) {
        let mut state = self.state.lock();
        debug_assert!(matches!(*state, TaskState::Pending));
        *state = TaskState::InProgress;
    }

    /// Publish a successful result and wake the waiting handler.
    pub fn complete(&self, result: TaskResult) {
        self.finish(TaskState::Completed(result));
    }

    /// Publish a failure and wake the waiting handler.
    pub fn fail(&self, message: impl Into<String>) {
        self.finish(TaskState::Failed(truncate_message(message.into())));
    }

    fn finish(&self, terminal: TaskState) {
        let mut state = self.state.lock();
        // A task reaches a terminal state exactly once.
        debug_assert!(matches!(
            *state,
            TaskState::Pending | TaskState::InProgress
        ));
        *state = terminal;
        self.done.notify_one();
    }

    /// Block until the task reaches a terminal state.
    ///
    /// Tolerates spurious wakeups by re-checking the state predicate.
    /// The payload is moved out; the message is cloned.
    pub fn wait(&self) -> Result<TaskResult, String> {
        let mut state = self.state.lock();
        loop {
            match &mut *state {
                TaskState::Pending | TaskState::InProgress => self.done.wait(&mut state),
                TaskState::Completed(result) => {
                    return Ok(TaskResult {
                        message: result.message.clone(),
                        payload: result.payload.take(),
                    });
                }
                TaskState::Failed(message) => return Err(message.clone()),
            }
        }
    }
}

fn truncate_message(mut text: String) -> String {
    if text.len() > MAX_MESSAGE_LEN {
        let mut end = MAX_MESSAGE_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}
