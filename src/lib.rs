//! depot — a multi-user file-storage network service
//!
//! Authenticated clients open a persistent TCP session and issue
//! line-oriented commands (`UPLOAD`, `DOWNLOAD`, `DELETE`, `LIST`, `QUIT`)
//! against private per-user namespaces. Internally the server is a
//! two-stage thread-pool pipeline: an acceptor feeds a bounded queue of
//! connections, a pool of handler threads terminates protocol sessions,
//! and each command becomes a task on a bounded priority queue drained by
//! a pool of worker threads. A task is a one-shot synchronous rendezvous:
//! the handler blocks until the worker that picked the task up publishes
//! its terminal result. A process-wide table of `(user, filename)` keys
//! gives each file operation exclusive access without ever blocking, and
//! graceful shutdown unblocks every waiter without deadlock.
//!
//! The control plane is ASCII lines; file bodies travel as raw bytes
//! behind an 8-byte big-endian length prefix.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::config::{DEFAULT_PORT, ServerConfig};
pub use crate::filename::{UNNAMED, is_clean, sanitize};
pub use crate::lock_table::{FileLockGuard, FileLockTable, LockRefused};
pub use crate::protocol::{
    Command, MAX_BODY_SIZE, MAX_FILENAME_LEN, MAX_LINE_LEN, MAX_MESSAGE_LEN, MAX_PASSWORD_LEN,
    MAX_USERNAME_LEN, PROMPT, ParseError, SEND_FILE_DATA, parse_command,
};
pub use crate::server::{Server, ShutdownHandle};
pub use crate::storage::{
    DEFAULT_QUOTA_BYTES, DiskStorage, FileMetadata, Storage, StorageError,
};
pub use crate::task::{Priority, Task, TaskKind, TaskResult};
pub use crate::users::{DiskUserStore, UserStore, UserStoreError};

mod auth;
mod config;
mod conn_queue;
mod filename;
mod lock_table;
mod protocol;
mod server;
mod session;
mod storage;
mod task;
mod task_queue;
mod users;
mod worker;
