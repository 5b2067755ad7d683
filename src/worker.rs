//! Task execution and the worker pool
//!
//! A worker thread drains the task queue: it marks the task in-progress,
//! sanitizes the filename, takes the per-file lock where the operation
//! needs one, performs the I/O directly on the client socket the task
//! carries, and publishes exactly one terminal state. Local failures never
//! escape a task; they become its error result.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use log::{debug, warn};

use crate::filename;
use crate::lock_table::LockRefused;
use crate::protocol::{self, MAX_BODY_SIZE};
use crate::server::ServerState;
use crate::storage::StorageError;
use crate::task::{Task, TaskKind, TaskResult};

const LOCK_BUSY: &str = "File is currently being accessed by another operation";
const LOCK_TABLE_FULL: &str = "Too many file operations in flight, try again";

/// Worker pool thread body: drain the task queue until shutdown.
pub(crate) fn worker_main(id: usize, state: Arc<ServerState>) {
    debug!("worker {id} started");
    while let Some(task) = state.task_queue.pop() {
        if matches!(task.kind(), TaskKind::Shutdown) {
            task.start();
            task.complete(TaskResult::message("worker exiting"));
            debug!("worker {id} received shutdown task");
            break;
        }

        task.start();
        debug!(
            "worker {id} executing {:?} for '{}' (priority {:?})",
            task.kind(),
            task.user(),
            task.priority()
        );
        match execute(&state, &task) {
            Ok(result) => task.complete(result),
            Err(message) => {
                warn!("task for '{}' failed: {message}", task.user());
                task.fail(message);
            }
        }
    }
    debug!("worker {id} exiting");
}

fn execute(state: &ServerState, task: &Task) -> Result<TaskResult, String> {
    match task.kind() {
        TaskKind::Upload { name } => with_file_lock(state, task, name, run_upload),
        TaskKind::Download { name } => with_file_lock(state, task, name, run_download),
        TaskKind::Delete { name } => with_file_lock(state, task, name, run_delete),
        // Listing touches no single file and takes no lock.
        TaskKind::List => run_list(state, task),
        TaskKind::Shutdown => unreachable!("handled by the worker loop"),
    }
}

/// Sanitize the name, take the exclusive `(user, file)` lock, run `op`.
///
/// The guard releases on every exit path, including panics in `op`.
fn with_file_lock(
    state: &ServerState,
    task: &Task,
    name: &str,
    op: fn(&ServerState, &Task, &str) -> Result<TaskResult, String>,
) -> Result<TaskResult, String> {
    let clean = filename::sanitize(name);
    let _guard = match state.lock_table.try_acquire(task.user(), &clean) {
        Ok(guard) => guard,
        Err(LockRefused::Busy) => return Err(LOCK_BUSY.to_string()),
        Err(LockRefused::TableFull) => return Err(LOCK_TABLE_FULL.to_string()),
    };
    op(state, task, &clean)
}

fn client_stream(task: &Task) -> Result<&TcpStream, String> {
    task.conn()
        .map(|conn| conn.as_ref())
        .ok_or_else(|| "task carries no client connection".to_string())
}

fn run_upload(state: &ServerState, task: &Task, name: &str) -> Result<TaskResult, String> {
    let mut conn = client_stream(task)?;
    conn.write_all(protocol::SEND_FILE_DATA)
        .map_err(|e| format!("Failed to request file data: {e}"))?;

    // The body phase owns the socket outright; the control-plane polling
    // timeout would only chop up a long transfer.
    conn.set_read_timeout(None)
        .map_err(|e| format!("Failed to prepare socket: {e}"))?;

    let len = protocol::read_frame_len(&mut conn)
        .map_err(|e| format!("Failed to receive file size: {e}"))?;
    if len > MAX_BODY_SIZE {
        return Err(format!(
            "File too large: {len} bytes exceeds the {MAX_BODY_SIZE} byte limit"
        ));
    }

    let mut data = vec![0u8; len as usize];
    conn.read_exact(&mut data)
        .map_err(|e| format!("Failed to receive file data: {e}"))?;

    let meta = state
        .storage
        .save(task.user(), name, &data)
        .map_err(|e| match e {
            StorageError::QuotaExceeded => "Upload would exceed quota limit".to_string(),
            e => format!("Failed to save file: {e}"),
        })?;

    Ok(TaskResult::message(format!(
        "File '{}' uploaded successfully ({} bytes)",
        name, meta.size
    )))
}

fn run_download(state: &ServerState, task: &Task, name: &str) -> Result<TaskResult, String> {
    let data = state
        .storage
        .load(task.user(), name)
        .map_err(|e| match e {
            StorageError::NotFound => "File not found or access error".to_string(),
            e => format!("Failed to load file: {e}"),
        })?;

    let mut conn = client_stream(task)?;
    protocol::write_frame_len(&mut conn, data.len() as u64)
        .map_err(|e| format!("Failed to send file size: {e}"))?;
    conn.write_all(&data)
        .map_err(|e| format!("Failed to send file data: {e}"))?;

    // The result is published only after the stream completed.
    Ok(TaskResult::message(format!(
        "File '{}' downloaded successfully ({} bytes)",
        name,
        data.len()
    )))
}

fn run_delete(state: &ServerState, task: &Task, name: &str) -> Result<TaskResult, String> {
    state
        .storage
        .remove(task.user(), name)
        .map_err(|e| match e {
            StorageError::NotFound => "File not found or delete failed".to_string(),
            e => format!("Failed to delete file: {e}"),
        })?;
    Ok(TaskResult::message(format!(
        "File '{name}' deleted successfully"
    )))
}

fn run_list(state: &ServerState, task: &Task) -> Result<TaskResult, String> {
    let listing = state
        .storage
        .list(task.user())
        .map_err(|e| format!("Failed to list files: {e}"))?;
    Ok(TaskResult::with_payload(
        "File list retrieved successfully",
        listing.into_bytes(),
    ))
}
