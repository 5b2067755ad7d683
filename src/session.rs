//! Client sessions and the handler pool
//!
//! A handler thread owns one connection at a time: it authenticates the
//! peer, then runs the command loop until QUIT, peer close, or shutdown.
//! Each parsed command becomes a task submitted to the worker pool; the
//! handler blocks on the task's rendezvous, so ownership of the socket
//! passes cleanly to the executing worker and back.

use std::io::{self, Write};
use std::net::TcpStream;
use std::sync::Arc;

use log::{debug, info};

use crate::auth;
use crate::protocol::{self, Command, LineEvent, ParseError};
use crate::server::ServerState;
use crate::task::{Task, TaskKind};

const CAPABILITIES: &[u8] = b"Authenticated successfully. Available commands: \
UPLOAD <filename>, DOWNLOAD <filename>, DELETE <filename>, LIST, QUIT\n";
const GOODBYE: &[u8] = b"Goodbye!\n";
const SHUTDOWN_FAREWELL: &[u8] = b"Server is shutting down. Goodbye!\n";

/// Handler pool thread body: drain the connection queue until shutdown.
pub(crate) fn handler_main(id: usize, state: Arc<ServerState>) {
    debug!("handler {id} started");
    while let Some(conn) = state.conn_queue.pop() {
        match run_session(&state, conn) {
            Ok(()) => {}
            Err(e) => debug!("handler {id}: session ended with I/O error: {e}"),
        }
    }
    debug!("handler {id} exiting");
}

/// Drive one connection from authentication to close.
fn run_session(state: &ServerState, conn: TcpStream) -> io::Result<()> {
    let conn = Arc::new(conn);
    let Some(user) = auth::authenticate(&conn, state.users.as_ref(), &state.shutdown)? else {
        return Ok(());
    };

    let mut out: &TcpStream = &conn;
    out.write_all(CAPABILITIES)?;
    out.write_all(protocol::PROMPT)?;

    loop {
        let line = match protocol::read_line(&conn, &state.shutdown)? {
            LineEvent::Line(line) => line,
            LineEvent::Closed => {
                info!("user '{user}' disconnected");
                return Ok(());
            }
            LineEvent::ShutdownAbort => {
                let _ = out.write_all(SHUTDOWN_FAREWELL);
                return Ok(());
            }
        };

        debug!("command from '{user}': {line:?}");
        let command = match protocol::parse_command(&line) {
            Ok(command) => command,
            Err(ParseError::Empty) => {
                out.write_all(protocol::PROMPT)?;
                continue;
            }
            Err(e) => {
                out.write_all(format!("ERROR: {e}\n").as_bytes())?;
                out.write_all(protocol::PROMPT)?;
                continue;
            }
        };

        let (kind, priority) = match command {
            Command::Quit => {
                out.write_all(GOODBYE)?;
                info!("user '{user}' quit");
                return Ok(());
            }
            Command::Upload { name, priority } => (TaskKind::Upload { name }, priority),
            Command::Download { name, priority } => (TaskKind::Download { name }, priority),
            Command::Delete { name, priority } => (TaskKind::Delete { name }, priority),
            Command::List { priority } => (TaskKind::List, priority),
        };

        let task = Task::new(kind, user.clone(), priority, conn.clone());
        if state.task_queue.push(task.clone()).is_err() {
            // Shutdown raced the submission; no worker will answer.
            let _ = out.write_all(SHUTDOWN_FAREWELL);
            return Ok(());
        }

        // The worker owns the socket until the rendezvous completes.
        match task.wait() {
            Ok(result) => {
                if let Some(payload) = result.payload {
                    out.write_all(&payload)?;
                } else {
                    out.write_all(format!("SUCCESS: {}\n", result.message).as_bytes())?;
                }
            }
            Err(message) => {
                out.write_all(format!("ERROR: {message}\n").as_bytes())?;
            }
        }
        out.write_all(protocol::PROMPT)?;
    }
}
