//! Session authentication
//!
//! Runs inside a handler thread on a freshly dequeued connection, before
//! the command loop starts. The client gets a welcome banner and then as
//! many `LOGIN`/`SIGNUP` attempts as it likes; the first success binds the
//! session to that username for its remaining lifetime. Connection close
//! or shutdown at any point ends the session unauthenticated.

use std::io::{self, Write};
use std::net::TcpStream;
use std::sync::atomic::AtomicBool;

use log::{error, info, warn};

use crate::filename;
use crate::protocol::{self, LineEvent, MAX_PASSWORD_LEN, MAX_USERNAME_LEN};
use crate::users::{UserStore, UserStoreError};

const WELCOME: &[u8] = b"Welcome to the depot file server!\n";
const AUTH_PROMPT: &[u8] =
    b"Please login or signup (LOGIN <username> <password> or SIGNUP <username> <password>): ";
const BAD_FORMAT: &[u8] =
    b"ERROR: Invalid command format. Use LOGIN <username> <password> or SIGNUP <username> <password>\n";
const UNKNOWN_CMD: &[u8] = b"ERROR: Unknown command. Use LOGIN or SIGNUP\n";
const LOGIN_OK: &[u8] = b"LOGIN_SUCCESS: Authentication successful\n";
const LOGIN_BAD: &[u8] = b"LOGIN_FAILED: Invalid username or password\n";
const SIGNUP_OK: &[u8] = b"SIGNUP_SUCCESS: Account created and logged in\n";
const SIGNUP_BAD: &[u8] = b"SIGNUP_FAILED: Username already exists or invalid credentials\n";

/// Authenticate the peer on `conn`.
///
/// Returns the bound username on success, `None` on a terminal session end
/// (peer disconnect or shutdown). I/O errors are fatal to the session.
pub(crate) fn authenticate(
    conn: &TcpStream,
    users: &dyn UserStore,
    shutdown: &AtomicBool,
) -> io::Result<Option<String>> {
    let mut out = conn;
    out.write_all(WELCOME)?;
    out.write_all(AUTH_PROMPT)?;

    loop {
        let line = match protocol::read_line(conn, shutdown)? {
            LineEvent::Line(line) => line,
            LineEvent::Closed | LineEvent::ShutdownAbort => return Ok(None),
        };

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let [cmd, username, password] = tokens.as_slice() else {
            out.write_all(BAD_FORMAT)?;
            continue;
        };

        match cmd.to_ascii_uppercase().as_str() {
            "LOGIN" => match users.lookup(username) {
                Ok(Some(stored)) if stored == *password => {
                    out.write_all(LOGIN_OK)?;
                    info!("user '{username}' logged in");
                    return Ok(Some(username.to_string()));
                }
                Ok(_) => {
                    warn!("failed login attempt for '{username}'");
                    out.write_all(LOGIN_BAD)?;
                }
                Err(e) => {
                    error!("credential lookup for '{username}' failed: {e}");
                    out.write_all(LOGIN_BAD)?;
                }
            },
            "SIGNUP" => {
                if !signup_fields_valid(username, password) {
                    out.write_all(SIGNUP_BAD)?;
                    continue;
                }
                match users.create(username, password) {
                    Ok(()) => {
                        out.write_all(SIGNUP_OK)?;
                        info!("user '{username}' signed up");
                        return Ok(Some(username.to_string()));
                    }
                    Err(UserStoreError::AlreadyExists) => {
                        out.write_all(SIGNUP_BAD)?;
                    }
                    Err(e) => {
                        error!("signup for '{username}' failed: {e}");
                        out.write_all(SIGNUP_BAD)?;
                    }
                }
            }
            _ => out.write_all(UNKNOWN_CMD)?,
        }
    }
}

/// Reject over-long or unsafe credentials outright rather than truncating.
///
/// Usernames name directories, so they must also survive filename
/// sanitization unchanged.
fn signup_fields_valid(username: &str, password: &str) -> bool {
    !username.is_empty()
        && !password.is_empty()
        && username.len() <= MAX_USERNAME_LEN
        && password.len() <= MAX_PASSWORD_LEN
        && username.bytes().all(|b| b.is_ascii_graphic())
        && filename::is_clean(username)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::DiskUserStore;
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use tempfile::tempdir;

    fn run_auth(
        store: Arc<DiskUserStore>,
        client_script: &[&str],
    ) -> (Option<String>, String) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let script: Vec<String> = client_script.iter().map(|s| s.to_string()).collect();
        let client = thread::spawn(move || {
            let mut conn = TcpStream::connect(addr).unwrap();
            for line in script {
                conn.write_all(line.as_bytes()).unwrap();
                conn.write_all(b"\n").unwrap();
            }
            conn.shutdown(std::net::Shutdown::Write).unwrap();
            let mut transcript = String::new();
            conn.read_to_string(&mut transcript).unwrap();
            transcript
        });

        let (conn, _) = listener.accept().unwrap();
        let shutdown = AtomicBool::new(false);
        let result = authenticate(&conn, &*store, &shutdown).unwrap();
        drop(conn);
        (result, client.join().unwrap())
    }

    fn fresh_store() -> (tempfile::TempDir, Arc<DiskUserStore>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(DiskUserStore::new(dir.path().join("users")).unwrap());
        (dir, store)
    }

    #[test]
    fn signup_binds_the_session() {
        let (_dir, store) = fresh_store();
        let (user, transcript) = run_auth(store, &["SIGNUP alice pw"]);
        assert_eq!(user.as_deref(), Some("alice"));
        assert!(transcript.contains("SIGNUP_SUCCESS"));
    }

    #[test]
    fn login_failure_loops_until_success() {
        let (_dir, store) = fresh_store();
        store.create("bob", "pw").unwrap();
        let (user, transcript) = run_auth(store, &["LOGIN bob wrong", "LOGIN bob pw"]);
        assert_eq!(user.as_deref(), Some("bob"));
        assert!(transcript.contains("LOGIN_FAILED"));
        assert!(transcript.contains("LOGIN_SUCCESS"));
    }

    #[test]
    fn malformed_and_unknown_lines_keep_the_loop_alive() {
        let (_dir, store) = fresh_store();
        store.create("bob", "pw").unwrap();
        let (user, transcript) = run_auth(
            store,
            &["LOGIN bob", "FROB a b", "login bob pw"],
        );
        assert_eq!(user.as_deref(), Some("bob"));
        assert!(transcript.contains("ERROR: Invalid command format"));
        assert!(transcript.contains("ERROR: Unknown command"));
    }

    #[test]
    fn duplicate_signup_is_refused() {
        let (_dir, store) = fresh_store();
        store.create("alice", "pw").unwrap();
        let (user, transcript) = run_auth(store, &["SIGNUP alice other"]);
        assert_eq!(user, None);
        assert!(transcript.contains("SIGNUP_FAILED"));
    }

    #[test]
    fn unsafe_or_oversized_credentials_are_rejected() {
        let (_dir, store) = fresh_store();
        let long = "x".repeat(MAX_USERNAME_LEN + 1);
        let (user, transcript) = run_auth(
            store,
            &[
                &format!("SIGNUP {long} pw"),
                "SIGNUP ../evil pw",
            ],
        );
        assert_eq!(user, None);
        assert_eq!(transcript.matches("SIGNUP_FAILED").count(), 2);
    }

    #[test]
    fn disconnect_ends_the_phase() {
        let (_dir, store) = fresh_store();
        let (user, _) = run_auth(store, &[]);
        assert_eq!(user, None);
    }
}
