//! End-to-end tests driving real TCP sessions against a server bound to an
//! ephemeral port with a throwaway data directory.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use depot::{Server, ServerConfig, ShutdownHandle};
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(10);

struct TestServer {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    thread: JoinHandle<std::io::Result<()>>,
    _data_dir: TempDir,
}

fn start_server() -> TestServer {
    let data_dir = tempfile::tempdir().unwrap();
    let config = ServerConfig::new()
        .bind_addr(Ipv4Addr::LOCALHOST)
        .port(0)
        .data_dir(data_dir.path())
        .handler_threads(4)
        .worker_threads(2);
    let server = Server::bind(config).unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle().unwrap();
    let thread = thread::spawn(move || server.run());
    TestServer {
        addr,
        shutdown,
        thread,
        _data_dir: data_dir,
    }
}

impl TestServer {
    fn stop(self) {
        self.shutdown.shutdown();
        self.thread.join().unwrap().unwrap();
    }
}

struct Client {
    conn: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    fn connect(addr: SocketAddr) -> Client {
        let conn = TcpStream::connect(addr).unwrap();
        conn.set_read_timeout(Some(TIMEOUT)).unwrap();
        Client {
            conn,
            buf: Vec::new(),
        }
    }

    fn send_line(&mut self, line: &str) {
        self.conn.write_all(line.as_bytes()).unwrap();
        self.conn.write_all(b"\n").unwrap();
    }

    /// Send a framed body: 8-byte big-endian length, then the bytes.
    fn send_body(&mut self, data: &[u8]) {
        self.conn
            .write_all(&(data.len() as u64).to_be_bytes())
            .unwrap();
        self.conn.write_all(data).unwrap();
    }

    fn fill(&mut self) {
        let mut tmp = [0u8; 4096];
        match self.conn.read(&mut tmp) {
            Ok(0) => panic!(
                "connection closed; unconsumed: {:?}",
                String::from_utf8_lossy(&self.buf)
            ),
            Ok(n) => self.buf.extend_from_slice(&tmp[..n]),
            Err(e) => panic!("read failed: {e}"),
        }
    }

    /// Read and consume through the next occurrence of `needle`.
    fn read_until(&mut self, needle: &str) -> String {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let pos = self
                .buf
                .windows(needle.len().max(1))
                .position(|w| w == needle.as_bytes());
            if let Some(pos) = pos {
                let consumed: Vec<u8> = self.buf.drain(..pos + needle.len()).collect();
                return String::from_utf8_lossy(&consumed).into_owned();
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {needle:?}; buffered: {:?}",
                String::from_utf8_lossy(&self.buf)
            );
            self.fill();
        }
    }

    fn read_exact_n(&mut self, n: usize) -> Vec<u8> {
        while self.buf.len() < n {
            self.fill();
        }
        self.buf.drain(..n).collect()
    }

    /// Drive signup and consume through the command prompt.
    fn signup(&mut self, user: &str, pass: &str) {
        self.read_until("): ");
        self.send_line(&format!("SIGNUP {user} {pass}"));
        self.read_until("SIGNUP_SUCCESS");
        self.read_until("> ");
    }

    /// Drive login and consume through the command prompt.
    fn login(&mut self, user: &str, pass: &str) {
        self.read_until("): ");
        self.send_line(&format!("LOGIN {user} {pass}"));
        self.read_until("LOGIN_SUCCESS");
        self.read_until("> ");
    }

    fn upload(&mut self, name: &str, data: &[u8]) -> String {
        self.send_line(&format!("UPLOAD {name}"));
        self.read_until("SEND_FILE_DATA\n");
        self.send_body(data);
        self.read_until("> ")
    }
}

#[test]
fn signup_upload_list() {
    let server = start_server();
    let mut client = Client::connect(server.addr);

    client.signup("alice", "pw");
    let response = client.upload("hello.txt", b"hello");
    assert!(response.contains("SUCCESS:"), "got {response:?}");

    client.send_line("LIST");
    let listing = client.read_until("> ");
    let row = listing
        .lines()
        .find(|line| line.contains("hello.txt"))
        .unwrap_or_else(|| panic!("hello.txt missing from {listing:?}"));
    let columns: Vec<&str> = row.split_whitespace().collect();
    assert_eq!(columns[1], "5", "got {row:?}");

    client.send_line("QUIT");
    client.read_until("Goodbye!");
    server.stop();
}

#[test]
fn login_failure_then_success() {
    let server = start_server();

    let mut first = Client::connect(server.addr);
    first.signup("bob", "pw");
    first.send_line("QUIT");
    first.read_until("Goodbye!");

    let mut second = Client::connect(server.addr);
    second.read_until("): ");
    second.send_line("LOGIN bob wrong");
    second.read_until("LOGIN_FAILED");
    second.send_line("LOGIN bob pw");
    second.read_until("LOGIN_SUCCESS");
    second.read_until("> ");

    server.stop();
}

#[test]
fn download_round_trip() {
    let server = start_server();
    let mut client = Client::connect(server.addr);

    client.signup("alice", "pw");
    let body = b"hello";
    client.upload("hello.txt", body);

    client.send_line("DOWNLOAD hello.txt");
    let len = u64::from_be_bytes(client.read_exact_n(8).try_into().unwrap());
    assert_eq!(len, body.len() as u64);
    assert_eq!(client.read_exact_n(len as usize), body);
    let status = client.read_until("> ");
    assert!(status.contains("SUCCESS:"), "got {status:?}");

    server.stop();
}

#[test]
fn concurrent_same_file_access_is_refused() {
    let server = start_server();

    let mut uploader = Client::connect(server.addr);
    uploader.signup("alice", "pw");

    let mut deleter = Client::connect(server.addr);
    deleter.login("alice", "pw");

    // Start an upload and stall mid-body: the worker now holds the
    // (alice, big.bin) lock and is blocked waiting for the rest.
    let body = vec![7u8; 256 * 1024];
    uploader.send_line("UPLOAD big.bin");
    uploader.read_until("SEND_FILE_DATA\n");
    uploader
        .conn
        .write_all(&(body.len() as u64).to_be_bytes())
        .unwrap();
    uploader.conn.write_all(&body[..body.len() / 2]).unwrap();

    deleter.send_line("DELETE big.bin");
    let refused = deleter.read_until("> ");
    assert!(
        refused.contains("ERROR: File is currently being accessed by another operation"),
        "got {refused:?}"
    );

    // Finish the upload; the lock is released and the delete now works.
    uploader.conn.write_all(&body[body.len() / 2..]).unwrap();
    let done = uploader.read_until("> ");
    assert!(done.contains("SUCCESS:"), "got {done:?}");

    deleter.send_line("DELETE big.bin");
    let deleted = deleter.read_until("> ");
    assert!(deleted.contains("SUCCESS:"), "got {deleted:?}");

    server.stop();
}

#[test]
fn users_cannot_see_each_other() {
    let server = start_server();

    let mut alice = Client::connect(server.addr);
    alice.signup("alice", "pw");
    alice.upload("secret.txt", b"for alice only");

    let mut bob = Client::connect(server.addr);
    bob.signup("bob", "pw");
    bob.send_line("LIST");
    let listing = bob.read_until("> ");
    assert!(listing.contains("No files found."), "got {listing:?}");
    assert!(!listing.contains("secret.txt"));

    bob.send_line("DOWNLOAD secret.txt");
    let refused = bob.read_until("> ");
    assert!(refused.contains("ERROR:"), "got {refused:?}");

    server.stop();
}

#[test]
fn delete_of_missing_file_reports_an_error() {
    let server = start_server();
    let mut client = Client::connect(server.addr);
    client.signup("alice", "pw");

    client.send_line("DELETE nothere.bin");
    let response = client.read_until("> ");
    assert!(response.contains("ERROR:"), "got {response:?}");

    // No side effects: the namespace is still empty.
    client.send_line("LIST");
    let listing = client.read_until("> ");
    assert!(listing.contains("No files found."), "got {listing:?}");

    server.stop();
}

#[test]
fn oversized_upload_is_rejected() {
    let server = start_server();
    let mut client = Client::connect(server.addr);
    client.signup("alice", "pw");

    client.send_line("UPLOAD huge.bin");
    client.read_until("SEND_FILE_DATA\n");
    client
        .conn
        .write_all(&(depot::MAX_BODY_SIZE + 1).to_be_bytes())
        .unwrap();
    let response = client.read_until("ERROR:");
    assert!(response.contains("ERROR:"), "got {response:?}");
    let detail = client.read_until("\n");
    assert!(detail.contains("too large"), "got {detail:?}");

    server.stop();
}

#[test]
fn graceful_shutdown_closes_idle_sessions() {
    let server = start_server();
    let mut client = Client::connect(server.addr);
    client.signup("alice", "pw");

    // Idle at the prompt; shut the server down underneath the session.
    let started = Instant::now();
    server.shutdown.shutdown();

    let mut rest = Vec::new();
    let mut tmp = [0u8; 4096];
    loop {
        match client.conn.read(&mut tmp) {
            Ok(0) => break,
            Ok(n) => rest.extend_from_slice(&tmp[..n]),
            Err(e) => panic!("read failed during shutdown: {e}"),
        }
    }
    let transcript = String::from_utf8_lossy(&rest);
    assert!(
        transcript.contains("shutting down"),
        "got {transcript:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(5));

    server.thread.join().unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn new_connections_after_shutdown_are_refused() {
    let server = start_server();
    server.shutdown.shutdown();
    server.thread.join().unwrap().unwrap();
    assert!(TcpStream::connect(server.addr).is_err());
}
