//! Server configuration

use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::storage::DEFAULT_QUOTA_BYTES;

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 8080;

const DEFAULT_HANDLER_THREADS: usize = 10;
const DEFAULT_WORKER_THREADS: usize = 5;
const DEFAULT_QUEUE_CAPACITY: usize = 50;
const DEFAULT_MAX_CLIENTS: usize = 100;

/// Sanity cap on pool sizes to prevent resource exhaustion.
const MAX_POOL_SIZE: usize = 1024;

/// Configuration for a [`Server`](crate::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind_addr: Ipv4Addr,
    /// Port to listen on; 0 picks an ephemeral port.
    pub port: u16,
    /// Root directory for user records and stored files.
    pub data_dir: PathBuf,
    /// Size of the client-handler pool.
    pub handler_threads: usize,
    /// Size of the file-worker pool.
    pub worker_threads: usize,
    /// Capacity of both the connection queue and the task queue.
    pub queue_capacity: usize,
    /// Listen backlog.
    pub max_clients: usize,
    /// Cap on concurrently held file locks. Defaults to the worker-pool
    /// size: each worker holds at most one key, so anything larger only
    /// invites spurious busy responses.
    pub lock_table_capacity: Option<usize>,
    /// Per-user storage quota in bytes.
    pub quota_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: Ipv4Addr::UNSPECIFIED,
            port: DEFAULT_PORT,
            data_dir: PathBuf::from("/tmp/depot"),
            handler_threads: DEFAULT_HANDLER_THREADS,
            worker_threads: DEFAULT_WORKER_THREADS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_clients: DEFAULT_MAX_CLIENTS,
            lock_table_capacity: None,
            quota_bytes: DEFAULT_QUOTA_BYTES,
        }
    }
}

impl ServerConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: Ipv4Addr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the listening port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the data directory.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the handler-pool size.
    pub fn handler_threads(mut self, count: usize) -> Self {
        self.handler_threads = count;
        self
    }

    /// Set the worker-pool size.
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count;
        self
    }

    /// Set the queue capacity.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the file-lock table capacity.
    pub fn lock_table_capacity(mut self, capacity: usize) -> Self {
        self.lock_table_capacity = Some(capacity);
        self
    }

    /// Set the per-user quota in bytes.
    pub fn quota_bytes(mut self, bytes: u64) -> Self {
        self.quota_bytes = bytes;
        self
    }

    /// Effective lock-table capacity.
    pub(crate) fn effective_lock_capacity(&self) -> usize {
        self.lock_table_capacity.unwrap_or(self.worker_threads)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> io::Result<()> {
        fn invalid(msg: String) -> io::Error {
            io::Error::new(io::ErrorKind::InvalidInput, msg)
        }
        if self.handler_threads == 0 || self.worker_threads == 0 {
            return Err(invalid("thread pools must have at least 1 thread".into()));
        }
        if self.handler_threads > MAX_POOL_SIZE || self.worker_threads > MAX_POOL_SIZE {
            return Err(invalid(format!("pool sizes cannot exceed {MAX_POOL_SIZE}")));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue capacity must be at least 1".into()));
        }
        if self.max_clients == 0 {
            return Err(invalid("max_clients must be at least 1".into()));
        }
        if self.effective_lock_capacity() == 0 {
            return Err(invalid("lock table capacity must be at least 1".into()));
        }
        Ok(())
    }
}
