//! Server assembly and lifecycle
//!
//! Wires the queues, the lock table, the stores, and the two thread pools
//! together, runs the accept loop, and owns the graceful-shutdown
//! sequence: flag, wake the acceptor, broadcast the queues, drain the
//! workers with shutdown pseudo-tasks, join everything, close what's left.

use std::fmt;
use std::io::{self, Write};
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use log::{debug, error, info};

use crate::config::ServerConfig;
use crate::conn_queue::ConnQueue;
use crate::lock_table::FileLockTable;
use crate::session;
use crate::storage::{DiskStorage, Storage};
use crate::task_queue::TaskQueue;
use crate::users::{DiskUserStore, UserStore};
use crate::worker;

const OVERLOAD_MSG: &[u8] = b"ERROR: Server busy, please try again later\n";

/// State shared by the acceptor, every handler, and every worker.
///
/// Constructed once at startup and threaded through as an explicit
/// dependency; there are no process-wide globals.
pub(crate) struct ServerState {
    pub(crate) conn_queue: ConnQueue,
    pub(crate) task_queue: TaskQueue,
    pub(crate) lock_table: FileLockTable,
    pub(crate) storage: Box<dyn Storage>,
    pub(crate) users: Box<dyn UserStore>,
    /// Read often, written once.
    pub(crate) shutdown: AtomicBool,
    worker_count: usize,
}

impl ServerState {
    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run the shutdown sequence exactly once, no matter who calls first.
    fn initiate_shutdown(&self, listener: &TcpListener) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutdown initiated");

        // Wake the acceptor out of a blocked accept(2).
        unsafe {
            libc::shutdown(listener.as_raw_fd(), libc::SHUT_RDWR);
        }

        // Wake every blocked queue waiter.
        self.conn_queue.shutdown();
        self.task_queue.shutdown();

        // One low-priority shutdown task per worker: the user backlog
        // drains first, then each worker exits.
        for _ in 0..self.worker_count {
            self.task_queue.push_shutdown();
        }
    }
}

/// The depot server: an acceptor plus two thread pools.
pub struct Server {
    state: Arc<ServerState>,
    listener: TcpListener,
    handlers: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("listener", &self.listener)
            .field("handlers", &self.handlers.len())
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl Server {
    /// Bind the listening socket, open the disk stores, and start both
    /// thread pools. The accept loop does not run until [`Server::run`].
    pub fn bind(config: ServerConfig) -> io::Result<Server> {
        config.validate()?;

        let storage = DiskStorage::new(config.data_dir.join("storage"), config.quota_bytes)?;
        let users = DiskUserStore::new(config.data_dir.join("users"))?;
        let listener = create_listener(config.bind_addr, config.port, config.max_clients as i32)?;

        let state = Arc::new(ServerState {
            conn_queue: ConnQueue::new(config.queue_capacity),
            task_queue: TaskQueue::new(config.queue_capacity),
            lock_table: FileLockTable::new(config.effective_lock_capacity()),
            storage: Box::new(storage),
            users: Box::new(users),
            shutdown: AtomicBool::new(false),
            worker_count: config.worker_threads,
        });

        info!(
            "starting {} handler threads and {} worker threads",
            config.handler_threads, config.worker_threads
        );
        let mut handlers = Vec::with_capacity(config.handler_threads);
        for id in 0..config.handler_threads {
            let state = state.clone();
            handlers.push(
                thread::Builder::new()
                    .name(format!("depot-handler-{id}"))
                    .spawn(move || session::handler_main(id, state))?,
            );
        }
        let mut workers = Vec::with_capacity(config.worker_threads);
        for id in 0..config.worker_threads {
            let state = state.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("depot-worker-{id}"))
                    .spawn(move || worker::worker_main(id, state))?,
            );
        }

        Ok(Server {
            state,
            listener,
            handlers,
            workers,
        })
    }

    /// The bound address (useful with port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A handle that can trigger graceful shutdown from another thread.
    pub fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        Ok(ShutdownHandle {
            state: self.state.clone(),
            listener: Arc::new(self.listener.try_clone()?),
        })
    }

    /// Run the accept loop until shutdown, then tear everything down.
    ///
    /// Returns once every handler and worker thread has been joined.
    pub fn run(mut self) -> io::Result<()> {
        let addr = self.listener.local_addr()?;
        info!("listening on {addr}");

        loop {
            if self.state.shutdown_requested() {
                break;
            }
            match self.listener.accept() {
                Ok((conn, peer)) => {
                    debug!("accepted connection from {peer}");
                    if let Err(conn) = self.state.conn_queue.push(conn) {
                        // Shutdown raced the enqueue; turn the socket away.
                        debug!("rejecting connection from {peer}: shutting down");
                        let mut out = &conn;
                        let _ = out.write_all(OVERLOAD_MSG);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    if self.state.shutdown_requested() {
                        break;
                    }
                    error!("accept failed: {e}");
                }
            }
        }
        info!("accept loop terminated");

        // Idempotent: a no-op when a ShutdownHandle got here first.
        self.state.initiate_shutdown(&self.listener);

        for handle in mem::take(&mut self.handlers) {
            if handle.join().is_err() {
                error!("a handler thread panicked");
            }
        }
        for handle in mem::take(&mut self.workers) {
            if handle.join().is_err() {
                error!("a worker thread panicked");
            }
        }
        self.state.conn_queue.close_all();

        info!("server stopped");
        Ok(())
    }
}

/// Cloneable trigger for graceful shutdown.
#[derive(Clone)]
pub struct ShutdownHandle {
    state: Arc<ServerState>,
    listener: Arc<TcpListener>,
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("listener", &self.listener)
            .finish()
    }
}

impl ShutdownHandle {
    /// Initiate graceful shutdown. Safe to call more than once.
    pub fn shutdown(&self) {
        self.state.initiate_shutdown(&self.listener);
    }
}

/// Create the listening socket with address reuse enabled.
///
/// `std::net` offers no hook between socket creation and bind, so this
/// drops to libc for the `SO_REUSEADDR` dance and hands the fd back to the
/// standard library.
fn create_listener(addr: Ipv4Addr, port: u16, backlog: i32) -> io::Result<TcpListener> {
    fn close_with(fd: libc::c_int, err: io::Error) -> io::Result<TcpListener> {
        unsafe {
            libc::close(fd);
        }
        Err(err)
    }

    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let one: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            return close_with(fd, io::Error::last_os_error());
        }

        let mut sa: libc::sockaddr_in = mem::zeroed();
        sa.sin_family = libc::AF_INET as libc::sa_family_t;
        sa.sin_port = port.to_be();
        sa.sin_addr.s_addr = u32::from(addr).to_be();
        if libc::bind(
            fd,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            return close_with(fd, io::Error::last_os_error());
        }

        if libc::listen(fd, backlog) < 0 {
            return close_with(fd, io::Error::last_os_error());
        }

        Ok(TcpListener::from_raw_fd(fd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_binds_an_ephemeral_port() {
        let listener = create_listener(Ipv4Addr::LOCALHOST, 0, 16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.port() != 0);
        std::net::TcpStream::connect(addr).unwrap();
    }

    #[test]
    fn address_reuse_allows_immediate_rebind() {
        let listener = create_listener(Ipv4Addr::LOCALHOST, 0, 16).unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept one connection so the port has recent TIME_WAIT history.
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        drop(client);
        drop(server_side);
        drop(listener);
        create_listener(Ipv4Addr::LOCALHOST, port, 16).unwrap();
    }
}
