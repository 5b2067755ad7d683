//! Bounded FIFO queue of accepted client connections
//!
//! The acceptor pushes sockets, handlers pop them. Both directions block
//! on condition variables and abort when shutdown is signalled. Sockets
//! already queued when shutdown fires are still handed to handlers until
//! the queue drains; whatever is left after the handler pool exits is
//! closed by [`ConnQueue::close_all`].

use std::collections::VecDeque;
use std::net::TcpStream;

use log::debug;
use parking_lot::{Condvar, Mutex};

struct Inner {
    queue: VecDeque<TcpStream>,
    shutdown: bool,
}

/// Bounded, shutdown-aware FIFO of client sockets.
pub(crate) struct ConnQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl ConnQueue {
    pub(crate) fn new(capacity: usize) -> ConnQueue {
        assert!(capacity > 0);
        ConnQueue {
            capacity,
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Enqueue a connection, blocking while the queue is full.
    ///
    /// On shutdown-abort the connection is handed back so the caller can
    /// write an overload message before closing it.
    pub(crate) fn push(&self, conn: TcpStream) -> Result<(), TcpStream> {
        let mut inner = self.inner.lock();
        while inner.queue.len() >= self.capacity && !inner.shutdown {
            debug!("connection queue full, acceptor waiting");
            self.not_full.wait(&mut inner);
        }
        if inner.shutdown {
            return Err(conn);
        }
        inner.queue.push_back(conn);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue a connection, blocking while the queue is empty.
    ///
    /// Returns `None` only when shutdown has been signalled and the queue
    /// is drained; queued connections are still delivered after the flag
    /// goes up so no accepted socket is silently dropped.
    pub(crate) fn pop(&self) -> Option<TcpStream> {
        let mut inner = self.inner.lock();
        while inner.queue.is_empty() && !inner.shutdown {
            self.not_empty.wait(&mut inner);
        }
        let conn = inner.queue.pop_front();
        if conn.is_some() {
            self.not_full.notify_one();
        }
        conn
    }

    /// Signal shutdown and wake every blocked pusher and popper.
    pub(crate) fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Drop (and thereby close) any connections still queued.
    pub(crate) fn close_all(&self) {
        let mut inner = self.inner.lock();
        let leftover = inner.queue.len();
        if leftover > 0 {
            debug!("closing {leftover} connections still queued at shutdown");
        }
        inner.queue.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }
}
