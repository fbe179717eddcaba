//! I/O worker event loop
//!
//! Each worker owns a set of connections for their whole lifetime and
//! multiplexes them with `poll(2)`. A self-pipe wakes the loop when an
//! acceptor hands over a new socket; deferred-response timers share the
//! poll timeout, so a sleeping worker wakes exactly when the next response
//! is due.

use super::connection::Connection;
use super::delay::{ConnId, DelayQueue};
use crate::config::ServerConfig;
use crate::http::tls::TlsContext;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::RawFd;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, trace};

/// Create a non-blocking self-pipe for waking a worker's poll loop
pub fn wake_pipe() -> io::Result<(WakeReader, WakeWriter)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // Only the read end must be non-blocking; drain() loops until empty
    let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL) };
    if flags < 0
        || unsafe { libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
    {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
        return Err(err);
    }
    Ok((WakeReader { fd: fds[0] }, WakeWriter { fd: fds[1] }))
}

/// Read end of a worker's wake pipe
pub struct WakeReader {
    fd: RawFd,
}

impl WakeReader {
    /// Raw descriptor for the poll set
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Drain queued wake bytes; returns true when every writer has gone
    pub fn drain(&self) -> bool {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n == 0 {
                return true;
            }
            if n < 0 {
                return false;
            }
        }
    }
}

impl Drop for WakeReader {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Write end of a worker's wake pipe; shared by all acceptor threads
pub struct WakeWriter {
    fd: RawFd,
}

// The fd is only ever passed to write(2), which is thread-safe
unsafe impl Send for WakeWriter {}
unsafe impl Sync for WakeWriter {}

impl WakeWriter {
    /// Wake the owning worker
    pub fn wake(&self) {
        let byte = [1u8];
        let _ = unsafe { libc::write(self.fd, byte.as_ptr() as *const libc::c_void, 1) };
    }
}

impl Drop for WakeWriter {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// One I/O worker: a poll loop over its owned connections
pub struct Worker {
    index: usize,
    rx: Receiver<(TcpStream, SocketAddr)>,
    wake: WakeReader,
    config: Arc<ServerConfig>,
    tls: Option<Arc<TlsContext>>,
    connections: HashMap<ConnId, Connection>,
    delays: DelayQueue,
    next_id: ConnId,
}

impl Worker {
    /// Create a worker; `run` consumes it on the worker thread
    pub fn new(
        index: usize,
        rx: Receiver<(TcpStream, SocketAddr)>,
        wake: WakeReader,
        config: Arc<ServerConfig>,
        tls: Option<Arc<TlsContext>>,
    ) -> Self {
        Worker {
            index,
            rx,
            wake,
            config,
            tls,
            connections: HashMap::new(),
            delays: DelayQueue::new(),
            next_id: 0,
        }
    }

    /// Run the event loop until the acceptors are gone and the last
    /// connection has drained
    pub fn run(mut self) {
        debug!(worker = self.index, "Worker started");
        let mut acceptors_gone = false;

        loop {
            self.register_incoming(&mut acceptors_gone);

            if acceptors_gone && self.connections.is_empty() && self.delays.is_empty() {
                break;
            }

            let mut ids: Vec<ConnId> = Vec::with_capacity(self.connections.len());
            let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(self.connections.len() + 1);
            // A drained wake pipe would report POLLHUP forever; poll(2)
            // skips negative descriptors
            pollfds.push(libc::pollfd {
                fd: if acceptors_gone { -1 } else { self.wake.fd() },
                events: libc::POLLIN,
                revents: 0,
            });
            for (id, conn) in &self.connections {
                if let Some(fd) = conn.raw_fd() {
                    ids.push(*id);
                    pollfds.push(libc::pollfd {
                        fd,
                        events: libc::POLLIN,
                        revents: 0,
                    });
                }
            }

            let timeout = self.poll_timeout_ms();
            let rc = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout)
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(worker = self.index, error = %err, "poll failed");
                break;
            }

            if pollfds[0].revents != 0 && self.wake.drain() {
                acceptors_gone = true;
            }

            const READY: libc::c_short = libc::POLLIN | libc::POLLHUP | libc::POLLERR;
            for (i, id) in ids.iter().enumerate() {
                if pollfds[i + 1].revents & READY != 0 {
                    if let Some(conn) = self.connections.get_mut(id) {
                        conn.on_readable(&mut self.delays);
                    }
                }
            }

            // Fire timers whose deadline has passed; writes for connections
            // that closed in the meantime evaporate in complete_deferred
            let now = Instant::now();
            while let Some((conn_id, task)) = self.delays.pop_due(now) {
                if let Some(conn) = self.connections.get_mut(&conn_id) {
                    conn.complete_deferred(task);
                } else {
                    trace!(worker = self.index, conn = conn_id, "Timer for closed connection dropped");
                }
            }

            self.connections.retain(|_, conn| !conn.is_closed());
        }

        debug!(worker = self.index, "Worker stopped");
    }

    fn register_incoming(&mut self, acceptors_gone: &mut bool) {
        loop {
            match self.rx.try_recv() {
                Ok((stream, addr)) => {
                    let id = self.next_id;
                    self.next_id += 1;
                    debug!(worker = self.index, conn = id, peer = %addr, "Connection registered");
                    let conn = Connection::new(
                        id,
                        stream,
                        addr,
                        self.config.clone(),
                        self.tls.clone(),
                    );
                    self.connections.insert(id, conn);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    *acceptors_gone = true;
                    break;
                }
            }
        }
    }

    /// Poll timeout: zero when buffered transport data awaits, otherwise
    /// until the next timer, otherwise forever (the wake pipe interrupts)
    fn poll_timeout_ms(&self) -> libc::c_int {
        if self.connections.values().any(|c| c.session_pending()) {
            return 0;
        }
        match self.delays.next_deadline() {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                (remaining.as_millis() as i64 + 1).min(i32::MAX as i64) as libc::c_int
            }
            None => -1,
        }
    }
}
