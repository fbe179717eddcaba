//! Session operations abstraction
//!
//! The [`SessionOps`] trait lets pipelines switch transparently between
//! plain TCP and TLS transports. Workers multiplex many sessions by polling
//! their raw descriptors, so the trait also exposes the descriptor and any
//! transport-level buffering (decrypted TLS bytes that no poll will report).

use super::{Error, Result};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

/// Session operations trait
///
/// Operations a connection pipeline performs against its transport,
/// independent of whether the bytes travel in the clear or through TLS.
pub trait SessionOps: Send {
    /// Raw descriptor for event multiplexing
    fn raw_fd(&self) -> RawFd;

    /// Peer address of the underlying socket
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Poll the session for readiness
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    /// Read data from the session
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write data to the session
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Flush buffered output
    fn flush(&mut self) -> Result<()>;

    /// Close the session
    fn close(&mut self) -> Result<()>;

    /// Whether decoded input is buffered beyond the descriptor (TLS records
    /// already read and decrypted); such data never shows up in poll
    fn pending(&self) -> bool {
        false
    }

    /// Write an entire buffer
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.write(&buf[written..])?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            written += n;
        }
        self.flush()
    }
}

/// Boxed session used where the transport is chosen at runtime
pub type BoxedSession = Box<dyn SessionOps>;

/// Poll a raw descriptor with `poll(2)`
pub(crate) fn poll_fd(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
            PollEvents::Both => POLLIN | POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout.map(|d| d.as_millis() as i32).unwrap_or(-1);

    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

    if result < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    Ok(result > 0)
}

/// Plain file descriptor session operations
pub struct FdSessionOps {
    stream: TcpStream,
}

impl FdSessionOps {
    /// Create a new FD session operations from a TCP stream
    pub fn new(stream: TcpStream) -> Self {
        FdSessionOps { stream }
    }
}

impl SessionOps for FdSessionOps {
    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        poll_fd(self.stream.as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf).map_err(Error::from)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream.write(buf).map_err(Error::from)
    }

    fn flush(&mut self) -> Result<()> {
        self.stream.flush().map_err(Error::from)
    }

    fn close(&mut self) -> Result<()> {
        use std::net::Shutdown;
        self.stream.shutdown(Shutdown::Both).map_err(Error::from)
    }
}
