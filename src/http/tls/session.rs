//! TLS session operations
//!
//! Implements [`SessionOps`] over an OpenSSL stream so the framing layers
//! stay transport-agnostic. `pending()` surfaces plaintext that OpenSSL has
//! already decrypted; a worker must drain it before polling again, because
//! the descriptor will not signal readable for it.

use super::config::TlsError;
use crate::http::session::{poll_fd, PollEvents, SessionOps};
use crate::http::{Error, Result as HttpResult};
use openssl::ssl::{Ssl, SslContext, SslStream};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// TLS session operations
pub struct TlsSessionOps {
    stream: SslStream<TcpStream>,
    failed: bool,
}

impl TlsSessionOps {
    /// Accept a client connection, performing the TLS handshake
    pub fn accept(tcp_stream: TcpStream, ctx: &SslContext) -> Result<Self, TlsError> {
        let ssl = Ssl::new(ctx)?;

        let ssl_stream = ssl
            .accept(tcp_stream)
            .map_err(|e| TlsError::HandshakeFailed(format!("Accept failed: {}", e)))?;

        Ok(TlsSessionOps {
            stream: ssl_stream,
            failed: false,
        })
    }

    /// Negotiated ALPN protocol, when the handshake selected one
    pub fn selected_alpn(&self) -> Option<&[u8]> {
        self.stream.ssl().selected_alpn_protocol()
    }
}

impl SessionOps for TlsSessionOps {
    fn raw_fd(&self) -> RawFd {
        self.stream.get_ref().as_raw_fd()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.get_ref().peer_addr().ok()
    }

    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> HttpResult<bool> {
        // Decrypted bytes already buffered count as readable
        if events == PollEvents::Read || events == PollEvents::Both {
            if self.stream.ssl().pending() > 0 {
                return Ok(true);
            }
        }
        poll_fd(self.raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> HttpResult<usize> {
        match self.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.failed = true;
                Err(Error::Io(e))
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> HttpResult<usize> {
        match self.stream.write(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.failed = true;
                Err(Error::Io(e))
            }
        }
    }

    fn flush(&mut self) -> HttpResult<()> {
        self.stream.flush().map_err(|e| {
            self.failed = true;
            Error::Io(e)
        })
    }

    fn close(&mut self) -> HttpResult<()> {
        if !self.failed {
            let _ = self.stream.shutdown();
        }

        use std::net::Shutdown;
        self.stream
            .get_mut()
            .shutdown(Shutdown::Both)
            .map_err(Error::from)
    }

    fn pending(&self) -> bool {
        self.stream.ssl().pending() > 0
    }
}
