//! Per-connection state machine
//!
//! Every accepted socket lives in exactly one of four states:
//!
//! ```text
//! Negotiating (TLS handshake or h2c inspection)
//!     -> Http1Active | Http2Active -> Closed
//! ```
//!
//! The protocol decision is single-shot: once a pipeline is installed it
//! stays installed until the socket closes. Downgrades do not exist and a
//! second protocol-determining signal is never looked for.

use super::delay::{ConnId, DelayQueue, WriteTask};
use crate::config::ServerConfig;
use crate::http::echo::{self, EchoOptions};
use crate::http::h2::{EchoMode, H2Connection, H2ConnectionConfig};
use crate::http::session::BoxedSession;
use crate::http::tls::TlsContext;
use crate::http::upgrade::{self, UpgradeDecision};
use crate::http::{
    Error as HttpError, FdSessionOps, HttpRequest, HttpResponse, RequestParser, Status,
};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Read buffer size for one readiness event
const READ_CHUNK: usize = 16 * 1024;

enum State {
    /// TLS handshake not yet performed
    TlsHandshake { stream: Option<TcpStream>, fd: RawFd },
    /// Cleartext connection awaiting the protocol-determining first request
    H2cDetect {
        session: BoxedSession,
        parser: RequestParser,
    },
    /// HTTP/1.1 pipeline installed
    Http1 {
        session: BoxedSession,
        parser: RequestParser,
    },
    /// HTTP/2 pipeline installed
    Http2 { conn: H2Connection },
    Closed,
}

/// One transport-level connection and its installed pipeline
pub struct Connection {
    id: ConnId,
    remote_addr: SocketAddr,
    config: Arc<ServerConfig>,
    tls: Option<Arc<TlsContext>>,
    state: State,
}

impl Connection {
    /// Register a freshly accepted socket
    ///
    /// The initial state depends only on startup configuration: TLS
    /// handshake when ssl is on, h2c inspection when http2 is requested in
    /// the clear, and a plain HTTP/1.1 pipeline otherwise.
    pub fn new(
        id: ConnId,
        stream: TcpStream,
        remote_addr: SocketAddr,
        config: Arc<ServerConfig>,
        tls: Option<Arc<TlsContext>>,
    ) -> Self {
        let state = if config.ssl {
            let fd = stream.as_raw_fd();
            State::TlsHandshake {
                stream: Some(stream),
                fd,
            }
        } else if config.http2 {
            State::H2cDetect {
                session: Box::new(FdSessionOps::new(stream)),
                parser: RequestParser::new(config.h2_max_content_length)
                    .with_remote_addr(remote_addr.ip()),
            }
        } else {
            State::Http1 {
                session: Box::new(FdSessionOps::new(stream)),
                parser: RequestParser::new(config.max_content_length)
                    .with_remote_addr(remote_addr.ip()),
            }
        };

        Connection {
            id,
            remote_addr,
            config,
            tls,
            state,
        }
    }

    /// Descriptor to multiplex on, absent once closed
    pub fn raw_fd(&self) -> Option<RawFd> {
        match &self.state {
            State::TlsHandshake { fd, .. } => Some(*fd),
            State::H2cDetect { session, .. } | State::Http1 { session, .. } => {
                Some(session.raw_fd())
            }
            State::Http2 { conn } => Some(conn.raw_fd()),
            State::Closed => None,
        }
    }

    /// Whether the transport holds decrypted input poll cannot report
    pub fn session_pending(&self) -> bool {
        match &self.state {
            State::H2cDetect { session, .. } | State::Http1 { session, .. } => session.pending(),
            State::Http2 { conn } => conn.session_pending(),
            _ => false,
        }
    }

    /// Whether the connection has fully shut down
    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Drive the state machine off a readiness event
    pub fn on_readable(&mut self, delays: &mut DelayQueue) {
        loop {
            let state = std::mem::replace(&mut self.state, State::Closed);
            self.state = self.step(state, delays);
            if self.is_closed() || !self.session_pending() {
                break;
            }
        }
    }

    fn step(&mut self, state: State, delays: &mut DelayQueue) -> State {
        match state {
            State::TlsHandshake { stream, .. } => self.do_handshake(stream),
            State::H2cDetect { session, parser } => self.do_h2c_detect(session, parser, delays),
            State::Http1 { mut session, parser } => {
                let mut buf = [0u8; READ_CHUNK];
                let n = match session.read(&mut buf) {
                    Ok(0) => {
                        trace!(conn = self.id, "Peer closed connection");
                        let _ = session.close();
                        return State::Closed;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!(conn = self.id, error = %e, "Read failed");
                        let _ = session.close();
                        return State::Closed;
                    }
                };
                self.serve_http1(session, parser, None, &buf[..n], delays)
            }
            State::Http2 { conn } => self.do_http2(conn, delays),
            State::Closed => State::Closed,
        }
    }

    /// Perform the TLS handshake and install the negotiated pipeline
    fn do_handshake(&mut self, stream: Option<TcpStream>) -> State {
        let (Some(stream), Some(tls)) = (stream, self.tls.clone()) else {
            return State::Closed;
        };

        let session = match tls.accept(stream) {
            Ok(session) => session,
            Err(e) => {
                debug!(conn = self.id, error = %e, "TLS handshake failed");
                return State::Closed;
            }
        };

        if !self.config.http2 {
            return State::Http1 {
                session: Box::new(session),
                parser: RequestParser::new(self.config.max_content_length)
                    .with_remote_addr(self.remote_addr.ip()),
            };
        }

        let alpn: Option<Vec<u8>> = session.selected_alpn().map(|p| p.to_vec());
        match alpn.as_deref() {
            Some(b"h2") => {
                debug!(conn = self.id, "ALPN negotiated h2");
                match H2Connection::new(Box::new(session), self.h2_config()) {
                    Ok(conn) => State::Http2 { conn },
                    Err(e) => {
                        debug!(conn = self.id, error = %e, "HTTP/2 setup failed");
                        State::Closed
                    }
                }
            }
            Some(b"http/1.1") | None => {
                debug!(conn = self.id, "ALPN negotiated http/1.1");
                State::Http1 {
                    session: Box::new(session),
                    parser: RequestParser::new(self.config.h2_max_content_length)
                        .with_remote_addr(self.remote_addr.ip()),
                }
            }
            Some(other) => {
                warn!(
                    conn = self.id,
                    protocol = %String::from_utf8_lossy(other),
                    "Unknown negotiated protocol, closing connection"
                );
                let mut session: BoxedSession = Box::new(session);
                let _ = session.close();
                State::Closed
            }
        }
    }

    /// Inspect the first cleartext request for an h2c upgrade
    fn do_h2c_detect(
        &mut self,
        mut session: BoxedSession,
        mut parser: RequestParser,
        delays: &mut DelayQueue,
    ) -> State {
        let mut buf = [0u8; READ_CHUNK];
        let n = match session.read(&mut buf) {
            Ok(0) => {
                let _ = session.close();
                return State::Closed;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(conn = self.id, error = %e, "Read failed");
                let _ = session.close();
                return State::Closed;
            }
        };

        let request = match parser.parse(&buf[..n]) {
            Ok(Some(request)) => request,
            Ok(None) => {
                return State::H2cDetect { session, parser };
            }
            Err(e) => return self.fail_http1(session, e),
        };

        match upgrade::check_h2c_upgrade(&request) {
            Ok(UpgradeDecision::Upgrade) => {
                debug!(conn = self.id, "Upgrading cleartext connection to HTTP/2");
                if session
                    .write_all(&upgrade::switching_protocols_response())
                    .is_err()
                {
                    let _ = session.close();
                    return State::Closed;
                }

                let mut request = request;
                request.set_stream_id(1);
                if self.config.h2_aggregate_content {
                    request.headers_mut().set(echo::STREAM_ID_HEADER, "1");
                }

                // Bytes the client sent after the upgrade request are
                // already HTTP/2 framing
                let leftover = parser.take_buffered();

                match H2Connection::new(session, self.h2_config()) {
                    Ok(conn) => {
                        let mut conn = conn.with_upgrade_request(request);
                        if leftover.is_empty() {
                            return State::Http2 { conn };
                        }
                        match conn.process(&leftover) {
                            Ok(requests) => self.dispatch_h2(conn, requests, delays),
                            Err(e) => {
                                debug!(conn = self.id, error = %e, "HTTP/2 error after upgrade");
                                conn.close();
                                State::Closed
                            }
                        }
                    }
                    Err(e) => {
                        debug!(conn = self.id, error = %e, "HTTP/2 setup failed");
                        State::Closed
                    }
                }
            }
            Ok(UpgradeDecision::NotRequested) => {
                trace!(conn = self.id, "No upgrade attempted, staying on HTTP/1.1");
                self.serve_http1(session, parser, Some(request), &[], delays)
            }
            Err(e) => {
                warn!(conn = self.id, error = %e, "Malformed h2c upgrade, closing");
                let _ = session.close();
                State::Closed
            }
        }
    }

    /// Respond to parsed requests in arrival order, then keep the pipeline
    fn serve_http1(
        &mut self,
        mut session: BoxedSession,
        mut parser: RequestParser,
        pending: Option<HttpRequest>,
        data: &[u8],
        delays: &mut DelayQueue,
    ) -> State {
        let mut close_now = false;

        if let Some(request) = pending {
            close_now = self.respond_http1(&mut session, request, delays);
        }

        let mut input = data;
        while !close_now {
            match parser.parse(input) {
                Ok(Some(request)) => {
                    input = &[];
                    close_now = self.respond_http1(&mut session, request, delays);
                }
                Ok(None) => break,
                Err(e) => return self.fail_http1(session, e),
            }
        }

        if close_now {
            let _ = session.close();
            State::Closed
        } else {
            State::Http1 { session, parser }
        }
    }

    /// Build and deliver (or defer) one HTTP/1.1 response; returns whether
    /// the connection must close now
    fn respond_http1(
        &mut self,
        session: &mut BoxedSession,
        request: HttpRequest,
        delays: &mut DelayQueue,
    ) -> bool {
        let keep_alive = request.is_keep_alive();
        let mut response = echo::build_response(&request, self.echo_options());
        if keep_alive {
            response.headers_mut().set("Connection", "keep-alive");
        }
        let wire = response.to_wire();

        trace!(
            conn = self.id,
            method = %request.method(),
            uri = %request.uri(),
            keep_alive,
            "Request served"
        );

        if self.config.response_delay > Duration::ZERO {
            delays.schedule(
                self.id,
                self.config.response_delay,
                WriteTask::Http1 { wire, keep_alive },
            );
            return false;
        }

        if let Err(e) = session.write_all(&wire) {
            debug!(conn = self.id, error = %e, "Response write failed");
            return true;
        }
        !keep_alive
    }

    /// Tear down an HTTP/1.1 connection after a parse failure
    fn fail_http1(&mut self, mut session: BoxedSession, error: HttpError) -> State {
        match error {
            HttpError::PayloadTooLarge(limit) => {
                warn!(conn = self.id, limit, "Request body over limit, resetting");
                let mut response = HttpResponse::new(Status::PAYLOAD_TOO_LARGE);
                response.headers_mut().set("Content-Length", "0");
                response.headers_mut().set("Connection", "close");
                let _ = session.write_all(&response.to_wire());
            }
            e => {
                debug!(conn = self.id, error = %e, "Request parse failed, closing");
            }
        }
        let _ = session.close();
        State::Closed
    }

    /// Pump the HTTP/2 pipeline and answer completed requests
    fn do_http2(&mut self, mut conn: H2Connection, delays: &mut DelayQueue) -> State {
        let requests = match conn.on_readable() {
            Ok(requests) => requests,
            Err(crate::http::h2::Error::ConnectionClosed) => {
                trace!(conn = self.id, "HTTP/2 peer closed connection");
                conn.close();
                return State::Closed;
            }
            Err(e) => {
                debug!(conn = self.id, error = %e, "HTTP/2 connection error");
                conn.close();
                return State::Closed;
            }
        };

        self.dispatch_h2(conn, requests, delays)
    }

    /// Build and deliver (or defer) responses for completed stream requests
    fn dispatch_h2(
        &mut self,
        mut conn: H2Connection,
        requests: Vec<HttpRequest>,
        delays: &mut DelayQueue,
    ) -> State {
        for request in requests {
            let stream_id = request.stream_id().unwrap_or(1);
            let mut response = echo::build_response(&request, self.echo_options());
            if self.config.h2_aggregate_content {
                response
                    .headers_mut()
                    .set(echo::STREAM_ID_HEADER, stream_id.to_string());
            }

            trace!(
                conn = self.id,
                stream = stream_id,
                method = %request.method(),
                "Stream request served"
            );

            if self.config.response_delay > Duration::ZERO {
                delays.schedule(
                    self.id,
                    self.config.response_delay,
                    WriteTask::Http2 {
                        stream_id,
                        response,
                    },
                );
            } else if let Err(e) = conn.write_response(stream_id, &response) {
                debug!(conn = self.id, error = %e, "Stream response write failed");
                conn.close();
                return State::Closed;
            }
        }

        State::Http2 { conn }
    }

    /// Perform a write whose timer has fired
    ///
    /// The keep-alive/closure decision was captured at request time. A
    /// connection that changed state or closed in the meantime turns the
    /// task into a no-op.
    pub fn complete_deferred(&mut self, task: WriteTask) {
        let mut close = false;

        match task {
            WriteTask::Http1 { wire, keep_alive } => {
                if let State::Http1 { session, .. } = &mut self.state {
                    match session.write_all(&wire) {
                        Ok(()) => {
                            if !keep_alive {
                                let _ = session.close();
                                close = true;
                            }
                        }
                        Err(e) => {
                            debug!(conn = self.id, error = %e, "Deferred write failed");
                            let _ = session.close();
                            close = true;
                        }
                    }
                } else {
                    trace!(conn = self.id, "Deferred write dropped, connection gone");
                }
            }
            WriteTask::Http2 {
                stream_id,
                response,
            } => {
                if let State::Http2 { conn } = &mut self.state {
                    if let Err(e) = conn.write_response(stream_id, &response) {
                        debug!(conn = self.id, error = %e, "Deferred stream write failed");
                        conn.close();
                        close = true;
                    }
                } else {
                    trace!(conn = self.id, "Deferred write dropped, connection gone");
                }
            }
        }

        if close {
            self.state = State::Closed;
        }
    }

    fn echo_options(&self) -> EchoOptions {
        EchoOptions {
            timestamp_passthrough: self.config.timestamp_passthrough,
        }
    }

    fn h2_config(&self) -> H2ConnectionConfig {
        H2ConnectionConfig {
            mode: if self.config.h2_aggregate_content {
                EchoMode::Aggregated
            } else {
                EchoMode::Native
            },
            max_content_length: self.config.h2_max_content_length,
        }
    }
}
