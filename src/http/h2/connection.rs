//! Server-side HTTP/2 connection pipeline
//!
//! Consumes bytes fed by the owning worker, runs the preface and SETTINGS
//! exchange, and echoes requests in one of two modes:
//!
//! - **Aggregated**: HEADERS/DATA frames are collected per stream into a
//!   synthetic full request. Completed requests are surfaced to the caller,
//!   which runs them through the shared response builder and hands the
//!   response back to [`H2Connection::write_response`]; the stream id rides
//!   along in the `x-http2-stream-id` extension header.
//! - **Native**: frames are echoed per stream as they arrive, with no
//!   synthetic request object. Streams never wait on each other.
//!
//! Responses bigger than the peer's flow-control window queue on their
//! stream and drain as WINDOW_UPDATE credit arrives.

use super::codec::{strip_data_payload, strip_headers_payload, FrameCodec, FrameReader, RawFrame};
use super::error::{Error, ErrorCode, Result};
use super::flow_control::ConnectionFlowControl;
use super::frames::*;
use super::settings::Settings;
use super::stream::{H2Stream, StreamId, StreamManager};
use super::{CONNECTION_PREFACE, CONNECTION_STREAM_ID};
use crate::http::echo::{self, DEFAULT_CONTENT_TYPE, OPERATION_ID, OPERATION_ID_HEADER};
use crate::http::session::BoxedSession;
use crate::http::{HttpRequest, HttpResponse, Method};
use bytes::Bytes;
use hpack::{Decoder as HpackDecoder, Encoder as HpackEncoder};
use std::net::IpAddr;
use tracing::{debug, trace, warn};

/// Read buffer size for one readiness event
const READ_CHUNK: usize = 16 * 1024;

/// Headers that must not travel over HTTP/2 (RFC 7540 Section 8.1.2.2)
const CONNECTION_HEADERS: &[&str] = &["connection", "keep-alive", "transfer-encoding", "upgrade"];

/// Echo strategy for the pipeline's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoMode {
    /// Collect frames into a synthetic full request per stream
    Aggregated,
    /// Echo frames per stream directly
    Native,
}

/// Configuration for an HTTP/2 connection pipeline
#[derive(Debug, Clone, Copy)]
pub struct H2ConnectionConfig {
    pub mode: EchoMode,
    /// Per-stream aggregation limit (aggregated mode)
    pub max_content_length: usize,
}

/// Server-side HTTP/2 connection
pub struct H2Connection {
    session: BoxedSession,
    reader: FrameReader,
    decoder: HpackDecoder<'static>,
    encoder: HpackEncoder<'static>,
    streams: StreamManager,
    flow: ConnectionFlowControl,
    local_settings: Settings,
    remote_settings: Settings,
    mode: EchoMode,
    max_content_length: usize,
    remote_addr: Option<IpAddr>,
    preface_seen: bool,
    client_settings_seen: bool,
    goaway_sent: bool,
    /// Request that rode in on an h2c upgrade, answered as stream 1 once
    /// the client preface arrives
    pending_upgrade: Option<HttpRequest>,
}

impl H2Connection {
    /// Create the pipeline and send the server preface (a SETTINGS frame)
    pub fn new(mut session: BoxedSession, config: H2ConnectionConfig) -> Result<Self> {
        let local_settings = Settings::server_defaults();
        let frame = FrameCodec::encode_settings_frame(&SettingsFrame::new(local_settings.clone()));
        session.write_all(&frame)?;

        let remote_addr = session.peer_addr().map(|a| a.ip());

        Ok(H2Connection {
            session,
            reader: FrameReader::new(),
            decoder: HpackDecoder::new(),
            encoder: HpackEncoder::new(),
            streams: StreamManager::new(),
            flow: ConnectionFlowControl::new(),
            local_settings,
            remote_settings: Settings::new(),
            mode: config.mode,
            max_content_length: config.max_content_length,
            remote_addr,
            preface_seen: false,
            client_settings_seen: false,
            goaway_sent: false,
            pending_upgrade: None,
        })
    }

    /// Attach the request that triggered an h2c upgrade; it becomes the
    /// first HTTP/2 stream's request
    pub fn with_upgrade_request(mut self, request: HttpRequest) -> Self {
        self.pending_upgrade = Some(request);
        self
    }

    /// Raw descriptor for worker multiplexing
    pub fn raw_fd(&self) -> std::os::fd::RawFd {
        self.session.raw_fd()
    }

    /// Whether the transport has buffered input that poll cannot see
    pub fn session_pending(&self) -> bool {
        self.session.pending()
    }

    /// Read what the transport has and process it
    ///
    /// Returns the synthetic requests that completed (aggregated mode and
    /// the upgrade request); native-mode echoes happen internally.
    pub fn on_readable(&mut self) -> Result<Vec<HttpRequest>> {
        let mut buf = [0u8; READ_CHUNK];
        let n = self.session.read(&mut buf)?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        self.process(&buf[..n])
    }

    /// Feed received bytes through the frame loop
    pub fn process(&mut self, data: &[u8]) -> Result<Vec<HttpRequest>> {
        self.reader.feed(data);
        let mut ready = Vec::new();

        match self.run_frames(&mut ready) {
            Ok(()) => Ok(ready),
            Err(e) => {
                self.fail_connection(&e);
                Err(e)
            }
        }
    }

    /// Close the underlying session
    pub fn close(&mut self) {
        let _ = self.session.close();
    }

    fn run_frames(&mut self, ready: &mut Vec<HttpRequest>) -> Result<()> {
        if !self.preface_seen {
            let buffered = self.reader.buffered();
            let want = CONNECTION_PREFACE.len();
            let check = buffered.len().min(want);
            if buffered[..check] != CONNECTION_PREFACE[..check] {
                return Err(Error::MissingPreface);
            }
            if buffered.len() < want {
                return Ok(());
            }
            self.reader.consume(want);
            self.preface_seen = true;
            trace!("Client connection preface received");
        }

        let max_frame = self.local_settings.get_max_frame_size() as usize;
        while let Some(raw) = self.reader.next_frame(max_frame)? {
            self.handle_frame(raw, ready)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, raw: RawFrame, ready: &mut Vec<HttpRequest>) -> Result<()> {
        let Some(frame_type) = raw.frame_type else {
            // Extension frame types are ignored
            trace!(stream = raw.stream_id, "Ignoring unknown frame type");
            return Ok(());
        };

        // The first frame after the preface must be SETTINGS
        if !self.client_settings_seen && frame_type != FrameType::Settings {
            return Err(self.connection_error(
                ErrorCode::ProtocolError,
                "Expected SETTINGS after connection preface",
            ));
        }

        trace!(frame = %frame_type, stream = raw.stream_id, len = raw.payload.len(), "Frame received");

        match frame_type {
            FrameType::Settings => self.handle_settings(raw, ready),
            FrameType::Headers => self.handle_headers(raw, ready),
            FrameType::Data => self.handle_data(raw, ready),
            FrameType::WindowUpdate => self.handle_window_update(raw),
            FrameType::Ping => self.handle_ping(raw),
            FrameType::RstStream => self.handle_rst_stream(raw),
            FrameType::Goaway => {
                debug!("Client sent GOAWAY");
                Err(Error::ConnectionClosed)
            }
            FrameType::Priority => Ok(()),
            FrameType::PushPromise => Err(self.connection_error(
                ErrorCode::ProtocolError,
                "Client may not send PUSH_PROMISE",
            )),
            FrameType::Continuation => Err(self.connection_error(
                ErrorCode::ProtocolError,
                "CONTINUATION without preceding open header block",
            )),
        }
    }

    fn handle_settings(&mut self, raw: RawFrame, ready: &mut Vec<HttpRequest>) -> Result<()> {
        if raw.stream_id != CONNECTION_STREAM_ID {
            return Err(self.connection_error(
                ErrorCode::ProtocolError,
                "SETTINGS frame must have stream ID 0",
            ));
        }

        if raw.flags.is_ack() {
            return Ok(());
        }

        let settings = Settings::parse_payload(&raw.payload)?;
        if let Some(new_size) = settings.initial_window_size {
            self.streams.update_send_windows(new_size)?;
        }
        self.remote_settings.merge(&settings);

        self.write_frame(&FrameCodec::encode_settings_frame(&SettingsFrame::ack()))?;

        if !self.client_settings_seen {
            self.client_settings_seen = true;
            if let Some(request) = self.pending_upgrade.take() {
                // The upgrade request arrived fully aggregated over
                // HTTP/1.1; register it as stream 1, half closed (remote)
                let mut stream =
                    H2Stream::new(1, self.remote_settings.get_initial_window_size());
                stream.receive_headers(true, true)?;
                self.streams.insert(stream);
                ready.push(request);
            }
        }

        Ok(())
    }

    fn handle_headers(&mut self, raw: RawFrame, ready: &mut Vec<HttpRequest>) -> Result<()> {
        if !raw.flags.is_end_headers() {
            return Err(self.connection_error(
                ErrorCode::ProtocolError,
                "CONTINUATION header blocks are not supported",
            ));
        }

        let block = strip_headers_payload(raw.flags, &raw.payload)?;
        let decoded = match self.decoder.decode(&block) {
            Ok(pairs) => pairs,
            Err(e) => {
                return Err(self.connection_error(
                    ErrorCode::CompressionError,
                    &format!("HPACK decode error: {:?}", e),
                ));
            }
        };

        let end_stream = raw.flags.is_end_stream();
        if raw.stream_id == CONNECTION_STREAM_ID || raw.stream_id % 2 == 0 {
            return Err(self.connection_error(
                ErrorCode::ProtocolError,
                &format!("Invalid client stream id {}", raw.stream_id),
            ));
        }
        let stream = self.streams.get_or_create(raw.stream_id)?;
        stream.receive_headers(end_stream, true)?;

        for (name, value) in decoded {
            let value = String::from_utf8_lossy(&value).to_string();
            match name.as_slice() {
                b":method" => stream.method = Some(value),
                b":path" => stream.path = Some(value),
                b":authority" => stream.headers.insert("host", value),
                n if n.starts_with(b":") => {}
                n => stream
                    .headers
                    .insert(String::from_utf8_lossy(n).to_string(), value),
            }
        }

        if end_stream {
            let complete = stream.stream_complete();
            match self.mode {
                EchoMode::Aggregated => {
                    if complete {
                        self.finish_stream(raw.stream_id, ready)?;
                    }
                }
                EchoMode::Native => {
                    // Header-only stream: answer with the JSON header map
                    self.native_respond_headers_only(raw.stream_id)?;
                }
            }
        }

        Ok(())
    }

    fn handle_data(&mut self, raw: RawFrame, ready: &mut Vec<HttpRequest>) -> Result<()> {
        let data = strip_data_payload(raw.flags, &raw.payload)?;
        let flow_len = raw.payload.len();
        let end_stream = raw.flags.is_end_stream();
        let sid = raw.stream_id;

        if sid == CONNECTION_STREAM_ID {
            return Err(self.connection_error(
                ErrorCode::ProtocolError,
                "DATA frame on stream 0",
            ));
        }

        // Connection-level accounting: consume, re-credit the peer, restore
        self.flow.consume_recv_window(flow_len);
        if flow_len > 0 {
            self.write_frame(&FrameCodec::encode_window_update_frame(
                &WindowUpdateFrame::new(CONNECTION_STREAM_ID, flow_len as u32),
            ))?;
            self.flow.restore_recv_window(flow_len as u32)?;
        }

        let over_limit = {
            let Some(stream) = self.streams.get_mut(sid) else {
                // DATA for a stream already reset; drop it
                trace!(stream = sid, "DATA for unknown stream dropped");
                return Ok(());
            };
            if stream.state().is_closed() {
                return Ok(());
            }
            stream.flow_control_mut().consume_recv_window(flow_len);

            self.mode == EchoMode::Aggregated
                && stream.body().len() + data.len() > self.max_content_length
        };

        if flow_len > 0 {
            self.write_frame(&FrameCodec::encode_window_update_frame(
                &WindowUpdateFrame::new(sid, flow_len as u32),
            ))?;
            if let Some(stream) = self.streams.get_mut(sid) {
                stream.flow_control_mut().restore_recv_window(flow_len as u32)?;
            }
        }

        if over_limit {
            warn!(
                stream = sid,
                limit = self.max_content_length,
                "Stream body over limit, resetting stream"
            );
            self.write_frame(&FrameCodec::encode_rst_stream_frame(&RstStreamFrame {
                stream_id: sid,
                error_code: ErrorCode::EnhanceYourCalm,
            }))?;
            if let Some(stream) = self.streams.get_mut(sid) {
                stream.close();
            }
            self.streams.cleanup_closed();
            return Ok(());
        }

        match self.mode {
            EchoMode::Aggregated => {
                let complete = {
                    let Some(stream) = self.streams.get_mut(sid) else {
                        return Ok(());
                    };
                    stream.receive_data(&data, end_stream)?;
                    stream.stream_complete()
                };
                if complete {
                    self.finish_stream(sid, ready)?;
                }
            }
            EchoMode::Native => {
                let proceed = {
                    let Some(stream) = self.streams.get_mut(sid) else {
                        return Ok(());
                    };
                    // Advance the state machine without buffering the body
                    stream.receive_data(&[], end_stream)?;
                    true
                };
                if proceed {
                    self.native_echo_data(sid, data, end_stream)?;
                }
            }
        }

        Ok(())
    }

    fn handle_window_update(&mut self, raw: RawFrame) -> Result<()> {
        if raw.payload.len() != 4 {
            return Err(self.connection_error(
                ErrorCode::FrameSizeError,
                "WINDOW_UPDATE payload must be 4 bytes",
            ));
        }
        let increment = u32::from_be_bytes([
            raw.payload[0],
            raw.payload[1],
            raw.payload[2],
            raw.payload[3],
        ]) & 0x7FFFFFFF;

        if raw.stream_id == CONNECTION_STREAM_ID {
            self.flow.increase_send_window(increment)?;
            for sid in self.streams.ids_with_pending_send() {
                self.flush_stream(sid)?;
            }
        } else {
            if let Some(stream) = self.streams.get_mut(raw.stream_id) {
                stream.flow_control_mut().increase_send_window(increment)?;
            }
            self.flush_stream(raw.stream_id)?;
        }

        Ok(())
    }

    fn handle_ping(&mut self, raw: RawFrame) -> Result<()> {
        if raw.payload.len() != 8 {
            return Err(self.connection_error(
                ErrorCode::FrameSizeError,
                "PING payload must be 8 bytes",
            ));
        }
        if !raw.flags.is_ack() {
            let mut data = [0u8; 8];
            data.copy_from_slice(&raw.payload[..8]);
            self.write_frame(&FrameCodec::encode_ping_frame(&PingFrame::ack(data)))?;
        }
        Ok(())
    }

    fn handle_rst_stream(&mut self, raw: RawFrame) -> Result<()> {
        if raw.payload.len() != 4 {
            return Err(self.connection_error(
                ErrorCode::FrameSizeError,
                "RST_STREAM payload must be 4 bytes",
            ));
        }
        let code = u32::from_be_bytes([
            raw.payload[0],
            raw.payload[1],
            raw.payload[2],
            raw.payload[3],
        ]);
        debug!(
            stream = raw.stream_id,
            code = %ErrorCode::from_u32(code).map(|c| c.name()).unwrap_or("unknown"),
            "Stream reset by client"
        );
        if let Some(stream) = self.streams.get_mut(raw.stream_id) {
            stream.close();
        }
        self.streams.cleanup_closed();
        Ok(())
    }

    /// Assemble the synthetic aggregated request for a completed stream
    fn finish_stream(&mut self, sid: StreamId, ready: &mut Vec<HttpRequest>) -> Result<()> {
        let Some(stream) = self.streams.get_mut(sid) else {
            return Ok(());
        };

        let method = stream
            .method
            .as_deref()
            .and_then(|m| Method::from_str(m).ok())
            .unwrap_or(Method::Get);
        let uri = stream.path.clone().unwrap_or_else(|| "/".to_string());
        let mut headers = std::mem::take(&mut stream.headers);
        headers.set(echo::STREAM_ID_HEADER, sid.to_string());
        let body = stream.take_body();

        let mut builder = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .headers(headers)
            .body(body)
            .stream_id(sid);
        if let Some(addr) = self.remote_addr {
            builder = builder.remote_addr(addr);
        }

        ready.push(builder.build());
        Ok(())
    }

    /// Write a built response onto its originating stream
    ///
    /// A stream that has been reset or closed while the response was
    /// deferred makes this a silent no-op.
    pub fn write_response(&mut self, sid: StreamId, response: &HttpResponse) -> Result<()> {
        let open = self
            .streams
            .get_mut(sid)
            .map(|s| !s.state().is_closed())
            .unwrap_or(false);
        if !open {
            debug!(stream = sid, "Dropping response for closed stream");
            return Ok(());
        }

        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(n, v)| (n.to_ascii_lowercase(), v.to_string()))
            .collect();

        let body_empty = response.body().is_empty();
        self.send_response_headers(sid, response.status().code(), &headers, body_empty)?;
        if !body_empty {
            self.send_stream_data(sid, Bytes::copy_from_slice(response.body()), true)?;
        }
        self.streams.cleanup_closed();
        Ok(())
    }

    /// Native-mode reply for a headers-only (empty body) stream
    fn native_respond_headers_only(&mut self, sid: StreamId) -> Result<()> {
        let body = {
            let Some(stream) = self.streams.get_mut(sid) else {
                return Ok(());
            };
            echo::header_map_json(
                &stream.headers,
                self.remote_addr.map(|a| a.to_string()),
            )
        };

        let headers = vec![
            (OPERATION_ID_HEADER.to_string(), OPERATION_ID.to_string()),
            ("content-type".to_string(), DEFAULT_CONTENT_TYPE.to_string()),
            ("content-length".to_string(), body.len().to_string()),
        ];
        self.send_response_headers(sid, 200, &headers, false)?;
        self.send_stream_data(sid, Bytes::from(body), true)?;
        self.streams.cleanup_closed();
        Ok(())
    }

    /// Native-mode echo of one DATA frame
    fn native_echo_data(&mut self, sid: StreamId, data: Bytes, end_stream: bool) -> Result<()> {
        let needs_headers = {
            let Some(stream) = self.streams.get_mut(sid) else {
                return Ok(());
            };
            !stream.response_headers_sent
        };

        if needs_headers {
            let content_type = self
                .streams
                .get_mut(sid)
                .and_then(|s| s.headers.get("content-type").map(|v| v.to_string()))
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
            let headers = vec![
                (OPERATION_ID_HEADER.to_string(), OPERATION_ID.to_string()),
                ("content-type".to_string(), content_type),
            ];
            self.send_response_headers(sid, 200, &headers, false)?;
        }

        self.send_stream_data(sid, data, end_stream)?;
        self.streams.cleanup_closed();
        Ok(())
    }

    /// HPACK-encode and send response headers for a stream
    fn send_response_headers(
        &mut self,
        sid: StreamId,
        status: u16,
        headers: &[(String, String)],
        end_stream: bool,
    ) -> Result<()> {
        let status_value = status.to_string();
        let mut tuples: Vec<(&[u8], &[u8])> = Vec::with_capacity(headers.len() + 1);
        tuples.push((b":status", status_value.as_bytes()));
        for (name, value) in headers {
            if CONNECTION_HEADERS.contains(&name.as_str()) {
                continue;
            }
            tuples.push((name.as_bytes(), value.as_bytes()));
        }

        let mut block = Vec::new();
        self.encoder
            .encode_into(tuples, &mut block)
            .map_err(|e| Error::Compression(format!("HPACK encode error: {}", e)))?;

        let frame = HeadersFrame::new(sid, Bytes::from(block), end_stream, true);
        self.write_frame(&FrameCodec::encode_headers_frame(&frame))?;

        if let Some(stream) = self.streams.get_mut(sid) {
            stream.send_headers(end_stream)?;
        }
        Ok(())
    }

    /// Queue response data on the stream and send what the windows allow
    fn send_stream_data(&mut self, sid: StreamId, data: Bytes, end_stream: bool) -> Result<()> {
        {
            let Some(stream) = self.streams.get_mut(sid) else {
                return Ok(());
            };
            if stream.state().is_closed() {
                return Ok(());
            }
            stream.queue_pending(data, end_stream);
        }
        self.flush_stream(sid)
    }

    /// Drain a stream's queued response data within flow-control limits
    fn flush_stream(&mut self, sid: StreamId) -> Result<()> {
        loop {
            let max_frame = self.remote_settings.get_max_frame_size() as usize;
            let conn_window = self.flow.send_window_mut().size().max(0) as usize;

            let action = {
                let Some(stream) = self.streams.get_mut(sid) else {
                    return Ok(());
                };
                if stream.state().is_closed() || !stream.has_pending_send() {
                    return Ok(());
                }

                if stream.pending_ends_stream() {
                    // Nothing left but the end-of-stream marker
                    stream.clear_pending_end();
                    Some((Bytes::new(), true))
                } else {
                    let stream_window =
                        stream.flow_control_mut().send_window_mut().size().max(0) as usize;
                    let allow = max_frame.min(conn_window).min(stream_window);
                    if allow == 0 {
                        None
                    } else {
                        let chunk = stream.pop_pending(allow).unwrap_or_default();
                        let last = stream.pending_ends_stream();
                        if last {
                            stream.clear_pending_end();
                        }
                        stream.flow_control_mut().consume_send_window(chunk.len());
                        Some((chunk, last))
                    }
                }
            };

            match action {
                None => {
                    // Window exhausted; WINDOW_UPDATE will resume the drain
                    trace!(stream = sid, "Send window exhausted, response queued");
                    return Ok(());
                }
                Some((chunk, last)) => {
                    self.flow.consume_send_window(chunk.len());
                    let frame = DataFrame::new(sid, chunk, last);
                    self.write_frame(&FrameCodec::encode_data_frame(&frame))?;
                    if last {
                        if let Some(stream) = self.streams.get_mut(sid) {
                            stream.finish_sending();
                        }
                        self.streams.cleanup_closed();
                        return Ok(());
                    }
                }
            }
        }
    }

    fn write_frame(&mut self, bytes: &[u8]) -> Result<()> {
        self.session.write_all(bytes)?;
        Ok(())
    }

    /// Send GOAWAY for a connection-level error and return it
    fn connection_error(&mut self, code: ErrorCode, msg: &str) -> Error {
        self.send_goaway(code, msg);
        Error::Protocol(msg.to_string())
    }

    /// Best-effort GOAWAY before the caller tears the connection down
    fn fail_connection(&mut self, error: &Error) {
        let code = match error {
            Error::Compression(_) => ErrorCode::CompressionError,
            Error::FrameSize(_) => ErrorCode::FrameSizeError,
            Error::FlowControl(_) => ErrorCode::FlowControlError,
            Error::InvalidSettings(_) => ErrorCode::ProtocolError,
            Error::StreamClosed(_) => ErrorCode::StreamClosed,
            Error::Protocol(_) | Error::MissingPreface => ErrorCode::ProtocolError,
            Error::Io(_) | Error::Http(_) | Error::ConnectionClosed => return,
        };
        self.send_goaway(code, &error.to_string());
    }

    fn send_goaway(&mut self, code: ErrorCode, msg: &str) {
        if self.goaway_sent {
            return;
        }
        self.goaway_sent = true;
        let frame = GoawayFrame::new(
            self.streams.highest_remote_id(),
            code,
            Bytes::copy_from_slice(msg.as_bytes()),
        );
        let _ = self.write_frame(&FrameCodec::encode_goaway_frame(&frame));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::session::{PollEvents, SessionOps};
    use crate::http::Status;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::os::fd::RawFd;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// In-memory session: reads come from a queue, writes land in a shared
    /// buffer the test inspects
    struct MockSession {
        input: VecDeque<u8>,
        output: Arc<Mutex<Vec<u8>>>,
    }

    impl MockSession {
        fn new() -> (Self, Arc<Mutex<Vec<u8>>>) {
            let output = Arc::new(Mutex::new(Vec::new()));
            (
                MockSession {
                    input: VecDeque::new(),
                    output: output.clone(),
                },
                output,
            )
        }
    }

    impl SessionOps for MockSession {
        fn raw_fd(&self) -> RawFd {
            -1
        }
        fn peer_addr(&self) -> Option<SocketAddr> {
            "127.0.0.1:40000".parse().ok()
        }
        fn poll(&self, _events: PollEvents, _timeout: Option<Duration>) -> crate::http::Result<bool> {
            Ok(!self.input.is_empty())
        }
        fn read(&mut self, buf: &mut [u8]) -> crate::http::Result<usize> {
            let n = buf.len().min(self.input.len());
            for b in buf.iter_mut().take(n) {
                *b = self.input.pop_front().unwrap();
            }
            Ok(n)
        }
        fn write(&mut self, buf: &[u8]) -> crate::http::Result<usize> {
            self.output.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> crate::http::Result<()> {
            Ok(())
        }
        fn close(&mut self) -> crate::http::Result<()> {
            Ok(())
        }
    }

    fn new_conn(mode: EchoMode) -> (H2Connection, Arc<Mutex<Vec<u8>>>) {
        let (session, output) = MockSession::new();
        let conn = H2Connection::new(
            Box::new(session),
            H2ConnectionConfig {
                mode,
                max_content_length: 1024,
            },
        )
        .unwrap();
        (conn, output)
    }

    fn client_headers_block(headers: &[(&str, &str)]) -> Bytes {
        let mut encoder = HpackEncoder::new();
        let tuples: Vec<(&[u8], &[u8])> = headers
            .iter()
            .map(|(n, v)| (n.as_bytes(), v.as_bytes()))
            .collect();
        let mut block = Vec::new();
        encoder.encode_into(tuples, &mut block).unwrap();
        Bytes::from(block)
    }

    fn preface_and_settings() -> Vec<u8> {
        let mut wire = CONNECTION_PREFACE.to_vec();
        wire.extend_from_slice(&FrameCodec::encode_settings_frame(&SettingsFrame::new(
            Settings::new(),
        )));
        wire
    }

    /// Decode every frame the server wrote so far
    fn parse_output(output: &Arc<Mutex<Vec<u8>>>) -> Vec<RawFrame> {
        let mut reader = FrameReader::new();
        reader.feed(&output.lock().unwrap());
        let mut frames = Vec::new();
        while let Some(frame) = reader.next_frame(usize::MAX).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_server_preface_is_settings() {
        let (_conn, output) = new_conn(EchoMode::Aggregated);
        let frames = parse_output(&output);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, Some(FrameType::Settings));
        assert_eq!(frames[0].stream_id, 0);
    }

    #[test]
    fn test_bad_preface_fails_connection() {
        let (mut conn, _output) = new_conn(EchoMode::Aggregated);
        let err = conn.process(b"GET / HTTP/1.1\r\n").unwrap_err();
        assert!(matches!(err, Error::MissingPreface));
    }

    #[test]
    fn test_settings_exchange_acks() {
        let (mut conn, output) = new_conn(EchoMode::Aggregated);
        let requests = conn.process(&preface_and_settings()).unwrap();
        assert!(requests.is_empty());

        let frames = parse_output(&output);
        // server SETTINGS, then ACK of the client's
        assert_eq!(frames[0].frame_type, Some(FrameType::Settings));
        assert!(!frames[0].flags.is_ack());
        assert_eq!(frames[1].frame_type, Some(FrameType::Settings));
        assert!(frames[1].flags.is_ack());
    }

    #[test]
    fn test_aggregated_request_assembly() {
        let (mut conn, _output) = new_conn(EchoMode::Aggregated);
        let mut wire = preface_and_settings();

        let block = client_headers_block(&[
            (":method", "POST"),
            (":path", "/echo"),
            (":authority", "localhost"),
            ("content-type", "text/plain"),
        ]);
        wire.extend_from_slice(&FrameCodec::encode_headers_frame(&HeadersFrame::new(
            1, block, false, true,
        )));
        wire.extend_from_slice(&FrameCodec::encode_data_frame(&DataFrame::new(
            1,
            Bytes::from("ping"),
            true,
        )));

        let requests = conn.process(&wire).unwrap();
        assert_eq!(requests.len(), 1);

        let request = &requests[0];
        assert_eq!(request.method(), Method::Post);
        assert_eq!(request.uri(), "/echo");
        assert_eq!(request.stream_id(), Some(1));
        assert_eq!(request.body(), b"ping");
        assert_eq!(request.headers().get("host"), Some("localhost"));
        assert_eq!(request.headers().get(echo::STREAM_ID_HEADER), Some("1"));
        assert_eq!(request.remote_addr().unwrap().to_string(), "127.0.0.1");
    }

    #[test]
    fn test_write_response_frames(){
        let (mut conn, output) = new_conn(EchoMode::Aggregated);
        let mut wire = preface_and_settings();
        let block = client_headers_block(&[(":method", "POST"), (":path", "/")]);
        wire.extend_from_slice(&FrameCodec::encode_headers_frame(&HeadersFrame::new(
            3, block, false, true,
        )));
        wire.extend_from_slice(&FrameCodec::encode_data_frame(&DataFrame::new(
            3,
            Bytes::from("pong"),
            true,
        )));
        let requests = conn.process(&wire).unwrap();
        assert_eq!(requests.len(), 1);

        let mut response = HttpResponse::new(Status::OK);
        response.headers_mut().set("content-length", "4");
        response.set_body(b"pong".to_vec());
        conn.write_response(3, &response).unwrap();

        let frames = parse_output(&output);
        let headers = frames
            .iter()
            .find(|f| f.frame_type == Some(FrameType::Headers) && f.stream_id == 3)
            .expect("response HEADERS");
        let mut decoder = HpackDecoder::new();
        let decoded = decoder.decode(&headers.payload).unwrap();
        assert!(decoded
            .iter()
            .any(|(n, v)| n == b":status" && v == b"200"));

        let data = frames
            .iter()
            .find(|f| f.frame_type == Some(FrameType::Data) && f.stream_id == 3)
            .expect("response DATA");
        assert_eq!(&data.payload[..], b"pong");
        assert!(data.flags.is_end_stream());
    }

    #[test]
    fn test_write_response_to_reset_stream_is_noop() {
        let (mut conn, output) = new_conn(EchoMode::Aggregated);
        let mut wire = preface_and_settings();
        let block = client_headers_block(&[(":method", "GET"), (":path", "/")]);
        wire.extend_from_slice(&FrameCodec::encode_headers_frame(&HeadersFrame::new(
            1, block, true, true,
        )));
        let requests = conn.process(&wire).unwrap();
        assert_eq!(requests.len(), 1);

        // Client resets the stream before the (deferred) response is written
        let rst = FrameCodec::encode_rst_stream_frame(&RstStreamFrame {
            stream_id: 1,
            error_code: ErrorCode::Cancel,
        });
        conn.process(&rst).unwrap();

        let before = output.lock().unwrap().len();
        let mut response = HttpResponse::new(Status::OK);
        response.set_body(b"late".to_vec());
        conn.write_response(1, &response).unwrap();
        assert_eq!(output.lock().unwrap().len(), before);
    }

    #[test]
    fn test_native_mode_echoes_data_frames() {
        let (mut conn, output) = new_conn(EchoMode::Native);
        let mut wire = preface_and_settings();
        let block = client_headers_block(&[
            (":method", "POST"),
            (":path", "/"),
            ("content-type", "text/plain"),
        ]);
        wire.extend_from_slice(&FrameCodec::encode_headers_frame(&HeadersFrame::new(
            1, block, false, true,
        )));
        wire.extend_from_slice(&FrameCodec::encode_data_frame(&DataFrame::new(
            1,
            Bytes::from("ping"),
            true,
        )));

        let requests = conn.process(&wire).unwrap();
        // Native mode builds no synthetic requests
        assert!(requests.is_empty());

        let frames = parse_output(&output);
        let data = frames
            .iter()
            .find(|f| f.frame_type == Some(FrameType::Data) && f.stream_id == 1)
            .expect("echoed DATA");
        assert_eq!(&data.payload[..], b"ping");
        assert!(data.flags.is_end_stream());
    }

    #[test]
    fn test_native_mode_headers_only_gets_json() {
        let (mut conn, output) = new_conn(EchoMode::Native);
        let mut wire = preface_and_settings();
        let block = client_headers_block(&[
            (":method", "GET"),
            (":path", "/"),
            ("x-test", "abc"),
        ]);
        wire.extend_from_slice(&FrameCodec::encode_headers_frame(&HeadersFrame::new(
            1, block, true, true,
        )));
        conn.process(&wire).unwrap();

        let frames = parse_output(&output);
        let data = frames
            .iter()
            .find(|f| f.frame_type == Some(FrameType::Data) && f.stream_id == 1)
            .expect("JSON DATA");
        let json: serde_json::Value = serde_json::from_slice(&data.payload).unwrap();
        assert_eq!(json["x-test"], "abc");
        assert_eq!(json["Remote-address"], "127.0.0.1");
    }

    #[test]
    fn test_ping_is_acked() {
        let (mut conn, output) = new_conn(EchoMode::Aggregated);
        let mut wire = preface_and_settings();
        wire.extend_from_slice(&FrameCodec::encode_ping_frame(&PingFrame::new([7; 8])));
        conn.process(&wire).unwrap();

        let frames = parse_output(&output);
        let pong = frames
            .iter()
            .find(|f| f.frame_type == Some(FrameType::Ping))
            .expect("PING ACK");
        assert!(pong.flags.is_ack());
        assert_eq!(&pong.payload[..], &[7; 8]);
    }

    #[test]
    fn test_oversized_stream_is_reset() {
        let (mut conn, output) = new_conn(EchoMode::Aggregated);
        let mut wire = preface_and_settings();
        let block = client_headers_block(&[(":method", "POST"), (":path", "/")]);
        wire.extend_from_slice(&FrameCodec::encode_headers_frame(&HeadersFrame::new(
            1, block, false, true,
        )));
        // max_content_length is 1024 in the test config
        wire.extend_from_slice(&FrameCodec::encode_data_frame(&DataFrame::new(
            1,
            Bytes::from(vec![0u8; 2048]),
            true,
        )));

        let requests = conn.process(&wire).unwrap();
        assert!(requests.is_empty());

        let frames = parse_output(&output);
        let rst = frames
            .iter()
            .find(|f| f.frame_type == Some(FrameType::RstStream))
            .expect("RST_STREAM");
        assert_eq!(rst.stream_id, 1);
    }

    #[test]
    fn test_upgrade_request_becomes_stream_one() {
        let (session, _output) = MockSession::new();
        let request = HttpRequest::builder()
            .method(Method::Get)
            .uri("/upgrade")
            .stream_id(1)
            .build();
        let mut conn = H2Connection::new(
            Box::new(session),
            H2ConnectionConfig {
                mode: EchoMode::Aggregated,
                max_content_length: 1024,
            },
        )
        .unwrap()
        .with_upgrade_request(request);

        let requests = conn.process(&preface_and_settings()).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].uri(), "/upgrade");
        assert_eq!(requests[0].stream_id(), Some(1));
    }

    #[test]
    fn test_response_respects_flow_control_window() {
        let (mut conn, output) = new_conn(EchoMode::Aggregated);
        let mut wire = CONNECTION_PREFACE.to_vec();
        // Client shrinks the initial window to 8 bytes
        let client_settings = Settings {
            initial_window_size: Some(8),
            ..Settings::new()
        };
        wire.extend_from_slice(&FrameCodec::encode_settings_frame(&SettingsFrame::new(
            client_settings,
        )));
        let block = client_headers_block(&[(":method", "GET"), (":path", "/")]);
        wire.extend_from_slice(&FrameCodec::encode_headers_frame(&HeadersFrame::new(
            1, block, true, true,
        )));
        let requests = conn.process(&wire).unwrap();
        assert_eq!(requests.len(), 1);

        let mut response = HttpResponse::new(Status::OK);
        response.set_body(b"0123456789ABCDEF".to_vec());
        conn.write_response(1, &response).unwrap();

        let frames = parse_output(&output);
        let sent: usize = frames
            .iter()
            .filter(|f| f.frame_type == Some(FrameType::Data))
            .map(|f| f.payload.len())
            .sum();
        assert_eq!(sent, 8);

        // Credit arrives; the rest drains
        let wu = FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(1, 100));
        conn.process(&wu).unwrap();

        let frames = parse_output(&output);
        let sent: usize = frames
            .iter()
            .filter(|f| f.frame_type == Some(FrameType::Data))
            .map(|f| f.payload.len())
            .sum();
        assert_eq!(sent, 16);
        assert!(frames
            .iter()
            .filter(|f| f.frame_type == Some(FrameType::Data))
            .last()
            .unwrap()
            .flags
            .is_end_stream());
    }
}
