//! Shared helpers for the integration tests
//!
//! Tests drive the server over real sockets: plain HTTP/1.1 through an
//! incremental response reader, HTTP/2 through a minimal frame-level
//! client built on the crate's codec and the hpack crate.

#![allow(dead_code)]

use echod::config::ServerConfig;
use echod::http::h2::codec::FrameCodec;
use echod::http::h2::frames::{DataFrame, FrameType, HeadersFrame, PingFrame, SettingsFrame};
use echod::http::h2::settings::Settings;
use echod::http::h2::CONNECTION_PREFACE;
use echod::http::{HttpResponse, ResponseParser};
use echod::server::EchoServer;
use hpack::{Decoder as HpackDecoder, Encoder as HpackEncoder};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};

/// Start a server on an ephemeral port; its threads outlive the handle
pub fn start_server(config: ServerConfig) -> SocketAddr {
    let config = ServerConfig { port: 0, ..config };
    let server = EchoServer::bind(config).expect("server bind");
    server.local_addr()
}

/// Incremental HTTP/1.1 response reader over a socket
pub struct ResponseReader {
    parser: ResponseParser,
}

impl ResponseReader {
    pub fn new() -> Self {
        ResponseReader {
            parser: ResponseParser::new(),
        }
    }

    /// Read one full response; panics if the peer closes first
    pub fn read_response<S: Read>(&mut self, stream: &mut S) -> HttpResponse {
        if let Some(response) = self.parser.parse(&[]).expect("parse response") {
            return response;
        }
        let mut buf = [0u8; 16384];
        loop {
            let n = stream.read(&mut buf).expect("read response");
            assert!(n > 0, "connection closed before response completed");
            if let Some(response) = self.parser.parse(&buf[..n]).expect("parse response") {
                return response;
            }
        }
    }
}

/// Frame-level HTTP/2 test client, generic over the transport
pub struct H2TestClient<S: Read + Write> {
    pub stream: S,
    encoder: HpackEncoder<'static>,
    decoder: HpackDecoder<'static>,
}

/// A decoded HTTP/2 response
pub struct H2Response {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl<S: Read + Write> H2TestClient<S> {
    pub fn new(stream: S) -> Self {
        H2TestClient {
            stream,
            encoder: HpackEncoder::new(),
            decoder: HpackDecoder::new(),
        }
    }

    /// Send the connection preface and SETTINGS, ack the server's SETTINGS
    pub fn handshake(&mut self) {
        self.stream.write_all(CONNECTION_PREFACE).unwrap();
        let settings = FrameCodec::encode_settings_frame(&SettingsFrame::new(Settings::new()));
        self.stream.write_all(&settings).unwrap();

        loop {
            let frame = FrameCodec::read_frame(&mut self.stream).expect("server settings");
            match frame.frame_type {
                Some(FrameType::Settings) if !frame.flags.is_ack() => {
                    let ack = FrameCodec::encode_settings_frame(&SettingsFrame::ack());
                    self.stream.write_all(&ack).unwrap();
                    return;
                }
                _ => {}
            }
        }
    }

    /// Send a request on a stream; empty body means END_STREAM on HEADERS
    pub fn send_request(&mut self, stream_id: u32, headers: &[(&str, &str)], body: &[u8]) {
        let tuples: Vec<(&[u8], &[u8])> = headers
            .iter()
            .map(|(n, v)| (n.as_bytes(), v.as_bytes()))
            .collect();
        let mut block = Vec::new();
        self.encoder.encode_into(tuples, &mut block).unwrap();

        let end_stream = body.is_empty();
        let frame = HeadersFrame::new(stream_id, block.into(), end_stream, true);
        self.stream
            .write_all(&FrameCodec::encode_headers_frame(&frame))
            .unwrap();

        if !body.is_empty() {
            let frame = DataFrame::new(stream_id, body.to_vec().into(), true);
            self.stream
                .write_all(&FrameCodec::encode_data_frame(&frame))
                .unwrap();
        }
    }

    /// Send a PING and return the ack payload
    pub fn ping(&mut self, data: [u8; 8]) -> [u8; 8] {
        self.stream
            .write_all(&FrameCodec::encode_ping_frame(&PingFrame::new(data)))
            .unwrap();
        loop {
            let frame = FrameCodec::read_frame(&mut self.stream).expect("ping ack");
            if frame.frame_type == Some(FrameType::Ping) && frame.flags.is_ack() {
                let mut out = [0u8; 8];
                out.copy_from_slice(&frame.payload[..8]);
                return out;
            }
        }
    }

    /// Collect the response for one stream, servicing connection frames
    pub fn recv_response(&mut self, stream_id: u32) -> H2Response {
        let mut response = H2Response {
            status: 0,
            headers: HashMap::new(),
            body: Vec::new(),
        };

        loop {
            let frame = FrameCodec::read_frame(&mut self.stream).expect("response frame");
            match frame.frame_type {
                Some(FrameType::Headers) => {
                    // Every HEADERS block must pass through the decoder to
                    // keep the dynamic table in sync
                    let decoded = self.decoder.decode(&frame.payload).expect("hpack");
                    if frame.stream_id == stream_id {
                        for (name, value) in decoded {
                            let name = String::from_utf8_lossy(&name).to_string();
                            let value = String::from_utf8_lossy(&value).to_string();
                            if name == ":status" {
                                response.status = value.parse().unwrap_or(0);
                            } else {
                                response.headers.insert(name, value);
                            }
                        }
                        if frame.flags.is_end_stream() {
                            return response;
                        }
                    }
                }
                Some(FrameType::Data) => {
                    if frame.stream_id == stream_id {
                        response.body.extend_from_slice(&frame.payload);
                        if frame.flags.is_end_stream() {
                            return response;
                        }
                    }
                }
                Some(FrameType::Settings) if !frame.flags.is_ack() => {
                    let ack = FrameCodec::encode_settings_frame(&SettingsFrame::ack());
                    self.stream.write_all(&ack).unwrap();
                }
                Some(FrameType::Ping) if !frame.flags.is_ack() => {
                    let mut data = [0u8; 8];
                    data.copy_from_slice(&frame.payload[..8]);
                    let ack = FrameCodec::encode_ping_frame(&PingFrame::ack(data));
                    self.stream.write_all(&ack).unwrap();
                }
                Some(FrameType::Goaway) => {
                    panic!(
                        "server sent GOAWAY: {:?}",
                        String::from_utf8_lossy(&frame.payload[8..])
                    );
                }
                Some(FrameType::RstStream) if frame.stream_id == stream_id => {
                    panic!("stream {} was reset", stream_id);
                }
                _ => {}
            }
        }
    }
}

/// Read an HTTP/1.1 message head byte-by-byte up to the blank line,
/// leaving any following bytes (HTTP/2 frames) unread on the socket
pub fn read_message_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).expect("read head");
        assert!(n > 0, "connection closed while reading message head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}
