//! TLS and ALPN integration tests

mod common;

use common::{start_server, H2TestClient, ResponseReader};
use echod::config::ServerConfig;
use openssl::ssl::{SslConnector, SslMethod, SslStream, SslVerifyMode};
use std::io::Write;
use std::net::{SocketAddr, TcpStream};

fn tls_config(http2: bool) -> ServerConfig {
    ServerConfig {
        ssl: true,
        http2,
        ..ServerConfig::default()
    }
}

fn tls_connect(addr: SocketAddr, alpn: Option<&[u8]>) -> SslStream<TcpStream> {
    let mut builder = SslConnector::builder(SslMethod::tls_client()).unwrap();
    builder.set_verify(SslVerifyMode::NONE);
    if let Some(protos) = alpn {
        builder.set_alpn_protos(protos).unwrap();
    }
    let connector = builder.build();
    let tcp = TcpStream::connect(addr).unwrap();
    connector.connect("localhost", tcp).unwrap()
}

#[test]
fn test_alpn_negotiates_h2() {
    let addr = start_server(tls_config(true));
    // Offer h2 then http/1.1, length-prefixed
    let stream = tls_connect(addr, Some(b"\x02h2\x08http/1.1"));
    assert_eq!(stream.ssl().selected_alpn_protocol(), Some(&b"h2"[..]));

    let mut client = H2TestClient::new(stream);
    client.handshake();
    client.send_request(
        1,
        &[
            (":method", "POST"),
            (":path", "/echo"),
            (":scheme", "https"),
            (":authority", "localhost"),
        ],
        b"ping",
    );
    let response = client.recv_response(1);

    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"ping");
    assert_eq!(
        response.headers.get("x-http2-stream-id").map(String::as_str),
        Some("1")
    );
}

#[test]
fn test_client_without_alpn_gets_http11() {
    let addr = start_server(tls_config(true));
    let mut stream = tls_connect(addr, None);
    assert_eq!(stream.ssl().selected_alpn_protocol(), None);

    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 3\r\n\r\ntls")
        .unwrap();
    let response = ResponseReader::new().read_response(&mut stream);
    assert_eq!(response.status().code(), 200);
    assert_eq!(response.body(), b"tls");
}

#[test]
fn test_client_preferring_http11_gets_http11() {
    let addr = start_server(tls_config(true));
    let mut stream = tls_connect(addr, Some(b"\x08http/1.1"));
    assert_eq!(
        stream.ssl().selected_alpn_protocol(),
        Some(&b"http/1.1"[..])
    );

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nX-Tls: yes\r\n\r\n")
        .unwrap();
    let response = ResponseReader::new().read_response(&mut stream);

    let json: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(json["X-Tls"], "yes");
    assert_eq!(json["Remote-address"], "127.0.0.1");
}

#[test]
fn test_tls_http11_only_mode() {
    let addr = start_server(tls_config(false));
    let mut stream = tls_connect(addr, None);

    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 6\r\n\r\nsecure")
        .unwrap();
    let response = ResponseReader::new().read_response(&mut stream);
    assert_eq!(response.body(), b"secure");
}

#[test]
fn test_tls_keep_alive() {
    let addr = start_server(tls_config(false));
    let mut stream = tls_connect(addr, None);
    let mut reader = ResponseReader::new();

    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 1\r\n\r\nA")
        .unwrap();
    let first = reader.read_response(&mut stream);
    assert_eq!(first.body(), b"A");

    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 1\r\n\r\nB")
        .unwrap();
    let second = reader.read_response(&mut stream);
    assert_eq!(second.body(), b"B");
}

#[test]
fn test_h2_native_mode_over_tls() {
    let config = ServerConfig {
        ssl: true,
        http2: true,
        h2_aggregate_content: false,
        ..ServerConfig::default()
    };
    let addr = start_server(config);
    let stream = tls_connect(addr, Some(b"\x02h2"));
    assert_eq!(stream.ssl().selected_alpn_protocol(), Some(&b"h2"[..]));

    let mut client = H2TestClient::new(stream);
    client.handshake();
    client.send_request(
        1,
        &[
            (":method", "POST"),
            (":path", "/"),
            (":scheme", "https"),
            (":authority", "localhost"),
        ],
        b"over-tls",
    );
    let response = client.recv_response(1);
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"over-tls");
}
