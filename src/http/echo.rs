//! Echo response construction
//!
//! A single pure builder shared by the HTTP/1.1 pipeline and both HTTP/2
//! modes: non-empty request bodies are echoed byte-for-byte; empty bodies
//! get a JSON object of the request headers plus the peer address.
//! Protocol-specific concerns (keep-alive, stream tagging, framing) belong
//! to the calling pipeline, not to the builder.

use super::{Headers, HttpRequest, HttpResponse, Status};
use serde_json::{Map, Value};
use tracing::error;

/// Fixed identifying header carried by every response
pub const OPERATION_ID_HEADER: &str = "operation-id";

/// Value of the identifying header
pub const OPERATION_ID: &str = "getEchoResponse";

/// Reserved extension header carrying the HTTP/2 stream id through the
/// aggregated pipeline, keeping the builder protocol-agnostic
pub const STREAM_ID_HEADER: &str = "x-http2-stream-id";

/// Default response content type when the request carries none
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Options affecting response construction, resolved from the server config
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoOptions {
    /// Pass `Backend-IN-time` / `Jmeter-OUT-time` / `APIC-request-id`
    /// through and stamp `Backend-OUT-time` on the response
    pub timestamp_passthrough: bool,
}

/// Build the echo response for a fully aggregated request
///
/// Never fails for well-formed input: a JSON serialization problem is
/// logged and degrades to an empty JSON object body.
pub fn build_response(request: &HttpRequest, opts: EchoOptions) -> HttpResponse {
    let mut response = HttpResponse::new(Status::OK);

    let body = if request.body().is_empty() {
        header_map_json(request.headers(), request.remote_addr().map(|a| a.to_string()))
            .into_bytes()
    } else {
        request.body().to_vec()
    };

    response.headers_mut().set(OPERATION_ID_HEADER, OPERATION_ID);

    let content_type = request
        .headers()
        .get("Content-Type")
        .unwrap_or(DEFAULT_CONTENT_TYPE);
    response.headers_mut().set("Content-Type", content_type);

    if opts.timestamp_passthrough {
        apply_timestamp_headers(request.headers(), &mut response);
    }

    response
        .headers_mut()
        .set("Content-Length", body.len().to_string());
    response.set_body(body);

    response
}

/// Serialize a header map to the JSON echo body
///
/// Duplicate header names collapse to the last value; the peer address is
/// added under `Remote-address`.
pub fn header_map_json(headers: &Headers, remote_addr: Option<String>) -> String {
    let mut map = Map::new();
    for (name, value) in headers.iter() {
        map.insert(name.to_string(), Value::String(value.to_string()));
    }
    map.insert(
        "Remote-address".to_string(),
        Value::String(remote_addr.unwrap_or_else(|| "unknown".to_string())),
    );

    match serde_json::to_string(&map) {
        Ok(json) => json,
        Err(e) => {
            // Degrade to an empty object; the request must still be answered
            error!(error = %e, "Failed to serialize header map");
            "{}".to_string()
        }
    }
}

fn apply_timestamp_headers(request_headers: &Headers, response: &mut HttpResponse) {
    response
        .headers_mut()
        .set("Backend-OUT-time", chrono::Utc::now().to_rfc3339());

    for name in ["Backend-IN-time", "Jmeter-OUT-time", "APIC-request-id"] {
        if let Some(value) = request_headers.get(name) {
            response.headers_mut().set(name, value.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    fn request_with_body(body: &[u8]) -> HttpRequest {
        HttpRequest::builder()
            .method(Method::Post)
            .uri("/")
            .body(body.to_vec())
            .remote_addr("127.0.0.1".parse().unwrap())
            .build()
    }

    #[test]
    fn test_non_empty_body_is_echoed() {
        let request = request_with_body(b"ping");
        let response = build_response(&request, EchoOptions::default());

        assert_eq!(response.status().code(), 200);
        assert_eq!(response.body(), b"ping");
        assert_eq!(response.headers().get("Content-Length"), Some("4"));
    }

    #[test]
    fn test_empty_body_returns_header_json() {
        let request = HttpRequest::builder()
            .header("X-Test", "abc")
            .header("Host", "localhost")
            .remote_addr("127.0.0.1".parse().unwrap())
            .build();
        let response = build_response(&request, EchoOptions::default());

        let json: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(json["X-Test"], "abc");
        assert_eq!(json["Host"], "localhost");
        assert_eq!(json["Remote-address"], "127.0.0.1");
    }

    #[test]
    fn test_duplicate_header_last_value_wins() {
        let request = HttpRequest::builder()
            .header("X-Dup", "first")
            .header("X-Dup", "second")
            .remote_addr("127.0.0.1".parse().unwrap())
            .build();
        let response = build_response(&request, EchoOptions::default());

        let json: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(json["X-Dup"], "second");
    }

    #[test]
    fn test_content_type_passthrough() {
        let mut request = request_with_body(b"text");
        request.headers_mut().insert("Content-Type", "text/plain");
        let response = build_response(&request, EchoOptions::default());
        assert_eq!(response.headers().get("Content-Type"), Some("text/plain"));
    }

    #[test]
    fn test_content_type_defaults_to_json() {
        let request = request_with_body(b"raw");
        let response = build_response(&request, EchoOptions::default());
        assert_eq!(
            response.headers().get("Content-Type"),
            Some(DEFAULT_CONTENT_TYPE)
        );
    }

    #[test]
    fn test_operation_id_header_present() {
        let request = request_with_body(b"x");
        let response = build_response(&request, EchoOptions::default());
        assert_eq!(
            response.headers().get(OPERATION_ID_HEADER),
            Some(OPERATION_ID)
        );
    }

    #[test]
    fn test_content_length_matches_json_body() {
        let request = HttpRequest::builder()
            .header("A", "1")
            .remote_addr("10.0.0.1".parse().unwrap())
            .build();
        let response = build_response(&request, EchoOptions::default());

        let declared: usize = response
            .headers()
            .get("Content-Length")
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(declared, response.body().len());
    }

    #[test]
    fn test_timestamp_passthrough() {
        let mut request = request_with_body(b"t");
        request.headers_mut().insert("Backend-IN-time", "then");
        request.headers_mut().insert("APIC-request-id", "req-1");

        let opts = EchoOptions {
            timestamp_passthrough: true,
        };
        let response = build_response(&request, opts);

        assert!(response.headers().contains("Backend-OUT-time"));
        assert_eq!(response.headers().get("Backend-IN-time"), Some("then"));
        assert_eq!(response.headers().get("APIC-request-id"), Some("req-1"));
        assert!(!response.headers().contains("Jmeter-OUT-time"));
    }

    #[test]
    fn test_timestamps_off_by_default() {
        let request = request_with_body(b"t");
        let response = build_response(&request, EchoOptions::default());
        assert!(!response.headers().contains("Backend-OUT-time"));
    }
}
