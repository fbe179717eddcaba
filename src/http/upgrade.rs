//! Cleartext HTTP/1.1 to HTTP/2 upgrade negotiation (h2c)
//!
//! Used only when HTTP/2 is enabled without TLS. The first HTTP/1.1 request
//! on a connection is inspected once: a well-formed upgrade switches the
//! connection to HTTP/2 framing before any request is dispatched, and the
//! upgrade request itself becomes stream 1. Anything else leaves the
//! connection on HTTP/1.1 for its whole lifetime; the protocol decision is
//! single-shot either way.

use super::{Error, HttpRequest, Result, CRLF};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Upgrade token for cleartext HTTP/2 (RFC 7540 Section 3.2)
pub const H2C: &str = "h2c";

/// Header carrying the client's base64url-encoded SETTINGS payload
pub const HTTP2_SETTINGS_HEADER: &str = "HTTP2-Settings";

/// Outcome of inspecting the first request on a cleartext connection
#[derive(Debug, PartialEq, Eq)]
pub enum UpgradeDecision {
    /// Switch to HTTP/2; the inspected request becomes stream 1
    Upgrade,
    /// No upgrade requested; stay on HTTP/1.1 for the connection lifetime
    NotRequested,
}

/// Inspect a request for an h2c upgrade
///
/// A request that asks for the upgrade but is malformed (missing or
/// undecodable `HTTP2-Settings`) is a negotiation error and must close
/// the connection.
pub fn check_h2c_upgrade(request: &HttpRequest) -> Result<UpgradeDecision> {
    if !request.headers().contains_token("Upgrade", H2C) {
        return Ok(UpgradeDecision::NotRequested);
    }

    if !request.headers().contains_token("Connection", "Upgrade") {
        return Err(Error::Protocol(
            "Upgrade header without Connection: Upgrade".to_string(),
        ));
    }

    let token = request
        .headers()
        .get(HTTP2_SETTINGS_HEADER)
        .ok_or_else(|| Error::Protocol("h2c upgrade without HTTP2-Settings".to_string()))?;

    // The decoded payload is a SETTINGS frame body: 6-byte units. The
    // server's own SETTINGS exchange follows immediately, so the values
    // themselves are not applied here.
    let decoded = URL_SAFE_NO_PAD
        .decode(token.trim())
        .map_err(|e| Error::Protocol(format!("Undecodable HTTP2-Settings: {}", e)))?;
    if decoded.len() % 6 != 0 {
        return Err(Error::Protocol(format!(
            "HTTP2-Settings payload length {} is not a multiple of 6",
            decoded.len()
        )));
    }

    Ok(UpgradeDecision::Upgrade)
}

/// The 101 response that commits the connection to HTTP/2 framing
pub fn switching_protocols_response() -> Vec<u8> {
    let mut wire = Vec::new();
    wire.extend_from_slice(b"HTTP/1.1 101 Switching Protocols");
    wire.extend_from_slice(CRLF.as_bytes());
    wire.extend_from_slice(b"Connection: Upgrade");
    wire.extend_from_slice(CRLF.as_bytes());
    wire.extend_from_slice(b"Upgrade: h2c");
    wire.extend_from_slice(CRLF.as_bytes());
    wire.extend_from_slice(CRLF.as_bytes());
    wire
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    fn upgrade_request(settings_token: Option<&str>) -> HttpRequest {
        let mut builder = HttpRequest::builder()
            .method(Method::Get)
            .uri("/")
            .header("Host", "localhost")
            .header("Connection", "Upgrade, HTTP2-Settings")
            .header("Upgrade", "h2c");
        if let Some(token) = settings_token {
            builder = builder.header(HTTP2_SETTINGS_HEADER, token);
        }
        builder.build()
    }

    fn valid_token() -> String {
        // One setting: SETTINGS_INITIAL_WINDOW_SIZE = 65535
        URL_SAFE_NO_PAD.encode([0x00, 0x04, 0x00, 0x00, 0xFF, 0xFF])
    }

    #[test]
    fn test_well_formed_upgrade() {
        let request = upgrade_request(Some(&valid_token()));
        assert_eq!(
            check_h2c_upgrade(&request).unwrap(),
            UpgradeDecision::Upgrade
        );
    }

    #[test]
    fn test_plain_request_is_not_an_upgrade() {
        let request = HttpRequest::builder()
            .method(Method::Get)
            .uri("/")
            .header("Host", "localhost")
            .build();
        assert_eq!(
            check_h2c_upgrade(&request).unwrap(),
            UpgradeDecision::NotRequested
        );
    }

    #[test]
    fn test_other_upgrade_token_ignored() {
        let request = HttpRequest::builder()
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .build();
        assert_eq!(
            check_h2c_upgrade(&request).unwrap(),
            UpgradeDecision::NotRequested
        );
    }

    #[test]
    fn test_missing_settings_is_malformed() {
        let request = upgrade_request(None);
        assert!(check_h2c_upgrade(&request).is_err());
    }

    #[test]
    fn test_undecodable_settings_is_malformed() {
        let request = upgrade_request(Some("!!!not-base64!!!"));
        assert!(check_h2c_upgrade(&request).is_err());
    }

    #[test]
    fn test_bad_settings_length_is_malformed() {
        let token = URL_SAFE_NO_PAD.encode([0x00, 0x04, 0x00]);
        let request = upgrade_request(Some(&token));
        assert!(check_h2c_upgrade(&request).is_err());
    }

    #[test]
    fn test_missing_connection_header_is_malformed() {
        let request = HttpRequest::builder()
            .header("Upgrade", "h2c")
            .header(HTTP2_SETTINGS_HEADER, valid_token())
            .build();
        assert!(check_h2c_upgrade(&request).is_err());
    }

    #[test]
    fn test_switching_protocols_wire_format() {
        let wire = switching_protocols_response();
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Upgrade: h2c\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
