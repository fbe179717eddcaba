//! TLS support for the server
//!
//! Builds the process-wide server TLS context from either a PKCS#12
//! keystore or an in-process generated self-signed certificate, negotiates
//! ALPN when HTTP/2 is enabled, and exposes the encrypted transport through
//! the same [`SessionOps`](crate::http::SessionOps) seam the plain
//! transport uses.
//!
//! Context construction errors are startup-fatal: the process must never
//! begin listening with a broken certificate configuration. Handshake
//! errors at accept time are fatal only for that connection.

pub mod cert;
pub mod config;
pub mod session;

pub use config::{TlsContext, TlsError};
pub use session::TlsSessionOps;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;

/// ALPN protocol identifier for HTTP/2
pub const ALPN_H2: &str = "h2";

/// ALPN protocol identifier for HTTP/1.1
pub const ALPN_HTTP11: &str = "http/1.1";
