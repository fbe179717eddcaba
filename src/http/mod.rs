//! HTTP/1.1 layer
//!
//! Message types, header handling, incremental request parsing and the echo
//! response builder. The HTTP/2 layer lives in [`h2`]; both protocols share
//! the response builder in [`echo`].
//!
//! # Architecture
//!
//! The transport seam is the [`SessionOps`] trait: plain TCP and TLS
//! sessions implement the same poll/read/write/close operations, so the
//! framing code is transparent to the underlying transport. Each worker
//! multiplexes many sessions through `poll(2)` on their raw descriptors.

pub mod chunked;
pub mod echo;
pub mod h2;
pub mod headers;
pub mod message;
pub mod parser;
pub mod session;
pub mod tls;
pub mod upgrade;

pub use headers::Headers;
pub use message::{HttpRequest, HttpResponse, Method, Status, Version};
pub use parser::{RequestParser, ResponseParser};
pub use session::{FdSessionOps, SessionOps};

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Payload larger than {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Incomplete message")]
    Incomplete,

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Maximum number of headers per message
pub const MAX_HEADERS: usize = 64;

/// CRLF line ending
pub const CRLF: &str = "\r\n";
