//! echod - protocol-negotiating HTTP echo server
//!
//! This crate implements an HTTP/1.1 and HTTP/2 echo server intended as a
//! load/latency test target. Request bodies are echoed back byte-for-byte;
//! empty-body requests receive a JSON rendering of their headers plus the
//! peer address. A configurable per-response delay simulates backend
//! latency without stalling other connections.

pub mod config;
pub mod http;
pub mod server;
