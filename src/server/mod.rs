//! Connection acceptor, worker pool and per-connection state machines
//!
//! A small pool of acceptor threads hands each accepted socket to one of a
//! fixed set of I/O workers; the connection stays on that worker for its
//! whole lifetime. Each worker multiplexes its connections with `poll(2)`
//! and runs their deferred-response timers off the same loop.

pub mod connection;
pub mod delay;
pub mod listener;
pub mod worker;

pub use connection::Connection;
pub use delay::{ConnId, DelayQueue, WriteTask};
pub use listener::EchoServer;

/// Server startup errors; all of these abort before the listen socket opens
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] crate::http::tls::TlsError),
}
