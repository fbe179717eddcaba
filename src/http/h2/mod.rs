//! HTTP/2 protocol implementation
//!
//! Server-side HTTP/2: frame encoding/decoding with low-level control,
//! HPACK header compression via the `hpack` crate, per-stream state
//! tracking, and flow control at the connection and stream level.
//!
//! The pipeline in [`connection`] consumes bytes fed by the owning worker
//! and runs one of two echo modes: aggregated (per-stream frames collected
//! into a synthetic full request for the shared response builder) or native
//! (frames echoed per stream with no synthetic request object).

pub mod codec;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod settings;
pub mod stream;

pub use connection::{EchoMode, H2Connection, H2ConnectionConfig};
pub use error::{Error, Result};
pub use frames::{DataFrame, FrameFlags, FrameType, HeadersFrame, SettingsFrame};
pub use settings::Settings;
pub use stream::{H2Stream, StreamId, StreamState};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;
