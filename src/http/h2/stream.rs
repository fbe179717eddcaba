//! HTTP/2 stream management
//!
//! Server-side stream state per RFC 7540 Section 5.1. Each stream
//! accumulates its request (headers and, in aggregated mode, body) and
//! carries the send-side bookkeeping for its response: whether response
//! headers went out and any DATA still waiting on flow-control credit.

use super::error::{Error, Result};
use super::flow_control::StreamFlowControl;
use crate::http::Headers;
use bytes::Bytes;
use std::collections::HashMap;
use std::collections::VecDeque;

/// Stream ID type
pub type StreamId = u32;

/// Stream state as defined in RFC 7540 Section 5.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No frames have been sent/received
    Idle,
    /// Both sides can send frames
    Open,
    /// We can't send, they can
    HalfClosedLocal,
    /// They can't send, we can
    HalfClosedRemote,
    /// Stream is closed
    Closed,
}

impl StreamState {
    /// Check if the stream can still receive data
    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Check if the stream can still send data
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Check if the stream is closed
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// HTTP/2 stream
#[derive(Debug)]
pub struct H2Stream {
    id: StreamId,
    state: StreamState,
    flow_control: StreamFlowControl,
    /// Request method pseudo-header
    pub method: Option<String>,
    /// Request path pseudo-header
    pub path: Option<String>,
    /// Regular request headers
    pub headers: Headers,
    /// Aggregated request body
    body: Vec<u8>,
    headers_complete: bool,
    stream_complete: bool,
    /// Whether response headers have been written (native mode streaming)
    pub response_headers_sent: bool,
    /// Response DATA waiting on flow-control credit
    pending_send: VecDeque<Bytes>,
    /// Whether the queued response data ends the stream once drained
    pending_end_stream: bool,
}

impl H2Stream {
    /// Create a new stream with the peer's advertised send window
    pub fn new(id: StreamId, send_window: u32) -> Self {
        H2Stream {
            id,
            state: StreamState::Idle,
            flow_control: StreamFlowControl::with_send_window(send_window),
            method: None,
            path: None,
            headers: Headers::new(),
            body: Vec::new(),
            headers_complete: false,
            stream_complete: false,
            response_headers_sent: false,
            pending_send: VecDeque::new(),
            pending_end_stream: false,
        }
    }

    /// Get stream ID
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Get stream state
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Get flow control
    pub fn flow_control_mut(&mut self) -> &mut StreamFlowControl {
        &mut self.flow_control
    }

    /// Whether END_HEADERS has been received
    pub fn headers_complete(&self) -> bool {
        self.headers_complete
    }

    /// Whether END_STREAM has been received
    pub fn stream_complete(&self) -> bool {
        self.stream_complete
    }

    /// Aggregated request body so far
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Take the aggregated body
    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    /// Record an incoming HEADERS frame (already HPACK-decoded by the
    /// connection) and advance the state machine
    pub fn receive_headers(&mut self, end_stream: bool, end_headers: bool) -> Result<()> {
        match self.state {
            StreamState::Idle => {
                self.state = if end_stream {
                    StreamState::HalfClosedRemote
                } else {
                    StreamState::Open
                };
            }
            StreamState::Open | StreamState::HalfClosedLocal => {
                // Trailers
                if end_stream {
                    self.state = match self.state {
                        StreamState::HalfClosedLocal => StreamState::Closed,
                        _ => StreamState::HalfClosedRemote,
                    };
                }
            }
            _ => {
                return Err(Error::Protocol(format!(
                    "Cannot receive HEADERS in state {:?}",
                    self.state
                )));
            }
        }

        if end_headers {
            self.headers_complete = true;
        }
        if end_stream {
            self.stream_complete = true;
        }

        Ok(())
    }

    /// Accumulate an incoming DATA frame and advance the state machine
    pub fn receive_data(&mut self, data: &[u8], end_stream: bool) -> Result<()> {
        if !self.state.can_receive() {
            return Err(Error::StreamClosed(self.id));
        }

        self.body.extend_from_slice(data);

        if end_stream {
            self.stream_complete = true;
            self.state = match self.state {
                StreamState::Open => StreamState::HalfClosedRemote,
                StreamState::HalfClosedLocal => StreamState::Closed,
                _ => self.state,
            };
        }

        Ok(())
    }

    /// Advance the state machine for sending response HEADERS
    pub fn send_headers(&mut self, end_stream: bool) -> Result<()> {
        match self.state {
            StreamState::Idle => {
                self.state = if end_stream {
                    StreamState::HalfClosedLocal
                } else {
                    StreamState::Open
                };
            }
            StreamState::Open | StreamState::HalfClosedRemote => {
                if end_stream {
                    self.state = match self.state {
                        StreamState::HalfClosedRemote => StreamState::Closed,
                        _ => StreamState::HalfClosedLocal,
                    };
                }
            }
            _ => {
                return Err(Error::Protocol(format!(
                    "Cannot send HEADERS in state {:?}",
                    self.state
                )));
            }
        }
        self.response_headers_sent = true;
        Ok(())
    }

    /// Advance the state machine after the final response DATA went out
    pub fn finish_sending(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    /// Queue response data that exceeded the flow-control window
    pub fn queue_pending(&mut self, data: Bytes, end_stream: bool) {
        if !data.is_empty() {
            self.pending_send.push_back(data);
        }
        self.pending_end_stream = self.pending_end_stream || end_stream;
    }

    /// Whether response data is waiting on window credit
    pub fn has_pending_send(&self) -> bool {
        !self.pending_send.is_empty() || self.pending_end_stream
    }

    /// Pop up to `max` bytes of queued response data
    pub fn pop_pending(&mut self, max: usize) -> Option<Bytes> {
        let mut front = self.pending_send.pop_front()?;
        if front.len() > max {
            let rest = front.split_off(max);
            self.pending_send.push_front(rest);
        }
        Some(front)
    }

    /// Whether the stream ends once the pending queue drains
    pub fn pending_ends_stream(&self) -> bool {
        self.pending_end_stream && self.pending_send.is_empty()
    }

    /// Clear the end-of-stream marker after it has been sent
    pub fn clear_pending_end(&mut self) {
        self.pending_end_stream = false;
    }

    /// Close the stream
    pub fn close(&mut self) {
        self.state = StreamState::Closed;
        self.pending_send.clear();
        self.pending_end_stream = false;
    }
}

/// Stream manager for a server connection
///
/// Client-initiated streams carry odd identifiers; the echo server never
/// initiates streams of its own.
#[derive(Debug)]
pub struct StreamManager {
    streams: HashMap<StreamId, H2Stream>,
    /// Highest client stream id seen, reported in GOAWAY
    highest_remote_id: StreamId,
    /// Send window applied to newly created streams
    initial_send_window: u32,
}

impl StreamManager {
    /// Create a new stream manager
    pub fn new() -> Self {
        StreamManager {
            streams: HashMap::new(),
            highest_remote_id: 0,
            initial_send_window: super::DEFAULT_INITIAL_WINDOW_SIZE,
        }
    }

    /// Set the send window applied to new streams (peer SETTINGS)
    pub fn set_initial_send_window(&mut self, size: u32) {
        self.initial_send_window = size;
    }

    /// Highest client-initiated stream id seen
    pub fn highest_remote_id(&self) -> StreamId {
        self.highest_remote_id
    }

    /// Get a mutable stream by ID
    pub fn get_mut(&mut self, stream_id: StreamId) -> Option<&mut H2Stream> {
        self.streams.get_mut(&stream_id)
    }

    /// Get or create the stream for an incoming client frame
    ///
    /// Client-initiated stream ids must be odd.
    pub fn get_or_create(&mut self, stream_id: StreamId) -> Result<&mut H2Stream> {
        if stream_id == 0 || stream_id % 2 == 0 {
            return Err(Error::Protocol(format!(
                "Invalid client stream id {}",
                stream_id
            )));
        }

        if !self.streams.contains_key(&stream_id) {
            if stream_id > self.highest_remote_id {
                self.highest_remote_id = stream_id;
            }
            self.streams
                .insert(stream_id, H2Stream::new(stream_id, self.initial_send_window));
        }

        Ok(self.streams.get_mut(&stream_id).expect("just inserted"))
    }

    /// Insert a stream created outside the frame path (h2c upgrade stream 1)
    pub fn insert(&mut self, stream: H2Stream) {
        if stream.id() > self.highest_remote_id {
            self.highest_remote_id = stream.id();
        }
        self.streams.insert(stream.id(), stream);
    }

    /// Streams with response data queued on flow control, in id order
    pub fn ids_with_pending_send(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self
            .streams
            .values()
            .filter(|s| s.has_pending_send())
            .map(|s| s.id())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Apply a changed initial window size to every live stream
    pub fn update_send_windows(&mut self, new_size: u32) -> Result<()> {
        for stream in self.streams.values_mut() {
            stream
                .flow_control_mut()
                .send_window_mut()
                .update_initial_size(new_size)?;
        }
        self.initial_send_window = new_size;
        Ok(())
    }

    /// Drop streams that have fully closed
    pub fn cleanup_closed(&mut self) {
        self.streams.retain(|_, stream| !stream.state().is_closed());
    }

    /// Number of live streams
    pub fn active_count(&self) -> usize {
        self.streams
            .values()
            .filter(|s| !s.state().is_closed())
            .count()
    }
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_request_lifecycle() {
        let mut stream = H2Stream::new(1, 65535);
        assert_eq!(stream.state(), StreamState::Idle);

        stream.receive_headers(false, true).unwrap();
        assert_eq!(stream.state(), StreamState::Open);
        assert!(stream.headers_complete());
        assert!(!stream.stream_complete());

        stream.receive_data(b"body ", false).unwrap();
        stream.receive_data(b"data", true).unwrap();
        assert_eq!(stream.body(), b"body data");
        assert!(stream.stream_complete());
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
    }

    #[test]
    fn test_stream_response_closes() {
        let mut stream = H2Stream::new(1, 65535);
        stream.receive_headers(true, true).unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);

        stream.send_headers(false).unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);

        stream.finish_sending();
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn test_headers_only_response_closes() {
        let mut stream = H2Stream::new(1, 65535);
        stream.receive_headers(true, true).unwrap();
        stream.send_headers(true).unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn test_receive_after_end_stream_fails() {
        let mut stream = H2Stream::new(1, 65535);
        stream.receive_headers(true, true).unwrap();
        assert!(stream.receive_data(b"late", false).is_err());
    }

    #[test]
    fn test_pending_send_queue() {
        let mut stream = H2Stream::new(1, 65535);
        stream.queue_pending(Bytes::from_static(b"0123456789"), true);
        assert!(stream.has_pending_send());

        let first = stream.pop_pending(4).unwrap();
        assert_eq!(&first[..], b"0123");
        assert!(!stream.pending_ends_stream());

        let rest = stream.pop_pending(100).unwrap();
        assert_eq!(&rest[..], b"456789");
        assert!(stream.pending_ends_stream());

        stream.clear_pending_end();
        assert!(!stream.has_pending_send());
    }

    #[test]
    fn test_manager_rejects_even_ids() {
        let mut manager = StreamManager::new();
        assert!(manager.get_or_create(2).is_err());
        assert!(manager.get_or_create(0).is_err());
        assert!(manager.get_or_create(1).is_ok());
    }

    #[test]
    fn test_manager_tracks_highest_id() {
        let mut manager = StreamManager::new();
        manager.get_or_create(1).unwrap();
        manager.get_or_create(5).unwrap();
        manager.get_or_create(3).unwrap();
        assert_eq!(manager.highest_remote_id(), 5);
    }

    #[test]
    fn test_manager_cleanup() {
        let mut manager = StreamManager::new();
        manager.get_or_create(1).unwrap();
        manager.get_or_create(3).unwrap();
        manager.get_mut(1).unwrap().close();

        assert_eq!(manager.active_count(), 1);
        manager.cleanup_closed();
        assert!(manager.get_mut(1).is_none());
        assert!(manager.get_mut(3).is_some());
    }
}
