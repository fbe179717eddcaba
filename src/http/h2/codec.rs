//! HTTP/2 frame encoding and decoding
//!
//! Low-level frame construction plus an incremental [`FrameReader`] for the
//! event-driven server: the worker feeds whatever bytes arrived and the
//! reader yields complete frames without ever blocking on a partial one.

use super::error::{Error, Result};
use super::frames::*;
use super::settings::SettingsParameter;
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, Read};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Hard upper bound on any frame payload (2^24 - 1)
pub const MAX_FRAME_SIZE: usize = 0x00FFFFFF;

/// A decoded frame header plus its payload
///
/// `frame_type` is `None` for extension frame types, which receivers must
/// ignore per RFC 7540 Section 4.1.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub frame_type: Option<FrameType>,
    pub flags: FrameFlags,
    pub stream_id: u32,
    pub payload: Bytes,
}

/// Frame codec: stateless encode/decode helpers
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame header
    pub fn encode_header(
        frame_type: FrameType,
        flags: FrameFlags,
        stream_id: u32,
        length: usize,
    ) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;

        // Type (8 bits)
        header[3] = frame_type.as_u8();

        // Flags (8 bits)
        header[4] = flags.as_u8();

        // Stream ID (31 bits, big-endian, reserved bit is 0)
        let stream_id = stream_id & 0x7FFFFFFF;
        header[5] = ((stream_id >> 24) & 0xFF) as u8;
        header[6] = ((stream_id >> 16) & 0xFF) as u8;
        header[7] = ((stream_id >> 8) & 0xFF) as u8;
        header[8] = (stream_id & 0xFF) as u8;

        header
    }

    /// Decode a frame header
    ///
    /// Returns (raw type byte, flags, stream id, payload length).
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> (u8, FrameFlags, u32, usize) {
        let length =
            ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);

        let type_byte = bytes[3];
        let flags = FrameFlags::from_u8(bytes[4]);

        // Stream ID (31 bits, reserved bit masked off)
        let stream_id = ((bytes[5] as u32 & 0x7F) << 24)
            | ((bytes[6] as u32) << 16)
            | ((bytes[7] as u32) << 8)
            | (bytes[8] as u32);

        (type_byte, flags, stream_id, length)
    }

    /// Encode a DATA frame
    pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.data.len());

        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }

        let header =
            Self::encode_header(FrameType::Data, flags, frame.stream_id, frame.data.len());
        buf.put_slice(&header);
        buf.put_slice(&frame.data);

        buf.freeze()
    }

    /// Encode a HEADERS frame
    pub fn encode_headers_frame(frame: &HeadersFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.header_block.len());

        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }

        let header = Self::encode_header(
            FrameType::Headers,
            flags,
            frame.stream_id,
            frame.header_block.len(),
        );
        buf.put_slice(&header);
        buf.put_slice(&frame.header_block);

        buf.freeze()
    }

    /// Encode a SETTINGS frame
    pub fn encode_settings_frame(frame: &SettingsFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        // Each advertised setting is 6 bytes (2 byte id + 4 byte value)
        let mut settings_data = BytesMut::new();
        if !frame.ack {
            let settings = &frame.settings;

            if let Some(val) = settings.header_table_size {
                settings_data.put_u16(SettingsParameter::HeaderTableSize.as_u16());
                settings_data.put_u32(val);
            }
            if let Some(val) = settings.enable_push {
                settings_data.put_u16(SettingsParameter::EnablePush.as_u16());
                settings_data.put_u32(if val { 1 } else { 0 });
            }
            if let Some(val) = settings.max_concurrent_streams {
                settings_data.put_u16(SettingsParameter::MaxConcurrentStreams.as_u16());
                settings_data.put_u32(val);
            }
            if let Some(val) = settings.initial_window_size {
                settings_data.put_u16(SettingsParameter::InitialWindowSize.as_u16());
                settings_data.put_u32(val);
            }
            if let Some(val) = settings.max_frame_size {
                settings_data.put_u16(SettingsParameter::MaxFrameSize.as_u16());
                settings_data.put_u32(val);
            }
            if let Some(val) = settings.max_header_list_size {
                settings_data.put_u16(SettingsParameter::MaxHeaderListSize.as_u16());
                settings_data.put_u32(val);
            }
        }

        // Stream ID must be 0 for SETTINGS
        let header =
            Self::encode_header(FrameType::Settings, flags, 0, settings_data.len());
        buf.put_slice(&header);
        buf.put_slice(&settings_data);

        buf.freeze()
    }

    /// Encode a PING frame
    pub fn encode_ping_frame(frame: &PingFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);

        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        let header = Self::encode_header(FrameType::Ping, flags, 0, 8);
        buf.put_slice(&header);
        buf.put_slice(&frame.data);

        buf.freeze()
    }

    /// Encode a GOAWAY frame
    pub fn encode_goaway_frame(frame: &GoawayFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let payload_len = 8 + frame.debug_data.len();
        let header = Self::encode_header(FrameType::Goaway, FrameFlags::empty(), 0, payload_len);
        buf.put_slice(&header);

        buf.put_u32(frame.last_stream_id & 0x7FFFFFFF);
        buf.put_u32(frame.error_code.as_u32());
        buf.put_slice(&frame.debug_data);

        buf.freeze()
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update_frame(frame: &WindowUpdateFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);

        let header = Self::encode_header(
            FrameType::WindowUpdate,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        );
        buf.put_slice(&header);
        buf.put_u32(frame.size_increment & 0x7FFFFFFF);

        buf.freeze()
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream_frame(frame: &RstStreamFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);

        let header = Self::encode_header(
            FrameType::RstStream,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        );
        buf.put_slice(&header);
        buf.put_u32(frame.error_code.as_u32());

        buf.freeze()
    }

    /// Read one complete frame from a blocking reader
    ///
    /// Used by test clients; the server itself uses [`FrameReader`].
    pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<RawFrame> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        reader.read_exact(&mut header)?;

        let (type_byte, flags, stream_id, payload_len) = Self::decode_header(&header);

        if payload_len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Frame payload too large: {}", payload_len),
            ));
        }

        let mut payload = vec![0u8; payload_len];
        if payload_len > 0 {
            reader.read_exact(&mut payload)?;
        }

        Ok(RawFrame {
            frame_type: FrameType::from_u8(type_byte),
            flags,
            stream_id,
            payload: Bytes::from(payload),
        })
    }
}

/// Incremental frame reader
///
/// Buffers bytes as they arrive and yields complete frames. Also used to
/// recognize and consume the client connection preface.
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    /// Create a new frame reader
    pub fn new() -> Self {
        FrameReader {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Append received bytes
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Consume `n` buffered bytes (preface handling)
    pub fn consume(&mut self, n: usize) {
        let _ = self.buf.split_to(n);
    }

    /// Yield the next complete frame, if one is buffered
    ///
    /// `max_frame_size` is the size this endpoint advertised; larger
    /// payloads are a frame size error.
    pub fn next_frame(&mut self, max_frame_size: usize) -> Result<Option<RawFrame>> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&self.buf[..FRAME_HEADER_SIZE]);
        let (type_byte, flags, stream_id, payload_len) = FrameCodec::decode_header(&header);

        if payload_len > max_frame_size.min(MAX_FRAME_SIZE) {
            return Err(Error::FrameSize(format!(
                "Frame payload {} exceeds limit {}",
                payload_len, max_frame_size
            )));
        }

        if self.buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        let _ = self.buf.split_to(FRAME_HEADER_SIZE);
        let payload = self.buf.split_to(payload_len).freeze();

        Ok(Some(RawFrame {
            frame_type: FrameType::from_u8(type_byte),
            flags,
            stream_id,
            payload,
        }))
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip padding from a DATA frame payload
pub fn strip_data_payload(flags: FrameFlags, payload: &Bytes) -> Result<Bytes> {
    if !flags.is_padded() {
        return Ok(payload.clone());
    }
    if payload.is_empty() {
        return Err(Error::Protocol("Padded DATA frame with no pad length".into()));
    }
    let pad_len = payload[0] as usize;
    if 1 + pad_len > payload.len() {
        return Err(Error::Protocol("Padding exceeds DATA payload".into()));
    }
    Ok(payload.slice(1..payload.len() - pad_len))
}

/// Strip padding and priority fields from a HEADERS frame payload,
/// leaving just the header block fragment
pub fn strip_headers_payload(flags: FrameFlags, payload: &Bytes) -> Result<Bytes> {
    let mut start = 0;
    let mut end = payload.len();

    if flags.is_padded() {
        if payload.is_empty() {
            return Err(Error::Protocol("Padded HEADERS frame with no pad length".into()));
        }
        let pad_len = payload[0] as usize;
        start += 1;
        if start + pad_len > end {
            return Err(Error::Protocol("Padding exceeds HEADERS payload".into()));
        }
        end -= pad_len;
    }

    if flags.is_priority() {
        // Stream dependency (4) + weight (1)
        if start + 5 > end {
            return Err(Error::Protocol("Truncated priority fields in HEADERS".into()));
        }
        start += 5;
    }

    Ok(payload.slice(start..end))
}
