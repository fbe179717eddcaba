//! HTTP/2 settings management
//!
//! SETTINGS frame parameters as defined in RFC 7540 Section 6.5.

use super::error::{Error, Result};

/// HTTP/2 settings parameters (RFC 7540 Section 6.5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SettingsParameter {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1)
    HeaderTableSize = 0x1,
    /// SETTINGS_ENABLE_PUSH (0x2)
    EnablePush = 0x2,
    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3)
    MaxConcurrentStreams = 0x3,
    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4)
    InitialWindowSize = 0x4,
    /// SETTINGS_MAX_FRAME_SIZE (0x5)
    MaxFrameSize = 0x5,
    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6)
    MaxHeaderListSize = 0x6,
}

impl SettingsParameter {
    /// Convert to u16
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// HTTP/2 settings
///
/// `None` means the parameter was not advertised and the RFC default
/// applies.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Header table size (default: 4096)
    pub header_table_size: Option<u32>,
    /// Enable server push (default: true)
    pub enable_push: Option<bool>,
    /// Maximum concurrent streams (default: unlimited)
    pub max_concurrent_streams: Option<u32>,
    /// Initial window size (default: 65535)
    pub initial_window_size: Option<u32>,
    /// Maximum frame size (default: 16384, range: 16384-16777215)
    pub max_frame_size: Option<u32>,
    /// Maximum header list size (default: unlimited)
    pub max_header_list_size: Option<u32>,
}

impl Settings {
    /// Create empty settings
    pub fn new() -> Self {
        Settings::default()
    }

    /// The settings this server advertises
    ///
    /// ENABLE_PUSH stays unset; only clients may send it.
    pub fn server_defaults() -> Self {
        Settings {
            header_table_size: Some(4096),
            enable_push: None,
            max_concurrent_streams: Some(256),
            initial_window_size: Some(super::DEFAULT_INITIAL_WINDOW_SIZE),
            max_frame_size: Some(super::DEFAULT_MAX_FRAME_SIZE),
            max_header_list_size: None,
        }
    }

    /// Get initial window size (with RFC default)
    pub fn get_initial_window_size(&self) -> u32 {
        self.initial_window_size
            .unwrap_or(super::DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Get maximum frame size (with RFC default)
    pub fn get_max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(super::DEFAULT_MAX_FRAME_SIZE)
    }

    /// Parse a SETTINGS frame payload
    ///
    /// Unknown parameters are ignored per RFC 7540 Section 6.5.2.
    pub fn parse_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() % 6 != 0 {
            return Err(Error::FrameSize(format!(
                "SETTINGS payload length {} is not a multiple of 6",
                payload.len()
            )));
        }

        let mut settings = Settings::new();
        let mut pos = 0;
        while pos + 6 <= payload.len() {
            let id = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
            let value = u32::from_be_bytes([
                payload[pos + 2],
                payload[pos + 3],
                payload[pos + 4],
                payload[pos + 5],
            ]);

            match id {
                0x1 => settings.header_table_size = Some(value),
                0x2 => settings.enable_push = Some(value != 0),
                0x3 => settings.max_concurrent_streams = Some(value),
                0x4 => settings.initial_window_size = Some(value),
                0x5 => settings.max_frame_size = Some(value),
                0x6 => settings.max_header_list_size = Some(value),
                _ => {}
            }

            pos += 6;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings values per RFC 7540 Section 6.5.2
    pub fn validate(&self) -> Result<()> {
        if let Some(size) = self.initial_window_size {
            if size > 0x7FFFFFFF {
                return Err(Error::InvalidSettings(format!(
                    "Initial window size {} exceeds 2^31-1",
                    size
                )));
            }
        }

        if let Some(size) = self.max_frame_size {
            if !(16384..=16777215).contains(&size) {
                return Err(Error::InvalidSettings(format!(
                    "Max frame size {} outside [16384, 16777215]",
                    size
                )));
            }
        }

        Ok(())
    }

    /// Merge advertised parameters from `other` into self
    pub fn merge(&mut self, other: &Settings) {
        if other.header_table_size.is_some() {
            self.header_table_size = other.header_table_size;
        }
        if other.enable_push.is_some() {
            self.enable_push = other.enable_push;
        }
        if other.max_concurrent_streams.is_some() {
            self.max_concurrent_streams = other.max_concurrent_streams;
        }
        if other.initial_window_size.is_some() {
            self.initial_window_size = other.initial_window_size;
        }
        if other.max_frame_size.is_some() {
            self.max_frame_size = other.max_frame_size;
        }
        if other.max_header_list_size.is_some() {
            self.max_header_list_size = other.max_header_list_size;
        }
    }
}
