//! HTTP/2 flow control
//!
//! Flow control as defined in RFC 7540 Section 5.2, applied at both the
//! connection and stream level. Echoed DATA that exceeds the peer's window
//! queues on the stream until WINDOW_UPDATE credit arrives.

use super::error::{Error, Result};
use super::DEFAULT_INITIAL_WINDOW_SIZE;

/// Flow control window
///
/// Tracks available window for one direction of one scope (connection or
/// stream). The size may go negative when the peer shrinks the initial
/// window via SETTINGS while data is in flight.
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    initial_size: u32,
    current_size: i64,
    max_size: i64,
}

impl FlowControlWindow {
    /// Create a new flow control window with the RFC default size
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Create a new flow control window with a specific initial size
    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            current_size: initial_size as i64,
            max_size: 0x7FFFFFFF,
        }
    }

    /// Get current window size
    pub fn size(&self) -> i64 {
        self.current_size
    }

    /// Consume capacity for sending data
    ///
    /// Returns the amount that can actually be sent (possibly less than
    /// requested, possibly zero).
    pub fn consume(&mut self, amount: usize) -> usize {
        if amount == 0 || self.current_size <= 0 {
            return 0;
        }

        let to_send = std::cmp::min(amount as i64, self.current_size) as usize;
        self.current_size -= to_send as i64;
        to_send
    }

    /// Increase window size (WINDOW_UPDATE)
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        if increment == 0 {
            return Err(Error::FlowControl(
                "Window update increment must be non-zero".to_string(),
            ));
        }

        let new_size = self.current_size + increment as i64;

        // RFC 7540 Section 6.9.1: overflow is a flow control error
        if new_size > self.max_size {
            return Err(Error::FlowControl(format!(
                "Window size {} exceeds maximum (2^31-1)",
                new_size
            )));
        }

        self.current_size = new_size;
        Ok(self.current_size)
    }

    /// Decrease window size (receiving data)
    pub fn decrease(&mut self, amount: usize) {
        self.current_size -= amount as i64;
    }

    /// Update initial window size from SETTINGS, adjusting the current
    /// size by the difference per RFC 7540 Section 6.9.2
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        let diff = new_initial_size as i64 - self.initial_size as i64;
        let new_current = self.current_size + diff;

        if new_current > self.max_size {
            return Err(Error::FlowControl(format!(
                "New window size {} exceeds maximum (2^31-1)",
                new_current
            )));
        }

        self.initial_size = new_initial_size;
        self.current_size = new_current;
        Ok(())
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection-level flow control (send and receive directions)
#[derive(Debug)]
pub struct ConnectionFlowControl {
    send_window: FlowControlWindow,
    recv_window: FlowControlWindow,
}

impl ConnectionFlowControl {
    /// Create new connection-level flow control with RFC defaults
    pub fn new() -> Self {
        ConnectionFlowControl {
            send_window: FlowControlWindow::new(),
            recv_window: FlowControlWindow::new(),
        }
    }

    /// Get mutable send window
    pub fn send_window_mut(&mut self) -> &mut FlowControlWindow {
        &mut self.send_window
    }

    /// Consume send window for outbound data
    pub fn consume_send_window(&mut self, amount: usize) -> usize {
        self.send_window.consume(amount)
    }

    /// Increase send window from a received WINDOW_UPDATE
    pub fn increase_send_window(&mut self, increment: u32) -> Result<i64> {
        self.send_window.increase(increment)
    }

    /// Account for received data
    pub fn consume_recv_window(&mut self, amount: usize) {
        self.recv_window.decrease(amount);
    }

    /// Restore receive window after re-crediting the peer
    pub fn restore_recv_window(&mut self, amount: u32) -> Result<i64> {
        self.recv_window.increase(amount)
    }
}

impl Default for ConnectionFlowControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream-level flow control
#[derive(Debug, Clone)]
pub struct StreamFlowControl {
    send_window: FlowControlWindow,
    recv_window: FlowControlWindow,
}

impl StreamFlowControl {
    /// Create stream flow control with RFC default windows
    pub fn new() -> Self {
        StreamFlowControl {
            send_window: FlowControlWindow::new(),
            recv_window: FlowControlWindow::new(),
        }
    }

    /// Create stream flow control with a specific send window (the peer's
    /// advertised initial window size)
    pub fn with_send_window(send_size: u32) -> Self {
        StreamFlowControl {
            send_window: FlowControlWindow::with_initial_size(send_size),
            recv_window: FlowControlWindow::new(),
        }
    }

    /// Get mutable send window
    pub fn send_window_mut(&mut self) -> &mut FlowControlWindow {
        &mut self.send_window
    }

    /// Consume send window for outbound data
    pub fn consume_send_window(&mut self, amount: usize) -> usize {
        self.send_window.consume(amount)
    }

    /// Increase send window from a received WINDOW_UPDATE
    pub fn increase_send_window(&mut self, increment: u32) -> Result<i64> {
        self.send_window.increase(increment)
    }

    /// Account for received data
    pub fn consume_recv_window(&mut self, amount: usize) {
        self.recv_window.decrease(amount);
    }

    /// Restore receive window after re-crediting the peer
    pub fn restore_recv_window(&mut self, amount: u32) -> Result<i64> {
        self.recv_window.increase(amount)
    }
}

impl Default for StreamFlowControl {
    fn default() -> Self {
        Self::new()
    }
}
