//! Outbound frame assembly.
//!
//! One large reusable buffer per driver. The first four bytes are a reserved
//! slot for the length prefix: the dispatcher only ever appends past them,
//! and the transport stamps the prefix at flush time with the byte count
//! actually produced (the count includes the prefix itself).
//!
//! The buffer grows on demand when a payload (a catalog blob, a loaded
//! table) exceeds the current capacity, and never shrinks.
//!
//! # Example
//!
//! ```
//! use enginewire::protocol::{Command, FrameBuffer};
//!
//! let mut frame = FrameBuffer::new();
//! frame.begin(Command::Tick);
//! frame.put_u64(1_700_000_000_000);
//! frame.put_u64(42);
//!
//! let bytes = frame.finalize();
//! assert_eq!(&bytes[0..4], &(bytes.len() as u32).to_be_bytes());
//! ```

use bytes::{BufMut, BytesMut};

use super::command::Command;

/// Size of the reserved length-prefix slot.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default buffer capacity (10 MiB), sized for a typical catalog blob.
pub const DEFAULT_FRAME_CAPACITY: usize = 10 * 1024 * 1024;

/// Slack added on top of the needed byte count when growing.
const GROWTH_MARGIN: usize = 100;

/// Reusable buffer in which one outbound frame is assembled in place.
///
/// All appenders write big-endian, matching the wire order regardless of
/// host endianness.
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    /// Create a frame buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FRAME_CAPACITY)
    }

    /// Create a frame buffer with a custom initial capacity.
    ///
    /// Capacities below the prefix slot are rounded up to it.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut buf = BytesMut::with_capacity(capacity.max(LENGTH_PREFIX_SIZE));
        buf.put_bytes(0, LENGTH_PREFIX_SIZE);
        Self { buf }
    }

    /// Reset the buffer to the write position past the prefix slot and
    /// append the command code. Every request starts here.
    pub fn begin(&mut self, command: Command) {
        self.buf.clear();
        self.buf.put_bytes(0, LENGTH_PREFIX_SIZE);
        self.put_u32(command.code());
    }

    /// Make room for `additional` more bytes, growing by copy if needed.
    ///
    /// The new region is sized to what has been written plus the needed
    /// bytes plus a small margin, so a sequence of large appends does not
    /// reallocate per call.
    pub fn ensure_remaining(&mut self, additional: usize) {
        let remaining = self.buf.capacity() - self.buf.len();
        if remaining < additional {
            self.buf.reserve(additional + GROWTH_MARGIN);
        }
    }

    /// Append a single byte.
    #[inline]
    pub fn put_u8(&mut self, value: u8) {
        self.ensure_remaining(1);
        self.buf.put_u8(value);
    }

    /// Append a big-endian u16.
    #[inline]
    pub fn put_u16(&mut self, value: u16) {
        self.ensure_remaining(2);
        self.buf.put_u16(value);
    }

    /// Append a big-endian u32.
    #[inline]
    pub fn put_u32(&mut self, value: u32) {
        self.ensure_remaining(4);
        self.buf.put_u32(value);
    }

    /// Append a big-endian u64.
    #[inline]
    pub fn put_u64(&mut self, value: u64) {
        self.ensure_remaining(8);
        self.buf.put_u64(value);
    }

    /// Append a big-endian i32.
    #[inline]
    pub fn put_i32(&mut self, value: i32) {
        self.ensure_remaining(4);
        self.buf.put_i32(value);
    }

    /// Append a big-endian i64.
    #[inline]
    pub fn put_i64(&mut self, value: i64) {
        self.ensure_remaining(8);
        self.buf.put_i64(value);
    }

    /// Append raw bytes.
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.ensure_remaining(bytes.len());
        self.buf.put_slice(bytes);
    }

    /// Bytes written past the prefix slot (command code + fields).
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.buf.len() - LENGTH_PREFIX_SIZE
    }

    /// Total frame length including the prefix slot.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when no command has been written since the last `begin`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.len() <= LENGTH_PREFIX_SIZE
    }

    /// Current capacity, for growth assertions.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Stamp the length prefix and return the complete frame.
    ///
    /// The prefix counts its own four bytes: `frame[0..4]` always equals
    /// `u32_be(frame.len())`.
    pub fn finalize(&mut self) -> &[u8] {
        let total = self.buf.len() as u32;
        self.buf[..LENGTH_PREFIX_SIZE].copy_from_slice(&total.to_be_bytes());
        &self.buf
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
