//! Blocking stream transport to the engine process.
//!
//! One TCP connection per driver, on localhost at the port the supervisor
//! selected. Latency dominates over throughput at the small-request boundary,
//! so the socket runs with `TCP_NODELAY`. All reads are exact-length;
//! hitting end-of-stream anywhere mid-frame means the engine went away and
//! surfaces as [`EngineError::ConnectionClosed`].

use std::io::{Read, Write};
use std::net::{Ipv4Addr, Shutdown, TcpStream};

use bytes::Bytes;

use crate::error::{EngineError, Result};
use crate::protocol::FrameBuffer;

/// Blocking, ordered byte stream to the engine.
pub struct Transport {
    stream: TcpStream,
}

impl Transport {
    /// Connect to the engine on `localhost:<port>`.
    ///
    /// The socket is left in blocking mode with `TCP_NODELAY` enabled.
    pub fn connect(port: u16) -> Result<Self> {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))?;
        stream.set_nodelay(true)?;
        tracing::debug!(port, "connected to engine");
        Ok(Self { stream })
    }

    /// Stamp the frame's length prefix and write the whole frame.
    ///
    /// The prefix is written from the byte count actually produced and
    /// includes its own four bytes. Partial writes are retried until the
    /// frame is fully on the wire.
    pub fn write_frame(&mut self, frame: &mut FrameBuffer) -> Result<()> {
        let bytes = frame.finalize();
        self.stream.write_all(bytes)?;
        Ok(())
    }

    /// Raw write, used for the small fixed-size dependency sub-replies that
    /// must not go through the frame buffer (it still holds the outbound
    /// command).
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes)?;
        Ok(())
    }

    /// Read exactly `n` bytes into an owned buffer.
    pub fn read_exact_bytes(&mut self, n: usize) -> Result<Bytes> {
        let mut buf = vec![0u8; n];
        self.read_into(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Fill the caller's buffer completely.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf).map_err(eof_as_closed)
    }

    /// Read the one-byte reply status.
    pub fn read_status(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read_into(&mut byte)?;
        Ok(byte[0])
    }

    /// Read a big-endian u32.
    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_into(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Read a big-endian i32.
    pub fn read_i32(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_into(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    /// Read a big-endian u64.
    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_into(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    /// Read a big-endian i64.
    pub fn read_i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.read_into(&mut buf)?;
        Ok(i64::from_be_bytes(buf))
    }

    /// Close both directions. This is the engine's shutdown signal.
    pub fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn eof_as_closed(e: std::io::Error) -> EngineError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        EngineError::ConnectionClosed
    } else {
        EngineError::Io(e)
    }
}
