//! Decoding of engine exception and crash payloads.
//!
//! Both payloads are self-describing blobs of length-prefixed UTF-8 strings.
//! An exception blob arrives after a nonzero error status; a crash report
//! arrives after the crash status and is framed with its own total length,
//! separate from ordinary exception payloads.

use std::fmt;

use bytes::{Buf, Bytes};

use crate::error::{EngineError, Result};

/// Exception payload layout:
/// `[u32 total][u32 code][u32 len + reason utf8][u32 n][n × (u32 len + trace utf8)]`.
/// The leading total counts everything after itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedException {
    /// Engine-side error code.
    pub code: u32,
    /// Human-readable failure description.
    pub message: String,
    /// Engine-side stack trace, outermost frame first.
    pub traces: Vec<String>,
}

impl SerializedException {
    /// Decode a self-describing exception blob (leading total length
    /// included, as the reply reader re-prepends it).
    pub fn decode(mut blob: Bytes) -> Result<Self> {
        let total = take_u32(&mut blob, "exception length")? as usize;
        if blob.remaining() < total {
            return Err(EngineError::Protocol(format!(
                "exception payload truncated: header says {total}, got {}",
                blob.remaining()
            )));
        }
        let code = take_u32(&mut blob, "exception code")?;
        let message = take_string(&mut blob, "exception message")?;
        let trace_count = take_u32(&mut blob, "exception trace count")?;
        let mut traces = Vec::with_capacity(trace_count as usize);
        for _ in 0..trace_count {
            traces.push(take_string(&mut blob, "exception trace")?);
        }
        Ok(Self {
            code,
            message,
            traces,
        })
    }
}

impl fmt::Display for SerializedException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)
    }
}

/// Crash report layout (after the separately framed total length):
/// `[u32 len + reason][u32 len + filename][u32 lineno][u32 n][n × (u32 len + trace)]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    /// Why the engine decided to crash.
    pub reason: String,
    /// Source file on the engine side.
    pub filename: String,
    /// Line number in that file.
    pub lineno: u32,
    /// Engine-side stack trace strings.
    pub traces: Vec<String>,
}

impl CrashReport {
    /// Decode a crash message body (total length already consumed).
    pub fn decode(mut body: Bytes) -> Result<Self> {
        let reason = take_string(&mut body, "crash reason")?;
        let filename = take_string(&mut body, "crash filename")?;
        let lineno = take_u32(&mut body, "crash line number")?;
        let trace_count = take_u32(&mut body, "crash trace count")?;
        let mut traces = Vec::with_capacity(trace_count as usize);
        for _ in 0..trace_count {
            traces.push(take_string(&mut body, "crash trace")?);
        }
        Ok(Self {
            reason,
            filename,
            lineno,
            traces,
        })
    }
}

impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}:{}", self.reason, self.filename, self.lineno)
    }
}

/// Take a big-endian u32 from the cursor, or fail with a protocol error
/// naming the field.
pub(crate) fn take_u32(cursor: &mut Bytes, what: &str) -> Result<u32> {
    if cursor.remaining() < 4 {
        return Err(short(what, 4, cursor.remaining()));
    }
    Ok(cursor.get_u32())
}

/// Take a single byte from the cursor.
pub(crate) fn take_u8(cursor: &mut Bytes, what: &str) -> Result<u8> {
    if cursor.remaining() < 1 {
        return Err(short(what, 1, 0));
    }
    Ok(cursor.get_u8())
}

/// Take `len` bytes from the cursor, zero-copy.
pub(crate) fn take_bytes(cursor: &mut Bytes, len: usize, what: &str) -> Result<Bytes> {
    if cursor.remaining() < len {
        return Err(short(what, len, cursor.remaining()));
    }
    Ok(cursor.split_to(len))
}

/// Take a u32-prefixed UTF-8 string from the cursor.
pub(crate) fn take_string(cursor: &mut Bytes, what: &str) -> Result<String> {
    let len = take_u32(cursor, what)? as usize;
    let bytes = take_bytes(cursor, len, what)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| EngineError::Protocol(format!("{what} is not valid UTF-8: {e}")))
}

fn short(what: &str, needed: usize, got: usize) -> EngineError {
    EngineError::Protocol(format!("short read decoding {what}: need {needed}, have {got}"))
}
