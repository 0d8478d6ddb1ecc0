//! Protocol module - command codes, frame assembly and reply decoding.
//!
//! Outbound frames carry a leading length that includes itself; inbound
//! replies are status-byte first with field-local length prefixes that
//! exclude themselves. Both directions are big-endian end to end.

pub mod command;
pub mod exception;
pub mod frame_buffer;
pub mod reply;
pub mod status;

pub use command::{Command, StatsSelector, TableStreamType};
pub use exception::{CrashReport, SerializedException};
pub use frame_buffer::{FrameBuffer, DEFAULT_FRAME_CAPACITY, LENGTH_PREFIX_SIZE};
pub use reply::DependencySet;
