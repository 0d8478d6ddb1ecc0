//! Control plane - engine process supervision and instrumentation.
//!
//! Distinct from the data plane (the protocol socket): the control plane is
//! the child process itself, its merged stdout/stderr stream, the startup
//! handshake and the memory-checker accounting.

pub mod instrumentation;
mod process;

pub use instrumentation::InstrumentationLog;
pub use process::{
    next_engine_port, BackendTarget, EngineProcess, DEFAULT_ENGINE_PORT, ENGINE_PATH_ENV,
};
