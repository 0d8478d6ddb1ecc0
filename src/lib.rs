//! # enginewire
//!
//! Host-side IPC driver for an out-of-process execution engine: the native
//! storage/execution process that owns tables, runs compiled plan fragments,
//! manages per-transaction undo and streams table snapshots.
//!
//! The driver presents a synchronous request/reply API to the query
//! coordinator while speaking a length-prefixed big-endian binary protocol
//! to a single engine process over a blocking TCP stream.
//!
//! ## Architecture
//!
//! - **Control plane** ([`control`]): engine process lifecycle - spawning
//!   (directly or under the memory checker), the stdout handshake, and the
//!   process-wide instrumentation error log.
//! - **Data plane** ([`protocol`], [`transport`]): frame assembly in one
//!   reusable buffer, blocking socket I/O, and the reply reader with its
//!   mid-reply dependency callback loop.
//!
//! ## Example
//!
//! ```ignore
//! use enginewire::{BackendTarget, Coordinator, EngineClient, EngineConfig};
//!
//! let config = EngineConfig {
//!     site_id: 1,
//!     partition_id: 1,
//!     target: BackendTarget::Managed,
//!     ..EngineConfig::default()
//! };
//! let mut engine = EngineClient::connect(config, Box::new(coordinator))?;
//!
//! engine.load_catalog(&catalog)?;
//! engine.tick(now, last_committed)?;
//! let deps = engine.execute_plan_fragment(fragment_id, out_dep, in_dep,
//!     &params, txn_id, last_committed, undo_token)?;
//! engine.release()?;
//! ```

pub mod control;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod transport;

mod client;

pub use client::{EngineClient, EngineConfig, ExportResult};
pub use control::BackendTarget;
pub use coordinator::Coordinator;
pub use error::{EngineError, Result};
pub use protocol::{
    Command, CrashReport, DependencySet, SerializedException, StatsSelector, TableStreamType,
};
