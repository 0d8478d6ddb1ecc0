//! The seam between the protocol engine and the query coordinator.

use bytes::Bytes;

use crate::protocol::exception::CrashReport;

/// Callbacks the driver needs from the coordinator while a reply is being
/// read.
///
/// The engine may interrupt its own reply to pull dependency tables from the
/// host before resuming; `next_dependency` serves those pulls. A crash
/// report ends the coordinator: `fatal_crash` is invoked once with the
/// decoded report, after which the failing call returns
/// [`EngineError::Crash`](crate::EngineError::Crash) and the driver is done.
pub trait Coordinator {
    /// Hand over the serialized dependency table for `dependency_id`, or
    /// `None` when the coordinator has no such table.
    fn next_dependency(&mut self, dependency_id: u32) -> Option<Bytes>;

    /// The engine reported an intentional crash. Non-recoverable.
    fn fatal_crash(&mut self, report: &CrashReport);
}
