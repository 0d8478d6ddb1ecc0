//! Memory-checker diagnostics.
//!
//! When the engine runs under the memory checker, its complaints are never
//! raised synchronously: they are appended to a process-wide error list that
//! regression suites consult at teardown. Drivers for every partition share
//! the same list.

use parking_lot::Mutex;

/// Append-only, thread-safe list of instrumentation complaints.
pub struct InstrumentationLog {
    errors: Mutex<Vec<String>>,
}

impl InstrumentationLog {
    /// Create an empty log.
    pub const fn new() -> Self {
        Self {
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Append one complaint.
    pub fn record(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::warn!(%line, "instrumentation error");
        self.errors.lock().push(line);
    }

    /// Copy of everything recorded so far.
    pub fn snapshot(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    /// Drain the log, returning what was recorded. Test suites call this at
    /// teardown so one run's complaints don't bleed into the next.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.errors.lock())
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }
}

impl Default for InstrumentationLog {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: InstrumentationLog = InstrumentationLog::new();

/// The process-wide log shared by all drivers.
pub fn global() -> &'static InstrumentationLog {
    &GLOBAL
}

/// Per-child accounting over the memory checker's output lines.
///
/// Lines are pre-filtered by the `==<pid>==` prefix. The checker's exit code
/// is not enough: reachable blocks on exit are not an error to it, so the
/// "All heap blocks were freed" line has to be watched for explicitly.
pub(crate) struct OutputAccounting {
    prefix: String,
    all_heap_blocks_freed: bool,
}

const ERROR_SUMMARY: &str = "ERROR SUMMARY: ";
const HEAP_BLOCKS_FREED: &str = "All heap blocks were freed";
const HEAP_BLOCKS_SENTINEL: &str = "Not all heap blocks were freed";

impl OutputAccounting {
    pub(crate) fn new(pid: &str) -> Self {
        Self {
            prefix: format!("=={pid}=="),
            all_heap_blocks_freed: false,
        }
    }

    /// True when the line carries the child's memory-checker prefix.
    pub(crate) fn matches(&self, line: &str) -> bool {
        line.starts_with(&self.prefix)
    }

    /// Inspect one memory-checker line.
    pub(crate) fn process_line(&mut self, line: &str, log: &InstrumentationLog) {
        if let Some(rest) = line.split(ERROR_SUMMARY).nth(1) {
            let count: u64 = rest
                .split_whitespace()
                .next()
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
            if count != 0 {
                log.record(line);
            }
        } else if line.contains(HEAP_BLOCKS_FREED) {
            self.all_heap_blocks_freed = true;
        }
    }

    /// The output stream closed; complain unless a clean exit was seen.
    pub(crate) fn finish(&self, log: &InstrumentationLog) {
        if !self.all_heap_blocks_freed {
            log.record(HEAP_BLOCKS_SENTINEL);
        }
    }
}
