//! Structured reports for denied data access

use std::fmt;

use crate::process::ProcessId;

/// Context recorded when a process is denied access to an origin.
///
/// Collaborators usually terminate the process after a denial; the record
/// exists for postmortem analysis and never changes a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDenial {
    pub process_id: ProcessId,
    /// Lock the requested origin would need, `(none)` if not computed
    pub expected_lock: String,
    /// Lock the process actually has
    pub actual_lock: String,
    pub requested_origin: String,
    /// Why the check failed, one `[BG=n]` section per browsing group
    pub reason: String,
    /// References keeping the process' state alive
    pub handle_refs: usize,
}

impl fmt::Display for AccessDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "process {} denied access to {}: {} (expected {}, actual {})",
            self.process_id, self.requested_origin, self.reason, self.expected_lock, self.actual_lock
        )
    }
}

/// Receives every access denial
pub trait DenialObserver: Send + Sync {
    fn on_access_denied(&self, denial: &AccessDenial);
}

/// Writes denials to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDenialObserver;

impl DenialObserver for LogDenialObserver {
    fn on_access_denied(&self, denial: &AccessDenial) {
        log::warn!(
            target: "binix_isolation::denial",
            process_id = denial.process_id.value(),
            expected_lock = denial.expected_lock.as_str(),
            actual_lock = denial.actual_lock.as_str(),
            requested_origin = denial.requested_origin.as_str(),
            reason = denial.reason.as_str(),
            handle_refs = denial.handle_refs;
            "Data access denied: {}",
            denial
        );
    }
}
