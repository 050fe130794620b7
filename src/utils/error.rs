//! Error types for the isolation policy engine

use thiserror::Error;

use crate::process::{ProcessId, ProcessLock};

/// Main error type for policy operations
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A caller broke an invariant of the policy. These are never caused by
    /// untrusted renderer input.
    #[error("contract violation: {0}")]
    Contract(#[from] ContractViolation),

    /// Origin cannot be registered as an isolated origin
    #[error("invalid isolated origin: {0}")]
    InvalidIsolatedOrigin(String),

    /// Origin cannot take part in origin-agent-cluster isolation
    #[error("origin {0} is not eligible for origin-agent-cluster isolation")]
    InvalidOriginForOptIn(String),

    /// Configuration could not be loaded
    #[error("invalid policy configuration: {0}")]
    Config(#[from] serde_json::Error),
}

/// Broken caller invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    /// `add` was called twice for the same process
    #[error("process {0} was added more than once")]
    ProcessAlreadyAdded(ProcessId),

    /// The process is not registered with the policy
    #[error("process {0} is not registered")]
    UnknownProcess(ProcessId),

    /// An invalid lock was passed to `lock_process`
    #[error("cannot lock process {0} with an invalid lock")]
    InvalidLock(ProcessId),

    /// Locked processes never change their lock
    #[error("process {process} is already locked to {current}, refusing {requested}")]
    AlreadyLockedToSite {
        process: ProcessId,
        current: ProcessLock,
        requested: ProcessLock,
    },

    /// Re-locking must keep the cross-origin isolation information
    #[error("process {process} changes isolation info from {current} to {requested}")]
    IsolationInfoMismatch {
        process: ProcessId,
        current: String,
        requested: String,
    },

    /// A process that already rendered a document cannot be tightened
    #[error("cannot lock already used process {process} to {requested}")]
    LockingUsedProcess {
        process: ProcessId,
        requested: ProcessLock,
    },

    /// A handle was duplicated after its process reference count was gone
    #[error("handle for process {0} duplicated without a live reference")]
    DuplicateReleasedHandle(ProcessId),

    /// Per-group state can only be added for a known browsing group
    #[error("operation requires a browsing group id")]
    MissingBrowsingGroup,

    /// Process reference count underflow
    #[error("process {0} released more references than it acquired")]
    ReferenceUnderflow(ProcessId),
}

/// Convenience Result type for policy operations
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Reports a contract violation the way the policy treats them: loudly.
///
/// Callers must release every policy mutex before calling this.
#[track_caller]
pub(crate) fn fatal(error: PolicyError) -> ! {
    log::error!(target: "binix_isolation::contract", "{error}");
    panic!("{error}");
}
