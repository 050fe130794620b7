//! Per-process security state
//!
//! - Process locks: what a renderer is allowed to host
//! - Security state: grants, capabilities and the lock of one process
//! - State store: process table with deferred removal
//! - Handles: capabilities that keep a process' state queryable

mod handle;
mod lock;
mod state;
mod store;

pub use handle::Handle;
pub use lock::{ProcessLock, StoragePartitionId, WebExposedIsolationInfo};
pub use state::{CapabilityBits, CommitRequestPolicy, FilePermissions, FileSystemReferences, SecurityState};
pub use store::SecurityStateStore;

use std::fmt;

/// Unique id of a child process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u32);

impl ProcessId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for ProcessId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
