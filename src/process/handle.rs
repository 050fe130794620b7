//! Owning capability over a process' security state

use std::fmt;
use std::path::Path;

use url::Url;

use super::ProcessId;
use crate::origin::Origin;
use crate::policy::{FileSystemUrl, SecurityPolicy};

/// Keeps the security state of a process queryable.
///
/// While any handle exists, queries keep working even after the process was
/// removed from the policy. A handle created for an unknown or already
/// removed process is invalid and every query through it fails closed.
#[derive(Default)]
pub struct Handle {
    binding: Option<Binding>,
}

struct Binding {
    policy: SecurityPolicy,
    process: ProcessId,
}

impl Handle {
    pub(crate) fn new(policy: &SecurityPolicy, process: ProcessId, duplicating: bool) -> Self {
        if !policy.add_process_reference(process, duplicating) {
            return Self::invalid();
        }
        Self {
            binding: Some(Binding {
                policy: policy.clone(),
                process,
            }),
        }
    }

    /// A handle that refers to nothing
    pub fn invalid() -> Self {
        Self { binding: None }
    }

    pub fn is_valid(&self) -> bool {
        self.binding.is_some()
    }

    pub fn process_id(&self) -> Option<ProcessId> {
        self.binding.as_ref().map(|binding| binding.process)
    }

    /// Another handle to the same process. Works after the process was
    /// removed, as long as this handle is still valid.
    pub fn duplicate(&self) -> Self {
        match &self.binding {
            Some(binding) => Self::new(&binding.policy, binding.process, true),
            None => Self::invalid(),
        }
    }

    pub fn can_commit_url(&self, url: &Url) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|binding| binding.policy.can_commit_url(binding.process, url))
    }

    pub fn can_read_file(&self, file: &Path) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|binding| binding.policy.can_read_file(binding.process, file))
    }

    pub fn can_read_file_system_file(&self, url: &FileSystemUrl) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|binding| binding.policy.can_read_file_system_file(binding.process, url))
    }

    pub fn can_access_data_for_origin(&self, origin: &Origin) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|binding| binding.policy.can_access_data_for_origin(binding.process, origin))
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.take() {
            binding.policy.remove_process_reference(binding.process);
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("process", &self.process_id())
            .finish()
    }
}
