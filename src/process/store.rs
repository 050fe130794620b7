//! Process id to security state table with deferred removal

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use super::{ProcessId, SecurityState};
use crate::scheduler::ExecutionContext;
use crate::utils::ContractViolation;

/// Owns every [`SecurityState`].
///
/// Removed processes move to a pending map and stay there while references
/// (the process itself, [`Handle`](crate::Handle)s) exist. Once the count
/// drops to zero the owner schedules [`purge`](Self::purge).
#[derive(Debug, Default)]
pub struct SecurityStateStore {
    active: HashMap<ProcessId, SecurityState>,
    pending_removal: HashMap<ProcessId, SecurityState>,
    references: HashMap<ProcessId, usize>,
}

impl SecurityStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new process. The process holds the first reference.
    ///
    /// A state still pending removal under the same id is replaced and
    /// returned so the caller can drop it outside the lock.
    pub fn add(&mut self, process: ProcessId, state: SecurityState) -> Result<Option<SecurityState>, ContractViolation> {
        match self.active.entry(process) {
            Entry::Occupied(_) => Err(ContractViolation::ProcessAlreadyAdded(process)),
            Entry::Vacant(slot) => {
                slot.insert(state);
                *self.references.entry(process).or_default() += 1;
                Ok(self.pending_removal.remove(&process))
            }
        }
    }

    /// Move the state to the pending map and drop the process' own
    /// reference. Returns true when that was the last reference.
    pub fn remove(&mut self, process: ProcessId) -> Result<bool, ContractViolation> {
        let Some(state) = self.active.remove(&process) else {
            return Ok(false);
        };
        self.pending_removal.insert(process, state);
        self.remove_reference(process)
    }

    /// State visible to a query.
    ///
    /// Pending states are only visible while a reference keeps them alive,
    /// or from the IO context which runs the final cleanup.
    pub fn get(&self, process: ProcessId) -> Option<&SecurityState> {
        if let Some(state) = self.active.get(&process) {
            return Some(state);
        }
        let pending = self.pending_removal.get(&process)?;
        if self.references.contains_key(&process) || ExecutionContext::current() == Some(ExecutionContext::Io) {
            return Some(pending);
        }
        None
    }

    /// Mutable state of a registered process. Removed processes are frozen.
    pub fn get_mut(&mut self, process: ProcessId) -> Option<&mut SecurityState> {
        self.active.get_mut(&process)
    }

    /// Take a reference for a new handle.
    ///
    /// New handles can only be created for registered processes; duplicating
    /// an existing handle also works after removal.
    pub fn add_reference(&mut self, process: ProcessId, duplicating: bool) -> Result<bool, ContractViolation> {
        if !self.active.contains_key(&process) {
            if !duplicating {
                return Ok(false);
            }
            if self.references.get(&process).copied().unwrap_or(0) == 0 {
                return Err(ContractViolation::DuplicateReleasedHandle(process));
            }
        }
        *self.references.entry(process).or_default() += 1;
        Ok(true)
    }

    /// Drop a reference. Returns true when it was the last one.
    pub fn remove_reference(&mut self, process: ProcessId) -> Result<bool, ContractViolation> {
        let Some(count) = self.references.get_mut(&process) else {
            return Err(ContractViolation::ReferenceUnderflow(process));
        };
        if *count > 1 {
            *count -= 1;
            return Ok(false);
        }
        self.references.remove(&process);
        Ok(true)
    }

    /// Take a pending state out of the table once nothing references it.
    /// The caller drops it outside the lock.
    pub fn purge(&mut self, process: ProcessId) -> Option<SecurityState> {
        if self.references.contains_key(&process) {
            return None;
        }
        self.pending_removal.remove(&process)
    }

    pub fn reference_count(&self, process: ProcessId) -> usize {
        self.references.get(&process).copied().unwrap_or(0)
    }

    pub fn contains(&self, process: ProcessId) -> bool {
        self.active.contains_key(&process)
    }

    pub fn is_pending_removal(&self, process: ProcessId) -> bool {
        self.pending_removal.contains_key(&process)
    }

    /// Registered processes, pending ones excluded
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ProcessId, &mut SecurityState)> {
        self.active.iter_mut()
    }

    /// Registered and pending states alike
    pub fn all_states_mut(&mut self) -> impl Iterator<Item = &mut SecurityState> {
        self.active.values_mut().chain(self.pending_removal.values_mut())
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending_removal.len()
    }
}
