//! Origin-agent-cluster opt-in tracking
//!
//! Once a browsing group has seen an origin, that origin keeps the isolation
//! state it got first for as long as the group lives, even if later documents
//! from the same origin ask for something else.

use std::collections::{HashMap, HashSet};

use super::{BrowserContextId, BrowsingGroupId, IsolationContext};
use crate::origin::{Origin, is_valid_isolated_origin, is_valid_origin_for_opt_in_isolation};
use crate::utils::error::{PolicyError, Result};

/// Isolation an origin receives inside a browsing group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OacIsolationState {
    /// Site-keyed, shares an agent cluster with its site
    #[default]
    NonIsolated,
    /// Own agent cluster, possibly in a site-keyed process
    LogicalCluster,
    /// Own agent cluster in an origin-keyed process
    OriginKeyedProcess,
}

impl OacIsolationState {
    pub fn from_request(is_origin_agent_cluster: bool, requires_origin_keyed_process: bool) -> Self {
        match (is_origin_agent_cluster, requires_origin_keyed_process) {
            (false, _) => Self::NonIsolated,
            (true, false) => Self::LogicalCluster,
            (true, true) => Self::OriginKeyedProcess,
        }
    }

    pub fn is_origin_agent_cluster(&self) -> bool {
        !matches!(self, Self::NonIsolated)
    }

    pub fn requires_origin_keyed_process(&self) -> bool {
        matches!(self, Self::OriginKeyedProcess)
    }
}

#[derive(Debug, Clone)]
struct OptInEntry {
    origin: Origin,
    state: OacIsolationState,
}

/// Per browsing group record of origin isolation decisions, plus the per
/// profile list of origins that ever sent an Origin-Agent-Cluster header.
#[derive(Debug, Default)]
pub struct OriginAgentClusterTracker {
    by_group: HashMap<BrowsingGroupId, Vec<OptInEntry>>,
    opt_ins_and_outs: HashMap<Option<BrowserContextId>, HashSet<Origin>>,
    default_state: OacIsolationState,
}

impl OriginAgentClusterTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// State recorded when an origin is tracked with default isolation
    pub fn with_default_state(mut self, state: OacIsolationState) -> Self {
        self.default_state = state;
        self
    }

    /// State recorded for `origin` in `group`, if any
    pub fn lookup(&self, group: BrowsingGroupId, origin: &Origin) -> Option<OacIsolationState> {
        self.by_group
            .get(&group)?
            .iter()
            .find(|entry| entry.origin == *origin)
            .map(|entry| entry.state)
    }

    /// Read-only variant of [`determine_isolation`](Self::determine_isolation)
    pub fn lookup_or(
        &self,
        context: &IsolationContext,
        origin: &Origin,
        requested: OacIsolationState,
    ) -> OacIsolationState {
        if !is_valid_origin_for_opt_in_isolation(origin) {
            return OacIsolationState::NonIsolated;
        }
        context
            .browsing_group
            .and_then(|group| self.lookup(group, origin))
            .unwrap_or(requested)
    }

    /// Isolation for `origin` in the context's browsing group.
    ///
    /// An existing decision wins. Otherwise `requested` is recorded for the
    /// group and returned. Without a browsing group nothing is recorded.
    pub fn determine_isolation(
        &mut self,
        context: &IsolationContext,
        origin: &Origin,
        requested: OacIsolationState,
    ) -> OacIsolationState {
        if !is_valid_origin_for_opt_in_isolation(origin) {
            return OacIsolationState::NonIsolated;
        }
        let Some(group) = context.browsing_group else {
            return requested;
        };
        if let Some(existing) = self.lookup(group, origin) {
            return existing;
        }
        self.push(group, origin.clone(), requested);
        requested
    }

    /// Record the state an origin committed with. Existing entries are kept.
    ///
    /// Opting in requires a potentially trustworthy origin; opting out only
    /// requires an origin that could be isolated at all.
    pub fn add_state_for_group(
        &mut self,
        group: BrowsingGroupId,
        origin: &Origin,
        state: OacIsolationState,
    ) -> Result<bool> {
        let valid = if state.is_origin_agent_cluster() {
            is_valid_origin_for_opt_in_isolation(origin)
        } else {
            is_valid_isolated_origin(origin)
        };
        if !valid {
            return Err(PolicyError::InvalidOriginForOptIn(origin.debug_string()));
        }
        if self.lookup(group, origin).is_some() {
            return Ok(false);
        }
        self.push(group, origin.clone(), state);
        Ok(true)
    }

    /// Track `origin` with the default state in the context's group.
    ///
    /// Outside a global walk or frame removal this only happens for origins
    /// that have ever sent the header in the profile; commits of other
    /// origins need no record.
    pub fn add_default_if_needed(
        &mut self,
        context: &IsolationContext,
        origin: &Origin,
        is_global_walk_or_frame_removal: bool,
    ) -> bool {
        if !is_valid_origin_for_opt_in_isolation(origin) {
            return false;
        }
        let Some(group) = context.browsing_group else {
            log::debug!("no browsing group to track {origin} in");
            return false;
        };
        if !is_global_walk_or_frame_removal
            && !self.has_ever_requested(context.browser_context, origin)
        {
            return false;
        }
        if self.lookup(group, origin).is_some() {
            return false;
        }
        self.push(group, origin.clone(), self.default_state);
        true
    }

    /// Remember that `origin` sent an Origin-Agent-Cluster header.
    /// Returns true the first time for a profile.
    pub fn update_opt_in_list(
        &mut self,
        browser_context: Option<BrowserContextId>,
        origin: &Origin,
    ) -> bool {
        if !is_valid_origin_for_opt_in_isolation(origin) {
            return false;
        }
        self.opt_ins_and_outs
            .entry(browser_context)
            .or_default()
            .insert(origin.clone())
    }

    pub fn has_ever_requested(
        &self,
        browser_context: Option<BrowserContextId>,
        origin: &Origin,
    ) -> bool {
        self.opt_ins_and_outs
            .get(&browser_context)
            .is_some_and(|origins| origins.contains(origin))
    }

    pub fn remove_for_browsing_group(&mut self, group: BrowsingGroupId) {
        if let Some(entries) = self.by_group.remove(&group) {
            log::trace!("dropped {} opt-in entries of group {group}", entries.len());
        }
    }

    pub fn remove_for_browser_context(&mut self, browser_context: BrowserContextId) {
        self.opt_ins_and_outs.remove(&Some(browser_context));
    }

    /// Number of groups with at least one recorded decision
    pub fn group_count(&self) -> usize {
        self.by_group.len()
    }

    fn push(&mut self, group: BrowsingGroupId, origin: Origin, state: OacIsolationState) {
        self.by_group
            .entry(group)
            .or_default()
            .push(OptInEntry { origin, state });
    }
}
