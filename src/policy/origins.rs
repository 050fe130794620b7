//! Browsing groups, isolated origins and origin-agent-cluster decisions

use crate::isolation::{
    BrowserContextId, BrowsingGroupId, IsolatedOriginPattern, IsolatedOriginSource, IsolationContext,
    OacIsolationState, parse_isolated_origins,
};
use crate::origin::{Origin, is_valid_isolated_origin, site_for_origin};
use crate::utils::error::{ContractViolation, PolicyError, Result};

use super::SecurityPolicy;

impl SecurityPolicy {
    // Browsing groups

    /// Id the next browsing group will get. Isolated origins added now apply
    /// from this group on.
    pub fn next_browsing_group_id(&self) -> BrowsingGroupId {
        self.inner.browsing_groups.peek_next()
    }

    pub fn create_browsing_group(&self) -> BrowsingGroupId {
        let group = self.inner.browsing_groups.allocate();
        log::trace!("Created browsing group {}", group);
        group
    }

    /// Forget a destroyed browsing group once the cleanup grace period
    /// passed, so in-flight checks still see its state.
    pub fn remove_browsing_group(&self, group: BrowsingGroupId) {
        self.post_cleanup(move |policy| {
            policy.inner.isolated_origins().remove_for_browsing_group(group);
            policy
                .inner
                .origin_agent_clusters()
                .remove_for_browsing_group(group);
            let mut table = policy.inner.processes();
            for state in table.store.all_states_mut() {
                state.clear_browsing_group_id(group);
            }
            log::debug!("Removed state of browsing group {}", group);
        });
    }

    // Isolated origins

    /// Isolate `origins` in every browsing group created from now on.
    /// Returns how many were added.
    pub fn add_future_isolated_origins(
        &self,
        origins: &[Origin],
        source: IsolatedOriginSource,
        browser_context: Option<BrowserContextId>,
    ) -> usize {
        let patterns: Vec<IsolatedOriginPattern> = origins
            .iter()
            .cloned()
            .map(IsolatedOriginPattern::from_origin)
            .collect();
        self.add_isolated_origin_patterns(&patterns, source, browser_context)
    }

    /// Like [`add_future_isolated_origins`](Self::add_future_isolated_origins)
    /// for a comma separated list such as `https://a.test,https://[*.]b.test`
    pub fn add_future_isolated_origin_patterns(
        &self,
        list: &str,
        source: IsolatedOriginSource,
        browser_context: Option<BrowserContextId>,
    ) -> usize {
        self.add_isolated_origin_patterns(&parse_isolated_origins(list), source, browser_context)
    }

    pub(crate) fn add_isolated_origin_patterns(
        &self,
        patterns: &[IsolatedOriginPattern],
        source: IsolatedOriginSource,
        browser_context: Option<BrowserContextId>,
    ) -> usize {
        let threshold = self.inner.browsing_groups.peek_next();
        self.inner
            .isolated_origins()
            .add_future(patterns, source, browser_context, threshold)
    }

    /// Isolate `origin` in the context's existing browsing group only.
    ///
    /// `origin` must be a site, e.g. `https://a.test` and not
    /// `https://www.a.test`.
    pub fn add_isolated_origin_for_browsing_group(
        &self,
        context: &IsolationContext,
        origin: Origin,
        source: IsolatedOriginSource,
    ) -> Result<bool> {
        let group = context
            .browsing_group
            .ok_or(ContractViolation::MissingBrowsingGroup)?;
        if !is_valid_isolated_origin(&origin) || !is_site(&origin) {
            return Err(PolicyError::InvalidIsolatedOrigin(origin.debug_string()));
        }
        Ok(self
            .inner
            .isolated_origins()
            .add_for_browsing_group(context.browser_context, origin, group, source))
    }

    /// Origins isolated for future browsing groups, optionally filtered by
    /// source and profile
    pub fn isolated_origins(
        &self,
        source: Option<IsolatedOriginSource>,
        browser_context: Option<BrowserContextId>,
    ) -> Vec<Origin> {
        self.inner.isolated_origins().isolated_origins(source, browser_context)
    }

    pub fn is_isolated_site_from_source(&self, origin: &Origin, source: IsolatedOriginSource) -> bool {
        self.inner
            .isolated_origins()
            .is_isolated_site_from_source(origin, source)
    }

    /// Whether `origin` is isolated for every profile in new browsing groups
    pub fn is_globally_isolated_origin(&self, origin: &Origin) -> bool {
        let Some(tuple) = origin.tuple_or_precursor().filter(|_| !origin.is_opaque()) else {
            return false;
        };
        let Some(site_url) = site_for_origin(tuple) else {
            return false;
        };
        let next = self.inner.browsing_groups.peek_next();
        self.inner
            .isolated_origins()
            .get_matching_isolated_origin(None, next, origin, &site_url)
            .is_some_and(|matched| matched == *origin)
    }

    pub fn remove_isolated_origin(&self, origin: &Origin) {
        self.inner.isolated_origins().remove(origin);
    }

    pub fn clear_isolated_origins(&self) {
        self.inner.isolated_origins().clear();
    }

    // Origin-agent-cluster

    /// Record the isolation an origin committed with in the context's
    /// browsing group. The first recorded state stays.
    pub fn add_origin_isolation_state_for_browsing_group(
        &self,
        context: &IsolationContext,
        origin: &Origin,
        state: OacIsolationState,
    ) -> Result<bool> {
        let group = context
            .browsing_group
            .ok_or(ContractViolation::MissingBrowsingGroup)?;
        self.inner
            .origin_agent_clusters()
            .add_state_for_group(group, origin, state)
    }

    /// Track an origin that never opted in or out with the default state,
    /// so a later header cannot change its isolation in this group
    pub fn add_default_isolated_origin_if_needed(
        &self,
        context: &IsolationContext,
        origin: &Origin,
        is_global_walk_or_frame_removal: bool,
    ) -> bool {
        self.inner
            .origin_agent_clusters()
            .add_default_if_needed(context, origin, is_global_walk_or_frame_removal)
    }

    /// Remember that `origin` sent an Origin-Agent-Cluster header.
    /// Returns true the first time for the profile.
    pub fn update_origin_isolation_opt_in_list_if_necessary(
        &self,
        browser_context: Option<BrowserContextId>,
        origin: &Origin,
    ) -> bool {
        let first = self
            .inner
            .origin_agent_clusters()
            .update_opt_in_list(browser_context, origin);
        if first {
            log::trace!("{} requested an origin agent cluster", origin);
        }
        first
    }

    pub fn has_origin_ever_requested_origin_agent_cluster_value(
        &self,
        browser_context: Option<BrowserContextId>,
        origin: &Origin,
    ) -> bool {
        self.inner
            .origin_agent_clusters()
            .has_ever_requested(browser_context, origin)
    }

    /// Isolation `origin` gets in the context's browsing group. The first
    /// decision is recorded and wins over later requests.
    pub fn determine_origin_agent_cluster_isolation(
        &self,
        context: &IsolationContext,
        origin: &Origin,
        requested: OacIsolationState,
    ) -> OacIsolationState {
        self.inner
            .origin_agent_clusters()
            .determine_isolation(context, origin, requested)
    }
}

fn is_site(origin: &Origin) -> bool {
    let Some(tuple) = origin.tuple_or_precursor() else {
        return false;
    };
    site_for_origin(tuple).is_some_and(|site| Origin::from_url(&site) == *origin)
}
