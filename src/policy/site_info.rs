//! Site computation: which process a URL belongs in

use std::fmt;

use url::Url;

use super::SecurityPolicy;
use crate::isolation::{IsolationContext, OacIsolationState, UrlInfo};
use crate::origin::{
    BLOB_SCHEME, DATA_SCHEME, ERROR_PAGE_SCHEME, FILE_SCHEME, Origin, SchemeHostPort, site_for_origin,
    strip_fragment,
};
use crate::process::{ProcessLock, StoragePartitionId, WebExposedIsolationInfo};

/// Site all error pages share
pub const ERROR_PAGE_SITE: &str = "chrome-error://chromewebdata/";

/// The security principal a URL maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteInfo {
    site_url: Url,
    requires_origin_keyed_process: bool,
    is_sandboxed: bool,
    unique_sandbox_id: Option<u64>,
    storage_partition: StoragePartitionId,
    isolation_info: WebExposedIsolationInfo,
    is_pdf: bool,
    does_site_request_dedicated_process_for_coop: bool,
    is_error_page: bool,
}

impl SiteInfo {
    /// Site info for `site_url` with default attributes
    pub fn new(site_url: Url) -> Self {
        Self {
            site_url,
            requires_origin_keyed_process: false,
            is_sandboxed: false,
            unique_sandbox_id: None,
            storage_partition: StoragePartitionId::default(),
            isolation_info: WebExposedIsolationInfo::NonIsolated,
            is_pdf: false,
            does_site_request_dedicated_process_for_coop: false,
            is_error_page: false,
        }
    }

    fn for_error_page(site_url: Url, storage_partition: StoragePartitionId) -> Self {
        let mut site = Self::new(site_url);
        site.storage_partition = storage_partition;
        site.is_error_page = true;
        site
    }

    pub fn with_pdf(mut self, is_pdf: bool) -> Self {
        self.is_pdf = is_pdf;
        self
    }

    pub fn with_storage_partition(mut self, partition: StoragePartitionId) -> Self {
        self.storage_partition = partition;
        self
    }

    pub fn with_isolation_info(mut self, info: WebExposedIsolationInfo) -> Self {
        self.isolation_info = info;
        self
    }

    pub fn with_origin_keyed_process(mut self, required: bool) -> Self {
        self.requires_origin_keyed_process = required;
        self
    }

    pub fn with_sandbox(mut self, is_sandboxed: bool, unique_sandbox_id: Option<u64>) -> Self {
        self.is_sandboxed = is_sandboxed;
        self.unique_sandbox_id = if is_sandboxed { unique_sandbox_id } else { None };
        self
    }

    pub fn with_coop(mut self, requests_dedicated_process: bool) -> Self {
        self.does_site_request_dedicated_process_for_coop = requests_dedicated_process;
        self
    }

    pub fn site_url(&self) -> &Url {
        &self.site_url
    }

    /// URL a process hosting this site gets locked to
    pub fn process_lock_url(&self) -> &Url {
        &self.site_url
    }

    pub fn requires_origin_keyed_process(&self) -> bool {
        self.requires_origin_keyed_process
    }

    pub fn is_sandboxed(&self) -> bool {
        self.is_sandboxed
    }

    pub fn unique_sandbox_id(&self) -> Option<u64> {
        self.unique_sandbox_id
    }

    pub fn storage_partition(&self) -> &StoragePartitionId {
        &self.storage_partition
    }

    pub fn isolation_info(&self) -> &WebExposedIsolationInfo {
        &self.isolation_info
    }

    pub fn is_pdf(&self) -> bool {
        self.is_pdf
    }

    pub fn does_site_request_dedicated_process_for_coop(&self) -> bool {
        self.does_site_request_dedicated_process_for_coop
    }

    pub fn is_error_page(&self) -> bool {
        self.is_error_page
    }
}

impl fmt::Display for SiteInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.site_url)?;
        if self.requires_origin_keyed_process {
            f.write_str(" origin-keyed")?;
        }
        if self.is_pdf {
            f.write_str(" pdf")?;
        }
        if self.is_sandboxed {
            f.write_str(" sandboxed")?;
        }
        if self.does_site_request_dedicated_process_for_coop {
            f.write_str(" coop")?;
        }
        Ok(())
    }
}

/// Origin a site is computed from. data: URLs loaded with a base URL use the
/// base origin's tuple.
fn site_origin(url_info: &UrlInfo) -> Origin {
    let url = &url_info.url;
    match &url_info.origin {
        Some(origin) if url.scheme() == DATA_SCHEME => match origin.tuple_or_precursor() {
            Some(tuple) => Origin::tuple(tuple.scheme(), tuple.host(), tuple.port()),
            None => Origin::resolve(url, origin),
        },
        _ => Origin::from_url(url),
    }
}

/// Site shared by every URL of `scheme`. Special schemes canonicalize with an
/// empty authority, e.g. `file:///`.
fn scheme_only_site(scheme: &str) -> Option<Url> {
    Url::parse(&format!("{scheme}:")).ok()
}

impl SecurityPolicy {
    /// Site `url_info` belongs to in `context`.
    ///
    /// Origin-agent-cluster decisions already recorded for the context's
    /// browsing group are honored but nothing new is recorded.
    pub fn site_info_for(&self, context: &IsolationContext, url_info: &UrlInfo) -> SiteInfo {
        let storage_partition = url_info.storage_partition.clone().unwrap_or_default();
        if url_info.url.scheme() == ERROR_PAGE_SCHEME {
            // All error pages share one site.
            let site_url = Url::parse(ERROR_PAGE_SITE).unwrap_or_else(|_| url_info.url.clone());
            return SiteInfo::for_error_page(site_url, storage_partition);
        }

        let requires_origin_keyed_process = self.requires_origin_keyed_process(context, url_info);
        let site_url = self
            .site_url_for(context, url_info, requires_origin_keyed_process)
            .unwrap_or_else(|| url_info.url.clone());

        SiteInfo::new(site_url)
            .with_origin_keyed_process(requires_origin_keyed_process)
            .with_storage_partition(storage_partition)
            .with_isolation_info(url_info.isolation_info.clone().unwrap_or_default())
            .with_pdf(url_info.is_pdf)
            .with_sandbox(url_info.is_sandboxed, url_info.unique_sandbox_id)
            .with_coop(url_info.requests_coop_isolation)
    }

    fn requires_origin_keyed_process(&self, context: &IsolationContext, url_info: &UrlInfo) -> bool {
        if !self.inner.config.origin_agent_cluster_process_isolation {
            return false;
        }
        let requested = OacIsolationState::from_request(
            url_info.requests_origin_agent_cluster(),
            url_info.requests_origin_keyed_process(),
        );
        self.inner
            .origin_agent_clusters()
            .lookup_or(context, &Origin::from_url(&url_info.url), requested)
            .requires_origin_keyed_process()
    }

    fn site_url_for(
        &self,
        context: &IsolationContext,
        url_info: &UrlInfo,
        requires_origin_keyed_process: bool,
    ) -> Option<Url> {
        let url = &url_info.url;
        let origin = site_origin(url_info);

        match origin.tuple_or_precursor() {
            Some(tuple) if !origin.is_opaque() && !tuple.host().is_empty() && tuple.scheme() != FILE_SCHEME => {
                self.site_url_for_host(context, &origin, tuple, requires_origin_keyed_process)
            }
            _ if !origin.is_opaque() => origin.scheme().and_then(scheme_only_site),
            // Each opaque blob or data URL is its own site.
            _ if url.scheme() == BLOB_SCHEME || url.scheme() == DATA_SCHEME => Some(strip_fragment(url)),
            _ => scheme_only_site(url.scheme()),
        }
    }

    fn site_url_for_host(
        &self,
        context: &IsolationContext,
        origin: &Origin,
        tuple: &SchemeHostPort,
        requires_origin_keyed_process: bool,
    ) -> Option<Url> {
        if self.inner.config.strict_origin_isolation && tuple.is_http_or_https() {
            return tuple.to_url();
        }

        let site_url = site_for_origin(tuple)?;
        match self.matching_isolated_origin(context, origin, requires_origin_keyed_process, &site_url) {
            Some(isolated) => isolated.to_url(),
            None => Some(site_url),
        }
    }

    /// Lock a process hosting `url_info` in `context` needs
    pub fn process_lock_for(&self, context: &IsolationContext, url_info: &UrlInfo) -> ProcessLock {
        let site_info = self.site_info_for(context, url_info);
        if self.should_lock_process_to_site(context, &site_info) {
            return ProcessLock::from_site_info(&site_info);
        }
        ProcessLock::allow_any_site(
            site_info.storage_partition().clone(),
            site_info.isolation_info().clone(),
        )
    }

    /// Whether the site must not share a process with other sites
    pub fn requires_dedicated_process(&self, context: &IsolationContext, site_info: &SiteInfo) -> bool {
        if self.inner.config.site_per_process || site_info.does_site_request_dedicated_process_for_coop() {
            return true;
        }

        let site_origin = Origin::from_url(site_info.site_url());
        if self.is_isolated_origin(context, &site_origin, site_info.requires_origin_keyed_process()) {
            return true;
        }

        if site_info.is_sandboxed() || site_info.is_error_page() || site_info.is_pdf() {
            return true;
        }

        let delegate = &self.inner.delegate;
        delegate.is_webui_scheme(site_info.site_url().scheme())
            || delegate.does_site_require_dedicated_process(context.browser_context, site_info.site_url())
    }

    /// Whether a process hosting the site gets a site lock
    pub fn should_lock_process_to_site(&self, context: &IsolationContext, site_info: &SiteInfo) -> bool {
        if !self.requires_dedicated_process(context, site_info) {
            return false;
        }

        let delegate = &self.inner.delegate;
        let scheme = site_info.site_url().scheme();
        if delegate.is_webui_scheme(scheme) {
            return delegate.does_webui_scheme_require_process_lock(scheme);
        }
        delegate.should_lock_process_to_site(context.browser_context, site_info.site_url())
    }

    /// Whether `origin` needs a dedicated process in `context`
    pub fn is_isolated_origin(
        &self,
        context: &IsolationContext,
        origin: &Origin,
        requests_origin_keyed_process: bool,
    ) -> bool {
        self.get_matching_process_isolated_origin(context, origin, requests_origin_keyed_process)
            .is_some()
    }

    /// Isolated origin `origin` falls under in `context`.
    ///
    /// An origin-keyed process decision recorded for the browsing group wins
    /// and returns `origin` itself. Without a browsing group, the latest
    /// registrations are consulted.
    pub fn get_matching_process_isolated_origin(
        &self,
        context: &IsolationContext,
        origin: &Origin,
        requests_origin_keyed_process: bool,
    ) -> Option<Origin> {
        let tuple = origin.tuple_or_precursor().filter(|_| !origin.is_opaque())?;
        let site_url = site_for_origin(tuple)?;
        self.matching_isolated_origin(context, origin, requests_origin_keyed_process, &site_url)
    }

    fn matching_isolated_origin(
        &self,
        context: &IsolationContext,
        origin: &Origin,
        requests_origin_keyed_process: bool,
        site_url: &Url,
    ) -> Option<Origin> {
        let browsing_group = match context.browsing_group {
            Some(group) => {
                if self.inner.config.origin_agent_cluster_process_isolation {
                    let requested = OacIsolationState::from_request(
                        requests_origin_keyed_process,
                        requests_origin_keyed_process,
                    );
                    let state = self
                        .inner
                        .origin_agent_clusters()
                        .lookup_or(context, origin, requested);
                    if state.requires_origin_keyed_process() {
                        return Some(origin.clone());
                    }
                }
                group
            }
            None => self.inner.browsing_groups.peek_next(),
        };

        self.inner.isolated_origins().get_matching_isolated_origin(
            context.browser_context,
            browsing_group,
            origin,
            site_url,
        )
    }
}
