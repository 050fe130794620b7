//! Isolation contexts and the registries that decide what needs isolating
//!
//! - Browsing groups: logical collections of documents that may script
//!   each other, the unit isolation decisions are tracked at
//! - Isolated origins: origins that require a dedicated process
//! - Origin-agent-cluster: per-group opt-in/opt-out decisions

mod isolated_origins;
mod origin_agent_cluster;

pub use isolated_origins::{
    IsolatedOriginEntry, IsolatedOriginPattern, IsolatedOriginRegistry, IsolatedOriginSource,
    parse_isolated_origins,
};
pub use origin_agent_cluster::{OacIsolationState, OriginAgentClusterTracker};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use url::Url;

use crate::origin::Origin;
use crate::process::{StoragePartitionId, WebExposedIsolationInfo};

/// Identifier of a browsing group. Ids are handed out in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrowsingGroupId(u64);

impl BrowsingGroupId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BrowsingGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic browsing group id source
#[derive(Debug)]
pub struct BrowsingGroupIdAllocator {
    next: AtomicU64,
}

impl BrowsingGroupIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Id the next created browsing group will receive
    pub fn peek_next(&self) -> BrowsingGroupId {
        BrowsingGroupId(self.next.load(Ordering::SeqCst))
    }

    /// Allocate a fresh id
    pub fn allocate(&self) -> BrowsingGroupId {
        BrowsingGroupId(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for BrowsingGroupIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies a profile (browser context). Profile-less entries apply
/// globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrowserContextId(u64);

impl BrowserContextId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for BrowserContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "profile#{}", self.0)
    }
}

/// Where an isolation decision is being made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsolationContext {
    /// `None` asks for the latest information, as for a future group
    pub browsing_group: Option<BrowsingGroupId>,
    /// `None` only matches globally scoped entries
    pub browser_context: Option<BrowserContextId>,
}

impl IsolationContext {
    pub fn new(browsing_group: BrowsingGroupId, browser_context: BrowserContextId) -> Self {
        Self {
            browsing_group: Some(browsing_group),
            browser_context: Some(browser_context),
        }
    }

    /// Context outside any browsing group and profile
    pub fn global() -> Self {
        Self::default()
    }
}

/// What a navigation asked for in terms of origin-level isolation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OriginIsolationRequest {
    #[default]
    None,
    /// Origin-Agent-Cluster header without a dedicated process
    OriginAgentCluster,
    /// Origin-Agent-Cluster header asking for an origin-keyed process
    OriginAgentClusterAndKeyedProcess,
}

/// A URL plus the navigation facts that influence its process placement.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlInfo {
    pub url: Url,
    /// Origin the document will commit with, when known
    pub origin: Option<Origin>,
    pub storage_partition: Option<StoragePartitionId>,
    pub isolation_info: Option<WebExposedIsolationInfo>,
    pub origin_isolation_request: OriginIsolationRequest,
    /// Cross-origin-opener-policy asked for a dedicated process
    pub requests_coop_isolation: bool,
    pub is_pdf: bool,
    pub is_sandboxed: bool,
    pub unique_sandbox_id: Option<u64>,
}

impl UrlInfo {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            origin: None,
            storage_partition: None,
            isolation_info: None,
            origin_isolation_request: OriginIsolationRequest::None,
            requests_coop_isolation: false,
            is_pdf: false,
            is_sandboxed: false,
            unique_sandbox_id: None,
        }
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_storage_partition(mut self, partition: StoragePartitionId) -> Self {
        self.storage_partition = Some(partition);
        self
    }

    pub fn with_isolation_info(mut self, info: WebExposedIsolationInfo) -> Self {
        self.isolation_info = Some(info);
        self
    }

    pub fn with_origin_isolation_request(mut self, request: OriginIsolationRequest) -> Self {
        self.origin_isolation_request = request;
        self
    }

    pub fn with_coop_isolation(mut self, requested: bool) -> Self {
        self.requests_coop_isolation = requested;
        self
    }

    pub fn with_pdf(mut self, is_pdf: bool) -> Self {
        self.is_pdf = is_pdf;
        self
    }

    /// Sandboxed frames; `unique_sandbox_id` isolates per document
    pub fn with_sandbox(mut self, is_sandboxed: bool, unique_sandbox_id: Option<u64>) -> Self {
        self.is_sandboxed = is_sandboxed;
        self.unique_sandbox_id = if is_sandboxed { unique_sandbox_id } else { None };
        self
    }

    pub fn requests_origin_agent_cluster(&self) -> bool {
        self.origin_isolation_request != OriginIsolationRequest::None
    }

    pub fn requests_origin_keyed_process(&self) -> bool {
        self.origin_isolation_request == OriginIsolationRequest::OriginAgentClusterAndKeyedProcess
    }
}
