//! The process-isolation security policy
//!
//! [`SecurityPolicy`] tracks what every renderer process may request,
//! commit and read, and decides which process a URL belongs in:
//! - Process lifecycle and grants (this module)
//! - Access decisions (`access`)
//! - Site and lock computation (`site_info`)
//! - Isolated origins, origin-agent-cluster and browsing groups (`origins`)
//! - Files and filesystems (`filesystem`)
//! - Denial reports (`diagnostics`)

mod access;
mod diagnostics;
mod filesystem;
mod origins;
mod site_info;

pub use access::CanCommitStatus;
pub use diagnostics::{AccessDenial, DenialObserver, LogDenialObserver};
pub use filesystem::{FileSystemPermissionPolicy, FileSystemType, FileSystemUrl, IsolatedFileSystemRegistry};
pub use site_info::{ERROR_PAGE_SITE, SiteInfo};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use url::Url;

use crate::config::PolicyConfig;
use crate::embedder::{DefaultPolicyDelegate, PolicyDelegate};
use crate::isolation::{
    BrowserContextId, BrowsingGroupIdAllocator, IsolatedOriginPattern, IsolatedOriginRegistry,
    IsolatedOriginSource, IsolationContext, OriginAgentClusterTracker,
};
use crate::origin::{
    ABOUT_SCHEME, BLOB_SCHEME, DATA_SCHEME, FILESYSTEM_SCHEME, HTTP_SCHEME, HTTPS_SCHEME, JAVASCRIPT_SCHEME,
    Origin, VIEW_SOURCE_SCHEME, WS_SCHEME, WSS_SCHEME, is_blob_or_filesystem, is_malformed_blob_url,
};
use crate::process::{CapabilityBits, Handle, ProcessId, ProcessLock, SecurityState, SecurityStateStore};
use crate::process::FileSystemReferences;
use crate::scheduler::{ExecutionContext, TaskRunner, TokioTaskRunner};
use crate::utils::error::{ContractViolation, Result, fatal};
use filesystem::default_file_system_policies;

/// Schemes with process-independent treatment
#[derive(Debug, Default)]
struct SchemeRegistry {
    /// Any process may request these
    request_in_any_process: HashSet<String>,
    /// Any process may commit these, given a compatible lock
    commit_in_any_process: HashSet<String>,
    /// Schemes that never load content of their own
    pseudo: HashSet<String>,
}

impl SchemeRegistry {
    fn with_defaults() -> Self {
        let mut registry = Self::default();
        for scheme in [HTTP_SCHEME, HTTPS_SCHEME, WS_SCHEME, WSS_SCHEME, DATA_SCHEME, BLOB_SCHEME, FILESYSTEM_SCHEME] {
            registry.add_web_safe(scheme);
        }
        for scheme in [ABOUT_SCHEME, JAVASCRIPT_SCHEME, VIEW_SOURCE_SCHEME] {
            registry.add_pseudo(scheme);
        }
        registry
    }

    fn add_web_safe(&mut self, scheme: &str) -> bool {
        let added = self.request_in_any_process.insert(scheme.to_string());
        self.commit_in_any_process.insert(scheme.to_string());
        added
    }

    fn add_web_safe_isolated(&mut self, scheme: &str) -> bool {
        self.request_in_any_process.insert(scheme.to_string())
    }

    fn add_pseudo(&mut self, scheme: &str) -> bool {
        self.pseudo.insert(scheme.to_string())
    }

    fn is_web_safe(&self, scheme: &str) -> bool {
        self.request_in_any_process.contains(scheme)
    }

    fn is_commit_safe(&self, scheme: &str) -> bool {
        self.commit_in_any_process.contains(scheme)
    }

    fn is_pseudo(&self, scheme: &str) -> bool {
        self.pseudo.contains(scheme)
    }
}

/// Everything guarded by the process table lock
struct ProcessTable {
    store: SecurityStateStore,
    schemes: SchemeRegistry,
    file_system_policies: HashMap<filesystem::FileSystemType, FileSystemPermissionPolicy>,
}

/// Shared state behind every [`SecurityPolicy`] clone.
///
/// The three mutexes are never held at the same time.
struct PolicyInner {
    config: PolicyConfig,
    processes: Mutex<ProcessTable>,
    isolated_origins: Mutex<IsolatedOriginRegistry>,
    origin_agent_clusters: Mutex<OriginAgentClusterTracker>,
    browsing_groups: BrowsingGroupIdAllocator,
    delegate: Arc<dyn PolicyDelegate>,
    observer: Arc<dyn DenialObserver>,
    task_runner: Arc<dyn TaskRunner>,
    file_systems: Arc<dyn FileSystemReferences>,
}

impl PolicyInner {
    // Every critical section leaves its data consistent, so a poisoned lock
    // is safe to reuse.

    fn processes(&self) -> MutexGuard<'_, ProcessTable> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn isolated_origins(&self) -> MutexGuard<'_, IsolatedOriginRegistry> {
        self.isolated_origins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn origin_agent_clusters(&self) -> MutexGuard<'_, OriginAgentClusterTracker> {
        self.origin_agent_clusters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builder for a [`SecurityPolicy`] with custom collaborators
pub struct SecurityPolicyBuilder {
    config: PolicyConfig,
    delegate: Arc<dyn PolicyDelegate>,
    observer: Arc<dyn DenialObserver>,
    task_runner: Option<Arc<dyn TaskRunner>>,
    file_systems: Arc<dyn FileSystemReferences>,
}

impl SecurityPolicyBuilder {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            delegate: Arc::new(DefaultPolicyDelegate),
            observer: Arc::new(LogDenialObserver),
            task_runner: None,
            file_systems: Arc::new(IsolatedFileSystemRegistry::new()),
        }
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn PolicyDelegate>) -> Self {
        self.delegate = delegate;
        self
    }

    pub fn with_denial_observer(mut self, observer: Arc<dyn DenialObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Runner for delayed cleanup. Defaults to the tokio runtime of the
    /// caller.
    pub fn with_task_runner(mut self, task_runner: Arc<dyn TaskRunner>) -> Self {
        self.task_runner = Some(task_runner);
        self
    }

    pub fn with_file_system_references(mut self, file_systems: Arc<dyn FileSystemReferences>) -> Self {
        self.file_systems = file_systems;
        self
    }

    pub fn build(self) -> SecurityPolicy {
        let task_runner = self
            .task_runner
            .unwrap_or_else(|| Arc::new(TokioTaskRunner::new()));

        let startup_origins: Vec<IsolatedOriginPattern> = self
            .config
            .isolated_origins
            .iter()
            .map(|pattern| IsolatedOriginPattern::parse(pattern))
            .collect();

        let inner = PolicyInner {
            processes: Mutex::new(ProcessTable {
                store: SecurityStateStore::new(),
                schemes: SchemeRegistry::with_defaults(),
                file_system_policies: default_file_system_policies(),
            }),
            isolated_origins: Mutex::new(IsolatedOriginRegistry::new()),
            origin_agent_clusters: Mutex::new(OriginAgentClusterTracker::new()),
            browsing_groups: BrowsingGroupIdAllocator::new(),
            config: self.config,
            delegate: self.delegate,
            observer: self.observer,
            task_runner,
            file_systems: self.file_systems,
        };
        let policy = SecurityPolicy { inner: Arc::new(inner) };

        if !startup_origins.is_empty() {
            let added = policy.add_isolated_origin_patterns(&startup_origins, IsolatedOriginSource::CommandLine, None);
            log::info!("Registered {} isolated origins from configuration", added);
        }
        policy
    }
}

/// Process-isolation security policy.
///
/// Cheap to clone; clones share state. Constructed explicitly and handed to
/// the navigation, storage and filesystem code that consults it.
#[derive(Clone)]
pub struct SecurityPolicy {
    inner: Arc<PolicyInner>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}

impl fmt::Debug for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityPolicy")
            .field("config", &self.inner.config)
            .field("next_browsing_group", &self.inner.browsing_groups.peek_next())
            .finish_non_exhaustive()
    }
}

impl SecurityPolicy {
    /// Policy with default collaborators
    pub fn new(config: PolicyConfig) -> Self {
        SecurityPolicyBuilder::new(config).build()
    }

    pub fn builder(config: PolicyConfig) -> SecurityPolicyBuilder {
        SecurityPolicyBuilder::new(config)
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.inner.config
    }

    // Schemes

    /// Any process may request and commit URLs of `scheme`
    pub fn register_web_safe_scheme(&self, scheme: &str) {
        if !self.inner.processes().schemes.add_web_safe(scheme) {
            log::warn!("Web-safe scheme {scheme} registered twice");
        }
    }

    /// Any process may request URLs of `scheme`; committing still needs a grant
    pub fn register_web_safe_isolated_scheme(&self, scheme: &str) {
        if !self.inner.processes().schemes.add_web_safe_isolated(scheme) {
            log::warn!("Web-safe isolated scheme {scheme} registered twice");
        }
    }

    pub fn register_pseudo_scheme(&self, scheme: &str) {
        if !self.inner.processes().schemes.add_pseudo(scheme) {
            log::warn!("Pseudo scheme {scheme} registered twice");
        }
    }

    pub fn is_web_safe_scheme(&self, scheme: &str) -> bool {
        self.inner.processes().schemes.is_web_safe(scheme)
    }

    pub fn is_pseudo_scheme(&self, scheme: &str) -> bool {
        self.inner.processes().schemes.is_pseudo(scheme)
    }

    // Process lifecycle

    /// Register a new renderer process.
    ///
    /// # Panics
    ///
    /// If the process is already registered.
    #[track_caller]
    pub fn add(&self, process: ProcessId, browser_context: BrowserContextId) {
        if let Err(error) = self.try_add(process, browser_context) {
            fatal(error);
        }
    }

    pub fn try_add(&self, process: ProcessId, browser_context: BrowserContextId) -> Result<()> {
        let state = SecurityState::new(browser_context, self.inner.file_systems.clone());
        let stale = self.inner.processes().store.add(process, state)?;
        if let Some(stale) = stale {
            log::debug!("Process {} re-added before its old state was purged", process);
            drop(stale);
        }
        log::debug!("Added process {} for {}", process, browser_context);
        Ok(())
    }

    /// Unregister a process. Its state stays queryable through existing
    /// [`Handle`]s.
    pub fn remove(&self, process: ProcessId) {
        let result = self.inner.processes().store.remove(process);
        match result {
            Ok(true) => self.schedule_purge(process),
            Ok(false) => log::debug!("Process {} removed while handles exist", process),
            Err(violation) => log::error!("{violation}"),
        }
    }

    /// Apply `lock` to the process and track the context's browsing group.
    ///
    /// # Panics
    ///
    /// On an invalid lock transition, e.g. relocking a process that is
    /// already locked to a site. The existing lock is kept.
    #[track_caller]
    pub fn lock_process(&self, context: &IsolationContext, process: ProcessId, is_process_used: bool, lock: &ProcessLock) {
        if let Err(error) = self.try_lock_process(context, process, is_process_used, lock) {
            fatal(error);
        }
    }

    pub fn try_lock_process(
        &self,
        context: &IsolationContext,
        process: ProcessId,
        is_process_used: bool,
        lock: &ProcessLock,
    ) -> Result<()> {
        let mut table = self.inner.processes();
        let Some(state) = table.store.get_mut(process) else {
            return Err(ContractViolation::UnknownProcess(process).into());
        };
        state.set_process_lock(process, lock, context.browsing_group, is_process_used)?;
        log::debug!(target: "binix_isolation::lock", "Process {} locked to {}", process, lock);
        Ok(())
    }

    /// Current lock, invalid for unknown processes
    pub fn process_lock(&self, process: ProcessId) -> ProcessLock {
        self.inner
            .processes()
            .store
            .get(process)
            .map_or_else(ProcessLock::invalid, |state| state.process_lock().clone())
    }

    /// Track another browsing group hosted by an already locked process
    pub fn include_isolation_context(&self, process: ProcessId, context: &IsolationContext) {
        let Some(group) = context.browsing_group else {
            return;
        };
        if let Some(state) = self.inner.processes().store.get_mut(process) {
            state.add_browsing_group_id(group);
        }
    }

    pub fn mark_process_used(&self, process: ProcessId) {
        if let Some(state) = self.inner.processes().store.get_mut(process) {
            state.mark_process_used();
        }
    }

    /// Browsing groups the process currently hosts
    pub fn browsing_group_count(&self, process: ProcessId) -> usize {
        self.inner
            .processes()
            .store
            .get(process)
            .map_or(0, |state| state.browsing_group_ids().len())
    }

    // Handles

    /// Handle keeping the process' state queryable. Invalid if the process
    /// is not registered.
    pub fn create_handle(&self, process: ProcessId) -> Handle {
        Handle::new(self, process, false)
    }

    pub(crate) fn add_process_reference(&self, process: ProcessId, duplicating: bool) -> bool {
        let result = self.inner.processes().store.add_reference(process, duplicating);
        match result {
            Ok(added) => added,
            Err(violation) => fatal(violation.into()),
        }
    }

    pub(crate) fn remove_process_reference(&self, process: ProcessId) {
        let result = self.inner.processes().store.remove_reference(process);
        match result {
            Ok(true) => self.schedule_purge(process),
            Ok(false) => {}
            Err(violation) => log::error!("{violation}"),
        }
    }

    fn schedule_purge(&self, process: ProcessId) {
        self.post_cleanup(move |policy| {
            let _io = ExecutionContext::Io.enter();
            // Dropped after the table lock is released.
            let purged = policy.inner.processes().store.purge(process);
            if purged.is_some() {
                log::debug!("Purged security state of process {}", process);
            }
        });
    }

    /// Run `task` once the cleanup grace period passed, unless the policy is
    /// gone by then.
    fn post_cleanup(&self, task: impl FnOnce(SecurityPolicy) + Send + 'static) {
        let delay = self.inner.config.cleanup_delay();
        if delay.is_zero() {
            task(self.clone());
            return;
        }
        let inner = Arc::downgrade(&self.inner);
        self.inner.task_runner.post_delayed(
            delay,
            Box::new(move || {
                if let Some(inner) = inner.upgrade() {
                    task(SecurityPolicy { inner });
                }
            }),
        );
    }

    // URL grants

    /// Allow the process to commit `url`.
    ///
    /// blob: and filesystem: URLs grant their inner origin. Schemes without
    /// a host are granted as a whole.
    pub fn grant_commit_url(&self, process: ProcessId, url: &Url) {
        if self.is_pseudo_scheme(url.scheme()) {
            return;
        }

        let origin = Origin::from_url(url);
        if is_blob_or_filesystem(url) {
            if is_malformed_blob_url(url) {
                return;
            }
            if let Some(inner) = origin.to_url() {
                self.grant_commit_url(process, &inner);
            }
            return;
        }

        let mut table = self.inner.processes();
        let web_safe = table.schemes.is_web_safe(url.scheme());
        let Some(state) = table.store.get_mut(process) else {
            return;
        };
        if !origin.is_opaque() {
            state.grant_commit_origin(&origin);
        }
        if web_safe {
            return;
        }
        if origin.is_opaque() {
            state.grant_commit_scheme(url.scheme());
        } else {
            state.grant_request_scheme(url.scheme());
        }
    }

    /// Allow the process to request `url` without committing it
    pub fn grant_request_url(&self, process: ProcessId, url: &Url) {
        if self.is_pseudo_scheme(url.scheme()) {
            return;
        }

        let origin = Origin::from_url(url);
        if is_blob_or_filesystem(url) {
            if is_malformed_blob_url(url) {
                return;
            }
            if let Some(inner) = origin.to_url() {
                self.grant_request_url(process, &inner);
            }
            return;
        }

        let mut table = self.inner.processes();
        if table.schemes.is_web_safe(url.scheme()) {
            return;
        }
        let Some(state) = table.store.get_mut(process) else {
            return;
        };
        if origin.is_opaque() {
            state.grant_request_scheme(url.scheme());
        } else {
            state.grant_request_origin(&origin);
        }
    }

    pub fn grant_commit_origin(&self, process: ProcessId, origin: &Origin) {
        if let Some(state) = self.inner.processes().store.get_mut(process) {
            state.grant_commit_origin(origin);
        }
    }

    pub fn grant_request_origin(&self, process: ProcessId, origin: &Origin) {
        if let Some(state) = self.inner.processes().store.get_mut(process) {
            state.grant_request_origin(origin);
        }
    }

    /// Allow requesting every URL of `scheme`
    pub fn grant_request_scheme(&self, process: ProcessId, scheme: &str) {
        if let Some(state) = self.inner.processes().store.get_mut(process) {
            state.grant_request_scheme(scheme);
        }
    }

    // Capabilities

    pub fn grant_capability_bits(&self, process: ProcessId, bits: CapabilityBits) {
        if let Some(state) = self.inner.processes().store.get_mut(process) {
            state.grant_capability_bits(bits);
        }
    }

    pub fn has_capability_bits(&self, process: ProcessId, bits: CapabilityBits) -> bool {
        self.inner
            .processes()
            .store
            .get(process)
            .is_some_and(|state| state.capability_bits().contains(bits))
    }

    pub fn has_web_ui_bindings(&self, process: ProcessId) -> bool {
        self.inner
            .processes()
            .store
            .get(process)
            .is_some_and(SecurityState::has_web_ui_bindings)
    }

    pub fn grant_read_raw_cookies(&self, process: ProcessId) {
        if let Some(state) = self.inner.processes().store.get_mut(process) {
            state.grant_read_raw_cookies();
        }
    }

    pub fn revoke_read_raw_cookies(&self, process: ProcessId) {
        if let Some(state) = self.inner.processes().store.get_mut(process) {
            state.revoke_read_raw_cookies();
        }
    }

    pub fn can_read_raw_cookies(&self, process: ProcessId) -> bool {
        self.inner
            .processes()
            .store
            .get(process)
            .is_some_and(SecurityState::can_read_raw_cookies)
    }

    pub fn grant_send_midi_sysex(&self, process: ProcessId) {
        if let Some(state) = self.inner.processes().store.get_mut(process) {
            state.grant_send_midi_sysex();
        }
    }

    pub fn can_send_midi_sysex(&self, process: ProcessId) -> bool {
        self.inner
            .processes()
            .store
            .get(process)
            .is_some_and(SecurityState::can_send_midi_sysex)
    }

    // Profiles

    /// Forget a profile that is being destroyed.
    ///
    /// Isolated origins and opt-in history scoped to it are dropped, and
    /// processes of the profile fail every data access check from now on.
    pub fn remove_state_for_browser_context(&self, browser_context: BrowserContextId) {
        self.inner
            .isolated_origins()
            .remove_for_browser_context(browser_context);
        self.inner
            .origin_agent_clusters()
            .remove_for_browser_context(browser_context);

        let mut table = self.inner.processes();
        for state in table.store.all_states_mut() {
            state.clear_browser_context_if_matches(browser_context);
        }
        log::debug!("Removed policy state of {}", browser_context);
    }

    // Diagnostics

    /// Lock of a process about to be terminated, for crash reports
    pub fn killed_process_origin_lock(&self, process: ProcessId) -> String {
        let table = self.inner.processes();
        match table.store.get(process) {
            None => "(child id not found)".to_string(),
            Some(state) if state.browser_context().is_none() => "(empty and null context)".to_string(),
            Some(state) => state.process_lock().to_string(),
        }
    }

    pub fn log_killed_process_origin_lock(&self, process: ProcessId) {
        let lock = self.killed_process_origin_lock(process);
        log::warn!(
            target: "binix_isolation::kill",
            process_id = process.value(),
            lock = lock.as_str();
            "Terminating process {} with lock {}",
            process,
            lock
        );
    }
}
