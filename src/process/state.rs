//! Per-process security state

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use url::Url;

use super::{ProcessId, ProcessLock};
use crate::isolation::{BrowserContextId, BrowsingGroupId};
use crate::origin::{FILE_SCHEME, Origin};
use crate::utils::ContractViolation;

/// How far a scheme or origin grant reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitRequestPolicy {
    RequestOnly,
    CommitAndRequest,
}

/// Permission bits for files and isolated filesystems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FilePermissions(u32);

impl FilePermissions {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    pub const CREATE_NEW: Self = Self(1 << 2);
    pub const CREATE_OVERWRITE: Self = Self(1 << 3);
    pub const DELETE: Self = Self(1 << 4);
    /// Used by media galleries
    pub const COPY_INTO: Self = Self(1 << 5);

    pub const READ_GRANT: Self = Self::READ;
    pub const WRITE_GRANT: Self = Self::WRITE;
    pub const CREATE_NEW_GRANT: Self = Self(Self::CREATE_NEW.0 | Self::COPY_INTO.0);
    pub const CREATE_READ_WRITE_GRANT: Self = Self(
        Self::CREATE_NEW.0
            | Self::CREATE_OVERWRITE.0
            | Self::READ.0
            | Self::WRITE.0
            | Self::COPY_INTO.0
            | Self::DELETE.0,
    );
    pub const COPY_INTO_GRANT: Self = Self::COPY_INTO;
    pub const DELETE_GRANT: Self = Self::DELETE;

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for FilePermissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for FilePermissions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Bindings and other privileged capabilities a process was given
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CapabilityBits(u32);

impl CapabilityBits {
    pub const NONE: Self = Self(0);
    pub const WEB_UI: Self = Self(1 << 0);
    pub const MOJO_WEB_UI: Self = Self(1 << 1);
    pub const EXTENSION: Self = Self(1 << 2);

    const WEB_UI_MASK: Self = Self(Self::WEB_UI.0 | Self::MOJO_WEB_UI.0);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn has_web_ui(self) -> bool {
        self.intersects(Self::WEB_UI_MASK)
    }
}

impl BitOr for CapabilityBits {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Lifetime hooks for isolated filesystems.
///
/// Every filesystem id a process holds a grant for keeps one reference,
/// released when the state is destroyed.
pub trait FileSystemReferences: Send + Sync {
    fn add_reference(&self, filesystem_id: &str);
    fn remove_reference(&self, filesystem_id: &str);
}

/// Security state of one renderer process.
pub struct SecurityState {
    scheme_grants: HashMap<String, CommitRequestPolicy>,
    origin_grants: HashMap<Origin, CommitRequestPolicy>,
    file_grants: HashMap<PathBuf, FilePermissions>,
    request_only_files: HashSet<PathBuf>,
    filesystem_grants: HashMap<String, FilePermissions>,
    capability_bits: CapabilityBits,
    can_read_raw_cookies: bool,
    can_send_midi_sysex: bool,
    process_lock: ProcessLock,
    browsing_group_ids: BTreeSet<BrowsingGroupId>,
    max_browsing_group_count: usize,
    browser_context: Option<BrowserContextId>,
    is_process_used: bool,
    file_systems: Arc<dyn FileSystemReferences>,
}

impl SecurityState {
    pub fn new(browser_context: BrowserContextId, file_systems: Arc<dyn FileSystemReferences>) -> Self {
        Self {
            scheme_grants: HashMap::new(),
            origin_grants: HashMap::new(),
            file_grants: HashMap::new(),
            request_only_files: HashSet::new(),
            filesystem_grants: HashMap::new(),
            capability_bits: CapabilityBits::NONE,
            can_read_raw_cookies: false,
            can_send_midi_sysex: false,
            process_lock: ProcessLock::invalid(),
            browsing_group_ids: BTreeSet::new(),
            max_browsing_group_count: 0,
            browser_context: Some(browser_context),
            is_process_used: false,
            file_systems,
        }
    }

    /// Allow requesting and committing URLs of `origin`
    pub fn grant_commit_origin(&mut self, origin: &Origin) {
        if origin.is_opaque() {
            return;
        }
        self.origin_grants
            .insert(origin.clone(), CommitRequestPolicy::CommitAndRequest);
    }

    pub fn grant_request_origin(&mut self, origin: &Origin) {
        if origin.is_opaque() {
            return;
        }
        // Existing entries already allow requests.
        self.origin_grants
            .entry(origin.clone())
            .or_insert(CommitRequestPolicy::RequestOnly);
    }

    pub fn grant_commit_scheme(&mut self, scheme: &str) {
        self.scheme_grants
            .insert(scheme.to_string(), CommitRequestPolicy::CommitAndRequest);
    }

    pub fn grant_request_scheme(&mut self, scheme: &str) {
        self.scheme_grants
            .entry(scheme.to_string())
            .or_insert(CommitRequestPolicy::RequestOnly);
    }

    pub fn grant_permissions_for_file(&mut self, file: &Path, permissions: FilePermissions) {
        *self.file_grants.entry(file.to_path_buf()).or_default() |= permissions;
    }

    /// Allow loading one file:// URL without granting the scheme
    pub fn grant_request_of_specific_file(&mut self, file: &Path) {
        self.request_only_files.insert(file.to_path_buf());
    }

    pub fn revoke_all_permissions_for_file(&mut self, file: &Path) {
        self.file_grants.remove(file);
        self.request_only_files.remove(file);
    }

    pub fn grant_permissions_for_file_system(&mut self, filesystem_id: &str, permissions: FilePermissions) {
        match self.filesystem_grants.get_mut(filesystem_id) {
            Some(granted) => *granted |= permissions,
            None => {
                self.file_systems.add_reference(filesystem_id);
                self.filesystem_grants
                    .insert(filesystem_id.to_string(), permissions);
            }
        }
    }

    pub fn has_permissions_for_file_system(&self, filesystem_id: &str, permissions: FilePermissions) -> bool {
        self.filesystem_grants
            .get(filesystem_id)
            .is_some_and(|granted| granted.contains(permissions))
    }

    pub fn grant_capability_bits(&mut self, bits: CapabilityBits) {
        self.capability_bits = self.capability_bits | bits;
    }

    pub fn grant_read_raw_cookies(&mut self) {
        self.can_read_raw_cookies = true;
    }

    pub fn revoke_read_raw_cookies(&mut self) {
        self.can_read_raw_cookies = false;
    }

    pub fn grant_send_midi_sysex(&mut self) {
        self.can_send_midi_sysex = true;
    }

    /// Whether grants allow committing `url`. Callers unwrap blob: and
    /// filesystem: URLs first.
    pub fn can_commit_url(&self, url: &Url) -> bool {
        // A scheme grant covers every URL of the scheme.
        if self.scheme_grants.get(url.scheme()) == Some(&CommitRequestPolicy::CommitAndRequest) {
            return true;
        }

        if self.origin_grants.get(&Origin::from_url(url)) == Some(&CommitRequestPolicy::CommitAndRequest) {
            return true;
        }

        // Dropped files may be loaded without the whole file scheme.
        if url.scheme() == FILE_SCHEME {
            if let Ok(path) = url.to_file_path() {
                return self.request_only_files.contains(&path);
            }
        }

        false
    }

    pub fn can_request_url(&self, url: &Url) -> bool {
        if self.scheme_grants.contains_key(url.scheme()) {
            return true;
        }
        if self.origin_grants.contains_key(&Origin::from_url(url)) {
            return true;
        }
        self.can_commit_url(url)
    }

    /// Whether `file` or one of its ancestors carries all of `permissions`.
    ///
    /// The nearest ancestor with any grant decides. `..` components are
    /// resolved while walking up; relative paths never match.
    pub fn has_permissions_for_file(&self, file: &Path, permissions: FilePermissions) -> bool {
        if permissions.is_empty() || file.as_os_str().is_empty() || !file.is_absolute() {
            return false;
        }

        let components: Vec<Component<'_>> = file.components().collect();
        let mut skip = 0usize;
        for end in (1..=components.len()).rev() {
            match components[end - 1] {
                Component::ParentDir => skip += 1,
                Component::CurDir if skip > 0 => {}
                _ if skip > 0 => skip -= 1,
                _ => {
                    let candidate: PathBuf = components[..end].iter().collect();
                    if let Some(granted) = self.file_grants.get(&candidate) {
                        return granted.contains(permissions);
                    }
                }
            }
        }
        false
    }

    /// Apply a new lock.
    ///
    /// Valid transitions: invalid to anything valid, allow-any-site to
    /// allow-any-site, and allow-any-site to locked while the process is
    /// unused. The isolation info must not change once set.
    pub fn set_process_lock(
        &mut self,
        process: ProcessId,
        lock: &ProcessLock,
        browsing_group: Option<BrowsingGroupId>,
        is_process_used: bool,
    ) -> Result<(), ContractViolation> {
        self.check_lock_transition(process, lock, is_process_used)?;

        self.process_lock = lock.clone();
        self.is_process_used |= is_process_used;
        if let Some(group) = browsing_group {
            self.add_browsing_group_id(group);
        }
        Ok(())
    }

    fn check_lock_transition(
        &self,
        process: ProcessId,
        lock: &ProcessLock,
        is_process_used: bool,
    ) -> Result<(), ContractViolation> {
        if lock.is_invalid() {
            return Err(ContractViolation::InvalidLock(process));
        }
        if self.process_lock.is_locked_to_site() {
            return Err(ContractViolation::AlreadyLockedToSite {
                process,
                current: self.process_lock.clone(),
                requested: lock.clone(),
            });
        }
        if self.process_lock.is_invalid() {
            return Ok(());
        }

        if self.process_lock.isolation_info() != lock.isolation_info() {
            let describe = |lock: &ProcessLock| {
                lock.isolation_info()
                    .map_or_else(String::new, ToString::to_string)
            };
            return Err(ContractViolation::IsolationInfoMismatch {
                process,
                current: describe(&self.process_lock),
                requested: describe(lock),
            });
        }
        if lock.is_locked_to_site() && (is_process_used || self.is_process_used) {
            return Err(ContractViolation::LockingUsedProcess {
                process,
                requested: lock.clone(),
            });
        }
        Ok(())
    }

    /// Track another browsing group hosted by this process
    pub fn add_browsing_group_id(&mut self, group: BrowsingGroupId) {
        self.browsing_group_ids.insert(group);
        self.max_browsing_group_count = self
            .max_browsing_group_count
            .max(self.browsing_group_ids.len());
    }

    /// The lock stays in place even if no group is left.
    pub fn clear_browsing_group_id(&mut self, group: BrowsingGroupId) {
        self.browsing_group_ids.remove(&group);
    }

    pub fn clear_browser_context_if_matches(&mut self, browser_context: BrowserContextId) {
        if self.browser_context == Some(browser_context) {
            self.browser_context = None;
        }
    }

    pub fn mark_process_used(&mut self) {
        self.is_process_used = true;
    }

    pub fn process_lock(&self) -> &ProcessLock {
        &self.process_lock
    }

    pub fn browsing_group_ids(&self) -> &BTreeSet<BrowsingGroupId> {
        &self.browsing_group_ids
    }

    pub fn max_browsing_group_count(&self) -> usize {
        self.max_browsing_group_count
    }

    pub fn browser_context(&self) -> Option<BrowserContextId> {
        self.browser_context
    }

    pub fn is_process_used(&self) -> bool {
        self.is_process_used
    }

    pub fn capability_bits(&self) -> CapabilityBits {
        self.capability_bits
    }

    pub fn has_web_ui_bindings(&self) -> bool {
        self.capability_bits.has_web_ui()
    }

    pub fn can_read_raw_cookies(&self) -> bool {
        self.can_read_raw_cookies
    }

    pub fn can_send_midi_sysex(&self) -> bool {
        self.can_send_midi_sysex
    }
}

impl Drop for SecurityState {
    fn drop(&mut self) {
        for filesystem_id in self.filesystem_grants.keys() {
            self.file_systems.remove_reference(filesystem_id);
        }
        log::trace!(
            "security state dropped, max browsing groups per process: {}",
            self.max_browsing_group_count
        );
    }
}

impl fmt::Debug for SecurityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityState")
            .field("process_lock", &self.process_lock)
            .field("browsing_group_ids", &self.browsing_group_ids)
            .field("browser_context", &self.browser_context)
            .field("is_process_used", &self.is_process_used)
            .field("scheme_grants", &self.scheme_grants.len())
            .field("origin_grants", &self.origin_grants.len())
            .field("file_grants", &self.file_grants.len())
            .field("filesystem_grants", &self.filesystem_grants.len())
            .field("capability_bits", &self.capability_bits)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::SiteInfo;
    use crate::process::{StoragePartitionId, WebExposedIsolationInfo};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingFileSystems(Mutex<HashMap<String, i32>>);

    impl FileSystemReferences for CountingFileSystems {
        fn add_reference(&self, filesystem_id: &str) {
            *self.0.lock().unwrap().entry(filesystem_id.to_string()).or_default() += 1;
        }

        fn remove_reference(&self, filesystem_id: &str) {
            *self.0.lock().unwrap().entry(filesystem_id.to_string()).or_default() -= 1;
        }
    }

    const P: ProcessId = ProcessId::new(1);

    fn state() -> SecurityState {
        SecurityState::new(BrowserContextId::new(1), Arc::new(CountingFileSystems::default()))
    }

    fn url(spec: &str) -> Url {
        Url::parse(spec).unwrap()
    }

    fn locked_to(spec: &str) -> ProcessLock {
        ProcessLock::from_site_info(&SiteInfo::new(url(spec)))
    }

    fn any_site() -> ProcessLock {
        ProcessLock::allow_any_site(StoragePartitionId::default(), WebExposedIsolationInfo::NonIsolated)
    }

    #[test]
    fn test_origin_grants() {
        let mut state = state();
        let a = Origin::parse("https://a.test").unwrap();

        state.grant_request_origin(&a);
        assert!(state.can_request_url(&url("https://a.test/x")));
        assert!(!state.can_commit_url(&url("https://a.test/x")));

        state.grant_commit_origin(&a);
        assert!(state.can_commit_url(&url("https://a.test/x")));

        // A later request grant never downgrades.
        state.grant_request_origin(&a);
        assert!(state.can_commit_url(&url("https://a.test/x")));
        assert!(!state.can_request_url(&url("https://b.test/x")));
    }

    #[test]
    fn test_opaque_origins_are_not_stored() {
        let mut state = state();
        state.grant_commit_origin(&Origin::new_opaque());
        state.grant_request_origin(&Origin::new_opaque());
        assert!(state.origin_grants.is_empty());
    }

    #[test]
    fn test_scheme_grants_are_idempotent() {
        let mut state = state();
        state.grant_request_scheme("chrome-extension");
        state.grant_request_scheme("chrome-extension");
        assert_eq!(state.scheme_grants.len(), 1);
        assert!(state.can_request_url(&url("chrome-extension://id/page")));
        assert!(!state.can_commit_url(&url("chrome-extension://id/page")));

        state.grant_commit_scheme("chrome-extension");
        state.grant_request_scheme("chrome-extension");
        assert_eq!(
            state.scheme_grants.get("chrome-extension"),
            Some(&CommitRequestPolicy::CommitAndRequest)
        );
    }

    #[test]
    fn test_specific_file_requests() {
        let mut state = state();
        state.grant_request_of_specific_file(Path::new("/home/user/dropped.html"));
        assert!(state.can_commit_url(&url("file:///home/user/dropped.html")));
        assert!(!state.can_commit_url(&url("file:///home/user/other.html")));

        state.revoke_all_permissions_for_file(Path::new("/home/user/dropped.html"));
        assert!(!state.can_commit_url(&url("file:///home/user/dropped.html")));
    }

    #[test]
    fn test_file_permissions_walk_up() {
        let mut state = state();
        state.grant_permissions_for_file(Path::new("/home/user/"), FilePermissions::READ_GRANT);

        assert!(state.has_permissions_for_file(Path::new("/home/user/docs/a.txt"), FilePermissions::READ));
        assert!(state.has_permissions_for_file(Path::new("/home/user"), FilePermissions::READ));
        assert!(!state.has_permissions_for_file(Path::new("/home/user/a.txt"), FilePermissions::WRITE));
        assert!(!state.has_permissions_for_file(Path::new("/home/other"), FilePermissions::READ));
        assert!(!state.has_permissions_for_file(Path::new("home/user/a.txt"), FilePermissions::READ));
        assert!(!state.has_permissions_for_file(Path::new(""), FilePermissions::READ));
        assert!(!state.has_permissions_for_file(Path::new("/home/user/a.txt"), FilePermissions::NONE));
    }

    #[test]
    fn test_file_permissions_resolve_parent_components() {
        let mut state = state();
        state.grant_permissions_for_file(Path::new("/home/user"), FilePermissions::READ_GRANT);

        assert!(!state.has_permissions_for_file(Path::new("/home/user/../other/secret"), FilePermissions::READ));
        assert!(state.has_permissions_for_file(Path::new("/home/user/docs/../a.txt"), FilePermissions::READ));
    }

    #[test]
    fn test_nearest_grant_decides() {
        let mut state = state();
        state.grant_permissions_for_file(Path::new("/data"), FilePermissions::CREATE_READ_WRITE_GRANT);
        state.grant_permissions_for_file(Path::new("/data/readonly"), FilePermissions::READ_GRANT);

        assert!(state.has_permissions_for_file(Path::new("/data/x"), FilePermissions::WRITE));
        assert!(!state.has_permissions_for_file(Path::new("/data/readonly/x"), FilePermissions::WRITE));
    }

    #[test]
    fn test_file_system_references_follow_grants() {
        let file_systems = Arc::new(CountingFileSystems::default());
        let mut state = SecurityState::new(BrowserContextId::new(1), file_systems.clone());

        state.grant_permissions_for_file_system("fs1", FilePermissions::READ_GRANT);
        state.grant_permissions_for_file_system("fs1", FilePermissions::WRITE_GRANT);
        assert_eq!(file_systems.0.lock().unwrap().get("fs1"), Some(&1));
        assert!(state.has_permissions_for_file_system("fs1", FilePermissions::READ | FilePermissions::WRITE));
        assert!(!state.has_permissions_for_file_system("fs1", FilePermissions::DELETE));

        drop(state);
        assert_eq!(file_systems.0.lock().unwrap().get("fs1"), Some(&0));
    }

    #[test]
    fn test_lock_transitions() {
        let mut state = state();
        let group = Some(BrowsingGroupId::new(1));

        assert_eq!(
            state.set_process_lock(P, &ProcessLock::invalid(), group, false),
            Err(ContractViolation::InvalidLock(P))
        );

        state.set_process_lock(P, &any_site(), group, false).unwrap();
        state.set_process_lock(P, &any_site(), group, false).unwrap();
        state.set_process_lock(P, &locked_to("https://a.test"), group, false).unwrap();
        assert_eq!(state.browsing_group_ids().len(), 1);

        let err = state.set_process_lock(P, &locked_to("https://b.test"), group, false);
        assert!(matches!(err, Err(ContractViolation::AlreadyLockedToSite { .. })));
        assert_eq!(state.process_lock(), &locked_to("https://a.test"));
    }

    #[test]
    fn test_used_process_cannot_be_tightened() {
        let mut state = state();
        state.set_process_lock(P, &any_site(), None, true).unwrap();
        let err = state.set_process_lock(P, &locked_to("https://a.test"), None, false);
        assert!(matches!(err, Err(ContractViolation::LockingUsedProcess { .. })));
        assert!(state.process_lock().allows_any_site());
    }

    #[test]
    fn test_isolation_info_must_not_change() {
        let mut state = state();
        state.set_process_lock(P, &any_site(), None, false).unwrap();
        let isolated = ProcessLock::allow_any_site(
            StoragePartitionId::default(),
            WebExposedIsolationInfo::Isolated(Origin::parse("https://a.test").unwrap()),
        );
        let err = state.set_process_lock(P, &isolated, None, false);
        assert!(matches!(err, Err(ContractViolation::IsolationInfoMismatch { .. })));
    }

    #[test]
    fn test_browsing_group_tracking() {
        let mut state = state();
        state.add_browsing_group_id(BrowsingGroupId::new(2));
        state.add_browsing_group_id(BrowsingGroupId::new(1));
        state.add_browsing_group_id(BrowsingGroupId::new(2));
        assert_eq!(
            state.browsing_group_ids().iter().copied().collect::<Vec<_>>(),
            vec![BrowsingGroupId::new(1), BrowsingGroupId::new(2)]
        );
        state.clear_browsing_group_id(BrowsingGroupId::new(1));
        assert_eq!(state.browsing_group_ids().len(), 1);
        assert_eq!(state.max_browsing_group_count(), 2);
    }

    #[test]
    fn test_capabilities() {
        let mut state = state();
        assert!(!state.has_web_ui_bindings());
        state.grant_capability_bits(CapabilityBits::MOJO_WEB_UI);
        assert!(state.has_web_ui_bindings());
        assert!(state.capability_bits().contains(CapabilityBits::MOJO_WEB_UI));

        state.grant_read_raw_cookies();
        assert!(state.can_read_raw_cookies());
        state.revoke_read_raw_cookies();
        assert!(!state.can_read_raw_cookies());
    }
}
