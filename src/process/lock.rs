//! Process locks: what a renderer process is allowed to host

use std::fmt;

use url::Url;

use crate::origin::{BLOB_SCHEME, Origin};
use crate::policy::SiteInfo;

/// Identifies the storage partition a process renders into
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StoragePartitionId {
    pub domain: String,
    pub name: String,
    pub in_memory: bool,
}

impl StoragePartitionId {
    pub fn new(domain: &str, name: &str, in_memory: bool) -> Self {
        Self {
            domain: domain.to_string(),
            name: name.to_string(),
            in_memory,
        }
    }

    /// The default partition of a profile
    pub fn is_default(&self) -> bool {
        self.domain.is_empty() && self.name.is_empty() && !self.in_memory
    }
}

impl fmt::Display for StoragePartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            return f.write_str("default");
        }
        write!(f, "{}/{}", self.domain, self.name)?;
        if self.in_memory {
            f.write_str(" (in memory)")?;
        }
        Ok(())
    }
}

/// Cross-origin isolation a process exposes to the web
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum WebExposedIsolationInfo {
    #[default]
    NonIsolated,
    /// Cross-origin isolated by COOP/COEP on the given top-level origin
    Isolated(Origin),
    /// Isolated application with elevated capabilities
    IsolatedApplication(Origin),
}

impl WebExposedIsolationInfo {
    pub fn is_isolated(&self) -> bool {
        !matches!(self, Self::NonIsolated)
    }

    pub fn is_isolated_application(&self) -> bool {
        matches!(self, Self::IsolatedApplication(_))
    }
}

impl fmt::Display for WebExposedIsolationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonIsolated => f.write_str("non-isolated"),
            Self::Isolated(origin) => write!(f, "isolated:{origin}"),
            Self::IsolatedApplication(origin) => write!(f, "isolated-app:{origin}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LockDetails {
    /// `None` when the process may host any site
    lock_url: Option<Url>,
    is_origin_keyed_process: bool,
    storage_partition: StoragePartitionId,
    isolation_info: WebExposedIsolationInfo,
    is_pdf: bool,
    is_sandboxed: bool,
    unique_sandbox_id: Option<u64>,
}

/// Restriction on the documents a process may host.
///
/// A lock is either invalid (nothing assigned yet), allows any site, or is
/// locked to a single site or origin. Two locks are equal only when every
/// field matches.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessLock(Option<LockDetails>);

impl ProcessLock {
    /// Lock of a process nothing has been assigned to
    pub fn invalid() -> Self {
        Self(None)
    }

    /// Lock for a process shared by sites that don't need isolation
    pub fn allow_any_site(
        storage_partition: StoragePartitionId,
        isolation_info: WebExposedIsolationInfo,
    ) -> Self {
        Self(Some(LockDetails {
            lock_url: None,
            is_origin_keyed_process: false,
            storage_partition,
            isolation_info,
            is_pdf: false,
            is_sandboxed: false,
            unique_sandbox_id: None,
        }))
    }

    /// Lock for the site described by `site_info`
    pub fn from_site_info(site_info: &SiteInfo) -> Self {
        Self(Some(LockDetails {
            lock_url: Some(site_info.process_lock_url().clone()),
            is_origin_keyed_process: site_info.requires_origin_keyed_process(),
            storage_partition: site_info.storage_partition().clone(),
            isolation_info: site_info.isolation_info().clone(),
            is_pdf: site_info.is_pdf(),
            is_sandboxed: site_info.is_sandboxed(),
            unique_sandbox_id: site_info.unique_sandbox_id(),
        }))
    }

    pub fn is_invalid(&self) -> bool {
        self.0.is_none()
    }

    pub fn allows_any_site(&self) -> bool {
        self.0.as_ref().is_some_and(|details| details.lock_url.is_none())
    }

    pub fn is_locked_to_site(&self) -> bool {
        self.0.as_ref().is_some_and(|details| details.lock_url.is_some())
    }

    /// Site or origin URL the process is locked to
    pub fn lock_url(&self) -> Option<&Url> {
        self.0.as_ref()?.lock_url.as_ref()
    }

    pub fn is_origin_keyed_process(&self) -> bool {
        self.0.as_ref().is_some_and(|details| details.is_origin_keyed_process)
    }

    pub fn storage_partition(&self) -> Option<&StoragePartitionId> {
        self.0.as_ref().map(|details| &details.storage_partition)
    }

    pub fn isolation_info(&self) -> Option<&WebExposedIsolationInfo> {
        self.0.as_ref().map(|details| &details.isolation_info)
    }

    pub fn is_cross_origin_isolated(&self) -> bool {
        self.isolation_info().is_some_and(WebExposedIsolationInfo::is_isolated)
    }

    pub fn is_pdf(&self) -> bool {
        self.0.as_ref().is_some_and(|details| details.is_pdf)
    }

    pub fn is_sandboxed(&self) -> bool {
        self.0.as_ref().is_some_and(|details| details.is_sandboxed)
    }

    pub fn unique_sandbox_id(&self) -> Option<u64> {
        self.0.as_ref()?.unique_sandbox_id
    }

    /// Whether the lock URL uses `scheme`
    pub fn matches_scheme(&self, scheme: &str) -> bool {
        self.lock_url().is_some_and(|url| url.scheme() == scheme)
    }

    /// Locks of the form `blob:null/<uuid>`, used by blob URLs with an
    /// opaque creator
    pub(crate) fn is_null_blob_lock(&self) -> bool {
        self.lock_url()
            .is_some_and(|url| url.scheme() == BLOB_SCHEME && url.path().starts_with("null/"))
    }
}

impl fmt::Display for ProcessLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(details) = &self.0 else {
            return f.write_str("(none)");
        };

        match &details.lock_url {
            Some(url) => write!(f, "{{ {url}")?,
            None => f.write_str("{ allow_any_site")?,
        }
        if details.is_origin_keyed_process {
            f.write_str(" origin-keyed")?;
        }
        if details.is_pdf {
            f.write_str(" pdf")?;
        }
        if details.is_sandboxed {
            f.write_str(" sandboxed")?;
            if let Some(id) = details.unique_sandbox_id {
                write!(f, "({id})")?;
            }
        }
        if details.isolation_info.is_isolated() {
            write!(f, " {}", details.isolation_info)?;
        }
        if !details.storage_partition.is_default() {
            write!(f, " partition={}", details.storage_partition)?;
        }
        f.write_str(" }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(spec: &str) -> Url {
        Url::parse(spec).unwrap()
    }

    #[test]
    fn test_lock_states_are_exclusive() {
        let invalid = ProcessLock::invalid();
        assert!(invalid.is_invalid());
        assert!(!invalid.allows_any_site());
        assert!(!invalid.is_locked_to_site());
        assert_eq!(invalid, ProcessLock::default());

        let any = ProcessLock::allow_any_site(StoragePartitionId::default(), WebExposedIsolationInfo::NonIsolated);
        assert!(any.allows_any_site());
        assert!(!any.is_locked_to_site());
        assert_eq!(any.lock_url(), None);

        let locked = ProcessLock::from_site_info(&SiteInfo::new(url("https://a.test")));
        assert!(locked.is_locked_to_site());
        assert!(!locked.allows_any_site());
        assert!(locked.matches_scheme("https"));
        assert_ne!(locked, any);
    }

    #[test]
    fn test_lock_equality_covers_every_field() {
        let site = SiteInfo::new(url("https://a.test"));
        let base = ProcessLock::from_site_info(&site);
        assert_eq!(base, ProcessLock::from_site_info(&site.clone()));

        let pdf = ProcessLock::from_site_info(&site.clone().with_pdf(true));
        assert_ne!(base, pdf);

        let partitioned = ProcessLock::from_site_info(
            &site.clone().with_storage_partition(StoragePartitionId::new("app", "store", false)),
        );
        assert_ne!(base, partitioned);

        let isolated = ProcessLock::from_site_info(
            &site.with_isolation_info(WebExposedIsolationInfo::Isolated(Origin::parse("https://a.test").unwrap())),
        );
        assert!(isolated.is_cross_origin_isolated());
        assert_ne!(base, isolated);
    }

    #[test]
    fn test_null_blob_lock() {
        let lock = ProcessLock::from_site_info(&SiteInfo::new(url("blob:null/1234")));
        assert!(lock.is_null_blob_lock());
        let lock = ProcessLock::from_site_info(&SiteInfo::new(url("https://a.test")));
        assert!(!lock.is_null_blob_lock());
    }

    #[test]
    fn test_display() {
        assert_eq!(ProcessLock::invalid().to_string(), "(none)");
        let any = ProcessLock::allow_any_site(StoragePartitionId::default(), WebExposedIsolationInfo::NonIsolated);
        assert_eq!(any.to_string(), "{ allow_any_site }");
        let locked = ProcessLock::from_site_info(
            &SiteInfo::new(url("https://a.test")).with_origin_keyed_process(true),
        );
        assert_eq!(locked.to_string(), "{ https://a.test/ origin-keyed }");
    }
}
