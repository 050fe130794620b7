//! Access decisions: request, commit and data access checks

use std::collections::BTreeSet;

use url::Url;

use super::{AccessDenial, SecurityPolicy};
use crate::isolation::{BrowserContextId, BrowsingGroupId, IsolationContext, UrlInfo};
use crate::origin::{
    DATA_SCHEME, ERROR_PAGE_SCHEME, Origin, inner_url, is_about_blank, is_about_srcdoc, is_blob_or_filesystem,
    is_malformed_blob_url, site_for_origin,
};
use crate::process::{ProcessId, ProcessLock};

/// Result of checking a navigation commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanCommitStatus {
    CanCommitOriginAndUrl,
    CannotCommitOrigin,
    CannotCommitUrl,
}

/// What a data access check needs from a process' state, copied out so the
/// process table lock is not held while computing expected locks.
struct StateSnapshot {
    lock: ProcessLock,
    browsing_groups: BTreeSet<BrowsingGroupId>,
    browser_context: BrowserContextId,
    is_process_used: bool,
}

/// Partial result of a failed check: what the diagnostics need.
struct Denied {
    reason: String,
    expected_lock: Option<ProcessLock>,
}

impl Denied {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            expected_lock: None,
        }
    }
}

/// The URL an embedded blob: or filesystem: URL stands for, `None` when it
/// is malformed.
enum Nested {
    Malformed,
    Opaque,
    Inner(Url),
}

fn nested_target(url: &Url) -> Nested {
    if is_malformed_blob_url(url) {
        return Nested::Malformed;
    }
    let origin = Origin::from_url(url);
    if origin.is_opaque() {
        return Nested::Opaque;
    }
    match origin.to_url().or_else(|| inner_url(url)) {
        Some(inner) => Nested::Inner(inner),
        None => Nested::Malformed,
    }
}

impl SecurityPolicy {
    /// Whether the process may ask the browser to load `url`
    pub fn can_request_url(&self, process: ProcessId, url: &Url) -> bool {
        if self.is_pseudo_scheme(url.scheme()) {
            // Every other pseudo URL is rewritten by the browser before loading.
            return is_about_blank(url) || is_about_srcdoc(url);
        }

        if is_blob_or_filesystem(url) {
            return match nested_target(url) {
                Nested::Malformed => false,
                Nested::Opaque => true,
                Nested::Inner(inner) => self.can_request_url(process, &inner),
            };
        }

        if self.is_web_safe_scheme(url.scheme()) {
            return true;
        }

        let lock = {
            let table = self.inner.processes();
            let Some(state) = table.store.get(process) else {
                return false;
            };
            if state.can_request_url(url) {
                return true;
            }
            state.process_lock().clone()
        };

        let delegate = &self.inner.delegate;
        if delegate.is_webui_scheme(url.scheme())
            && delegate.does_webui_scheme_require_process_lock(url.scheme())
            && !(lock.is_locked_to_site() && lock.matches_scheme(url.scheme()))
        {
            return false;
        }

        // URLs the browser doesn't load itself go to the OS.
        !delegate.is_handled_url(url)
    }

    /// Whether a navigation may be redirected to `url`
    pub fn can_redirect_to_url(&self, url: &Url) -> bool {
        if url.scheme() == ERROR_PAGE_SCHEME {
            return false;
        }
        if self.is_pseudo_scheme(url.scheme()) {
            return is_about_blank(url);
        }
        true
    }

    /// Whether the process may commit a document at `url`.
    ///
    /// The process lock must be compatible with the URL before any grant is
    /// considered.
    pub fn can_commit_url(&self, process: ProcessId, url: &Url) -> bool {
        if self.is_pseudo_scheme(url.scheme()) {
            return is_about_blank(url) || is_about_srcdoc(url);
        }

        if is_blob_or_filesystem(url) {
            return match nested_target(url) {
                Nested::Malformed => false,
                Nested::Opaque => true,
                Nested::Inner(inner) => self.can_commit_url(process, &inner),
            };
        }

        if !self.can_access_data_for_url(process, url, false) {
            return false;
        }

        let table = self.inner.processes();
        if table.schemes.is_commit_safe(url.scheme()) {
            return true;
        }
        table
            .store
            .get(process)
            .is_some_and(|state| state.can_commit_url(url))
    }

    /// Whether the process may read or write data belonging to `origin`.
    ///
    /// Locked processes only reach origins that would get exactly their lock;
    /// unlocked processes never reach origins that need a locked process.
    pub fn can_access_data_for_origin(&self, process: ProcessId, origin: &Origin) -> bool {
        match origin.tuple_or_precursor().and_then(|tuple| tuple.to_url()) {
            Some(url) => self.can_access_data_for_url(process, &url, origin.is_opaque()),
            // Opaque origins without a precursor carry nothing to check against.
            None => {
                let exists = self.inner.processes().store.get(process).is_some();
                if !exists {
                    self.report_denial(process, &origin.debug_string(), Denied::new("no_security_state"));
                }
                exists
            }
        }
    }

    fn can_access_data_for_url(&self, process: ProcessId, url: &Url, is_precursor_of_opaque_origin: bool) -> bool {
        match self.check_data_access(process, url, is_precursor_of_opaque_origin) {
            Ok(()) => true,
            Err(denied) => {
                self.report_denial(process, url.as_str(), denied);
                false
            }
        }
    }

    /// Whether a navigation to `url_info` may commit in the process with the
    /// origin it carries.
    pub fn can_commit_origin_and_url(
        &self,
        process: ProcessId,
        context: &IsolationContext,
        url_info: &UrlInfo,
    ) -> CanCommitStatus {
        let url = &url_info.url;
        let Some(origin) = &url_info.origin else {
            return if self.can_commit_url(process, url) {
                CanCommitStatus::CanCommitOriginAndUrl
            } else {
                CanCommitStatus::CannotCommitUrl
            };
        };

        let url_origin = Origin::resolve(url, origin);
        if !self.can_access_origin_quietly(process, &url_origin) {
            // The lock may be right even when grants are not, e.g. right
            // after the process was locked for this very navigation.
            let expected = self.process_lock_for(context, url_info);
            let actual = self.process_lock(process);
            if expected != actual {
                self.report_denial(
                    process,
                    &url_origin.debug_string(),
                    Denied {
                        reason: "cannot_commit_url".to_string(),
                        expected_lock: Some(expected),
                    },
                );
                return CanCommitStatus::CannotCommitUrl;
            }
            return CanCommitStatus::CanCommitOriginAndUrl;
        }

        if !self.can_access_origin_quietly(process, origin) {
            self.report_denial(process, &origin.debug_string(), Denied::new("cannot_commit_origin"));
            return CanCommitStatus::CannotCommitOrigin;
        }

        // Both must come from the same tuple, checked by value.
        if let (Some(url_tuple), Some(origin_tuple)) = (url_origin.tuple_or_precursor(), origin.tuple_or_precursor()) {
            if url_tuple != origin_tuple {
                return CanCommitStatus::CannotCommitOrigin;
            }
        }

        CanCommitStatus::CanCommitOriginAndUrl
    }

    fn can_access_origin_quietly(&self, process: ProcessId, origin: &Origin) -> bool {
        match origin.tuple_or_precursor().and_then(|tuple| tuple.to_url()) {
            Some(url) => self
                .check_data_access(process, &url, origin.is_opaque())
                .is_ok(),
            None => self.inner.processes().store.get(process).is_some(),
        }
    }

    fn snapshot(&self, process: ProcessId) -> Result<StateSnapshot, Denied> {
        let table = self.inner.processes();
        let Some(state) = table.store.get(process) else {
            return Err(Denied::new("no_security_state"));
        };
        let Some(browser_context) = state.browser_context() else {
            return Err(Denied::new("no_browser_context"));
        };
        Ok(StateSnapshot {
            lock: state.process_lock().clone(),
            browsing_groups: state.browsing_group_ids().clone(),
            browser_context,
            is_process_used: state.is_process_used(),
        })
    }

    fn check_data_access(&self, process: ProcessId, url: &Url, is_precursor_of_opaque_origin: bool) -> Result<(), Denied> {
        let state = self.snapshot(process)?;
        let actual = &state.lock;
        if actual.is_invalid() {
            return Err(Denied::new("process_lock_is_invalid"));
        }

        let mut reason = String::new();
        if state.browsing_groups.is_empty() {
            if self.inner.config.tolerate_missing_browsing_groups {
                match lock_matches_without_groups(actual, url) {
                    Ok(()) => return Ok(()),
                    Err(why) => reason = why,
                }
            } else {
                reason.push_str("No BrowsingGroups");
            }
        }

        let mut expected_lock = None;
        for &group in &state.browsing_groups {
            reason.push_str(&format!("[BG={group}]"));
            let context = IsolationContext::new(group, state.browser_context);

            let mut url_info = UrlInfo::new(url.clone())
                .with_pdf(actual.is_pdf())
                .with_sandbox(actual.is_sandboxed(), actual.unique_sandbox_id());
            if let Some(partition) = actual.storage_partition() {
                url_info = url_info.with_storage_partition(partition.clone());
            }
            if let Some(info) = actual.isolation_info() {
                url_info = url_info.with_isolation_info(info.clone());
            }
            let expected = self.process_lock_for(&context, &url_info);

            if actual.is_locked_to_site() {
                // Jail: only origins that need exactly this lock.
                if *actual == expected {
                    return Ok(());
                }
                if is_precursor_of_opaque_origin && (actual.is_null_blob_lock() || actual.matches_scheme(DATA_SCHEME)) {
                    return Ok(());
                }
                reason.push_str(&lock_mismatch_reason(actual, &expected));
            } else {
                // Citadel: unlocked processes stay away from origins that need
                // a lock. A process that rendered nothing yet may still be on
                // its way to a locked site.
                if !self.inner.config.citadel_enforcement || !state.is_process_used {
                    return Ok(());
                }
                let mut site_url_info = UrlInfo::new(url.clone());
                if let Some(info) = actual.isolation_info() {
                    site_url_info = site_url_info.with_isolation_info(info.clone());
                }
                let site_info = self.site_info_for(&context, &site_url_info);
                if !self.should_lock_process_to_site(&context, &site_info) {
                    return Ok(());
                }
                reason.push_str(" citadel_enforcement ");
            }
            expected_lock = Some(expected);
        }

        Err(Denied { reason, expected_lock })
    }

    fn report_denial(&self, process: ProcessId, requested: &str, denied: Denied) {
        let (actual_lock, handle_refs) = {
            let table = self.inner.processes();
            let actual = table
                .store
                .get(process)
                .map_or_else(|| ProcessLock::invalid().to_string(), |state| state.process_lock().to_string());
            (actual, table.store.reference_count(process))
        };
        let denial = AccessDenial {
            process_id: process,
            expected_lock: denied
                .expected_lock
                .map_or_else(|| ProcessLock::invalid().to_string(), |lock| lock.to_string()),
            actual_lock,
            requested_origin: requested.to_string(),
            reason: denied.reason,
            handle_refs,
        };
        self.inner.observer.on_access_denied(&denial);
    }
}

/// Lock comparison used when a process lost track of its browsing groups
fn lock_matches_without_groups(actual: &ProcessLock, url: &Url) -> Result<(), String> {
    if actual.is_pdf() {
        return Err("No BrowsingGroups: process lock is_pdf".to_string());
    }
    if !actual.is_locked_to_site() {
        return Err("No BrowsingGroups: process not locked to site".to_string());
    }

    let origin = Origin::from_url(url);
    let lock_url = actual.lock_url();
    let matches = if actual.is_origin_keyed_process() {
        origin.to_url().is_some_and(|origin_url| lock_url == Some(&origin_url))
    } else {
        origin
            .tuple_or_precursor()
            .and_then(site_for_origin)
            .is_some_and(|site| lock_url == Some(&site))
    };
    if matches {
        return Ok(());
    }
    Err(format!(
        "No BrowsingGroups: Lock Mismatch. lock = {actual} vs. requested_url = {url} "
    ))
}

fn lock_mismatch_reason(actual: &ProcessLock, expected: &ProcessLock) -> String {
    let (Some(actual_url), Some(expected_url)) = (actual.lock_url(), expected.lock_url()) else {
        return "lock_mismatch:url ".to_string();
    };
    if actual_url == expected_url {
        return "lock_mismatch:requires_origin_keyed_process ".to_string();
    }

    let site_of = |url: &Url| {
        Origin::from_url(url)
            .tuple_or_precursor()
            .and_then(site_for_origin)
    };
    let mut reason = "lock_mismatch:url ".to_string();
    // Same site, different origin: an isolated origin disagreement.
    if site_of(expected_url).as_ref() == Some(actual_url) || site_of(actual_url).as_ref() == Some(expected_url) {
        reason.push_str("[origin vs site mismatch] ");
    }
    reason
}
