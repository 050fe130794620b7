//! Registry of origins that require a dedicated process

use std::collections::HashMap;
use std::fmt;

use url::Url;

use super::{BrowserContextId, BrowsingGroupId};
use crate::origin::{
    Origin, SchemeHostPort, default_port, does_origin_match_isolated_origin,
    is_valid_isolated_origin,
};

/// Why an origin was isolated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolatedOriginSource {
    /// Command line / static configuration
    CommandLine,
    /// Field trial list
    FieldTrial,
    /// Enterprise policy
    Policy,
    /// Runtime signal such as a cross-origin-opener-policy header
    WebTriggered,
    /// Web platform tests
    WebPlatformTest,
    /// Test-only registrations
    Test,
}

impl IsolatedOriginSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CommandLine => "command-line",
            Self::FieldTrial => "field-trial",
            Self::Policy => "policy",
            Self::WebTriggered => "web-triggered",
            Self::WebPlatformTest => "web-platform-test",
            Self::Test => "test",
        }
    }
}

/// One parsed entry of an isolated origin list, e.g. `https://[*.]foo.com`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatedOriginPattern {
    pattern: String,
    origin: Option<Origin>,
    isolate_all_subdomains: bool,
}

const WILDCARD: &str = "[*.]";

impl IsolatedOriginPattern {
    /// Parse a pattern. Invalid patterns are kept so they can be reported.
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        let (spec, isolate_all_subdomains) = match pattern.find("://") {
            Some(separator) if pattern[separator + 3..].starts_with(WILDCARD) => (
                format!(
                    "{}{}",
                    &pattern[..separator + 3],
                    &pattern[separator + 3 + WILDCARD.len()..]
                ),
                true,
            ),
            _ => (pattern.to_string(), false),
        };

        let origin = Origin::parse(&spec).filter(is_valid_isolated_origin);
        Self {
            pattern: pattern.to_string(),
            origin,
            isolate_all_subdomains,
        }
    }

    /// Pattern for a plain origin
    pub fn from_origin(origin: Origin) -> Self {
        let pattern = origin.serialize();
        Self {
            pattern,
            origin: Some(origin).filter(is_valid_isolated_origin),
            isolate_all_subdomains: false,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    pub fn is_valid(&self) -> bool {
        self.origin.is_some()
    }

    pub fn isolate_all_subdomains(&self) -> bool {
        self.isolate_all_subdomains
    }
}

/// Split a comma separated pattern list, skipping empty items
pub fn parse_isolated_origins(list: &str) -> Vec<IsolatedOriginPattern> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(IsolatedOriginPattern::parse)
        .collect()
}

/// An isolated origin and the scope it applies to. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatedOriginEntry {
    origin: Origin,
    applies_to_future_browsing_groups: bool,
    browsing_group: BrowsingGroupId,
    browser_context: Option<BrowserContextId>,
    isolate_all_subdomains: bool,
    source: IsolatedOriginSource,
}

impl IsolatedOriginEntry {
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn applies_to_future_browsing_groups(&self) -> bool {
        self.applies_to_future_browsing_groups
    }

    /// Threshold for future entries, exact group otherwise
    pub fn browsing_group(&self) -> BrowsingGroupId {
        self.browsing_group
    }

    pub fn browser_context(&self) -> Option<BrowserContextId> {
        self.browser_context
    }

    pub fn isolate_all_subdomains(&self) -> bool {
        self.isolate_all_subdomains
    }

    pub fn source(&self) -> IsolatedOriginSource {
        self.source
    }

    pub fn applies_to_all_browser_contexts(&self) -> bool {
        self.browser_context.is_none()
    }

    pub fn matches_profile(&self, browser_context: Option<BrowserContextId>) -> bool {
        self.applies_to_all_browser_contexts() || self.browser_context == browser_context
    }

    pub fn matches_browsing_group(&self, browsing_group: BrowsingGroupId) -> bool {
        if self.applies_to_future_browsing_groups {
            self.browsing_group <= browsing_group
        } else {
            self.browsing_group == browsing_group
        }
    }
}

impl fmt::Display for IsolatedOriginEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} ({}, {} group {})",
            self.origin,
            if self.isolate_all_subdomains { " [*.]" } else { "" },
            self.source.as_str(),
            if self.applies_to_future_browsing_groups { "from" } else { "only" },
            self.browsing_group
        )
    }
}

/// Isolated origins keyed by site URL.
///
/// Not synchronized; the policy keeps it behind its own mutex.
#[derive(Debug, Default)]
pub struct IsolatedOriginRegistry {
    entries: HashMap<Url, Vec<IsolatedOriginEntry>>,
}

fn site_key(origin: &Origin) -> Option<Url> {
    origin
        .tuple_or_precursor()
        .and_then(crate::origin::site_for_origin)
}

impl IsolatedOriginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register patterns for every browsing group starting at `threshold`.
    /// Returns how many entries were added.
    pub fn add_future(
        &mut self,
        patterns: &[IsolatedOriginPattern],
        source: IsolatedOriginSource,
        browser_context: Option<BrowserContextId>,
        threshold: BrowsingGroupId,
    ) -> usize {
        let mut added = 0;
        for pattern in patterns {
            let Some(origin) = pattern.origin() else {
                log::error!("Invalid isolated origin: {}", pattern.pattern());
                continue;
            };
            if self.add_internal(
                browser_context,
                origin.clone(),
                true,
                threshold,
                pattern.isolate_all_subdomains(),
                source,
            ) {
                added += 1;
            }
        }
        added
    }

    /// Register `origin` for exactly one existing browsing group
    pub fn add_for_browsing_group(
        &mut self,
        browser_context: Option<BrowserContextId>,
        origin: Origin,
        browsing_group: BrowsingGroupId,
        source: IsolatedOriginSource,
    ) -> bool {
        self.add_internal(browser_context, origin, false, browsing_group, false, source)
    }

    fn add_internal(
        &mut self,
        browser_context: Option<BrowserContextId>,
        origin: Origin,
        applies_to_future_browsing_groups: bool,
        browsing_group: BrowsingGroupId,
        isolate_all_subdomains: bool,
        source: IsolatedOriginSource,
    ) -> bool {
        let Some(key) = site_key(&origin) else {
            return false;
        };
        let bucket = self.entries.entry(key).or_default();

        // An entry for the same origin and profile that already covers the
        // requested groups makes the new one redundant. Entries for other
        // profiles don't count.
        let covered = bucket.iter().any(|entry| {
            entry.origin == origin
                && entry.browser_context == browser_context
                && if entry.applies_to_future_browsing_groups {
                    entry.browsing_group <= browsing_group
                } else {
                    !applies_to_future_browsing_groups && entry.browsing_group == browsing_group
                }
        });
        if covered {
            log::trace!("isolated origin {origin} already registered for group {browsing_group}");
            return false;
        }

        let entry = IsolatedOriginEntry {
            origin,
            applies_to_future_browsing_groups,
            browsing_group,
            browser_context,
            isolate_all_subdomains,
            source,
        };
        log::debug!("isolating {entry}");
        bucket.push(entry);
        true
    }

    /// Most specific isolated origin covering `origin` in the given scope.
    ///
    /// An entry isolating all subdomains returns `origin` itself (without a
    /// non-default port) so each subdomain gets its own process.
    pub fn get_matching_isolated_origin(
        &self,
        browser_context: Option<BrowserContextId>,
        browsing_group: BrowsingGroupId,
        origin: &Origin,
        site_url: &Url,
    ) -> Option<Origin> {
        let bucket = self.entries.get(site_url).or_else(|| {
            // "https://foo.com." must not bypass an isolated "https://foo.com".
            let host = site_url.host_str()?;
            let trimmed = host.strip_suffix('.')?;
            let mut without_dot = site_url.clone();
            without_dot.set_host(Some(trimmed)).ok()?;
            self.entries.get(&without_dot)
        })?;

        let mut best: Option<&Origin> = None;
        for entry in bucket {
            if !entry.matches_profile(browser_context)
                || !entry.matches_browsing_group(browsing_group)
                || !does_origin_match_isolated_origin(origin, &entry.origin)
            {
                continue;
            }

            if entry.isolate_all_subdomains {
                return Some(strip_non_default_port(origin));
            }

            let longer = best.is_none_or(|current| {
                host_len(current) < host_len(&entry.origin)
            });
            if longer {
                best = Some(&entry.origin);
            }
        }
        best.cloned()
    }

    /// Origins that apply to future groups, optionally filtered by source.
    ///
    /// With a profile, entries for that profile and global ones are listed;
    /// without one only global entries are.
    pub fn isolated_origins(
        &self,
        source: Option<IsolatedOriginSource>,
        browser_context: Option<BrowserContextId>,
    ) -> Vec<Origin> {
        self.entries
            .values()
            .flatten()
            .filter(|entry| source.is_none_or(|source| entry.source == source))
            .filter(|entry| match browser_context {
                Some(_) => entry.matches_profile(browser_context),
                None => entry.applies_to_all_browser_contexts(),
            })
            .filter(|entry| entry.applies_to_future_browsing_groups)
            .map(|entry| entry.origin.clone())
            .collect()
    }

    /// Whether the site of `origin` itself was isolated by `source`
    pub fn is_isolated_site_from_source(&self, origin: &Origin, source: IsolatedOriginSource) -> bool {
        let Some(site_url) = site_key(origin) else {
            return false;
        };
        let Some(bucket) = self.entries.get(&site_url) else {
            return false;
        };
        let site_origin = Origin::from_url(&site_url);
        bucket
            .iter()
            .any(|entry| entry.source == source && entry.origin == site_origin)
    }

    /// Drop entries scoped to a profile that is going away
    pub fn remove_for_browser_context(&mut self, browser_context: BrowserContextId) {
        for bucket in self.entries.values_mut() {
            bucket.retain(|entry| entry.browser_context != Some(browser_context));
        }
        self.entries.retain(|_, bucket| !bucket.is_empty());
    }

    /// Drop entries that only applied to a destroyed browsing group
    pub fn remove_for_browsing_group(&mut self, browsing_group: BrowsingGroupId) {
        for bucket in self.entries.values_mut() {
            bucket.retain(|entry| {
                entry.applies_to_future_browsing_groups || entry.browsing_group != browsing_group
            });
        }
        self.entries.retain(|_, bucket| !bucket.is_empty());
    }

    /// Remove every entry for exactly `origin`
    pub fn remove(&mut self, origin: &Origin) {
        let Some(key) = site_key(origin) else {
            return;
        };
        if let Some(bucket) = self.entries.get_mut(&key) {
            bucket.retain(|entry| entry.origin != *origin);
            if bucket.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Total number of entries
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn host_len(origin: &Origin) -> usize {
    origin.host().map_or(0, str::len)
}

fn strip_non_default_port(origin: &Origin) -> Origin {
    match origin {
        Origin::Tuple(tuple) if tuple.port() != default_port(tuple.scheme()) => Origin::Tuple(
            SchemeHostPort::new(tuple.scheme(), tuple.host(), default_port(tuple.scheme())),
        ),
        other => other.clone(),
    }
}
