//! Policy configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::error::Result;

/// Process model and cleanup settings of a [`SecurityPolicy`](crate::SecurityPolicy)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Every site gets a dedicated, locked process
    pub site_per_process: bool,
    /// Lock http(s) processes to full origins instead of sites
    pub strict_origin_isolation: bool,
    /// Origin-Agent-Cluster opt-ins may request an origin-keyed process
    pub origin_agent_cluster_process_isolation: bool,
    /// Deny unlocked processes access to origins that need a locked one
    pub citadel_enforcement: bool,
    /// Allow access through a lock match when a process lost track of its
    /// browsing groups
    pub tolerate_missing_browsing_groups: bool,
    /// Isolated origin patterns registered at startup, e.g. `https://[*.]bank.test`
    pub isolated_origins: Vec<String>,
    /// Longest time a process may be kept alive for pending work
    pub keep_alive_timeout_ms: u64,
    /// Extra time on top of the keep-alive timeout before cleanup
    pub cleanup_margin_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl PolicyConfig {
    /// Site isolation everywhere with citadel checks
    pub fn standard() -> Self {
        Self {
            site_per_process: true,
            strict_origin_isolation: false,
            origin_agent_cluster_process_isolation: true,
            citadel_enforcement: true,
            tolerate_missing_browsing_groups: true,
            isolated_origins: Vec::new(),
            keep_alive_timeout_ms: 30_000,
            cleanup_margin_ms: 2_000,
        }
    }

    /// Origin-level locks and no tolerance for inconsistent state
    pub fn strict() -> Self {
        Self {
            strict_origin_isolation: true,
            tolerate_missing_browsing_groups: false,
            ..Self::standard()
        }
    }

    /// Only isolated origins and embedder-selected sites get locked processes
    pub fn partial() -> Self {
        Self {
            site_per_process: false,
            ..Self::standard()
        }
    }

    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_site_per_process(mut self, enabled: bool) -> Self {
        self.site_per_process = enabled;
        self
    }

    pub fn with_strict_origin_isolation(mut self, enabled: bool) -> Self {
        self.strict_origin_isolation = enabled;
        self
    }

    pub fn with_citadel_enforcement(mut self, enabled: bool) -> Self {
        self.citadel_enforcement = enabled;
        self
    }

    pub fn with_tolerate_missing_browsing_groups(mut self, enabled: bool) -> Self {
        self.tolerate_missing_browsing_groups = enabled;
        self
    }

    pub fn with_isolated_origin(mut self, pattern: &str) -> Self {
        self.isolated_origins.push(pattern.to_string());
        self
    }

    /// Zero makes cleanup run immediately
    pub fn with_cleanup_delay(mut self, keep_alive_timeout: Duration, margin: Duration) -> Self {
        self.keep_alive_timeout_ms = duration_ms(keep_alive_timeout);
        self.cleanup_margin_ms = duration_ms(margin);
        self
    }

    /// Grace period before state of removed processes and destroyed
    /// browsing groups is dropped
    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms.saturating_add(self.cleanup_margin_ms))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = PolicyConfig::default();
        assert!(config.site_per_process);
        assert!(config.citadel_enforcement);
        assert_eq!(config.cleanup_delay(), Duration::from_secs(32));
    }

    #[test]
    fn test_from_json_fills_missing_fields() {
        let config = PolicyConfig::from_json(
            r#"{ "strict_origin_isolation": true, "isolated_origins": ["https://bank.test"] }"#,
        )
        .unwrap();
        assert_eq!(
            config,
            PolicyConfig::standard()
                .with_strict_origin_isolation(true)
                .with_isolated_origin("https://bank.test")
        );
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(PolicyConfig::from_json("{ not json").is_err());
        assert!(PolicyConfig::from_json(r#"{ "site_per_process": "yes" }"#).is_err());
    }

    #[test]
    fn test_presets() {
        assert!(PolicyConfig::strict().strict_origin_isolation);
        assert!(!PolicyConfig::strict().tolerate_missing_browsing_groups);
        assert!(!PolicyConfig::partial().site_per_process);
        let immediate = PolicyConfig::standard().with_cleanup_delay(Duration::ZERO, Duration::ZERO);
        assert_eq!(immediate.cleanup_delay(), Duration::ZERO);
    }
}
