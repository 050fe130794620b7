//! Hooks for the embedding browser

use url::Url;

use crate::isolation::BrowserContextId;

/// Decisions the policy defers to the embedder.
///
/// The defaults treat every URL as handled by the browser itself and add no
/// isolation beyond what the policy computes on its own.
#[cfg_attr(test, mockall::automock)]
pub trait PolicyDelegate: Send + Sync {
    /// Whether the browser loads `url` itself. Requests for URLs it does not
    /// handle are passed to the OS and are always allowed.
    fn is_handled_url(&self, _url: &Url) -> bool {
        true
    }

    /// Extra sites that need a dedicated process
    fn does_site_require_dedicated_process(
        &self,
        _browser_context: Option<BrowserContextId>,
        _site_url: &Url,
    ) -> bool {
        false
    }

    /// Lets the embedder keep sites in shared processes
    fn should_lock_process_to_site(
        &self,
        _browser_context: Option<BrowserContextId>,
        _site_url: &Url,
    ) -> bool {
        true
    }

    /// Schemes of privileged browser pages, such as `chrome`
    fn is_webui_scheme(&self, _scheme: &str) -> bool {
        false
    }

    fn does_webui_scheme_require_process_lock(&self, _scheme: &str) -> bool {
        true
    }
}

/// Delegate with the default answers
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicyDelegate;

impl PolicyDelegate for DefaultPolicyDelegate {}
