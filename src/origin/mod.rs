//! Origins and URL helpers used by the policy engine
//!
//! Browser origins differ from what `url::Url::origin` reports in two ways the
//! policy depends on:
//! - opaque origins may carry the tuple of the document that created them
//!   (the *precursor*), which is what locks are checked against;
//! - `filesystem:` URLs and non-special schemes with a host still yield a
//!   tuple origin.

mod site;

pub use site::{
    does_origin_match_isolated_origin, is_valid_isolated_origin,
    is_valid_origin_for_opt_in_isolation, registrable_domain, site_for_origin,
};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use url::{Host, Url};

pub const ABOUT_SCHEME: &str = "about";
pub const BLOB_SCHEME: &str = "blob";
pub const DATA_SCHEME: &str = "data";
pub const FILE_SCHEME: &str = "file";
pub const FILESYSTEM_SCHEME: &str = "filesystem";
pub const HTTP_SCHEME: &str = "http";
pub const HTTPS_SCHEME: &str = "https";
pub const JAVASCRIPT_SCHEME: &str = "javascript";
pub const VIEW_SOURCE_SCHEME: &str = "view-source";
pub const WS_SCHEME: &str = "ws";
pub const WSS_SCHEME: &str = "wss";
pub const ERROR_PAGE_SCHEME: &str = "chrome-error";

/// Default port for schemes with one, 0 otherwise.
pub fn default_port(scheme: &str) -> u16 {
    match scheme {
        HTTP_SCHEME | WS_SCHEME => 80,
        HTTPS_SCHEME | WSS_SCHEME => 443,
        "ftp" => 21,
        _ => 0,
    }
}

/// The (scheme, host, port) triple of a non-opaque origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemeHostPort {
    scheme: String,
    host: String,
    port: u16,
}

impl SchemeHostPort {
    /// Create a tuple; scheme and host are lower-cased
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port,
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Host without trailing dots, used when comparing domains
    pub fn normalized_host(&self) -> &str {
        self.host.trim_end_matches('.')
    }

    pub fn is_http_or_https(&self) -> bool {
        self.scheme == HTTP_SCHEME || self.scheme == HTTPS_SCHEME
    }

    pub fn host_is_ip_address(&self) -> bool {
        matches!(
            Host::parse(&self.host),
            Ok(Host::Ipv4(_)) | Ok(Host::Ipv6(_))
        )
    }

    /// Canonical serialization: `scheme://host[:port]`
    pub fn serialize(&self) -> String {
        if self.port == default_port(&self.scheme) || self.port == 0 {
            format!("{}://{}", self.scheme, self.host)
        } else {
            format!("{}://{}:{}", self.scheme, self.host, self.port)
        }
    }

    /// URL of the tuple with an empty path
    pub fn to_url(&self) -> Option<Url> {
        if self.host.is_empty() {
            return Url::parse(&format!("{}:///", self.scheme)).ok();
        }
        Url::parse(&format!("{}/", self.serialize())).ok()
    }
}

impl fmt::Display for SchemeHostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

/// A web origin: either a tuple or an opaque origin with an optional precursor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Origin {
    Tuple(SchemeHostPort),
    Opaque {
        nonce: u64,
        precursor: Option<SchemeHostPort>,
    },
}

static OPAQUE_NONCE: AtomicU64 = AtomicU64::new(1);

fn next_nonce() -> u64 {
    OPAQUE_NONCE.fetch_add(1, Ordering::Relaxed)
}

impl Origin {
    /// Tuple origin from its parts
    pub fn tuple(scheme: &str, host: &str, port: u16) -> Self {
        Self::Tuple(SchemeHostPort::new(scheme, host, port))
    }

    /// Fresh opaque origin without precursor
    pub fn new_opaque() -> Self {
        Self::Opaque {
            nonce: next_nonce(),
            precursor: None,
        }
    }

    /// Fresh opaque origin whose precursor is this origin's tuple
    pub fn derive_opaque(&self) -> Self {
        Self::Opaque {
            nonce: next_nonce(),
            precursor: self.tuple_or_precursor().cloned(),
        }
    }

    /// Parse an origin from a serialized string such as `https://a.test:8443`
    pub fn parse(spec: &str) -> Option<Self> {
        Url::parse(spec).ok().map(|url| Self::from_url(&url))
    }

    /// Origin of a URL.
    pub fn from_url(url: &Url) -> Self {
        match url.scheme() {
            BLOB_SCHEME | FILESYSTEM_SCHEME => match inner_url(url) {
                Some(inner) => match Self::from_url(&inner) {
                    // blob:null/..., blob:data:... and friends
                    Self::Opaque { .. } => Self::new_opaque(),
                    tuple => tuple,
                },
                None => Self::new_opaque(),
            },
            FILE_SCHEME => Self::tuple(FILE_SCHEME, "", 0),
            DATA_SCHEME | ABOUT_SCHEME | JAVASCRIPT_SCHEME => Self::new_opaque(),
            scheme => match url.host_str() {
                Some(host) if !host.is_empty() => Self::tuple(
                    scheme,
                    host,
                    url.port_or_known_default().unwrap_or(0),
                ),
                _ => Self::new_opaque(),
            },
        }
    }

    /// Origin a document at `url` ends up with when created by `base`.
    ///
    /// about:blank and about:srcdoc inherit `base`; data: URLs get an opaque
    /// origin derived from it.
    pub fn resolve(url: &Url, base: &Origin) -> Self {
        if is_about_blank(url) || is_about_srcdoc(url) {
            return base.clone();
        }
        if url.scheme() == DATA_SCHEME {
            return base.derive_opaque();
        }
        Self::from_url(url)
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self, Self::Opaque { .. })
    }

    /// The tuple for tuple origins, the precursor for opaque ones
    pub fn tuple_or_precursor(&self) -> Option<&SchemeHostPort> {
        match self {
            Self::Tuple(tuple) => Some(tuple),
            Self::Opaque { precursor, .. } => precursor.as_ref(),
        }
    }

    pub fn scheme(&self) -> Option<&str> {
        match self {
            Self::Tuple(tuple) => Some(tuple.scheme()),
            Self::Opaque { .. } => None,
        }
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            Self::Tuple(tuple) => Some(tuple.host()),
            Self::Opaque { .. } => None,
        }
    }

    /// URL form of a tuple origin; `None` for opaque origins
    pub fn to_url(&self) -> Option<Url> {
        match self {
            Self::Tuple(tuple) => tuple.to_url(),
            Self::Opaque { .. } => None,
        }
    }

    /// Serialization as it appears in an `Origin` header
    pub fn serialize(&self) -> String {
        match self {
            Self::Tuple(tuple) => tuple.serialize(),
            Self::Opaque { .. } => "null".to_string(),
        }
    }

    /// Serialization that keeps the precursor of opaque origins
    pub fn debug_string(&self) -> String {
        match self {
            Self::Tuple(tuple) => tuple.serialize(),
            Self::Opaque {
                nonce,
                precursor: Some(precursor),
            } => format!("null [internally: ({nonce}) derived from {precursor}]"),
            Self::Opaque {
                nonce,
                precursor: None,
            } => format!("null [internally: ({nonce}) anonymous]"),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

/// URL embedded in a blob: or filesystem: URL
pub fn inner_url(url: &Url) -> Option<Url> {
    match url.scheme() {
        BLOB_SCHEME | FILESYSTEM_SCHEME => Url::parse(url.path()).ok(),
        _ => None,
    }
}

/// True for `about:blank` including query and fragment variants
pub fn is_about_blank(url: &Url) -> bool {
    url.scheme() == ABOUT_SCHEME && url.path() == "blank"
}

/// True for `about:srcdoc` including query and fragment variants
pub fn is_about_srcdoc(url: &Url) -> bool {
    url.scheme() == ABOUT_SCHEME && url.path() == "srcdoc"
}

pub fn is_blob_or_filesystem(url: &Url) -> bool {
    matches!(url.scheme(), BLOB_SCHEME | FILESYSTEM_SCHEME)
}

/// Whether a blob: URL fails to embed a canonically serialized origin.
///
/// A well formed blob URL reads `blob:<origin>/<uuid>`, where `<origin>`
/// matches the serialization of the URL's own origin (case-insensitively).
pub fn is_malformed_blob_url(url: &Url) -> bool {
    if url.scheme() != BLOB_SCHEME {
        return false;
    }

    let mut canonical_origin = Origin::from_url(url).serialize();
    canonical_origin.push('/');

    let content = &url.as_str()[BLOB_SCHEME.len() + 1..];
    let prefix_matches = content
        .get(..canonical_origin.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(&canonical_origin));
    !prefix_matches
}

/// Copy of `url` without its fragment
pub fn strip_fragment(url: &Url) -> Url {
    let mut stripped = url.clone();
    stripped.set_fragment(None);
    stripped
}
