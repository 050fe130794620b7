//! Registrable domains and site URLs

use url::Url;

use super::{FILE_SCHEME, HTTP_SCHEME, HTTPS_SCHEME, Origin, SchemeHostPort};

/// eTLD+1 of `host` per the public suffix list, private registries such as
/// `azurewebsites.net` included. `None` for IP addresses, bare suffixes and
/// single-label hosts. A trailing dot is preserved.
pub fn registrable_domain(host: &str) -> Option<String> {
    let trailing_dot = host.ends_with('.');
    let trimmed = host.trim_end_matches('.');
    if trimmed.is_empty()
        || trimmed.parse::<std::net::IpAddr>().is_ok()
        || trimmed.starts_with('[')
    {
        return None;
    }

    let mut domain = psl::domain_str(trimmed)?.to_string();
    if trailing_dot {
        domain.push('.');
    }
    Some(domain)
}

/// Site URL of a tuple: scheme plus registrable domain (ports dropped).
///
/// This is a plain eTLD+1 translation. Isolated origins and other process
/// model inputs are applied by the policy when computing locks. Returns
/// `None` only for tuples built from a scheme that is not URL-safe.
pub fn site_for_origin(tuple: &SchemeHostPort) -> Option<Url> {
    let host = tuple.host();
    let spec = if host.is_empty() || tuple.scheme() == FILE_SCHEME {
        format!("{}:", tuple.scheme())
    } else {
        let domain = registrable_domain(host).unwrap_or_else(|| host.to_string());
        format!("{}://{}", tuple.scheme(), domain)
    };
    Url::parse(&spec).ok()
}

/// Whether `origin` falls under `isolated`: same scheme and `origin`'s host
/// equal to or a subdomain of the isolated host. Ports are ignored. IP
/// addresses only match exactly.
pub fn does_origin_match_isolated_origin(origin: &Origin, isolated: &Origin) -> bool {
    let (Origin::Tuple(candidate), Origin::Tuple(isolated)) = (origin, isolated) else {
        return false;
    };
    if isolated.host_is_ip_address() {
        return candidate == isolated;
    }
    if candidate.scheme() != isolated.scheme() {
        return false;
    }
    let host = candidate.normalized_host();
    let isolated_host = isolated.normalized_host();
    host == isolated_host
        || host
            .strip_suffix(isolated_host)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Whether `origin` may be registered as an isolated origin
pub fn is_valid_isolated_origin(origin: &Origin) -> bool {
    let Origin::Tuple(tuple) = origin else {
        return false;
    };
    let host = tuple.normalized_host();
    if host.is_empty() || tuple.scheme() == FILE_SCHEME {
        return false;
    }
    if tuple.host_is_ip_address() || host == "localhost" {
        return true;
    }
    // Suffixes such as "com" or "co.uk" cannot be isolated as a whole.
    registrable_domain(host).is_some()
}

/// Whether `origin` may opt in to (or out of) origin-agent-cluster isolation.
/// Only potentially trustworthy origins qualify.
pub fn is_valid_origin_for_opt_in_isolation(origin: &Origin) -> bool {
    let Origin::Tuple(tuple) = origin else {
        return false;
    };
    if !is_valid_isolated_origin(origin) {
        return false;
    }
    match tuple.scheme() {
        HTTPS_SCHEME => true,
        HTTP_SCHEME => {
            let host = tuple.normalized_host();
            host == "localhost" || host == "127.0.0.1" || host == "[::1]"
        }
        _ => false,
    }
}
