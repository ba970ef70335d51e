//! The URL Set Builder (C8): merges seed URLs with Sitemap Fetcher output
//! into a single deduplicated, normalized, same-host URL list.

use std::collections::HashSet;

use tracing::warn;
use url::Url;

use crate::sitemap::SitemapEntry;

/// Lowercase scheme and host, strip a default port, drop the fragment.
/// Path and query are left untouched — cache-key canonicalization (C1) is a
/// separate, later concern.
#[must_use]
pub fn normalize(url: &Url) -> Url {
    let mut normalized = url.clone();
    let _ = normalized.set_scheme(&url.scheme().to_ascii_lowercase());
    if let Some(host) = url.host_str() {
        let _ = normalized.set_host(Some(&host.to_ascii_lowercase()));
    }
    let default_port = match normalized.scheme() {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    };
    if normalized.port() == default_port {
        let _ = normalized.set_port(None);
    }
    normalized.set_fragment(None);
    normalized
}

/// Merge seed URLs with sitemap entries (unless `skip_sitemap_parsing`),
/// normalize, deduplicate, and drop any URL whose host doesn't match the
/// first seed URL's host. The first seed URL's host is the registered
/// hostname every other URL is validated against (§4.8); seeds are assumed
/// upstream-validated to already share one host.
#[must_use]
pub fn build(
    seed_urls: &[Url],
    sitemap_entries: &[SitemapEntry],
    skip_sitemap_parsing: bool,
) -> Vec<Url> {
    let Some(registered_host) = seed_urls.first().and_then(|u| u.host_str()) else {
        return Vec::new();
    };
    let registered_host = registered_host.to_ascii_lowercase();

    let candidates = seed_urls.iter().cloned().chain(
        if skip_sitemap_parsing {
            Vec::new()
        } else {
            sitemap_entries.iter().map(|e| e.loc.clone()).collect()
        },
    );

    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for url in candidates {
        let normalized = normalize(&url);
        let Some(host) = normalized.host_str() else {
            warn!(%normalized, "dropping URL with no host");
            continue;
        };
        if !host.eq_ignore_ascii_case(&registered_host) {
            warn!(%normalized, registered_host, "dropping URL from a different host");
            continue;
        }
        let key = normalized.to_string();
        if seen.insert(key) {
            result.push(normalized);
        }
    }
    result
}
