//! SHA-256 hashing and URL canonicalization for cache keys.
//!
//! Two keys are derived from a URL: the KV index key (stable under cosmetic
//! query-string variation) and the blob object key (unique per publish).

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

/// Internal query parameters stripped before the KV key is computed.
pub const QUERY_PARAM_BLOCKLIST: &[&str] = &["to_html", "cache_invalidate", "x-lovablehtml-render"];

pub const CACHE_VERSION: &str = "v1";

/// Lowercase hex SHA-256 of the UTF-8 bytes of `html`.
#[must_use]
pub fn sha256_hex(html: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(html.as_bytes());
    hex::encode(hasher.finalize())
}

/// Build the canonical `path?sorted=query` string used by both key builders.
///
/// Drops blocklisted query parameters, sorts the remainder by name then
/// value, and joins them without re-encoding. Decoded (not raw) values are
/// used throughout, matching the source behavior this is ported from.
fn canonical_path(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !QUERY_PARAM_BLOCKLIST.contains(&name.as_ref()))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    if pairs.is_empty() {
        url.path().to_string()
    } else {
        let query = pairs
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{}", url.path(), query)
    }
}

/// `"to_html:" + cacheVersion + ":" + host + ":" + canonicalPath`
#[must_use]
pub fn build_kv_key(url: &Url, cache_version: &str) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    Some(format!(
        "to_html:{cache_version}:{host}:{}",
        canonical_path(url)
    ))
}

fn safe_host(host: &str) -> String {
    host.to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn safe_path(path: &str) -> String {
    let stripped = path.strip_prefix('/').unwrap_or(path);
    let sanitized: String = stripped
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();

    // Collapse runs of '/' to a single '/'.
    let mut collapsed = String::with_capacity(sanitized.len());
    let mut prev_slash = false;
    for c in sanitized.chars() {
        if c == '/' {
            if !prev_slash {
                collapsed.push('/');
            }
            prev_slash = true;
        } else {
            collapsed.push(c);
            prev_slash = false;
        }
    }

    collapsed.replace('/', "_")
}

fn timestamp_token(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        .replace(':', "")
        .replace('.', "")
}

/// `cacheVersion/safeHost/(safePath|"root")_digest16_timestamp.html`
///
/// `now` must be supplied by the caller (no wall-clock reads inside this
/// module) so that two calls at least 1ms apart are guaranteed to differ.
#[must_use]
pub fn build_object_key(url: &Url, digest: &str, cache_version: &str, now: DateTime<Utc>) -> Option<String> {
    let host = safe_host(url.host_str()?);
    let path = safe_path(url.path());
    let path = if path.is_empty() { "root".to_string() } else { path };
    let digest_prefix = &digest[..digest.len().min(16)];
    let timestamp = timestamp_token(now);
    Some(format!(
        "{cache_version}/{host}/{path}_{digest_prefix}_{timestamp}.html"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn sha256_abc() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn scenario_a_identical_url_canonical_key() {
        let a = Url::parse("https://example.com/p?b=2&a=1&to_html=1").unwrap();
        let b = Url::parse("https://example.com/p?a=1&b=2").unwrap();
        assert_eq!(
            build_kv_key(&a, CACHE_VERSION).unwrap(),
            "to_html:v1:example.com:/p?a=1&b=2"
        );
        assert_eq!(
            build_kv_key(&a, CACHE_VERSION).unwrap(),
            build_kv_key(&b, CACHE_VERSION).unwrap()
        );
    }

    #[test]
    fn kv_key_ignores_blocklisted_and_reordered_params() {
        let a = Url::parse("https://Example.com/path/?z=1&cache_invalidate=x&a=2").unwrap();
        let b = Url::parse("https://example.com/path/?a=2&z=1&x-lovablehtml-render=y").unwrap();
        assert_eq!(
            build_kv_key(&a, CACHE_VERSION),
            build_kv_key(&b, CACHE_VERSION)
        );
    }

    #[test]
    fn object_key_uniqueness_across_timestamps() {
        let url = Url::parse("https://example.com/page").unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t2 = t1 + chrono::Duration::milliseconds(1);
        let k1 = build_object_key(&url, "aaaaaaaaaaaaaaaaaaaa", CACHE_VERSION, t1).unwrap();
        let k2 = build_object_key(&url, "aaaaaaaaaaaaaaaaaaaa", CACHE_VERSION, t2).unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn object_key_root_path() {
        let url = Url::parse("https://example.com/").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let key = build_object_key(&url, "0123456789abcdef0123", CACHE_VERSION, now).unwrap();
        assert!(key.contains("/root_"));
    }

    #[test]
    fn safe_path_collapses_slashes_and_unsafe_chars() {
        assert_eq!(safe_path("//a//b c/"), "a_b-c_");
    }
}
