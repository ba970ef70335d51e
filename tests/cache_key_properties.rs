//! Property-based tests for the KV key and blob key builders (§8 invariants
//! 4/5/8 of the design doc): determinism under cosmetic query variation, and
//! uniqueness of successive object keys.

use chrono::{TimeZone, Utc};
use prerender_pipeline::{build_kv_key, build_object_key, sha256_hex};
use proptest::prelude::*;
use url::Url;

const CACHE_VERSION: &str = "v1";

fn query_pair_strategy() -> impl Strategy<Value = (String, String)> {
    (
        "[a-z]{1,6}",
        "[a-z0-9]{1,6}",
    )
}

proptest! {
    /// Reordering a URL's non-blocklisted query pairs must never change the
    /// KV key: the canonicalizer sorts them before joining.
    #[test]
    fn kv_key_is_invariant_under_query_reordering(
        mut pairs in prop::collection::vec(query_pair_strategy(), 0..6)
    ) {
        pairs.dedup_by(|a, b| a.0 == b.0);
        let query_a: String = pairs.iter().map(|(k, v)| format!("{k}={v}&")).collect();
        let mut shuffled = pairs.clone();
        shuffled.reverse();
        let query_b: String = shuffled.iter().map(|(k, v)| format!("{k}={v}&")).collect();

        let url_a = Url::parse(&format!("https://example.com/p?{query_a}")).unwrap();
        let url_b = Url::parse(&format!("https://example.com/p?{query_b}")).unwrap();

        prop_assert_eq!(
            build_kv_key(&url_a, CACHE_VERSION),
            build_kv_key(&url_b, CACHE_VERSION)
        );
    }

    /// Injecting any of the blocklisted internal query params must never
    /// change the KV key relative to the URL without them.
    #[test]
    fn kv_key_ignores_injected_blocklisted_params(
        pairs in prop::collection::vec(query_pair_strategy(), 0..4)
    ) {
        let base_query: String = pairs.iter().map(|(k, v)| format!("{k}={v}&")).collect();
        let base = Url::parse(&format!("https://example.com/p?{base_query}")).unwrap();
        let with_injected = Url::parse(&format!(
            "https://example.com/p?{base_query}to_html=1&cache_invalidate=x"
        ))
        .unwrap();

        prop_assert_eq!(
            build_kv_key(&base, CACHE_VERSION),
            build_kv_key(&with_injected, CACHE_VERSION)
        );
    }

    /// Two object keys built at least 1ms apart for the same URL/digest must
    /// always differ (the timestamp token guarantees this).
    #[test]
    fn object_key_differs_across_millisecond_boundaries(offset_ms in 1u32..100_000u32) {
        let url = Url::parse("https://example.com/page").unwrap();
        let digest = sha256_hex("<html></html>");
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::milliseconds(i64::from(offset_ms));

        let key_a = build_object_key(&url, &digest, CACHE_VERSION, t0).unwrap();
        let key_b = build_object_key(&url, &digest, CACHE_VERSION, t1).unwrap();
        prop_assert_ne!(key_a, key_b);
    }

    /// `sha256_hex` is a pure function of the input bytes: identical input
    /// always produces identical output, and differing input (with
    /// overwhelming probability) produces differing output.
    #[test]
    fn sha256_hex_is_deterministic(s in ".{0,200}") {
        prop_assert_eq!(sha256_hex(&s), sha256_hex(&s));
    }
}
