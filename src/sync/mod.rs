//! The Cache Synchronizer (C4): publishes a fresh HTML body to the blob
//! store and an index record to the KV store, garbage-collecting the blob
//! the previous index record pointed at.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::cache_key::{CACHE_VERSION, build_kv_key, build_object_key, sha256_hex};
use crate::seo::SeoAnalysis;
use crate::store::{BlobStore, KvError, KvStore, PutObject};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub kv_synced: bool,
    pub r2_synced: bool,
}

/// The KV value describing the current blob for a canonical URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRecord {
    pub url: String,
    pub object_key: String,
    pub digest: String,
    pub created_at: chrono::DateTime<Utc>,
    pub content_type: String,
    pub content_length: usize,
    pub cache_version: String,
    pub user_agent: String,
    pub accept: Option<String>,
}

pub struct CacheSynchronizer<B, K> {
    blob_store: B,
    kv_store: K,
    cache_ttl_secs: u64,
}

impl<B: BlobStore, K: KvStore> CacheSynchronizer<B, K> {
    #[must_use]
    pub fn new(blob_store: B, kv_store: K, cache_ttl_secs: u64) -> Self {
        Self {
            blob_store,
            kv_store,
            cache_ttl_secs,
        }
    }

    /// Runs the ordered publish/invalidate/index algorithm. `final_url` is
    /// the raw final URL reported by the render driver; parsing it is this
    /// function's own responsibility, and a parse failure short-circuits
    /// the whole sync with `{false, false}` rather than being masked upstream.
    pub async fn sync(
        &self,
        final_url: &str,
        html: &str,
        seo: &SeoAnalysis,
        user_agent: &str,
        accept: Option<&str>,
    ) -> SyncOutcome {
        let Ok(target_url) = Url::parse(final_url) else {
            warn!(final_url, "cannot parse final url, skipping sync");
            return SyncOutcome::default();
        };
        let target_url = &target_url;

        let digest = sha256_hex(html);
        let now = Utc::now();

        let Some(object_key) = build_object_key(target_url, &digest, CACHE_VERSION, now) else {
            warn!(%target_url, "cannot derive object key, skipping sync");
            return SyncOutcome::default();
        };
        let Some(kv_key) = build_kv_key(target_url, CACHE_VERSION) else {
            warn!(%target_url, "cannot derive kv key, skipping sync");
            return SyncOutcome::default();
        };

        let body = html.as_bytes().to_vec();
        let index_record = IndexRecord {
            url: target_url.to_string(),
            object_key: object_key.clone(),
            digest,
            created_at: now,
            content_type: "text/html; charset=utf-8".to_string(),
            content_length: body.len(),
            cache_version: CACHE_VERSION.to_string(),
            user_agent: user_agent.to_string(),
            accept: accept.map(str::to_string),
        };

        let metadata = build_blob_metadata(&index_record, seo);
        let put_object = PutObject {
            key: &object_key,
            body,
            content_type: "text/html; charset=utf-8",
            cache_control: format!(
                "public, max-age={0}, s-maxage={0}",
                self.cache_ttl_secs
            ),
            metadata,
        };

        if let Err(e) = self.blob_store.put(put_object).await {
            warn!(%target_url, error = %e, "blob put failed");
            return SyncOutcome::default();
        }

        self.invalidate_stale_blob(&kv_key, &object_key).await;

        let Ok(serialized) = serde_json::to_string(&index_record) else {
            warn!(%target_url, "failed to serialize index record");
            return SyncOutcome {
                kv_synced: false,
                r2_synced: true,
            };
        };

        match self
            .kv_store
            .put(&kv_key, &serialized, self.cache_ttl_secs)
            .await
        {
            Ok(()) => SyncOutcome {
                kv_synced: true,
                r2_synced: true,
            },
            Err(e) => {
                warn!(%target_url, error = %e, "kv put failed");
                SyncOutcome {
                    kv_synced: false,
                    r2_synced: true,
                }
            }
        }
    }

    /// Best-effort: delete the blob the prior index record pointed at, iff
    /// it differs from the object key about to be published. All failures
    /// are logged, never propagated.
    async fn invalidate_stale_blob(&self, kv_key: &str, new_object_key: &str) {
        let prior = match self.kv_store.get(kv_key).await {
            Ok(value) => value,
            Err(KvError::NotFound) => return,
            Err(e) => {
                debug!(kv_key, error = %e, "kv read failed during invalidation, skipping");
                return;
            }
        };

        let prior_record: IndexRecord = match serde_json::from_str(&prior) {
            Ok(record) => record,
            Err(e) => {
                debug!(kv_key, error = %e, "prior index record did not parse, skipping");
                return;
            }
        };

        if prior_record.object_key == new_object_key {
            return;
        }

        if let Err(e) = self.blob_store.delete(&prior_record.object_key).await {
            warn!(
                object_key = prior_record.object_key,
                error = %e,
                "failed to delete stale blob, it will orphan until TTL expiry"
            );
        }
    }
}

fn build_blob_metadata(record: &IndexRecord, seo: &SeoAnalysis) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert("url".to_string(), record.url.clone());
    metadata.insert("digest".to_string(), record.digest.clone());
    metadata.insert("createdAt".to_string(), record.created_at.to_rfc3339());
    metadata.insert("cacheVersion".to_string(), record.cache_version.clone());
    metadata.insert("userAgent".to_string(), record.user_agent.clone());
    metadata.insert("accept".to_string(), record.accept.clone().unwrap_or_default());
    metadata.extend(seo.as_metadata_map());
    metadata
}
