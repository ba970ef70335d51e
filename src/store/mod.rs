//! Blob and key-value store capability traits, plus production clients for
//! Cloudflare R2 (S3-compatible) and Cloudflare Workers KV, and in-memory
//! fakes for testing.
//!
//! Provider-specific error types never leak above this module; callers only
//! ever see [`KvError`] and `anyhow::Error`.

use std::collections::HashMap;
use std::sync::Mutex;

use aws_sdk_s3::primitives::ByteStream;
use serde::Serialize;
use tracing::debug;

/// A blob to be stored: content type, cache-control, and a flat string
/// metadata map (already mechanically stringified per the SEO analyzer's
/// and index record's conventions).
pub struct PutObject<'a> {
    pub key: &'a str,
    pub body: Vec<u8>,
    pub content_type: &'a str,
    pub cache_control: String,
    pub metadata: HashMap<String, String>,
}

pub trait BlobStore: Send + Sync {
    async fn put(&self, object: PutObject<'_>) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Errors translated at the KV boundary so provider specifics never leak
/// above the synchronizer.
#[derive(Debug)]
pub enum KvError {
    NotFound,
    Other(String),
}

impl std::fmt::Display for KvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KvError::NotFound => write!(f, "key not found"),
            KvError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for KvError {}

pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<String, KvError>;
    async fn put(&self, key: &str, value: &str, expiration_ttl_secs: u64) -> anyhow::Result<()>;
}

/// Cloudflare R2 blob store, accessed via an S3-compatible client with
/// `region = auto` and endpoint `https://<account>.r2.cloudflarestorage.com`.
pub struct R2BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl R2BlobStore {
    #[must_use]
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    pub async fn from_credentials(
        account_id: &str,
        access_key_id: &str,
        secret_access_key: &str,
        bucket: String,
    ) -> anyhow::Result<Self> {
        let endpoint = format!("https://{account_id}.r2.cloudflarestorage.com");
        let credentials = aws_credential_types::Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            "prerender-pipeline",
        );
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new("auto"))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .load()
            .await;
        let client = aws_sdk_s3::Client::new(&config);
        Ok(Self::new(client, bucket))
    }
}

impl BlobStore for R2BlobStore {
    async fn put(&self, object: PutObject<'_>) -> anyhow::Result<()> {
        let metadata = object.metadata.into_iter().collect::<HashMap<_, _>>();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(object.key)
            .body(ByteStream::from(object.body))
            .content_type(object.content_type)
            .cache_control(object.cache_control)
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("R2 put_object failed for {}: {e}", object.key))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("R2 delete_object failed for {key}: {e}"))?;
        Ok(())
    }
}

/// Cloudflare Workers KV, accessed via its REST API.
pub struct WorkersKvStore {
    http: reqwest::Client,
    account_id: String,
    namespace_id: String,
    api_token: String,
    base_url: String,
}

const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

impl WorkersKvStore {
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        account_id: String,
        namespace_id: String,
        api_token: String,
    ) -> Self {
        Self::new_with_base_url(
            http,
            account_id,
            namespace_id,
            api_token,
            CLOUDFLARE_API_BASE.to_string(),
        )
    }

    /// Same as [`Self::new`] but pointed at an arbitrary base URL, so tests
    /// can target a mocked endpoint instead of the real Cloudflare API.
    #[must_use]
    pub fn new_with_base_url(
        http: reqwest::Client,
        account_id: String,
        namespace_id: String,
        api_token: String,
        base_url: String,
    ) -> Self {
        Self {
            http,
            account_id,
            namespace_id,
            api_token,
            base_url,
        }
    }

    fn value_url(&self, key: &str) -> String {
        format!(
            "{}/accounts/{}/storage/kv/namespaces/{}/values/{}",
            self.base_url, self.account_id, self.namespace_id, key
        )
    }
}

#[derive(Serialize)]
struct KvWriteMetadataQuery {
    expiration_ttl: u64,
}

impl KvStore for WorkersKvStore {
    async fn get(&self, key: &str) -> Result<String, KvError> {
        let response = self
            .http
            .get(self.value_url(key))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| KvError::Other(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(KvError::NotFound);
        }
        if !response.status().is_success() {
            return Err(KvError::Other(format!(
                "Workers KV get returned status {}",
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| KvError::Other(e.to_string()))
    }

    async fn put(&self, key: &str, value: &str, expiration_ttl_secs: u64) -> anyhow::Result<()> {
        let response = self
            .http
            .put(self.value_url(key))
            .bearer_auth(&self.api_token)
            .query(&KvWriteMetadataQuery {
                expiration_ttl: expiration_ttl_secs,
            })
            .body(value.to_string())
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Workers KV put request failed: {e}"))?;

        if !response.status().is_success() {
            anyhow::bail!("Workers KV put returned status {}", response.status());
        }
        Ok(())
    }
}

/// In-memory fakes used by the synchronizer's tests.
pub struct InMemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    put_calls: Mutex<Vec<String>>,
    delete_calls: Mutex<Vec<String>>,
    fail_put: bool,
}

impl InMemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            put_calls: Mutex::new(Vec::new()),
            delete_calls: Mutex::new(Vec::new()),
            fail_put: false,
        }
    }

    #[must_use]
    pub fn failing_put() -> Self {
        Self {
            fail_put: true,
            ..Self::new()
        }
    }

    #[must_use]
    pub fn put_calls(&self) -> Vec<String> {
        self.put_calls.lock().unwrap().clone()
    }

    #[must_use]
    pub fn delete_calls(&self) -> Vec<String> {
        self.delete_calls.lock().unwrap().clone()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for InMemoryBlobStore {
    async fn put(&self, object: PutObject<'_>) -> anyhow::Result<()> {
        if self.fail_put {
            anyhow::bail!("simulated blob put failure");
        }
        self.put_calls.lock().unwrap().push(object.key.to_string());
        self.objects
            .lock()
            .unwrap()
            .insert(object.key.to_string(), object.body);
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.delete_calls.lock().unwrap().push(key.to_string());
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

pub struct InMemoryKvStore {
    values: Mutex<HashMap<String, String>>,
    fail_put: bool,
}

impl InMemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            fail_put: false,
        }
    }

    #[must_use]
    pub fn failing_put() -> Self {
        Self {
            fail_put: true,
            ..Self::new()
        }
    }

    #[must_use]
    pub fn seed(self, key: &str, value: &str) -> Self {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        self
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<String, KvError> {
        match self.values.lock().unwrap().get(key) {
            Some(value) => Ok(value.clone()),
            None => {
                debug!(key, "in-memory KV miss");
                Err(KvError::NotFound)
            }
        }
    }

    async fn put(&self, key: &str, value: &str, _expiration_ttl_secs: u64) -> anyhow::Result<()> {
        if self.fail_put {
            anyhow::bail!("simulated KV put failure");
        }
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
