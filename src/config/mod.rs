//! Configuration (C10): environment-driven settings for a single batch run,
//! assembled through a typestate builder so a caller cannot reach `build()`
//! without having supplied the fields the rest of the pipeline treats as
//! mandatory.
//!
//! Loading from the environment and validating are two different failure
//! modes on purpose: a missing env var is reported with its variable name
//! (§4.10), while `build()` reports which builder step was skipped. Both are
//! *Fatal* per §7 — the process exits non-zero before any browser launches.

use std::marker::PhantomData;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use url::Url;

/// How far back `lastmod` may be for a sitemap entry to be kept. `All` keeps
/// every entry regardless of `lastmod`, including entries missing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SitemapWindow {
    OneDay,
    ThreeDays,
    SevenDays,
    ThirtyDays,
    All,
}

impl SitemapWindow {
    #[must_use]
    pub fn max_age(self) -> Option<chrono::Duration> {
        match self {
            SitemapWindow::OneDay => Some(chrono::Duration::days(1)),
            SitemapWindow::ThreeDays => Some(chrono::Duration::days(3)),
            SitemapWindow::SevenDays => Some(chrono::Duration::days(7)),
            SitemapWindow::ThirtyDays => Some(chrono::Duration::days(30)),
            SitemapWindow::All => None,
        }
    }
}

impl FromStr for SitemapWindow {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1d" => Ok(SitemapWindow::OneDay),
            "3d" => Ok(SitemapWindow::ThreeDays),
            "7d" => Ok(SitemapWindow::SevenDays),
            "30d" => Ok(SitemapWindow::ThirtyDays),
            "all" => Ok(SitemapWindow::All),
            other => Err(anyhow!(
                "invalid sitemapUpdatedWithin value '{other}', expected one of 1d/3d/7d/30d/all"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlobCredentials {
    pub account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
}

#[derive(Debug, Clone)]
pub struct KvCredentials {
    pub account_id: String,
    pub api_token: String,
    pub namespace_id: String,
}

/// A single batch run's complete configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub seed_urls: Vec<Url>,
    pub sitemap_url: Option<Url>,
    pub sitemap_updated_within: SitemapWindow,
    pub user_agent: String,
    pub concurrency: usize,
    pub cache_ttl_secs: u64,
    pub skip_cache_sync: bool,
    pub skip_sitemap_parsing: bool,
    pub blob: BlobCredentials,
    pub kv: KvCredentials,
    pub webhook_url: Option<Url>,
    pub chat_webhook_url: Option<Url>,
    pub extra_ignored_hosts: Vec<String>,
}

// Type states for the builder.
pub struct WithSeedUrls;
pub struct WithStores;

pub struct PipelineConfigBuilder<State = ()> {
    seed_urls: Option<Vec<Url>>,
    sitemap_url: Option<Url>,
    sitemap_updated_within: SitemapWindow,
    user_agent: String,
    concurrency: usize,
    cache_ttl_secs: u64,
    skip_cache_sync: bool,
    skip_sitemap_parsing: bool,
    blob: Option<BlobCredentials>,
    kv: Option<KvCredentials>,
    webhook_url: Option<Url>,
    chat_webhook_url: Option<Url>,
    extra_ignored_hosts: Vec<String>,
    _phantom: PhantomData<State>,
}

impl Default for PipelineConfigBuilder<()> {
    fn default() -> Self {
        Self {
            seed_urls: None,
            sitemap_url: None,
            sitemap_updated_within: SitemapWindow::All,
            user_agent: crate::browser::DEFAULT_USER_AGENT.to_string(),
            concurrency: 4,
            cache_ttl_secs: 86_400,
            skip_cache_sync: false,
            skip_sitemap_parsing: false,
            blob: None,
            kv: None,
            webhook_url: None,
            chat_webhook_url: None,
            extra_ignored_hosts: Vec::new(),
            _phantom: PhantomData,
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub fn builder() -> PipelineConfigBuilder<()> {
        PipelineConfigBuilder::default()
    }
}

impl PipelineConfigBuilder<()> {
    #[must_use]
    pub fn seed_urls(self, seed_urls: Vec<Url>) -> PipelineConfigBuilder<WithSeedUrls> {
        PipelineConfigBuilder {
            seed_urls: Some(seed_urls),
            sitemap_url: self.sitemap_url,
            sitemap_updated_within: self.sitemap_updated_within,
            user_agent: self.user_agent,
            concurrency: self.concurrency,
            cache_ttl_secs: self.cache_ttl_secs,
            skip_cache_sync: self.skip_cache_sync,
            skip_sitemap_parsing: self.skip_sitemap_parsing,
            blob: self.blob,
            kv: self.kv,
            webhook_url: self.webhook_url,
            chat_webhook_url: self.chat_webhook_url,
            extra_ignored_hosts: self.extra_ignored_hosts,
            _phantom: PhantomData,
        }
    }
}

impl PipelineConfigBuilder<WithSeedUrls> {
    #[must_use]
    pub fn stores(
        self,
        blob: BlobCredentials,
        kv: KvCredentials,
    ) -> PipelineConfigBuilder<WithStores> {
        PipelineConfigBuilder {
            seed_urls: self.seed_urls,
            sitemap_url: self.sitemap_url,
            sitemap_updated_within: self.sitemap_updated_within,
            user_agent: self.user_agent,
            concurrency: self.concurrency,
            cache_ttl_secs: self.cache_ttl_secs,
            skip_cache_sync: self.skip_cache_sync,
            skip_sitemap_parsing: self.skip_sitemap_parsing,
            blob: Some(blob),
            kv: Some(kv),
            webhook_url: self.webhook_url,
            chat_webhook_url: self.chat_webhook_url,
            extra_ignored_hosts: self.extra_ignored_hosts,
            _phantom: PhantomData,
        }
    }
}

impl PipelineConfigBuilder<WithStores> {
    pub fn build(self) -> Result<PipelineConfig> {
        if self.concurrency == 0 {
            return Err(anyhow!("concurrency must be >= 1"));
        }
        Ok(PipelineConfig {
            seed_urls: self.seed_urls.ok_or_else(|| anyhow!("seed_urls is required"))?,
            sitemap_url: self.sitemap_url,
            sitemap_updated_within: self.sitemap_updated_within,
            user_agent: self.user_agent,
            concurrency: self.concurrency,
            cache_ttl_secs: self.cache_ttl_secs,
            skip_cache_sync: self.skip_cache_sync,
            skip_sitemap_parsing: self.skip_sitemap_parsing,
            blob: self.blob.ok_or_else(|| anyhow!("blob credentials are required"))?,
            kv: self.kv.ok_or_else(|| anyhow!("kv credentials are required"))?,
            webhook_url: self.webhook_url,
            chat_webhook_url: self.chat_webhook_url,
            extra_ignored_hosts: self.extra_ignored_hosts,
        })
    }
}

// Builder methods available regardless of state (all optional fields).
impl<State> PipelineConfigBuilder<State> {
    #[must_use]
    pub fn sitemap_url(mut self, url: Option<Url>) -> Self {
        self.sitemap_url = url;
        self
    }

    #[must_use]
    pub fn sitemap_updated_within(mut self, window: SitemapWindow) -> Self {
        self.sitemap_updated_within = window;
        self
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn cache_ttl_secs(mut self, cache_ttl_secs: u64) -> Self {
        self.cache_ttl_secs = cache_ttl_secs;
        self
    }

    #[must_use]
    pub fn skip_cache_sync(mut self, skip: bool) -> Self {
        self.skip_cache_sync = skip;
        self
    }

    #[must_use]
    pub fn skip_sitemap_parsing(mut self, skip: bool) -> Self {
        self.skip_sitemap_parsing = skip;
        self
    }

    #[must_use]
    pub fn webhook_url(mut self, url: Option<Url>) -> Self {
        self.webhook_url = url;
        self
    }

    #[must_use]
    pub fn chat_webhook_url(mut self, url: Option<Url>) -> Self {
        self.chat_webhook_url = url;
        self
    }

    #[must_use]
    pub fn extra_ignored_hosts(mut self, hosts: Vec<String>) -> Self {
        self.extra_ignored_hosts = hosts;
        self
    }
}

fn required_env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("missing required environment variable {name}"))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn parse_bool_env(name: &str, default: bool) -> bool {
    match optional_env(name) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        None => default,
    }
}

/// Seed URLs are newline- or comma-separated; blank entries are skipped.
/// Entries that fail to parse as absolute URLs are a *Fatal* error, since an
/// unusable seed list means there is nothing to render.
fn parse_url_list(raw: &str) -> Result<Vec<Url>> {
    raw.split(|c| c == '\n' || c == ',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Url::parse(s).with_context(|| format!("invalid URL in seed list: '{s}'")))
        .collect()
}

/// Load configuration from environment variables. See §4.10 / §6 for the
/// full variable list.
pub fn from_env() -> Result<PipelineConfig> {
    let seed_urls = parse_url_list(&required_env("TO_HTML_SEED_URLS")?)?;
    if seed_urls.is_empty() {
        return Err(anyhow!("TO_HTML_SEED_URLS resolved to an empty URL list"));
    }

    let sitemap_url = optional_env("TO_HTML_SITEMAP_URL")
        .map(|s| Url::parse(&s).with_context(|| format!("invalid TO_HTML_SITEMAP_URL: '{s}'")))
        .transpose()?;

    let sitemap_updated_within = optional_env("TO_HTML_SITEMAP_UPDATED_WITHIN")
        .map(|s| s.parse::<SitemapWindow>())
        .transpose()?
        .unwrap_or(SitemapWindow::All);

    let user_agent = optional_env("TO_HTML_USER_AGENT")
        .unwrap_or_else(|| crate::browser::DEFAULT_USER_AGENT.to_string());

    let concurrency = optional_env("TO_HTML_CONCURRENCY")
        .map(|s| s.parse::<usize>().with_context(|| format!("invalid TO_HTML_CONCURRENCY: '{s}'")))
        .transpose()?
        .unwrap_or(4);

    let cache_ttl_secs = optional_env("TO_HTML_CACHE_TTL_SECS")
        .map(|s| s.parse::<u64>().with_context(|| format!("invalid TO_HTML_CACHE_TTL_SECS: '{s}'")))
        .transpose()?
        .unwrap_or(86_400);

    let skip_cache_sync = parse_bool_env("TO_HTML_SKIP_CACHE_SYNC", false);
    let skip_sitemap_parsing = parse_bool_env("TO_HTML_SKIP_SITEMAP_PARSING", false);

    let blob = BlobCredentials {
        account_id: required_env("TO_HTML_R2_ACCOUNT_ID")?,
        access_key_id: required_env("TO_HTML_R2_ACCESS_KEY_ID")?,
        secret_access_key: required_env("TO_HTML_R2_SECRET_ACCESS_KEY")?,
        bucket: required_env("TO_HTML_R2_BUCKET")?,
    };

    let kv = KvCredentials {
        account_id: required_env("TO_HTML_KV_ACCOUNT_ID")?,
        api_token: required_env("TO_HTML_KV_API_TOKEN")?,
        namespace_id: required_env("TO_HTML_KV_NAMESPACE_ID")?,
    };

    let webhook_url = optional_env("TO_HTML_WEBHOOK_URL")
        .map(|s| Url::parse(&s).with_context(|| format!("invalid TO_HTML_WEBHOOK_URL: '{s}'")))
        .transpose()?;
    let chat_webhook_url = optional_env("TO_HTML_CHAT_WEBHOOK_URL")
        .map(|s| Url::parse(&s).with_context(|| format!("invalid TO_HTML_CHAT_WEBHOOK_URL: '{s}'")))
        .transpose()?;

    let extra_ignored_hosts = optional_env("TO_HTML_EXTRA_IGNORED_HOSTS")
        .map(|s| s.split(',').map(|h| h.trim().to_string()).filter(|h| !h.is_empty()).collect())
        .unwrap_or_default();

    PipelineConfig::builder()
        .seed_urls(seed_urls)
        .sitemap_url(sitemap_url)
        .sitemap_updated_within(sitemap_updated_within)
        .user_agent(user_agent)
        .concurrency(concurrency)
        .cache_ttl_secs(cache_ttl_secs)
        .skip_cache_sync(skip_cache_sync)
        .skip_sitemap_parsing(skip_sitemap_parsing)
        .extra_ignored_hosts(extra_ignored_hosts)
        .webhook_url(webhook_url)
        .chat_webhook_url(chat_webhook_url)
        .stores(blob, kv)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> (BlobCredentials, KvCredentials) {
        (
            BlobCredentials {
                account_id: "acct".to_string(),
                access_key_id: "key".to_string(),
                secret_access_key: "secret".to_string(),
                bucket: "bucket".to_string(),
            },
            KvCredentials {
                account_id: "acct".to_string(),
                api_token: "token".to_string(),
                namespace_id: "ns".to_string(),
            },
        )
    }

    #[test]
    fn builder_rejects_zero_concurrency() {
        let (blob, kv) = creds();
        let result = PipelineConfig::builder()
            .seed_urls(vec![Url::parse("https://example.com").unwrap()])
            .concurrency(0)
            .stores(blob, kv)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_succeeds_with_required_fields() {
        let (blob, kv) = creds();
        let config = PipelineConfig::builder()
            .seed_urls(vec![Url::parse("https://example.com").unwrap()])
            .stores(blob, kv)
            .build()
            .unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.sitemap_updated_within, SitemapWindow::All);
    }

    #[test]
    fn sitemap_window_parses_known_values() {
        assert_eq!("1d".parse::<SitemapWindow>().unwrap(), SitemapWindow::OneDay);
        assert_eq!("30d".parse::<SitemapWindow>().unwrap(), SitemapWindow::ThirtyDays);
        assert_eq!("all".parse::<SitemapWindow>().unwrap(), SitemapWindow::All);
        assert!("nope".parse::<SitemapWindow>().is_err());
    }

    #[test]
    fn parse_url_list_splits_on_comma_and_newline() {
        let urls = parse_url_list("https://example.com/a, https://example.com/b\nhttps://example.com/c").unwrap();
        assert_eq!(urls.len(), 3);
    }

    #[test]
    fn parse_url_list_skips_blank_entries() {
        let urls = parse_url_list("https://example.com/a,,\n\nhttps://example.com/b").unwrap();
        assert_eq!(urls.len(), 2);
    }
}
