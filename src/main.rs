//! Thin batch entrypoint: load configuration, launch the shared browser,
//! build the URL set, run the pipeline, report, and exit (§4.11).
//!
//! Per-URL failures never change the exit code; only a *Fatal* error (bad
//! configuration, browser launch failure) does (§7).

use std::process::ExitCode;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use prerender_pipeline::browser;
use prerender_pipeline::config::{self, PipelineConfig};
use prerender_pipeline::pipeline;
use prerender_pipeline::render::RenderDriver;
use prerender_pipeline::reporter;
use prerender_pipeline::sitemap;
use prerender_pipeline::store::{R2BlobStore, WorkersKvStore};
use prerender_pipeline::sync::CacheSynchronizer;
use prerender_pipeline::urlset;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal error, aborting batch");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let config = config::from_env()?;

    let (browser, _handler_task) = browser::launch_browser(&config.user_agent).await?;

    let http = reqwest::Client::builder().user_agent(config.user_agent.clone()).build()?;

    let urls = build_url_set(&http, &config).await;
    tracing::info!(count = urls.len(), "URL set built");

    let render_driver = RenderDriver::new(config.user_agent.clone(), config.extra_ignored_hosts.clone());

    let synchronizer = if config.skip_cache_sync {
        None
    } else {
        Some(build_synchronizer(&config).await?)
    };
    let sync_mode = match &synchronizer {
        Some(synchronizer) => pipeline::SyncMode::Sync(synchronizer),
        None => pipeline::SyncMode::Skip,
    };

    let report = pipeline::run_pipeline(
        urls,
        config.concurrency,
        &browser,
        &render_driver,
        sync_mode,
        &config.user_agent,
    )
    .await;

    tracing::info!(
        rendered = report.count_rendered,
        kv_synced = report.count_kv_synced,
        r2_synced = report.count_r2_synced,
        failed_render = report.failed_render_urls.len(),
        failed_sync = report.failed_sync_urls.len(),
        "batch complete"
    );

    reporter::report(
        &http,
        &report,
        config.webhook_url.as_ref(),
        config.chat_webhook_url.as_ref(),
    )
    .await;

    Ok(())
}

async fn build_url_set(http: &reqwest::Client, config: &PipelineConfig) -> Vec<url::Url> {
    let sitemap_entries = match &config.sitemap_url {
        Some(sitemap_url) if !config.skip_sitemap_parsing => {
            sitemap::fetch(http, sitemap_url, &config.user_agent, config.sitemap_updated_within).await
        }
        _ => Vec::new(),
    };

    urlset::build(&config.seed_urls, &sitemap_entries, config.skip_sitemap_parsing)
}

async fn build_synchronizer(
    config: &PipelineConfig,
) -> Result<CacheSynchronizer<R2BlobStore, WorkersKvStore>> {
    let blob_store = R2BlobStore::from_credentials(
        &config.blob.account_id,
        &config.blob.access_key_id,
        &config.blob.secret_access_key,
        config.blob.bucket.clone(),
    )
    .await?;

    let kv_store = WorkersKvStore::new(
        reqwest::Client::new(),
        config.kv.account_id.clone(),
        config.kv.namespace_id.clone(),
        config.kv.api_token.clone(),
    );

    Ok(CacheSynchronizer::new(blob_store, kv_store, config.cache_ttl_secs))
}
