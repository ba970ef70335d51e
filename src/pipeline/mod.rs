//! The Pipeline Orchestrator (C5): fixed-size concurrent batching over the
//! URL set, one shared browser, per-URL sequencing Render → Analyze → Sync.

use chromiumoxide::Browser;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use url::Url;

use crate::render::{RenderDriver, RenderOutcome};
use crate::seo;
use crate::store::{BlobStore, KvStore};
use crate::sync::CacheSynchronizer;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub url: Url,
    pub is_rendered: bool,
    pub is_analyzed: bool,
    pub is_cached_to_r2: bool,
    pub is_cached_to_kv: bool,
}

impl PipelineResult {
    fn failed(url: Url) -> Self {
        Self {
            url,
            is_rendered: false,
            is_analyzed: false,
            is_cached_to_r2: false,
            is_cached_to_kv: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub count_rendered: usize,
    pub count_analyzed: usize,
    pub count_kv_synced: usize,
    pub count_r2_synced: usize,
    pub failed_render_urls: Vec<Url>,
    pub failed_sync_urls: Vec<Url>,
    pub results: Vec<PipelineResult>,
}

impl BatchReport {
    fn record(&mut self, result: PipelineResult) {
        if result.is_rendered {
            self.count_rendered += 1;
        } else {
            self.failed_render_urls.push(result.url.clone());
        }
        if result.is_analyzed {
            self.count_analyzed += 1;
        }
        if result.is_cached_to_kv {
            self.count_kv_synced += 1;
        }
        if result.is_cached_to_r2 {
            self.count_r2_synced += 1;
        }
        if result.is_rendered && !(result.is_cached_to_kv && result.is_cached_to_r2) {
            self.failed_sync_urls.push(result.url.clone());
        }
        self.results.push(result);
    }
}

/// Whether a pipeline run publishes to the cache at all. A plain `Option`
/// would force every caller to pin down `B`/`K` even when skipping sync, so
/// the "off" state is its own unparameterized variant instead.
pub enum SyncMode<'a, B, K> {
    Skip,
    Sync(&'a CacheSynchronizer<B, K>),
}

/// Run one URL through Render → Analyze → (unless `skip_cache_sync`) Sync.
/// A failure at any stage short-circuits the remaining stages; the returned
/// result records which stages actually succeeded (§7).
async fn run_one<B: BlobStore, K: KvStore>(
    browser: &Browser,
    render_driver: &RenderDriver,
    sync_mode: &SyncMode<'_, B, K>,
    user_agent: &str,
    url: Url,
) -> PipelineResult {
    let render_outcome = render_driver.render(browser, &url).await;
    let success = match render_outcome {
        RenderOutcome::Success(success) => success,
        RenderOutcome::Failure(failure) => {
            error!(%url, error = failure.message, "render failed");
            return PipelineResult::failed(url);
        }
    };

    let analysis = seo::analyze(&success.html, success.status_code, success.x_robots_tag.as_deref());

    let SyncMode::Sync(synchronizer) = sync_mode else {
        return PipelineResult {
            url,
            is_rendered: true,
            is_analyzed: true,
            is_cached_to_r2: false,
            is_cached_to_kv: false,
        };
    };

    let sync_outcome = synchronizer
        .sync(&success.final_url, &success.html, &analysis, user_agent, None)
        .await;

    PipelineResult {
        url,
        is_rendered: true,
        is_analyzed: true,
        is_cached_to_r2: sync_outcome.r2_synced,
        is_cached_to_kv: sync_outcome.kv_synced,
    }
}

/// Partition `urls` into sequential batches of size `concurrency`; within a
/// batch every invocation runs concurrently, but batch *k+1* does not start
/// until batch *k*'s last invocation has settled (§4.5/§5).
pub async fn run_pipeline<B: BlobStore, K: KvStore>(
    urls: Vec<Url>,
    concurrency: usize,
    browser: &Browser,
    render_driver: &RenderDriver,
    sync_mode: SyncMode<'_, B, K>,
    user_agent: &str,
) -> BatchReport {
    let concurrency = concurrency.max(1);
    let mut report = BatchReport::default();

    for batch in urls.chunks(concurrency) {
        info!(batch_size = batch.len(), "starting batch");
        let futures = batch
            .iter()
            .cloned()
            .map(|url| run_one(browser, render_driver, &sync_mode, user_agent, url));
        let results = join_all(futures).await;
        for result in results {
            report.record(result);
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_report_records_render_failure() {
        let mut report = BatchReport::default();
        let url = Url::parse("https://example.com/a").unwrap();
        report.record(PipelineResult::failed(url.clone()));
        assert_eq!(report.count_rendered, 0);
        assert_eq!(report.failed_render_urls, vec![url]);
    }

    #[test]
    fn batch_report_counts_fully_synced_result() {
        let mut report = BatchReport::default();
        let url = Url::parse("https://example.com/a").unwrap();
        report.record(PipelineResult {
            url,
            is_rendered: true,
            is_analyzed: true,
            is_cached_to_r2: true,
            is_cached_to_kv: true,
        });
        assert_eq!(report.count_rendered, 1);
        assert_eq!(report.count_analyzed, 1);
        assert_eq!(report.count_kv_synced, 1);
        assert_eq!(report.count_r2_synced, 1);
        assert!(report.failed_sync_urls.is_empty());
    }

    #[test]
    fn batch_report_tracks_partial_sync_as_failed_sync() {
        let mut report = BatchReport::default();
        let url = Url::parse("https://example.com/a").unwrap();
        report.record(PipelineResult {
            url: url.clone(),
            is_rendered: true,
            is_analyzed: true,
            is_cached_to_r2: true,
            is_cached_to_kv: false,
        });
        assert_eq!(report.failed_sync_urls, vec![url]);
    }
}
