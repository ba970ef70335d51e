//! The Outbound Reporter (C9): best-effort webhook and chat notifications
//! after a batch completes. Never changes the process exit code (§4.9/§7).

use chrono::Utc;
use serde::Serialize;
use tracing::warn;
use url::Url;

use crate::pipeline::BatchReport;

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    timestamp: chrono::DateTime<Utc>,
    count_rendered: usize,
    count_analyzed: usize,
    count_kv_synced: usize,
    count_r2_synced: usize,
    failed_render_urls: &'a [Url],
    failed_sync_urls: &'a [Url],
}

/// POST the aggregate batch report to `webhook_url`, and a short
/// human-readable summary line to `chat_webhook_url`, if configured.
/// Both are best-effort: failures are logged at `warn` and swallowed.
pub async fn report(
    http: &reqwest::Client,
    report: &BatchReport,
    webhook_url: Option<&Url>,
    chat_webhook_url: Option<&Url>,
) {
    if let Some(url) = webhook_url {
        post_webhook(http, url, report).await;
    }
    if let Some(url) = chat_webhook_url {
        post_chat_summary(http, url, report).await;
    }
}

async fn post_webhook(http: &reqwest::Client, url: &Url, report: &BatchReport) {
    let payload = WebhookPayload {
        timestamp: Utc::now(),
        count_rendered: report.count_rendered,
        count_analyzed: report.count_analyzed,
        count_kv_synced: report.count_kv_synced,
        count_r2_synced: report.count_r2_synced,
        failed_render_urls: &report.failed_render_urls,
        failed_sync_urls: &report.failed_sync_urls,
    };

    match http.post(url.clone()).json(&payload).send().await {
        Ok(response) if !response.status().is_success() => {
            warn!(%url, status = %response.status(), "webhook report returned non-2xx");
        }
        Err(e) => warn!(%url, error = %e, "webhook report request failed"),
        Ok(_) => {}
    }
}

fn summary_line(report: &BatchReport) -> String {
    format!(
        "prerender batch: {} rendered, {} kv-synced, {} r2-synced, {} render failures, {} sync failures",
        report.count_rendered,
        report.count_kv_synced,
        report.count_r2_synced,
        report.failed_render_urls.len(),
        report.failed_sync_urls.len(),
    )
}

#[derive(Debug, Serialize)]
struct ChatPayload {
    text: String,
}

async fn post_chat_summary(http: &reqwest::Client, url: &Url, report: &BatchReport) {
    let payload = ChatPayload {
        text: summary_line(report),
    };

    match http.post(url.clone()).json(&payload).send().await {
        Ok(response) if !response.status().is_success() => {
            warn!(%url, status = %response.status(), "chat report returned non-2xx");
        }
        Err(e) => warn!(%url, error = %e, "chat report request failed"),
        Ok(_) => {}
    }
}
