//! The Render Driver (C3): turns a single URL into a captured HTML
//! snapshot plus response metadata, using a fresh tab per render.

use std::time::Duration;

use anyhow::Context as _;
use chromiumoxide::Browser;
use chromiumoxide::cdp::browser_protocol::network::{
    EventResponseReceived, ResourceType, SetExtraHttpHeadersParams,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::readiness::{self, HARD_TIMEOUT_MS, TerminationReason};

const NAVIGATION_TIMEOUT_MS: u64 = HARD_TIMEOUT_MS * 2;
const MARKER_HEADER_NAME: &str = "x-prerender-pipeline";
const MARKER_HEADER_VALUE: &str = "1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderSuccess {
    pub url: Url,
    /// The page's URL after navigation, as reported by the browser — raw
    /// and unparsed. The Cache Synchronizer parses it itself and is the
    /// one place a parse failure is handled (SPEC_FULL.md §4.4 step 1).
    pub final_url: String,
    pub html: String,
    pub status_code: Option<u16>,
    pub x_robots_tag: Option<String>,
    pub termination_reason: TerminationReason,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RenderFailure {
    pub url: Url,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum RenderOutcome {
    Success(RenderSuccess),
    Failure(RenderFailure),
}

impl RenderOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, RenderOutcome::Success(_))
    }
}

pub struct RenderDriver {
    user_agent: String,
    extra_ignored_hosts: Vec<String>,
}

impl RenderDriver {
    #[must_use]
    pub fn new(user_agent: String, extra_ignored_hosts: Vec<String>) -> Self {
        Self {
            user_agent,
            extra_ignored_hosts,
        }
    }

    /// Render a single URL. Always closes the tab it opens, on every exit
    /// path including failures.
    pub async fn render(&self, browser: &Browser, url: &Url) -> RenderOutcome {
        match self.render_inner(browser, url).await {
            Ok(success) => RenderOutcome::Success(success),
            Err(e) => RenderOutcome::Failure(RenderFailure {
                url: url.clone(),
                message: e.to_string(),
            }),
        }
    }

    async fn render_inner(&self, browser: &Browser, url: &Url) -> anyhow::Result<RenderSuccess> {
        let target_host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("URL has no host: {url}"))?
            .to_string();

        let page = browser.new_page("about:blank").await?;
        let close_result = self.render_on_page(&page, url, &target_host).await;
        if let Err(e) = page.close().await {
            warn!(%url, error = %e, "failed to close render tab");
        }
        close_result
    }

    async fn render_on_page(
        &self,
        page: &chromiumoxide::Page,
        url: &Url,
        target_host: &str,
    ) -> anyhow::Result<RenderSuccess> {
        page.execute(SetExtraHttpHeadersParams {
            headers: chromiumoxide::cdp::browser_protocol::network::Headers::new(
                serde_json::json!({
                    "Accept-Language": "en-US,en;q=0.9",
                    MARKER_HEADER_NAME: MARKER_HEADER_VALUE,
                }),
            ),
        })
        .await?;

        readiness::install_instrumentation(page).await?;

        let mut responses = page.event_listener::<EventResponseReceived>().await?;

        let navigation = async {
            page.goto(url.as_str())
                .await
                .with_context(|| format!("Failed to navigate to {url}"))?;
            page.wait_for_navigation()
                .await
                .with_context(|| format!("Failed to navigate to {url}"))?;
            Ok::<_, anyhow::Error>(())
        };

        tokio::time::timeout(Duration::from_millis(NAVIGATION_TIMEOUT_MS), navigation)
            .await
            .map_err(|_| anyhow::anyhow!("navigation timed out after {NAVIGATION_TIMEOUT_MS}ms"))??;

        // Navigation has already settled, so the page's reported URL is the
        // post-redirect final URL. Fetched now (not after readiness/content)
        // so it can be used to pick the matching Document response below.
        let final_url = page.url().await?.unwrap_or_else(|| url.to_string());

        let (status_code, x_robots_tag) = capture_document_response(&mut responses, &final_url).await;

        let outcome = readiness::run(page, target_host, &self.extra_ignored_hosts).await?;

        let html = page.content().await?;

        debug!(%url, %final_url, reason = ?outcome.reason, "render complete");

        Ok(RenderSuccess {
            url: url.clone(),
            final_url,
            html,
            status_code,
            x_robots_tag,
            termination_reason: outcome.reason,
            elapsed_ms: outcome.elapsed.as_millis() as u64,
        })
    }
}

/// Normalize a URL string for matching a `Document` response against the
/// page's final URL: lowercase host, trailing-slash-trimmed path, query and
/// fragment dropped, scheme preserved.
fn normalize_for_matching(url_str: &str) -> Option<String> {
    let parsed = Url::parse(url_str).ok()?;
    let scheme = parsed.scheme();
    let host = parsed.host_str()?.to_ascii_lowercase();
    let path = parsed.path().trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };
    Some(format!("{scheme}://{host}{path}"))
}

/// Drain buffered response events for the `Document` resource matching
/// `final_url`, extracting its status code and `X-Robots-Tag` header. A
/// redirected navigation produces one `Document` response per hop; matching
/// by normalized URL (rather than accepting the first `Document` event)
/// keeps this from reporting the redirect's status/headers instead of the
/// final page's.
async fn capture_document_response(
    responses: &mut chromiumoxide::listeners::EventStream<EventResponseReceived>,
    final_url: &str,
) -> (Option<u16>, Option<String>) {
    let Some(target_normalized) = normalize_for_matching(final_url) else {
        warn!(final_url, "cannot normalize final url for response matching");
        return (None, None);
    };

    let drain = async {
        let mut document_count = 0u32;
        while let Some(event) = responses.next().await {
            if event.r#type != ResourceType::Document {
                continue;
            }
            document_count += 1;

            let Some(response_normalized) = normalize_for_matching(event.response.url.as_str()) else {
                continue;
            };
            if response_normalized != target_normalized {
                continue; // a redirect hop or an unrelated frame's document
            }

            let status_code = u16::try_from(event.response.status).ok();
            let x_robots_tag = event
                .response
                .headers
                .inner()
                .as_object()
                .and_then(|obj| {
                    obj.iter().find_map(|(k, v)| {
                        if k.eq_ignore_ascii_case("x-robots-tag") {
                            v.as_str().map(str::to_string)
                        } else {
                            None
                        }
                    })
                });
            return (status_code, x_robots_tag);
        }
        if document_count > 0 {
            debug!(document_count, final_url, "no Document response matched the final URL");
        }
        (None, None)
    };

    match tokio::time::timeout(Duration::from_millis(1_000), drain).await {
        Ok(result) => result,
        Err(_) => {
            warn!(final_url, "no document response event observed within capture window");
            (None, None)
        }
    }
}
