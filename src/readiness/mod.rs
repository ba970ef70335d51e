//! The Render Readiness Controller.
//!
//! Decides the earliest safe point to snapshot a dynamically-rendered page
//! by combining an application-level ready signal, first-party network
//! idleness, and DOM mutation idleness under a hard deadline.
//!
//! [`ReadinessTracker`] holds the pure state machine (§4.2 of the design
//! doc) so it can be driven and tested without a live browser; [`run`]
//! wires it to a `chromiumoxide` page.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent, RequestId, ResourceType,
};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use url::Url;

pub const HARD_TIMEOUT_MS: u64 = 15_000;
pub const NETWORK_QUIET_MS: u64 = 500;
pub const DOM_STABLE_MS: u64 = 300;
pub const POLL_INTERVAL_MS: u64 = 100;
pub const MIN_WAIT_MS: u64 = 500;
pub const DOM_EXTENDED_WAIT_MS: u64 = 3_000;

const HARD_TIMEOUT: Duration = Duration::from_millis(HARD_TIMEOUT_MS);
const NETWORK_QUIET: Duration = Duration::from_millis(NETWORK_QUIET_MS);
const DOM_STABLE: Duration = Duration::from_millis(DOM_STABLE_MS);
const POLL_INTERVAL: Duration = Duration::from_millis(POLL_INTERVAL_MS);
const MIN_WAIT: Duration = Duration::from_millis(MIN_WAIT_MS);
const DOM_EXTENDED_WAIT: Duration = Duration::from_millis(DOM_EXTENDED_WAIT_MS);

/// Script installed via `Page.addScriptToEvaluateOnNewDocument` before every
/// document is created, so the DOM observer attaches before first paint.
pub const PRE_NAVIGATION_SCRIPT: &str = r"
(() => {
    window.__TO_HTML = true;
    window.__lastDomChange = Date.now();
    const attach = () => {
        if (!document.documentElement) return;
        const observer = new MutationObserver(() => {
            window.__lastDomChange = Date.now();
        });
        observer.observe(document.documentElement, {
            childList: true,
            subtree: true,
            attributes: true,
            characterData: true,
        });
    };
    if (document.documentElement) {
        attach();
    } else {
        document.addEventListener('DOMContentLoaded', attach, { once: true });
    }
})();
";

const APP_SIGNAL_SCRIPT: &str =
    "window.prerenderReady === true || window.htmlSnapshot === true";
const LAST_DOM_CHANGE_SCRIPT: &str = "window.__lastDomChange";

/// Why the controller terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    AppSignaled,
    NetworkAndDomStable,
    NetworkStableDomTimeout,
    HardTimeout,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadinessOutcome {
    pub reason: TerminationReason,
    pub elapsed: Duration,
}

/// Resource-type classification used by the first-party tracking rule.
/// Mirrors the subset of CDP resource types the spec cares about; anything
/// else (media, websocket, manifest, ...) is `Other` and never tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Document,
    Script,
    Xhr,
    Fetch,
    Stylesheet,
    Image,
    Font,
    Other,
}

impl ResourceKind {
    fn is_tracked_kind(self) -> bool {
        !matches!(self, ResourceKind::Other)
    }
}

impl From<ResourceType> for ResourceKind {
    fn from(value: ResourceType) -> Self {
        match value {
            ResourceType::Document => ResourceKind::Document,
            ResourceType::Script => ResourceKind::Script,
            ResourceType::XHR => ResourceKind::Xhr,
            ResourceType::Fetch => ResourceKind::Fetch,
            ResourceType::Stylesheet => ResourceKind::Stylesheet,
            ResourceType::Image => ResourceKind::Image,
            ResourceType::Font => ResourceKind::Font,
            _ => ResourceKind::Other,
        }
    }
}

/// Analytics/font/ad/error-reporting domains ignored for network-idleness
/// purposes even when first-party. Exact-or-suffix matched.
pub static IGNORED_HOSTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "google-analytics.com",
        "googletagmanager.com",
        "fonts.googleapis.com",
        "fonts.gstatic.com",
        "analytics.google.com",
        "facebook.com",
        "connect.facebook.net",
        "doubleclick.net",
        "googlesyndication.com",
        "hotjar.com",
        "hotjar.io",
        "clarity.ms",
        "segment.io",
        "segment.com",
        "mixpanel.com",
        "amplitude.com",
        "posthog.com",
        "intercom.io",
        "crisp.chat",
        "sentry.io",
    ]
});

fn host_matches(host: &str, entry: &str) -> bool {
    host == entry || host.ends_with(&format!(".{entry}"))
}

#[must_use]
pub fn is_ignored_host(host: &str, extra_ignored: &[String]) -> bool {
    let host = host.to_ascii_lowercase();
    IGNORED_HOSTS.iter().any(|e| host_matches(&host, e))
        || extra_ignored.iter().any(|e| host_matches(&host, e))
}

/// Track the request iff first-party, not ignored, and of a tracked resource
/// kind. `request_host` is `None` when the request URL has no parsable host.
#[must_use]
pub fn should_track_request(
    request_host: Option<&str>,
    target_host: &str,
    kind: ResourceKind,
    extra_ignored: &[String],
) -> bool {
    let Some(host) = request_host else {
        return false;
    };
    if is_ignored_host(host, extra_ignored) {
        return false;
    }
    if !host.eq_ignore_ascii_case(target_host) {
        return false;
    }
    kind.is_tracked_kind()
}

/// Pure readiness state machine, single-fire: once `reason` is set, `poll`
/// is a no-op that returns the stored reason.
pub struct ReadinessTracker {
    started_at: Instant,
    pending: HashSet<RequestId>,
    network_idle_since: Option<Instant>,
    dom_stable_since: Option<Instant>,
    reason: Option<TerminationReason>,
}

impl ReadinessTracker {
    #[must_use]
    pub fn new(started_at: Instant) -> Self {
        Self {
            started_at,
            pending: HashSet::new(),
            network_idle_since: None,
            dom_stable_since: None,
            reason: None,
        }
    }

    pub fn track_start(&mut self, id: RequestId) {
        if self.reason.is_none() {
            self.pending.insert(id);
        }
    }

    pub fn track_end(&mut self, id: &RequestId) {
        self.pending.remove(id);
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn reason(&self) -> Option<TerminationReason> {
        self.reason
    }

    /// Advance the state machine one tick. `last_dom_change` is the page's
    /// `__lastDomChange` timestamp translated into the same `Instant` base
    /// as `now`; a failed read should be passed as `now` (DOM "appears
    /// active", per §4.2's failure-swallowing rule).
    pub fn poll(
        &mut self,
        now: Instant,
        app_signaled: bool,
        last_dom_change: Instant,
    ) -> Option<TerminationReason> {
        if let Some(reason) = self.reason {
            return Some(reason);
        }

        let elapsed = now.saturating_duration_since(self.started_at);

        if elapsed >= HARD_TIMEOUT {
            self.reason = Some(TerminationReason::HardTimeout);
            return self.reason;
        }

        if app_signaled {
            self.reason = Some(TerminationReason::AppSignaled);
            return self.reason;
        }

        if self.pending.is_empty() {
            if self.network_idle_since.is_none() {
                self.network_idle_since = Some(now);
            }
        } else {
            self.network_idle_since = None;
        }

        let dom_idle_time = now.saturating_duration_since(last_dom_change);
        if dom_idle_time >= DOM_STABLE {
            if self.dom_stable_since.is_none() {
                self.dom_stable_since = Some(now);
            }
        } else {
            self.dom_stable_since = None;
        }

        let network_idle_duration = self
            .network_idle_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default();
        let network_stable = network_idle_duration >= NETWORK_QUIET;
        let dom_stable = self.dom_stable_since.is_some();

        if network_stable && dom_stable {
            self.reason = Some(TerminationReason::NetworkAndDomStable);
            return self.reason;
        }

        if elapsed >= MIN_WAIT && network_stable && elapsed >= MIN_WAIT + DOM_EXTENDED_WAIT {
            self.reason = Some(TerminationReason::NetworkStableDomTimeout);
            return self.reason;
        }

        None
    }
}

/// Install the pre-navigation instrumentation. Must run before `page.goto`.
pub async fn install_instrumentation(page: &Page) -> anyhow::Result<()> {
    page.execute(AddScriptToEvaluateOnNewDocumentParams {
        source: PRE_NAVIGATION_SCRIPT.to_string(),
        world_name: None,
        include_command_line_api: None,
        run_immediately: None,
    })
    .await?;
    Ok(())
}

/// Drive the readiness loop against a live page until a terminal reason
/// fires. Called after the browser reports a completed initial navigation.
pub async fn run(
    page: &Page,
    target_host: &str,
    extra_ignored_hosts: &[String],
) -> anyhow::Result<ReadinessOutcome> {
    let started_at = Instant::now();
    let mut tracker = ReadinessTracker::new(started_at);

    let mut will_be_sent = page.event_listener::<EventRequestWillBeSent>().await?;
    let mut finished = page.event_listener::<EventLoadingFinished>().await?;
    let mut failed = page.event_listener::<EventLoadingFailed>().await?;

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            Some(event) = will_be_sent.next() => {
                let host = Url::parse(&event.request.url).ok().and_then(|u| u.host_str().map(str::to_string));
                let kind = event.r#type.map(ResourceKind::from).unwrap_or(ResourceKind::Other);
                if should_track_request(host.as_deref(), target_host, kind, extra_ignored_hosts) {
                    tracker.track_start(event.request_id.clone());
                }
            }
            Some(event) = finished.next() => {
                tracker.track_end(&event.request_id);
            }
            Some(event) = failed.next() => {
                tracker.track_end(&event.request_id);
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                let app_signaled = evaluate_app_signal(page).await;
                let last_dom_change = evaluate_last_dom_change(page, started_at, now).await;

                if let Some(reason) = tracker.poll(now, app_signaled, last_dom_change) {
                    trace!(?reason, pending = tracker.pending_count(), "readiness terminated");
                    return Ok(ReadinessOutcome {
                        reason,
                        elapsed: now.saturating_duration_since(started_at),
                    });
                }
            }
        }
    }
}

async fn evaluate_app_signal(page: &Page) -> bool {
    match page.evaluate(APP_SIGNAL_SCRIPT).await {
        Ok(result) => result.into_value::<bool>().unwrap_or(false),
        Err(e) => {
            debug!(error = %e, "app signal read failed, treating as not signaled");
            false
        }
    }
}

/// Reads the page's `__lastDomChange` (a `Date.now()` epoch-ms value) and
/// converts it into the same `Instant` timeline as `started_at`/`now`. A
/// failed read is treated as "now" (DOM appears active), per §4.2.
async fn evaluate_last_dom_change(page: &Page, started_at: Instant, now: Instant) -> Instant {
    let wall_now_ms = chrono::Utc::now().timestamp_millis();
    match page.evaluate(LAST_DOM_CHANGE_SCRIPT).await {
        Ok(result) => match result.into_value::<i64>() {
            Ok(epoch_ms) => {
                let delta_ms = wall_now_ms - epoch_ms;
                if delta_ms <= 0 {
                    now
                } else {
                    now.checked_sub(Duration::from_millis(delta_ms as u64))
                        .unwrap_or(started_at)
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to parse __lastDomChange, treating DOM as active");
                now
            }
        },
        Err(e) => {
            warn!(error = %e, "failed to read __lastDomChange, treating DOM as active");
            now
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(n: u64) -> RequestId {
        RequestId::new(n.to_string())
    }

    #[test]
    fn scenario_e_app_signal_before_timeout() {
        let t0 = Instant::now();
        let mut tracker = ReadinessTracker::new(t0);
        tracker.track_start(rid(1)); // request still pending

        let now = t0 + Duration::from_millis(700);
        let reason = tracker.poll(now, true, now);
        assert_eq!(reason, Some(TerminationReason::AppSignaled));
    }

    #[test]
    fn scenario_f_network_and_dom_idle() {
        let t0 = Instant::now();
        let mut tracker = ReadinessTracker::new(t0);
        // Requests empty from t0 + 1000ms: poll once there so idle-since is set.
        let t_idle_start = t0 + Duration::from_millis(1000);
        assert_eq!(tracker.poll(t_idle_start, false, t0 + Duration::from_millis(1100)), None);

        let now = t0 + Duration::from_millis(1600);
        let last_dom_change = t0 + Duration::from_millis(1100);
        let reason = tracker.poll(now, false, last_dom_change);
        assert_eq!(reason, Some(TerminationReason::NetworkAndDomStable));
    }

    #[test]
    fn scenario_g_extended_dom_timeout() {
        let t0 = Instant::now();
        let mut tracker = ReadinessTracker::new(t0);

        // Network idle from t0+600ms onward; DOM mutates every 50ms so it
        // never looks stable, forcing the extended-wait branch.
        let mut tick = 600u64;
        while tick <= 3600 {
            let now = t0 + Duration::from_millis(tick);
            let last_dom_change = now; // DOM "just changed": never idle
            if let Some(reason) = tracker.poll(now, false, last_dom_change) {
                assert_eq!(reason, TerminationReason::NetworkStableDomTimeout);
                assert!(tick >= 3500);
                return;
            }
            tick += 100;
        }
        panic!("expected NetworkStableDomTimeout before loop exhausted");
    }

    #[test]
    fn scenario_h_hard_timeout() {
        let t0 = Instant::now();
        let mut tracker = ReadinessTracker::new(t0);
        tracker.track_start(rid(1)); // never finishes: requests continue

        let now = t0 + Duration::from_millis(15_000);
        let reason = tracker.poll(now, false, now);
        assert_eq!(reason, Some(TerminationReason::HardTimeout));
    }

    #[test]
    fn single_fire_no_op_after_termination() {
        let t0 = Instant::now();
        let mut tracker = ReadinessTracker::new(t0);
        let now = t0 + Duration::from_millis(15_000);
        let first = tracker.poll(now, false, now);
        assert_eq!(first, Some(TerminationReason::HardTimeout));

        // Even an app signal afterwards must not change the outcome.
        let later = now + Duration::from_millis(1000);
        let second = tracker.poll(later, true, later);
        assert_eq!(second, first);
    }

    #[test]
    fn first_party_only_tracking() {
        assert!(!should_track_request(
            Some("google-analytics.com"),
            "example.com",
            ResourceKind::Script,
            &[]
        ));
        assert!(!should_track_request(
            Some("other.com"),
            "example.com",
            ResourceKind::Script,
            &[]
        ));
        assert!(!should_track_request(
            None,
            "example.com",
            ResourceKind::Script,
            &[]
        ));
        assert!(should_track_request(
            Some("example.com"),
            "example.com",
            ResourceKind::Xhr,
            &[]
        ));
        assert!(should_track_request(
            Some("sub.example.com"),
            "example.com",
            ResourceKind::Script,
            &[]
        )
            .then_some(())
            .is_none()); // subdomain of target is NOT the same host (exact match only)
    }

    #[test]
    fn ignored_host_suffix_matching() {
        assert!(is_ignored_host("www.google-analytics.com", &[]));
        assert!(is_ignored_host("google-analytics.com", &[]));
        assert!(!is_ignored_host("notgoogle-analytics.com", &[]));
        assert!(is_ignored_host("internal.adserver.test", &["adserver.test".to_string()]));
    }
}
