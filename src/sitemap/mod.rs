//! The Sitemap Fetcher (C7): best-effort discovery of additional URLs from
//! an XML sitemap, with one level of `<sitemapindex>` recursion and recency
//! filtering by `<lastmod>`.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::config::SitemapWindow;

#[derive(Debug, Clone)]
pub struct SitemapEntry {
    pub loc: Url,
    pub lastmod: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct UrlEntryRaw {
    loc: String,
    lastmod: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UrlSet {
    #[serde(rename = "url", default)]
    url: Vec<UrlEntryRaw>,
}

#[derive(Debug, Deserialize)]
struct SitemapRef {
    loc: String,
}

#[derive(Debug, Deserialize)]
struct SitemapIndex {
    #[serde(rename = "sitemap", default)]
    sitemap: Vec<SitemapRef>,
}

/// Fetch `sitemap_url` and return its (possibly filtered) URL entries. Best
/// effort throughout: any fetch or parse failure at any level is logged and
/// contributes an empty list rather than failing the batch (§4.7).
pub async fn fetch(
    http: &reqwest::Client,
    sitemap_url: &Url,
    user_agent: &str,
    updated_within: SitemapWindow,
) -> Vec<SitemapEntry> {
    let body = match fetch_body(http, sitemap_url, user_agent).await {
        Ok(body) => body,
        Err(e) => {
            warn!(%sitemap_url, error = %e, "sitemap fetch failed");
            return Vec::new();
        }
    };

    let entries = if let Ok(index) = quick_xml::de::from_str::<SitemapIndex>(&body) {
        if !index.sitemap.is_empty() {
            fetch_index_children(http, &index, user_agent).await
        } else {
            parse_urlset(&body)
        }
    } else {
        parse_urlset(&body)
    };

    filter_by_recency(entries, updated_within)
}

async fn fetch_body(http: &reqwest::Client, url: &Url, user_agent: &str) -> anyhow::Result<String> {
    let response = http
        .get(url.clone())
        .header("User-Agent", user_agent)
        .send()
        .await?
        .error_for_status()?;
    Ok(response.text().await?)
}

fn parse_urlset(body: &str) -> Vec<SitemapEntry> {
    match quick_xml::de::from_str::<UrlSet>(body) {
        Ok(urlset) => urlset
            .url
            .into_iter()
            .filter_map(|raw| {
                let loc = match Url::parse(raw.loc.trim()) {
                    Ok(url) => url,
                    Err(e) => {
                        warn!(loc = raw.loc, error = %e, "dropping sitemap entry with unparsable loc");
                        return None;
                    }
                };
                let lastmod = raw.lastmod.as_deref().and_then(parse_lastmod);
                Some(SitemapEntry { loc, lastmod })
            })
            .collect(),
        Err(e) => {
            warn!(error = %e, "failed to parse sitemap body as <urlset>");
            Vec::new()
        }
    }
}

/// One level of `<sitemapindex>` recursion only: each child sitemap is
/// fetched once and its `<url>` entries merged; a child that is itself an
/// index is not followed further (§9).
async fn fetch_index_children(
    http: &reqwest::Client,
    index: &SitemapIndex,
    user_agent: &str,
) -> Vec<SitemapEntry> {
    let mut merged = Vec::new();
    for child in &index.sitemap {
        let Ok(child_url) = Url::parse(child.loc.trim()) else {
            warn!(loc = child.loc, "dropping sitemap-index child with unparsable loc");
            continue;
        };
        match fetch_body(http, &child_url, user_agent).await {
            Ok(body) => merged.extend(parse_urlset(&body)),
            Err(e) => warn!(%child_url, error = %e, "sitemap-index child fetch failed"),
        }
    }
    merged
}

fn parse_lastmod(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
        })
}

fn filter_by_recency(entries: Vec<SitemapEntry>, window: SitemapWindow) -> Vec<SitemapEntry> {
    let Some(max_age) = window.max_age() else {
        return entries;
    };
    let cutoff = Utc::now() - max_age;
    entries
        .into_iter()
        .filter(|entry| entry.lastmod.is_some_and(|lastmod| lastmod >= cutoff))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_urlset_with_lastmod() {
        let xml = r#"<?xml version="1.0"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://example.com/a</loc><lastmod>2026-07-01</lastmod></url>
  <url><loc>https://example.com/b</loc></url>
</urlset>"#;
        let entries = parse_urlset(xml);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].lastmod.is_some());
        assert!(entries[1].lastmod.is_none());
    }

    #[test]
    fn recency_filter_drops_missing_lastmod_unless_all() {
        let entries = vec![
            SitemapEntry {
                loc: Url::parse("https://example.com/old").unwrap(),
                lastmod: Some(Utc::now() - chrono::Duration::days(60)),
            },
            SitemapEntry {
                loc: Url::parse("https://example.com/new").unwrap(),
                lastmod: Some(Utc::now()),
            },
            SitemapEntry {
                loc: Url::parse("https://example.com/unknown").unwrap(),
                lastmod: None,
            },
        ];

        let filtered = filter_by_recency(entries.clone(), SitemapWindow::SevenDays);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].loc.path(), "/new");

        let all = filter_by_recency(entries, SitemapWindow::All);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn scenario_i_sitemap_index_recursion_merges_children() {
        let index_xml = r#"<?xml version="1.0"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>https://example.com/sitemap-a.xml</loc></sitemap>
  <sitemap><loc>https://example.com/sitemap-b.xml</loc></sitemap>
</sitemapindex>"#;
        let index: SitemapIndex = quick_xml::de::from_str(index_xml).unwrap();
        assert_eq!(index.sitemap.len(), 2);
        assert_eq!(index.sitemap[0].loc, "https://example.com/sitemap-a.xml");
    }

    #[test]
    fn unparsable_loc_is_dropped_not_fatal() {
        let xml = r#"<?xml version="1.0"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>not a url</loc></url>
  <url><loc>https://example.com/good</loc></url>
</urlset>"#;
        let entries = parse_urlset(xml);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].loc.path(), "/good");
    }
}
