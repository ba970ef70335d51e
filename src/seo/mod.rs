//! The SEO Analyzer (C6): mechanical, stateless extraction of common SEO
//! signals from a single rendered HTML string. Never touches the network
//! or the browser.

use std::collections::HashMap;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

const SOFT_404_PHRASES: &[&str] = &[
    "page not found",
    "404 not found",
    "doesn't exist",
    "no longer available",
];

/// Soft-404 bodies are short by construction; a long article that happens
/// to mention one of the phrases deep in unrelated prose should not match.
const SOFT_404_MAX_VISIBLE_TEXT_LEN: usize = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeoAnalysis {
    pub title: Option<String>,
    pub meta_description: Option<String>,
    pub h1_count: u32,
    pub h1_text: Option<String>,
    pub canonical_url: Option<String>,
    pub og_title: Option<String>,
    pub og_description: Option<String>,
    pub og_image: Option<String>,
    pub og_type: Option<String>,
    pub twitter_card: Option<String>,
    pub twitter_title: Option<String>,
    pub twitter_description: Option<String>,
    pub viewport: Option<String>,
    pub robots_meta: Option<String>,
    pub word_count: u32,
    pub is_soft_404: bool,
}

impl SeoAnalysis {
    /// Flatten into the string->string map used in blob metadata: booleans
    /// as `"true"`/`"false"`, numbers in decimal, missing fields as `""`.
    #[must_use]
    pub fn as_metadata_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("seoTitle".to_string(), self.title.clone().unwrap_or_default());
        map.insert(
            "seoMetaDescription".to_string(),
            self.meta_description.clone().unwrap_or_default(),
        );
        map.insert("seoH1Count".to_string(), self.h1_count.to_string());
        map.insert("seoH1Text".to_string(), self.h1_text.clone().unwrap_or_default());
        map.insert(
            "seoCanonicalUrl".to_string(),
            self.canonical_url.clone().unwrap_or_default(),
        );
        map.insert("seoOgTitle".to_string(), self.og_title.clone().unwrap_or_default());
        map.insert(
            "seoOgDescription".to_string(),
            self.og_description.clone().unwrap_or_default(),
        );
        map.insert("seoOgImage".to_string(), self.og_image.clone().unwrap_or_default());
        map.insert("seoOgType".to_string(), self.og_type.clone().unwrap_or_default());
        map.insert(
            "seoTwitterCard".to_string(),
            self.twitter_card.clone().unwrap_or_default(),
        );
        map.insert(
            "seoTwitterTitle".to_string(),
            self.twitter_title.clone().unwrap_or_default(),
        );
        map.insert(
            "seoTwitterDescription".to_string(),
            self.twitter_description.clone().unwrap_or_default(),
        );
        map.insert("seoViewport".to_string(), self.viewport.clone().unwrap_or_default());
        map.insert(
            "seoRobotsMeta".to_string(),
            self.robots_meta.clone().unwrap_or_default(),
        );
        map.insert("seoWordCount".to_string(), self.word_count.to_string());
        map.insert("seoIsSoft404".to_string(), self.is_soft_404.to_string());
        map
    }
}

static TITLE_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").unwrap());
static H1_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1").unwrap());
static META_NAME_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("meta[name]").unwrap());
static META_PROPERTY_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("meta[property]").unwrap());
static CANONICAL_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"link[rel="canonical"]"#).unwrap());
static BODY_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());

/// Analyze a captured HTML string. `x_robots_tag`/`status_code` come from
/// the Render Outcome; the header takes precedence over the meta tag when
/// both are present.
#[must_use]
pub fn analyze(html: &str, status_code: Option<u16>, x_robots_tag: Option<&str>) -> SeoAnalysis {
    let document = Html::parse_document(html);

    let title = document
        .select(&TITLE_SELECTOR)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty());

    let mut meta_description = None;
    let mut viewport = None;
    let mut robots_meta = None;
    let mut twitter_card = None;
    let mut twitter_title = None;
    let mut twitter_description = None;

    for el in document.select(&META_NAME_SELECTOR) {
        let Some(name) = el.value().attr("name") else {
            continue;
        };
        let content = el.value().attr("content").map(str::to_string);
        match name.to_ascii_lowercase().as_str() {
            "description" => meta_description = content,
            "viewport" => viewport = content,
            "robots" => robots_meta = content,
            "twitter:card" => twitter_card = content,
            "twitter:title" => twitter_title = content,
            "twitter:description" => twitter_description = content,
            _ => {}
        }
    }

    let mut og_title = None;
    let mut og_description = None;
    let mut og_image = None;
    let mut og_type = None;

    for el in document.select(&META_PROPERTY_SELECTOR) {
        let Some(property) = el.value().attr("property") else {
            continue;
        };
        let content = el.value().attr("content").map(str::to_string);
        match property.to_ascii_lowercase().as_str() {
            "og:title" => og_title = content,
            "og:description" => og_description = content,
            "og:image" => og_image = content,
            "og:type" => og_type = content,
            _ => {}
        }
    }

    let canonical_url = document
        .select(&CANONICAL_SELECTOR)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(str::to_string);

    let h1_elements: Vec<_> = document.select(&H1_SELECTOR).collect();
    let h1_count = h1_elements.len() as u32;
    let h1_text = h1_elements
        .first()
        .map(|el| el.text().collect::<String>().trim().to_string());

    let visible_text = document
        .select(&BODY_SELECTOR)
        .next()
        .map(|el| el.text().collect::<Vec<_>>().join(" "))
        .unwrap_or_default();
    let word_count = visible_text.split_whitespace().count() as u32;

    // Header takes precedence over the meta tag when both are present.
    let effective_robots = x_robots_tag.map(str::to_string).or(robots_meta.clone());

    let is_soft_404 = status_code == Some(200) && is_soft_404_text(&visible_text);

    SeoAnalysis {
        title,
        meta_description,
        h1_count,
        h1_text,
        canonical_url,
        og_title,
        og_description,
        og_image,
        og_type,
        twitter_card,
        twitter_title,
        twitter_description,
        viewport,
        robots_meta: effective_robots,
        word_count,
        is_soft_404,
    }
}

fn is_soft_404_text(visible_text: &str) -> bool {
    let trimmed = visible_text.trim();
    if trimmed.chars().count() > SOFT_404_MAX_VISIBLE_TEXT_LEN {
        return false;
    }
    let lower = trimmed.to_ascii_lowercase();
    SOFT_404_PHRASES.iter().any(|phrase| lower.contains(phrase))
}
