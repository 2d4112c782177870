//! JSON Feed 1.0 / 1.1 (<https://www.jsonfeed.org/version/1.1/>).

use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value;

use super::parser::{external_id_or_fallback, join_authors, ParseError};
use crate::storage::{FeedFormat, NormalizedFeed, NormalizedItem};
use crate::util::{clean_text, decode_html};

#[derive(Debug, Deserialize)]
struct JsonFeed {
    title: Option<String>,
    home_page_url: Option<String>,
    description: Option<String>,
    icon: Option<String>,
    favicon: Option<String>,
    language: Option<String>,
    #[serde(default)]
    items: Vec<JsonItem>,
}

#[derive(Debug, Deserialize)]
struct JsonItem {
    /// JSON Feed says string, but numbers show up in the wild
    #[serde(default)]
    id: Value,
    url: Option<String>,
    external_url: Option<String>,
    title: Option<String>,
    content_html: Option<String>,
    content_text: Option<String>,
    summary: Option<String>,
    image: Option<String>,
    banner_image: Option<String>,
    date_published: Option<String>,
    date_modified: Option<String>,
    /// 1.1
    #[serde(default)]
    authors: Vec<JsonAuthor>,
    /// 1.0
    author: Option<JsonAuthor>,
}

#[derive(Debug, Deserialize)]
struct JsonAuthor {
    name: Option<String>,
}

/// Parse JSON Feed text into a [`NormalizedFeed`].
pub fn parse_json_feed(text: &str) -> Result<NormalizedFeed, ParseError> {
    let feed: JsonFeed = serde_json::from_str(text)?;

    Ok(NormalizedFeed {
        format: FeedFormat::Json,
        title: feed.title.as_deref().and_then(clean_text),
        link: feed.home_page_url,
        description: feed.description.as_deref().map(decode_html),
        image_url: feed.icon.or(feed.favicon),
        language: feed.language,
        // JSON Feed has no feed-level date
        last_updated: None,
        last_updated_raw: None,
        items: feed.items.into_iter().map(normalize_item).collect(),
    })
}

fn normalize_item(item: JsonItem) -> NormalizedItem {
    let title = item.title.as_deref().and_then(clean_text);
    let id = match &item.id {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    };
    let external_id = external_id_or_fallback(&id, item.url.as_deref(), title.as_deref());

    let author = if item.authors.is_empty() {
        item.author
            .as_ref()
            .and_then(|a| a.name.as_deref())
            .and_then(|name| join_authors(std::iter::once(name)))
    } else {
        join_authors(item.authors.iter().filter_map(|a| a.name.as_deref()))
    };

    let published_raw = item.date_published.or(item.date_modified);
    let published = published_raw
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
        .map(|d| d.timestamp())
        .unwrap_or(0);

    NormalizedItem {
        external_id,
        title,
        link: item.url,
        external_link: item.external_url,
        description: item.summary.as_deref().map(decode_html),
        content: item
            .content_html
            .or(item.content_text)
            .as_deref()
            .map(decode_html),
        author,
        published,
        published_raw,
        image_url: item.image.or(item.banner_image),
    }
}
