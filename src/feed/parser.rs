use feed_rs::model::{Entry, Link};
use feed_rs::parser;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::storage::{FeedFormat, NormalizedFeed, NormalizedItem};
use crate::util::{clean_text, decode_html};

/// A payload that was classified but could not be read as that format.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid RSS/Atom document: {0}")]
    Xml(#[from] parser::ParseFeedError),
    #[error("invalid JSON feed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parse RSS 0.9x/1.0/2.0 or Atom text into a [`NormalizedFeed`].
pub fn parse_rss_like(text: &str) -> Result<NormalizedFeed, ParseError> {
    let feed = parser::parse(text.as_bytes())?;

    let link = first_page_link(&feed.links);
    let image_url = feed
        .logo
        .as_ref()
        .or(feed.icon.as_ref())
        .map(|image| image.uri.clone());
    let last_updated = feed.updated.or(feed.published);

    Ok(NormalizedFeed {
        format: FeedFormat::Rss,
        title: feed.title.and_then(|t| clean_text(&t.content)),
        link,
        description: feed.description.map(|d| decode_html(&d.content)),
        image_url,
        language: feed.language,
        last_updated: last_updated.map(|d| d.timestamp()),
        last_updated_raw: last_updated.map(|d| d.to_rfc3339()),
        items: feed.entries.into_iter().map(normalize_entry).collect(),
    })
}

fn normalize_entry(entry: Entry) -> NormalizedItem {
    let link = entry
        .links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| entry.links.first())
        .map(|l| l.href.clone());
    let external_link = entry
        .links
        .iter()
        .find(|l| l.rel.as_deref() == Some("related"))
        .map(|l| l.href.clone());

    let title = entry.title.and_then(|t| clean_text(&t.content));
    let description = entry.summary.map(|s| decode_html(&s.content));
    let content = entry
        .content
        .and_then(|c| c.body)
        .map(|body| decode_html(&body))
        .or_else(|| description.clone());

    let author = join_authors(entry.authors.iter().map(|p| p.name.as_str()));
    let published = entry.published.or(entry.updated);

    let image_url = entry.media.iter().find_map(|media| {
        media
            .thumbnails
            .first()
            .map(|thumb| thumb.image.uri.clone())
            .or_else(|| {
                media
                    .content
                    .iter()
                    .filter(|c| {
                        c.content_type
                            .as_ref()
                            .is_some_and(|mime| mime.ty().as_str() == "image")
                    })
                    .find_map(|c| c.url.as_ref().map(|u| u.to_string()))
            })
    });

    let external_id = external_id_or_fallback(&entry.id, link.as_deref(), title.as_deref());

    NormalizedItem {
        external_id,
        title,
        link,
        external_link,
        description,
        content,
        author,
        published: published.map(|d| d.timestamp()).unwrap_or(0),
        published_raw: published.map(|d| d.to_rfc3339()),
        image_url,
    }
}

/// Website link of a feed: the first link that is not the feed's own URL.
fn first_page_link(links: &[Link]) -> Option<String> {
    links
        .iter()
        .find(|l| l.rel.as_deref() != Some("self"))
        .map(|l| l.href.clone())
}

/// Join author names with ", ", skipping blanks. `None` when nobody is left.
pub(crate) fn join_authors<'a>(names: impl Iterator<Item = &'a str>) -> Option<String> {
    let names: Vec<&str> = names.map(str::trim).filter(|n| !n.is_empty()).collect();
    if names.is_empty() {
        None
    } else {
        Some(names.join(", "))
    }
}

/// The item's own id when it has one, otherwise `sha256(link|title)` so
/// id-less feeds still deduplicate across refreshes.
pub(crate) fn external_id_or_fallback(id: &str, link: Option<&str>, title: Option<&str>) -> String {
    let trimmed = id.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }

    let input = format!("{}|{}", link.unwrap_or(""), title.unwrap_or(""));
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:media="http://search.yahoo.com/mrss/" xmlns:content="http://purl.org/rss/1.0/modules/content/">
  <channel>
    <title>Tom &amp;amp; Jerry</title>
    <link>https://example.com/</link>
    <description>Cartoon &amp;lt;news&amp;gt;</description>
    <language>en-us</language>
    <lastBuildDate>Tue, 10 Jun 2025 04:00:00 GMT</lastBuildDate>
    <image><url>https://example.com/logo.png</url><title>T</title><link>https://example.com/</link></image>
    <item>
      <guid>item-1</guid>
      <title>First</title>
      <link>https://example.com/1</link>
      <description>Summary one</description>
      <content:encoded><![CDATA[<p>Full &amp; body</p>]]></content:encoded>
      <author>alice@example.com (Alice)</author>
      <pubDate>Mon, 09 Jun 2025 10:00:00 GMT</pubDate>
      <media:thumbnail url="https://example.com/1.jpg"/>
    </item>
    <item>
      <title>No guid</title>
      <link>https://example.com/2</link>
      <description>Only a summary</description>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_parse_rss_feed_fields() {
        let feed = parse_rss_like(RSS).unwrap();
        assert_eq!(feed.format, FeedFormat::Rss);
        assert_eq!(feed.title.as_deref(), Some("Tom & Jerry"));
        assert_eq!(feed.link.as_deref(), Some("https://example.com/"));
        assert_eq!(feed.description.as_deref(), Some("Cartoon <news>"));
        assert_eq!(feed.language.as_deref(), Some("en-us"));
        assert_eq!(feed.image_url.as_deref(), Some("https://example.com/logo.png"));
        assert_eq!(feed.last_updated, Some(1749528000));
        assert!(feed.last_updated_raw.is_some());
        assert_eq!(feed.items.len(), 2);
    }

    #[test]
    fn test_parse_rss_item_fields() {
        let feed = parse_rss_like(RSS).unwrap();
        let item = &feed.items[0];
        assert_eq!(item.external_id, "item-1");
        assert_eq!(item.title.as_deref(), Some("First"));
        assert_eq!(item.link.as_deref(), Some("https://example.com/1"));
        assert_eq!(item.description.as_deref(), Some("Summary one"));
        assert_eq!(item.content.as_deref(), Some("<p>Full & body</p>"));
        assert_eq!(item.published, 1749463200);
        assert_eq!(item.image_url.as_deref(), Some("https://example.com/1.jpg"));
    }

    #[test]
    fn test_item_image_from_media_content() {
        let rss = r#"<rss version="2.0" xmlns:media="http://search.yahoo.com/mrss/"><channel><title>M</title>
<item><guid>v1</guid><title>Video</title>
  <media:content url="https://example.com/clip.mp4" type="video/mp4"/>
</item>
<item><guid>p1</guid><title>Photo</title>
  <media:content url="https://example.com/photo.jpg" type="image/jpeg"/>
</item>
</channel></rss>"#;
        let feed = parse_rss_like(rss).unwrap();
        assert_eq!(feed.items[0].image_url, None);
        assert_eq!(
            feed.items[1].image_url.as_deref(),
            Some("https://example.com/photo.jpg")
        );
    }

    #[test]
    fn test_missing_guid_gets_stable_id() {
        let first = parse_rss_like(RSS).unwrap();
        let second = parse_rss_like(RSS).unwrap();
        let id = &first.items[1].external_id;

        assert!(!id.is_empty());
        assert_eq!(id, &second.items[1].external_id);
        assert_ne!(id, &first.items[0].external_id);
    }

    #[test]
    fn test_fallback_id_hashes_link_and_title() {
        let id = external_id_or_fallback("  ", Some("https://example.com/2"), Some("No guid"));
        assert_eq!(id.len(), 64);
        assert_eq!(
            id,
            external_id_or_fallback("", Some("https://example.com/2"), Some("No guid"))
        );
        assert_ne!(id, external_id_or_fallback("", Some("https://example.com/3"), Some("No guid")));
        assert_eq!(external_id_or_fallback(" guid-1 ", None, None), "guid-1");
    }

    #[test]
    fn test_content_falls_back_to_summary_and_date_defaults_to_epoch() {
        let feed = parse_rss_like(RSS).unwrap();
        let item = &feed.items[1];
        assert_eq!(item.content.as_deref(), Some("Only a summary"));
        assert_eq!(item.published, 0);
        assert_eq!(item.published_raw, None);
    }

    #[test]
    fn test_parse_atom_feed() {
        let atom = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Example</title>
  <link rel="self" href="https://example.org/atom.xml"/>
  <link href="https://example.org/"/>
  <id>urn:uuid:60a76c80-d399-11d9-b93C-0003939e0af6</id>
  <updated>2025-06-10T18:30:02Z</updated>
  <icon>https://example.org/icon.png</icon>
  <entry>
    <title>Atom entry</title>
    <link href="https://example.org/2025/06/10/entry"/>
    <link rel="related" href="https://other.example.net/source"/>
    <id>urn:uuid:1225c695-cfb8-4ebb-aaaa-80da344efa6a</id>
    <updated>2025-06-10T18:30:02Z</updated>
    <author><name>Alice</name></author>
    <author><name>Bob</name></author>
    <summary>Some text.</summary>
  </entry>
</feed>"#;
        let feed = parse_rss_like(atom).unwrap();
        assert_eq!(feed.title.as_deref(), Some("Atom Example"));
        assert_eq!(feed.link.as_deref(), Some("https://example.org/"));
        assert_eq!(feed.image_url.as_deref(), Some("https://example.org/icon.png"));

        let item = &feed.items[0];
        assert_eq!(item.external_id, "urn:uuid:1225c695-cfb8-4ebb-aaaa-80da344efa6a");
        assert_eq!(item.link.as_deref(), Some("https://example.org/2025/06/10/entry"));
        assert_eq!(item.external_link.as_deref(), Some("https://other.example.net/source"));
        assert_eq!(item.author.as_deref(), Some("Alice, Bob"));
        assert_eq!(item.published, 1749580202);
    }

    #[test]
    fn test_title_control_chars_stripped() {
        let rss = "<rss version=\"2.0\"><channel><title>Evil\u{1b}[31m Feed</title>\
                   <item><guid>1</guid><title>\u{7}Bell</title></item></channel></rss>";
        let feed = parse_rss_like(rss).unwrap();
        assert_eq!(feed.title.as_deref(), Some("Evil Feed"));
        assert_eq!(feed.items[0].title.as_deref(), Some("Bell"));
    }

    #[test]
    fn test_invalid_xml_is_parse_error() {
        assert!(matches!(parse_rss_like("{\"title\":\"T\"}"), Err(ParseError::Xml(_))));
        assert!(matches!(parse_rss_like("<html></html>"), Err(ParseError::Xml(_))));
    }

    #[test]
    fn test_join_authors_skips_blanks() {
        assert_eq!(join_authors(["Ann", " ", "Ben"].into_iter()).as_deref(), Some("Ann, Ben"));
        assert_eq!(join_authors(std::iter::empty()), None);
    }
}
