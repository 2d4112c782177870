use std::io::Cursor;
use std::sync::OnceLock;
use url::Url;

use super::fetcher::Fetcher;
use crate::storage::FeedSource;

const PLACEHOLDER_SIZE: u32 = 32;

/// Finds a representative image for a feed.
///
/// Candidates are tried in order and the first one that decodes as an
/// image wins:
///
/// 1. the image already cached on the feed
/// 2. the image URI the feed declares
/// 3. `/favicon.ico` on the feed's website (or the feed's own host)
/// 4. `/favicon.ico` on the host of the feed's first item
/// 5. the `<link rel="icon">` of the website's root page
/// 6. a built-in placeholder
///
/// Failures along the way are logged at debug level and never surface.
#[derive(Debug, Clone)]
pub struct IconResolver {
    fetcher: Fetcher,
}

impl IconResolver {
    pub fn new(fetcher: Fetcher) -> Self {
        Self { fetcher }
    }

    pub async fn resolve_image(&self, feed: &FeedSource, first_item_link: Option<&str>) -> Vec<u8> {
        if let Some(cached) = feed.image_cache.as_deref() {
            if is_valid_image(cached) {
                return cached.to_vec();
            }
            tracing::debug!(feed = %feed.uri, "Cached image does not decode, resolving again");
        }

        if let Some(uri) = feed.image_uri.as_deref().filter(|u| !u.trim().is_empty()) {
            if let Some(bytes) = self.fetch_image(uri).await {
                return bytes;
            }
        }

        let site = feed
            .link
            .as_deref()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or(&feed.uri);

        let mut tried: Vec<String> = Vec::new();
        for page in [Some(site), first_item_link].into_iter().flatten() {
            let Some(favicon) = favicon_url(page) else {
                continue;
            };
            if tried.contains(&favicon) {
                continue;
            }
            if let Some(bytes) = self.fetch_image(&favicon).await {
                return bytes;
            }
            tried.push(favicon);
        }

        if let Some(bytes) = self.icon_from_root_page(site).await {
            return bytes;
        }

        tracing::debug!(feed = %feed.uri, "No usable icon found, using placeholder");
        placeholder_icon().to_vec()
    }

    async fn fetch_image(&self, url: &str) -> Option<Vec<u8>> {
        match self.fetcher.fetch_once(url).await {
            Ok(bytes) if is_valid_image(&bytes) => Some(bytes),
            Ok(bytes) => {
                tracing::debug!(url = %url, size = bytes.len(), "Not a decodable image");
                None
            }
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Image fetch failed");
                None
            }
        }
    }

    async fn icon_from_root_page(&self, site: &str) -> Option<Vec<u8>> {
        let root = Url::parse(site).ok()?.join("/").ok()?;
        let html = match self.fetcher.fetch_once(root.as_str()).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::debug!(url = %root, error = %e, "Root page fetch failed");
                return None;
            }
        };
        let href = find_icon_link_in_html(&html, root.as_str())?;
        self.fetch_image(&href).await
    }
}

/// True when `bytes` decode as an image in one of the enabled formats.
pub fn is_valid_image(bytes: &[u8]) -> bool {
    !bytes.is_empty() && image::load_from_memory(bytes).is_ok()
}

/// A generated 32x32 PNG feed glyph, always decodable.
pub fn placeholder_icon() -> &'static [u8] {
    static PLACEHOLDER: OnceLock<Vec<u8>> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        let orange = image::Rgba([0xf2, 0x8c, 0x28, 0xff]);
        let white = image::Rgba([0xff, 0xff, 0xff, 0xff]);
        // Dot plus two arcs around the bottom-left corner
        let glyph = image::RgbaImage::from_fn(PLACEHOLDER_SIZE, PLACEHOLDER_SIZE, |x, y| {
            let dx = x as f32 - 7.0;
            let dy = (PLACEHOLDER_SIZE - 1 - y) as f32 - 7.0;
            let d = (dx * dx + dy * dy).sqrt();
            let on_glyph = dx >= -3.0
                && dy >= -3.0
                && (d < 3.5 || (10.0..13.5).contains(&d) || (18.0..21.5).contains(&d));
            if on_glyph {
                white
            } else {
                orange
            }
        });

        let mut buf = Vec::new();
        if let Err(e) = glyph.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png) {
            tracing::error!(error = %e, "Failed to encode placeholder icon");
            buf.clear();
        }
        buf
    })
}

/// `{scheme}://{host}[:port]/favicon.ico` for a page URL.
fn favicon_url(page: &str) -> Option<String> {
    let url = Url::parse(page.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.join("/favicon.ico").ok().map(String::from)
}

/// First `<link>` whose `rel` token list contains `icon`, resolved against
/// `base_url`. `apple-touch-icon` and friends do not count.
fn find_icon_link_in_html(html: &str, base_url: &str) -> Option<String> {
    // ASCII lowering keeps byte offsets aligned with `html`
    let html_lower = html.to_ascii_lowercase();
    let mut search_from = 0;

    while let Some(link_start) = html_lower[search_from..].find("<link") {
        let abs_start = search_from + link_start;
        let remaining = &html_lower[abs_start..];

        let tag_end = remaining.find('>')?;
        let tag = &remaining[..=tag_end];

        let is_icon = extract_attr_value(tag, "rel")
            .is_some_and(|rel| rel.split_ascii_whitespace().any(|token| token == "icon"));

        if is_icon {
            let original_tag = &html[abs_start..abs_start + tag_end + 1];
            if let Some(href) = extract_attr_value(original_tag, "href") {
                let href = href.trim();
                if !href.is_empty() {
                    return resolve_url(href, base_url);
                }
            }
        }

        search_from = abs_start + tag_end + 1;
    }

    None
}

/// Quoted value of `attr_name` inside a single tag. The attribute name must
/// start a word, so `href` does not match `data-href`.
fn extract_attr_value<'a>(tag: &'a str, attr_name: &str) -> Option<&'a str> {
    let tag_lower = tag.to_ascii_lowercase();
    let attr_prefix = format!("{attr_name}=");

    let mut offset = 0;
    let attr_start = loop {
        let found = offset + tag_lower[offset..].find(&attr_prefix)?;
        let preceded_by_space = found > 0 && tag.as_bytes()[found - 1].is_ascii_whitespace();
        if preceded_by_space {
            break found;
        }
        offset = found + attr_prefix.len();
    };

    let rest = &tag[attr_start + attr_prefix.len()..];
    let quote = *rest.as_bytes().first()?;
    if quote != b'"' && quote != b'\'' {
        return None;
    }

    let inner = &rest[1..];
    let end = inner.find(quote as char)?;
    Some(&inner[..end])
}

fn resolve_url(href: &str, base_url: &str) -> Option<String> {
    // Protocol-relative hrefs inherit the page's scheme via join
    let base = Url::parse(base_url).ok()?;
    let resolved = base.join(href).ok()?;
    match resolved.scheme() {
        "http" | "https" => Some(resolved.into()),
        _ => None,
    }
}
