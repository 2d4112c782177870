//! Everything between a feed URI and a [`NormalizedFeed`](crate::storage::NormalizedFeed).
//!
//! - [`fetcher`] - bounded, cancelable HTTP GET with retry/backoff
//! - [`detect`] - syntactic format detection (XML vs JSON)
//! - [`parser`] / [`json`] - RSS/Atom via `feed-rs`, JSON Feed via `serde`
//! - [`icon`] - image lookup with a fallback chain
//! - [`opml`] - OPML outline tree codec

pub mod detect;
pub mod fetcher;
pub mod icon;
pub mod json;
pub mod opml;
pub mod parser;

pub use detect::detect_format;
pub use fetcher::{FetchError, FetchSettings, Fetcher};
pub use icon::{is_valid_image, placeholder_icon, IconResolver};
pub use json::parse_json_feed;
pub use opml::{
    parse_opml, read_opml_file, write_opml_file, OpmlDocument, OpmlError, Outline,
};
pub use parser::{parse_rss_like, ParseError};
