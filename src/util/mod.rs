//! Small helpers shared by the parsers, services and CLI.
//!
//! - **URL validation**: refuse subscription URIs that point at local or
//!   private hosts
//! - **Text cleanup**: entity decoding and control-character stripping for
//!   feed-supplied strings

mod text;
mod url_validator;

pub use text::{clean_text, decode_html, strip_control_chars};
pub use url_validator::{validate_feed_url, HostPolicy, UrlValidationError};
