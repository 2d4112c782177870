//! Feed synchronization and reconciliation for RSS, Atom and JSON Feed.
//!
//! The pieces, leaves first:
//!
//! - [`feed`] - fetching, format detection, parsing, icon lookup, OPML codec
//! - [`storage`] - SQLite store (`sqlx`)
//! - [`service`] - the sync engine plus folder and OPML services
//! - [`events`] - store-change notifications
//! - [`errors`] - service errors and the injected error channel
//! - [`config`] - TOML configuration

pub mod config;
pub mod errors;
pub mod events;
pub mod feed;
pub mod service;
pub mod storage;
pub mod util;
