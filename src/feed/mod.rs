//! Feed content handling.
//!
//! - [`parser`] turns RSS, Atom or JSON Feed bytes into entries using `feed-rs`
//! - [`fetcher`] refreshes subscribed feeds over HTTP and merges the results
//!   into the [`Document`](crate::document::Document) under an update guard

mod fetcher;
mod parser;

pub use fetcher::{refresh_all, refresh_one, FetchError, RefreshOptions, RefreshResult};
pub use parser::{parse_feed, ParseError, ParsedFeed};
