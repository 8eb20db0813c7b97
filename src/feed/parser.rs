use std::collections::HashSet;

use feed_rs::model::{Entry, Link};
use feed_rs::parser;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::document::Item;

const UNTITLED: &str = "Untitled";

/// Seed content did not yield a recognizable feed.
#[derive(Debug, Error)]
#[error("Can't parse this feed: {0}")]
pub struct ParseError(String);

/// Feed-level data extracted from RSS, Atom or JSON Feed content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFeed {
    /// Trimmed channel title; `None` when absent or blank
    pub title: Option<String>,
    /// Entries in document order, at most one per guid
    pub items: Vec<Item>,
}

/// Parse feed content into document items.
///
/// Items are merged by guid on refresh, so a guid repeated within one
/// document keeps only its first entry.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError("content is empty".to_string()));
    }

    let feed = parser::parse(bytes).map_err(|e| ParseError(e.to_string()))?;

    let mut seen = HashSet::new();
    let mut items = Vec::with_capacity(feed.entries.len());
    for entry in feed.entries {
        let item = entry_to_item(entry);
        if seen.insert(item.guid.clone()) {
            items.push(item);
        } else {
            tracing::debug!(guid = %item.guid, "Skipping repeated entry");
        }
    }

    Ok(ParsedFeed {
        title: feed.title.and_then(|t| non_blank(t.content)),
        items,
    })
}

fn entry_to_item(entry: Entry) -> Item {
    let url = entry_link(&entry.links).map(|l| l.href.clone());
    let published = entry
        .published
        .or(entry.updated)
        .map(|dt| dt.timestamp());
    let title = entry
        .title
        .and_then(|t| non_blank(t.content))
        .unwrap_or_else(|| UNTITLED.to_string());
    let summary = entry
        .summary
        .and_then(|s| non_blank(s.content))
        .or_else(|| entry.content.and_then(|c| c.body).and_then(non_blank));

    let guid = item_guid(&entry.id, url.as_deref(), &title, published);

    Item {
        guid,
        title,
        url,
        published,
        summary,
    }
}

/// The entry's page: an `alternate` (or unlabelled) link, else the first.
fn entry_link(links: &[Link]) -> Option<&Link> {
    links
        .iter()
        .find(|l| l.rel.as_deref().map_or(true, |rel| rel == "alternate"))
        .or_else(|| links.first())
}

fn non_blank(text: String) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == text.len() {
        Some(text)
    } else {
        Some(trimmed.to_string())
    }
}

/// The entry's own id when it has one, else a SHA-256 of its identifying
/// fields so the same entry maps to the same guid across refreshes.
fn item_guid(id: &str, url: Option<&str>, title: &str, published: Option<i64>) -> String {
    let id = id.trim();
    if !id.is_empty() {
        return id.to_string();
    }

    let mut hasher = Sha256::new();
    hasher.update(url.unwrap_or_default().as_bytes());
    hasher.update(b"|");
    hasher.update(title.as_bytes());
    hasher.update(b"|");
    if let Some(ts) = published {
        hasher.update(ts.to_string().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
