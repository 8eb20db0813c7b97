use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::feed::ParseError;

// ============================================================================
// Error Types
// ============================================================================

/// Returned when a mutation is attempted after shutdown has sealed the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Document is shutting down; no further changes are accepted")]
pub struct SealedError;

/// Errors from [`Document::add_feed`](super::Document::add_feed).
///
/// None of these leave a trace in the document: validation happens before
/// parsing, and parsing happens before the append.
#[derive(Debug, Error)]
pub enum AddFeedError {
    /// The link was empty or whitespace only
    #[error("Please provide a feed link")]
    EmptyLink,

    /// Seed content did not contain a recognizable RSS, Atom or JSON feed
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Shutdown is in progress
    #[error(transparent)]
    Sealed(#[from] SealedError),
}

/// Errors reading or writing the persisted feeds file.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Feeds file I/O failed for '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode feeds: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Feeds file '{}' is corrupt: {source}", path.display())]
    Deserialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unsupported feeds file version {0}")]
    UnsupportedVersion(u32),

    #[error("Feeds file '{}' lists feed id {id} more than once", path.display())]
    DuplicateId { path: PathBuf, id: u64 },

    #[error("Feeds file '{}' uses the highest possible feed id; no new ids can be assigned", path.display())]
    IdsExhausted { path: PathBuf },
}

impl PersistError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PersistError::Io {
            path: path.into(),
            source,
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// One subscribed source and its entries.
///
/// Feeds are immutable once published in a document snapshot. A refresh
/// builds a replacement value and swaps it in under the writer lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feed {
    pub id: u64,
    pub link: String,
    pub title: String,
    pub items: Vec<Item>,
}

/// Shared handle to a published feed. Cloning is a refcount bump.
pub type FeedRef = Arc<Feed>;

/// A single entry within a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub guid: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Refresh counters accumulated since the last time the UI consumed them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateCounts {
    pub feeds: usize,
    pub items: usize,
}

impl UpdateCounts {
    pub fn is_empty(&self) -> bool {
        self.feeds == 0 && self.items == 0
    }
}

/// In-flight bookkeeping published over the document's watch channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Activity {
    /// Number of live [`UpdateGuard`](super::UpdateGuard)s
    pub in_flight: usize,
    /// Set once shutdown begins; no new updates or feeds after this
    pub sealed: bool,
}

impl Activity {
    pub fn is_updating(&self) -> bool {
        self.in_flight > 0
    }
}
