use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;

use super::persist;
use super::types::{
    Activity, AddFeedError, Feed, FeedRef, Item, PersistError, SealedError, UpdateCounts,
};
use crate::feed::{parse_feed, ParsedFeed};

// ============================================================================
// Document
// ============================================================================

/// The shared feed collection.
///
/// Cloning yields another handle to the same document. Readers get an
/// immutable snapshot from [`Document::feeds`]; every mutation builds a new
/// vector under the writer lock and swaps it in, so a snapshot is never
/// observed half-written.
#[derive(Clone)]
pub struct Document {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    feeds: RwLock<Arc<Vec<FeedRef>>>,
    next_id: AtomicU64,
    activity: watch::Sender<Activity>,
    counts: Mutex<UpdateCounts>,
    /// Serializes concurrent saves so temp files never interleave
    save_lock: Mutex<()>,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("path", &self.inner.path)
            .field("feeds", &self.feeds().len())
            .field("activity", &self.activity())
            .finish()
    }
}

impl Document {
    /// Create an empty document that will persist to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_feeds(path.into(), Vec::new())
    }

    /// Load the document persisted at `path`.
    ///
    /// A missing file yields an empty document. New feed ids continue after
    /// the highest id found in the file.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let path = path.into();
        let feeds = match persist::read(&path)? {
            Some(feeds) => {
                tracing::info!(path = %path.display(), feeds = feeds.len(), "Loaded feeds");
                feeds
            }
            None => {
                tracing::debug!(path = %path.display(), "No feeds file found, starting empty");
                Vec::new()
            }
        };
        Ok(Self::with_feeds(path, feeds))
    }

    fn with_feeds(path: PathBuf, feeds: Vec<Feed>) -> Self {
        // persist::read rejects u64::MAX, so this only saturates on misuse
        let next_id = feeds
            .iter()
            .map(|f| f.id)
            .max()
            .map_or(1, |max| max.checked_add(1).unwrap_or(u64::MAX));
        let feeds: Vec<FeedRef> = feeds.into_iter().map(Arc::new).collect();
        let (activity, _) = watch::channel(Activity::default());

        Self {
            inner: Arc::new(Inner {
                path,
                feeds: RwLock::new(Arc::new(feeds)),
                next_id: AtomicU64::new(next_id),
                activity,
                counts: Mutex::new(UpdateCounts::default()),
                save_lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Current snapshot of all feeds in display order.
    pub fn feeds(&self) -> Arc<Vec<FeedRef>> {
        let guard = self
            .inner
            .feeds
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub fn feed(&self, id: u64) -> Option<FeedRef> {
        self.feeds().iter().find(|f| f.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.feeds().len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds().is_empty()
    }

    pub fn activity(&self) -> Activity {
        *self.inner.activity.borrow()
    }

    /// True while any [`UpdateGuard`] is alive.
    pub fn is_updating(&self) -> bool {
        self.activity().is_updating()
    }

    pub fn is_sealed(&self) -> bool {
        self.activity().sealed
    }

    /// Subscribe to in-flight count and seal changes.
    pub fn watch_activity(&self) -> watch::Receiver<Activity> {
        self.inner.activity.subscribe()
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Parse `seed` as a feed published at `link` and append it.
    ///
    /// The link is validated before any parsing. Parsing happens outside the
    /// writer lock; the append itself is a single snapshot swap.
    pub fn add_feed(&self, link: &str, seed: &[u8]) -> Result<FeedRef, AddFeedError> {
        let link = link.trim();
        if link.is_empty() {
            return Err(AddFeedError::EmptyLink);
        }

        let ParsedFeed { title, items } = parse_feed(seed)?;
        let title = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| link.to_string());

        let feed = self.write_feeds(|feeds| {
            let feed = Arc::new(Feed {
                id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
                link: link.to_string(),
                title,
                items,
            });
            feeds.push(Arc::clone(&feed));
            feed
        })?;

        tracing::info!(
            feed_id = feed.id,
            link = %feed.link,
            items = feed.items.len(),
            "Feed added"
        );
        Ok(feed)
    }

    /// Remove a feed by id. Returns the removed feed, or `None` if absent.
    pub fn remove_feed(&self, id: u64) -> Result<Option<FeedRef>, SealedError> {
        let removed = self.write_feeds(|feeds| {
            let pos = feeds.iter().position(|f| f.id == id)?;
            Some(feeds.remove(pos))
        })?;

        if let Some(feed) = &removed {
            tracing::info!(feed_id = id, title = %feed.title, "Feed removed");
        }
        Ok(removed)
    }

    /// Start a background update. The document counts as updating until the
    /// returned guard is dropped. Guards nest: each one is counted.
    pub fn begin_update(&self) -> Result<UpdateGuard, SealedError> {
        let accepted = self.inner.activity.send_if_modified(|a| {
            if a.sealed {
                false
            } else {
                a.in_flight += 1;
                true
            }
        });

        if !accepted {
            return Err(SealedError);
        }

        tracing::debug!(in_flight = self.activity().in_flight, "Update started");
        Ok(UpdateGuard {
            document: self.clone(),
        })
    }

    /// Consume the refresh counters accumulated since the last call.
    pub fn take_update_counts(&self) -> UpdateCounts {
        let mut counts = self
            .inner
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *counts)
    }

    /// Refuse further updates and new feeds. Returns false if already sealed.
    pub(crate) fn seal(&self) -> bool {
        self.inner.activity.send_if_modified(|a| {
            if a.sealed {
                false
            } else {
                a.sealed = true;
                true
            }
        })
    }

    /// Run `f` on a private copy of the feed list and publish the result.
    ///
    /// The seal check happens under the writer lock, so a mutation that
    /// passes it finishes before any later snapshot is taken for saving.
    fn write_feeds<T>(&self, f: impl FnOnce(&mut Vec<FeedRef>) -> T) -> Result<T, SealedError> {
        let mut guard = self
            .inner
            .feeds
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if self.is_sealed() {
            return Err(SealedError);
        }

        let mut next = Vec::clone(&guard);
        let out = f(&mut next);
        *guard = Arc::new(next);
        Ok(out)
    }

    /// Like `write_feeds` but allowed after sealing. Only reachable through a
    /// live [`UpdateGuard`], which shutdown waits for.
    fn write_feeds_unsealed<T>(&self, f: impl FnOnce(&mut Vec<FeedRef>) -> T) -> T {
        let mut guard = self
            .inner
            .feeds
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::clone(&guard);
        let out = f(&mut next);
        *guard = Arc::new(next);
        out
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Write the current snapshot to the document's path.
    ///
    /// Callers must ensure no update is in flight; the shutdown coordinator
    /// does this. The write is atomic: on error the previous file is intact.
    pub fn save(&self) -> Result<(), PersistError> {
        let _serial = self
            .inner
            .save_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let activity = self.activity();
        if activity.is_updating() {
            tracing::warn!(
                in_flight = activity.in_flight,
                "Saving while updates are in flight"
            );
        }

        let snapshot = self.feeds();
        let bytes = persist::encode(&snapshot)?;
        persist::write_atomic(&self.inner.path, &bytes)?;

        tracing::info!(
            path = %self.inner.path.display(),
            feeds = snapshot.len(),
            bytes = bytes.len(),
            "Feeds saved"
        );
        Ok(())
    }
}

// ============================================================================
// UpdateGuard
// ============================================================================

/// Marks a background update as in flight.
///
/// Holding a guard is the only way to apply refreshed items. Dropping it
/// decrements the in-flight count and wakes shutdown when it reaches zero.
#[must_use = "the update ends as soon as the guard is dropped"]
pub struct UpdateGuard {
    document: Document,
}

impl UpdateGuard {
    /// Merge refreshed entries into feed `feed_id`.
    ///
    /// Entries are matched by guid: changed ones are replaced in place, new
    /// ones are appended in feed order. Returns the number of new or changed
    /// entries, or `None` if the feed no longer exists.
    pub fn apply(&self, feed_id: u64, refreshed: ParsedFeed) -> Option<usize> {
        let changed = self.document.write_feeds_unsealed(|feeds| {
            let pos = feeds.iter().position(|f| f.id == feed_id)?;
            let current = &feeds[pos];

            let (items, changed) = merge_items(&current.items, refreshed.items);
            let title = refreshed
                .title
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| current.title.clone());

            if changed > 0 || title != current.title {
                feeds[pos] = Arc::new(Feed {
                    id: current.id,
                    link: current.link.clone(),
                    title,
                    items,
                });
            }
            Some(changed)
        })?;

        if changed > 0 {
            let mut counts = self
                .document
                .inner
                .counts
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            counts.feeds += 1;
            counts.items += changed;
        }

        tracing::debug!(feed_id, changed, "Refresh applied");
        Some(changed)
    }

    pub fn document(&self) -> &Document {
        &self.document
    }
}

impl Drop for UpdateGuard {
    fn drop(&mut self) {
        self.document.inner.activity.send_modify(|a| {
            a.in_flight = a.in_flight.saturating_sub(1);
        });
        let in_flight = self.document.activity().in_flight;
        if in_flight == 0 {
            tracing::debug!("All updates finished");
        } else {
            tracing::debug!(in_flight, "Update finished");
        }
    }
}

fn merge_items(existing: &[Item], refreshed: Vec<Item>) -> (Vec<Item>, usize) {
    let mut items = existing.to_vec();
    let mut changed = 0;

    for item in refreshed {
        match items.iter_mut().find(|i| i.guid == item.guid) {
            Some(slot) if *slot == item => {}
            Some(slot) => {
                *slot = item;
                changed += 1;
            }
            None => {
                items.push(item);
                changed += 1;
            }
        }
    }

    (items, changed)
}
