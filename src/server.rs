//! Background serving worker.
//!
//! The worker is a detached tokio task bound to the [`Document`]. External
//! surfaces talk to it through a [`ServingHandle`]; every request is answered
//! from a fresh snapshot, so the worker never holds a lock across an await
//! and can be abandoned at process exit mid-request without leaving anything
//! torn.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::document::{Document, FeedRef, Item};

#[derive(Debug, Error)]
pub enum ServeError {
    /// The worker task is gone (runtime shut down)
    #[error("Serving worker is not running")]
    WorkerGone,
}

/// Lightweight listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSummary {
    pub id: u64,
    pub link: String,
    pub title: String,
    pub item_count: usize,
}

impl From<&FeedRef> for FeedSummary {
    fn from(feed: &FeedRef) -> Self {
        Self {
            id: feed.id,
            link: feed.link.clone(),
            title: feed.title.clone(),
            item_count: feed.items.len(),
        }
    }
}

enum Request {
    ListFeeds {
        respond: oneshot::Sender<Vec<FeedSummary>>,
    },
    Feed {
        id: u64,
        respond: oneshot::Sender<Option<FeedRef>>,
    },
    Items {
        feed_id: u64,
        respond: oneshot::Sender<Option<Vec<Item>>>,
    },
    Snapshot {
        respond: oneshot::Sender<Arc<Vec<FeedRef>>>,
    },
}

/// Client side of the serving worker. Cheap to clone.
#[derive(Clone)]
pub struct ServingHandle {
    tx: mpsc::Sender<Request>,
}

/// Spawn the serving worker bound to `document`.
///
/// The task's `JoinHandle` is dropped: the worker is never joined and lives
/// until every `ServingHandle` is dropped or the runtime shuts down. Must be
/// called from within a tokio runtime.
pub fn start(document: Document, queue_depth: usize) -> ServingHandle {
    let (tx, rx) = mpsc::channel(queue_depth.max(1));
    tokio::spawn(serve(document, rx));
    tracing::info!(queue_depth, "Serving worker started");
    ServingHandle { tx }
}

async fn serve(document: Document, mut rx: mpsc::Receiver<Request>) {
    let mut served: u64 = 0;

    while let Some(request) = rx.recv().await {
        served += 1;
        // Receivers may have given up waiting; that is not the worker's problem
        match request {
            Request::ListFeeds { respond } => {
                let feeds = document.feeds();
                let _ = respond.send(feeds.iter().map(FeedSummary::from).collect());
            }
            Request::Feed { id, respond } => {
                let _ = respond.send(document.feed(id));
            }
            Request::Items { feed_id, respond } => {
                let _ = respond.send(document.feed(feed_id).map(|f| f.items.clone()));
            }
            Request::Snapshot { respond } => {
                let _ = respond.send(document.feeds());
            }
        }
    }

    tracing::debug!(served, "Serving worker exiting: all handles dropped");
}

impl ServingHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, ServeError> {
        let (respond, response) = oneshot::channel();
        self.tx
            .send(make(respond))
            .await
            .map_err(|_| ServeError::WorkerGone)?;
        response.await.map_err(|_| ServeError::WorkerGone)
    }

    pub async fn list_feeds(&self) -> Result<Vec<FeedSummary>, ServeError> {
        self.call(|respond| Request::ListFeeds { respond }).await
    }

    pub async fn feed(&self, id: u64) -> Result<Option<FeedRef>, ServeError> {
        self.call(|respond| Request::Feed { id, respond }).await
    }

    pub async fn items(&self, feed_id: u64) -> Result<Option<Vec<Item>>, ServeError> {
        self.call(|respond| Request::Items { feed_id, respond })
            .await
    }

    pub async fn snapshot(&self) -> Result<Arc<Vec<FeedRef>>, ServeError> {
        self.call(|respond| Request::Snapshot { respond }).await
    }
}
