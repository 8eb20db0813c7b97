//! Foreground controller.
//!
//! The UI calls into [`Controller`] and listens for [`UiEvent`]s. It owns no
//! state of its own beyond the components it routes between.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::document::{AddFeedError, Document, FeedRef, SealedError, UpdateCounts};
use crate::feed::{self, RefreshOptions, RefreshResult};
use crate::progress::{CompletionEvent, ProgressTracker};
use crate::shutdown::{ShutdownCoordinator, ShutdownError};

/// Notifications for the UI layer.
#[derive(Debug, Clone)]
pub enum UiEvent {
    /// A feed was appended to the document
    FeedAdded(FeedRef),
    /// The current page load completed
    LoadFinished,
    /// A background refresh finished; counts are since the last summary
    UpdateSummary(UpdateCounts),
}

pub struct Controller {
    document: Document,
    progress: ProgressTracker,
    shutdown: ShutdownCoordinator,
    events: mpsc::Sender<UiEvent>,
}

impl Controller {
    pub fn new(
        document: Document,
        shutdown_timeout: Option<Duration>,
        events: mpsc::Sender<UiEvent>,
    ) -> Self {
        Self {
            shutdown: ShutdownCoordinator::new(document.clone(), shutdown_timeout),
            progress: ProgressTracker::new(),
            document,
            events,
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Read-only snapshot for display.
    pub fn feeds(&self) -> Arc<Vec<FeedRef>> {
        self.document.feeds()
    }

    /// Add the feed at `link`, parsed from the page content the UI already has.
    pub fn add_feed(&self, link: &str, seed: &[u8]) -> Result<FeedRef, AddFeedError> {
        let feed = self.document.add_feed(link, seed).inspect_err(|e| {
            tracing::info!(link = %link, error = %e, "Add feed rejected");
        })?;
        self.emit(UiEvent::FeedAdded(Arc::clone(&feed)));
        Ok(feed)
    }

    pub fn remove_feed(&self, id: u64) -> Result<Option<FeedRef>, SealedError> {
        self.document.remove_feed(id)
    }

    /// A new page load has started.
    pub fn on_load_started(&mut self) {
        self.progress.reset();
    }

    pub fn on_load_progress(&mut self, percent: i32) -> Option<CompletionEvent> {
        let done = self.progress.on_progress(percent);
        if done.is_some() {
            self.emit(UiEvent::LoadFinished);
        }
        done
    }

    pub fn on_load_finished(&mut self) -> Option<CompletionEvent> {
        let done = self.progress.on_load_finished();
        if done.is_some() {
            self.emit(UiEvent::LoadFinished);
        }
        done
    }

    /// Refresh every feed, then publish the accumulated update summary.
    pub async fn refresh_all(
        &self,
        client: &reqwest::Client,
        options: &RefreshOptions,
    ) -> Vec<RefreshResult> {
        let results = feed::refresh_all(&self.document, client, options, None).await;
        let counts = self.document.take_update_counts();
        tracing::info!(feeds = counts.feeds, items = counts.items, "{}", update_message(counts));
        self.emit(UiEvent::UpdateSummary(counts));
        results
    }

    /// Wait for background updates, then persist. Call on teardown.
    pub async fn request_shutdown(&self) -> Result<(), ShutdownError> {
        self.shutdown.request_shutdown().await
    }

    fn emit(&self, event: UiEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::warn!(error = %e, "UI event dropped");
        }
    }
}

/// Status-bar text for a refresh summary.
pub fn update_message(counts: UpdateCounts) -> String {
    format!(
        "{} feeds updated, {} items updated.",
        counts.feeds, counts.items
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<rss version="2.0"><channel><title>Controlled</title>
<item><guid>1</guid><title>One</title></item></channel></rss>"#;

    fn controller(name: &str) -> (Controller, mpsc::Receiver<UiEvent>) {
        let path = std::env::temp_dir().join(name).join("feeds.json");
        let (tx, rx) = mpsc::channel(16);
        (Controller::new(Document::new(path), None, tx), rx)
    }

    #[test]
    fn test_add_feed_emits_event() {
        let (controller, mut rx) = controller("pressy_controller_add");
        let feed = controller
            .add_feed("https://a.example/rss", RSS.as_bytes())
            .unwrap();

        match rx.try_recv().unwrap() {
            UiEvent::FeedAdded(added) => assert_eq!(added.id, feed.id),
            other => panic!("Expected FeedAdded, got {:?}", other),
        }
        assert_eq!(controller.feeds().len(), 1);
    }

    #[test]
    fn test_failed_add_emits_nothing() {
        let (controller, mut rx) = controller("pressy_controller_add_fail");
        assert!(controller.add_feed("", RSS.as_bytes()).is_err());
        assert!(controller
            .add_feed("https://a.example/rss", b"<not valid xml")
            .is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_progress_emits_single_load_finished() {
        let (mut controller, mut rx) = controller("pressy_controller_progress");
        controller.on_load_started();
        assert!(controller.on_load_progress(10).is_none());
        assert!(controller.on_load_progress(100).is_some());
        assert!(controller.on_load_finished().is_none());

        assert!(matches!(rx.try_recv(), Ok(UiEvent::LoadFinished)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_event_channel_does_not_fail_add() {
        let path = std::env::temp_dir().join("pressy_controller_full/feeds.json");
        let (tx, _rx) = mpsc::channel(1);
        let controller = Controller::new(Document::new(path), None, tx);

        controller
            .add_feed("https://a.example/rss", RSS.as_bytes())
            .unwrap();
        controller
            .add_feed("https://b.example/rss", RSS.as_bytes())
            .unwrap();
        assert_eq!(controller.feeds().len(), 2);
    }

    #[test]
    fn test_update_message() {
        assert_eq!(
            update_message(UpdateCounts { feeds: 2, items: 7 }),
            "2 feeds updated, 7 items updated."
        );
    }
}
