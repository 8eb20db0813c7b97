use crate::document::{Document, FeedRef, SealedError};
use crate::feed::parser::parse_feed;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

const MAX_RETRIES: u32 = 3;
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur while refreshing a single feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Feed content could not be parsed as RSS, Atom or JSON Feed
    #[error("Parse error: {0}")]
    Parse(String),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Shutdown sealed the document before this refresh could start
    #[error(transparent)]
    Sealed(#[from] SealedError),
}

/// Knobs for background refresh.
#[derive(Debug, Clone)]
pub struct RefreshOptions {
    /// Maximum feeds fetched at once
    pub concurrency: usize,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// First backoff delay; doubles on each retry
    pub retry_base: Duration,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            request_timeout: Duration::from_secs(30),
            retry_base: Duration::from_secs(2),
        }
    }
}

/// Outcome of refreshing one feed.
#[derive(Debug)]
pub struct RefreshResult {
    pub feed_id: u64,
    /// Number of new or changed entries, or the error that occurred
    pub result: Result<usize, FetchError>,
}

/// Refreshes every feed in the current snapshot with bounded concurrency.
///
/// Each feed is refreshed under its own [`UpdateGuard`](crate::document::UpdateGuard),
/// so shutdown waits only for fetches that are actually in flight. Feeds
/// whose refresh starts after the document is sealed report
/// [`FetchError::Sealed`].
///
/// `progress_tx` receives `(completed, total)` after every feed. Results are
/// returned in completion order.
pub async fn refresh_all(
    document: &Document,
    client: &reqwest::Client,
    options: &RefreshOptions,
    progress_tx: Option<mpsc::Sender<(usize, usize)>>,
) -> Vec<RefreshResult> {
    let feeds = document.feeds();
    if feeds.is_empty() {
        return Vec::new();
    }

    let total = feeds.len();
    let completed = Arc::new(AtomicUsize::new(0));

    let results: Vec<RefreshResult> = stream::iter(feeds.iter().cloned())
        .map(|feed| {
            let progress_tx = progress_tx.clone();
            let completed = completed.clone();

            async move {
                let result = refresh_one(document, client, &feed, options).await;

                let done = completed.fetch_add(1, Ordering::Relaxed).saturating_add(1);
                if let Some(tx) = progress_tx {
                    if let Err(e) = tx.send((done, total)).await {
                        tracing::warn!(error = %e, done, total, "Progress channel send failed (receiver dropped)");
                    }
                }
                result
            }
        })
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;

    let failed = results.iter().filter(|r| r.result.is_err()).count();
    tracing::info!(total, failed, "Refresh finished");

    results
}

/// Refreshes a single feed: fetch its link, parse, and merge entries.
pub async fn refresh_one(
    document: &Document,
    client: &reqwest::Client,
    feed: &FeedRef,
    options: &RefreshOptions,
) -> RefreshResult {
    let result = match document.begin_update() {
        Ok(guard) => match fetch_bytes(client, &feed.link, options).await {
            Ok(bytes) => match parse_feed(&bytes) {
                Ok(parsed) => Ok(guard.apply(feed.id, parsed).unwrap_or_else(|| {
                    tracing::debug!(feed_id = feed.id, "Feed removed during refresh");
                    0
                })),
                Err(e) => Err(FetchError::Parse(e.to_string())),
            },
            Err(e) => Err(e),
        },
        Err(sealed) => Err(FetchError::from(sealed)),
    };

    if let Err(e) = &result {
        tracing::warn!(feed_id = feed.id, title = %feed.title, error = %e, "Feed refresh failed");
    }

    RefreshResult {
        feed_id: feed.id,
        result,
    }
}

async fn fetch_bytes(
    client: &reqwest::Client,
    link: &str,
    options: &RefreshOptions,
) -> Result<Vec<u8>, FetchError> {
    let mut retry_count = 0;

    loop {
        let response = tokio::time::timeout(options.request_timeout, client.get(link).send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::Network)?;

        let status = response.status();
        let retryable = status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error();

        if retryable {
            if retry_count >= MAX_RETRIES {
                return Err(if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    FetchError::RateLimited(MAX_RETRIES)
                } else {
                    FetchError::HttpStatus(status.as_u16())
                });
            }

            let delay = options.retry_base * 2u32.pow(retry_count);
            tracing::warn!(
                link = %link,
                status = %status,
                retry = retry_count,
                delay_ms = delay.as_millis() as u64,
                "Retrying feed fetch after delay"
            );
            tokio::time::sleep(delay).await;
            retry_count += 1;
            continue;
        }

        // 4xx errors fail immediately
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        match read_limited_bytes(response, MAX_FEED_SIZE).await {
            Ok(bytes) => return Ok(bytes),
            Err(FetchError::IncompleteResponse { expected, received }) => {
                if retry_count >= MAX_RETRIES {
                    return Err(FetchError::IncompleteResponse { expected, received });
                }

                let delay = options.retry_base * 2u32.pow(retry_count);
                tracing::debug!(
                    link = %link,
                    expected,
                    received,
                    attempt = retry_count + 1,
                    "Retrying incomplete download"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SEED_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Test</title>
    <item><guid>1</guid><title>Test</title></item>
</channel></rss>"#;

    const REFRESHED_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Test</title>
    <item><guid>1</guid><title>Test</title></item>
    <item><guid>2</guid><title>Newer</title></item>
</channel></rss>"#;

    fn fast_options() -> RefreshOptions {
        RefreshOptions {
            concurrency: 4,
            request_timeout: Duration::from_secs(5),
            retry_base: Duration::from_millis(5),
        }
    }

    fn setup_doc_with_feed(url: &str) -> (Document, FeedRef) {
        let doc = Document::new(std::env::temp_dir().join("pressy_fetcher_unused.json"));
        let feed = doc.add_feed(url, SEED_RSS.as_bytes()).unwrap();
        (doc, feed)
    }

    #[tokio::test]
    async fn test_refresh_appends_new_items() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(REFRESHED_RSS)
                    .insert_header("Content-Type", "application/xml"),
            )
            .mount(&mock_server)
            .await;

        let (doc, feed) = setup_doc_with_feed(&format!("{}/feed", mock_server.uri()));
        let client = reqwest::Client::new();

        let result = refresh_one(&doc, &client, &feed, &fast_options()).await;
        assert_eq!(result.result.unwrap(), 1);
        assert_eq!(doc.feed(feed.id).unwrap().items.len(), 2);
        assert!(!doc.is_updating());
    }

    #[tokio::test]
    async fn test_refresh_404_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let (doc, feed) = setup_doc_with_feed(&format!("{}/feed", mock_server.uri()));
        let client = reqwest::Client::new();

        let result = refresh_one(&doc, &client, &feed, &fast_options()).await;
        match result.result.unwrap_err() {
            FetchError::HttpStatus(404) => {}
            e => panic!("Expected HttpStatus(404), got {:?}", e),
        }
        assert!(!doc.is_updating());
    }

    #[tokio::test]
    async fn test_refresh_500_error_retries_then_fails() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(4) // Initial request + 3 retries
            .mount(&mock_server)
            .await;

        let (doc, feed) = setup_doc_with_feed(&format!("{}/feed", mock_server.uri()));
        let client = reqwest::Client::new();

        let result = refresh_one(&doc, &client, &feed, &fast_options()).await;
        match result.result.unwrap_err() {
            FetchError::HttpStatus(500) => {}
            e => panic!("Expected HttpStatus(500), got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_refresh_503_retry_then_success() {
        use wiremock::matchers::any;

        let mock_server = MockServer::start().await;

        Mock::given(any())
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;

        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string(REFRESHED_RSS))
            .mount(&mock_server)
            .await;

        let (doc, feed) = setup_doc_with_feed(&format!("{}/feed", mock_server.uri()));
        let client = reqwest::Client::new();

        let result = refresh_one(&doc, &client, &feed, &fast_options()).await;
        assert_eq!(result.result.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_feed_parse_error_leaves_feed_intact() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<not valid xml"))
            .mount(&mock_server)
            .await;

        let (doc, feed) = setup_doc_with_feed(&format!("{}/feed", mock_server.uri()));
        let client = reqwest::Client::new();

        let result = refresh_one(&doc, &client, &feed, &fast_options()).await;
        assert!(matches!(result.result, Err(FetchError::Parse(_))));
        assert_eq!(doc.feed(feed.id).unwrap(), feed);
    }

    #[tokio::test]
    async fn test_sealed_document_skips_fetch() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(REFRESHED_RSS))
            .expect(0)
            .mount(&mock_server)
            .await;

        let (doc, feed) = setup_doc_with_feed(&format!("{}/feed", mock_server.uri()));
        doc.seal();
        let client = reqwest::Client::new();

        let result = refresh_one(&doc, &client, &feed, &fast_options()).await;
        assert!(matches!(result.result, Err(FetchError::Sealed(_))));
    }

    #[tokio::test]
    async fn test_refresh_all_reports_progress_and_counts() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string(REFRESHED_RSS))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&mock_server)
            .await;

        let doc = Document::new(std::env::temp_dir().join("pressy_fetcher_unused.json"));
        doc.add_feed(&format!("{}/ok", mock_server.uri()), SEED_RSS.as_bytes())
            .unwrap();
        doc.add_feed(&format!("{}/gone", mock_server.uri()), SEED_RSS.as_bytes())
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let client = reqwest::Client::new();
        let results = refresh_all(&doc, &client, &fast_options(), Some(tx)).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().filter(|r| r.result.is_ok()).count(), 1);

        let mut last = (0, 0);
        while let Ok(p) = rx.try_recv() {
            last = p;
        }
        assert_eq!(last, (2, 2));

        let counts = doc.take_update_counts();
        assert_eq!(counts.feeds, 1);
        assert_eq!(counts.items, 1);
    }
}
