//! Incremental fetcher — watermark-based history sync over a `MailSource`.
//!
//! The cursor only moves forward through `commit`, which the watch loop
//! calls after the fetched messages are safely in the queue. A failed fetch
//! leaves the cursor where it was, so the same marker is retried next tick.
//! With no marker yet, a fetch establishes a baseline and returns nothing
//! (no historical backfill).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::FetchError;
use crate::pipeline::types::PendingMessage;

/// One page of mailbox history.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    /// New messages, oldest first.
    pub messages: Vec<PendingMessage>,
    /// Marker covering this page. `None` means nothing new; keep the current marker.
    pub next_marker: Option<String>,
}

/// Upstream mailbox with an incremental history API.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Provider name for logs (e.g. "gmail").
    fn name(&self) -> &str;

    /// Current head marker, used as a fresh baseline.
    async fn baseline(&self) -> Result<String, FetchError>;

    /// Messages added after `marker`.
    async fn history_since(&self, marker: &str) -> Result<HistoryPage, FetchError>;
}

/// Sync watermark.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryCursor {
    last_sync_marker: Option<String>,
}

impl HistoryCursor {
    pub fn new(marker: Option<String>) -> Self {
        Self {
            last_sync_marker: marker,
        }
    }

    pub fn marker(&self) -> Option<&str> {
        self.last_sync_marker.as_deref()
    }

    fn reset(&mut self) {
        self.last_sync_marker = None;
    }
}

/// Result of a fetch, to be committed once its messages are enqueued.
#[derive(Debug, Clone)]
pub struct FetchBatch {
    pub messages: Vec<PendingMessage>,
    /// Marker the fetch started from (`None` on cold start).
    pub from_marker: Option<String>,
    /// Marker to store once the batch is enqueued.
    pub next_marker: String,
}

impl FetchBatch {
    /// True when this fetch only established a baseline.
    pub fn is_baseline(&self) -> bool {
        self.from_marker.is_none()
    }
}

/// Pulls only what arrived since the stored marker.
pub struct IncrementalFetcher {
    source: Arc<dyn MailSource>,
    cursor: Mutex<HistoryCursor>,
}

impl IncrementalFetcher {
    pub fn new(source: Arc<dyn MailSource>) -> Self {
        Self::with_cursor(source, HistoryCursor::default())
    }

    pub fn with_cursor(source: Arc<dyn MailSource>, cursor: HistoryCursor) -> Self {
        Self {
            source,
            cursor: Mutex::new(cursor),
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// The stored marker.
    pub async fn marker(&self) -> Option<String> {
        self.cursor.lock().await.marker().map(str::to_owned)
    }

    /// Fetch from the stored marker.
    pub async fn fetch(&self) -> Result<FetchBatch, FetchError> {
        let marker = self.marker().await;
        self.fetch_since(marker.as_deref()).await
    }

    /// Fetch messages newer than `marker`, or establish a baseline when absent.
    pub async fn fetch_since(&self, marker: Option<&str>) -> Result<FetchBatch, FetchError> {
        let Some(marker) = marker else {
            let baseline = self.source.baseline().await?;
            info!(
                source = self.source.name(),
                marker = %baseline,
                "Established history baseline (no backfill)"
            );
            return Ok(FetchBatch {
                messages: Vec::new(),
                from_marker: None,
                next_marker: baseline,
            });
        };

        let page = self.source.history_since(marker).await?;
        debug!(
            source = self.source.name(),
            from = marker,
            count = page.messages.len(),
            "Fetched history"
        );

        Ok(FetchBatch {
            messages: page.messages,
            from_marker: Some(marker.to_string()),
            next_marker: page.next_marker.unwrap_or_else(|| marker.to_string()),
        })
    }

    /// Advance the cursor to the batch's marker.
    ///
    /// Ignored (returns false) when the cursor moved since the batch was
    /// fetched, so a stale batch can never rewind it.
    pub async fn commit(&self, batch: &FetchBatch) -> bool {
        let mut cursor = self.cursor.lock().await;
        if cursor.last_sync_marker != batch.from_marker {
            debug!(
                current = ?cursor.last_sync_marker,
                batch_from = ?batch.from_marker,
                "Skipping stale cursor commit"
            );
            return false;
        }
        cursor.last_sync_marker = Some(batch.next_marker.clone());
        true
    }

    /// Forget the marker; the next fetch re-baselines.
    pub async fn reset(&self) {
        self.cursor.lock().await.reset();
        info!(source = self.source.name(), "History cursor reset");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use super::*;

    /// Scripted mail source: `baseline` returns a fixed marker, each
    /// `history_since` pops the next scripted response.
    pub(crate) struct ScriptedSource {
        pub baseline: String,
        pub pages: StdMutex<VecDeque<Result<HistoryPage, FetchError>>>,
        pub seen_markers: StdMutex<Vec<String>>,
    }

    impl ScriptedSource {
        pub(crate) fn new(baseline: &str) -> Self {
            Self {
                baseline: baseline.into(),
                pages: StdMutex::new(VecDeque::new()),
                seen_markers: StdMutex::new(Vec::new()),
            }
        }

        pub(crate) fn push_page(&self, messages: Vec<PendingMessage>, next: Option<&str>) {
            self.pages.lock().unwrap().push_back(Ok(HistoryPage {
                messages,
                next_marker: next.map(String::from),
            }));
        }

        pub(crate) fn push_error(&self, err: FetchError) {
            self.pages.lock().unwrap().push_back(Err(err));
        }
    }

    #[async_trait]
    impl MailSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn baseline(&self) -> Result<String, FetchError> {
            Ok(self.baseline.clone())
        }

        async fn history_since(&self, marker: &str) -> Result<HistoryPage, FetchError> {
            self.seen_markers.lock().unwrap().push(marker.to_string());
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(HistoryPage::default()))
        }
    }

    pub(crate) fn upstream_error() -> FetchError {
        FetchError::RequestFailed {
            provider: "scripted".into(),
            reason: "connection reset".into(),
        }
    }

    fn msg(id: &str) -> PendingMessage {
        PendingMessage::new(format!("Subject {id}"), "a@example.com", "body", id)
    }

    #[tokio::test]
    async fn cold_start_establishes_baseline_without_backfill() {
        let source = Arc::new(ScriptedSource::new("100"));
        source.push_page(vec![msg("old")], Some("101"));
        let fetcher = IncrementalFetcher::new(source.clone());

        let batch = fetcher.fetch().await.unwrap();
        assert!(batch.is_baseline());
        assert!(batch.messages.is_empty());
        assert_eq!(batch.next_marker, "100");
        assert!(source.seen_markers.lock().unwrap().is_empty());

        assert!(fetcher.commit(&batch).await);
        assert_eq!(fetcher.marker().await.as_deref(), Some("100"));
    }

    #[tokio::test]
    async fn fetch_returns_new_messages_and_next_marker() {
        let source = Arc::new(ScriptedSource::new("100"));
        source.push_page(vec![msg("a"), msg("b")], Some("105"));
        let fetcher =
            IncrementalFetcher::with_cursor(source.clone(), HistoryCursor::new(Some("100".into())));

        let batch = fetcher.fetch().await.unwrap();
        let ids: Vec<_> = batch.messages.iter().map(|m| m.external_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(batch.next_marker, "105");

        // Not advanced until committed.
        assert_eq!(fetcher.marker().await.as_deref(), Some("100"));
        fetcher.commit(&batch).await;
        assert_eq!(fetcher.marker().await.as_deref(), Some("105"));
    }

    #[tokio::test]
    async fn failure_does_not_advance_marker() {
        let source = Arc::new(ScriptedSource::new("100"));
        source.push_error(upstream_error());
        source.push_page(vec![msg("a")], Some("101"));
        let fetcher =
            IncrementalFetcher::with_cursor(source.clone(), HistoryCursor::new(Some("100".into())));

        assert!(fetcher.fetch().await.is_err());
        assert_eq!(fetcher.marker().await.as_deref(), Some("100"));

        let batch = fetcher.fetch().await.unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(
            *source.seen_markers.lock().unwrap(),
            vec!["100".to_string(), "100".to_string()]
        );
    }

    #[tokio::test]
    async fn empty_page_keeps_marker() {
        let source = Arc::new(ScriptedSource::new("100"));
        source.push_page(vec![], None);
        let fetcher =
            IncrementalFetcher::with_cursor(source, HistoryCursor::new(Some("100".into())));

        let batch = fetcher.fetch().await.unwrap();
        assert_eq!(batch.next_marker, "100");
    }

    #[tokio::test]
    async fn stale_commit_is_ignored() {
        let source = Arc::new(ScriptedSource::new("100"));
        source.push_page(vec![msg("a")], Some("101"));
        source.push_page(vec![msg("b")], Some("102"));
        let fetcher =
            IncrementalFetcher::with_cursor(source, HistoryCursor::new(Some("100".into())));

        let first = fetcher.fetch().await.unwrap();
        let second = fetcher.fetch().await.unwrap();
        assert!(fetcher.commit(&second).await);
        assert!(!fetcher.commit(&first).await);
        assert_eq!(fetcher.marker().await.as_deref(), Some("102"));
    }

    #[tokio::test]
    async fn reset_forces_rebaseline() {
        let source = Arc::new(ScriptedSource::new("500"));
        let fetcher =
            IncrementalFetcher::with_cursor(source, HistoryCursor::new(Some("100".into())));
        fetcher.reset().await;
        assert!(fetcher.marker().await.is_none());
        let batch = fetcher.fetch().await.unwrap();
        assert!(batch.is_baseline());
        assert_eq!(batch.next_marker, "500");
    }
}
