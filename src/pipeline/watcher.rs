//! Watch loop — periodic mailbox poll feeding the batch queue.
//!
//! Each tick: fetch since the stored marker, enqueue what came back, commit
//! the marker, trigger a drain. The tick never waits on the drain itself.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::channels::credentials::CredentialsProvider;
use crate::error::{ConfigError, FetchError};
use crate::pipeline::fetcher::IncrementalFetcher;
use crate::pipeline::queue::BatchQueue;

struct Running {
    handle: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

pub struct WatchLoop {
    fetcher: Arc<IncrementalFetcher>,
    queue: Arc<BatchQueue>,
    credentials: Arc<dyn CredentialsProvider>,
    poll_interval: Duration,
    running: StdMutex<Option<Running>>,
    missing_credentials_logged: AtomicBool,
}

impl WatchLoop {
    pub fn new(
        fetcher: Arc<IncrementalFetcher>,
        queue: Arc<BatchQueue>,
        credentials: Arc<dyn CredentialsProvider>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            fetcher,
            queue,
            credentials,
            poll_interval,
            running: StdMutex::new(None),
            missing_credentials_logged: AtomicBool::new(false),
        })
    }

    /// Start polling. Returns `Ok(false)` if already running.
    pub fn start(self: &Arc<Self>) -> Result<bool, ConfigError> {
        if self.credentials.refresh_token().is_none() {
            let err = ConfigError::MissingCredentials(
                "GOOGLE_REFRESH_TOKEN is not set; mailbox watch disabled".into(),
            );
            if !self.missing_credentials_logged.swap(true, Ordering::Relaxed) {
                error!("{err}");
            }
            return Err(err);
        }

        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(r) = running.as_ref() {
            if !r.handle.is_finished() {
                debug!("Watch loop already running");
                return Ok(false);
            }
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let this = Arc::clone(self);

        let handle = tokio::spawn(async move {
            info!(
                source = this.fetcher.source_name(),
                interval_secs = this.poll_interval.as_secs(),
                "Watch loop started"
            );

            let mut tick = tokio::time::interval(this.poll_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tick.tick().await;

                if flag.load(Ordering::Relaxed) {
                    info!("Watch loop shutting down");
                    return;
                }

                if let Err(e) = this.poll_once().await {
                    warn!(error = %e, "Mailbox poll failed; will retry next tick");
                }
            }
        });

        *running = Some(Running { handle, shutdown });
        Ok(true)
    }

    /// Stop polling. In-flight drains keep going.
    pub fn stop(&self) {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(r) = running.take() {
            r.shutdown.store(true, Ordering::Relaxed);
            r.handle.abort();
            info!("Watch loop stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// One poll cycle. Returns how many messages were enqueued.
    pub async fn poll_once(&self) -> Result<usize, FetchError> {
        let mut batch = match self.fetcher.fetch().await {
            Ok(batch) => batch,
            Err(e @ FetchError::MarkerExpired { .. }) => {
                warn!(error = %e, "History marker expired; re-baselining");
                self.fetcher.reset().await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let messages = std::mem::take(&mut batch.messages);
        let count = messages.len();
        if count > 0 {
            info!(count, "New messages fetched");
            self.queue.enqueue_all(messages).await;
        }
        self.fetcher.commit(&batch).await;
        self.queue.trigger().await;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::credentials::StaticCredentials;
    use crate::config::{PipelineConfig, PublisherConfig};
    use crate::pipeline::fetcher::HistoryCursor;
    use crate::pipeline::fetcher::tests::{ScriptedSource, upstream_error};
    use crate::pipeline::rate_limiter::RateLimiter;
    use crate::pipeline::rules::RulesClassifier;
    use crate::pipeline::types::PendingMessage;
    use crate::store::{LibSqlBackend, TaskRepository};
    use crate::tasks::publisher::UpdatePublisher;

    struct Harness {
        watch: Arc<WatchLoop>,
        source: Arc<ScriptedSource>,
        fetcher: Arc<IncrementalFetcher>,
        queue: Arc<BatchQueue>,
        repo: Arc<LibSqlBackend>,
    }

    async fn harness(marker: Option<&str>, creds: StaticCredentials) -> Harness {
        let config = PipelineConfig::default();
        let source = Arc::new(ScriptedSource::new("100"));
        let fetcher = Arc::new(IncrementalFetcher::with_cursor(
            source.clone(),
            HistoryCursor::new(marker.map(String::from)),
        ));
        let repo = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = BatchQueue::new(
            &config,
            Arc::new(RateLimiter::from_config(&config).unwrap()),
            Arc::new(RulesClassifier::default_rules()),
            repo.clone(),
            UpdatePublisher::new(PublisherConfig::default()),
        );
        let watch = WatchLoop::new(
            fetcher.clone(),
            queue.clone(),
            Arc::new(creds),
            config.poll_interval,
        );
        Harness {
            watch,
            source,
            fetcher,
            queue,
            repo,
        }
    }

    fn msg(id: &str) -> PendingMessage {
        PendingMessage::new(format!("Subject {id}"), "a@example.com", "body", id)
    }

    #[tokio::test]
    async fn start_without_credentials_fails() {
        let h = harness(None, StaticCredentials::none()).await;
        assert!(matches!(
            h.watch.start(),
            Err(ConfigError::MissingCredentials(_))
        ));
        assert!(h.watch.start().is_err());
        assert!(!h.watch.is_running());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let h = harness(None, StaticCredentials::new("rt")).await;
        assert!(h.watch.start().unwrap());
        assert!(!h.watch.start().unwrap());
        assert!(h.watch.is_running());
        h.watch.stop();
        assert!(!h.watch.is_running());
    }

    #[tokio::test]
    async fn first_poll_baselines_then_enqueues() {
        let h = harness(None, StaticCredentials::new("rt")).await;

        assert_eq!(h.watch.poll_once().await.unwrap(), 0);
        assert_eq!(h.fetcher.marker().await.as_deref(), Some("100"));

        h.source.push_page(vec![msg("a"), msg("b")], Some("103"));
        assert_eq!(h.watch.poll_once().await.unwrap(), 2);
        assert_eq!(h.fetcher.marker().await.as_deref(), Some("103"));

        h.queue.wait_idle().await;
        assert_eq!(h.repo.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn fetch_failure_keeps_marker() {
        let h = harness(Some("100"), StaticCredentials::new("rt")).await;
        h.source.push_error(upstream_error());

        assert!(h.watch.poll_once().await.is_err());
        assert_eq!(h.fetcher.marker().await.as_deref(), Some("100"));
        assert_eq!(h.queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn expired_marker_resets_cursor() {
        let h = harness(Some("7"), StaticCredentials::new("rt")).await;
        h.source.push_error(FetchError::MarkerExpired { marker: "7".into() });

        assert!(h.watch.poll_once().await.is_err());
        assert!(h.fetcher.marker().await.is_none());

        assert_eq!(h.watch.poll_once().await.unwrap(), 0);
        assert_eq!(h.fetcher.marker().await.as_deref(), Some("100"));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_polls_on_interval() {
        let h = harness(Some("100"), StaticCredentials::new("rt")).await;
        h.source.push_page(vec![], None);
        h.source.push_page(vec![msg("late")], Some("101"));

        h.watch.start().unwrap();

        // Immediate tick, then one after 60s.
        tokio::time::sleep(Duration::from_secs(61)).await;
        h.queue.wait_idle().await;

        assert_eq!(h.source.seen_markers.lock().unwrap().len(), 2);
        assert_eq!(h.fetcher.marker().await.as_deref(), Some("101"));
        assert_eq!(h.repo.count().await.unwrap(), 1);

        h.watch.stop();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.source.seen_markers.lock().unwrap().len(), 2);
    }
}
