//! Ingestion pipeline.
//!
//! Mail flows through:
//! 1. `WatchLoop` — fixed-interval poll
//! 2. `IncrementalFetcher` — only what arrived since the last marker
//! 3. `BatchQueue` — FIFO, drained in batches of rate-limited classifier calls
//! 4. `TaskRepository::save` + `UpdatePublisher::publish` per committed batch
//!
//! A batch is committed whole or requeued whole.

pub mod fetcher;
pub mod queue;
pub mod rate_limiter;
pub mod rules;
pub mod types;
pub mod watcher;

pub use fetcher::{IncrementalFetcher, MailSource};
pub use queue::{BatchQueue, DrainOutcome, DrainReport};
pub use rate_limiter::RateLimiter;
pub use rules::RulesClassifier;
pub use types::{Classification, Classifier, ClassifyRequest, PendingMessage};
pub use watcher::WatchLoop;
