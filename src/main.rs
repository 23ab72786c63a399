use std::sync::Arc;

use inbox_tasks::channels::{CredentialsProvider, EnvCredentials, GmailConfig, GmailSource};
use inbox_tasks::config::AppConfig;
use inbox_tasks::error::Result;
use inbox_tasks::pipeline::{
    BatchQueue, Classifier, IncrementalFetcher, RateLimiter, RulesClassifier, WatchLoop,
};
use inbox_tasks::store::{LibSqlBackend, TaskRepository};
use inbox_tasks::tasks::{AppState, UpdatePublisher, spawn_heartbeat, task_routes};
use tower_http::cors::CorsLayer;
use tracing_subscriber::fmt::writer::MakeWriterExt;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env();

    // Initialize tracing; the guard flushes the file writer on exit.
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _log_guard = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "inbox-tasks.log");
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::io::stderr.and(file_writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .init();
            None
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    eprintln!("📬 Inbox Tasks v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Task API: http://0.0.0.0:{}/api/tasks", config.port);
    eprintln!("   Updates WS: ws://0.0.0.0:{}/ws", config.port);

    // ── Database ─────────────────────────────────────────────────────────
    let repository: Arc<dyn TaskRepository> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Pipeline ─────────────────────────────────────────────────────────
    let publisher = UpdatePublisher::new(config.publisher.clone());
    let _heartbeat_handle = spawn_heartbeat(Arc::clone(&publisher));

    let classifier: Arc<dyn Classifier> = Arc::new(RulesClassifier::default_rules());
    let limiter = Arc::new(RateLimiter::from_config(&config.pipeline)?);
    let queue = BatchQueue::new(
        &config.pipeline,
        limiter,
        Arc::clone(&classifier),
        Arc::clone(&repository),
        Arc::clone(&publisher),
    );

    // ── Mailbox watch ────────────────────────────────────────────────────
    let credentials: Arc<dyn CredentialsProvider> = Arc::new(EnvCredentials);
    let watch = match GmailConfig::from_env() {
        Some(gmail) => {
            let source = Arc::new(GmailSource::new(gmail, Arc::clone(&credentials)));
            let fetcher = Arc::new(IncrementalFetcher::new(source));
            let watch = WatchLoop::new(
                fetcher,
                Arc::clone(&queue),
                credentials,
                config.pipeline.poll_interval,
            );
            // A missing refresh token is logged by `start`; the server still runs.
            if watch.start().is_ok() {
                eprintln!(
                    "   Gmail watch: every {}s",
                    config.pipeline.poll_interval.as_secs()
                );
            }
            Some(watch)
        }
        None => {
            tracing::warn!("GOOGLE_CLIENT_ID/GOOGLE_CLIENT_SECRET not set; mailbox watch disabled");
            None
        }
    };

    // ── HTTP / WebSocket ─────────────────────────────────────────────────
    let app = task_routes(AppState {
        repository,
        publisher,
        queue,
        classifier,
    })
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!(port = config.port, "Task server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    if let Some(watch) = watch {
        watch.stop();
    }
    tracing::info!("Shut down");
    Ok(())
}
