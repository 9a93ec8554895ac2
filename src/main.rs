//! Application entry point for the `sensorflow-rule-engine` service.
//!
//! This binary orchestrates the full startup sequence, including:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Establishing a PostgreSQL connection pool and creating the schema
//! - Building the window cache, history store and in-process queue
//! - Spawning the rule engine consumer tasks
//! - Serving the ingestion/health routes until SIGINT or SIGTERM
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string
//! - `ENGINE_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `ENGINE_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See `config.rs` for the engine settings.
use std::{env, sync::Arc};

use anyhow::{Context, Result};
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use sensorflow_rule_engine::routes::{self, AppState};
use sensorflow_rule_engine::{
    config, queue, schema, HistoryStore, PgHistoryStore, RuleEngine, StreamConsumer, WindowCache,
};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!("Attempting to connect to database: {}", config::mask_db_url(&cfg.db_url));

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .with_context(|| {
            format!("Failed to connect to database '{}'", config::mask_db_url(&cfg.db_url))
        })?;

    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;

    let store: Arc<dyn HistoryStore> = Arc::new(PgHistoryStore::new(pool.clone()));
    let cache = Arc::new(WindowCache::new(cfg.sustained_count));
    let engine = RuleEngine::new(cache, Arc::clone(&store), cfg.engine_settings());
    let (publisher, subscription) = queue::channel(cfg.queue_name.clone(), cfg.queue_capacity);

    let cancel = CancellationToken::new();
    let mut consumers = Vec::with_capacity(cfg.consumer_count);
    for id in 0..cfg.consumer_count {
        let mut consumer = StreamConsumer::new(id, engine.clone(), subscription.clone());
        let cancel = cancel.child_token();
        consumers.push(tokio::spawn(async move { consumer.run(cancel).await }));
    }

    let app = routes::router(AppState {
        store,
        publisher,
        stats: Arc::clone(engine.stats()),
        store_timeout: cfg.store_timeout,
    });

    tracing::info!("Listening on {}", cfg.http_addr);
    let listener = tokio::net::TcpListener::bind(&cfg.http_addr).await?;
    let server_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Consumers finish their in-flight message, then stop.
            server_cancel.cancel();
        })
        .await?;

    for handle in consumers {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("consumer stopped: {}", e),
            Err(e) => tracing::error!("consumer task failed: {}", e),
        }
    }

    let stats = engine.stats().snapshot();
    tracing::info!(?stats, "rule engine stopped");
    pool.close().await;

    Ok(())
}

// ---

/// Resolve on the first SIGINT or SIGTERM.
async fn shutdown_signal() {
    // ---
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!(signal = "SIGINT", "shutdown signal received"),
        _ = terminate => tracing::info!(signal = "SIGTERM", "shutdown signal received"),
    }
}

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `ENGINE_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by `RUST_LOG`, else the `ENGINE_LOG_LEVEL` env var
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked.
fn init_tracing() {
    // ---
    let span_events = match env::var("ENGINE_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to ENGINE_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("ENGINE_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
