use std::sync::Arc;

use tower_http::cors::CorsLayer;

use pdf2html_tasks::api::task_routes;
use pdf2html_tasks::config::ServiceConfig;
use pdf2html_tasks::conversion::{ConversionPipeline, SameOriginRule, SourceResolver};
use pdf2html_tasks::store::open_store;
use pdf2html_tasks::tasks::{RetentionSweeper, TaskManager};
use pdf2html_tasks::worker::BackgroundExecutor;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServiceConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    eprintln!("📄 pdf2html-tasks v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Listening: http://{}", config.bind);
    eprintln!("   Uploads: {}", config.uploads_dir.display());
    eprintln!("   Converts: {}", config.converts_dir.display());
    eprintln!("   Converter: {}", config.converter.program);
    eprintln!("   Workers: {}\n", config.executor.concurrency);

    // ── Task store ──────────────────────────────────────────────────────
    let store = open_store(&config.store).await.unwrap_or_else(|e| {
        eprintln!("Error: Failed to open task store: {e}");
        std::process::exit(1);
    });
    let manager = Arc::new(TaskManager::new(store));
    eprintln!("   Task store: {}", manager.backend_name());

    // ── Executor + sweeper ──────────────────────────────────────────────
    tokio::fs::create_dir_all(&config.converts_dir).await?;
    let pipeline = Arc::new(ConversionPipeline::from_config(&config)?);
    let executor = Arc::new(BackgroundExecutor::start(
        Arc::clone(&manager),
        pipeline,
        &config.executor,
    ));

    let sweeper = Arc::new(RetentionSweeper::new(Arc::clone(&manager), &config.retention)).spawn();

    // ── HTTP ────────────────────────────────────────────────────────────
    let resolver = SourceResolver::new(SameOriginRule::new(config.converter.same_origin_hosts.clone()));
    let app = task_routes(
        Arc::clone(&manager),
        Arc::clone(&executor),
        resolver,
        config.converts_dir.clone(),
    )
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %config.bind, "HTTP server started");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    sweeper.stop().await;
    executor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
