use std::sync::Arc;

use foreman::api::{AppState, app_router};
use foreman::config::ServerConfig;
use foreman::dispatch::Dispatcher;
use foreman::orchestrator::Orchestrator;
use foreman::queue::{JobBroker, QueueManager};
use foreman::session::{SessionPolicy, SessionRegistry};
use foreman::store::{Database, LibSqlBackend};

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

    let config = ServerConfig::from_env();

    eprintln!("🛠  Foreman v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://{}", config.bind_addr);
    eprintln!("   Database: {}", config.db_path);
    eprintln!("   Queue: {}", config.queue_db_path);

    // ── Stores ──────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&config.db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", config.db_path, e);
                std::process::exit(1);
            }),
    );

    let broker = Arc::new(
        JobBroker::new_local(std::path::Path::new(&config.queue_db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open queue broker at {}: {}",
                    config.queue_db_path, e
                );
                std::process::exit(1);
            }),
    );

    // ── Services, built once and shared ─────────────────────────────────
    let queue = Arc::new(QueueManager::new(broker));
    let sessions = Arc::new(SessionRegistry::new(
        Arc::clone(&db),
        SessionPolicy {
            idle_timeout: config.session_idle_timeout,
            max_lifetime: config.session_max_lifetime,
            idle_grace: config.session_idle_grace,
        },
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&db),
        Arc::clone(&queue),
        config.max_retries,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&db),
        Arc::clone(&queue),
        Arc::clone(&sessions),
    ));

    // ── Session sweep + broker retention ticker ─────────────────────────
    let sweep_sessions = Arc::clone(&sessions);
    let sweep_queue = Arc::clone(&queue);
    let sweep_interval = config.sweep_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.tick().await; // Skip immediate first tick
        loop {
            interval.tick().await;
            match sweep_sessions.sweep().await {
                Ok(report) => tracing::debug!(
                    marked_idle = report.marked_idle,
                    terminated = report.terminated,
                    "Session sweep complete"
                ),
                Err(e) => tracing::warn!(error = %e, "Session sweep failed"),
            }
            if let Err(e) = sweep_queue.purge_expired().await {
                tracing::warn!(error = %e, "Queue retention purge failed");
            }
        }
    });

    // ── HTTP API ────────────────────────────────────────────────────────
    let state = AppState {
        dispatcher,
        orchestrator,
        sessions,
        queue,
    };
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "Foreman listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}
