//! Worker agent binary — polls the control plane for work and executes it.

use std::sync::Arc;

use foreman::agent::{HttpControlPlane, SimulationRunner, WorkerAgent};
use foreman::config::AgentConfig;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AgentConfig::from_env();

    eprintln!("🔩 Foreman worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Name: {}", config.name);
    eprintln!("   Control plane: {}", config.api_url);
    eprintln!("   Lanes: {}", config.lanes.join(", "));

    let control = Arc::new(HttpControlPlane::new(&config.api_url));
    let runner = Arc::new(SimulationRunner::default());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let agent = WorkerAgent::new(config, control, runner, shutdown_rx);
    agent.run().await?;

    Ok(())
}
