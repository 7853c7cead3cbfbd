//! tier-router server binary.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use tier_router::config::{Cli, Config};
use tier_router::server::api::build_router;
use tier_router::ServingStack;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "tier_router=debug,tower_http=debug"
    } else {
        "tier_router=info,tower_http=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("tier-router v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }

    info!(
        gold_ms = config.tiers.gold.latency_budget_ms,
        silver_ms = config.tiers.silver.latency_budget_ms,
        bronze_ms = config.tiers.bronze.latency_budget_ms,
        lookahead = config.speculative.lookahead,
        "Configuration loaded"
    );

    // Build every component and start the background loops.
    let stack = Arc::new(ServingStack::build(config).await?);
    let app = build_router(Arc::clone(&stack));

    // Start the server.
    let listen_addr = stack.config.server.listen.clone();
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    stack.shutdown().await;
    Ok(())
}
