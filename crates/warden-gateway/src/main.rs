// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Warden Gateway - Tenant Agent Control Plane Server
//!
//! Serves tenant subdomains over HTTP/WebSocket, orchestrates agent
//! containers against Docker, and runs the reconciliation reaper.

use std::sync::Arc;
use tracing::{info, warn};

use warden_core::persistence::PostgresPersistence;
use warden_gateway::Config;
use warden_gateway::app::GatewayRuntime;
use warden_gateway::runtime::{ContainerRuntime, DockerRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warden_gateway=info,warden_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        domain = %config.domain,
        proxy_port = config.proxy_port,
        data_path = %config.data_path.display(),
        agent_image = %config.agent_image,
        "Starting Warden Gateway"
    );

    // Connect to database and verify the schema
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    let persistence = PostgresPersistence::new(pool);
    persistence.migrate().await?;
    info!("Database schema verified");

    // Connect to the container runtime
    let container_runtime = Arc::new(DockerRuntime::connect()?);
    info!(runtime_type = container_runtime.runtime_type(), "Container runtime connected");

    // Start the runtime
    let runtime = GatewayRuntime::builder()
        .persistence(Arc::new(persistence))
        .container_runtime(container_runtime)
        .config(config)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.local_addr(), "Gateway ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Warden Gateway shut down");

    Ok(())
}
