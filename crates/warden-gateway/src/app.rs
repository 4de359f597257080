// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable gateway runtime.
//!
//! [`GatewayRuntime`] wires the persistence backend, container runtime,
//! mailer, and configuration into the proxy server and the reaper, so the
//! whole control plane can be embedded in an existing tokio application
//! (or a test) instead of running as the standalone binary.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use warden_gateway::app::GatewayRuntime;
//! use warden_gateway::runtime::DockerRuntime;
//! use warden_core::persistence::PostgresPersistence;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = warden_gateway::Config::from_env()?;
//!     let pool = sqlx::PgPool::connect(&config.database_url).await?;
//!
//!     let runtime = GatewayRuntime::builder()
//!         .persistence(Arc::new(PostgresPersistence::new(pool)))
//!         .container_runtime(Arc::new(DockerRuntime::connect()?))
//!         .config(config)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use warden_core::crypto::SecretCipher;
use warden_core::persistence::Persistence;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::health::HealthChecker;
use crate::mailer::{LogMailer, Mailer};
use crate::materializer::ConfigMaterializer;
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::ports::PortAllocator;
use crate::proxy::{self, CACHE_TTL, DeploymentCache, ProxyState};
use crate::reaper::{Reaper, ReaperConfig};
use crate::runtime::ContainerRuntime;
use crate::wake::{WakeCoordinator, WakeConfig};

/// Builder for a [`GatewayRuntime`].
#[derive(Default)]
pub struct GatewayRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    container_runtime: Option<Arc<dyn ContainerRuntime>>,
    mailer: Option<Arc<dyn Mailer>>,
    config: Option<Config>,
}

impl GatewayRuntimeBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence backend (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the container runtime (required).
    pub fn container_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.container_runtime = Some(runtime);
        self
    }

    /// Set the mailer. Defaults to [`LogMailer`].
    pub fn mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    /// Set the gateway configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Validate the builder into a startable configuration.
    pub fn build(self) -> Result<GatewayRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| Error::Other("persistence is required".into()))?;
        let container_runtime = self
            .container_runtime
            .ok_or_else(|| Error::Other("container runtime is required".into()))?;
        let config = self
            .config
            .ok_or_else(|| Error::Other("config is required".into()))?;

        Ok(GatewayRuntimeConfig {
            persistence,
            container_runtime,
            mailer: self.mailer.unwrap_or_else(|| Arc::new(LogMailer)),
            config,
        })
    }
}

/// Validated configuration for a [`GatewayRuntime`].
pub struct GatewayRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    container_runtime: Arc<dyn ContainerRuntime>,
    mailer: Arc<dyn Mailer>,
    config: Config,
}

impl GatewayRuntimeConfig {
    /// Start the proxy server and the reaper.
    pub async fn start(self) -> Result<GatewayRuntime> {
        let config = self.config;
        let cipher = SecretCipher::from_bytes(config.encryption_key);

        let ports = Arc::new(PortAllocator::new(
            self.persistence.clone(),
            self.container_runtime.clone(),
            config.min_agent_port,
            config.max_agent_port,
        ));
        let health = Arc::new(HealthChecker::new(
            config.health_check_interval,
            config.health_check_timeout,
        ));
        let materializer = ConfigMaterializer::new(&config.data_path, config.agent_internal_port);

        let orchestrator = Arc::new(Orchestrator::new(
            self.persistence.clone(),
            self.container_runtime.clone(),
            ports.clone(),
            health.clone(),
            materializer,
            OrchestratorConfig::from(&config),
        ));

        let cache = Arc::new(DeploymentCache::new(CACHE_TTL));
        let wake = Arc::new(WakeCoordinator::new(
            self.persistence.clone(),
            orchestrator.clone(),
            cipher,
            cache.clone(),
            WakeConfig::default(),
        ));

        let proxy_state = Arc::new(ProxyState::new(
            self.persistence.clone(),
            cache.clone(),
            wake.clone(),
            config.touch_throttle,
        ));
        let router = proxy::router(proxy_state);

        let bind_addr: SocketAddr = ([0, 0, 0, 0], config.proxy_port).into();
        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let (server_shutdown_tx, mut server_shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown_rx.changed().await;
                })
                .await
        });

        let reaper = Arc::new(Reaper::new(
            self.persistence.clone(),
            self.container_runtime.clone(),
            self.mailer.clone(),
            ReaperConfig {
                idle_timeout: config.idle_timeout,
                reminder_window: chrono::Duration::days(config.reminder_days),
                container_prefix: config.container_prefix.clone(),
                ..Default::default()
            },
        ));
        let reaper_shutdown = reaper.shutdown_handle();
        let reaper_task = reaper.clone();
        let reaper_handle = tokio::spawn(async move {
            reaper_task.run().await;
        });

        info!(
            proxy_addr = %local_addr,
            domain = %config.domain,
            "GatewayRuntime started"
        );

        Ok(GatewayRuntime {
            server_handle,
            reaper_handle,
            server_shutdown_tx,
            reaper_shutdown,
            orchestrator,
            local_addr,
        })
    }
}

/// A running gateway: proxy server plus reaper.
pub struct GatewayRuntime {
    server_handle: JoinHandle<std::io::Result<()>>,
    reaper_handle: JoinHandle<()>,
    server_shutdown_tx: watch::Sender<bool>,
    reaper_shutdown: Arc<Notify>,
    orchestrator: Arc<Orchestrator>,
    local_addr: SocketAddr,
}

impl GatewayRuntime {
    /// Create a new builder.
    pub fn builder() -> GatewayRuntimeBuilder {
        GatewayRuntimeBuilder::new()
    }

    /// Address the proxy is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared orchestrator, for API handlers embedding the runtime.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Whether both background tasks are still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished() && !self.reaper_handle.is_finished()
    }

    /// Gracefully shut down the proxy server and the reaper.
    pub async fn shutdown(self) -> Result<()> {
        info!("GatewayRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        self.reaper_shutdown.notify_one();

        if let Err(e) = self.reaper_handle.await {
            error!(error = %e, "Reaper task panicked");
        }

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("GatewayRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "Proxy server error during shutdown");
                Err(e.into())
            }
            Err(e) => {
                error!(error = %e, "Proxy server task panicked");
                Err(Error::Other(format!("proxy server task panicked: {e}")))
            }
        }
    }
}
