// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime adapter.
//!
//! Defines the abstract interface the orchestrator, port allocator, and
//! reaper consume. Runtimes are pure execution engines - they do NOT access
//! the database; record bookkeeping is handled by the caller.

pub mod docker;
pub mod mock;

pub use docker::DockerRuntime;
pub use mock::MockRuntime;

use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Errors from runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The container or image does not exist.
    ///
    /// Inspect paths treat this as "absent" rather than an error; removal
    /// paths treat it as already done.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The runtime rejected a port binding because the host port is taken.
    /// Escalated to the capacity class by the orchestrator.
    #[error("Host port already allocated: {0}")]
    PortAllocated(String),

    /// The runtime daemon is unreachable.
    #[error("Runtime unavailable: {0}")]
    Unavailable(String),

    /// Other runtime error.
    #[error("{0}")]
    Other(String),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// One published port of a container.
#[derive(Debug, Clone)]
pub struct PublishedPort {
    /// Port inside the container.
    pub private_port: u16,
    /// Host port it is published on, when bound.
    pub public_port: Option<u16>,
    /// Protocol (`tcp`/`udp`).
    pub proto: String,
}

/// A container known to the runtime.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    /// Runtime container ID.
    pub id: String,
    /// Names attached to the container (without a leading slash).
    pub names: Vec<String>,
    /// Ports the container publishes.
    pub ports: Vec<PublishedPort>,
}

/// Point-in-time state of one container.
#[derive(Debug, Clone)]
pub struct ContainerState {
    /// Runtime container ID.
    pub id: String,
    /// Whether the container is currently running.
    pub running: bool,
    /// Exit code, when the container has stopped.
    pub exit_code: Option<i64>,
}

/// A container-port to host-port publication.
#[derive(Debug, Clone, Copy)]
pub struct PortBinding {
    /// TCP port inside the container.
    pub container_port: u16,
    /// Host port to publish it on.
    pub host_port: u16,
}

/// Everything needed to create an agent container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Image reference to run.
    pub image: String,
    /// Container name (canonical per deployment).
    pub name: String,
    /// `uid:gid` the entrypoint runs as.
    pub user: Option<String>,
    /// Environment in `KEY=value` form.
    pub env: Vec<String>,
    /// Bind mounts in `host:container:mode` form.
    pub binds: Vec<String>,
    /// Published ports.
    pub port_bindings: Vec<PortBinding>,
    /// Memory limit in bytes (0 = unlimited).
    pub memory_bytes: i64,
    /// CPU quota in nano-CPUs (0 = unlimited).
    pub nano_cpus: i64,
    /// `on-failure` restart policy retry bound.
    pub restart_max_retries: i64,
}

/// Abstract interface over the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime type identifier (e.g., "docker", "mock").
    fn runtime_type(&self) -> &'static str;

    /// List containers; `all` includes stopped ones.
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>>;

    /// Whether an image is present locally.
    async fn image_exists(&self, reference: &str) -> Result<bool>;

    /// Pull an image, waiting for the pull to complete.
    async fn pull_image(&self, reference: &str) -> Result<()>;

    /// Create a container and return its ID.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a container. Already-started is treated as success.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop a container with a grace period. Already-stopped is treated as
    /// success.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()>;

    /// Restart a container with a grace period.
    async fn restart_container(&self, id: &str, grace: Duration) -> Result<()>;

    /// Remove a container. With `force`, a running container is killed
    /// first.
    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    /// Inspect a container. Not-found is `Ok(None)`, not an error.
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerState>>;

    /// Fetch the trailing log lines of a container.
    async fn container_logs(&self, id: &str, tail: usize, timestamps: bool) -> Result<String>;

    /// Host ports currently published by any container, running or not.
    async fn published_host_ports(&self) -> Result<HashSet<u16>> {
        let mut out = HashSet::new();
        for container in self.list_containers(true).await? {
            for port in container.ports {
                if let Some(host_port) = port.public_port {
                    out.insert(host_port);
                }
            }
        }
        Ok(out)
    }
}
