// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Spawn / stop / restart / remove flows for agent containers.
//!
//! The spawn path drives a deployment through
//! `configuring -> provisioning -> starting` and hands off to the health
//! checker, which performs the `healthy` transition on the first successful
//! probe. Any failure after the `configuring` transition runs the shared
//! cleanup: remove the container if one was created, release the port if
//! one was reserved, and park the deployment in `error` with the failure
//! message preserved.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use warden_core::model::{Deployment, DeploymentSecrets};
use warden_core::persistence::{DeploymentFilter, DeploymentUpdate, Persistence};
use warden_core::status::DeploymentStatus;
use warden_core::validate;

use crate::config::{AGENT_DATA_MOUNT, Config};
use crate::error::{Error, Result};
use crate::health::HealthChecker;
use crate::materializer::ConfigMaterializer;
use crate::ports::PortAllocator;
use crate::runtime::{ContainerRuntime, ContainerSpec, PortBinding, RuntimeError};

/// Graceful deadline for container stop and restart.
const STOP_GRACE: Duration = Duration::from_secs(30);

/// Bound on allocate-then-reserve attempts before giving up.
const PORT_RESERVE_ATTEMPTS: usize = 5;

/// Per-spawn resource limits.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    /// Memory limit in bytes.
    pub memory_bytes: i64,
    /// CPU quota in nano-CPUs.
    pub nano_cpus: i64,
}

/// Orchestrator-facing configuration, derived from the gateway [`Config`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Name prefix for managed containers.
    pub container_prefix: String,
    /// Image agents run.
    pub agent_image: String,
    /// Fixed agent port inside the container.
    pub agent_internal_port: u16,
    /// Fleet-wide running-agent cap.
    pub max_running_agents: u64,
    /// Default plan limits when the caller passes none.
    pub default_limits: ResourceLimits,
    /// `on-failure` restart retry bound.
    pub agent_max_restarts: i64,
    /// Host directory holding per-deployment trees.
    pub data_path: PathBuf,
}

impl From<&Config> for OrchestratorConfig {
    fn from(config: &Config) -> Self {
        Self {
            container_prefix: config.container_prefix.clone(),
            agent_image: config.agent_image.clone(),
            agent_internal_port: config.agent_internal_port,
            max_running_agents: config.max_running_agents,
            default_limits: ResourceLimits {
                memory_bytes: config.agent_memory_limit,
                nano_cpus: config.agent_cpu_nano,
            },
            agent_max_restarts: config.agent_max_restarts,
            data_path: config.data_path.clone(),
        }
    }
}

/// Tracks resources acquired during a spawn so the shared cleanup can
/// undo them.
#[derive(Default)]
struct SpawnScratch {
    port: Option<u16>,
    container_id: Option<String>,
}

/// Drives deployment lifecycle against the container runtime.
pub struct Orchestrator {
    persistence: Arc<dyn Persistence>,
    runtime: Arc<dyn ContainerRuntime>,
    ports: Arc<PortAllocator>,
    health: Arc<HealthChecker>,
    materializer: ConfigMaterializer,
    config: OrchestratorConfig,
    /// In-flight image pulls, keyed by image reference. Joiners await the
    /// receiver instead of starting a second pull.
    pulls: Mutex<HashMap<String, watch::Receiver<bool>>>,
}

impl Orchestrator {
    /// Wire up an orchestrator.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        runtime: Arc<dyn ContainerRuntime>,
        ports: Arc<PortAllocator>,
        health: Arc<HealthChecker>,
        materializer: ConfigMaterializer,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            persistence,
            runtime,
            ports,
            health,
            materializer,
            config,
            pulls: Mutex::new(HashMap::new()),
        }
    }

    /// Canonical container name for a deployment.
    pub fn container_name(&self, deployment_id: &str) -> String {
        format!("{}{}", self.config.container_prefix, deployment_id)
    }

    /// Spawn a deployment's agent container.
    ///
    /// `secrets` is the decrypted credentials document; `model` overrides
    /// the stored model when given. Preconditions and the full flow are
    /// enforced in order; every failure leaves the deployment in `error`
    /// with a diagnostic message.
    pub async fn spawn_agent(
        &self,
        deployment: &Deployment,
        secrets: &DeploymentSecrets,
        model: Option<&str>,
        limits: Option<ResourceLimits>,
    ) -> Result<()> {
        let mut scratch = SpawnScratch::default();
        match self
            .spawn_inner(deployment, secrets, model, limits, &mut scratch)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                self.cleanup_failed_spawn(&deployment.id, &scratch, &e).await;
                Err(e)
            }
        }
    }

    async fn spawn_inner(
        &self,
        deployment: &Deployment,
        secrets: &DeploymentSecrets,
        model: Option<&str>,
        limits: Option<ResourceLimits>,
        scratch: &mut SpawnScratch,
    ) -> Result<()> {
        // 1. Fleet gate.
        let running = self
            .persistence
            .count_deployments(&DeploymentFilter::running_like())
            .await?;
        if running >= self.config.max_running_agents {
            return Err(Error::CapacityFull {
                running,
                max: self.config.max_running_agents,
            });
        }

        // 2. Zombie cleanup: an earlier container with this deployment's
        // canonical name must not survive into the new spawn.
        self.remove_stale_container(&deployment.id).await?;

        // 3. Enter `configuring`.
        self.persistence
            .transition(&deployment.id, DeploymentStatus::Configuring)
            .await?;
        self.set_step(&deployment.id, "Allocating resources...").await;

        // 4. Allocate and reserve a host port.
        let port = self.reserve_port(&deployment.id, scratch).await?;

        // 5. Validate keys and resolve the model.
        validate::validate_secret_formats(secrets).map_err(warden_core::Error::from)?;
        let model = validate::normalize_model(model.or(non_empty(&deployment.config.model)), secrets)
            .map_err(warden_core::Error::from)?;
        if model != deployment.config.model {
            let mut config = deployment.config.clone();
            config.model = model.clone();
            let update = DeploymentUpdate {
                config: Some(config),
                ..Default::default()
            };
            self.persistence
                .update_deployment(&deployment.id, &update, None)
                .await?;
        }

        // 6. Materialize configs, then enter `provisioning`.
        let paths = self
            .materializer
            .materialize(deployment, secrets, &model)
            .await?;
        self.persistence
            .transition(&deployment.id, DeploymentStatus::Provisioning)
            .await?;
        self.set_step(&deployment.id, "Preparing agent image...").await;

        // 7. Ensure the image exists (deduplicating concurrent pulls).
        self.ensure_image().await?;

        // 8. Create and start the container.
        self.set_step(&deployment.id, "Starting container...").await;
        let limits = limits.unwrap_or(self.config.default_limits);
        let spec = self.container_spec(deployment, secrets, port, &limits, &paths.config_dir, &paths.data_dir);
        let container_id = self.runtime.create_container(&spec).await?;
        scratch.container_id = Some(container_id.clone());
        self.runtime.start_container(&container_id).await?;

        // 9. Persist the runtime refs.
        let update = DeploymentUpdate {
            container_id: Some(Some(container_id.clone())),
            internal_port: Some(Some(port)),
            ..Default::default()
        };
        self.persistence
            .update_deployment(&deployment.id, &update, None)
            .await?;

        // 10. Enter `starting` and hand off to the health checker.
        self.persistence
            .transition(&deployment.id, DeploymentStatus::Starting)
            .await?;
        self.watch_health(&deployment.id, port);

        info!(
            deployment_id = %deployment.id,
            subdomain = %deployment.subdomain,
            container_id = %container_id,
            port = port,
            model = %model,
            "Agent container started"
        );
        Ok(())
    }

    /// Stop a running agent. Allowed from `healthy` or `starting`.
    pub async fn stop_agent(&self, deployment_id: &str) -> Result<()> {
        let deployment = self.get(deployment_id).await?;
        if !matches!(
            deployment.status,
            DeploymentStatus::Healthy | DeploymentStatus::Starting
        ) {
            return Err(Error::WrongStatus {
                action: "stop",
                status: deployment.status,
            });
        }

        self.health.cancel(deployment_id);

        if let Some(container_id) = &deployment.container_id {
            match self.runtime.stop_container(container_id, STOP_GRACE).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if deployment.status == DeploymentStatus::Healthy {
            self.persistence
                .transition(deployment_id, DeploymentStatus::Stopped)
                .await?;
        } else {
            // `starting -> stopped` is not in the table; a user stop during
            // startup is an operational override and is logged as such.
            warn!(deployment_id = %deployment_id, "Stopping deployment mid-startup");
            let update = DeploymentUpdate {
                status: Some(DeploymentStatus::Stopped),
                container_id: Some(None),
                internal_port: Some(None),
                provisioning_step: Some(None),
                ..Default::default()
            };
            self.persistence
                .update_deployment(deployment_id, &update, Some(deployment.status))
                .await?;
        }

        info!(deployment_id = %deployment_id, "Agent stopped");
        Ok(())
    }

    /// Restart an agent.
    ///
    /// Without a container this is a full spawn from the stored secrets and
    /// model. With one, the container is restarted in place and the health
    /// probe is re-armed on the existing port.
    pub async fn restart_agent(
        &self,
        deployment_id: &str,
        secrets: &DeploymentSecrets,
        limits: Option<ResourceLimits>,
    ) -> Result<()> {
        let deployment = self.get(deployment_id).await?;

        let Some(container_id) = deployment.container_id.clone() else {
            return self.spawn_agent(&deployment, secrets, None, limits).await;
        };

        if deployment.status != DeploymentStatus::Healthy {
            return Err(Error::WrongStatus {
                action: "restart",
                status: deployment.status,
            });
        }
        let Some(port) = deployment.internal_port else {
            return Err(Error::Other(format!(
                "deployment {deployment_id} is healthy without a port"
            )));
        };

        self.persistence
            .transition(deployment_id, DeploymentStatus::Restarting)
            .await?;

        if let Err(e) = self.runtime.restart_container(&container_id, STOP_GRACE).await {
            self.persistence
                .fail_deployment(deployment_id, &format!("Restart failed: {e}"))
                .await?;
            return Err(e.into());
        }

        self.watch_health(deployment_id, port);
        info!(deployment_id = %deployment_id, container_id = %container_id, "Agent restarting");
        Ok(())
    }

    /// Tear down an agent's container, port, and on-host data tree.
    ///
    /// The deployment record itself is deleted by the calling handler.
    pub async fn remove_agent(&self, deployment_id: &str) -> Result<()> {
        self.health.cancel(deployment_id);

        let deployment = self.get(deployment_id).await?;

        if let Some(container_id) = &deployment.container_id {
            match self.runtime.remove_container(container_id, true).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(port) = deployment.internal_port {
            self.ports.release(port);
        }

        self.persistence
            .update_deployment(deployment_id, &DeploymentUpdate::clear_container_refs(), None)
            .await?;

        let root = self.materializer.deployment_root(deployment_id);
        if let Err(e) = tokio::fs::remove_dir_all(&root).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    deployment_id = %deployment_id,
                    path = %root.display(),
                    error = %e,
                    "Failed to remove deployment data tree"
                );
            }
        }

        info!(deployment_id = %deployment_id, "Agent removed");
        Ok(())
    }

    /// Force-remove any container carrying this deployment's canonical
    /// name and clear the record's runtime refs.
    async fn remove_stale_container(&self, deployment_id: &str) -> Result<()> {
        let name = self.container_name(deployment_id);
        let containers = match self.runtime.list_containers(true).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(error = %e, "Zombie scan skipped, runtime listing unavailable");
                return Ok(());
            }
        };

        for container in containers {
            if !container.names.iter().any(|n| n == &name) {
                continue;
            }
            warn!(
                deployment_id = %deployment_id,
                container_id = %container.id,
                "Removing stale container before spawn"
            );
            match self.runtime.remove_container(&container.id, true).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.persistence
            .update_deployment(deployment_id, &DeploymentUpdate::clear_container_refs(), None)
            .await?;
        Ok(())
    }

    /// Allocate a port and reserve it on the record, retrying on
    /// unique-index races. When the record briefly left `configuring`, the
    /// port is written unconditionally (deliberate fallback).
    async fn reserve_port(&self, deployment_id: &str, scratch: &mut SpawnScratch) -> Result<u16> {
        for _ in 0..PORT_RESERVE_ATTEMPTS {
            let candidate = self.ports.allocate().await?;
            scratch.port = Some(candidate);

            if self.ports.atomic_reserve(deployment_id, candidate).await? {
                return Ok(candidate);
            }

            let current = self.get(deployment_id).await?;
            if current.status != DeploymentStatus::Configuring {
                let update = DeploymentUpdate {
                    internal_port: Some(Some(candidate)),
                    ..Default::default()
                };
                match self
                    .persistence
                    .update_deployment(deployment_id, &update, None)
                    .await
                {
                    Ok(true) => return Ok(candidate),
                    Ok(false) => {
                        return Err(Error::Core(warden_core::Error::DeploymentNotFound(
                            deployment_id.to_string(),
                        )));
                    }
                    // Unique-index collision: another deployment took the
                    // port between bind re-check and write. Re-allocate.
                    Err(warden_core::Error::Conflict(_)) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            // Unique-index collision through the conditional path.
            debug!(deployment_id = %deployment_id, port = candidate, "Port reservation lost, re-allocating");
        }

        Err(Error::Other(format!(
            "could not reserve a port for deployment {deployment_id} after {PORT_RESERVE_ATTEMPTS} attempts"
        )))
    }

    /// Pull the agent image unless present, joining any in-flight pull of
    /// the same image.
    async fn ensure_image(&self) -> Result<()> {
        let image = self.config.agent_image.clone();
        if self.runtime.image_exists(&image).await? {
            return Ok(());
        }

        enum Role {
            Puller(watch::Sender<bool>),
            Joiner(watch::Receiver<bool>),
        }

        let role = {
            let mut pulls = self.pulls.lock().unwrap();
            if let Some(rx) = pulls.get(&image) {
                Role::Joiner(rx.clone())
            } else {
                let (tx, rx) = watch::channel(false);
                pulls.insert(image.clone(), rx);
                Role::Puller(tx)
            }
        };

        match role {
            Role::Puller(tx) => {
                // The guard removes the in-flight entry even if this future
                // is dropped mid-pull.
                let guard = PullCleanup {
                    pulls: &self.pulls,
                    image: &image,
                };
                info!(image = %image, "Pulling agent image");
                let result = self.runtime.pull_image(&image).await;
                drop(guard);
                let _ = tx.send(true);
                result?;
            }
            Role::Joiner(mut rx) => {
                debug!(image = %image, "Joining in-flight image pull");
                loop {
                    if *rx.borrow() {
                        break;
                    }
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                // The first puller may have failed; verify and pull
                // directly if the image is still missing.
                if !self.runtime.image_exists(&image).await? {
                    self.runtime.pull_image(&image).await?;
                }
            }
        }
        Ok(())
    }

    fn container_spec(
        &self,
        deployment: &Deployment,
        secrets: &DeploymentSecrets,
        port: u16,
        limits: &ResourceLimits,
        config_dir: &std::path::Path,
        data_dir: &std::path::Path,
    ) -> ContainerSpec {
        let mut env = vec![
            "CONFIG_PATH=/config/openclaw.json".to_string(),
            format!("DEPLOYMENT_ID={}", deployment.id),
            "NODE_ENV=production".to_string(),
            format!("GATEWAY_TOKEN={}", secrets.web_ui_token),
            format!("NODE_OPTIONS=--max-old-space-size={}", node_heap_mb(limits.memory_bytes)),
        ];
        if let Some(key) = &secrets.openai_api_key {
            env.push(format!("OPENAI_API_KEY={key}"));
        }
        if let Some(key) = &secrets.anthropic_api_key {
            env.push(format!("ANTHROPIC_API_KEY={key}"));
        }
        if let Some(key) = &secrets.google_api_key {
            env.push(format!("GOOGLE_API_KEY={key}"));
        }
        if let Some(token) = &secrets.telegram_bot_token {
            env.push(format!("TELEGRAM_BOT_TOKEN={token}"));
        }

        ContainerSpec {
            image: self.config.agent_image.clone(),
            name: self.container_name(&deployment.id),
            user: Some("1000:1000".to_string()),
            env,
            binds: vec![
                format!("{}:/config:rw", config_dir.display()),
                format!("{}:{}:rw", data_dir.display(), AGENT_DATA_MOUNT),
            ],
            port_bindings: vec![PortBinding {
                container_port: self.config.agent_internal_port,
                host_port: port,
            }],
            memory_bytes: limits.memory_bytes,
            nano_cpus: limits.nano_cpus,
            restart_max_retries: self.config.agent_max_restarts,
        }
    }

    fn watch_health(&self, deployment_id: &str, port: u16) {
        let persistence = self.persistence.clone();
        let id = deployment_id.to_string();
        self.health.watch(deployment_id, port, async move {
            match persistence.transition(&id, DeploymentStatus::Healthy).await {
                Ok(_) => info!(deployment_id = %id, "Agent healthy"),
                Err(e) => warn!(deployment_id = %id, error = %e, "Healthy transition failed"),
            }
        });
    }

    async fn cleanup_failed_spawn(&self, deployment_id: &str, scratch: &SpawnScratch, cause: &Error) {
        warn!(deployment_id = %deployment_id, error = %cause, "Spawn failed, cleaning up");

        if let Some(container_id) = &scratch.container_id {
            match self.runtime.remove_container(container_id, true).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(e) => {
                    warn!(container_id = %container_id, error = %e, "Cleanup: container removal failed");
                }
            }
        }
        if let Some(port) = scratch.port {
            self.ports.release(port);
        }
        if let Err(e) = self
            .persistence
            .fail_deployment(deployment_id, &cause.to_string())
            .await
        {
            warn!(deployment_id = %deployment_id, error = %e, "Cleanup: error transition failed");
        }
    }

    async fn get(&self, deployment_id: &str) -> Result<Deployment> {
        self.persistence
            .get_deployment(deployment_id)
            .await?
            .ok_or_else(|| {
                Error::Core(warden_core::Error::DeploymentNotFound(
                    deployment_id.to_string(),
                ))
            })
    }

    async fn set_step(&self, deployment_id: &str, step: &str) {
        let update = DeploymentUpdate {
            provisioning_step: Some(Some(step.to_string())),
            ..Default::default()
        };
        if let Err(e) = self
            .persistence
            .update_deployment(deployment_id, &update, None)
            .await
        {
            warn!(deployment_id = %deployment_id, error = %e, "Failed to update provisioning step");
        }
    }
}

/// Entry removal guard for the in-flight pull map; runs even when the pull
/// future is dropped mid-flight.
struct PullCleanup<'a> {
    pulls: &'a Mutex<HashMap<String, watch::Receiver<bool>>>,
    image: &'a str,
}

impl Drop for PullCleanup<'_> {
    fn drop(&mut self) {
        self.pulls.lock().unwrap().remove(self.image);
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Node heap hint in MiB for a container memory limit.
///
/// `max(256, min(1536, floor(((mem_mb - 128) * 0.75) / 64) * 64))`, bounded
/// above by `mem_mb - 128`; a zero limit means an unlimited container and
/// gets the 1536 ceiling.
pub(crate) fn node_heap_mb(memory_bytes: i64) -> i64 {
    const MIB: i64 = 1024 * 1024;
    if memory_bytes <= 0 {
        return 1536;
    }
    let mem_mb = memory_bytes / MIB;
    let headroom = mem_mb - 128;
    let derived = ((headroom * 3 / 4) / 64) * 64;
    derived.clamp(256, 1536).min(headroom.max(64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_heap_unlimited() {
        assert_eq!(node_heap_mb(0), 1536);
    }

    #[test]
    fn test_node_heap_default_limit() {
        // 768 MiB limit: floor((640 * 0.75) / 64) * 64 = 448.
        assert_eq!(node_heap_mb(768 * 1024 * 1024), 448);
    }

    #[test]
    fn test_node_heap_floor() {
        // 512 MiB: floor((384 * 0.75) / 64) * 64 = 256.
        assert_eq!(node_heap_mb(512 * 1024 * 1024), 256);
        // 384 MiB: derived 192 is clamped up to 256, then bounded by
        // headroom 256.
        assert_eq!(node_heap_mb(384 * 1024 * 1024), 256);
    }

    #[test]
    fn test_node_heap_ceiling() {
        // 4 GiB: derived 2944 exceeds the 1536 ceiling.
        assert_eq!(node_heap_mb(4 * 1024 * 1024 * 1024), 1536);
    }

    #[test]
    fn test_node_heap_never_exceeds_headroom() {
        // 256 MiB: headroom is 128, which caps the minimum.
        assert_eq!(node_heap_mb(256 * 1024 * 1024), 128);
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(""), None);
        assert_eq!(non_empty("  "), None);
        assert_eq!(non_empty("google/gemini-3-pro-preview"), Some("google/gemini-3-pro-preview"));
    }
}
