// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic reconciliation loop.
//!
//! Every cycle runs four passes in order, each isolated so one failing
//! pass never starves the others:
//!
//! 1. Zombie reconcile: deployments claiming `healthy`/`starting` whose
//!    container has vanished from the runtime are parked in `error`.
//! 2. Hibernate idle: healthy deployments with no recent traffic get their
//!    container stopped and removed, record preserved as `stopped`.
//! 3. Expire subscriptions: lapsed users lose their quota and their
//!    running agents.
//! 4. Reminders: users close to expiry get one reminder email per period.
//!
//! The reaper mutates records directly (not through the orchestrator); its
//! writes are compare-and-swapped where a concurrent lifecycle operation
//! could interleave.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use warden_core::model::SubscriptionStatus;
use warden_core::persistence::{DeploymentFilter, DeploymentUpdate, Persistence, UserUpdate};
use warden_core::status::DeploymentStatus;

use crate::mailer::Mailer;
use crate::runtime::ContainerRuntime;

/// Reaper timing and scope knobs.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Cycle interval.
    pub interval: Duration,
    /// Idle threshold for hibernation.
    pub idle_timeout: Duration,
    /// How far ahead of expiry reminders go out.
    pub reminder_window: chrono::Duration,
    /// Bound on the runtime listing call.
    pub list_timeout: Duration,
    /// Pacing between hibernated deployments.
    pub hibernate_pause: Duration,
    /// Managed container name prefix.
    pub container_prefix: String,
    /// Graceful stop deadline for torn-down containers.
    pub stop_grace: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(600),
            reminder_window: chrono::Duration::days(3),
            list_timeout: Duration::from_secs(10),
            hibernate_pause: Duration::from_millis(200),
            container_prefix: "warden-agent-".to_string(),
            stop_grace: Duration::from_secs(30),
        }
    }
}

/// Background reconciliation worker.
pub struct Reaper {
    persistence: Arc<dyn Persistence>,
    runtime: Arc<dyn ContainerRuntime>,
    mailer: Arc<dyn Mailer>,
    config: ReaperConfig,
    in_flight: AtomicBool,
    shutdown: Arc<Notify>,
}

impl Reaper {
    /// Create a reaper.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        runtime: Arc<dyn ContainerRuntime>,
        mailer: Arc<dyn Mailer>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            persistence,
            runtime,
            mailer,
            config,
            in_flight: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reaper loop. Exits when the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            "Reaper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reaper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    self.tick().await;
                }
            }
        }

        info!("Reaper stopped");
    }

    /// Run one reconciliation cycle, skipping if the previous one is
    /// still in flight.
    pub async fn tick(&self) {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            warn!("Previous reaper cycle still running, skipping");
            return;
        }

        if let Err(e) = self.reconcile_zombies().await {
            error!(error = %e, "Zombie reconcile pass failed");
        }
        if let Err(e) = self.hibernate_idle().await {
            error!(error = %e, "Hibernate pass failed");
        }
        if let Err(e) = self.expire_subscriptions().await {
            error!(error = %e, "Subscription expiry pass failed");
        }
        if let Err(e) = self.send_reminders().await {
            error!(error = %e, "Reminder pass failed");
        }

        self.in_flight.store(false, Ordering::SeqCst);
    }

    /// Pass 1: deployments claiming a live container that the runtime no
    /// longer knows about.
    async fn reconcile_zombies(&self) -> crate::error::Result<()> {
        let live: HashSet<String> = match tokio::time::timeout(
            self.config.list_timeout,
            self.runtime.list_containers(false),
        )
        .await
        {
            Ok(Ok(containers)) => containers
                .into_iter()
                .filter(|c| {
                    c.names
                        .iter()
                        .any(|n| n.starts_with(&self.config.container_prefix))
                })
                .map(|c| c.id)
                .collect(),
            Ok(Err(e)) => {
                warn!(error = %e, "Zombie pass skipped, runtime listing failed");
                return Ok(());
            }
            Err(_) => {
                warn!("Zombie pass skipped, runtime listing timed out");
                return Ok(());
            }
        };

        let claiming = self
            .persistence
            .list_deployments(&DeploymentFilter::with_statuses(&[
                DeploymentStatus::Healthy,
                DeploymentStatus::Starting,
            ]))
            .await?;

        for deployment in claiming {
            let alive = deployment
                .container_id
                .as_ref()
                .map(|id| live.contains(id))
                .unwrap_or(false);
            if alive {
                continue;
            }

            warn!(
                deployment_id = %deployment.id,
                subdomain = %deployment.subdomain,
                container_id = ?deployment.container_id,
                "Zombie deployment, container vanished"
            );
            let update = DeploymentUpdate {
                status: Some(DeploymentStatus::Error),
                error_message: Some(Some("Container died unexpectedly".to_string())),
                container_id: Some(None),
                internal_port: Some(None),
                ..Default::default()
            };
            // CAS on the observed status so a concurrent stop/remove wins.
            if let Err(e) = self
                .persistence
                .update_deployment(&deployment.id, &update, Some(deployment.status))
                .await
            {
                warn!(deployment_id = %deployment.id, error = %e, "Zombie update failed");
            }
        }

        Ok(())
    }

    /// Pass 2: hibernate healthy deployments with no recent traffic.
    async fn hibernate_idle(&self) -> crate::error::Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.idle_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));

        let idle = self
            .persistence
            .list_deployments(&DeploymentFilter {
                statuses: Some(vec![DeploymentStatus::Healthy]),
                last_request_before: Some(cutoff),
                ..Default::default()
            })
            .await?;

        if idle.is_empty() {
            debug!("No idle deployments to hibernate");
            return Ok(());
        }

        info!(count = idle.len(), "Hibernating idle deployments");

        for deployment in idle {
            self.teardown_container(deployment.container_id.as_deref()).await;

            let update = DeploymentUpdate {
                status: Some(DeploymentStatus::Stopped),
                container_id: Some(None),
                internal_port: Some(None),
                ..Default::default()
            };
            match self
                .persistence
                .update_deployment(&deployment.id, &update, Some(DeploymentStatus::Healthy))
                .await
            {
                Ok(true) => {
                    info!(
                        deployment_id = %deployment.id,
                        subdomain = %deployment.subdomain,
                        "Hibernated idle deployment"
                    );
                }
                Ok(false) => {
                    debug!(deployment_id = %deployment.id, "Hibernate lost a status race");
                }
                Err(e) => {
                    warn!(deployment_id = %deployment.id, error = %e, "Hibernate update failed");
                }
            }

            // Rate-limit runtime calls.
            tokio::time::sleep(self.config.hibernate_pause).await;
        }

        Ok(())
    }

    /// Pass 3: expire lapsed subscriptions and tear their agents down.
    async fn expire_subscriptions(&self) -> crate::error::Result<()> {
        let now = Utc::now();
        let expired = self.persistence.list_expired_active_users(now).await?;

        for user in expired {
            info!(user_id = %user.id, email = %user.email, "Subscription expired");

            self.persistence
                .update_user(
                    &user.id,
                    &UserUpdate {
                        subscription_status: Some(SubscriptionStatus::Expired),
                        max_agents: Some(0),
                        ..Default::default()
                    },
                )
                .await?;

            if let Err(e) = self.mailer.send_subscription_expired(&user).await {
                warn!(user_id = %user.id, error = %e, "Expired notification failed");
            }

            let running = self
                .persistence
                .list_deployments(&DeploymentFilter {
                    user_id: Some(user.id.clone()),
                    statuses: Some(vec![
                        DeploymentStatus::Healthy,
                        DeploymentStatus::Starting,
                        DeploymentStatus::Provisioning,
                    ]),
                    ..Default::default()
                })
                .await?;

            for deployment in running {
                self.teardown_container(deployment.container_id.as_deref()).await;

                let update = DeploymentUpdate {
                    status: Some(DeploymentStatus::Stopped),
                    error_message: Some(Some("Subscription expired".to_string())),
                    container_id: Some(None),
                    internal_port: Some(None),
                    ..Default::default()
                };
                if let Err(e) = self
                    .persistence
                    .update_deployment(&deployment.id, &update, None)
                    .await
                {
                    warn!(deployment_id = %deployment.id, error = %e, "Expiry teardown update failed");
                }
            }
        }

        Ok(())
    }

    /// Pass 4: one reminder per user per subscription period.
    async fn send_reminders(&self) -> crate::error::Result<()> {
        let now = Utc::now();
        let due = self
            .persistence
            .list_users_due_reminder(now, self.config.reminder_window)
            .await?;

        for user in due {
            let Some(expires_at) = user.subscription_expires_at else {
                continue;
            };
            let seconds_left = (expires_at - now).num_seconds().max(0);
            let days_left = (seconds_left + 86_399) / 86_400;

            match self.mailer.send_expiry_reminder(&user, days_left).await {
                Ok(()) => {
                    self.persistence
                        .update_user(
                            &user.id,
                            &UserUpdate {
                                expiry_reminder_sent: Some(true),
                                ..Default::default()
                            },
                        )
                        .await?;
                    info!(user_id = %user.id, days_left = days_left, "Expiry reminder sent");
                }
                Err(e) => {
                    // Not marked sent; retried next cycle.
                    warn!(user_id = %user.id, error = %e, "Expiry reminder failed");
                }
            }
        }

        Ok(())
    }

    /// Best-effort stop-then-remove of a container.
    async fn teardown_container(&self, container_id: Option<&str>) {
        let Some(container_id) = container_id else {
            return;
        };
        if let Err(e) = self
            .runtime
            .stop_container(container_id, self.config.stop_grace)
            .await
        {
            debug!(container_id = %container_id, error = %e, "Teardown stop failed");
        }
        if let Err(e) = self.runtime.remove_container(container_id, true).await {
            debug!(container_id = %container_id, error = %e, "Teardown remove failed");
        }
    }
}
