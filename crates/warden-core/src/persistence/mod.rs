// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for warden-core.
//!
//! The control plane never holds locks across storage operations; every
//! status-sensitive write is a compare-and-swap on the current status, and
//! the partial unique index on `internal_port` is the final guard against
//! port collisions. Two backends exist: [`PostgresPersistence`] for the
//! service and [`MemoryPersistence`] for tests and embedded use.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryPersistence;
pub use self::postgres::PostgresPersistence;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::{AgentConfig, Deployment, DeploymentSecrets, Tier, User};
use crate::status::DeploymentStatus;

/// Filter for listing and counting deployments.
///
/// All fields are conjunctive; `None` means "don't care".
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    /// Restrict to one owner.
    pub user_id: Option<String>,
    /// Restrict to any of these statuses.
    pub statuses: Option<Vec<DeploymentStatus>>,
    /// Require `container_id` to be set (`true`) or unset (`false`).
    pub has_container: Option<bool>,
    /// Match deployments whose `last_request_at` is earlier than this
    /// cutoff **or absent** (a deployment that never served a request is
    /// as idle as one that went quiet).
    pub last_request_before: Option<DateTime<Utc>>,
}

impl DeploymentFilter {
    /// Filter matching the statuses that count against fleet capacity,
    /// with a container attached.
    pub fn running_like() -> Self {
        Self {
            statuses: Some(DeploymentStatus::RUNNING_LIKE.to_vec()),
            has_container: Some(true),
            ..Default::default()
        }
    }

    /// Filter matching a set of statuses.
    pub fn with_statuses(statuses: &[DeploymentStatus]) -> Self {
        Self {
            statuses: Some(statuses.to_vec()),
            ..Default::default()
        }
    }
}

/// Partial update of a deployment record.
///
/// Outer `None` leaves the field untouched; for nullable columns the inner
/// option distinguishes "set" from "clear".
#[derive(Debug, Clone, Default)]
pub struct DeploymentUpdate {
    /// New status. `update_deployment` applies this without consulting the
    /// transition table; table-guarded moves go through
    /// [`Persistence::transition`].
    pub status: Option<DeploymentStatus>,
    /// Set or clear the container ID.
    pub container_id: Option<Option<String>>,
    /// Set or clear the published host port.
    pub internal_port: Option<Option<u16>>,
    /// Set or clear the error message.
    pub error_message: Option<Option<String>>,
    /// Set or clear the provisioning progress text.
    pub provisioning_step: Option<Option<String>>,
    /// Set or clear the last heartbeat timestamp.
    pub last_heartbeat: Option<Option<DateTime<Utc>>>,
    /// Set or clear the last request timestamp.
    pub last_request_at: Option<Option<DateTime<Utc>>>,
    /// Replace the secrets document (must be fully encrypted).
    pub secrets: Option<DeploymentSecrets>,
    /// Replace the agent configuration.
    pub config: Option<AgentConfig>,
}

impl DeploymentUpdate {
    /// Update that clears `container_id` and `internal_port`.
    pub fn clear_container_refs() -> Self {
        Self {
            container_id: Some(None),
            internal_port: Some(None),
            ..Default::default()
        }
    }

    /// Merge this update into a deployment record, stamping `updated_at`.
    pub fn apply_to(&self, deployment: &mut Deployment) {
        if let Some(status) = self.status {
            deployment.status = status;
        }
        if let Some(container_id) = &self.container_id {
            deployment.container_id = container_id.clone();
        }
        if let Some(internal_port) = self.internal_port {
            deployment.internal_port = internal_port;
        }
        if let Some(error_message) = &self.error_message {
            deployment.error_message = error_message.clone();
        }
        if let Some(provisioning_step) = &self.provisioning_step {
            deployment.provisioning_step = provisioning_step.clone();
        }
        if let Some(last_heartbeat) = self.last_heartbeat {
            deployment.last_heartbeat = last_heartbeat;
        }
        if let Some(last_request_at) = self.last_request_at {
            deployment.last_request_at = last_request_at;
        }
        if let Some(secrets) = &self.secrets {
            deployment.secrets = secrets.clone();
        }
        if let Some(config) = &self.config {
            deployment.config = config.clone();
        }
        deployment.updated_at = Utc::now();
    }
}

/// Partial update of a user record.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    /// New subscription status.
    pub subscription_status: Option<crate::model::SubscriptionStatus>,
    /// Set or clear the tier.
    pub tier: Option<Option<Tier>>,
    /// Set or clear the subscription expiry.
    pub subscription_expires_at: Option<Option<DateTime<Utc>>>,
    /// Mark the expiry reminder as sent (or reset it for a new period).
    pub expiry_reminder_sent: Option<bool>,
    /// New agent quota.
    pub max_agents: Option<i32>,
}

/// Persistence interface used by the orchestrator, proxy, and reaper.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Insert a new deployment. Fails with [`Error::SubdomainTaken`] on a
    /// subdomain collision and refuses plaintext secrets.
    async fn insert_deployment(&self, deployment: &Deployment) -> Result<()>;

    /// Fetch a deployment by ID.
    async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>>;

    /// Fetch a deployment by its unique subdomain.
    async fn find_deployment_by_subdomain(&self, subdomain: &str) -> Result<Option<Deployment>>;

    /// List deployments matching a filter.
    async fn list_deployments(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>>;

    /// Count deployments matching a filter.
    async fn count_deployments(&self, filter: &DeploymentFilter) -> Result<u64>;

    /// Apply a partial update, optionally compare-and-swapped on the
    /// current status. Returns whether a row was updated.
    async fn update_deployment(
        &self,
        id: &str,
        update: &DeploymentUpdate,
        expected_status: Option<DeploymentStatus>,
    ) -> Result<bool>;

    /// Reserve a host port for a deployment: sets `internal_port` only if
    /// the record is still `configuring`. Returns `false` when the record
    /// is gone, the status changed, or another deployment already holds
    /// the port (unique-index collision).
    async fn reserve_port(&self, id: &str, port: u16) -> Result<bool>;

    /// Update `last_request_at`, guarded on `status = healthy`. Returns
    /// whether the touch was applied.
    async fn touch_last_request(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Delete a deployment record. Returns whether it existed.
    async fn delete_deployment(&self, id: &str) -> Result<bool>;

    /// Insert a new user. Fails with [`Error::Conflict`] on a duplicate
    /// email.
    async fn insert_user(&self, user: &User) -> Result<()>;

    /// Fetch a user by ID.
    async fn get_user(&self, id: &str) -> Result<Option<User>>;

    /// Fetch a user by lowercase email.
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Fetch a user by Google account ID.
    async fn find_user_by_google_id(&self, google_id: &str) -> Result<Option<User>>;

    /// Apply a partial user update. Returns whether a row was updated.
    async fn update_user(&self, id: &str, update: &UserUpdate) -> Result<bool>;

    /// Users with an active subscription whose expiry is at or before `now`.
    async fn list_expired_active_users(&self, now: DateTime<Utc>) -> Result<Vec<User>>;

    /// Users with an active subscription expiring within `window` after
    /// `now` who have not yet received a reminder.
    async fn list_users_due_reminder(&self, now: DateTime<Utc>, window: Duration) -> Result<Vec<User>>;

    /// Perform a table-guarded status transition.
    ///
    /// Enforces the transition table (including the `-> error` / `-> idle`
    /// escape hatches, which are logged prominently when used), applies the
    /// side effects of reaching `healthy` (clear `error_message`, stamp
    /// `last_heartbeat` and `last_request_at`) and of entering a terminal
    /// status (clear container refs), and compare-and-swaps on the status
    /// that was read. Returns the updated record.
    async fn transition(&self, id: &str, to: DeploymentStatus) -> Result<Deployment> {
        let current = self
            .get_deployment(id)
            .await?
            .ok_or_else(|| Error::DeploymentNotFound(id.to_string()))?;

        if !current.status.can_transition(to) {
            return Err(Error::InvalidStateTransition {
                from: current.status,
                to,
            });
        }
        if !current.status.table_permits(to) {
            warn!(
                deployment_id = %id,
                from = %current.status,
                to = %to,
                "Status escape hatch used"
            );
        }

        let mut update = DeploymentUpdate {
            status: Some(to),
            ..Default::default()
        };
        if to == DeploymentStatus::Healthy {
            let now = Utc::now();
            update.error_message = Some(None);
            update.last_heartbeat = Some(Some(now));
            update.last_request_at = Some(Some(now));
        }
        if to.clears_container_refs() {
            update.container_id = Some(None);
            update.internal_port = Some(None);
        }

        let applied = self
            .update_deployment(id, &update, Some(current.status))
            .await?;
        if !applied {
            return Err(Error::Conflict(format!(
                "deployment {id} changed status during {} -> {} transition",
                current.status, to
            )));
        }

        self.get_deployment(id)
            .await?
            .ok_or_else(|| Error::DeploymentNotFound(id.to_string()))
    }

    /// Move a deployment to `error` with a diagnostic message, clearing its
    /// container refs. Always legal (escape hatch); never fails on a status
    /// race.
    async fn fail_deployment(&self, id: &str, message: &str) -> Result<()> {
        warn!(deployment_id = %id, error = %message, "Marking deployment as errored");
        let update = DeploymentUpdate {
            status: Some(DeploymentStatus::Error),
            error_message: Some(Some(message.to_string())),
            container_id: Some(None),
            internal_port: Some(None),
            provisioning_step: Some(None),
            ..Default::default()
        };
        self.update_deployment(id, &update, None).await?;
        Ok(())
    }
}
