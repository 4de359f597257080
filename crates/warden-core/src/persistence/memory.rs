// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence backend.
//!
//! Enforces the same invariants as the PostgreSQL backend (unique
//! subdomains, unique non-null ports, encrypted secrets, status
//! compare-and-swap) so orchestrator, proxy, and reaper logic can be
//! exercised without a database.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::model::{Deployment, SubscriptionStatus, User};
use crate::status::DeploymentStatus;

use super::{DeploymentFilter, DeploymentUpdate, Persistence, UserUpdate};

#[derive(Default)]
struct Inner {
    deployments: HashMap<String, Deployment>,
    users: HashMap<String, User>,
}

/// In-memory [`Persistence`] backend.
#[derive(Default)]
pub struct MemoryPersistence {
    inner: RwLock<Inner>,
}

impl MemoryPersistence {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches(deployment: &Deployment, filter: &DeploymentFilter) -> bool {
    if let Some(user_id) = &filter.user_id {
        if &deployment.user_id != user_id {
            return false;
        }
    }
    if let Some(statuses) = &filter.statuses {
        if !statuses.contains(&deployment.status) {
            return false;
        }
    }
    if let Some(has_container) = filter.has_container {
        if deployment.container_id.is_some() != has_container {
            return false;
        }
    }
    if let Some(cutoff) = filter.last_request_before {
        if let Some(at) = deployment.last_request_at {
            if at >= cutoff {
                return false;
            }
        }
        // Absent counts as idle.
    }
    true
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn insert_deployment(&self, deployment: &Deployment) -> Result<()> {
        deployment.secrets.ensure_encrypted()?;
        let mut inner = self.inner.write().await;
        if inner
            .deployments
            .values()
            .any(|d| d.subdomain == deployment.subdomain)
        {
            return Err(Error::SubdomainTaken(deployment.subdomain.clone()));
        }
        if let Some(port) = deployment.internal_port {
            if inner
                .deployments
                .values()
                .any(|d| d.internal_port == Some(port))
            {
                return Err(Error::Conflict(format!("port {port} already assigned")));
            }
        }
        inner
            .deployments
            .insert(deployment.id.clone(), deployment.clone());
        Ok(())
    }

    async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>> {
        Ok(self.inner.read().await.deployments.get(id).cloned())
    }

    async fn find_deployment_by_subdomain(&self, subdomain: &str) -> Result<Option<Deployment>> {
        Ok(self
            .inner
            .read()
            .await
            .deployments
            .values()
            .find(|d| d.subdomain == subdomain)
            .cloned())
    }

    async fn list_deployments(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>> {
        let mut out: Vec<Deployment> = self
            .inner
            .read()
            .await
            .deployments
            .values()
            .filter(|d| matches(d, filter))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn count_deployments(&self, filter: &DeploymentFilter) -> Result<u64> {
        Ok(self
            .inner
            .read()
            .await
            .deployments
            .values()
            .filter(|d| matches(d, filter))
            .count() as u64)
    }

    async fn update_deployment(
        &self,
        id: &str,
        update: &DeploymentUpdate,
        expected_status: Option<DeploymentStatus>,
    ) -> Result<bool> {
        if let Some(secrets) = &update.secrets {
            secrets.ensure_encrypted()?;
        }
        let mut inner = self.inner.write().await;

        // The unique-port invariant holds across all rows, so check before
        // taking the mutable borrow.
        if let Some(Some(port)) = update.internal_port {
            if inner
                .deployments
                .values()
                .any(|d| d.id != id && d.internal_port == Some(port))
            {
                return Err(Error::Conflict(format!("port {port} already assigned")));
            }
        }

        let Some(deployment) = inner.deployments.get_mut(id) else {
            return Ok(false);
        };
        if let Some(expected) = expected_status {
            if deployment.status != expected {
                return Ok(false);
            }
        }
        update.apply_to(deployment);
        Ok(true)
    }

    async fn reserve_port(&self, id: &str, port: u16) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner
            .deployments
            .values()
            .any(|d| d.id != id && d.internal_port == Some(port))
        {
            return Ok(false);
        }
        let Some(deployment) = inner.deployments.get_mut(id) else {
            return Ok(false);
        };
        if deployment.status != DeploymentStatus::Configuring {
            return Ok(false);
        }
        deployment.internal_port = Some(port);
        deployment.updated_at = Utc::now();
        Ok(true)
    }

    async fn touch_last_request(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(deployment) = inner.deployments.get_mut(id) else {
            return Ok(false);
        };
        if deployment.status != DeploymentStatus::Healthy {
            return Ok(false);
        }
        deployment.last_request_at = Some(at);
        deployment.updated_at = Utc::now();
        Ok(true)
    }

    async fn delete_deployment(&self, id: &str) -> Result<bool> {
        Ok(self.inner.write().await.deployments.remove(id).is_some())
    }

    async fn insert_user(&self, user: &User) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.users.values().any(|u| u.email == user.email) {
            return Err(Error::Conflict(format!("email {} already registered", user.email)));
        }
        inner.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        Ok(self.inner.read().await.users.get(id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .inner
            .read()
            .await
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn find_user_by_google_id(&self, google_id: &str) -> Result<Option<User>> {
        Ok(self
            .inner
            .read()
            .await
            .users
            .values()
            .find(|u| u.google_id.as_deref() == Some(google_id))
            .cloned())
    }

    async fn update_user(&self, id: &str, update: &UserUpdate) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(user) = inner.users.get_mut(id) else {
            return Ok(false);
        };
        if let Some(status) = update.subscription_status {
            user.subscription_status = status;
        }
        if let Some(tier) = update.tier {
            user.tier = tier;
        }
        if let Some(expires_at) = update.subscription_expires_at {
            user.subscription_expires_at = expires_at;
        }
        if let Some(sent) = update.expiry_reminder_sent {
            user.expiry_reminder_sent = sent;
        }
        if let Some(max_agents) = update.max_agents {
            user.max_agents = max_agents;
        }
        user.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_expired_active_users(&self, now: DateTime<Utc>) -> Result<Vec<User>> {
        Ok(self
            .inner
            .read()
            .await
            .users
            .values()
            .filter(|u| {
                u.subscription_status == SubscriptionStatus::Active
                    && u.subscription_expires_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect())
    }

    async fn list_users_due_reminder(&self, now: DateTime<Utc>, window: Duration) -> Result<Vec<User>> {
        let horizon = now + window;
        Ok(self
            .inner
            .read()
            .await
            .users
            .values()
            .filter(|u| {
                u.subscription_status == SubscriptionStatus::Active
                    && !u.expiry_reminder_sent
                    && u.subscription_expires_at
                        .is_some_and(|at| at > now && at <= horizon)
            })
            .cloned()
            .collect())
    }
}
