// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence backend.
//!
//! Status-guarded writes compare-and-swap on the status column; the partial
//! unique index on `internal_port` is the authoritative collision guard for
//! port reservation. Secrets documents are stored as JSONB and are rejected
//! before the write when any field is not in encrypted triple form.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::model::{AgentConfig, AuthProvider, Deployment, DeploymentSecrets, SubscriptionStatus, Tier, User};
use crate::status::DeploymentStatus;

use super::{DeploymentFilter, DeploymentUpdate, Persistence, UserUpdate};

/// PostgreSQL [`Persistence`] backend.
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a backend over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the schema (idempotent).
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../../migrations/schema.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct DeploymentRow {
    id: String,
    user_id: String,
    subdomain: String,
    status: String,
    container_id: Option<String>,
    internal_port: Option<i32>,
    secrets: serde_json::Value,
    config: serde_json::Value,
    last_heartbeat: Option<DateTime<Utc>>,
    last_request_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    provisioning_step: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeploymentRow> for Deployment {
    type Error = Error;

    fn try_from(row: DeploymentRow) -> Result<Self> {
        let status = DeploymentStatus::from_str(&row.status)
            .map_err(Error::Conflict)?;
        let secrets: DeploymentSecrets = serde_json::from_value(row.secrets)?;
        let config: AgentConfig = serde_json::from_value(row.config)?;
        Ok(Deployment {
            id: row.id,
            user_id: row.user_id,
            subdomain: row.subdomain,
            status,
            container_id: row.container_id,
            internal_port: row.internal_port.map(|p| p as u16),
            secrets,
            config,
            last_heartbeat: row.last_heartbeat,
            last_request_at: row.last_request_at,
            error_message: row.error_message,
            provisioning_step: row.provisioning_step,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    email: String,
    password_hash: Option<String>,
    google_id: Option<String>,
    auth_provider: String,
    subscription_status: String,
    tier: Option<String>,
    subscription_expires_at: Option<DateTime<Utc>>,
    expiry_reminder_sent: bool,
    max_agents: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = Error;

    fn try_from(row: UserRow) -> Result<Self> {
        let auth_provider = match row.auth_provider.as_str() {
            "google" => AuthProvider::Google,
            _ => AuthProvider::Email,
        };
        let subscription_status =
            SubscriptionStatus::from_str(&row.subscription_status).map_err(Error::Conflict)?;
        let tier = match row.tier.as_deref() {
            Some("starter") => Some(Tier::Starter),
            _ => None,
        };
        Ok(User {
            id: row.id,
            email: row.email,
            password_hash: row.password_hash,
            google_id: row.google_id,
            auth_provider,
            subscription_status,
            tier,
            subscription_expires_at: row.subscription_expires_at,
            expiry_reminder_sent: row.expiry_reminder_sent,
            max_agents: row.max_agents,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const DEPLOYMENT_COLUMNS: &str = "id, user_id, subdomain, status, container_id, internal_port, \
     secrets, config, last_heartbeat, last_request_at, error_message, provisioning_step, \
     created_at, updated_at";

const USER_COLUMNS: &str = "id, email, password_hash, google_id, auth_provider, \
     subscription_status, tier, subscription_expires_at, expiry_reminder_sent, max_agents, \
     created_at, updated_at";

fn statuses_as_strings(statuses: &Option<Vec<DeploymentStatus>>) -> Option<Vec<String>> {
    statuses
        .as_ref()
        .map(|s| s.iter().map(|status| status.as_str().to_string()).collect())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn insert_deployment(&self, deployment: &Deployment) -> Result<()> {
        deployment.secrets.ensure_encrypted()?;
        let result = sqlx::query(
            r#"
            INSERT INTO deployments (
                id, user_id, subdomain, status, container_id, internal_port,
                secrets, config, last_heartbeat, last_request_at,
                error_message, provisioning_step, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&deployment.id)
        .bind(&deployment.user_id)
        .bind(&deployment.subdomain)
        .bind(deployment.status.as_str())
        .bind(&deployment.container_id)
        .bind(deployment.internal_port.map(|p| p as i32))
        .bind(serde_json::to_value(&deployment.secrets)?)
        .bind(serde_json::to_value(&deployment.config)?)
        .bind(deployment.last_heartbeat)
        .bind(deployment.last_request_at)
        .bind(&deployment.error_message)
        .bind(&deployment.provisioning_step)
        .bind(deployment.created_at)
        .bind(deployment.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(Error::SubdomainTaken(deployment.subdomain.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>> {
        let row = sqlx::query_as::<_, DeploymentRow>(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Deployment::try_from).transpose()
    }

    async fn find_deployment_by_subdomain(&self, subdomain: &str) -> Result<Option<Deployment>> {
        let row = sqlx::query_as::<_, DeploymentRow>(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE subdomain = $1"
        ))
        .bind(subdomain)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Deployment::try_from).transpose()
    }

    async fn list_deployments(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>> {
        let rows = sqlx::query_as::<_, DeploymentRow>(&format!(
            r#"
            SELECT {DEPLOYMENT_COLUMNS} FROM deployments
            WHERE ($1::TEXT IS NULL OR user_id = $1)
              AND ($2::TEXT[] IS NULL OR status = ANY($2))
              AND ($3::BOOL IS NULL OR (container_id IS NOT NULL) = $3)
              AND ($4::TIMESTAMPTZ IS NULL
                   OR last_request_at IS NULL
                   OR last_request_at < $4)
            ORDER BY created_at ASC
            "#
        ))
        .bind(&filter.user_id)
        .bind(statuses_as_strings(&filter.statuses))
        .bind(filter.has_container)
        .bind(filter.last_request_before)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Deployment::try_from).collect()
    }

    async fn count_deployments(&self, filter: &DeploymentFilter) -> Result<u64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM deployments
            WHERE ($1::TEXT IS NULL OR user_id = $1)
              AND ($2::TEXT[] IS NULL OR status = ANY($2))
              AND ($3::BOOL IS NULL OR (container_id IS NOT NULL) = $3)
              AND ($4::TIMESTAMPTZ IS NULL
                   OR last_request_at IS NULL
                   OR last_request_at < $4)
            "#,
        )
        .bind(&filter.user_id)
        .bind(statuses_as_strings(&filter.statuses))
        .bind(filter.has_container)
        .bind(filter.last_request_before)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 as u64)
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

        // Read-merge-write with a compare-and-swap on the status column.
        // When the caller did not pin an expected status, a lost race is
        // retried against the fresh row.
        for _ in 0..3 {
            let Some(current) = self.get_deployment(id).await? else {
                return Ok(false);
            };
            if let Some(expected) = expected_status {
                if current.status != expected {
                    return Ok(false);
                }
            }

            let mut merged = current.clone();
            update.apply_to(&mut merged);

            let result = sqlx::query(
                r#"
                UPDATE deployments SET
                    status = $2,
                    container_id = $3,
                    internal_port = $4,
                    secrets = $5,
                    config = $6,
                    last_heartbeat = $7,
                    last_request_at = $8,
                    error_message = $9,
                    provisioning_step = $10,
                    updated_at = NOW()
                WHERE id = $1 AND status = $11
                "#,
            )
            .bind(id)
            .bind(merged.status.as_str())
            .bind(&merged.container_id)
            .bind(merged.internal_port.map(|p| p as i32))
            .bind(serde_json::to_value(&merged.secrets)?)
            .bind(serde_json::to_value(&merged.config)?)
            .bind(merged.last_heartbeat)
            .bind(merged.last_request_at)
            .bind(&merged.error_message)
            .bind(&merged.provisioning_step)
            .bind(current.status.as_str())
            .execute(&self.pool)
            .await;

            match result {
                Ok(done) if done.rows_affected() > 0 => return Ok(true),
                Ok(_) => {
                    // Lost a status race. With a pinned expectation that is
                    // a CAS failure; without one, retry on the fresh row.
                    if expected_status.is_some() {
                        return Ok(false);
                    }
                }
                Err(e) if is_unique_violation(&e) => {
                    return Err(Error::Conflict(format!(
                        "unique index violation updating deployment {id}"
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    async fn reserve_port(&self, id: &str, port: u16) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE deployments SET internal_port = $2, updated_at = NOW() \
             WHERE id = $1 AND status = 'configuring'",
        )
        .bind(id)
        .bind(port as i32)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn touch_last_request(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE deployments SET last_request_at = $2, updated_at = NOW() \
             WHERE id = $1 AND status = 'healthy'",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn delete_deployment(&self, id: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM deployments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn insert_user(&self, user: &User) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO users (
                id, email, password_hash, google_id, auth_provider,
                subscription_status, tier, subscription_expires_at,
                expiry_reminder_sent, max_agents, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.google_id)
        .bind(user.auth_provider.as_str())
        .bind(user.subscription_status.as_str())
        .bind(user.tier.map(|_| "starter"))
        .bind(user.subscription_expires_at)
        .bind(user.expiry_reminder_sent)
        .bind(user.max_agents)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::Conflict(format!(
                "email {} already registered",
                user.email
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }

    async fn find_user_by_google_id(&self, google_id: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE google_id = $1"
        ))
        .bind(google_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }

    async fn update_user(&self, id: &str, update: &UserUpdate) -> Result<bool> {
        let Some(mut user) = self.get_user(id).await? else {
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

        let done = sqlx::query(
            r#"
            UPDATE users SET
                subscription_status = $2,
                tier = $3,
                subscription_expires_at = $4,
                expiry_reminder_sent = $5,
                max_agents = $6,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(user.subscription_status.as_str())
        .bind(user.tier.map(|_| "starter"))
        .bind(user.subscription_expires_at)
        .bind(user.expiry_reminder_sent)
        .bind(user.max_agents)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn list_expired_active_users(&self, now: DateTime<Utc>) -> Result<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            SELECT {USER_COLUMNS} FROM users
            WHERE subscription_status = 'active'
              AND subscription_expires_at IS NOT NULL
              AND subscription_expires_at <= $1
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(User::try_from).collect()
    }

    async fn list_users_due_reminder(&self, now: DateTime<Utc>, window: Duration) -> Result<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            SELECT {USER_COLUMNS} FROM users
            WHERE subscription_status = 'active'
              AND expiry_reminder_sent = FALSE
              AND subscription_expires_at IS NOT NULL
              AND subscription_expires_at > $1
              AND subscription_expires_at <= $2
            "#
        ))
        .bind(now)
        .bind(now + window)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(User::try_from).collect()
    }
}
