// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The `Deployment` and `User` records.
//!
//! These are the only two record types the control plane persists. A
//! deployment is a tenant's agent instance; a user is the tenant identity
//! carrying the subscription that gates it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::is_encrypted;
use crate::error::Error;
use crate::status::DeploymentStatus;

/// Per-vendor credentials and the gateway auth token for one deployment.
///
/// At rest every field is an `iv:tag:ciphertext` hex triple; the plaintext
/// form only exists transiently in the orchestrator and wake paths. The
/// `Debug` impl never prints field values.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSecrets {
    /// OpenAI API key, if the tenant configured one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
    /// Anthropic API key, if the tenant configured one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anthropic_api_key: Option<String>,
    /// Google API key, if the tenant configured one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub google_api_key: Option<String>,
    /// Telegram bot token, if the tenant connected Telegram.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_bot_token: Option<String>,
    /// Token protecting the agent's web UI / gateway endpoint.
    pub web_ui_token: String,
}

impl DeploymentSecrets {
    /// Returns the name of the first field holding a non-triple value, or
    /// `None` when the document is fully encrypted.
    ///
    /// The persistence backends call this before every write: plaintext at
    /// rest is an integrity failure, not something to silently re-encrypt.
    pub fn first_plaintext_field(&self) -> Option<&'static str> {
        let fields: [(&'static str, Option<&String>); 5] = [
            ("openaiApiKey", self.openai_api_key.as_ref()),
            ("anthropicApiKey", self.anthropic_api_key.as_ref()),
            ("googleApiKey", self.google_api_key.as_ref()),
            ("telegramBotToken", self.telegram_bot_token.as_ref()),
            ("webUiToken", Some(&self.web_ui_token)),
        ];
        for (name, value) in fields {
            if let Some(v) = value {
                if !is_encrypted(v) {
                    return Some(name);
                }
            }
        }
        None
    }

    /// Error unless every present field is in encrypted triple form.
    pub fn ensure_encrypted(&self) -> Result<(), Error> {
        match self.first_plaintext_field() {
            Some(field) => Err(Error::PlaintextSecret(field)),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for DeploymentSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentSecrets")
            .field("openai_api_key", &self.openai_api_key.as_ref().map(|_| "[REDACTED]"))
            .field("anthropic_api_key", &self.anthropic_api_key.as_ref().map(|_| "[REDACTED]"))
            .field("google_api_key", &self.google_api_key.as_ref().map(|_| "[REDACTED]"))
            .field("telegram_bot_token", &self.telegram_bot_token.as_ref().map(|_| "[REDACTED]"))
            .field("web_ui_token", &"[REDACTED]")
            .finish()
    }
}

/// Agent configuration chosen by the tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Model identifier in `vendor/name` form.
    pub model: String,
    /// System prompt prepended to every agent conversation.
    pub system_prompt: String,
}

/// A tenant's agent instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    /// Unique identifier.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Globally unique lowercase subdomain the proxy routes on.
    pub subdomain: String,
    /// Lifecycle status.
    pub status: DeploymentStatus,
    /// Container ID in the runtime, when one exists.
    pub container_id: Option<String>,
    /// Host port the runtime publishes the agent on. The name is
    /// historical; the port is bindable on the host.
    pub internal_port: Option<u16>,
    /// Encrypted credentials.
    pub secrets: DeploymentSecrets,
    /// Agent configuration.
    pub config: AgentConfig,
    /// Last heartbeat observed from the agent.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Last time the proxy saw traffic for this deployment.
    pub last_request_at: Option<DateTime<Utc>>,
    /// Diagnostic message for the `error` status.
    pub error_message: Option<String>,
    /// Human-readable progress text during provisioning (advisory).
    pub provisioning_step: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// Create a fresh `idle` deployment.
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        subdomain: impl Into<String>,
        secrets: DeploymentSecrets,
        config: AgentConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            subdomain: subdomain.into(),
            status: DeploymentStatus::Idle,
            container_id: None,
            internal_port: None,
            secrets,
            config,
            last_heartbeat: None,
            last_request_at: None,
            error_message: None,
            provisioning_step: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// How the user authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProvider {
    /// Email + password.
    Email,
    /// Google OAuth.
    Google,
}

impl AuthProvider {
    /// The canonical lowercase string for this provider.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthProvider::Email => "email",
            AuthProvider::Google => "google",
        }
    }
}

/// Subscription state of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    /// Never subscribed.
    Inactive,
    /// Paid and current.
    Active,
    /// Lapsed; the reaper has torn the agents down.
    Expired,
    /// Cancelled by the user; runs until the period end.
    Canceled,
}

impl SubscriptionStatus {
    /// The canonical lowercase string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Canceled => "canceled",
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(SubscriptionStatus::Inactive),
            "active" => Ok(SubscriptionStatus::Active),
            "expired" => Ok(SubscriptionStatus::Expired),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            other => Err(format!("unknown subscription status: {other}")),
        }
    }
}

/// Subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// The single paid plan.
    Starter,
}

/// A tenant identity and its subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Unique identifier.
    pub id: String,
    /// Unique lowercase email address.
    pub email: String,
    /// Password hash, for email-auth users.
    pub password_hash: Option<String>,
    /// Google account ID, for Google-auth users.
    pub google_id: Option<String>,
    /// How this user authenticates.
    pub auth_provider: AuthProvider,
    /// Subscription state.
    pub subscription_status: SubscriptionStatus,
    /// Subscription tier, when subscribed.
    pub tier: Option<Tier>,
    /// When the current subscription period ends.
    pub subscription_expires_at: Option<DateTime<Utc>>,
    /// Whether the expiry reminder email for the current period was sent.
    pub expiry_reminder_sent: bool,
    /// Maximum number of deployments this user may run.
    pub max_agents: i32,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Create a fresh inactive email-auth user.
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            email: email.into().to_lowercase(),
            password_hash: None,
            google_id: None,
            auth_provider: AuthProvider::Email,
            subscription_status: SubscriptionStatus::Inactive,
            tier: None,
            subscription_expires_at: None,
            expiry_reminder_sent: false,
            max_agents: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
