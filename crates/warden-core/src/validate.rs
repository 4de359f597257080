// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Input validation and model name normalization.
//!
//! Everything here runs before the orchestrator accepts a request: subdomain
//! shape, API key formats, and the requested model against the credentials
//! that are actually present.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

use crate::model::DeploymentSecrets;

/// Subdomain shape: lowercase alphanumeric edges, dashes/underscores inside.
static SUBDOMAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-_]*[a-z0-9]$").unwrap());

static GOOGLE_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^AIza[0-9A-Za-z\-_]{35}$").unwrap());

static OPENAI_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sk-[a-zA-Z0-9]{48,}$").unwrap());

static ANTHROPIC_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sk-ant-[a-zA-Z0-9\-_]{95,}$").unwrap());

static TELEGRAM_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{8,10}:[a-zA-Z0-9_-]{35}$").unwrap());

/// First labels that never resolve to a tenant deployment.
pub const RESERVED_LABELS: [&str; 6] = ["www", "api", "app", "admin", "dashboard", "auth"];

/// Minimum subdomain length.
pub const SUBDOMAIN_MIN_LEN: usize = 3;

/// Maximum subdomain length.
pub const SUBDOMAIN_MAX_LEN: usize = 63;

/// Deprecated model names and their successors, applied before any other
/// model check.
const DEPRECATED_MODELS: [(&str, &str); 4] = [
    ("google/gemini-2.5-pro", "google/gemini-3-pro-preview"),
    ("google/gemini-2.5-flash", "google/gemini-3-flash-preview"),
    ("anthropic/claude-3-5-sonnet", "anthropic/claude-sonnet-4-5"),
    ("openai/gpt-4o", "openai/gpt-5"),
];

/// Default model per vendor, tried in this order when no model is requested.
const VENDOR_DEFAULTS: [(&str, &str); 3] = [
    ("google", "google/gemini-3-pro-preview"),
    ("anthropic", "anthropic/claude-sonnet-4-5"),
    ("openai", "openai/gpt-5"),
];

/// Validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    /// Subdomain does not match the canonical shape.
    #[error(
        "Invalid subdomain '{0}': must be {SUBDOMAIN_MIN_LEN}-{SUBDOMAIN_MAX_LEN} lowercase \
         alphanumeric characters, dashes, or underscores, starting and ending alphanumeric"
    )]
    InvalidSubdomain(String),

    /// Subdomain collides with a reserved first label.
    #[error("Subdomain '{0}' is reserved")]
    ReservedSubdomain(String),

    /// An API key does not match its vendor's format.
    #[error("Malformed {vendor} API key")]
    InvalidApiKey {
        /// Vendor whose key format was violated.
        vendor: &'static str,
    },

    /// No model was requested and no credential is present to pick a
    /// default from.
    #[error("No model specified and no API key available to choose a default")]
    NoModel,

    /// The requested model's vendor has no matching credential.
    #[error("Model '{model}' requires a {vendor} API key")]
    ModelKeyMismatch {
        /// The model that was requested (after alias translation).
        model: String,
        /// Vendor whose key is missing.
        vendor: String,
    },
}

/// Validate a tenant subdomain: shape, length, case, and reserved labels.
pub fn validate_subdomain(subdomain: &str) -> Result<(), ValidationError> {
    if subdomain.len() < SUBDOMAIN_MIN_LEN
        || subdomain.len() > SUBDOMAIN_MAX_LEN
        || !SUBDOMAIN_RE.is_match(subdomain)
    {
        return Err(ValidationError::InvalidSubdomain(subdomain.to_string()));
    }
    if is_reserved_label(subdomain) {
        return Err(ValidationError::ReservedSubdomain(subdomain.to_string()));
    }
    Ok(())
}

/// Whether a Host first label is reserved for the platform itself.
pub fn is_reserved_label(label: &str) -> bool {
    RESERVED_LABELS.contains(&label)
}

/// Validate the format of every key present in a plaintext secrets document.
pub fn validate_secret_formats(secrets: &DeploymentSecrets) -> Result<(), ValidationError> {
    if let Some(key) = &secrets.google_api_key {
        if !GOOGLE_KEY_RE.is_match(key) {
            return Err(ValidationError::InvalidApiKey { vendor: "google" });
        }
    }
    if let Some(key) = &secrets.openai_api_key {
        if !OPENAI_KEY_RE.is_match(key) {
            return Err(ValidationError::InvalidApiKey { vendor: "openai" });
        }
    }
    if let Some(key) = &secrets.anthropic_api_key {
        if !ANTHROPIC_KEY_RE.is_match(key) {
            return Err(ValidationError::InvalidApiKey { vendor: "anthropic" });
        }
    }
    if let Some(token) = &secrets.telegram_bot_token {
        if !TELEGRAM_TOKEN_RE.is_match(token) {
            return Err(ValidationError::InvalidApiKey { vendor: "telegram" });
        }
    }
    Ok(())
}

fn vendor_key_present(vendor: &str, secrets: &DeploymentSecrets) -> bool {
    match vendor {
        "google" => secrets.google_api_key.is_some(),
        "anthropic" => secrets.anthropic_api_key.is_some(),
        "openai" => secrets.openai_api_key.is_some(),
        _ => false,
    }
}

/// Resolve the model to run, given the tenant's request and their
/// (plaintext) credentials.
///
/// Deprecated aliases are translated first. With no request, the first
/// vendor default whose key is present wins (google, then anthropic, then
/// openai). A request whose vendor prefix has no matching key fails.
pub fn normalize_model(
    requested: Option<&str>,
    secrets: &DeploymentSecrets,
) -> Result<String, ValidationError> {
    let requested = requested.filter(|m| !m.trim().is_empty()).map(|m| {
        DEPRECATED_MODELS
            .iter()
            .find(|(old, _)| *old == m)
            .map(|(_, new)| *new)
            .unwrap_or(m)
    });

    let Some(model) = requested else {
        return VENDOR_DEFAULTS
            .iter()
            .find(|(vendor, _)| vendor_key_present(vendor, secrets))
            .map(|(_, default)| default.to_string())
            .ok_or(ValidationError::NoModel);
    };

    let vendor = model.split('/').next().unwrap_or_default();
    if !vendor_key_present(vendor, secrets) {
        return Err(ValidationError::ModelKeyMismatch {
            model: model.to_string(),
            vendor: vendor.to_string(),
        });
    }

    Ok(model.to_string())
}
