// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for warden-core.

use thiserror::Error;

use crate::status::DeploymentStatus;

/// Core errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Secret encryption/decryption failed.
    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),

    /// Input validation failed.
    #[error(transparent)]
    Validation(#[from] crate::validate::ValidationError),

    /// Deployment was not found.
    #[error("Deployment not found: {0}")]
    DeploymentNotFound(String),

    /// User was not found.
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// The requested status change is not in the transition table.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        /// Status the deployment is currently in.
        from: DeploymentStatus,
        /// Status the caller asked for.
        to: DeploymentStatus,
    },

    /// A compare-and-swap update lost to a concurrent writer.
    #[error("Conflicting update: {0}")]
    Conflict(String),

    /// The subdomain is already taken by another deployment.
    #[error("Subdomain already taken: {0}")]
    SubdomainTaken(String),

    /// A secret field reached the persistence layer unencrypted.
    ///
    /// Plaintext at rest is an integrity failure; secrets must be encrypted
    /// before they are handed to a persistence backend.
    #[error("Refusing to store plaintext secret field: {0}")]
    PlaintextSecret(&'static str),
}

/// Result type using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
