// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for warden-gateway.
//!
//! Every error that can surface to a caller carries a stable wire code and
//! an HTTP status. The taxonomy follows four retry classes: validation and
//! state errors are never retried, capacity errors are retryable after
//! backoff, and integrity errors require operator intervention.

use thiserror::Error;
use warden_core::status::DeploymentStatus;

use crate::runtime::RuntimeError;

/// Gateway errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Core domain error (persistence, crypto, validation, state machine).
    #[error(transparent)]
    Core(#[from] warden_core::Error),

    /// Container runtime operation failed.
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The fleet is at its running-agent cap.
    #[error("Fleet at capacity: {running} of {max} agents running")]
    CapacityFull {
        /// Agents currently counted against the cap.
        running: u64,
        /// Configured cap.
        max: u64,
    },

    /// No bindable host port remains in the configured range.
    #[error("No free agent port in {min}-{max}")]
    PortsExhausted {
        /// Low end of the range.
        min: u16,
        /// High end of the range.
        max: u16,
    },

    /// A wake attempt is in progress or just failed; retry shortly.
    #[error("Agent for '{subdomain}' is waking up")]
    AgentWaking {
        /// Subdomain being woken.
        subdomain: String,
    },

    /// The deployment exists but is not in a forwardable state.
    #[error("Agent is {status}")]
    AgentNotReady {
        /// Current status.
        status: DeploymentStatus,
    },

    /// No deployment matches the requested subdomain.
    #[error("No deployment for subdomain '{0}'")]
    DeploymentNotFound(String),

    /// The upstream agent could not be reached.
    #[error("Upstream proxy error: {0}")]
    ProxyUpstream(String),

    /// The action is not allowed in the deployment's current status.
    #[error("Cannot {action} while deployment is {status}")]
    WrongStatus {
        /// The attempted action.
        action: &'static str,
        /// The status that blocked it.
        status: DeploymentStatus,
    },

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The stable wire error code for the JSON envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::CapacityFull { .. } => "CAPACITY_FULL",
            Error::PortsExhausted { .. } => "PORT_ALLOCATION_EXHAUSTED",
            Error::AgentWaking { .. } => "AGENT_WAKING",
            Error::AgentNotReady { .. } => "AGENT_NOT_READY",
            Error::DeploymentNotFound(_) => "DEPLOYMENT_NOT_FOUND",
            Error::ProxyUpstream(_) => "PROXY_ERROR",
            Error::WrongStatus { .. } => "INVALID_STATE_TRANSITION",
            Error::Core(warden_core::Error::InvalidStateTransition { .. }) => {
                "INVALID_STATE_TRANSITION"
            }
            Error::Core(warden_core::Error::Crypto(
                warden_core::crypto::CryptoError::Tampered,
            )) => "TAMPERED_DATA",
            Error::Core(warden_core::Error::DeploymentNotFound(_)) => "DEPLOYMENT_NOT_FOUND",
            Error::Core(warden_core::Error::SubdomainTaken(_)) => "SUBDOMAIN_TAKEN",
            Error::Core(warden_core::Error::Validation(_)) => "VALIDATION_ERROR",
            Error::Runtime(RuntimeError::PortAllocated(_)) => "PORT_ALLOCATION_EXHAUSTED",
            _ => "INTERNAL_ERROR",
        }
    }

    /// The HTTP status the wire code maps to.
    pub fn http_status(&self) -> u16 {
        match self.code() {
            "CAPACITY_FULL" | "PORT_ALLOCATION_EXHAUSTED" | "AGENT_WAKING" | "AGENT_NOT_READY" => {
                503
            }
            "DEPLOYMENT_NOT_FOUND" => 404,
            "PROXY_ERROR" => 502,
            "INVALID_STATE_TRANSITION" | "VALIDATION_ERROR" => 400,
            "SUBDOMAIN_TAKEN" => 409,
            _ => 500,
        }
    }
}

/// Result type using the gateway [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        assert_eq!(Error::CapacityFull { running: 6, max: 6 }.code(), "CAPACITY_FULL");
        assert_eq!(
            Error::CapacityFull { running: 6, max: 6 }.http_status(),
            503
        );
        assert_eq!(
            Error::PortsExhausted { min: 20000, max: 30000 }.code(),
            "PORT_ALLOCATION_EXHAUSTED"
        );
        assert_eq!(Error::DeploymentNotFound("x".into()).http_status(), 404);
        assert_eq!(Error::ProxyUpstream("refused".into()).http_status(), 502);
        assert_eq!(
            Error::AgentWaking { subdomain: "alice".into() }.http_status(),
            503
        );
    }

    #[test]
    fn test_state_transition_mapping() {
        let err = Error::Core(warden_core::Error::InvalidStateTransition {
            from: DeploymentStatus::Idle,
            to: DeploymentStatus::Healthy,
        });
        assert_eq!(err.code(), "INVALID_STATE_TRANSITION");
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn test_tampered_mapping() {
        let err = Error::Core(warden_core::Error::Crypto(
            warden_core::crypto::CryptoError::Tampered,
        ));
        assert_eq!(err.code(), "TAMPERED_DATA");
        assert_eq!(err.http_status(), 500);
    }
}
