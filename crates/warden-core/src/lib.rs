// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Warden Core - Shared Domain Model
//!
//! This crate holds everything the Warden control plane knows about its two
//! record types, independent of any transport or container runtime:
//!
//! - [`model`]: the `Deployment` and `User` records and their embedded
//!   secrets/config documents
//! - [`status`]: the deployment status state machine and its transition table
//! - [`crypto`]: AES-256-GCM secret encryption in the `iv:tag:ciphertext`
//!   hex-triple wire form
//! - [`validate`]: subdomain and API-key format validation plus model name
//!   normalization
//! - [`persistence`]: the storage abstraction with PostgreSQL and in-memory
//!   backends
//!
//! # Status state machine
//!
//! ```text
//!            ┌──────┐
//!            │ idle │◄──────────────────────────┐
//!            └──┬───┘                           │
//!               │ spawn                         │
//!               ▼                               │
//!        ┌─────────────┐     ┌──────────────┐   │
//!        │ configuring │────►│ provisioning │   │ remove /
//!        └─────────────┘     └──────┬───────┘   │ operator reset
//!                                   │           │
//!                                   ▼           │
//!          ┌────────────┐     ┌──────────┐      │
//!          │ restarting │◄───►│ starting │──────┤
//!          └─────┬──────┘     └────┬─────┘      │
//!                │                 │            │
//!                │   ┌─────────┐   │            │
//!                └──►│ healthy │◄──┘            │
//!                    └────┬────┘                │
//!             hibernate / │                     │
//!             stop        ▼                     │
//!                    ┌─────────┐    ┌───────┐   │
//!                    │ stopped │◄──►│ error │───┘
//!                    └─────────┘    └───────┘
//! ```
//!
//! Any state may additionally escape to `error` or `idle`; those hatches are
//! reserved for cleanup paths and are logged by their callers.

#![deny(missing_docs)]

/// AES-256-GCM secret encryption and the `iv:tag:ciphertext` wire form.
pub mod crypto;

/// Error types shared across the workspace.
pub mod error;

/// The `Deployment` and `User` records.
pub mod model;

/// Storage abstraction with PostgreSQL and in-memory backends.
pub mod persistence;

/// Deployment status state machine.
pub mod status;

/// Subdomain, API key, and model name validation.
pub mod validate;

pub use error::{Error, Result};
pub use model::{AgentConfig, AuthProvider, Deployment, DeploymentSecrets, SubscriptionStatus, Tier, User};
pub use status::DeploymentStatus;
