// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Warden Gateway - Tenant Agent Control Plane
//!
//! This crate is the service side of Warden: it spawns, routes to,
//! hibernates, and reaps per-tenant sandboxed agent containers. Each tenant
//! gets a uniquely-subdomained HTTP/WebSocket endpoint transparently routed
//! to a container bound to a dynamically allocated host port.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              Edge / DNS                              │
//! │                     *.example.com ──► gateway                        │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                     warden-gateway (This Crate)                      │
//! │  ┌──────────┐  ┌──────────────┐  ┌───────────┐  ┌────────────────┐   │
//! │  │  Proxy   │  │ Orchestrator │  │   Port    │  │     Reaper     │   │
//! │  │ + Wake   │  │ + Health     │  │ Allocator │  │  (4 passes)    │   │
//! │  └────┬─────┘  └──────┬───────┘  └───────────┘  └───────┬────────┘   │
//! └───────┼───────────────┼─────────────────────────────────┼────────────┘
//!         │ forward       │ create/start/stop               │ reconcile
//!         ▼               ▼                                 ▼
//! ┌───────────────┐  ┌──────────────────────┐  ┌──────────────────────┐
//! │ 127.0.0.1:port│  │  Container runtime   │  │      PostgreSQL      │
//! │  (agents)     │  │      (Docker)        │  │ (deployments, users) │
//! └───────────────┘  └──────────────────────┘  └──────────────────────┘
//! ```
//!
//! # Request flow
//!
//! `GET http://alice.example.com/` → subdomain extraction → deployment
//! cache (5 s TTL) → if `healthy`, throttled `last_request_at` touch and a
//! forward to `127.0.0.1:<port>`; if `stopped`/`error`, a deduplicated
//! auto-wake through the orchestrator, then the forward; otherwise a 503
//! with a status-specific message.
//!
//! # Background control loop
//!
//! The [`reaper`] runs every two minutes and reconciles in four isolated
//! passes: zombie containers, idle hibernation, subscription expiry, and
//! expiry reminders.
//!
//! # Modules
//!
//! - [`config`]: Environment-driven configuration
//! - [`error`]: Error taxonomy mapped to wire error codes
//! - [`runtime`]: Container runtime adapter (Docker and mock backends)
//! - [`ports`]: Collision-free host port allocation
//! - [`materializer`]: Per-deployment on-host config files
//! - [`health`]: TCP health probes with a per-deployment registry
//! - [`orchestrator`]: Spawn / stop / restart / remove flows
//! - [`proxy`]: Subdomain router with HTTP and WebSocket forwarding
//! - [`wake`]: Per-subdomain auto-wake deduplication
//! - [`reaper`]: Periodic reconciliation loop
//! - [`mailer`]: Outbound notification contract
//! - [`app`]: Embeddable runtime wiring it all together

#![deny(missing_docs)]

/// Embeddable gateway runtime.
pub mod app;

/// Environment-driven configuration.
pub mod config;

/// Error taxonomy and wire error codes.
pub mod error;

/// TCP health probes with a per-deployment registry.
pub mod health;

/// Outbound notification contract.
pub mod mailer;

/// Per-deployment on-host config files and workspace directories.
pub mod materializer;

/// Spawn / stop / restart / remove flows.
pub mod orchestrator;

/// Collision-free host port allocation.
pub mod ports;

/// Subdomain router with HTTP and WebSocket forwarding.
pub mod proxy;

/// Periodic reconciliation loop.
pub mod reaper;

/// Container runtime adapter.
pub mod runtime;

/// Per-subdomain auto-wake deduplication.
pub mod wake;

pub use config::Config;
pub use error::{Error, Result};
