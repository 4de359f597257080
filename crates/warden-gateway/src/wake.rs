// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-subdomain auto-wake deduplication.
//!
//! The proxy calls [`WakeCoordinator::wake`] when a request lands on a
//! `stopped` or `error` deployment. The first caller for a subdomain runs
//! the actual wake (spawn, then poll persistence until `healthy`); every
//! concurrent caller joins the same attempt and observes the same outcome.
//! The in-flight entry is removed on all paths before the outcome is
//! published.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use warden_core::crypto::SecretCipher;
use warden_core::persistence::Persistence;
use warden_core::status::DeploymentStatus;

use crate::orchestrator::Orchestrator;
use crate::proxy::DeploymentCache;

/// Wake timing knobs.
#[derive(Debug, Clone)]
pub struct WakeConfig {
    /// Overall budget for one wake attempt.
    pub budget: Duration,
    /// Spacing between persistence polls.
    pub poll_interval: Duration,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
        }
    }
}

struct WakeInner {
    persistence: Arc<dyn Persistence>,
    orchestrator: Arc<Orchestrator>,
    cipher: SecretCipher,
    cache: Arc<DeploymentCache>,
    in_flight: Mutex<HashMap<String, watch::Receiver<Option<bool>>>>,
    config: WakeConfig,
}

/// Deduplicated auto-wake entry point.
#[derive(Clone)]
pub struct WakeCoordinator {
    inner: Arc<WakeInner>,
}

impl WakeCoordinator {
    /// Wire up a coordinator.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        orchestrator: Arc<Orchestrator>,
        cipher: SecretCipher,
        cache: Arc<DeploymentCache>,
        config: WakeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(WakeInner {
                persistence,
                orchestrator,
                cipher,
                cache,
                in_flight: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Wake the deployment behind a subdomain.
    ///
    /// Returns true once the deployment is `healthy` with a port; false on
    /// a failed spawn, an `error` outcome, or budget exhaustion.
    pub async fn wake(&self, subdomain: &str) -> bool {
        let mut rx = {
            let mut in_flight = self.inner.in_flight.lock().unwrap();
            if let Some(rx) = in_flight.get(subdomain) {
                debug!(subdomain = %subdomain, "Joining in-flight wake");
                rx.clone()
            } else {
                let (tx, rx) = watch::channel(None);
                in_flight.insert(subdomain.to_string(), rx.clone());

                let inner = self.inner.clone();
                let subdomain = subdomain.to_string();
                tokio::spawn(async move {
                    let outcome = inner.run_wake(&subdomain).await;
                    // Remove before publishing so late joiners start a
                    // fresh attempt instead of reading a stale channel.
                    inner.in_flight.lock().unwrap().remove(&subdomain);
                    let _ = tx.send(Some(outcome));
                });
                rx
            }
        };

        loop {
            if let Some(outcome) = *rx.borrow() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Number of wakes currently in flight (diagnostics).
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().unwrap().len()
    }
}

impl WakeInner {
    async fn run_wake(&self, subdomain: &str) -> bool {
        let deployment = match self.persistence.find_deployment_by_subdomain(subdomain).await {
            Ok(Some(deployment)) => deployment,
            Ok(None) => return false,
            Err(e) => {
                warn!(subdomain = %subdomain, error = %e, "Wake lookup failed");
                return false;
            }
        };

        match deployment.status {
            // A concurrent wake already finished; report success so the
            // caller re-resolves instead of erroring on a stale cache.
            DeploymentStatus::Healthy if deployment.internal_port.is_some() => {
                self.cache.invalidate(subdomain);
                return true;
            }
            DeploymentStatus::Stopped | DeploymentStatus::Error => {}
            status => {
                debug!(subdomain = %subdomain, status = %status, "Wake skipped, not asleep");
                return false;
            }
        }

        info!(subdomain = %subdomain, deployment_id = %deployment.id, "Waking agent");

        let secrets = match self.cipher.decrypt_secrets(&deployment.secrets) {
            Ok(secrets) => secrets,
            Err(e) => {
                warn!(subdomain = %subdomain, error = %e, "Wake aborted, secrets undecryptable");
                return false;
            }
        };

        if let Err(e) = self
            .orchestrator
            .spawn_agent(&deployment, &secrets, None, None)
            .await
        {
            warn!(subdomain = %subdomain, error = %e, "Wake spawn failed");
            return false;
        }

        let deadline = tokio::time::Instant::now() + self.config.budget;
        loop {
            tokio::time::sleep(self.config.poll_interval).await;

            match self.persistence.find_deployment_by_subdomain(subdomain).await {
                Ok(Some(current)) => match current.status {
                    DeploymentStatus::Healthy if current.internal_port.is_some() => {
                        self.cache.invalidate(subdomain);
                        info!(subdomain = %subdomain, "Agent awake");
                        return true;
                    }
                    DeploymentStatus::Error => {
                        warn!(subdomain = %subdomain, "Wake ended in error state");
                        return false;
                    }
                    _ => {}
                },
                Ok(None) => return false,
                Err(e) => {
                    warn!(subdomain = %subdomain, error = %e, "Wake poll failed");
                }
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(subdomain = %subdomain, "Wake budget exhausted");
                return false;
            }
        }
    }
}
