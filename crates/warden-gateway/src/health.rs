// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCP health probes with a per-deployment registry.
//!
//! One probe per deployment: registering a new probe cancels any prior one
//! for the same ID. The probe connects to `127.0.0.1:<port>` until the
//! first success, then runs the caller's success action exactly once. When
//! the overall budget runs out the probe is dropped silently and the
//! deployment stays `starting`; the reaper reconciles it later.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Per-probe connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Registry of in-flight health probes, keyed by deployment ID.
pub struct HealthChecker {
    probes: Mutex<HashMap<String, JoinHandle<()>>>,
    interval: Duration,
    budget: Duration,
}

impl HealthChecker {
    /// Create a checker probing every `interval` with an overall `budget`.
    pub fn new(interval: Duration, budget: Duration) -> Self {
        Self {
            probes: Mutex::new(HashMap::new()),
            interval,
            budget,
        }
    }

    /// Start probing a deployment's port, cancelling any prior probe for
    /// the same deployment. `on_healthy` runs once, on the first success.
    pub fn watch<F>(&self, deployment_id: &str, port: u16, on_healthy: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = deployment_id.to_string();
        let interval = self.interval;
        let budget = self.budget;

        let handle = tokio::spawn(async move {
            let addr: SocketAddr = ([127, 0, 0, 1], port).into();
            let deadline = tokio::time::Instant::now() + budget;

            loop {
                match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                    Ok(Ok(_stream)) => {
                        debug!(deployment_id = %id, port = port, "Health probe succeeded");
                        on_healthy.await;
                        return;
                    }
                    Ok(Err(e)) => {
                        trace!(deployment_id = %id, port = port, error = %e, "Health probe refused");
                    }
                    Err(_) => {
                        trace!(deployment_id = %id, port = port, "Health probe timed out");
                    }
                }

                if tokio::time::Instant::now() + interval > deadline {
                    // Budget exhausted: drop silently, the reaper will
                    // reconcile the deployment left in `starting`.
                    debug!(deployment_id = %id, port = port, "Health probe budget exhausted");
                    return;
                }
                tokio::time::sleep(interval).await;
            }
        });

        let mut probes = self.probes.lock().unwrap();
        if let Some(prior) = probes.insert(deployment_id.to_string(), handle) {
            prior.abort();
        }
    }

    /// Cancel the probe for a deployment, if one is running.
    pub fn cancel(&self, deployment_id: &str) {
        if let Some(handle) = self.probes.lock().unwrap().remove(deployment_id) {
            handle.abort();
        }
    }

    /// Whether a probe is registered (it may have already finished).
    pub fn is_watching(&self, deployment_id: &str) -> bool {
        self.probes
            .lock()
            .unwrap()
            .get(deployment_id)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        for (_, handle) in self.probes.lock().unwrap().drain() {
            handle.abort();
        }
    }
}
