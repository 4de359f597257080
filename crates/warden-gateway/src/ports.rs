// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Collision-free host port allocation.
//!
//! A port is handed out only when four evidence sources agree it is free:
//! deployments whose status still claims a port, this process's in-flight
//! reservations, ports published by any container the runtime knows about,
//! and an actual OS bind on both loopback and the any-address. The partial
//! unique index on `internal_port` remains the last line of defense against
//! the time-of-check/time-of-use race between the bind re-check and the
//! database write.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use warden_core::persistence::{DeploymentFilter, Persistence};
use warden_core::status::DeploymentStatus;

use crate::error::{Error, Result};
use crate::runtime::ContainerRuntime;

/// Statuses that may legitimately hold a port in the database.
const PORT_HOLDING_STATUSES: [DeploymentStatus; 5] = [
    DeploymentStatus::Configuring,
    DeploymentStatus::Provisioning,
    DeploymentStatus::Starting,
    DeploymentStatus::Healthy,
    DeploymentStatus::Restarting,
];

/// Allocates host ports for agent containers within a configured range.
pub struct PortAllocator {
    persistence: Arc<dyn Persistence>,
    runtime: Arc<dyn ContainerRuntime>,
    min_port: u16,
    max_port: u16,
    in_flight: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// Create an allocator over `[min_port, max_port]`.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        runtime: Arc<dyn ContainerRuntime>,
        min_port: u16,
        max_port: u16,
    ) -> Self {
        Self {
            persistence,
            runtime,
            min_port,
            max_port,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Allocate a free port.
    ///
    /// The returned port stays reserved in the in-flight set until
    /// [`atomic_reserve`](Self::atomic_reserve) persists it or
    /// [`release`](Self::release) gives it back.
    pub async fn allocate(&self) -> Result<u16> {
        let used = self.used_ports().await?;

        for port in self.min_port..=self.max_port {
            if used.contains(&port) {
                continue;
            }
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                if !in_flight.insert(port) {
                    continue;
                }
            }
            if Self::bindable(port) {
                debug!(port = port, "Allocated agent port");
                return Ok(port);
            }
            self.in_flight.lock().unwrap().remove(&port);
        }

        Err(Error::PortsExhausted {
            min: self.min_port,
            max: self.max_port,
        })
    }

    /// Give an in-flight reservation back.
    pub fn release(&self, port: u16) {
        self.in_flight.lock().unwrap().remove(&port);
    }

    /// Whether a port is currently reserved in-flight (diagnostics).
    pub fn is_in_flight(&self, port: u16) -> bool {
        self.in_flight.lock().unwrap().contains(&port)
    }

    /// Number of in-flight reservations (diagnostics).
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// Persist an allocated port onto a deployment.
    ///
    /// Re-checks the OS bind, then conditionally sets `internal_port` while
    /// the record is still `configuring`. Returns `false` when the record
    /// is gone, left `configuring`, or lost the unique-index race; the
    /// caller re-allocates. The in-flight entry is cleared on every path.
    pub async fn atomic_reserve(&self, deployment_id: &str, port: u16) -> Result<bool> {
        if !Self::bindable(port) {
            self.release(port);
            return Ok(false);
        }

        let reserved = self.persistence.reserve_port(deployment_id, port).await;
        self.release(port);
        Ok(reserved?)
    }

    /// Union of ports claimed by the database, this process, and the
    /// runtime.
    async fn used_ports(&self) -> Result<HashSet<u16>> {
        let mut used: HashSet<u16> = HashSet::new();

        let filter = DeploymentFilter::with_statuses(&PORT_HOLDING_STATUSES);
        for deployment in self.persistence.list_deployments(&filter).await? {
            if let Some(port) = deployment.internal_port {
                used.insert(port);
            }
        }

        used.extend(self.in_flight.lock().unwrap().iter().copied());

        // Runtime evidence is best-effort: if the daemon is unreachable the
        // OS bind check below remains the last line of defense.
        match self.runtime.published_host_ports().await {
            Ok(published) => used.extend(published),
            Err(e) => {
                warn!(error = %e, "Runtime port listing unavailable, relying on bind checks");
            }
        }

        Ok(used)
    }

    /// Two sequential stream-socket binds: loopback, then any-address.
    fn bindable(port: u16) -> bool {
        let loopback = match TcpListener::bind(("127.0.0.1", port)) {
            Ok(listener) => listener,
            Err(_) => return false,
        };
        let any = TcpListener::bind(("0.0.0.0", port));
        drop(loopback);
        any.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::model::{AgentConfig, Deployment, DeploymentSecrets};
    use warden_core::persistence::MemoryPersistence;

    use crate::runtime::MockRuntime;

    fn allocator_over(range: (u16, u16)) -> PortAllocator {
        PortAllocator::new(
            Arc::new(MemoryPersistence::new()),
            Arc::new(MockRuntime::new()),
            range.0,
            range.1,
        )
    }

    fn sealed_secrets() -> DeploymentSecrets {
        DeploymentSecrets {
            web_ui_token: "00aa:bb11:cc22".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_allocate_and_release() {
        let allocator = allocator_over((21_500, 21_520));
        let port = allocator.allocate().await.unwrap();
        assert!((21_500..=21_520).contains(&port));
        assert!(allocator.is_in_flight(port));

        allocator.release(port);
        assert!(!allocator.is_in_flight(port));
    }

    #[tokio::test]
    async fn test_sequential_allocations_are_distinct() {
        let allocator = allocator_over((21_530, 21_550));
        let a = allocator.allocate().await.unwrap();
        let b = allocator.allocate().await.unwrap();
        assert_ne!(a, b);
        allocator.release(a);
        allocator.release(b);
    }

    #[tokio::test]
    async fn test_skips_db_claimed_port() {
        let persistence = Arc::new(MemoryPersistence::new());
        let mut claimed = Deployment::new(
            "d-1",
            "u-1",
            "alice",
            sealed_secrets(),
            AgentConfig::default(),
        );
        claimed.status = DeploymentStatus::Healthy;
        claimed.container_id = Some("c-1".into());
        claimed.internal_port = Some(21_560);
        persistence.insert_deployment(&claimed).await.unwrap();

        let allocator = PortAllocator::new(
            persistence,
            Arc::new(MockRuntime::new()),
            21_560,
            21_570,
        );
        let port = allocator.allocate().await.unwrap();
        assert_ne!(port, 21_560);
        allocator.release(port);
    }

    #[tokio::test]
    async fn test_skips_os_bound_port() {
        let blocker = TcpListener::bind("127.0.0.1:0").unwrap();
        let blocked = blocker.local_addr().unwrap().port();

        // A one-port range that is OS-bound exhausts immediately.
        let allocator = allocator_over((blocked, blocked));
        let err = allocator.allocate().await.unwrap_err();
        assert!(matches!(err, Error::PortsExhausted { .. }));
        assert!(!allocator.is_in_flight(blocked));
    }

    #[tokio::test]
    async fn test_exhaustion_with_in_flight() {
        let allocator = allocator_over((21_580, 21_581));
        let a = allocator.allocate().await.unwrap();
        let b = allocator.allocate().await.unwrap();
        assert_ne!(a, b);
        assert!(matches!(
            allocator.allocate().await.unwrap_err(),
            Error::PortsExhausted { .. }
        ));
        allocator.release(a);
        allocator.release(b);
    }

    #[tokio::test]
    async fn test_runtime_failure_degrades_gracefully() {
        let runtime = Arc::new(MockRuntime::new());
        *runtime.fail_list.lock().unwrap() = true;

        let allocator = PortAllocator::new(
            Arc::new(MemoryPersistence::new()),
            runtime,
            21_590,
            21_600,
        );
        // Listing fails, but allocation proceeds on the other evidence.
        let port = allocator.allocate().await.unwrap();
        allocator.release(port);
    }

    #[tokio::test]
    async fn test_atomic_reserve_happy_path() {
        let persistence = Arc::new(MemoryPersistence::new());
        let mut d = Deployment::new("d-1", "u-1", "alice", sealed_secrets(), AgentConfig::default());
        d.status = DeploymentStatus::Configuring;
        persistence.insert_deployment(&d).await.unwrap();

        let allocator = PortAllocator::new(
            persistence.clone(),
            Arc::new(MockRuntime::new()),
            21_610,
            21_620,
        );
        let port = allocator.allocate().await.unwrap();
        assert!(allocator.atomic_reserve("d-1", port).await.unwrap());
        assert!(!allocator.is_in_flight(port));

        let stored = persistence.get_deployment("d-1").await.unwrap().unwrap();
        assert_eq!(stored.internal_port, Some(port));
    }

    #[tokio::test]
    async fn test_atomic_reserve_fails_on_status_change() {
        let persistence = Arc::new(MemoryPersistence::new());
        let d = Deployment::new("d-1", "u-1", "alice", sealed_secrets(), AgentConfig::default());
        persistence.insert_deployment(&d).await.unwrap(); // still idle

        let allocator = PortAllocator::new(
            persistence,
            Arc::new(MockRuntime::new()),
            21_630,
            21_640,
        );
        let port = allocator.allocate().await.unwrap();
        assert!(!allocator.atomic_reserve("d-1", port).await.unwrap());
        assert!(!allocator.is_in_flight(port));
    }

    #[tokio::test]
    async fn test_atomic_reserve_fails_on_unique_collision() {
        let persistence = Arc::new(MemoryPersistence::new());

        let mut ours = Deployment::new("d-1", "u-1", "alice", sealed_secrets(), AgentConfig::default());
        ours.status = DeploymentStatus::Configuring;
        persistence.insert_deployment(&ours).await.unwrap();

        let allocator = PortAllocator::new(
            persistence.clone(),
            Arc::new(MockRuntime::new()),
            21_650,
            21_660,
        );
        let port = allocator.allocate().await.unwrap();

        // A third party grabs the same port in the database mid-race.
        let mut thief = Deployment::new("d-2", "u-2", "bob", sealed_secrets(), AgentConfig::default());
        thief.status = DeploymentStatus::Healthy;
        thief.container_id = Some("c-2".into());
        thief.internal_port = Some(port);
        persistence.insert_deployment(&thief).await.unwrap();

        assert!(!allocator.atomic_reserve("d-1", port).await.unwrap());
        assert!(!allocator.is_in_flight(port));

        // The caller re-allocates and lands on a different port.
        let next = allocator.allocate().await.unwrap();
        assert_ne!(next, port);
        allocator.release(next);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_distinct() {
        let allocator = Arc::new(allocator_over((21_670, 21_700)));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let allocator = allocator.clone();
            tasks.push(tokio::spawn(async move { allocator.allocate().await }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            let port = task.await.unwrap().unwrap();
            assert!(seen.insert(port), "port {port} handed out twice");
        }
        for port in seen {
            allocator.release(port);
        }
    }
}
