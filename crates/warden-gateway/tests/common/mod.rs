// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for warden-gateway integration tests.
//!
//! Builds the control plane over the in-memory persistence backend and the
//! mock runtime, with timing knobs tightened so lifecycle tests settle in
//! milliseconds.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use warden_core::crypto::SecretCipher;
use warden_core::model::{AgentConfig, Deployment, DeploymentSecrets, SubscriptionStatus, User};
use warden_core::persistence::{MemoryPersistence, Persistence};
use warden_core::status::DeploymentStatus;

use warden_gateway::health::HealthChecker;
use warden_gateway::materializer::ConfigMaterializer;
use warden_gateway::orchestrator::{Orchestrator, OrchestratorConfig, ResourceLimits};
use warden_gateway::ports::PortAllocator;
use warden_gateway::runtime::MockRuntime;

/// Image every harness runtime starts with.
pub const AGENT_IMAGE: &str = "warden/agent:test";

/// Canonical container prefix used across tests.
pub const CONTAINER_PREFIX: &str = "warden-agent-";

/// Fully wired orchestrator over in-memory backends.
pub struct TestHarness {
    pub persistence: Arc<MemoryPersistence>,
    pub runtime: Arc<MockRuntime>,
    pub ports: Arc<PortAllocator>,
    pub health: Arc<HealthChecker>,
    pub orchestrator: Arc<Orchestrator>,
    pub cipher: SecretCipher,
    _data_dir: tempfile::TempDir,
}

impl TestHarness {
    /// Build a harness allocating ports from `[min, max]`.
    ///
    /// Each test should use its own disjoint range; tests run concurrently
    /// and mock containers bind real host ports.
    pub fn new(min_port: u16, max_port: u16) -> Self {
        Self::with_max_running(min_port, max_port, 6)
    }

    /// Build a harness with a custom fleet cap.
    pub fn with_max_running(min_port: u16, max_port: u16, max_running_agents: u64) -> Self {
        let persistence = Arc::new(MemoryPersistence::new());
        let runtime = Arc::new(MockRuntime::with_image(AGENT_IMAGE));
        let ports = Arc::new(PortAllocator::new(
            persistence.clone(),
            runtime.clone(),
            min_port,
            max_port,
        ));
        let health = Arc::new(HealthChecker::new(
            Duration::from_millis(25),
            Duration::from_secs(5),
        ));
        let data_dir = tempfile::TempDir::new().expect("temp dir");
        let materializer = ConfigMaterializer::new(data_dir.path(), 18_789);

        let orchestrator = Arc::new(Orchestrator::new(
            persistence.clone(),
            runtime.clone(),
            ports.clone(),
            health.clone(),
            materializer,
            OrchestratorConfig {
                container_prefix: CONTAINER_PREFIX.to_string(),
                agent_image: AGENT_IMAGE.to_string(),
                agent_internal_port: 18_789,
                max_running_agents,
                default_limits: ResourceLimits {
                    memory_bytes: 768 * 1024 * 1024,
                    nano_cpus: 750_000_000,
                },
                agent_max_restarts: 3,
                data_path: data_dir.path().to_path_buf(),
            },
        ));

        Self {
            persistence,
            runtime,
            ports,
            health,
            orchestrator,
            cipher: test_cipher(),
            _data_dir: data_dir,
        }
    }

    /// Insert an idle deployment with encrypted secrets and return it.
    pub async fn seed_deployment(&self, id: &str, subdomain: &str) -> Deployment {
        self.seed_deployment_with_status(id, subdomain, DeploymentStatus::Idle)
            .await
    }

    /// Insert a deployment in a given status. Tests that need container
    /// refs attach them afterwards.
    pub async fn seed_deployment_with_status(
        &self,
        id: &str,
        subdomain: &str,
        status: DeploymentStatus,
    ) -> Deployment {
        let sealed = self
            .cipher
            .encrypt_secrets(&plaintext_secrets())
            .expect("seal secrets");
        let mut deployment = Deployment::new(
            id,
            "u-1",
            subdomain,
            sealed,
            AgentConfig {
                model: String::new(),
                system_prompt: "You are a helpful agent.".into(),
            },
        );
        deployment.status = status;
        self.persistence
            .insert_deployment(&deployment)
            .await
            .expect("insert deployment");
        deployment
    }

    /// Poll until the deployment reaches `status` or `timeout` elapses.
    pub async fn wait_for_status(
        &self,
        id: &str,
        status: DeploymentStatus,
        timeout: Duration,
    ) -> Deployment {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let deployment = self
                .persistence
                .get_deployment(id)
                .await
                .expect("get deployment")
                .expect("deployment exists");
            if deployment.status == status {
                return deployment;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "deployment {id} stuck in {}, wanted {status}",
                deployment.status
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Valid-format plaintext credentials.
pub fn plaintext_secrets() -> DeploymentSecrets {
    DeploymentSecrets {
        google_api_key: Some(format!("AIza{}", "a".repeat(35))),
        web_ui_token: "web-ui-token-1234".into(),
        ..Default::default()
    }
}

/// Fixed test cipher.
pub fn test_cipher() -> SecretCipher {
    SecretCipher::from_hex_key(&"ab".repeat(32)).expect("test key")
}

/// Insert an active subscriber.
pub async fn seed_active_user(
    persistence: &MemoryPersistence,
    id: &str,
    email: &str,
    expires_at: chrono::DateTime<chrono::Utc>,
) -> User {
    let mut user = User::new(id, email);
    user.subscription_status = SubscriptionStatus::Active;
    user.subscription_expires_at = Some(expires_at);
    user.max_agents = 1;
    persistence.insert_user(&user).await.expect("insert user");
    user
}
