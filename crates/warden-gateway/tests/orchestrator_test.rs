// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestrator lifecycle tests: spawn, capacity, failure cleanup, stop,
//! restart, remove, and pull deduplication.

mod common;

use std::time::Duration;

use common::{CONTAINER_PREFIX, TestHarness, plaintext_secrets};
use warden_core::persistence::{DeploymentUpdate, Persistence};
use warden_core::status::DeploymentStatus;
use warden_gateway::Error;
use warden_gateway::runtime::ContainerRuntime;

#[tokio::test]
async fn test_spawn_happy_path_reaches_healthy() {
    let harness = TestHarness::new(22_000, 22_019);
    let deployment = harness.seed_deployment("d-1", "alice").await;

    harness
        .orchestrator
        .spawn_agent(&deployment, &plaintext_secrets(), None, None)
        .await
        .unwrap();

    let healthy = harness
        .wait_for_status("d-1", DeploymentStatus::Healthy, Duration::from_secs(3))
        .await;

    let port = healthy.internal_port.expect("healthy implies a port");
    assert!((22_000..=22_019).contains(&port));
    assert!(healthy.container_id.is_some(), "healthy implies a container");
    assert!(healthy.error_message.is_none());
    assert!(healthy.last_heartbeat.is_some());
    assert!(healthy.last_request_at.is_some());

    // No model was requested: the google default wins.
    assert_eq!(healthy.config.model, "google/gemini-3-pro-preview");

    // The runtime holds the canonically named container.
    let names = harness.runtime.container_names();
    assert!(names.contains(&format!("{CONTAINER_PREFIX}d-1")));

    // The published port answers requests.
    let body = reqwest_lite(port).await;
    assert_eq!(body, "agent online");
}

#[tokio::test]
async fn test_spawn_fleet_capacity_gate() {
    let harness = TestHarness::with_max_running(22_020, 22_049, 6);

    // Six deployments already counted against the cap.
    for i in 0..6 {
        let id = format!("d-{i}");
        let subdomain = format!("tenant{i}");
        let status = match i {
            0 => DeploymentStatus::Healthy,
            1 => DeploymentStatus::Starting,
            2 => DeploymentStatus::Provisioning,
            3 => DeploymentStatus::Configuring,
            _ => DeploymentStatus::Restarting,
        };
        harness
            .seed_deployment_with_status(&id, &subdomain, status)
            .await;
        let update = DeploymentUpdate {
            container_id: Some(Some(format!("c-{i}"))),
            ..Default::default()
        };
        harness
            .persistence
            .update_deployment(&id, &update, None)
            .await
            .unwrap();
    }

    let seventh = harness.seed_deployment("d-7", "seventh").await;
    let err = harness
        .orchestrator
        .spawn_agent(&seventh, &plaintext_secrets(), None, None)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::CapacityFull { running: 6, max: 6 }));
    assert_eq!(err.code(), "CAPACITY_FULL");
    assert_eq!(err.http_status(), 503);

    let stored = harness.persistence.get_deployment("d-7").await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Error);
    assert!(
        stored.error_message.as_deref().unwrap_or_default().contains("capacity"),
        "diagnostic should mention capacity: {:?}",
        stored.error_message
    );
}

#[tokio::test]
async fn test_spawn_failure_runs_shared_cleanup() {
    let harness = TestHarness::new(22_050, 22_069);
    let deployment = harness.seed_deployment("d-1", "alice").await;

    *harness.runtime.fail_start.lock().unwrap() = Some("simulated start failure".into());

    let err = harness
        .orchestrator
        .spawn_agent(&deployment, &plaintext_secrets(), None, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("simulated start failure"));

    // Deployment parked in `error` with the message preserved.
    let stored = harness.persistence.get_deployment("d-1").await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Error);
    assert!(
        stored.error_message.as_deref().unwrap_or_default().contains("simulated start failure")
    );
    assert!(stored.container_id.is_none());
    assert!(stored.internal_port.is_none());

    // No container with the canonical name survives.
    assert!(
        !harness
            .runtime
            .container_names()
            .contains(&format!("{CONTAINER_PREFIX}d-1"))
    );

    // The allocator's in-flight set is clean again.
    assert_eq!(harness.ports.in_flight_count(), 0);
}

#[tokio::test]
async fn test_spawn_model_key_mismatch_fails() {
    let harness = TestHarness::new(22_070, 22_089);
    let deployment = harness.seed_deployment("d-1", "alice").await;

    // Only a google key is present; asking for an anthropic model fails.
    let err = harness
        .orchestrator
        .spawn_agent(
            &deployment,
            &plaintext_secrets(),
            Some("anthropic/claude-sonnet-4-5"),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");

    let stored = harness.persistence.get_deployment("d-1").await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Error);
}

#[tokio::test]
async fn test_spawn_cleans_up_zombie_container() {
    let harness = TestHarness::new(22_090, 22_109);
    let deployment = harness.seed_deployment("d-1", "alice").await;

    // A container with the canonical name survived an earlier crash.
    harness
        .runtime
        .seed_container("stale-1", &format!("{CONTAINER_PREFIX}d-1"), false);

    harness
        .orchestrator
        .spawn_agent(&deployment, &plaintext_secrets(), None, None)
        .await
        .unwrap();

    harness
        .wait_for_status("d-1", DeploymentStatus::Healthy, Duration::from_secs(3))
        .await;

    // Exactly one container with the canonical name remains, and it is not
    // the stale one.
    let names = harness.runtime.container_names();
    assert_eq!(
        names.iter().filter(|n| **n == format!("{CONTAINER_PREFIX}d-1")).count(),
        1
    );
    assert!(harness.runtime.inspect_container("stale-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_stop_from_healthy() {
    let harness = TestHarness::new(22_110, 22_129);
    let deployment = harness.seed_deployment("d-1", "alice").await;
    harness
        .orchestrator
        .spawn_agent(&deployment, &plaintext_secrets(), None, None)
        .await
        .unwrap();
    harness
        .wait_for_status("d-1", DeploymentStatus::Healthy, Duration::from_secs(3))
        .await;

    harness.orchestrator.stop_agent("d-1").await.unwrap();

    let stopped = harness.persistence.get_deployment("d-1").await.unwrap().unwrap();
    assert_eq!(stopped.status, DeploymentStatus::Stopped);
    assert!(stopped.container_id.is_none());
    assert!(stopped.internal_port.is_none());
}

#[tokio::test]
async fn test_stop_rejected_in_wrong_status() {
    let harness = TestHarness::new(22_130, 22_139);
    harness.seed_deployment("d-1", "alice").await; // idle

    let err = harness.orchestrator.stop_agent("d-1").await.unwrap_err();
    assert!(matches!(err, Error::WrongStatus { action: "stop", .. }));
    assert_eq!(err.http_status(), 400);
}

#[tokio::test]
async fn test_restart_in_place_returns_to_healthy() {
    let harness = TestHarness::new(22_140, 22_159);
    let deployment = harness.seed_deployment("d-1", "alice").await;
    harness
        .orchestrator
        .spawn_agent(&deployment, &plaintext_secrets(), None, None)
        .await
        .unwrap();
    let healthy = harness
        .wait_for_status("d-1", DeploymentStatus::Healthy, Duration::from_secs(3))
        .await;
    let container_before = healthy.container_id.clone().unwrap();
    let port_before = healthy.internal_port.unwrap();

    harness
        .orchestrator
        .restart_agent("d-1", &plaintext_secrets(), None)
        .await
        .unwrap();

    let healthy_again = harness
        .wait_for_status("d-1", DeploymentStatus::Healthy, Duration::from_secs(3))
        .await;
    // In-place restart keeps the container and the port.
    assert_eq!(healthy_again.container_id.as_deref(), Some(container_before.as_str()));
    assert_eq!(healthy_again.internal_port, Some(port_before));
}

#[tokio::test]
async fn test_restart_without_container_spawns_fresh() {
    let harness = TestHarness::new(22_160, 22_179);
    harness
        .seed_deployment_with_status("d-1", "alice", DeploymentStatus::Stopped)
        .await;

    harness
        .orchestrator
        .restart_agent("d-1", &plaintext_secrets(), None)
        .await
        .unwrap();

    let healthy = harness
        .wait_for_status("d-1", DeploymentStatus::Healthy, Duration::from_secs(3))
        .await;
    assert!(healthy.container_id.is_some());
    assert!(healthy.internal_port.is_some());
}

#[tokio::test]
async fn test_remove_tears_everything_down() {
    let harness = TestHarness::new(22_180, 22_199);
    let deployment = harness.seed_deployment("d-1", "alice").await;
    harness
        .orchestrator
        .spawn_agent(&deployment, &plaintext_secrets(), None, None)
        .await
        .unwrap();
    harness
        .wait_for_status("d-1", DeploymentStatus::Healthy, Duration::from_secs(3))
        .await;

    harness.orchestrator.remove_agent("d-1").await.unwrap();

    let cleared = harness.persistence.get_deployment("d-1").await.unwrap().unwrap();
    assert!(cleared.container_id.is_none());
    assert!(cleared.internal_port.is_none());
    assert!(
        !harness
            .runtime
            .container_names()
            .contains(&format!("{CONTAINER_PREFIX}d-1"))
    );
    assert_eq!(harness.ports.in_flight_count(), 0);

    // Record deletion belongs to the calling handler.
    assert!(harness.persistence.delete_deployment("d-1").await.unwrap());
}

#[tokio::test]
async fn test_concurrent_spawns_share_one_image_pull() {
    let harness = TestHarness::new(22_200, 22_229);
    // Image absent and slow to pull: both spawns need it, and the pull
    // takes long enough for the second to join the first.
    harness.runtime.remove_image(common::AGENT_IMAGE);
    *harness.runtime.pull_delay.lock().unwrap() = Duration::from_millis(300);

    let a = harness.seed_deployment("d-1", "alice").await;
    let b = harness.seed_deployment("d-2", "bob").await;

    let orchestrator = harness.orchestrator.clone();
    let secrets = plaintext_secrets();
    let spawn_a = {
        let orchestrator = orchestrator.clone();
        let a = a.clone();
        let secrets = secrets.clone();
        tokio::spawn(async move { orchestrator.spawn_agent(&a, &secrets, None, None).await })
    };
    let spawn_b = {
        let b = b.clone();
        let secrets = secrets.clone();
        tokio::spawn(async move { orchestrator.spawn_agent(&b, &secrets, None, None).await })
    };

    spawn_a.await.unwrap().unwrap();
    spawn_b.await.unwrap().unwrap();

    assert_eq!(
        harness.runtime.pull_count(),
        1,
        "concurrent spawns must share one pull"
    );

    harness
        .wait_for_status("d-1", DeploymentStatus::Healthy, Duration::from_secs(3))
        .await;
    harness
        .wait_for_status("d-2", DeploymentStatus::Healthy, Duration::from_secs(3))
        .await;
}

/// Minimal GET against a mock agent port.
async fn reqwest_lite(port: u16) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
        .split("\r\n\r\n")
        .nth(1)
        .unwrap_or_default()
        .to_string()
}
