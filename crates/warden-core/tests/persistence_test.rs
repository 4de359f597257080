// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence contract tests against the in-memory backend.

use chrono::{Duration, Utc};
use warden_core::model::{AgentConfig, Deployment, DeploymentSecrets, SubscriptionStatus, User};
use warden_core::persistence::{
    DeploymentFilter, DeploymentUpdate, MemoryPersistence, Persistence, UserUpdate,
};
use warden_core::status::DeploymentStatus;
use warden_core::Error;

fn sealed_secrets() -> DeploymentSecrets {
    DeploymentSecrets {
        google_api_key: Some("00aa:bb11:cc22".into()),
        web_ui_token: "00aa:bb11:cc22".into(),
        ..Default::default()
    }
}

fn deployment(id: &str, subdomain: &str) -> Deployment {
    Deployment::new(id, "u-1", subdomain, sealed_secrets(), AgentConfig::default())
}

#[tokio::test]
async fn test_insert_rejects_duplicate_subdomain() {
    let store = MemoryPersistence::new();
    store.insert_deployment(&deployment("d-1", "alice")).await.unwrap();

    let err = store
        .insert_deployment(&deployment("d-2", "alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SubdomainTaken(s) if s == "alice"));
}

#[tokio::test]
async fn test_insert_rejects_plaintext_secrets() {
    let store = MemoryPersistence::new();
    let mut d = deployment("d-1", "alice");
    d.secrets.web_ui_token = "plaintext-token".into();

    let err = store.insert_deployment(&d).await.unwrap_err();
    assert!(matches!(err, Error::PlaintextSecret("webUiToken")));
}

#[tokio::test]
async fn test_update_cas_on_status() {
    let store = MemoryPersistence::new();
    store.insert_deployment(&deployment("d-1", "alice")).await.unwrap();

    let update = DeploymentUpdate {
        provisioning_step: Some(Some("Allocating resources...".into())),
        ..Default::default()
    };
    // Expected status matches: applies.
    assert!(store
        .update_deployment("d-1", &update, Some(DeploymentStatus::Idle))
        .await
        .unwrap());
    // Expected status mismatched: rejected.
    assert!(!store
        .update_deployment("d-1", &update, Some(DeploymentStatus::Healthy))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_transition_chain_and_healthy_side_effects() {
    let store = MemoryPersistence::new();
    store.insert_deployment(&deployment("d-1", "alice")).await.unwrap();

    store.transition("d-1", DeploymentStatus::Configuring).await.unwrap();
    store.transition("d-1", DeploymentStatus::Provisioning).await.unwrap();

    // Attach container refs before starting, as the orchestrator does.
    let refs = DeploymentUpdate {
        container_id: Some(Some("c-1".into())),
        internal_port: Some(Some(20001)),
        error_message: Some(Some("stale".into())),
        ..Default::default()
    };
    store.update_deployment("d-1", &refs, None).await.unwrap();
    store.transition("d-1", DeploymentStatus::Starting).await.unwrap();

    let healthy = store.transition("d-1", DeploymentStatus::Healthy).await.unwrap();
    assert_eq!(healthy.status, DeploymentStatus::Healthy);
    assert!(healthy.error_message.is_none(), "healthy clears the error");
    assert!(healthy.last_heartbeat.is_some());
    assert!(healthy.last_request_at.is_some());
}

#[tokio::test]
async fn test_transition_rejects_illegal_move() {
    let store = MemoryPersistence::new();
    store.insert_deployment(&deployment("d-1", "alice")).await.unwrap();

    let err = store
        .transition("d-1", DeploymentStatus::Healthy)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidStateTransition {
            from: DeploymentStatus::Idle,
            to: DeploymentStatus::Healthy,
        }
    ));
}

#[tokio::test]
async fn test_terminal_transition_clears_container_refs() {
    let store = MemoryPersistence::new();
    let mut d = deployment("d-1", "alice");
    d.status = DeploymentStatus::Healthy;
    d.container_id = Some("c-1".into());
    d.internal_port = Some(20001);
    store.insert_deployment(&d).await.unwrap();

    let stopped = store.transition("d-1", DeploymentStatus::Stopped).await.unwrap();
    assert_eq!(stopped.status, DeploymentStatus::Stopped);
    assert!(stopped.container_id.is_none());
    assert!(stopped.internal_port.is_none());
}

#[tokio::test]
async fn test_reserve_port_requires_configuring_and_uniqueness() {
    let store = MemoryPersistence::new();

    let mut a = deployment("d-1", "alice");
    a.status = DeploymentStatus::Configuring;
    store.insert_deployment(&a).await.unwrap();

    let mut b = deployment("d-2", "bob");
    b.status = DeploymentStatus::Configuring;
    store.insert_deployment(&b).await.unwrap();

    assert!(store.reserve_port("d-1", 20001).await.unwrap());
    // Same port for another deployment hits the unique guard.
    assert!(!store.reserve_port("d-2", 20001).await.unwrap());
    assert!(store.reserve_port("d-2", 20002).await.unwrap());

    // Leaving `configuring` makes further reservations fail.
    store.transition("d-2", DeploymentStatus::Error).await.unwrap();
    assert!(!store.reserve_port("d-2", 20003).await.unwrap());

    // Gone record.
    assert!(!store.reserve_port("d-404", 20004).await.unwrap());
}

#[tokio::test]
async fn test_touch_requires_healthy() {
    let store = MemoryPersistence::new();
    let mut d = deployment("d-1", "alice");
    d.status = DeploymentStatus::Healthy;
    d.container_id = Some("c-1".into());
    d.internal_port = Some(20001);
    store.insert_deployment(&d).await.unwrap();

    let now = Utc::now();
    assert!(store.touch_last_request("d-1", now).await.unwrap());
    let fetched = store.get_deployment("d-1").await.unwrap().unwrap();
    assert_eq!(fetched.last_request_at, Some(now));

    store.transition("d-1", DeploymentStatus::Stopped).await.unwrap();
    assert!(!store.touch_last_request("d-1", Utc::now()).await.unwrap());
}

#[tokio::test]
async fn test_filters() {
    let store = MemoryPersistence::new();

    let mut a = deployment("d-1", "alice");
    a.status = DeploymentStatus::Healthy;
    a.container_id = Some("c-1".into());
    a.last_request_at = Some(Utc::now() - Duration::minutes(20));
    store.insert_deployment(&a).await.unwrap();

    let mut b = deployment("d-2", "bob");
    b.status = DeploymentStatus::Healthy;
    b.container_id = Some("c-2".into());
    b.last_request_at = Some(Utc::now());
    store.insert_deployment(&b).await.unwrap();

    let mut c = deployment("d-3", "carol");
    c.status = DeploymentStatus::Stopped;
    store.insert_deployment(&c).await.unwrap();

    // A deployment that never served a request counts as idle.
    let mut d = deployment("d-4", "dave");
    d.status = DeploymentStatus::Healthy;
    d.container_id = Some("c-4".into());
    store.insert_deployment(&d).await.unwrap();

    let running = store.count_deployments(&DeploymentFilter::running_like()).await.unwrap();
    assert_eq!(running, 3);

    let idle_cutoff = Utc::now() - Duration::minutes(10);
    let idle = store
        .list_deployments(&DeploymentFilter {
            statuses: Some(vec![DeploymentStatus::Healthy]),
            last_request_before: Some(idle_cutoff),
            ..Default::default()
        })
        .await
        .unwrap();
    let ids: Vec<&str> = idle.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["d-1", "d-4"]);
}

#[tokio::test]
async fn test_user_subscription_queries() {
    let store = MemoryPersistence::new();
    let now = Utc::now();

    let mut expired = User::new("u-1", "expired@example.com");
    expired.subscription_status = SubscriptionStatus::Active;
    expired.subscription_expires_at = Some(now - Duration::seconds(1));
    store.insert_user(&expired).await.unwrap();

    let mut due = User::new("u-2", "due@example.com");
    due.subscription_status = SubscriptionStatus::Active;
    due.subscription_expires_at = Some(now + Duration::days(2));
    store.insert_user(&due).await.unwrap();

    let mut far = User::new("u-3", "far@example.com");
    far.subscription_status = SubscriptionStatus::Active;
    far.subscription_expires_at = Some(now + Duration::days(20));
    store.insert_user(&far).await.unwrap();

    let mut reminded = User::new("u-4", "reminded@example.com");
    reminded.subscription_status = SubscriptionStatus::Active;
    reminded.subscription_expires_at = Some(now + Duration::days(2));
    reminded.expiry_reminder_sent = true;
    store.insert_user(&reminded).await.unwrap();

    let expired_users = store.list_expired_active_users(now).await.unwrap();
    assert_eq!(expired_users.len(), 1);
    assert_eq!(expired_users[0].id, "u-1");

    let due_users = store
        .list_users_due_reminder(now, Duration::days(3))
        .await
        .unwrap();
    assert_eq!(due_users.len(), 1);
    assert_eq!(due_users[0].id, "u-2");

    // Expire u-1 the way the reaper does.
    store
        .update_user(
            "u-1",
            &UserUpdate {
                subscription_status: Some(SubscriptionStatus::Expired),
                max_agents: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let u1 = store.get_user("u-1").await.unwrap().unwrap();
    assert_eq!(u1.subscription_status, SubscriptionStatus::Expired);
    assert_eq!(u1.max_agents, 0);
    assert!(store.list_expired_active_users(now).await.unwrap().is_empty());
}
