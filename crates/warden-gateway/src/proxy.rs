// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Subdomain router with HTTP and WebSocket forwarding.
//!
//! The Host header's first label selects the tenant. Resolution goes
//! through a process-local cache with a short TTL (non-healthy statuses are
//! cached too, so wake retries don't hammer the database). Healthy
//! deployments get a throttled `last_request_at` touch and a transparent
//! forward to `127.0.0.1:<port>`; stopped or errored ones trigger an
//! auto-wake first. WebSocket upgrades are spliced at the byte level after
//! the upstream 101.
//!
//! The cache is process-local; under horizontal scaling each instance has
//! its own slightly-stale view, which the short TTL bounds. There is no
//! cross-node invalidation.

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::Utc;
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use warden_core::persistence::Persistence;
use warden_core::status::DeploymentStatus;
use warden_core::validate;

use crate::wake::WakeCoordinator;

/// Cache TTL for subdomain resolutions, healthy or not.
pub const CACHE_TTL: Duration = Duration::from_secs(5);

/// Forward connect and upstream-response timeout.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// One cached subdomain resolution.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Deployment ID behind the subdomain.
    pub deployment_id: String,
    /// Published host port, when one is set.
    pub port: Option<u16>,
    /// Status at resolution time.
    pub status: DeploymentStatus,
    inserted: Instant,
}

/// Process-local subdomain resolution cache.
pub struct DeploymentCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl DeploymentCache {
    /// Create a cache with the given TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Fresh entry for a subdomain, if any.
    pub fn get(&self, subdomain: &str) -> Option<CacheEntry> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(subdomain)?;
        if entry.inserted.elapsed() > self.ttl {
            return None;
        }
        Some(entry.clone())
    }

    /// Record a resolution.
    pub fn insert(&self, subdomain: &str, deployment_id: &str, port: Option<u16>, status: DeploymentStatus) {
        self.entries.lock().unwrap().insert(
            subdomain.to_string(),
            CacheEntry {
                deployment_id: deployment_id.to_string(),
                port,
                status,
                inserted: Instant::now(),
            },
        );
    }

    /// Drop a subdomain's entry (after a wake or a teardown).
    pub fn invalidate(&self, subdomain: &str) {
        self.entries.lock().unwrap().remove(subdomain);
    }
}

/// Per-subdomain `last_request_at` throttle.
pub struct TouchTracker {
    last: Mutex<HashMap<String, Instant>>,
    throttle: Duration,
}

impl TouchTracker {
    /// Create a tracker with the given minimum spacing.
    pub fn new(throttle: Duration) -> Self {
        Self {
            last: Mutex::new(HashMap::new()),
            throttle,
        }
    }

    /// Whether a touch should be emitted now; records the touch when so.
    pub fn should_touch(&self, subdomain: &str) -> bool {
        let mut last = self.last.lock().unwrap();
        let now = Instant::now();
        match last.get(subdomain) {
            Some(previous) if now.duration_since(*previous) < self.throttle => false,
            _ => {
                last.insert(subdomain.to_string(), now);
                true
            }
        }
    }
}

/// Extract the tenant subdomain from a Host header value.
///
/// Strips any port, splits on dots: three or more labels mean the first is
/// the subdomain; exactly two with a `localhost` suffix likewise. Reserved
/// platform labels resolve to no tenant.
pub fn extract_subdomain(host: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or("").to_ascii_lowercase();
    let labels: Vec<&str> = host.split('.').collect();
    let first = match labels.len() {
        n if n >= 3 => labels[0],
        2 if labels[1] == "localhost" => labels[0],
        _ => return None,
    };
    if first.is_empty() || validate::is_reserved_label(first) {
        return None;
    }
    Some(first.to_string())
}

/// Shared state for the proxy handlers.
pub struct ProxyState {
    persistence: Arc<dyn Persistence>,
    cache: Arc<DeploymentCache>,
    touch: TouchTracker,
    wake: Arc<WakeCoordinator>,
}

impl ProxyState {
    /// Wire up proxy state.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        cache: Arc<DeploymentCache>,
        wake: Arc<WakeCoordinator>,
        touch_throttle: Duration,
    ) -> Self {
        Self {
            persistence,
            cache,
            touch: TouchTracker::new(touch_throttle),
            wake,
        }
    }

    /// Resolve a subdomain via the cache, falling back to persistence.
    async fn resolve(&self, subdomain: &str) -> warden_core::Result<Option<CacheEntry>> {
        if let Some(entry) = self.cache.get(subdomain) {
            return Ok(Some(entry));
        }
        self.resolve_fresh(subdomain).await
    }

    /// Resolve a subdomain from persistence, refreshing the cache.
    async fn resolve_fresh(&self, subdomain: &str) -> warden_core::Result<Option<CacheEntry>> {
        let Some(deployment) = self
            .persistence
            .find_deployment_by_subdomain(subdomain)
            .await?
        else {
            return Ok(None);
        };
        self.cache.insert(
            subdomain,
            &deployment.id,
            deployment.internal_port,
            deployment.status,
        );
        Ok(self.cache.get(subdomain))
    }

    /// Throttled, fire-and-forget `last_request_at` touch.
    fn touch(&self, subdomain: &str, deployment_id: &str) {
        if !self.touch.should_touch(subdomain) {
            return;
        }
        let persistence = self.persistence.clone();
        let id = deployment_id.to_string();
        let subdomain = subdomain.to_string();
        tokio::spawn(async move {
            match persistence.touch_last_request(&id, Utc::now()).await {
                Ok(true) => {}
                Ok(false) => debug!(subdomain = %subdomain, "Touch skipped, deployment not healthy"),
                Err(e) => debug!(subdomain = %subdomain, error = %e, "Touch failed"),
            }
        });
    }
}

/// Build the proxy router: `/api` is owned by the platform, everything
/// else is tenant traffic.
pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .nest("/api", api_router())
        .fallback(handle)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_router() -> Router<Arc<ProxyState>> {
    Router::new()
        .route("/health", get(api_health))
        .fallback(api_not_found)
}

async fn api_health() -> Response {
    (
        StatusCode::OK,
        axum::Json(json!({ "success": true, "data": { "status": "ok" } })),
    )
        .into_response()
}

async fn api_not_found() -> Response {
    envelope(StatusCode::NOT_FOUND, "NOT_FOUND", "Unknown API route")
}

/// Tenant-facing entry point for every non-`/api` request.
async fn handle(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
    let Some(host) = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_owned)
    else {
        return envelope(StatusCode::NOT_FOUND, "DEPLOYMENT_NOT_FOUND", "Missing Host header");
    };

    let Some(subdomain) = extract_subdomain(&host) else {
        // Apex and reserved hosts are not tenant traffic.
        return envelope(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "No tenant subdomain in request host",
        );
    };

    let entry = match state.resolve(&subdomain).await {
        Ok(entry) => entry,
        Err(e) => {
            warn!(subdomain = %subdomain, error = %e, "Subdomain resolution failed");
            return envelope(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "Lookup failed");
        }
    };
    let Some(entry) = entry else {
        return envelope(
            StatusCode::NOT_FOUND,
            "DEPLOYMENT_NOT_FOUND",
            &format!("No deployment for subdomain '{subdomain}'"),
        );
    };

    let upgrade = is_upgrade_request(&req);

    match entry.status {
        DeploymentStatus::Healthy => {
            let Some(port) = entry.port else {
                return not_ready_response(entry.status);
            };
            state.touch(&subdomain, &entry.deployment_id);
            forward(req, port, upgrade).await
        }
        DeploymentStatus::Stopped | DeploymentStatus::Error => {
            if upgrade {
                // No auto-wake on upgrade; refuse the handshake.
                return not_ready_response(entry.status);
            }
            if !state.wake.wake(&subdomain).await {
                return envelope(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "AGENT_WAKING",
                    "Agent is waking up, retry shortly",
                );
            }
            match state.resolve_fresh(&subdomain).await {
                Ok(Some(fresh)) if fresh.status == DeploymentStatus::Healthy => {
                    let Some(port) = fresh.port else {
                        return not_ready_response(fresh.status);
                    };
                    state.touch(&subdomain, &fresh.deployment_id);
                    forward(req, port, upgrade).await
                }
                _ => envelope(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "AGENT_WAKING",
                    "Agent is waking up, retry shortly",
                ),
            }
        }
        status => not_ready_response(status),
    }
}

/// 503 with the per-status message table.
fn not_ready_response(status: DeploymentStatus) -> Response {
    envelope(
        StatusCode::SERVICE_UNAVAILABLE,
        "AGENT_NOT_READY",
        status_message(status),
    )
}

/// User-facing message per non-forwardable status.
pub fn status_message(status: DeploymentStatus) -> &'static str {
    match status {
        DeploymentStatus::Idle => "Agent has not been started yet",
        DeploymentStatus::Configuring => "Agent is being configured",
        DeploymentStatus::Provisioning => "Agent is being provisioned",
        DeploymentStatus::Starting => "Agent is starting up",
        DeploymentStatus::Restarting => "Agent is restarting",
        DeploymentStatus::Stopped => "Agent is stopped",
        DeploymentStatus::Error => "Agent hit an error and is not running",
        DeploymentStatus::Healthy => "Agent is running",
    }
}

fn envelope(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        axum::Json(json!({
            "success": false,
            "error": { "code": code, "message": message },
        })),
    )
        .into_response()
}

fn is_upgrade_request(req: &Request) -> bool {
    let has_upgrade_header = req.headers().contains_key(header::UPGRADE);
    let connection_upgrade = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    has_upgrade_header && connection_upgrade
}

/// Forward a request to `127.0.0.1:<port>`, preserving method, path,
/// headers, and body. Upgrades are spliced bidirectionally after the
/// upstream 101.
async fn forward(mut req: Request, port: u16, upgrade: bool) -> Response {
    let stream = match tokio::time::timeout(
        FORWARD_TIMEOUT,
        TcpStream::connect(("127.0.0.1", port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(port = port, error = %e, "Upstream connect failed");
            return proxy_error();
        }
        Err(_) => return proxy_error(),
    };

    let io = TokioIo::new(stream);
    let (mut sender, conn) = match hyper::client::conn::http1::handshake::<_, Body>(io).await {
        Ok(pair) => pair,
        Err(e) => {
            debug!(port = port, error = %e, "Upstream handshake failed");
            return proxy_error();
        }
    };
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(error = %e, "Upstream connection closed");
        }
    });

    // Keep a handle on the client side of the upgrade before the request
    // is consumed.
    let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));

    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut upstream_req = match hyper::Request::builder()
        .method(parts.method)
        .uri(path_and_query)
        .body(body)
    {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Failed to build upstream request");
            return proxy_error();
        }
    };
    *upstream_req.headers_mut() = parts.headers;

    let mut response = match tokio::time::timeout(FORWARD_TIMEOUT, sender.send_request(upstream_req)).await
    {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            debug!(port = port, error = %e, "Upstream request failed");
            return proxy_error();
        }
        Err(_) => return proxy_error(),
    };

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(client_upgrade) = client_upgrade {
            let upstream_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(async move {
                match tokio::try_join!(client_upgrade, upstream_upgrade) {
                    Ok((client, upstream)) => {
                        let mut client = TokioIo::new(client);
                        let mut upstream = TokioIo::new(upstream);
                        if let Err(e) =
                            tokio::io::copy_bidirectional(&mut client, &mut upstream).await
                        {
                            debug!(error = %e, "WebSocket splice ended");
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "WebSocket upgrade failed");
                    }
                }
            });
        }
    }

    response.map(Body::new).into_response()
}

/// 502 for an unreachable upstream when no response has been written yet.
fn proxy_error() -> Response {
    envelope(
        StatusCode::BAD_GATEWAY,
        "PROXY_ERROR",
        "Upstream agent is unreachable",
    )
}
