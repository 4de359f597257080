// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runtime for testing.
//!
//! Simulates container lifecycle without a daemon. A started mock container
//! serves a minimal HTTP responder on its published host port, so health
//! probes, bind checks, and proxy forwards behave exactly as they would
//! against a live agent.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

use super::{
    ContainerRuntime, ContainerSpec, ContainerState, ContainerSummary, PortBinding, PublishedPort,
    Result, RuntimeError,
};

struct MockContainer {
    name: String,
    running: bool,
    port_bindings: Vec<PortBinding>,
    /// Accept loop holding the published port while the container "runs".
    server: Option<JoinHandle<()>>,
}

impl MockContainer {
    fn stop_server(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

/// Bind the container's published port and answer every request with a
/// canned 200.
fn serve_port(host_port: u16) -> std::io::Result<JoinHandle<()>> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", host_port))?;
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;

    Ok(tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                let _ = stream.read(&mut buf).await;
                let body = "agent online";
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    }))
}

#[derive(Default)]
struct Inner {
    containers: HashMap<String, MockContainer>,
    images: HashSet<String>,
    next_id: u64,
}

/// Mock implementation of [`ContainerRuntime`].
#[derive(Default)]
pub struct MockRuntime {
    inner: Mutex<Inner>,
    /// Fail the next `create_container` calls with this message.
    pub fail_create: Mutex<Option<String>>,
    /// Fail the next `start_container` calls with this message.
    pub fail_start: Mutex<Option<String>>,
    /// Fail `list_containers` (simulates an unreachable daemon).
    pub fail_list: Mutex<bool>,
    /// If true, started containers do not bind their published port, so
    /// health probes never succeed.
    pub skip_listener: Mutex<bool>,
    /// Artificial delay inside `pull_image`.
    pub pull_delay: Mutex<Duration>,
    pull_count: AtomicUsize,
    create_count: AtomicUsize,
}

impl MockRuntime {
    /// Create an empty mock runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock runtime that already has `image` available.
    pub fn with_image(image: &str) -> Self {
        let runtime = Self::new();
        runtime.add_image(image);
        runtime
    }

    /// Make an image locally available.
    pub fn add_image(&self, reference: &str) {
        self.inner.lock().unwrap().images.insert(reference.to_string());
    }

    /// Forget a local image (forces the next spawn to pull).
    pub fn remove_image(&self, reference: &str) {
        self.inner.lock().unwrap().images.remove(reference);
    }

    /// Number of `pull_image` calls so far.
    pub fn pull_count(&self) -> usize {
        self.pull_count.load(Ordering::SeqCst)
    }

    /// Number of `create_container` calls so far.
    pub fn create_count(&self) -> usize {
        self.create_count.load(Ordering::SeqCst)
    }

    /// Names of all containers currently known to the runtime.
    pub fn container_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .values()
            .map(|c| c.name.clone())
            .collect()
    }

    /// Simulate a container dying out from under the control plane.
    pub fn kill_container(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(mut container) = inner.containers.remove(id) {
            container.stop_server();
        }
    }

    /// Register a container directly (for seeding zombie scenarios).
    pub fn seed_container(&self, id: &str, name: &str, running: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.containers.insert(
            id.to_string(),
            MockContainer {
                name: name.to_string(),
                running,
                port_bindings: Vec::new(),
                server: None,
            },
        );
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn runtime_type(&self) -> &'static str {
        "mock"
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        if *self.fail_list.lock().unwrap() {
            return Err(RuntimeError::Unavailable("mock daemon down".into()));
        }
        Ok(self
            .inner
            .lock()
            .unwrap()
            .containers
            .iter()
            .filter(|(_, c)| all || c.running)
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                names: vec![c.name.clone()],
                ports: c
                    .port_bindings
                    .iter()
                    .map(|b| PublishedPort {
                        private_port: b.container_port,
                        public_port: Some(b.host_port),
                        proto: "tcp".to_string(),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().images.contains(reference))
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        self.pull_count.fetch_add(1, Ordering::SeqCst);
        let delay = *self.pull_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner.lock().unwrap().images.insert(reference.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        if let Some(message) = self.fail_create.lock().unwrap().clone() {
            return Err(RuntimeError::Other(message));
        }
        self.create_count.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        if inner.containers.values().any(|c| c.name == spec.name) {
            return Err(RuntimeError::Other(format!(
                "container name {} already in use",
                spec.name
            )));
        }
        inner.next_id += 1;
        let id = format!("mock-{:08x}", inner.next_id);
        inner.containers.insert(
            id.clone(),
            MockContainer {
                name: spec.name.clone(),
                running: false,
                port_bindings: spec.port_bindings.clone(),
                server: None,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        if let Some(message) = self.fail_start.lock().unwrap().clone() {
            return Err(RuntimeError::Other(message));
        }
        let skip_listener = *self.skip_listener.lock().unwrap();
        let mut inner = self.inner.lock().unwrap();
        let Some(container) = inner.containers.get_mut(id) else {
            return Err(RuntimeError::NotFound(id.to_string()));
        };
        if container.running {
            return Ok(());
        }
        if !skip_listener {
            if let Some(binding) = container.port_bindings.first() {
                let server = serve_port(binding.host_port)
                    .map_err(|e| RuntimeError::PortAllocated(e.to_string()))?;
                container.server = Some(server);
            }
        }
        container.running = true;
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(container) = inner.containers.get_mut(id) else {
            return Err(RuntimeError::NotFound(id.to_string()));
        };
        container.running = false;
        container.stop_server();
        Ok(())
    }

    async fn restart_container(&self, id: &str, _grace: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(container) = inner.containers.get_mut(id) else {
            return Err(RuntimeError::NotFound(id.to_string()));
        };
        if container.server.is_none() {
            if let Some(binding) = container.port_bindings.first() {
                let server = serve_port(binding.host_port)
                    .map_err(|e| RuntimeError::PortAllocated(e.to_string()))?;
                container.server = Some(server);
            }
        }
        container.running = true;
        Ok(())
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.containers.remove(id) {
            Some(mut container) => {
                container.stop_server();
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerState>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| ContainerState {
                id: id.to_string(),
                running: c.running,
                exit_code: if c.running { None } else { Some(0) },
            }))
    }

    async fn container_logs(&self, id: &str, _tail: usize, _timestamps: bool) -> Result<String> {
        let inner = self.inner.lock().unwrap();
        if !inner.containers.contains_key(id) {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        Ok(String::new())
    }
}
