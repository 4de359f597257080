// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-deployment on-host config files and workspace directories.
//!
//! The agent container consumes these through bind mounts:
//! `<data>/<id>/config` lands at `/config` and `<data>/<id>/data` at the
//! agent's home data path. Everything here is idempotent so re-spawns can
//! re-materialize over an existing tree.

use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::debug;

use warden_core::model::{Deployment, DeploymentSecrets};

use crate::config::AGENT_DATA_MOUNT;
use crate::error::Result;

/// File mode for secret-bearing config files.
#[cfg(unix)]
const SECRET_FILE_MODE: u32 = 0o600;

/// File mode for the initial memory file.
#[cfg(unix)]
const MEMORY_FILE_MODE: u32 = 0o644;

/// UID/GID the agent runs as inside its container.
#[cfg(unix)]
const AGENT_UID: u32 = 1000;

/// Paths produced for one deployment.
#[derive(Debug, Clone)]
pub struct MaterializedPaths {
    /// Host directory mounted at `/config`.
    pub config_dir: PathBuf,
    /// Host directory mounted at the agent data path.
    pub data_dir: PathBuf,
}

/// Writes per-deployment config trees under the gateway data path.
#[derive(Debug, Clone)]
pub struct ConfigMaterializer {
    data_path: PathBuf,
    agent_internal_port: u16,
}

impl ConfigMaterializer {
    /// Create a materializer rooted at `data_path`.
    pub fn new(data_path: impl Into<PathBuf>, agent_internal_port: u16) -> Self {
        Self {
            data_path: data_path.into(),
            agent_internal_port,
        }
    }

    /// Root of one deployment's tree: `<data>/<id>`.
    pub fn deployment_root(&self, deployment_id: &str) -> PathBuf {
        self.data_path.join(deployment_id)
    }

    /// Create directories and write config, auth profiles, and the initial
    /// memory file for a deployment. `secrets` must be plaintext here; the
    /// agent reads keys from its config tree, not from the database.
    pub async fn materialize(
        &self,
        deployment: &Deployment,
        secrets: &DeploymentSecrets,
        model: &str,
    ) -> Result<MaterializedPaths> {
        let root = self.deployment_root(&deployment.id);
        let config_dir = root.join("config");
        let data_dir = root.join("data");
        let workspace_memory = data_dir.join("workspace").join("memory");
        let agent_dir = data_dir.join("agents").join("main").join("agent");
        let legacy_agent_dir = data_dir.join("agent");

        for dir in [
            &config_dir,
            &data_dir,
            &workspace_memory,
            &agent_dir,
            &legacy_agent_dir,
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }

        self.write_agent_config(&config_dir, secrets, model).await?;

        // Auth profiles live at both the current and the legacy path; some
        // agent builds still read the old location.
        let profiles = auth_profiles(secrets);
        for dir in [&agent_dir, &legacy_agent_dir] {
            let path = dir.join("auth-profiles.json");
            write_secret_file(&path, &serde_json::to_vec_pretty(&profiles)?).await?;
        }

        self.write_initial_memory(&workspace_memory).await?;

        chown_tree(&root).await;

        debug!(
            deployment_id = %deployment.id,
            config_dir = %config_dir.display(),
            "Materialized deployment config"
        );

        Ok(MaterializedPaths { config_dir, data_dir })
    }

    async fn write_agent_config(
        &self,
        config_dir: &Path,
        secrets: &DeploymentSecrets,
        model: &str,
    ) -> Result<()> {
        let telegram_enabled = secrets.telegram_bot_token.is_some();
        let mut telegram = json!({
            "enabled": telegram_enabled,
            "dmPolicy": "open",
            "groupPolicy": "open",
            "allowFrom": ["*"],
        });
        if let Some(token) = &secrets.telegram_bot_token {
            telegram["botToken"] = json!(token);
        }

        let document = json!({
            "agents": {
                "defaults": {
                    "model": { "primary": model },
                    "workspace": format!("{AGENT_DATA_MOUNT}/workspace"),
                }
            },
            "gateway": {
                "port": self.agent_internal_port,
                "auth": {
                    "mode": "token",
                    "token": secrets.web_ui_token,
                }
            },
            "channels": {
                "telegram": telegram,
            },
            "plugins": {
                "entries": {
                    "telegram": { "enabled": telegram_enabled }
                }
            },
        });

        let path = config_dir.join("openclaw.json");
        write_secret_file(&path, &serde_json::to_vec_pretty(&document)?).await?;
        Ok(())
    }

    async fn write_initial_memory(&self, memory_dir: &Path) -> Result<()> {
        let today = Utc::now().format("%Y-%m-%d");
        let path = memory_dir.join(format!("{today}.md"));
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        let content = format!("# Memory log started {today}\n");
        tokio::fs::write(&path, content).await?;
        #[cfg(unix)]
        set_mode(&path, MEMORY_FILE_MODE).await;
        Ok(())
    }
}

fn auth_profiles(secrets: &DeploymentSecrets) -> serde_json::Value {
    let mut profiles = serde_json::Map::new();
    if let Some(key) = &secrets.google_api_key {
        profiles.insert(
            "google:default".into(),
            json!({ "provider": "google", "apiKey": key }),
        );
    }
    if let Some(key) = &secrets.anthropic_api_key {
        profiles.insert(
            "anthropic:default".into(),
            json!({ "provider": "anthropic", "apiKey": key }),
        );
    }
    if let Some(key) = &secrets.openai_api_key {
        profiles.insert(
            "openai:default".into(),
            json!({ "provider": "openai", "apiKey": key }),
        );
    }
    json!({ "version": 1, "profiles": profiles })
}

async fn write_secret_file(path: &Path, content: &[u8]) -> Result<()> {
    tokio::fs::write(path, content).await?;
    #[cfg(unix)]
    set_mode(path, SECRET_FILE_MODE).await;
    Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) {
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = tokio::fs::set_permissions(path, Permissions::from_mode(mode)).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to set file mode");
    }
}

/// Best-effort chown of the deployment tree to the agent's in-container
/// uid/gid. Requires privileges; failure is logged and ignored.
#[cfg(unix)]
async fn chown_tree(root: &Path) {
    use nix::unistd::{Gid, Uid, chown};

    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if let Err(e) = chown(
            &dir,
            Some(Uid::from_raw(AGENT_UID)),
            Some(Gid::from_raw(AGENT_UID)),
        ) {
            tracing::warn!(path = %dir.display(), error = %e, "Failed to chown deployment dir");
            return;
        }
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                stack.push(entry.path());
            }
        }
    }
}

#[cfg(not(unix))]
async fn chown_tree(_root: &Path) {}
