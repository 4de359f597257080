// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for warden-gateway.

use std::path::PathBuf;
use std::time::Duration;

/// Path inside the agent container where the per-deployment data tree is
/// mounted.
pub const AGENT_DATA_MOUNT: &str = "/home/node/.openclaw";

/// Gateway configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// 32-byte AES key for secrets at rest (from 64 hex chars).
    pub encryption_key: [u8; 32],
    /// Apex domain the proxy serves tenant subdomains under.
    pub domain: String,
    /// Port the proxy listens on.
    pub proxy_port: u16,
    /// Lowest host port handed out to agents.
    pub min_agent_port: u16,
    /// Highest host port handed out to agents.
    pub max_agent_port: u16,
    /// Fixed port the agent listens on inside its container.
    pub agent_internal_port: u16,
    /// Default memory limit per agent container, in bytes.
    pub agent_memory_limit: i64,
    /// Default CPU quota per agent container, in nano-CPUs.
    pub agent_cpu_nano: i64,
    /// Runtime restart-policy retry bound per container.
    pub agent_max_restarts: i64,
    /// Overall health-check budget.
    pub health_check_timeout: Duration,
    /// Pause between health probes.
    pub health_check_interval: Duration,
    /// Fleet-wide cap on concurrently running agents.
    pub max_running_agents: u64,
    /// Fleet-wide cap on deployment records.
    pub max_deployments: u64,
    /// Healthy deployments idle longer than this are hibernated.
    pub idle_timeout: Duration,
    /// Name prefix for containers managed by this gateway.
    pub container_prefix: String,
    /// Host directory holding per-deployment config and data trees.
    pub data_path: PathBuf,
    /// Container image agents run.
    pub agent_image: String,
    /// Days before expiry the reminder email goes out.
    pub reminder_days: i64,
    /// Length of a paid subscription period, in days.
    pub subscription_days: i64,
    /// Minimum spacing between `last_request_at` writes per subdomain.
    pub touch_throttle: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL"))?;

        let encryption_key_hex = std::env::var("ENCRYPTION_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("ENCRYPTION_KEY"))?;
        let encryption_key = parse_encryption_key(&encryption_key_hex)?;

        let domain = std::env::var("DOMAIN").unwrap_or_else(|_| "localhost".to_string());

        let min_agent_port = env_parse("MIN_AGENT_PORT", 20_000)?;
        let max_agent_port = env_parse("MAX_AGENT_PORT", 30_000)?;
        if min_agent_port > max_agent_port {
            return Err(ConfigError::InvalidPortRange {
                min: min_agent_port,
                max: max_agent_port,
            });
        }

        Ok(Self {
            database_url,
            encryption_key,
            domain,
            proxy_port: env_parse("PROXY_PORT", 8080)?,
            min_agent_port,
            max_agent_port,
            agent_internal_port: env_parse("AGENT_INTERNAL_PORT", 18_789)?,
            agent_memory_limit: env_parse("AGENT_MEMORY_LIMIT", 768 * 1024 * 1024)?,
            agent_cpu_nano: env_parse("AGENT_CPU_NANO", 750_000_000)?,
            agent_max_restarts: env_parse("AGENT_MAX_RESTARTS", 3)?,
            health_check_timeout: Duration::from_millis(env_parse("HEALTH_CHECK_TIMEOUT", 120_000)?),
            health_check_interval: Duration::from_millis(env_parse("HEALTH_CHECK_INTERVAL", 2_000)?),
            max_running_agents: env_parse("MAX_RUNNING_AGENTS", 6)?,
            max_deployments: env_parse("MAX_DEPLOYMENTS", 50)?,
            idle_timeout: Duration::from_secs(env_parse("IDLE_TIMEOUT_MINUTES", 10u64)? * 60),
            container_prefix: std::env::var("CONTAINER_PREFIX")
                .unwrap_or_else(|_| "warden-agent-".to_string()),
            data_path: PathBuf::from(
                std::env::var("DATA_PATH").unwrap_or_else(|_| ".data".to_string()),
            ),
            agent_image: std::env::var("AGENT_IMAGE")
                .unwrap_or_else(|_| "warden/agent:latest".to_string()),
            reminder_days: env_parse("REMINDER_DAYS", 3)?,
            subscription_days: env_parse("SUBSCRIPTION_DAYS", 30)?,
            touch_throttle: Duration::from_millis(env_parse("TOUCH_THROTTLE_MS", 60_000)?),
        })
    }

    /// Canonical container name for a deployment.
    pub fn container_name(&self, deployment_id: &str) -> String {
        format!("{}{}", self.container_prefix, deployment_id)
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(default),
    }
}

fn parse_encryption_key(hex_key: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(hex_key).map_err(|_| ConfigError::InvalidEncryptionKey)?;
    bytes.try_into().map_err(|_| ConfigError::InvalidEncryptionKey)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable holds an unparseable value.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
    /// The encryption key is not 64 hex characters.
    #[error("ENCRYPTION_KEY must be 64 hex characters (32 bytes)")]
    InvalidEncryptionKey,
    /// The agent port range is empty.
    #[error("Invalid agent port range: {min}-{max}")]
    InvalidPortRange {
        /// Configured minimum port.
        min: u16,
        /// Configured maximum port.
        max: u16,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    fn set_required(guard: &mut EnvGuard) {
        guard.set("DATABASE_URL", "postgres://localhost/warden_test");
        guard.set("ENCRYPTION_KEY", &"ab".repeat(32));
    }

    #[test]
    fn test_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        set_required(&mut guard);
        for var in [
            "DOMAIN",
            "PROXY_PORT",
            "MIN_AGENT_PORT",
            "MAX_AGENT_PORT",
            "AGENT_INTERNAL_PORT",
            "AGENT_MEMORY_LIMIT",
            "AGENT_CPU_NANO",
            "AGENT_MAX_RESTARTS",
            "HEALTH_CHECK_TIMEOUT",
            "HEALTH_CHECK_INTERVAL",
            "MAX_RUNNING_AGENTS",
            "MAX_DEPLOYMENTS",
            "IDLE_TIMEOUT_MINUTES",
            "CONTAINER_PREFIX",
            "DATA_PATH",
            "AGENT_IMAGE",
            "REMINDER_DAYS",
            "SUBSCRIPTION_DAYS",
            "TOUCH_THROTTLE_MS",
        ] {
            guard.remove(var);
        }

        let config = Config::from_env().unwrap();
        assert_eq!(config.min_agent_port, 20_000);
        assert_eq!(config.max_agent_port, 30_000);
        assert_eq!(config.agent_internal_port, 18_789);
        assert_eq!(config.agent_memory_limit, 768 * 1024 * 1024);
        assert_eq!(config.agent_cpu_nano, 750_000_000);
        assert_eq!(config.agent_max_restarts, 3);
        assert_eq!(config.health_check_timeout, Duration::from_secs(120));
        assert_eq!(config.health_check_interval, Duration::from_secs(2));
        assert_eq!(config.max_running_agents, 6);
        assert_eq!(config.max_deployments, 50);
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.reminder_days, 3);
        assert_eq!(config.subscription_days, 30);
        assert_eq!(config.touch_throttle, Duration::from_secs(60));
        assert_eq!(config.domain, "localhost");
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.remove("DATABASE_URL");
        guard.set("ENCRYPTION_KEY", &"ab".repeat(32));

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::MissingEnvVar("DATABASE_URL"))
        ));
    }

    #[test]
    fn test_config_bad_encryption_key() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("DATABASE_URL", "postgres://localhost/warden_test");
        guard.set("ENCRYPTION_KEY", "not-hex");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidEncryptionKey)
        ));
    }

    #[test]
    fn test_config_inverted_port_range() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        set_required(&mut guard);
        guard.set("MIN_AGENT_PORT", "30000");
        guard.set("MAX_AGENT_PORT", "20000");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidPortRange { .. })
        ));
    }

    #[test]
    fn test_container_name() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        set_required(&mut guard);
        guard.set("CONTAINER_PREFIX", "warden-agent-");

        let config = Config::from_env().unwrap();
        assert_eq!(config.container_name("d-1"), "warden-agent-d-1");
    }
}
