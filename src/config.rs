use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener, admin API and forwarding settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Persistence settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Container runtime settings
    #[serde(default)]
    pub docker: DockerConfig,

    /// Static routes registered at startup (route key -> target)
    #[serde(default)]
    pub routes: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Public listener port (default: 80)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Path prefix reserved for the admin API (default: /admin)
    #[serde(default = "default_admin_prefix")]
    pub admin_prefix: String,

    /// Bearer token required by the admin API. Unset means no authentication.
    pub admin_token: Option<String>,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for a backend response in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            admin_prefix: default_admin_prefix(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// SQLite database file (default: delne.db)
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Image pull policy
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull if image doesn't exist locally (default)
    #[default]
    #[serde(alias = "if-not-present")]
    IfNotPresent,
    /// Always pull before creating a container
    Always,
    /// Never pull, fail if image doesn't exist
    Never,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// Docker host URL (default: DOCKER_HOST, then common socket paths)
    pub host: Option<String>,

    /// Network managed containers are attached to (default: delne)
    #[serde(default = "default_network")]
    pub network: String,

    #[serde(default)]
    pub pull_policy: PullPolicy,

    /// Name of the proxy's own container, never removed on restore (default: delne)
    #[serde(default = "default_self_container")]
    pub self_container: String,

    /// Timeout for create/start/stop/remove/inspect calls in seconds (default: 60)
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Timeout for image pulls in seconds (default: 600)
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout_secs: u64,

    /// Recreate containers for persisted services at startup (default: true)
    #[serde(default = "default_restore_on_startup")]
    pub restore_on_startup: bool,
}

impl DockerConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            network: default_network(),
            pull_policy: PullPolicy::default(),
            self_container: default_self_container(),
            operation_timeout_secs: default_operation_timeout(),
            pull_timeout_secs: default_pull_timeout(),
            restore_on_startup: default_restore_on_startup(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    80
}

fn default_admin_prefix() -> String {
    "/admin".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    30
}

fn default_database_path() -> String {
    "delne.db".to_string()
}

fn default_network() -> String {
    "delne".to_string()
}

fn default_self_container() -> String {
    "delne".to_string()
}

fn default_operation_timeout() -> u64 {
    60
}

fn default_pull_timeout() -> u64 {
    600
}

fn default_restore_on_startup() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let prefix = &self.server.admin_prefix;
        if !prefix.starts_with('/') || prefix.len() < 2 || prefix.ends_with('/') {
            errors.push(format!(
                "server.admin_prefix '{}' must start with '/', be non-empty and have no trailing '/'",
                prefix
            ));
        }
        if self.server.request_timeout_secs == 0 {
            errors.push("server.request_timeout_secs must be greater than 0".to_string());
        }
        if self.docker.network.trim().is_empty() {
            errors.push("docker.network must not be empty".to_string());
        }
        if self.docker.operation_timeout_secs == 0 {
            errors.push("docker.operation_timeout_secs must be greater than 0".to_string());
        }
        if self.docker.pull_timeout_secs == 0 {
            errors.push("docker.pull_timeout_secs must be greater than 0".to_string());
        }
        for (key, target) in &self.routes {
            if key.trim().is_empty() {
                errors.push("routes: route key must not be empty".to_string());
            }
            if target.trim().is_empty() {
                errors.push(format!("routes.\"{}\": target must not be empty", key));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
