//! Container runtime capability and its Docker implementation

use crate::config::PullPolicy;
use crate::image::ImageRef;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Seconds Docker waits for a container to exit before killing it
const STOP_GRACE_PERIOD_SECS: i64 = 10;

/// Everything needed to create a container for a service
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name, also its hostname on the managed network
    pub name: String,
    pub image: ImageRef,
    pub network: String,
    pub env: HashMap<String, String>,
}

/// Summary of a container known to the runtime
#[derive(Debug, Clone, Default)]
pub struct ContainerSummary {
    pub id: String,
    /// Names as reported by Docker (with a leading `/`)
    pub names: Vec<String>,
    pub network_mode: Option<String>,
}

impl ContainerSummary {
    /// True if any of the container's names equals `name`
    pub fn has_name(&self, name: &str) -> bool {
        self.names
            .iter()
            .any(|n| n.strip_prefix('/').unwrap_or(n) == name)
    }
}

/// Operations the lifecycle needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make the image available locally
    async fn pull_image(&self, image: &ImageRef) -> anyhow::Result<()>;

    /// Create the network unless it already exists
    async fn ensure_network(&self, name: &str) -> anyhow::Result<()>;

    /// Create a container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> anyhow::Result<String>;

    async fn start_container(&self, container_id: &str) -> anyhow::Result<()>;

    async fn stop_container(&self, container_id: &str) -> anyhow::Result<()>;

    /// Remove a container. Removing a missing container succeeds.
    async fn remove_container(&self, container_id: &str) -> anyhow::Result<()>;

    /// Ports exposed by the container, ascending
    async fn inspect_ports(&self, container_id: &str) -> anyhow::Result<Vec<u16>>;

    async fn inspect_env(&self, container_id: &str) -> anyhow::Result<HashMap<String, String>>;

    async fn list_containers(&self) -> anyhow::Result<Vec<ContainerSummary>>;
}

/// Container runtime backed by the Docker Engine API
pub struct DockerRuntime {
    client: Docker,
    pull_policy: PullPolicy,
}

impl DockerRuntime {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn new(docker_host: Option<&str>, pull_policy: PullPolicy) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host,
                    e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}",
                    host,
                    e
                )
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        client
            .ping()
            .await
            .map_err(|e| anyhow::anyhow!("Docker daemon is not responding: {}", e))?;

        debug!("Connected to Docker daemon");
        Ok(Self {
            client,
            pull_policy,
        })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION).map_err(
                |e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e),
            )
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker host '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        for (name, path) in &socket_paths {
            if path.starts_with("/.") || path.starts_with("/podman") {
                continue; // empty env var
            }
            if std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                if let Ok(client) =
                    Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                {
                    if client.ping().await.is_ok() {
                        return Ok(client);
                    }
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon: {}. \
                 Start dockerd or set docker.host / DOCKER_HOST.",
                e
            )
        })
    }

    async fn image_exists(&self, reference: &str) -> bool {
        self.client.inspect_image(reference).await.is_ok()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, image: &ImageRef) -> anyhow::Result<()> {
        let reference = image.to_string();

        let should_pull = match self.pull_policy {
            PullPolicy::Always => true,
            PullPolicy::Never => {
                if !self.image_exists(&reference).await {
                    anyhow::bail!(
                        "Image '{}' not found locally and pull_policy is 'never'",
                        reference
                    );
                }
                false
            }
            PullPolicy::IfNotPresent => !self.image_exists(&reference).await,
        };

        if !should_pull {
            debug!(image = %reference, "Image exists locally, skipping pull");
            return Ok(());
        }

        info!(image = %reference, "Pulling image");
        let options = CreateImageOptions {
            from_image: reference.as_str(),
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let progress = result
                .map_err(|e| anyhow::anyhow!("Failed to pull image '{}': {}", reference, e))?;
            if let Some(error) = progress.error {
                anyhow::bail!("Failed to pull image '{}': {}", reference, error);
            }
            if let Some(status) = progress.status {
                debug!(image = %reference, status, "Pull progress");
            }
        }

        info!(image = %reference, "Image pulled successfully");
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> anyhow::Result<()> {
        match self
            .client
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => {
                debug!(network = name, "Network exists");
                return Ok(());
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to inspect network '{}': {}", name, e)),
        }

        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            ..Default::default()
        };
        self.client
            .create_network(options)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create network '{}': {}", name, e))?;

        info!(network = name, "Created network");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        let image = spec.image.to_string();
        let env = if spec.env.is_empty() {
            None
        } else {
            Some(
                spec.env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>(),
            )
        };

        let config = Config {
            image: Some(image.clone()),
            env,
            host_config: Some(HostConfig {
                network_mode: Some(spec.network.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| {
                let err_str = e.to_string();
                if err_str.contains("Conflict") && err_str.contains("name") {
                    anyhow::anyhow!(
                        "Container name '{}' already exists. Remove it with: docker rm -f {}",
                        spec.name,
                        spec.name
                    )
                } else {
                    anyhow::anyhow!(
                        "Failed to create container '{}' from image '{}': {}",
                        spec.name,
                        image,
                        e
                    )
                }
            })?;

        for warning in &response.warnings {
            warn!(container = %spec.name, warning, "Docker warning on create");
        }
        info!(container = %spec.name, container_id = %response.id, image, "Created container");
        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> anyhow::Result<()> {
        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start container {}: {}", container_id, e))?;
        info!(container_id, "Started container");
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> anyhow::Result<()> {
        let options = StopContainerOptions {
            t: STOP_GRACE_PERIOD_SECS,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => {
                info!(container_id, "Stopped container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id, "Container was already stopped");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to stop container {}: {}", container_id, e)),
        }
    }

    async fn remove_container(&self, container_id: &str) -> anyhow::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(container_id, Some(options)).await {
            Ok(_) => {
                debug!(container_id, "Removed container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to remove container {}: {}", container_id, e)),
        }
    }

    async fn inspect_ports(&self, container_id: &str) -> anyhow::Result<Vec<u16>> {
        let info = self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to inspect container {}: {}", container_id, e))?;

        let exposed = info
            .config
            .and_then(|c| c.exposed_ports)
            .unwrap_or_default();
        Ok(parse_exposed_ports(exposed.keys().map(String::as_str)))
    }

    async fn inspect_env(&self, container_id: &str) -> anyhow::Result<HashMap<String, String>> {
        let info = self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to inspect container {}: {}", container_id, e))?;

        let env = info.config.and_then(|c| c.env).unwrap_or_default();
        Ok(parse_env(&env))
    }

    async fn list_containers(&self) -> anyhow::Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list containers: {}", e))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    names: c.names.unwrap_or_default(),
                    network_mode: c.host_config.and_then(|h| h.network_mode),
                })
            })
            .collect())
    }
}

/// Parse Docker port keys such as `8080/tcp` into sorted, unique port numbers
fn parse_exposed_ports<'a>(keys: impl Iterator<Item = &'a str>) -> Vec<u16> {
    let mut ports: Vec<u16> = keys
        .filter_map(|key| key.split('/').next())
        .filter_map(|port| port.parse().ok())
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

/// Parse `KEY=VALUE` entries, splitting on the first `=`
fn parse_env(entries: &[String]) -> HashMap<String, String> {
    entries
        .iter()
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
