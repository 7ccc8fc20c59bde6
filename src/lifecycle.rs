//! Service lifecycle: PULLING -> CREATED -> RUNNING <-> STOPPED, with ERROR on failure
//!
//! Every operation on a service runs under that service's mutex. Routes for a
//! service's hosts are only added once its container is running and its port
//! has been persisted.

use crate::config::DockerConfig;
use crate::db::{ImageRecord, NewService, ServiceRecord, ServiceStatus, ServiceStore};
use crate::docker::{ContainerRuntime, ContainerSpec};
use crate::error::{Error, Result};
use crate::image::ImageRef;
use crate::routing::{normalize_key, RoutingTable};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Maximum length of a service name
const MAX_SERVICE_NAME_LEN: usize = 63;

/// Settings the lifecycle needs from the container runtime configuration
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub network: String,
    pub operation_timeout: Duration,
    pub pull_timeout: Duration,
    /// Container never removed during restore
    pub self_container: String,
}

impl LifecycleSettings {
    pub fn from_config(config: &DockerConfig) -> Self {
        Self {
            network: config.network.clone(),
            operation_timeout: config.operation_timeout(),
            pull_timeout: config.pull_timeout(),
            self_container: config.self_container.clone(),
        }
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from_config(&DockerConfig::default())
    }
}

/// Request to register a new service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateService {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// A service together with its image, for rendering
#[derive(Debug, Clone, Serialize)]
pub struct ServiceView {
    #[serde(flatten)]
    pub service: ServiceRecord,
    pub image: Option<ImageRecord>,
    pub url: Option<String>,
}

/// Result of an operation that rebuilds a container in the background
#[derive(Debug)]
pub struct Bootstrapping {
    pub view: ServiceView,
    /// Completes once the bootstrap sequence finished or failed
    pub task: JoinHandle<()>,
}

/// Per-service mutexes, kept only while someone holds or waits on them
#[derive(Debug, Default)]
struct ServiceLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ServiceLocks {
    async fn acquire(&self, name: &str) -> ServiceGuard<'_> {
        let lock = Arc::clone(self.locks.entry(name.to_string()).or_default().value());
        let guard = lock.lock_owned().await;
        ServiceGuard {
            locks: &self.locks,
            name: name.to_string(),
            guard: Some(guard),
        }
    }

    fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Held lock on one service; the registry entry goes away with the last holder
struct ServiceGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ServiceGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone, so the count only reaches 1 when nobody else wants it
        self.locks
            .remove_if(&self.name, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Drives managed services through their lifecycle
pub struct ServiceManager {
    store: Arc<dyn ServiceStore>,
    runtime: Arc<dyn ContainerRuntime>,
    routes: Arc<RoutingTable>,
    settings: LifecycleSettings,
    locks: ServiceLocks,
}

impl ServiceManager {
    pub fn new(
        store: Arc<dyn ServiceStore>,
        runtime: Arc<dyn ContainerRuntime>,
        routes: Arc<RoutingTable>,
        settings: LifecycleSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            runtime,
            routes,
            settings,
            locks: ServiceLocks::default(),
        })
    }

    pub fn routes(&self) -> &Arc<RoutingTable> {
        &self.routes
    }

    pub fn store(&self) -> &Arc<dyn ServiceStore> {
        &self.store
    }

    /// Number of services with a held or awaited lock
    pub fn locked_services(&self) -> usize {
        self.locks.len()
    }

    fn find(&self, name: &str) -> Result<ServiceRecord> {
        self.store
            .get_service_by_name(name)
            .map_err(Error::Storage)?
            .ok_or_else(|| Error::not_found("service", name))
    }

    fn view(&self, service: ServiceRecord) -> Result<ServiceView> {
        let image = self
            .store
            .get_image(service.image_id)
            .map_err(Error::Storage)?;
        Ok(ServiceView {
            url: service.url(),
            service,
            image,
        })
    }

    fn view_by_name(&self, name: &str) -> Result<ServiceView> {
        let service = self.find(name)?;
        self.view(service)
    }

    pub fn get_service(&self, name: &str) -> Result<ServiceView> {
        self.view_by_name(name)
    }

    pub fn list_services(&self) -> Result<Vec<ServiceView>> {
        let images: HashMap<i64, ImageRecord> = self
            .store
            .list_images()
            .map_err(Error::Storage)?
            .into_iter()
            .map(|image| (image.id, image))
            .collect();

        Ok(self
            .store
            .list_services()
            .map_err(Error::Storage)?
            .into_iter()
            .map(|service| ServiceView {
                url: service.url(),
                image: images.get(&service.image_id).cloned(),
                service,
            })
            .collect())
    }

    /// Register a service and start bootstrapping its container in the background
    pub async fn create_service(self: &Arc<Self>, request: CreateService) -> Result<Bootstrapping> {
        let name = request.name.trim().to_string();
        validate_service_name(&name)?;

        validate_env(&request.env)?;
        let image = ImageRef::parse(&request.image);
        if image.is_empty() {
            return Err(Error::Validation("image is required".to_string()));
        }

        let hosts = normalize_hosts(&request.hosts);
        if hosts.is_empty() {
            return Err(Error::Validation("at least one host is required".to_string()));
        }

        let _guard = self.locks.acquire(&name).await;

        if self
            .store
            .get_service_by_name(&name)
            .map_err(Error::Storage)?
            .is_some()
        {
            return Err(Error::Conflict(format!("service '{}' already exists", name)));
        }

        let image_id = self.store.insert_image(&image).map_err(Error::Storage)?;
        let id = self
            .store
            .insert_service(&NewService {
                name: name.clone(),
                hosts,
                image_id,
                network: self.settings.network.clone(),
            })
            .map_err(Error::Storage)?;
        if !request.env.is_empty() {
            self.store
                .update_env(id, &request.env)
                .map_err(Error::Storage)?;
        }

        info!(service = %name, image = %image, "Registered service");

        let view = self.view_by_name(&name)?;
        let task = self.spawn_bootstrap(&name);
        Ok(Bootstrapping { view, task })
    }

    fn spawn_bootstrap(self: &Arc<Self>, name: &str) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move { manager.run_bootstrap(&name).await })
    }

    /// Pull, create and start the service's container, marking it ERROR on failure
    async fn run_bootstrap(&self, name: &str) {
        let service = match self.store.get_service_by_name(name) {
            Ok(Some(service)) => service,
            Ok(None) => return,
            Err(e) => {
                error!(service = %name, error = %e, "Failed to load service for bootstrap");
                return;
            }
        };
        if let Err(e) = self.bootstrap(&service).await {
            error!(service = %name, error = %e, "Bootstrap failed");
            match self.store.get_service_by_name(name) {
                Ok(Some(current)) if current.id == service.id => self.mark_error(&current),
                Ok(_) => {}
                Err(e) => error!(service = %name, error = %e, "Failed to load service after bootstrap failure"),
            }
        }
    }

    async fn bootstrap(&self, service: &ServiceRecord) -> Result<()> {
        let name = service.name.as_str();
        let (service_id, image_id) = (service.id, service.image_id);
        let image = self
            .store
            .get_image(image_id)
            .map_err(Error::Storage)?
            .ok_or_else(|| Error::not_found("image", image_id.to_string()))?
            .image;

        // Pulls can be slow, so they run outside the service lock
        orchestrate(
            "pull image",
            self.settings.pull_timeout,
            self.runtime.pull_image(&image),
        )
        .await?;

        let _guard = self.locks.acquire(name).await;

        let service = match self.store.get_service_by_name(name).map_err(Error::Storage)? {
            Some(service) => service,
            None => {
                debug!(service = %name, "Service deleted during pull, abandoning bootstrap");
                return Ok(());
            }
        };
        // A delete and recreate during the pull leaves a different record under the same name
        if service.id != service_id || service.image_id != image_id {
            debug!(service = %name, "Service replaced during pull, abandoning bootstrap");
            return Ok(());
        }
        if service.container_id.is_some() {
            debug!(service = %name, "Container already exists, skipping bootstrap");
            return Ok(());
        }

        orchestrate(
            "ensure network",
            self.settings.operation_timeout,
            self.runtime.ensure_network(&service.network),
        )
        .await?;

        let spec = ContainerSpec {
            name: service.name.clone(),
            image,
            network: service.network.clone(),
            env: service.env.clone(),
        };
        let container_id = orchestrate(
            "create container",
            self.settings.operation_timeout,
            self.runtime.create_container(&spec),
        )
        .await?;

        self.store
            .update_container_id(service.id, Some(&container_id))
            .map_err(Error::Storage)?;
        self.store
            .update_status(service.id, ServiceStatus::Created)
            .map_err(Error::Storage)?;
        info!(service = %name, container_id = %container_id, "Service created");

        self.start_container(&service, &container_id).await
    }

    /// Start the container, discover its port and env, then publish its routes
    async fn start_container(&self, service: &ServiceRecord, container_id: &str) -> Result<()> {
        let timeout = self.settings.operation_timeout;
        orchestrate(
            "start container",
            timeout,
            self.runtime.start_container(container_id),
        )
        .await?;

        self.store
            .update_status(service.id, ServiceStatus::Running)
            .map_err(Error::Storage)?;

        let discovered = async {
            let ports =
                orchestrate("inspect ports", timeout, self.runtime.inspect_ports(container_id))
                    .await?;
            let port = ports.first().copied().ok_or_else(|| {
                Error::Orchestration(anyhow::anyhow!(
                    "container {} exposes no ports",
                    container_id
                ))
            })?;
            let env =
                orchestrate("inspect env", timeout, self.runtime.inspect_env(container_id)).await?;
            Ok::<_, Error>((port, env))
        }
        .await;

        let (port, env) = match discovered {
            Ok(found) => found,
            Err(e) => {
                self.mark_error(service);
                return Err(e);
            }
        };

        self.store
            .update_port(service.id, Some(port))
            .map_err(Error::Storage)?;
        self.store
            .update_env(service.id, &env)
            .map_err(Error::Storage)?;

        self.routes.invalidate_target(&service.name);
        for host in &service.hosts {
            self.routes.register(host, &service.name);
        }

        info!(
            service = %service.name,
            container_id,
            port,
            hosts = ?service.hosts,
            "Service running"
        );
        Ok(())
    }

    fn mark_error(&self, service: &ServiceRecord) {
        if let Err(e) = self.store.update_status(service.id, ServiceStatus::Error) {
            error!(service = %service.name, error = %e, "Failed to persist ERROR status");
        }
        self.routes.invalidate_target(&service.name);
    }

    /// Start a CREATED or STOPPED service
    pub async fn start(&self, name: &str) -> Result<ServiceView> {
        let _guard = self.locks.acquire(name).await;

        let service = self.find(name)?;
        match service.status {
            ServiceStatus::Created | ServiceStatus::Stopped => {}
            status => {
                return Err(Error::Conflict(format!(
                    "cannot start service '{}' in status {}",
                    name, status
                )))
            }
        }
        let container_id = service
            .container_id
            .clone()
            .ok_or_else(|| Error::MissingContainer(name.to_string()))?;

        self.start_container(&service, &container_id).await?;
        self.view_by_name(name)
    }

    /// Stop a RUNNING service, keeping its routes
    pub async fn stop(&self, name: &str) -> Result<ServiceView> {
        let _guard = self.locks.acquire(name).await;

        let service = self.find(name)?;
        if service.status != ServiceStatus::Running {
            return Err(Error::Conflict(format!(
                "cannot stop service '{}' in status {}",
                name, service.status
            )));
        }
        let container_id = service
            .container_id
            .as_deref()
            .ok_or_else(|| Error::MissingContainer(name.to_string()))?;

        orchestrate(
            "stop container",
            self.settings.operation_timeout,
            self.runtime.stop_container(container_id),
        )
        .await?;

        self.store
            .update_status(service.id, ServiceStatus::Stopped)
            .map_err(Error::Storage)?;
        self.routes.invalidate_target(name);

        info!(service = %name, container_id, "Service stopped");
        self.view_by_name(name)
    }

    /// Replace the service's environment and rebuild its container
    pub async fn update_env(
        self: &Arc<Self>,
        name: &str,
        env: HashMap<String, String>,
    ) -> Result<Bootstrapping> {
        validate_env(&env)?;
        let guard = self.locks.acquire(name).await;

        let service = self.find(name)?;
        self.teardown_for_rebuild(&service, &env).await?;
        drop(guard);

        let view = self.view_by_name(name)?;
        let task = self.spawn_bootstrap(name);
        Ok(Bootstrapping { view, task })
    }

    /// Remove one environment variable and rebuild the container
    pub async fn remove_env_var(self: &Arc<Self>, name: &str, key: &str) -> Result<Bootstrapping> {
        let guard = self.locks.acquire(name).await;

        let service = self.find(name)?;
        if !service.env.contains_key(key) {
            return Err(Error::not_found("environment variable", key));
        }
        let mut env = service.env.clone();
        env.remove(key);
        self.teardown_for_rebuild(&service, &env).await?;
        drop(guard);

        let view = self.view_by_name(name)?;
        let task = self.spawn_bootstrap(name);
        Ok(Bootstrapping { view, task })
    }

    async fn teardown_for_rebuild(
        &self,
        service: &ServiceRecord,
        env: &HashMap<String, String>,
    ) -> Result<()> {
        if let Some(container_id) = service.container_id.as_deref() {
            orchestrate(
                "remove container",
                self.settings.operation_timeout,
                self.runtime.remove_container(container_id),
            )
            .await?;
        }

        self.store
            .update_container_id(service.id, None)
            .map_err(Error::Storage)?;
        self.store
            .update_port(service.id, None)
            .map_err(Error::Storage)?;
        self.store
            .update_status(service.id, ServiceStatus::Stopped)
            .map_err(Error::Storage)?;
        self.store
            .update_env(service.id, env)
            .map_err(Error::Storage)?;
        self.routes.invalidate_target(&service.name);

        info!(service = %service.name, vars = env.len(), "Rebuilding service with new environment");
        Ok(())
    }

    /// Remove the container, every route to the service and its record
    pub async fn delete(&self, name: &str) -> Result<()> {
        let _guard = self.locks.acquire(name).await;

        let service = self.find(name)?;
        if let Some(container_id) = service.container_id.as_deref() {
            orchestrate(
                "remove container",
                self.settings.operation_timeout,
                self.runtime.remove_container(container_id),
            )
            .await?;
        }

        let removed = self.routes.unregister(name);
        self.store
            .delete_service(service.id)
            .map_err(Error::Storage)?;

        info!(service = %name, routes = ?removed, "Service deleted");
        Ok(())
    }

    pub fn list_routes(&self) -> BTreeMap<String, String> {
        self.routes.list_all()
    }

    /// Map `host` to `target`. Managed services keep the host in their persisted host list.
    pub async fn register_route(&self, host: &str, target: &str) -> Result<()> {
        let (host, target) = validate_route(host, target)?;
        let host = host.as_str();

        let _guard = self.locks.acquire(target).await;

        self.routes.register(host, target);
        self.sync_hosts(None, host, target)?;
        info!(host, target, "Route registered");
        Ok(())
    }

    /// Replace `old_host` with `new_host`, pointing at `target`
    pub async fn rebind_route(&self, old_host: &str, new_host: &str, target: &str) -> Result<()> {
        let old_host = normalize_key(old_host);
        let old_host = old_host.as_str();
        let (new_host, target) = validate_route(new_host, target)?;
        let new_host = new_host.as_str();
        if !self.routes.list_all().contains_key(old_host) {
            return Err(Error::not_found("route", old_host));
        }

        let _guard = self.locks.acquire(target).await;

        self.routes.rebind(old_host, new_host, target);
        self.sync_hosts(Some(old_host), new_host, target)?;
        info!(old_host, new_host, target, "Route rebound");
        Ok(())
    }

    /// Keep persisted host lists in line with a route change
    fn sync_hosts(&self, old_host: Option<&str>, host: &str, target: &str) -> Result<()> {
        for service in self.store.list_services().map_err(Error::Storage)? {
            let mut hosts: Vec<String> = service
                .hosts
                .iter()
                .filter(|h| Some(h.as_str()) != old_host && h.as_str() != host)
                .cloned()
                .collect();
            if service.name == target {
                hosts.push(host.to_string());
            }
            if hosts != service.hosts {
                self.store
                    .update_hosts(service.id, &hosts)
                    .map_err(Error::Storage)?;
                debug!(service = %service.name, hosts = ?hosts, "Updated persisted hosts");
            }
        }
        Ok(())
    }

    /// Remove leftover containers on the managed network and rebootstrap every persisted service
    pub async fn restore(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let timeout = self.settings.operation_timeout;
        let containers =
            orchestrate("list containers", timeout, self.runtime.list_containers()).await?;

        for container in containers {
            if container.network_mode.as_deref() != Some(self.settings.network.as_str())
                || container.has_name(&self.settings.self_container)
            {
                continue;
            }
            debug!(container_id = %container.id, names = ?container.names, "Removing stale container");
            orchestrate(
                "remove container",
                timeout,
                self.runtime.remove_container(&container.id),
            )
            .await?;
        }

        let services = self.store.list_services().map_err(Error::Storage)?;
        let mut tasks = Vec::with_capacity(services.len());
        for service in services {
            self.store
                .update_container_id(service.id, None)
                .map_err(Error::Storage)?;
            self.store
                .update_port(service.id, None)
                .map_err(Error::Storage)?;
            self.store
                .update_status(service.id, ServiceStatus::Pulling)
                .map_err(Error::Storage)?;
            tasks.push(self.spawn_bootstrap(&service.name));
        }

        info!(services = tasks.len(), "Restoring services");
        Ok(tasks)
    }

    /// Publish routes for services persisted as RUNNING, without touching containers
    pub fn sync_routes(&self) -> Result<usize> {
        let mut published = 0;
        for service in self.store.list_services().map_err(Error::Storage)? {
            if service.status != ServiceStatus::Running || service.port.is_none() {
                continue;
            }
            for host in &service.hosts {
                self.routes.register(host, &service.name);
                published += 1;
            }
        }
        if published == 0 {
            debug!("No running services to publish routes for");
        }
        Ok(published)
    }
}

/// Bound a runtime call with a timeout, mapping failures to lifecycle errors
async fn orchestrate<T>(
    operation: &'static str,
    timeout: Duration,
    call: impl Future<Output = anyhow::Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Error::Orchestration(e.context(operation))),
        Err(_) => Err(Error::Timeout { operation, timeout }),
    }
}

/// Container names: alphanumeric first character, then alphanumerics, `_`, `.` or `-`
fn validate_service_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("name is required".to_string()));
    }
    if name.len() > MAX_SERVICE_NAME_LEN {
        return Err(Error::Validation(format!(
            "name must be at most {} characters",
            MAX_SERVICE_NAME_LEN
        )));
    }
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    if !first_ok
        || !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(Error::Validation(format!("invalid service name '{}'", name)));
    }
    Ok(())
}

fn validate_env(env: &HashMap<String, String>) -> Result<()> {
    for key in env.keys() {
        if key.is_empty() || key.contains('=') {
            return Err(Error::Validation(format!(
                "invalid environment variable name '{}'",
                key
            )));
        }
    }
    Ok(())
}

fn normalize_hosts(hosts: &[String]) -> Vec<String> {
    let mut seen = Vec::new();
    for host in hosts.iter().map(|h| normalize_key(h)) {
        if !host.is_empty() && !seen.contains(&host) {
            seen.push(host);
        }
    }
    seen
}

fn validate_route<'a>(host: &str, target: &'a str) -> Result<(String, &'a str)> {
    let (host, target) = (normalize_key(host), target.trim());
    if host.is_empty() {
        return Err(Error::Validation("host is required".to_string()));
    }
    if target.is_empty() {
        return Err(Error::Validation("target is required".to_string()));
    }
    Ok((host, target))
}
