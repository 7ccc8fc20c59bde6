use delne::admin::{AdminApi, PKG_NAME, VERSION};
use delne::config::Config;
use delne::db::{Database, ServiceStore};
use delne::docker::{ContainerRuntime, DockerRuntime};
use delne::lifecycle::{LifecycleSettings, ServiceManager};
use delne::pool::PoolConfig;
use delne::proxy::{Dispatcher, ProxyServer};
use delne::routing::{normalize_key, RoutingTable};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "delne.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("delne=debug".parse().expect("valid log directive")),
        )
        .init();

    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = if explicit_path.is_none() && !config_path.exists() {
        warn!(path = %config_path.display(), "Configuration file not found, using defaults");
        Config::default()
    } else {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    };

    info!(name = PKG_NAME, version = VERSION, "Starting");

    let db = Arc::new(Database::open(&config.database.path)?);
    info!(path = %config.database.path, "Database opened");

    let runtime = DockerRuntime::new(config.docker.host.as_deref(), config.docker.pull_policy).await?;

    let store: Arc<dyn ServiceStore> = db;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(runtime);
    let routes = Arc::new(RoutingTable::new());

    for (key, target) in &config.routes {
        routes.register(&normalize_key(key), target.trim());
        info!(key = %key, target = %target, "Static route registered");
    }

    let manager = ServiceManager::new(
        Arc::clone(&store),
        runtime,
        Arc::clone(&routes),
        LifecycleSettings::from_config(&config.docker),
    );

    if config.docker.restore_on_startup {
        // Bootstraps run in the background while the listener starts
        let tasks = manager.restore().await?;
        info!(services = tasks.len(), "Service restore started");
    } else {
        let published = manager.sync_routes()?;
        info!(routes = published, "Published routes for running services");
    }

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: config.server.pool_idle_timeout(),
    };
    info!(
        max_idle = pool_config.max_idle_per_host,
        idle_timeout_secs = pool_config.idle_timeout.as_secs(),
        "Connection pool configured"
    );

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&routes),
        store,
        pool_config,
        config.server.request_timeout(),
    ));

    if config.server.admin_token.is_none() {
        warn!(prefix = %config.server.admin_prefix, "Admin API has no token configured, it is unauthenticated");
    }
    let admin = Arc::new(
        AdminApi::new(
            Arc::clone(&manager),
            config.server.admin_token.clone(),
            &config.server.admin_prefix,
        )
        .with_pool_stats(dispatcher.pool().stats()),
    );

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::new(bind_addr, dispatcher, admin, shutdown_rx);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}
