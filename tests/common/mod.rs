//! Shared helpers: a scripted container runtime, a service harness and raw HTTP clients

#![allow(dead_code)]

use async_trait::async_trait;
use delne::admin::AdminApi;
use delne::db::{Database, ServiceStatus, ServiceStore};
use delne::docker::{ContainerRuntime, ContainerSpec, ContainerSummary};
use delne::image::ImageRef;
use delne::lifecycle::{CreateService, LifecycleSettings, ServiceManager};
use delne::pool::PoolConfig;
use delne::proxy::{Dispatcher, ProxyServer};
use delne::routing::RoutingTable;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Container runtime that records calls and fails or stalls on request
pub struct MockRuntime {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashSet<&'static str>>,
    delays: Mutex<HashMap<&'static str, Duration>>,
    ports: Mutex<Vec<u16>>,
    containers: Mutex<HashMap<String, ContainerSpec>>,
    listed: Mutex<Vec<ContainerSummary>>,
    next_id: AtomicU64,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashSet::new()),
            delays: Mutex::new(HashMap::new()),
            ports: Mutex::new(vec![8080]),
            containers: Mutex::new(HashMap::new()),
            listed: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `operation` fail
    pub fn fail_on(&self, operation: &'static str) {
        self.failures.lock().insert(operation);
    }

    pub fn succeed_on(&self, operation: &'static str) {
        self.failures.lock().remove(operation);
    }

    /// Delay every call of `operation`
    pub fn delay(&self, operation: &'static str, delay: Duration) {
        self.delays.lock().insert(operation, delay);
    }

    pub fn set_ports(&self, ports: Vec<u16>) {
        *self.ports.lock() = ports;
    }

    pub fn set_listed(&self, containers: Vec<ContainerSummary>) {
        *self.listed.lock() = containers;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Operation names in call order
    pub fn operations(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|c| c.split(' ').next().unwrap_or_default().to_string())
            .collect()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.operations().iter().filter(|op| *op == operation).count()
    }

    pub fn container(&self, id: &str) -> Option<ContainerSpec> {
        self.containers.lock().get(id).cloned()
    }

    async fn record(&self, operation: &'static str, arg: &str) -> anyhow::Result<()> {
        self.calls.lock().push(format!("{} {}", operation, arg));
        let delay = self.delays.lock().get(operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failures.lock().contains(operation) {
            anyhow::bail!("{} failed for {}", operation, arg);
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull_image(&self, image: &ImageRef) -> anyhow::Result<()> {
        self.record("pull", &image.to_string()).await
    }

    async fn ensure_network(&self, name: &str) -> anyhow::Result<()> {
        self.record("network", name).await
    }

    async fn create_container(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        self.record("create", &spec.name).await?;
        let id = format!("container-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().insert(id.clone(), spec.clone());
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> anyhow::Result<()> {
        self.record("start", container_id).await
    }

    async fn stop_container(&self, container_id: &str) -> anyhow::Result<()> {
        self.record("stop", container_id).await
    }

    async fn remove_container(&self, container_id: &str) -> anyhow::Result<()> {
        self.record("remove", container_id).await?;
        self.containers.lock().remove(container_id);
        Ok(())
    }

    async fn inspect_ports(&self, container_id: &str) -> anyhow::Result<Vec<u16>> {
        self.record("inspect_ports", container_id).await?;
        let mut ports = self.ports.lock().clone();
        ports.sort_unstable();
        Ok(ports)
    }

    async fn inspect_env(&self, container_id: &str) -> anyhow::Result<HashMap<String, String>> {
        self.record("inspect_env", container_id).await?;
        Ok(self
            .containers
            .lock()
            .get(container_id)
            .map(|spec| spec.env.clone())
            .unwrap_or_default())
    }

    async fn list_containers(&self) -> anyhow::Result<Vec<ContainerSummary>> {
        self.record("list", "").await?;
        Ok(self.listed.lock().clone())
    }
}

pub fn test_settings() -> LifecycleSettings {
    LifecycleSettings {
        network: "delne".to_string(),
        operation_timeout: Duration::from_secs(2),
        pull_timeout: Duration::from_secs(2),
        self_container: "delne".to_string(),
    }
}

/// Manager wired to an in-memory database and a mock runtime
pub struct Harness {
    pub db: Arc<Database>,
    pub runtime: Arc<MockRuntime>,
    pub routes: Arc<RoutingTable>,
    pub manager: Arc<ServiceManager>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(MockRuntime::new(), test_settings())
    }

    pub fn with(runtime: MockRuntime, settings: LifecycleSettings) -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let runtime = Arc::new(runtime);
        let routes = Arc::new(RoutingTable::new());
        let manager = ServiceManager::new(
            db.clone() as Arc<dyn ServiceStore>,
            runtime.clone() as Arc<dyn ContainerRuntime>,
            Arc::clone(&routes),
            settings,
        );
        Self {
            db,
            runtime,
            routes,
            manager,
        }
    }

    pub fn dispatcher(&self, request_timeout: Duration) -> Dispatcher {
        Dispatcher::new(
            Arc::clone(&self.routes),
            self.db.clone() as Arc<dyn ServiceStore>,
            PoolConfig::default(),
            request_timeout,
        )
    }

    /// Create a service and wait for its bootstrap to finish
    pub async fn create_and_wait(&self, name: &str, hosts: &[&str]) -> ServiceStatus {
        let created = self
            .manager
            .create_service(create_request(name, "nginx:1.25", hosts))
            .await
            .unwrap();
        created.task.await.unwrap();
        self.status(name)
    }

    pub fn status(&self, name: &str) -> ServiceStatus {
        self.db
            .get_service_by_name(name)
            .unwrap()
            .expect("service exists")
            .status
    }
}

pub fn create_request(name: &str, image: &str, hosts: &[&str]) -> CreateService {
    CreateService {
        name: name.to_string(),
        image: image.to_string(),
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        env: HashMap::new(),
    }
}

/// A running proxy listener and the handle keeping it alive
pub struct TestProxy {
    pub addr: SocketAddr,
    pub shutdown_tx: watch::Sender<bool>,
}

impl TestProxy {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

pub async fn start_proxy(harness: &Harness, token: Option<&str>, request_timeout: Duration) -> TestProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher = Arc::new(harness.dispatcher(request_timeout));
    let admin = Arc::new(
        AdminApi::new(Arc::clone(&harness.manager), token.map(String::from), "/admin")
            .with_pool_stats(dispatcher.pool().stats()),
    );
    let server = ProxyServer::new(addr, dispatcher, admin, shutdown_rx);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    TestProxy { addr, shutdown_tx }
}

/// Backend answering `<METHOD> <path?query>`; paths ending in `/slow` stall for two seconds
pub async fn spawn_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    if req.uri().path().ends_with("/slow") {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                    let target = req
                        .uri()
                        .path_and_query()
                        .map(|pq| pq.as_str().to_string())
                        .unwrap_or_else(|| "/".to_string());
                    let forwarded_host = req
                        .headers()
                        .get("x-forwarded-host")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let body = format!("{} {}", req.method(), target);
                    Ok::<_, Infallible>(
                        Response::builder()
                            .header("x-seen-forwarded-host", forwarded_host)
                            .body(Full::new(Bytes::from(body)))
                            .unwrap(),
                    )
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

/// A port nothing listens on
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Parsed raw HTTP response
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).expect("JSON body")
    }
}

/// Send a raw HTTP/1.1 request and read the whole response
pub async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    host: Option<&str>,
    headers: &[(&str, &str)],
    body: Option<&str>,
) -> RawResponse {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    let mut request = format!("{} {} HTTP/1.1\r\n", method, path);
    if let Some(host) = host {
        request.push_str(&format!("Host: {}\r\n", host));
    }
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    let body = body.unwrap_or("");
    if !body.is_empty() {
        request.push_str("Content-Type: application/json\r\n");
    }
    request.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n{}", body.len(), body));
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();
    parse_response(&raw)
}

pub async fn http_get(port: u16, path: &str, host: &str) -> RawResponse {
    http_request(port, "GET", path, Some(host), &[], None).await
}

fn parse_response(raw: &str) -> RawResponse {
    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
        .collect();
    RawResponse {
        status,
        headers,
        body: body.to_string(),
    }
}

/// Poll until the service reaches `status` or the timeout passes
pub async fn wait_for_status(db: &Database, name: &str, status: ServiceStatus, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if let Ok(Some(service)) = db.get_service_by_name(name) {
            if service.status == status {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
