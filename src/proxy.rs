use crate::admin::AdminApi;
use crate::db::{ServiceStatus, ServiceStore};
use crate::error::{json_error_response, Error, ProxyErrorCode, Result};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::routing::{request_key, ProxyHandler, RoutingTable};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Resolves inbound requests to backends and forwards them
pub struct Dispatcher {
    routes: Arc<RoutingTable>,
    store: Arc<dyn ServiceStore>,
    pool: ConnectionPool,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        routes: Arc<RoutingTable>,
        store: Arc<dyn ServiceStore>,
        pool_config: PoolConfig,
        request_timeout: Duration,
    ) -> Self {
        Self {
            routes,
            store,
            pool: ConnectionPool::new(pool_config),
            request_timeout,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Resolve host and path to a proxy handler and the rewritten path
    pub fn resolve(&self, host: &str, path: &str) -> Result<(Arc<ProxyHandler>, String)> {
        let key = request_key(host, path);
        let route = self
            .routes
            .resolve(&key)
            .ok_or_else(|| Error::Forbidden(host.to_string()))?;

        if let Some(handler) = self.routes.cached_handler(&route.key) {
            return Ok((handler, route.remainder));
        }

        let generation = self.routes.generation();
        let handler = self.build_handler(&route.target)?;
        debug!(key = %route.key, target = %route.target, base = %handler.base, "Caching proxy handler");
        let handler = self.routes.cache_handler(&route.key, handler, generation);
        Ok((handler, route.remainder))
    }

    fn build_handler(&self, target: &str) -> Result<ProxyHandler> {
        if target.starts_with("http://") {
            let base: Uri = target
                .parse()
                .map_err(|_| Error::not_found("backend", target))?;
            return Ok(ProxyHandler::new(target, base));
        }

        let service = self
            .store
            .get_service_by_name(target)
            .map_err(Error::Storage)?
            .ok_or_else(|| Error::not_found("service", target))?;

        if service.status != ServiceStatus::Running {
            return Err(Error::not_found("running service", target));
        }
        let url = service
            .url()
            .ok_or_else(|| Error::not_found("service port", target))?;
        let base: Uri = url
            .parse()
            .map_err(|_| Error::not_found("backend", target))?;
        Ok(ProxyHandler::new(target, base))
    }

    /// Forward a request whose headers were already prepared
    pub async fn dispatch(
        &self,
        req: Request<Incoming>,
        host: &str,
        request_id: &str,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let path = req.uri().path().to_string();
        let (handler, rewritten) = match self.resolve(host, &path) {
            Ok(resolved) => resolved,
            Err(e) => {
                let code = ProxyErrorCode::from(&e);
                match code {
                    ProxyErrorCode::InternalError => {
                        error!(host, path, request_id, error = %e, "Failed to resolve backend")
                    }
                    _ => warn!(host, path, request_id, error = %e, "No backend for request"),
                }
                let message = match code {
                    ProxyErrorCode::UnknownHost => "Unknown or unconfigured host",
                    ProxyErrorCode::BackendNotFound => "Backend not found",
                    _ => "Internal proxy error",
                };
                return json_error_response(code, message);
            }
        };

        let uri = match handler.upstream_uri(&rewritten, req.uri().query()) {
            Ok(uri) => uri,
            Err(e) => {
                error!(host, target = %handler.target, error = %e, "Failed to build upstream URI");
                return json_error_response(ProxyErrorCode::InternalError, "Internal proxy error");
            }
        };

        debug!(host, target = %handler.target, upstream = %uri, request_id, "Forwarding request");

        match tokio::time::timeout(self.request_timeout, self.pool.send_request(req, uri)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(host, target = %handler.target, error = %e, "Failed to forward request");
                json_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    "Failed to connect to backend",
                )
            }
            Err(_) => {
                warn!(
                    host,
                    target = %handler.target,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!(
                        "Request timed out after {} seconds",
                        self.request_timeout.as_secs()
                    ),
                )
            }
        }
    }
}

/// The public listener: admin API under its prefix, everything else dispatched
pub struct ProxyServer {
    bind_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    admin: Arc<AdminApi>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        admin: Arc<AdminApi>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            dispatcher,
            admin,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let admin = Arc::clone(&self.admin);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, dispatcher, admin).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender also means shutdown
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    admin: Arc<AdminApi>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        let admin = Arc::clone(&admin);
        async move { handle_request(req, dispatcher, admin, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    dispatcher: Arc<Dispatcher>,
    admin: Arc<AdminApi>,
    client_addr: SocketAddr,
) -> std::result::Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if admin.matches(req.uri().path()) {
        return Ok(admin.handle(req).await);
    }

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };

    // X-Forwarded-* are overwritten, not appended: this proxy is the first trusted hop
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    Ok(dispatcher.dispatch(req, &hostname, &request_id).await)
}

/// Lowercased hostname from the Host header (or the absolute URI), without port
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;

    let hostname = raw.split(':').next()?;
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    // Only characters valid in DNS names, which also keeps them out of log injection
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_lowercase())
}
