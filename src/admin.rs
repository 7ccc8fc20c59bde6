//! JSON administration API served under the admin prefix of the public listener

use crate::error::Error;
use crate::lifecycle::{CreateService, ServiceManager};
use crate::pool::PoolStats;
use http_body_util::{combinators::BoxBody, BodyExt, Full, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 64 * 1024;

type AdminResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RouteRequest {
    pub host: String,
    pub target: String,
}

#[derive(Debug, Serialize)]
struct RouteEntry {
    host: String,
    target: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateServiceRequest {
    pub name: String,
    pub image: String,
    /// Single host, merged into `hosts`
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl From<CreateServiceRequest> for CreateService {
    fn from(req: CreateServiceRequest) -> Self {
        let mut hosts = req.hosts;
        if let Some(host) = req.host {
            hosts.insert(0, host);
        }
        CreateService {
            name: req.name,
            image: req.image,
            hosts,
            env: req.env,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SetEnvRequest {
    pub env: HashMap<String, String>,
}

/// Administration endpoints for routes and services
pub struct AdminApi {
    manager: Arc<ServiceManager>,
    auth_token: Option<String>,
    prefix: String,
    pool_stats: Option<Arc<PoolStats>>,
}

impl AdminApi {
    pub fn new(manager: Arc<ServiceManager>, auth_token: Option<String>, prefix: &str) -> Self {
        Self {
            manager,
            auth_token: auth_token.filter(|t| !t.is_empty()),
            prefix: prefix.trim_end_matches('/').to_string(),
            pool_stats: None,
        }
    }

    /// Report forwarding counters in the healthcheck
    pub fn with_pool_stats(mut self, stats: Arc<PoolStats>) -> Self {
        self.pool_stats = Some(stats);
        self
    }

    /// True if `path` belongs to the admin API
    pub fn matches(&self, path: &str) -> bool {
        path.strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    fn check_auth<B>(&self, req: &Request<B>) -> bool {
        let Some(expected) = self.auth_token.as_deref() else {
            return true;
        };
        req.headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected))
            .unwrap_or(false)
    }

    pub async fn handle<B>(&self, req: Request<B>) -> AdminResponse
    where
        B: Body,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!(%method, %path, "Admin API request");

        let segments = match self.segments(&path) {
            Some(segments) => segments,
            None => return json_error(StatusCode::BAD_REQUEST, "Invalid path encoding"),
        };
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

        // Health check - no auth required
        if method == Method::GET && segments == ["api", "healthcheck"] {
            let mut health = serde_json::json!({
                "status": "ok",
                "name": PKG_NAME,
                "version": VERSION,
            });
            if let Some(stats) = &self.pool_stats {
                health["requests"] = serde_json::json!({
                    "total": stats.get_total_requests(),
                    "failed": stats.get_failed_requests(),
                });
            }
            return json_ok(StatusCode::OK, health);
        }

        if !self.check_auth(&req) {
            warn!(%path, "Unauthorized admin API request");
            return json_error(StatusCode::UNAUTHORIZED, "unauthorized");
        }

        let result = match (&method, segments.as_slice()) {
            (&Method::GET, ["api", "proxies"]) => self.list_routes(),
            (&Method::POST, ["api", "proxies"]) => self.register_route(req).await,
            (&Method::PUT, ["api", "proxies", host]) => self.rebind_route(host, req).await,

            (&Method::GET, ["api", "services"]) => self
                .manager
                .list_services()
                .map(|services| json_ok(StatusCode::OK, services)),
            (&Method::POST, ["api", "services"]) => self.create_service(req).await,
            (&Method::GET, ["api", "services", name]) => self
                .manager
                .get_service(name)
                .map(|view| json_ok(StatusCode::OK, view)),
            (&Method::DELETE, ["api", "services", name]) => self
                .manager
                .delete(name)
                .await
                .map(|()| json_ok(StatusCode::OK, ())),
            (&Method::POST, ["api", "services", name, "start"]) => self
                .manager
                .start(name)
                .await
                .map(|view| json_ok(StatusCode::OK, view)),
            (&Method::POST, ["api", "services", name, "stop"]) => self
                .manager
                .stop(name)
                .await
                .map(|view| json_ok(StatusCode::OK, view)),
            (&Method::PUT, ["api", "services", name, "env"]) => self.set_env(name, req).await,
            (&Method::DELETE, ["api", "services", name, "env", key]) => self
                .manager
                .remove_env_var(name, key)
                .await
                .map(|rebuild| json_ok(StatusCode::ACCEPTED, rebuild.view)),

            _ => return json_error(StatusCode::NOT_FOUND, "Not found"),
        };

        result.unwrap_or_else(|e| error_response(&method, &path, e))
    }

    /// Percent-decoded path segments after the prefix
    fn segments(&self, path: &str) -> Option<Vec<String>> {
        let rest = path.strip_prefix(self.prefix.as_str()).unwrap_or(path);
        rest.split('/')
            .filter(|s| !s.is_empty())
            .map(|s| urlencoding::decode(s).ok().map(|d| d.into_owned()))
            .collect()
    }

    fn list_routes(&self) -> Result<AdminResponse, Error> {
        let routes: Vec<RouteEntry> = self
            .manager
            .list_routes()
            .into_iter()
            .map(|(host, target)| RouteEntry { host, target })
            .collect();
        Ok(json_ok(StatusCode::OK, routes))
    }

    async fn register_route<B>(&self, req: Request<B>) -> Result<AdminResponse, Error>
    where
        B: Body,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let body: RouteRequest = read_json(req).await?;
        self.manager
            .register_route(&body.host, &body.target)
            .await?;
        Ok(json_ok(
            StatusCode::CREATED,
            RouteEntry {
                host: body.host.trim().to_string(),
                target: body.target.trim().to_string(),
            },
        ))
    }

    async fn rebind_route<B>(&self, old_host: &str, req: Request<B>) -> Result<AdminResponse, Error>
    where
        B: Body,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let body: RouteRequest = read_json(req).await?;
        self.manager
            .rebind_route(old_host, &body.host, &body.target)
            .await?;
        Ok(json_ok(
            StatusCode::OK,
            RouteEntry {
                host: body.host.trim().to_string(),
                target: body.target.trim().to_string(),
            },
        ))
    }

    async fn create_service<B>(&self, req: Request<B>) -> Result<AdminResponse, Error>
    where
        B: Body,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let body: CreateServiceRequest = read_json(req).await?;
        let created = self.manager.create_service(body.into()).await?;
        info!(service = %created.view.service.name, "Service created via admin API");
        Ok(json_ok(StatusCode::CREATED, created.view))
    }

    async fn set_env<B>(&self, name: &str, req: Request<B>) -> Result<AdminResponse, Error>
    where
        B: Body,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let body: SetEnvRequest = read_json(req).await?;
        let rebuild = self.manager.update_env(name, body.env).await?;
        Ok(json_ok(StatusCode::ACCEPTED, rebuild.view))
    }
}

async fn read_json<T, B>(req: Request<B>) -> Result<T, Error>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| Error::Validation(format!("failed to read body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|e| Error::Validation(format!("invalid JSON: {}", e)))
}

fn error_response(method: &Method, path: &str, e: Error) -> AdminResponse {
    if e.is_client_error() {
        debug!(%method, path, error = %e, "Admin request rejected");
    } else {
        error!(%method, path, error = %e, "Admin request failed");
    }
    json_error(e.status_code(), e.to_string())
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> AdminResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

fn json_ok<T: Serialize>(status: StatusCode, data: T) -> AdminResponse {
    match serde_json::to_string(&ApiResponse::ok(data)) {
        Ok(body) => json_response(status, body),
        Err(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode response: {}", e),
        ),
    }
}

fn json_error(status: StatusCode, message: impl Into<String>) -> AdminResponse {
    let response: ApiResponse<()> = ApiResponse::error(message);
    let body = serde_json::to_string(&response)
        .unwrap_or_else(|_| r#"{"success":false,"error":"internal error"}"#.to_string());
    json_response(status, body)
}
