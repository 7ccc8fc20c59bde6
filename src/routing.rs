//! Route table: route key -> target name, plus the proxy handler cache

use dashmap::DashMap;
use hyper::Uri;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A forwarding handler bound to one resolved backend URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHandler {
    /// Target name the handler was built for
    pub target: String,
    /// Backend base URL, e.g. `http://web:8080`
    pub base: Uri,
}

impl ProxyHandler {
    pub fn new(target: impl Into<String>, base: Uri) -> Self {
        Self {
            target: target.into(),
            base,
        }
    }

    /// Build the upstream URI for a rewritten path and optional query.
    ///
    /// A path on the base URL is kept in front of the rewritten path.
    pub fn upstream_uri(&self, path: &str, query: Option<&str>) -> Result<Uri, hyper::http::Error> {
        let base_path = self.base.path().trim_end_matches('/');
        let path = if path.is_empty() { "/" } else { path };
        let mut path_and_query = if path.starts_with('/') {
            format!("{}{}", base_path, path)
        } else {
            format!("{}/{}", base_path, path)
        };
        if let Some(q) = query {
            path_and_query.push('?');
            path_and_query.push_str(q);
        }

        let mut builder = Uri::builder().path_and_query(path_and_query);
        if let Some(scheme) = self.base.scheme() {
            builder = builder.scheme(scheme.clone());
        }
        if let Some(authority) = self.base.authority() {
            builder = builder.authority(authority.clone());
        }
        builder.build()
    }
}

/// Result of matching a request key against the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    /// The registered route key that matched
    pub key: String,
    /// Target name the key maps to
    pub target: String,
    /// Request key with the matched prefix stripped
    pub remainder: String,
}

/// Build the request key for a host and path: the host alone for `/`, otherwise host + path
pub fn request_key(host: &str, path: &str) -> String {
    if path == "/" || path.is_empty() {
        host.to_string()
    } else {
        format!("{}{}", host, path)
    }
}

/// Normalize a route key: trimmed, with the host part lowercased and the path left as is
pub fn normalize_key(key: &str) -> String {
    let key = key.trim();
    match key.find('/') {
        Some(idx) => format!("{}{}", key[..idx].to_lowercase(), &key[idx..]),
        None => key.to_lowercase(),
    }
}

/// Thread-safe routing table shared by the dispatcher and the admin surface
#[derive(Debug, Default)]
pub struct RoutingTable {
    targets: RwLock<HashMap<String, String>>,
    handlers: DashMap<String, Arc<ProxyHandler>>,
    /// Bumped on every invalidation so handlers built before it are not cached
    generation: AtomicU64,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the longest registered key that is a byte-wise prefix of `request_key`
    pub fn resolve(&self, request_key: &str) -> Option<RouteMatch> {
        let targets = self.targets.read();
        targets
            .iter()
            .filter(|(key, _)| request_key.as_bytes().starts_with(key.as_bytes()))
            // Ties are impossible between distinct keys of equal length that both prefix the same string
            .max_by_key(|(key, _)| key.len())
            .map(|(key, target)| RouteMatch {
                key: key.clone(),
                target: target.clone(),
                remainder: request_key[key.len()..].to_string(),
            })
    }

    /// Insert or overwrite `key -> target`
    pub fn register(&self, key: &str, target: &str) {
        let previous = self
            .targets
            .write()
            .insert(key.to_string(), target.to_string());
        self.handlers.remove(key);
        debug!(key, target, ?previous, "Registered route");
    }

    /// Atomically replace `old_key` with `new_key -> target`
    pub fn rebind(&self, old_key: &str, new_key: &str, target: &str) {
        {
            let mut targets = self.targets.write();
            targets.remove(old_key);
            targets.insert(new_key.to_string(), target.to_string());
        }
        self.handlers.remove(old_key);
        self.handlers.remove(new_key);
        debug!(old_key, new_key, target, "Rebound route");
    }

    /// Remove every route and cached handler pointing at `target`, returning the removed keys
    pub fn unregister(&self, target: &str) -> Vec<String> {
        let removed: Vec<String> = {
            let mut targets = self.targets.write();
            let keys: Vec<String> = targets
                .iter()
                .filter(|(_, t)| t.as_str() == target)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &keys {
                targets.remove(key);
            }
            keys
        };
        self.invalidate_target(target);
        debug!(target, keys = ?removed, "Unregistered routes");
        removed
    }

    /// Drop cached handlers built for `target`, keeping its routes
    pub fn invalidate_target(&self, target: &str) {
        let _targets = self.targets.write();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.handlers.retain(|_, handler| handler.target != target);
    }

    /// Current invalidation generation, read before looking up backend state
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Snapshot of all routes, ordered by key
    pub fn list_all(&self) -> BTreeMap<String, String> {
        self.targets
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Route keys pointing at `target`
    pub fn keys_for(&self, target: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .targets
            .read()
            .iter()
            .filter(|(_, t)| t.as_str() == target)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.read().is_empty()
    }

    /// Cached handler for a matched route key
    pub fn cached_handler(&self, key: &str) -> Option<Arc<ProxyHandler>> {
        self.handlers.get(key).map(|h| Arc::clone(h.value()))
    }

    /// Cache a handler for `key` unless the key was rebound or removed since it was matched,
    /// or its target was invalidated after `generation` was read.
    ///
    /// Returns the handler to use, which is the already cached one if another task won the race.
    pub fn cache_handler(
        &self,
        key: &str,
        handler: ProxyHandler,
        generation: u64,
    ) -> Arc<ProxyHandler> {
        let handler = Arc::new(handler);
        let targets = self.targets.read();
        if targets.get(key) != Some(&handler.target) || self.generation() != generation {
            return handler;
        }
        let cached = self
            .handlers
            .entry(key.to_string())
            .or_insert_with(|| Arc::clone(&handler));
        Arc::clone(cached.value())
    }

    pub fn cached_len(&self) -> usize {
        self.handlers.len()
    }
}
