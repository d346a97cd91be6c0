//! Subdomain-routed reverse proxy.
//!
//! The registry maps subdomains (wildcards allowed) to lifetimed proxy
//! handlers, one per `(listen port, backend address)` pair. Every forwarded
//! request is counted per subdomain; listen ports may additionally be
//! gated on the auth cookie.

use crate::access_counter::{AccessCount, AccessCounter};
use crate::auth::{cookie_value, Auth, AUTH_COOKIE_NAME};
use crate::config::{Config, PortMap};
use crate::pool::{ConnectionPool, PoolConfig, UpstreamBody};
use glob::Pattern;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::{Method, Request, Response, StatusCode};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Response type produced by the proxy.
pub type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Build a plain-text response with an infallible body.
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> ProxyResponse {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One forwarder for a `(subdomain, listen port, backend address)` triple.
pub struct ProxyHandler {
    subdomain: String,
    addr: String,
    require_auth_cookie: bool,
    counter: Arc<AccessCounter>,
    auth: Option<Arc<Auth>>,
    timeout: Duration,
    lifetime: Duration,
    last_used: AtomicI64,
    pool: Arc<ConnectionPool>,
}

impl ProxyHandler {
    /// Whether the handler's deadline has not yet passed.
    pub fn alive(&self) -> bool {
        let elapsed = now_millis() - self.last_used.load(Ordering::Relaxed);
        elapsed <= self.lifetime.as_millis() as i64
    }

    /// Reset the handler deadline.
    pub fn extend(&self) {
        self.last_used.store(now_millis(), Ordering::Relaxed);
    }

    pub fn backend_addr(&self) -> &str {
        &self.addr
    }

    /// Forward a request to the backend.
    ///
    /// The access counter is incremented for every request presented here,
    /// including ones the cookie gate rejects.
    pub async fn forward(
        &self,
        mut req: Request<UpstreamBody>,
        client_addr: Option<SocketAddr>,
    ) -> ProxyResponse {
        self.counter.add();

        // CORS preflight requests carry no cookies by design.
        if self.require_auth_cookie && req.method() != Method::OPTIONS {
            let valid = match (&self.auth, cookie_value(req.headers(), AUTH_COOKIE_NAME)) {
                (Some(auth), Some(value)) => match auth.validate_auth_cookie(&value) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(subdomain = %self.subdomain, error = %e, "auth cookie rejected at proxy");
                        false
                    }
                },
                _ => false,
            };
            if !valid {
                return text_response(StatusCode::FORBIDDEN, "Forbidden");
            }
        }

        let url = format!(
            "http://{}{}",
            self.addr,
            req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );
        self.set_forward_headers(&mut req, client_addr);

        let send = self.pool.send_request(req, &self.addr);
        let result = if self.timeout.is_zero() {
            Ok(send.await)
        } else {
            tokio::time::timeout(self.timeout, send).await
        };

        match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(subdomain = %self.subdomain, addr = %self.addr, error = %e, "failed to forward request");
                text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
            Err(_) => {
                warn!(
                    subdomain = %self.subdomain,
                    addr = %self.addr,
                    timeout_secs = self.timeout.as_secs(),
                    "upstream request timed out"
                );
                text_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    format!("{} upstream timeout: {}", self.subdomain, url),
                )
            }
        }
    }

    // Overwrites client-supplied values: this proxy is the first trusted hop.
    fn set_forward_headers(&self, req: &mut Request<UpstreamBody>, client_addr: Option<SocketAddr>) {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let host = req.headers().get(hyper::header::HOST).cloned();

        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Some(addr) = client_addr {
            if let Ok(value) = HeaderValue::from_str(&addr.ip().to_string()) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }
        if let Some(host) = host {
            headers.insert(X_FORWARDED_HOST, host);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }
}

/// Handlers for one subdomain, keyed by listen port then backend address.
#[derive(Default)]
pub struct ProxyHandlers(HashMap<u16, HashMap<String, Arc<ProxyHandler>>>);

impl ProxyHandlers {
    /// First alive handler for a listen port. Map iteration order is
    /// unspecified, which spreads load across equivalent backends. Dead
    /// entries are skipped here and reaped on the next insert.
    fn handler(&self, port: u16) -> Option<Arc<ProxyHandler>> {
        let entries = self.0.get(&port)?;
        for handler in entries.values() {
            if handler.alive() {
                handler.extend();
                return Some(Arc::clone(handler));
            }
        }
        None
    }
}

#[derive(Default)]
struct Registry {
    /// Subdomains in insertion order; wildcard resolution walks this so
    /// lookups are deterministic.
    domains: Vec<String>,
    by_domain: HashMap<String, ProxyHandlers>,
    counters: HashMap<String, Arc<AccessCounter>>,
}

/// The concurrent subdomain → backend registry and forwarding engine.
pub struct ReverseProxy {
    port_maps: Vec<PortMap>,
    local_mode: bool,
    auth: Option<Arc<Auth>>,
    pool: Arc<ConnectionPool>,
    lifetime: Duration,
    timeout: Duration,
    counter_unit: Duration,
    inner: RwLock<Registry>,
}

impl ReverseProxy {
    pub fn new(cfg: &Config, auth: Option<Arc<Auth>>) -> Self {
        Self {
            port_maps: cfg.listen.http.clone(),
            local_mode: cfg.local_mode,
            auth,
            pool: Arc::new(ConnectionPool::new(PoolConfig::default())),
            lifetime: cfg.network.handler_lifetime(),
            timeout: cfg.network.proxy_timeout(),
            counter_unit: cfg.network.access_counter_unit(),
            inner: RwLock::new(Registry::default()),
        }
    }

    /// Register (or refresh) a backend for a subdomain.
    ///
    /// Wires the backend to every configured listen port whose target port
    /// matches (any port in local mode). When a matching alive handler
    /// already exists its deadline is extended instead.
    pub fn add_subdomain(&self, subdomain: &str, ip_address: &str, target_port: u16) {
        let subdomain = subdomain.to_lowercase();
        let addr = format!("{}:{}", ip_address, target_port);
        let matched: Vec<PortMap> = self
            .port_maps
            .iter()
            .filter(|pm| self.local_mode || pm.target == target_port)
            .cloned()
            .collect();
        if matched.is_empty() {
            warn!(subdomain = %subdomain, port = target_port, "no listen port matches target port, not registering");
            return;
        }

        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let counter = inner
            .counters
            .entry(subdomain.clone())
            .or_insert_with(|| Arc::new(AccessCounter::new(self.counter_unit)))
            .clone();
        let handlers = inner.by_domain.entry(subdomain.clone()).or_default();
        for pm in &matched {
            let entries = handlers.0.entry(pm.listen).or_default();
            entries.retain(|_, h| h.alive());
            if let Some(existing) = entries.get(&addr) {
                existing.extend();
                debug!(subdomain = %subdomain, addr = %addr, listen = pm.listen, "extended proxy handler");
                continue;
            }
            info!(subdomain = %subdomain, addr = %addr, listen = pm.listen, "adding proxy handler");
            entries.insert(
                addr.clone(),
                Arc::new(ProxyHandler {
                    subdomain: subdomain.clone(),
                    addr: addr.clone(),
                    require_auth_cookie: pm.require_auth_cookie,
                    counter: Arc::clone(&counter),
                    auth: self.auth.clone(),
                    timeout: self.timeout,
                    lifetime: self.lifetime,
                    last_used: AtomicI64::new(now_millis()),
                    pool: Arc::clone(&self.pool),
                }),
            );
        }
        if !inner.domains.contains(&subdomain) {
            inner.domains.push(subdomain);
        }
    }

    pub fn remove_subdomain(&self, subdomain: &str) {
        let subdomain = subdomain.to_lowercase();
        let mut inner = self.inner.write();
        if inner.by_domain.remove(&subdomain).is_some() {
            info!(subdomain = %subdomain, "removing subdomain");
        }
        inner.counters.remove(&subdomain);
        inner.domains.retain(|d| d != &subdomain);
    }

    /// Registered subdomains in insertion order.
    pub fn subdomains(&self) -> Vec<String> {
        self.inner.read().domains.clone()
    }

    /// Whether `subdomain` matches a registered key, exactly or by glob.
    pub fn exists(&self, subdomain: &str) -> bool {
        let subdomain = subdomain.to_lowercase();
        let inner = self.inner.read();
        if inner.by_domain.contains_key(&subdomain) {
            return true;
        }
        inner
            .domains
            .iter()
            .any(|d| Pattern::new(d).map(|p| p.matches(&subdomain)).unwrap_or(false))
    }

    /// Resolve a concrete subdomain to an alive handler for a listen port.
    ///
    /// Exact key match first, then the registered keys in insertion order
    /// under shell-glob semantics.
    pub fn find_handler(&self, subdomain: &str, listen_port: u16) -> Option<Arc<ProxyHandler>> {
        let subdomain = subdomain.to_lowercase();
        let inner = self.inner.read();
        let key = if inner.by_domain.contains_key(&subdomain) {
            subdomain
        } else {
            inner
                .domains
                .iter()
                .find(|d| Pattern::new(d).map(|p| p.matches(&subdomain)).unwrap_or(false))?
                .clone()
        };
        inner.by_domain.get(&key)?.handler(listen_port)
    }

    /// Drain the per-subdomain access counters.
    pub fn collect_access_counts(&self) -> HashMap<String, AccessCount> {
        let inner = self.inner.read();
        inner
            .counters
            .iter()
            .map(|(subdomain, counter)| (subdomain.clone(), counter.collect()))
            .collect()
    }

    /// Route a request that arrived on `listen_port` by the first DNS label
    /// of its Host header.
    pub async fn serve_with_port(
        &self,
        req: Request<UpstreamBody>,
        listen_port: u16,
        client_addr: Option<SocketAddr>,
    ) -> ProxyResponse {
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().host().map(str::to_string))
            .unwrap_or_default();
        let subdomain = host
            .to_lowercase()
            .split(|c| c == ':' || c == '.')
            .next()
            .unwrap_or_default()
            .to_string();

        match self.find_handler(&subdomain, listen_port) {
            Some(handler) => {
                debug!(subdomain = %subdomain, "proxy handler found");
                handler.forward(req, client_addr).await
            }
            None => {
                warn!(subdomain = %subdomain, port = listen_port, "proxy handler not found");
                text_response(StatusCode::NOT_FOUND, "not found")
            }
        }
    }
}
