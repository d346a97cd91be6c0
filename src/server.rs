//! Server wiring: listeners, host multiplexing, background loops.
//!
//! Each configured listen port gets its own accept loop. Requests are
//! classified by Host header: the web API host, a proxied subdomain under
//! the configured suffix, or the bare healthcheck responder.

use crate::config::Config;
use crate::dns::{DnsBatch, RecordSetApplier};
use crate::pool::{BoxError, UpstreamBody};
use crate::proxy::{text_response, ProxyResponse, ReverseProxy};
use crate::sync::Reconciler;
use crate::task::{ProxyControl, TaskRunner};
use crate::webapi::WebApi;
use anyhow::{Context, Result};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Body returned to load balancer healthchecks on unknown hosts.
const HEALTHCHECK_BODY: &str = "mirage-ecs";

/// The assembled application.
pub struct Mirage {
    cfg: Arc<Config>,
    proxy: Arc<ReverseProxy>,
    webapi: Arc<WebApi>,
    runner: Arc<dyn TaskRunner>,
    dns: Arc<DnsBatch>,
    control_rx: Mutex<Option<mpsc::Receiver<ProxyControl>>>,
}

impl Mirage {
    pub fn new(
        cfg: Arc<Config>,
        runner: Arc<dyn TaskRunner>,
        dns_applier: Arc<dyn RecordSetApplier>,
    ) -> Arc<Self> {
        let auth = cfg.auth.clone().map(Arc::new);
        let proxy = Arc::new(ReverseProxy::new(&cfg, auth.clone()));
        let webapi = Arc::new(WebApi::new(Arc::clone(&cfg), auth, Arc::clone(&runner)));
        let dns = Arc::new(DnsBatch::new(cfg.dns.zone_name.clone(), dns_applier));

        let (tx, rx) = mpsc::channel(cfg.network.control_channel_capacity());
        runner.set_proxy_control_channel(tx);

        Arc::new(Self {
            cfg,
            proxy,
            webapi,
            runner,
            dns,
            control_rx: Mutex::new(Some(rx)),
        })
    }

    pub fn proxy(&self) -> &Arc<ReverseProxy> {
        &self.proxy
    }

    /// Bind all listeners and run until shutdown is signaled. A bind
    /// failure is fatal and surfaces to the caller.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let ports: BTreeSet<u16> = self.cfg.listen.http.iter().map(|pm| pm.listen).collect();
        let mut listeners = Vec::new();
        for port in ports {
            let addr = format!("{}:{}", self.cfg.listen.foreign_address, port);
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("cannot listen {addr}"))?;
            info!(addr = %addr, "listening");
            listeners.push((port, listener));
        }

        let rx = self
            .control_rx
            .lock()
            .take()
            .context("server is already running")?;
        let reconciler = Reconciler::new(
            Arc::clone(&self.proxy),
            Arc::clone(&self.runner),
            Arc::clone(&self.dns),
            rx,
            shutdown.clone(),
        );
        tokio::spawn(reconciler.run());

        tokio::spawn(Self::run_access_count_collector(
            Arc::clone(&self.proxy),
            Arc::clone(&self.runner),
            self.cfg.network.access_counter_unit(),
            shutdown.clone(),
        ));

        for (port, listener) in listeners {
            tokio::spawn(Arc::clone(&self).serve_listener(listener, port, shutdown.clone()));
        }
        info!("launch succeeded");

        let mut shutdown = shutdown;
        while shutdown.changed().await.is_ok() {
            if *shutdown.borrow() {
                break;
            }
        }
        info!("server shutting down");
        Ok(())
    }

    async fn serve_listener(
        self: Arc<Self>,
        listener: TcpListener,
        port: u16,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let mirage = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = mirage.serve_connection(stream, addr, port).await {
                                    debug!(addr = %addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(port, error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(port, "listener shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn serve_connection(
        self: Arc<Self>,
        stream: tokio::net::TcpStream,
        addr: SocketAddr,
        port: u16,
    ) -> Result<()> {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req: Request<Incoming>| {
            let mirage = Arc::clone(&self);
            async move {
                let req = req.map(|body| body.map_err(|e| Box::new(e) as BoxError).boxed());
                Ok::<_, std::convert::Infallible>(mirage.handle_request(req, port, addr).await)
            }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;
        Ok(())
    }

    /// Classify a request by its Host header and dispatch it.
    pub async fn handle_request(
        &self,
        req: Request<UpstreamBody>,
        port: u16,
        addr: SocketAddr,
    ) -> ProxyResponse {
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().host().map(str::to_string))
            .unwrap_or_default();
        let host = host
            .split(':')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase();

        if host == self.cfg.host.web_api.trim().to_lowercase() {
            self.webapi.handle(req).await
        } else if host.ends_with(&self.cfg.host.reverse_proxy_suffix) {
            self.proxy.serve_with_port(req, port, Some(addr)).await
        } else if req.uri().path() == "/" {
            // Root on an unknown host answers the load balancer healthcheck.
            text_response(StatusCode::OK, HEALTHCHECK_BODY)
        } else {
            warn!(host = %host, "host not found");
            text_response(StatusCode::NOT_FOUND, "not found")
        }
    }

    async fn run_access_count_collector(
        proxy: Arc<ReverseProxy>,
        runner: Arc<dyn TaskRunner>,
        unit: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(unit);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so collections line up
        // with whole units.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let all = proxy.collect_access_counts();
                    if all.is_empty() {
                        continue;
                    }
                    info!(
                        counters = %serde_json::to_string(&all).unwrap_or_default(),
                        "access counters"
                    );
                    if let Err(e) = runner.put_access_counts(all).await {
                        warn!(error = %e, "failed to put access counts");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
