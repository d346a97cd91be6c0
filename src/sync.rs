//! Reconciler: keeps the proxy registry and DNS records in agreement with
//! the task state reported by the orchestrator.
//!
//! One long-running task drains explicit proxy control events and runs a
//! full reconcile on a fixed tick. Events and ticks are serialized by the
//! select loop, so registry mutations never race each other.

use crate::dns::DnsBatch;
use crate::proxy::ReverseProxy;
use crate::task::{ProxyControl, TaskRunner, STATUS_RUNNING, STATUS_STOPPED};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Interval between full reconciles.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(10);

pub struct Reconciler {
    proxy: Arc<ReverseProxy>,
    runner: Arc<dyn TaskRunner>,
    dns: Arc<DnsBatch>,
    rx: mpsc::Receiver<ProxyControl>,
    shutdown: watch::Receiver<bool>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        proxy: Arc<ReverseProxy>,
        runner: Arc<dyn TaskRunner>,
        dns: Arc<DnsBatch>,
        rx: mpsc::Receiver<ProxyControl>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            proxy,
            runner,
            dns,
            rx,
            shutdown,
            interval: SYNC_INTERVAL,
        }
    }

    #[cfg(test)]
    fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("starting reconciler");
        loop {
            tokio::select! {
                biased;
                Some(ev) = self.rx.recv() => self.apply(ev),
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!("reconciler shutting down");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "reconcile failed");
                    }
                }
            }
        }
    }

    /// Apply one explicit registry mutation.
    pub fn apply(&self, ev: ProxyControl) {
        match ev {
            ProxyControl::Add { subdomain, ip_address, port } => {
                debug!(subdomain = %subdomain, ip = %ip_address, port, "applying add event");
                self.proxy.add_subdomain(&subdomain, &ip_address, port);
            }
            ProxyControl::Remove { subdomain } => {
                debug!(subdomain = %subdomain, "applying remove event");
                self.proxy.remove_subdomain(&subdomain);
            }
        }
    }

    /// One full pass: register every running task, queue DNS changes for
    /// started and stopped tasks, drop subdomains no longer reported, and
    /// apply the DNS batch.
    pub async fn reconcile(&self) -> Result<()> {
        let mut running = self
            .runner
            .list(STATUS_RUNNING)
            .await
            .context("failed to list running tasks")?;
        // Oldest first, so the longest-lived task registers a subdomain's
        // handlers before any newer duplicate.
        running.sort_by_key(|info| info.created);

        let mut available: HashSet<String> = HashSet::new();
        for info in &running {
            if info.ip_address.is_empty() {
                continue;
            }
            available.insert(info.subdomain.clone());
            for (name, port) in &info.port_map {
                self.proxy.add_subdomain(&info.subdomain, &info.ip_address, *port);
                self.dns
                    .add(&format!("{}.{}", name, info.subdomain), &info.ip_address);
            }
        }

        let stopped = self
            .runner
            .list(STATUS_STOPPED)
            .await
            .context("failed to list stopped tasks")?;
        for info in &stopped {
            if info.ip_address.is_empty() {
                continue;
            }
            for name in info.port_map.keys() {
                self.dns
                    .delete(&format!("{}.{}", name, info.subdomain), &info.ip_address);
            }
        }

        for subdomain in self.proxy.subdomains() {
            if !available.contains(&subdomain) {
                self.proxy.remove_subdomain(&subdomain);
            }
        }

        if let Err(e) = self.dns.apply().await {
            warn!(error = %e, "failed to apply dns changes");
        }
        Ok(())
    }
}
