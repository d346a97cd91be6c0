//! Task model and the ports the core consumes to drive an orchestrator.

use crate::access_counter::AccessCount;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;

/// Task status reported by the orchestrator.
pub const STATUS_RUNNING: &str = "RUNNING";
pub const STATUS_STOPPED: &str = "STOPPED";

/// Tag keys attached to every task launched by this system.
pub const TAG_MANAGED_BY: &str = "ManagedBy";
pub const TAG_SUBDOMAIN: &str = "Subdomain";
pub const TAG_VALUE_MIRAGE: &str = "Mirage";

/// A read-only snapshot of a task owned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub short_id: String,
    pub subdomain: String,
    pub branch: String,
    pub taskdef: String,
    #[serde(rename = "ipaddress")]
    pub ip_address: String,
    pub created: DateTime<Utc>,
    pub last_status: String,
    #[serde(default)]
    pub port_map: HashMap<String, u16>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub tags: Vec<(String, String)>,
}

impl TaskInfo {
    /// Whether this task is eligible for eviction by the purge engine.
    ///
    /// A task survives if it is younger than `duration`, its subdomain is
    /// excluded, or any of its tags matches an excluded tag.
    pub fn should_be_purged(
        &self,
        duration: Duration,
        excludes: &HashSet<String>,
        exclude_tags: &[(String, String)],
    ) -> bool {
        let age = Utc::now().signed_duration_since(self.created);
        let min_age = match chrono::TimeDelta::from_std(duration) {
            Ok(d) => d,
            Err(_) => return false,
        };
        if age <= min_age {
            return false;
        }
        if excludes.contains(&self.subdomain) {
            return false;
        }
        for (k, v) in &self.tags {
            if exclude_tags.iter().any(|(ek, ev)| ek == k && ev == v) {
                return false;
            }
        }
        true
    }
}

/// Registry mutation event delivered from a task runner to the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyControl {
    Add {
        subdomain: String,
        ip_address: String,
        port: u16,
    },
    Remove {
        subdomain: String,
    },
}

/// The orchestrator port. The concrete adapter (cloud SDK or the local
/// in-process mock) lives behind this trait; the core never sees SDK types.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Launch a task for `subdomain`. Idempotent by subdomain: a running
    /// task for the same subdomain is terminated first.
    async fn launch(
        &self,
        subdomain: &str,
        params: &HashMap<String, String>,
        taskdefs: &[String],
    ) -> Result<()>;

    /// Fetch task logs for a subdomain. `tail` of `None` means all lines.
    async fn logs(
        &self,
        subdomain: &str,
        since: Option<DateTime<Utc>>,
        tail: Option<usize>,
    ) -> Result<Vec<String>>;

    /// Terminate a single task by its id.
    async fn terminate(&self, id: &str) -> Result<()>;

    /// Terminate every task bound to a subdomain.
    async fn terminate_by_subdomain(&self, subdomain: &str) -> Result<()>;

    /// List tasks with the given last status (`RUNNING`, `STOPPED`, ...).
    async fn list(&self, status: &str) -> Result<Vec<TaskInfo>>;

    /// A human-readable trace of a task's recent lifecycle events.
    async fn trace(&self, id: &str) -> Result<String>;

    /// Sum of accesses observed for `subdomain` within the trailing window.
    async fn get_access_count(&self, subdomain: &str, duration: Duration) -> Result<i64>;

    /// Store collected access counts. Fire-and-forget from the collector's
    /// standpoint; failures are logged by the caller.
    async fn put_access_counts(&self, counts: HashMap<String, AccessCount>) -> Result<()>;

    /// Hand the runner the channel it uses to push registry updates.
    fn set_proxy_control_channel(&self, ch: mpsc::Sender<ProxyControl>);
}

/// Metrics backend port for drained access counts.
#[async_trait]
pub trait AccessCountSink: Send + Sync {
    async fn put(&self, counts: &HashMap<String, AccessCount>) -> Result<()>;
}

/// Sink used when no metrics backend is configured.
#[derive(Debug, Default)]
pub struct NoopAccessCountSink;

#[async_trait]
impl AccessCountSink for NoopAccessCountSink {
    async fn put(&self, counts: &HashMap<String, AccessCount>) -> Result<()> {
        tracing::debug!(subdomains = counts.len(), "dropping access counts (no sink configured)");
        Ok(())
    }
}
