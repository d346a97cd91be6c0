//! Background eviction of idle subdomains.
//!
//! A purge request selects running tasks older than the window, filters
//! exclusions, and terminates the ones that received no traffic inside the
//! window. Only one purge runs at a time process-wide; termination is
//! throttled to go easy on the orchestrator.

use crate::task::{TaskInfo, TaskRunner, STATUS_RUNNING};
use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Smallest accepted purge window.
pub const MINIMUM_PURGE_DURATION: Duration = Duration::from_secs(5 * 60);

/// Pause between candidate terminations.
const TERMINATE_INTERVAL: Duration = Duration::from_secs(3);

/// A validated purge request.
#[derive(Debug, Clone)]
pub struct PurgeRequest {
    pub duration: Duration,
    pub excludes: HashSet<String>,
    pub exclude_tags: Vec<(String, String)>,
}

impl PurgeRequest {
    /// Validate raw request values. `exclude_tags` entries use `key:value`
    /// form.
    pub fn parse(duration_secs: i64, excludes: Vec<String>, exclude_tags: Vec<String>) -> Result<Self> {
        if duration_secs < MINIMUM_PURGE_DURATION.as_secs() as i64 {
            bail!(
                "duration must be at least {} seconds",
                MINIMUM_PURGE_DURATION.as_secs()
            );
        }
        let mut tags = Vec::with_capacity(exclude_tags.len());
        for tag in exclude_tags {
            let (k, v) = tag
                .split_once(':')
                .with_context(|| format!("invalid exclude_tags format: {tag}"))?;
            tags.push((k.to_string(), v.to_string()));
        }
        Ok(Self {
            duration: Duration::from_secs(duration_secs as u64),
            excludes: excludes.into_iter().collect(),
            exclude_tags: tags,
        })
    }
}

pub struct PurgeEngine {
    runner: Arc<dyn TaskRunner>,
    lock: Arc<Mutex<()>>,
    interval: Duration,
}

impl PurgeEngine {
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            runner,
            lock: Arc::new(Mutex::new(())),
            interval: TERMINATE_INTERVAL,
        }
    }

    #[cfg(test)]
    fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Select purge candidates and hand them to a background worker.
    ///
    /// Returns once the candidate set is computed; the terminations run on
    /// a detached task, decoupled from any HTTP request.
    pub async fn purge(&self, req: PurgeRequest) -> Result<()> {
        let tasks = self
            .runner
            .list(STATUS_RUNNING)
            .await
            .context("failed to list running tasks")?;
        let candidates: Vec<TaskInfo> = tasks
            .into_iter()
            .filter(|t| t.should_be_purged(req.duration, &req.excludes, &req.exclude_tags))
            .collect();
        info!(
            candidates = candidates.len(),
            duration_secs = req.duration.as_secs(),
            "purge requested"
        );

        let runner = Arc::clone(&self.runner);
        let lock = Arc::clone(&self.lock);
        let interval = self.interval;
        let duration = req.duration;
        tokio::spawn(async move {
            Self::purge_subdomains(runner, lock, interval, candidates, duration).await;
        });
        Ok(())
    }

    async fn purge_subdomains(
        runner: Arc<dyn TaskRunner>,
        lock: Arc<Mutex<()>>,
        interval: Duration,
        candidates: Vec<TaskInfo>,
        duration: Duration,
    ) {
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                info!("purge is already in progress, skipping");
                return;
            }
        };

        for (i, task) in candidates.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(interval).await;
            }
            match runner.get_access_count(&task.subdomain, duration).await {
                Ok(0) => {}
                Ok(count) => {
                    info!(subdomain = %task.subdomain, count, "skipping purge, subdomain became active");
                    continue;
                }
                Err(e) => {
                    warn!(subdomain = %task.subdomain, error = %e, "failed to get access count, skipping");
                    continue;
                }
            }
            if let Err(e) = runner.terminate_by_subdomain(&task.subdomain).await {
                warn!(subdomain = %task.subdomain, error = %e, "failed to terminate");
                continue;
            }
            info!(subdomain = %task.subdomain, "purged");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_counter::AccessCount;
    use crate::task::ProxyControl;
    use async_trait::async_trait;
    use chrono::{TimeDelta, Utc};
    use parking_lot::Mutex as SyncMutex;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    struct PurgeTestRunner {
        tasks: Vec<TaskInfo>,
        counts: HashMap<String, i64>,
        terminated: SyncMutex<Vec<String>>,
    }

    impl PurgeTestRunner {
        fn new(tasks: Vec<TaskInfo>, counts: HashMap<String, i64>) -> Self {
            Self {
                tasks,
                counts,
                terminated: SyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TaskRunner for PurgeTestRunner {
        async fn launch(
            &self,
            _subdomain: &str,
            _params: &HashMap<String, String>,
            _taskdefs: &[String],
        ) -> Result<()> {
            Ok(())
        }
        async fn logs(
            &self,
            _subdomain: &str,
            _since: Option<chrono::DateTime<Utc>>,
            _tail: Option<usize>,
        ) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn terminate(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn terminate_by_subdomain(&self, subdomain: &str) -> Result<()> {
            self.terminated.lock().push(subdomain.to_string());
            Ok(())
        }
        async fn list(&self, status: &str) -> Result<Vec<TaskInfo>> {
            Ok(self
                .tasks
                .iter()
                .filter(|t| t.last_status == status)
                .cloned()
                .collect())
        }
        async fn trace(&self, _id: &str) -> Result<String> {
            Ok(String::new())
        }
        async fn get_access_count(&self, subdomain: &str, _duration: Duration) -> Result<i64> {
            Ok(*self.counts.get(subdomain).unwrap_or(&0))
        }
        async fn put_access_counts(&self, _counts: HashMap<String, AccessCount>) -> Result<()> {
            Ok(())
        }
        fn set_proxy_control_channel(&self, _ch: mpsc::Sender<ProxyControl>) {}
    }

    fn task(subdomain: &str, age_secs: i64) -> TaskInfo {
        TaskInfo {
            id: format!("task/{subdomain}"),
            short_id: subdomain.to_string(),
            subdomain: subdomain.to_string(),
            branch: "main".to_string(),
            taskdef: "review:1".to_string(),
            ip_address: "10.0.0.1".to_string(),
            created: Utc::now() - TimeDelta::seconds(age_secs),
            last_status: STATUS_RUNNING.to_string(),
            port_map: HashMap::new(),
            env: HashMap::new(),
            tags: vec![],
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_parse_rejects_short_duration() {
        let err = PurgeRequest::parse(299, vec![], vec![]).unwrap_err();
        assert!(err.to_string().contains("at least 300 seconds"));
        assert!(PurgeRequest::parse(300, vec![], vec![]).is_ok());
    }

    #[test]
    fn test_parse_exclude_tags() {
        let req = PurgeRequest::parse(
            600,
            vec!["keep".to_string()],
            vec!["DontPurge:true".to_string()],
        )
        .unwrap();
        assert!(req.excludes.contains("keep"));
        assert_eq!(req.exclude_tags, vec![("DontPurge".to_string(), "true".to_string())]);

        let err = PurgeRequest::parse(600, vec![], vec!["noseparator".to_string()]).unwrap_err();
        assert!(err.to_string().contains("invalid exclude_tags format"));
    }

    #[tokio::test]
    async fn test_purge_terminates_only_old_idle_tasks() {
        let runner = Arc::new(PurgeTestRunner::new(
            vec![task("old-idle", 3600), task("young", 60), task("old-active", 3600)],
            HashMap::from([("old-active".to_string(), 5)]),
        ));
        let engine = PurgeEngine::new(runner.clone()).with_interval(Duration::from_millis(1));
        let req = PurgeRequest::parse(600, vec![], vec![]).unwrap();
        engine.purge(req).await.unwrap();

        wait_for(|| !runner.terminated.lock().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*runner.terminated.lock(), vec!["old-idle"]);
    }

    #[tokio::test]
    async fn test_purge_honors_excludes() {
        let runner = Arc::new(PurgeTestRunner::new(
            vec![task("old-a", 3600), task("old-b", 3600)],
            HashMap::new(),
        ));
        let engine = PurgeEngine::new(runner.clone()).with_interval(Duration::from_millis(1));
        let req = PurgeRequest::parse(600, vec!["old-a".to_string()], vec![]).unwrap();
        engine.purge(req).await.unwrap();

        wait_for(|| !runner.terminated.lock().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*runner.terminated.lock(), vec!["old-b"]);
    }

    #[tokio::test]
    async fn test_only_one_purge_in_flight() {
        let runner = Arc::new(PurgeTestRunner::new(
            vec![task("old", 3600)],
            HashMap::new(),
        ));
        let engine = PurgeEngine::new(runner.clone()).with_interval(Duration::from_millis(1));

        // Take the singleton lock so the worker bails out immediately.
        let guard = engine.lock.clone().try_lock_owned().unwrap();
        let req = PurgeRequest::parse(600, vec![], vec![]).unwrap();
        engine.purge(req.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(runner.terminated.lock().is_empty());

        drop(guard);
        engine.purge(req).await.unwrap();
        wait_for(|| !runner.terminated.lock().is_empty()).await;
    }
}
