//! Local task runner: an in-process mock of the orchestrator.
//!
//! Each launched "task" is an ephemeral HTTP server bound to a loopback
//! port. Registry updates are pushed through the proxy control channel so
//! the proxy is usable immediately, without waiting for a reconcile tick.

use crate::access_counter::AccessCount;
use crate::task::{
    AccessCountSink, NoopAccessCountSink, ProxyControl, TaskInfo, TaskRunner, STATUS_RUNNING,
    STATUS_STOPPED, TAG_MANAGED_BY, TAG_SUBDOMAIN, TAG_VALUE_MIRAGE,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::Response;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long stopped tasks stay visible in `list(STOPPED)`.
const STOPPED_RETENTION: Duration = Duration::from_secs(5 * 60);

/// How far back stored access counts are kept.
const COUNT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

struct LocalTask {
    info: TaskInfo,
    logs: Vec<(DateTime<Utc>, String)>,
    shutdown: watch::Sender<bool>,
    stopped_at: Option<DateTime<Utc>>,
}

/// In-process [`TaskRunner`] for development and tests.
pub struct LocalTaskRunner {
    tasks: DashMap<String, LocalTask>,
    counts: Mutex<HashMap<String, Vec<(DateTime<Utc>, i64)>>>,
    control: Mutex<Option<mpsc::Sender<ProxyControl>>>,
    sink: std::sync::Arc<dyn AccessCountSink>,
}

impl Default for LocalTaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTaskRunner {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            counts: Mutex::new(HashMap::new()),
            control: Mutex::new(None),
            sink: std::sync::Arc::new(NoopAccessCountSink),
        }
    }

    /// Forward stored access counts to a metrics sink as well.
    pub fn with_sink(mut self, sink: std::sync::Arc<dyn AccessCountSink>) -> Self {
        self.sink = sink;
        self
    }

    async fn send_control(&self, ev: ProxyControl) {
        let tx = self.control.lock().clone();
        if let Some(tx) = tx {
            if let Err(e) = tx.send(ev).await {
                warn!(error = %e, "failed to send proxy control event");
            }
        }
    }

    fn prune_stopped(&self) {
        let cutoff = Utc::now()
            - chrono::TimeDelta::from_std(STOPPED_RETENTION)
                .unwrap_or_else(|_| chrono::TimeDelta::minutes(5));
        self.tasks.retain(|_, task| match task.stopped_at {
            Some(at) => at > cutoff,
            None => true,
        });
    }

    async fn spawn_backend(subdomain: &str) -> Result<(u16, watch::Sender<bool>)> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("cannot bind local task listener")?;
        let port = listener
            .local_addr()
            .context("cannot resolve local task address")?
            .port();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let body = format!("Hello from {subdomain}\n");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _addr)) => {
                                let body = body.clone();
                                tokio::spawn(async move {
                                    let io = TokioIo::new(stream);
                                    let service = service_fn(move |_req: hyper::Request<hyper::body::Incoming>| {
                                        let body = body.clone();
                                        async move {
                                            Ok::<_, std::convert::Infallible>(
                                                Response::builder()
                                                    .status(200)
                                                    .header(hyper::header::CONTENT_TYPE, "text/plain")
                                                    .body(Full::new(Bytes::from(body)))
                                                    .expect("valid response builder"),
                                            )
                                        }
                                    });
                                    if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        debug!(error = %e, "local task connection error");
                                    }
                                });
                            }
                            Err(e) => warn!(error = %e, "local task accept error"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Ok((port, shutdown_tx))
    }

    /// Stop a running task. Returns its snapshot, or `None` when no
    /// running task exists for the subdomain.
    fn stop_task(&self, subdomain: &str) -> Option<TaskInfo> {
        let mut entry = self.tasks.get_mut(subdomain)?;
        if entry.info.last_status != STATUS_RUNNING {
            return None;
        }
        let _ = entry.shutdown.send(true);
        entry.info.last_status = STATUS_STOPPED.to_string();
        entry.stopped_at = Some(Utc::now());
        let line = format!("stopped task {}", entry.info.id);
        entry.logs.push((Utc::now(), line));
        Some(entry.info.clone())
    }
}

#[async_trait]
impl TaskRunner for LocalTaskRunner {
    async fn launch(
        &self,
        subdomain: &str,
        params: &HashMap<String, String>,
        taskdefs: &[String],
    ) -> Result<()> {
        let subdomain = subdomain.to_lowercase();

        let running = self
            .tasks
            .get(&subdomain)
            .map(|t| t.info.last_status == STATUS_RUNNING)
            .unwrap_or(false);
        if running {
            info!(subdomain = %subdomain, "subdomain is already running, terminating first");
            self.terminate_by_subdomain(&subdomain).await?;
        }

        let (port, shutdown) = Self::spawn_backend(&subdomain).await?;
        let id = format!("local/task/{}", Uuid::new_v4());
        let short_id = id.rsplit('/').next().unwrap_or(&id).to_string();
        let created = Utc::now();
        let info = TaskInfo {
            id: id.clone(),
            short_id,
            subdomain: subdomain.clone(),
            branch: params.get("branch").cloned().unwrap_or_default(),
            taskdef: taskdefs.join(","),
            ip_address: "127.0.0.1".to_string(),
            created,
            last_status: STATUS_RUNNING.to_string(),
            port_map: HashMap::from([("http".to_string(), port)]),
            env: params.clone(),
            tags: vec![
                (TAG_MANAGED_BY.to_string(), TAG_VALUE_MIRAGE.to_string()),
                (TAG_SUBDOMAIN.to_string(), subdomain.clone()),
            ],
        };
        info!(subdomain = %subdomain, id = %id, port, "launched local task");
        self.tasks.insert(
            subdomain.clone(),
            LocalTask {
                info,
                logs: vec![(created, format!("launched task {id} on 127.0.0.1:{port}"))],
                shutdown,
                stopped_at: None,
            },
        );

        self.send_control(ProxyControl::Add {
            subdomain,
            ip_address: "127.0.0.1".to_string(),
            port,
        })
        .await;
        Ok(())
    }

    async fn logs(
        &self,
        subdomain: &str,
        since: Option<DateTime<Utc>>,
        tail: Option<usize>,
    ) -> Result<Vec<String>> {
        let subdomain = subdomain.to_lowercase();
        let entry = self
            .tasks
            .get(&subdomain)
            .with_context(|| format!("subdomain {subdomain} is not found"))?;
        let mut lines: Vec<String> = entry
            .logs
            .iter()
            .filter(|(ts, _)| since.map(|s| *ts >= s).unwrap_or(true))
            .map(|(_, line)| line.clone())
            .collect();
        if let Some(n) = tail {
            if lines.len() > n {
                lines = lines.split_off(lines.len() - n);
            }
        }
        Ok(lines)
    }

    async fn terminate(&self, id: &str) -> Result<()> {
        let subdomain = self
            .tasks
            .iter()
            .find(|entry| entry.info.id == id)
            .map(|entry| entry.info.subdomain.clone());
        match subdomain {
            Some(subdomain) => self.terminate_by_subdomain(&subdomain).await,
            None => bail!("task {id} is not found"),
        }
    }

    async fn terminate_by_subdomain(&self, subdomain: &str) -> Result<()> {
        let subdomain = subdomain.to_lowercase();
        if let Some(info) = self.stop_task(&subdomain) {
            info!(subdomain = %subdomain, id = %info.id, "terminated local task");
            self.send_control(ProxyControl::Remove {
                subdomain: subdomain.clone(),
            })
            .await;
        } else {
            debug!(subdomain = %subdomain, "no running task to terminate");
        }
        Ok(())
    }

    async fn list(&self, status: &str) -> Result<Vec<TaskInfo>> {
        self.prune_stopped();
        let mut infos: Vec<TaskInfo> = self
            .tasks
            .iter()
            .filter(|entry| entry.info.last_status == status)
            .map(|entry| entry.info.clone())
            .collect();
        infos.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        Ok(infos)
    }

    async fn trace(&self, id: &str) -> Result<String> {
        let entry = self
            .tasks
            .iter()
            .find(|entry| entry.info.id == id)
            .with_context(|| format!("task {id} is not found"))?;
        let lines: Vec<String> = entry
            .logs
            .iter()
            .map(|(ts, line)| format!("{} {}", ts.to_rfc3339(), line))
            .collect();
        Ok(lines.join("\n"))
    }

    async fn get_access_count(&self, subdomain: &str, duration: Duration) -> Result<i64> {
        let cutoff = Utc::now()
            - chrono::TimeDelta::from_std(duration).unwrap_or_else(|_| chrono::TimeDelta::days(1));
        let counts = self.counts.lock();
        let sum = counts
            .get(&subdomain.to_lowercase())
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(ts, _)| *ts > cutoff)
                    .map(|(_, n)| n)
                    .sum()
            })
            .unwrap_or(0);
        Ok(sum)
    }

    async fn put_access_counts(&self, counts: HashMap<String, AccessCount>) -> Result<()> {
        if let Err(e) = self.sink.put(&counts).await {
            warn!(error = %e, "failed to forward access counts to sink");
        }
        let cutoff = Utc::now()
            - chrono::TimeDelta::from_std(COUNT_RETENTION)
                .unwrap_or_else(|_| chrono::TimeDelta::days(1));
        let mut store = self.counts.lock();
        for (subdomain, buckets) in counts {
            let entries = store.entry(subdomain).or_default();
            for (ts, n) in buckets {
                if n > 0 {
                    entries.push((ts, n));
                }
            }
            entries.retain(|(ts, _)| *ts > cutoff);
        }
        Ok(())
    }

    fn set_proxy_control_channel(&self, ch: mpsc::Sender<ProxyControl>) {
        *self.control.lock() = Some(ch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch_params() -> HashMap<String, String> {
        HashMap::from([("branch".to_string(), "feature/x".to_string())])
    }

    #[tokio::test]
    async fn test_launch_and_terminate() {
        let runner = LocalTaskRunner::new();
        let (tx, mut rx) = mpsc::channel(16);
        runner.set_proxy_control_channel(tx);

        runner
            .launch("App1", &branch_params(), &["review:1".to_string()])
            .await
            .unwrap();

        let running = runner.list(STATUS_RUNNING).await.unwrap();
        assert_eq!(running.len(), 1);
        let info = &running[0];
        assert_eq!(info.subdomain, "app1");
        assert_eq!(info.branch, "feature/x");
        assert_eq!(info.ip_address, "127.0.0.1");
        let port = *info.port_map.get("http").unwrap();
        assert!(port > 0);

        match rx.recv().await.unwrap() {
            ProxyControl::Add { subdomain, ip_address, port: p } => {
                assert_eq!(subdomain, "app1");
                assert_eq!(ip_address, "127.0.0.1");
                assert_eq!(p, port);
            }
            other => panic!("unexpected event {other:?}"),
        }

        runner.terminate_by_subdomain("app1").await.unwrap();
        assert!(runner.list(STATUS_RUNNING).await.unwrap().is_empty());
        assert_eq!(runner.list(STATUS_STOPPED).await.unwrap().len(), 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            ProxyControl::Remove { subdomain: "app1".to_string() }
        );
    }

    #[tokio::test]
    async fn test_launch_is_idempotent_by_subdomain() {
        let runner = LocalTaskRunner::new();
        let (tx, mut rx) = mpsc::channel(16);
        runner.set_proxy_control_channel(tx);

        runner.launch("app", &branch_params(), &["a".to_string()]).await.unwrap();
        runner.launch("app", &branch_params(), &["b".to_string()]).await.unwrap();

        let running = runner.list(STATUS_RUNNING).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].taskdef, "b");

        // Add, Remove (relaunch), Add.
        let mut events = Vec::new();
        for _ in 0..3 {
            events.push(rx.recv().await.unwrap());
        }
        assert!(matches!(events[0], ProxyControl::Add { .. }));
        assert!(matches!(events[1], ProxyControl::Remove { .. }));
        assert!(matches!(events[2], ProxyControl::Add { .. }));
    }

    #[tokio::test]
    async fn test_backend_answers_http() {
        let runner = LocalTaskRunner::new();
        runner.launch("web", &branch_params(), &["t".to_string()]).await.unwrap();
        let running = runner.list(STATUS_RUNNING).await.unwrap();
        let port = *running[0].port_map.get("http").unwrap();

        let body = reqwest::get(format!("http://127.0.0.1:{port}/"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("Hello from web"));
    }

    #[tokio::test]
    async fn test_logs_tail_and_since() {
        let runner = LocalTaskRunner::new();
        runner.launch("logs", &branch_params(), &["t".to_string()]).await.unwrap();
        runner.terminate_by_subdomain("logs").await.unwrap();

        let all = runner.logs("logs", None, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].contains("launched task"));
        assert!(all[1].contains("stopped task"));

        let tail = runner.logs("logs", None, Some(1)).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert!(tail[0].contains("stopped task"));

        let future = Utc::now() + chrono::TimeDelta::hours(1);
        let none = runner.logs("logs", Some(future), None).await.unwrap();
        assert!(none.is_empty());

        assert!(runner.logs("missing", None, None).await.is_err());
    }

    #[tokio::test]
    async fn test_counts_are_forwarded_to_sink() {
        use crate::task::AccessCountSink;
        use async_trait::async_trait;

        #[derive(Default)]
        struct RecordingSink {
            seen: Mutex<Vec<String>>,
        }

        #[async_trait]
        impl AccessCountSink for RecordingSink {
            async fn put(&self, counts: &HashMap<String, AccessCount>) -> anyhow::Result<()> {
                self.seen.lock().extend(counts.keys().cloned());
                Ok(())
            }
        }

        let sink = std::sync::Arc::new(RecordingSink::default());
        let runner = LocalTaskRunner::new().with_sink(sink.clone());

        let mut counts = HashMap::new();
        counts.insert("app".to_string(), AccessCount::from([(Utc::now(), 1)]));
        runner.put_access_counts(counts).await.unwrap();

        assert_eq!(*sink.seen.lock(), vec!["app"]);
    }

    #[tokio::test]
    async fn test_access_counts_roundtrip() {
        let runner = LocalTaskRunner::new();
        let mut counts = HashMap::new();
        let mut buckets = AccessCount::new();
        buckets.insert(Utc::now(), 3);
        buckets.insert(Utc::now() - chrono::TimeDelta::minutes(1), 2);
        counts.insert("app".to_string(), buckets);
        runner.put_access_counts(counts).await.unwrap();

        let sum = runner
            .get_access_count("app", Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(sum, 5);

        let narrow = runner
            .get_access_count("app", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(narrow, 3);

        let missing = runner
            .get_access_count("other", Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(missing, 0);
    }
}
