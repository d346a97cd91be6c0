//! Batched DNS record maintenance for discovered task addresses.
//!
//! Changes accumulate between reconciles and are applied in one batch
//! through the [`RecordSetApplier`] port. A short-lived cache suppresses
//! re-submitting a change that was already queued recently.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// TTL for created A records.
const RECORD_TTL: i64 = 60;

/// How long a submitted change suppresses an identical re-submission.
const CHANGE_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordAction {
    Upsert,
    Delete,
}

/// One grouped change handed to the applier: all values for a record name.
#[derive(Debug, Clone)]
pub struct RecordChange {
    pub action: RecordAction,
    pub name: String,
    pub values: Vec<String>,
    pub ttl: i64,
}

/// Applies a grouped batch of record changes against the DNS service.
#[async_trait]
pub trait RecordSetApplier: Send + Sync {
    async fn apply_changes(&self, changes: Vec<RecordChange>) -> Result<()>;
}

/// Applier used when no hosted zone is configured.
#[derive(Debug, Default)]
pub struct NoopRecordSetApplier;

#[async_trait]
impl RecordSetApplier for NoopRecordSetApplier {
    async fn apply_changes(&self, changes: Vec<RecordChange>) -> Result<()> {
        debug!(changes = changes.len(), "dns apply skipped (no applier configured)");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Change {
    name: String,
    value: String,
    delete: bool,
}

impl Change {
    fn key(&self) -> String {
        if self.delete {
            format!("delete {} {}", self.name, self.value)
        } else {
            format!("add {} {}", self.name, self.value)
        }
    }
}

#[derive(Default)]
struct BatchState {
    changes: Vec<Change>,
    cache: HashMap<String, Instant>,
}

/// Accumulates record upserts and deletes and applies them atomically.
pub struct DnsBatch {
    /// Fully-qualified zone name appended to every record name. `None`
    /// disables the batch entirely.
    zone_name: Option<String>,
    applier: std::sync::Arc<dyn RecordSetApplier>,
    state: Mutex<BatchState>,
}

impl DnsBatch {
    pub fn new(zone_name: Option<String>, applier: std::sync::Arc<dyn RecordSetApplier>) -> Self {
        Self {
            zone_name,
            applier,
            state: Mutex::new(BatchState::default()),
        }
    }

    /// A batch that never talks to any DNS service.
    pub fn disabled() -> Self {
        Self::new(None, std::sync::Arc::new(NoopRecordSetApplier))
    }

    /// Queue an A-record upsert of `name.zone` to `addr`.
    pub fn add(&self, name: &str, addr: &str) {
        self.queue(name, addr, false);
    }

    /// Queue an A-record delete of `name.zone` value `addr`.
    pub fn delete(&self, name: &str, addr: &str) {
        self.queue(name, addr, true);
    }

    fn queue(&self, name: &str, addr: &str, delete: bool) {
        let zone = match &self.zone_name {
            Some(z) => z,
            None => return,
        };
        let change = Change {
            name: format!("{}.{}", name, zone.trim_end_matches('.')),
            value: addr.to_string(),
            delete,
        };
        let key = change.key();
        let mut state = self.state.lock();
        let now = Instant::now();
        if let Some(seen) = state.cache.get(&key) {
            if now.duration_since(*seen) < CHANGE_CACHE_TTL {
                debug!(change = %key, "dns change is cached, skipping");
                return;
            }
        }
        state.cache.insert(key.clone(), now);
        debug!(change = %key, "queueing dns change");
        state.changes.push(change);
    }

    /// Number of queued (not yet applied) changes.
    pub fn pending(&self) -> usize {
        self.state.lock().changes.len()
    }

    /// Group queued changes by record name, drop deletes shadowed by a
    /// pending upsert of the same name, and hand the batch to the applier.
    /// The queue is cleared regardless of the applier outcome.
    pub async fn apply(&self) -> Result<()> {
        let changes = {
            let mut state = self.state.lock();
            let now = Instant::now();
            state.cache.retain(|_, seen| now.duration_since(*seen) < CHANGE_CACHE_TTL);
            std::mem::take(&mut state.changes)
        };
        if changes.is_empty() {
            return Ok(());
        }

        let mut upserts: HashMap<String, Vec<String>> = HashMap::new();
        let mut deletes: HashMap<String, Vec<String>> = HashMap::new();
        for c in changes {
            let target = if c.delete { &mut deletes } else { &mut upserts };
            let values = target.entry(c.name).or_default();
            if !values.contains(&c.value) {
                values.push(c.value);
            }
        }

        let mut batch = Vec::new();
        for (name, values) in deletes {
            if upserts.contains_key(&name) {
                // A pending upsert for the same name wins over the delete.
                debug!(name = %name, "dns delete cancelled by pending upsert");
                continue;
            }
            batch.push(RecordChange {
                action: RecordAction::Delete,
                name,
                values,
                ttl: RECORD_TTL,
            });
        }
        for (name, values) in upserts {
            batch.push(RecordChange {
                action: RecordAction::Upsert,
                name,
                values,
                ttl: RECORD_TTL,
            });
        }
        if batch.is_empty() {
            return Ok(());
        }
        let count = batch.len();
        self.applier.apply_changes(batch).await?;
        info!(changes = count, "dns record changes applied");
        Ok(())
    }
}
