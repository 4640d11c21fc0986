//! Immutable audit trail and entity history.
//!
//! - [`AuditLogWriter`]: INSERT-only audit log over a [`tm_db::QueryEngine`].
//! - [`HistoryTracker`]: per-entity change timeline through the repository.
//! - [`ReconcileSpool`]: local hash-chained JSONL file for records that could
//!   not be written after a mutation had already committed.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tm_db::DbError;
use tm_schemas::{AuditOutcome, AuditRecord, NewAuditRecord, WorkflowAction};

pub mod history;
pub mod spool;
pub mod writer;

pub use history::{diff_entity, diff_fields, HistoryTracker};
pub use spool::{
    read_entries, replay, verify_hash_chain, verify_hash_chain_str, ReconcileSpool,
    ReplayReport, SpoolEntry, SpoolRecord, VerifyResult,
};
pub use writer::{compute_record_hash, seal, verify_record_hash, AuditLogWriter, AUDIT_TABLE};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit write not confirmed: {0}")]
    WriteFailed(String),
    #[error("audit record {audit_id} failed hash verification")]
    HashMismatch { audit_id: uuid::Uuid },
    #[error("invalid audit filter: {0}")]
    InvalidFilter(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl AuditError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AuditError::Db(e) => e.is_retryable(),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// AuditTrail
// ---------------------------------------------------------------------------

/// Append-only audit sink plus its read side.
#[async_trait]
pub trait AuditTrail: Send + Sync {
    /// Persist one record. Assigns id, timestamp and hash.
    async fn log_action(&self, entry: NewAuditRecord) -> Result<AuditRecord, AuditError>;

    /// Re-insert a record verbatim unless its id is already stored.
    /// Returns whether a row was written.
    async fn restore(&self, record: &AuditRecord) -> Result<bool, AuditError>;

    /// Every record for one entity, oldest first.
    async fn by_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditRecord>, AuditError>;

    async fn statistics(&self, window: Duration) -> Result<AuditStatistics, AuditError>;

    /// Newest first, capped by the filter limit.
    async fn search(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError>;
}

pub const DEFAULT_SEARCH_LIMIT: u32 = 100;
pub const MAX_SEARCH_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub actor: Option<String>,
    pub action: Option<WorkflowAction>,
    pub outcome: Option<AuditOutcome>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl AuditFilter {
    pub fn effective_limit(&self) -> u32 {
        match self.limit {
            None | Some(0) => DEFAULT_SEARCH_LIMIT,
            Some(n) => n.min(MAX_SEARCH_LIMIT),
        }
    }

    pub fn validate(&self) -> Result<(), AuditError> {
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                return Err(AuditError::InvalidFilter(format!(
                    "since ({since}) is after until ({until})"
                )));
            }
        }
        Ok(())
    }

    pub fn matches(&self, rec: &AuditRecord) -> bool {
        self.entity_type.as_deref().map_or(true, |t| rec.entity_type == t)
            && self.entity_id.as_deref().map_or(true, |id| rec.entity_id == id)
            && self.actor.as_deref().map_or(true, |a| rec.actor == a)
            && self.action.map_or(true, |a| rec.action == a)
            && self.outcome.map_or(true, |o| rec.outcome == o)
            && self.since.map_or(true, |t| rec.created_at >= t)
            && self.until.map_or(true, |t| rec.created_at <= t)
    }
}

/// Aggregate counts over a trailing window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStatistics {
    pub since: Option<DateTime<Utc>>,
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub by_action: BTreeMap<String, u64>,
    pub by_actor: BTreeMap<String, u64>,
}

impl AuditStatistics {
    /// Fold already-filtered records. Used by in-process trails.
    pub fn from_records<'a>(
        since: DateTime<Utc>,
        records: impl IntoIterator<Item = &'a AuditRecord>,
    ) -> Self {
        let mut stats = AuditStatistics {
            since: Some(since),
            ..Default::default()
        };
        for rec in records {
            if rec.created_at < since {
                continue;
            }
            stats.add(rec.action.as_str(), &rec.actor, rec.outcome, 1);
        }
        stats
    }

    fn add(&mut self, action: &str, actor: &str, outcome: AuditOutcome, n: u64) {
        self.total += n;
        match outcome {
            AuditOutcome::Success => self.successes += n,
            AuditOutcome::Failure => self.failures += n,
        }
        *self.by_action.entry(action.to_string()).or_default() += n;
        *self.by_actor.entry(actor.to_string()).or_default() += n;
    }
}

/// Oldest first, ties by id so the order is total.
pub fn sort_ascending(records: &mut [AuditRecord]) {
    records.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.audit_id.cmp(&b.audit_id))
    });
}

pub fn sort_descending(records: &mut [AuditRecord]) {
    records.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.audit_id.cmp(&a.audit_id))
    });
}

// ---------------------------------------------------------------------------
// Canonical JSON + hashing (shared by record hashes and the spool chain)
// ---------------------------------------------------------------------------

/// Sort keys recursively and emit compact JSON. One value == one line.
pub(crate) fn canonical_json_line<T: Serialize>(v: &T) -> anyhow::Result<String> {
    use anyhow::Context;
    let raw = serde_json::to_value(v).context("serialize audit value failed")?;
    let sorted = sort_keys(&raw);
    serde_json::to_string(&sorted).context("json stringify failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
