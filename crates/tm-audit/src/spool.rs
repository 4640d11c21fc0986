//! Reconciliation spool.
//!
//! When an entity mutation has committed but its audit or history record
//! could not be written, the record lands here instead: one JSON line per
//! entry, each entry chained to the previous by SHA-256 so that edits to
//! the file are detectable before replay.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tm_db::EntityRepository;
use tm_schemas::{AuditRecord, HistoryRecord};
use uuid::Uuid;

use crate::{canonical_json_line, sha256_hex, AuditTrail};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum SpoolRecord {
    Audit(AuditRecord),
    History(HistoryRecord),
}

impl SpoolRecord {
    pub fn entity(&self) -> (&str, &str) {
        match self {
            SpoolRecord::Audit(r) => (&r.entity_type, &r.entity_id),
            SpoolRecord::History(r) => (&r.entity_type, &r.entity_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoolEntry {
    pub entry_id: Uuid,
    pub ts_utc: DateTime<Utc>,
    /// Why the record could not be written directly.
    pub reason: String,
    pub payload: SpoolRecord,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

/// Append-only spool writer. Safe to share; appends are serialized.
pub struct ReconcileSpool {
    path: PathBuf,
    last_hash: Mutex<Option<String>>,
}

impl ReconcileSpool {
    /// Open (or create) the spool at `path`, resuming the chain from the
    /// last existing line.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create_dir_all {:?}", parent))?;
        }

        let last_hash = if path.exists() {
            read_entries(&path)?
                .last()
                .and_then(|e| e.hash_self.clone())
        } else {
            None
        };

        Ok(Self {
            path,
            last_hash: Mutex::new(last_hash),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, payload: SpoolRecord, reason: &str) -> Result<SpoolEntry> {
        let mut last = self
            .last_hash
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut entry = SpoolEntry {
            entry_id: Uuid::new_v4(),
            ts_utc: Utc::now(),
            reason: reason.to_string(),
            payload,
            hash_prev: last.clone(),
            hash_self: None,
        };
        let self_hash = compute_entry_hash(&entry)?;
        entry.hash_self = Some(self_hash.clone());

        let line = canonical_json_line(&entry)?;
        append_line(&self.path, &line)?;
        *last = Some(self_hash);

        Ok(entry)
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open reconcile spool {:?}", path))?;
    f.write_all(line.as_bytes())
        .context("write spool line failed")?;
    f.write_all(b"\n").context("write newline failed")?;
    f.sync_data().context("fsync spool failed")?;
    Ok(())
}

/// Hash over the canonical JSON of the entry WITHOUT hash_self.
pub fn compute_entry_hash(entry: &SpoolEntry) -> Result<String> {
    let mut clone = entry.clone();
    clone.hash_self = None;
    let canonical = canonical_json_line(&clone)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

pub fn read_entries(path: impl AsRef<Path>) -> Result<Vec<SpoolEntry>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read reconcile spool {:?}", path.as_ref()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| {
            serde_json::from_str(l.trim())
                .with_context(|| format!("parse spool entry at line {}", i + 1))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Valid { lines: usize },
    Broken { line: usize, reason: String },
}

pub fn verify_hash_chain(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read reconcile spool {:?}", path.as_ref()))?;
    verify_hash_chain_str(&content)
}

pub fn verify_hash_chain_str(content: &str) -> Result<VerifyResult> {
    let mut prev_hash: Option<String> = None;
    let mut line_count = 0usize;

    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let entry: SpoolEntry = serde_json::from_str(trimmed)
            .with_context(|| format!("parse spool entry at line {}", i + 1))?;
        line_count += 1;

        if entry.hash_prev != prev_hash {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!(
                    "hash_prev mismatch: expected {:?}, got {:?}",
                    prev_hash, entry.hash_prev
                ),
            });
        }

        match &entry.hash_self {
            Some(claimed) => {
                let recomputed = compute_entry_hash(&entry)?;
                if *claimed != recomputed {
                    return Ok(VerifyResult::Broken {
                        line: i + 1,
                        reason: format!(
                            "hash_self mismatch: claimed {}, recomputed {}",
                            claimed, recomputed
                        ),
                    });
                }
            }
            None => {
                return Ok(VerifyResult::Broken {
                    line: i + 1,
                    reason: "hash_self missing".to_string(),
                })
            }
        }

        prev_hash = entry.hash_self.clone();
    }

    Ok(VerifyResult::Valid { lines: line_count })
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub restored: usize,
    /// Records whose id was already stored (an earlier replay, or the
    /// original write landed after all).
    pub already_present: usize,
    /// (entry_id, error) for entries that could not be written.
    pub failed: Vec<(Uuid, String)>,
}

impl ReplayReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Write spooled records back to their stores. Idempotent: records already
/// present are counted, not duplicated. History entries go to the
/// repository whose kind matches the record's `entity_type`.
///
/// Callers should check [`verify_hash_chain`] first; this does not.
pub async fn replay(
    entries: &[SpoolEntry],
    audit: &dyn AuditTrail,
    repos: &[Arc<dyn EntityRepository>],
) -> ReplayReport {
    let mut report = ReplayReport::default();
    for entry in entries {
        let res = match &entry.payload {
            SpoolRecord::Audit(rec) => audit.restore(rec).await.map_err(|e| e.to_string()),
            SpoolRecord::History(rec) => {
                match repos.iter().find(|r| r.kind().name == rec.entity_type) {
                    Some(repo) => repo.restore_history(rec).await.map_err(|e| e.to_string()),
                    None => Err(format!("no repository for entity type '{}'", rec.entity_type)),
                }
            }
        };
        match res {
            Ok(true) => report.restored += 1,
            Ok(false) => report.already_present += 1,
            Err(e) => {
                let (entity_type, entity_id) = entry.payload.entity();
                tracing::warn!(entry_id = %entry.entry_id, entity_type, entity_id, error = %e, "spool replay failed");
                report.failed.push((entry.entry_id, e));
            }
        }
    }
    report
}
