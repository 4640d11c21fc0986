//! In-process backends for the repository and audit trail.
//!
//! Both honour the same contracts as the SQL implementations (compare-and-set
//! on `version`, soft delete, insert-only audit) and add switches that make
//! individual writes fail on demand.

use async_trait::async_trait;
use chrono::{Duration, SubsecRound, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tm_audit::{
    seal, sort_descending, verify_record_hash, AuditError, AuditFilter, AuditStatistics,
    AuditTrail,
};
use tm_db::{
    DbError, DeleteWrite, EntityRepository, FieldsWrite, ListFilter, ListLimits, RepoError,
    StatusWrite,
};
use tm_schemas::{
    AuditOutcome, AuditRecord, EntityKind, EntityRecord, HistoryRecord, NewAuditRecord,
    NewHistoryRecord,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// MemoryRepository
// ---------------------------------------------------------------------------

struct StoredEntity {
    record: EntityRecord,
    deleted: bool,
}

pub struct MemoryRepository {
    kind: &'static EntityKind,
    limits: ListLimits,
    entities: Mutex<BTreeMap<String, StoredEntity>>,
    history: Mutex<Vec<HistoryRecord>>,
    fail_entity_writes: AtomicBool,
    fail_history: AtomicBool,
    unavailable: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryRepository {
    pub fn new(kind: &'static EntityKind) -> Self {
        Self {
            kind,
            limits: ListLimits::default(),
            entities: Mutex::new(BTreeMap::new()),
            history: Mutex::new(Vec::new()),
            fail_entity_writes: AtomicBool::new(false),
            fail_history: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    /// Entity inserts/updates fail with `WriteFailed`.
    pub fn fail_entity_writes(&self, on: bool) {
        self.fail_entity_writes.store(on, Ordering::SeqCst);
    }

    /// History appends fail with `WriteFailed`.
    pub fn fail_history(&self, on: bool) {
        self.fail_history.store(on, Ordering::SeqCst);
    }

    /// Every call fails with a retryable connection error.
    pub fn set_unavailable(&self, on: bool) {
        self.unavailable.store(on, Ordering::SeqCst);
    }

    /// Number of confirmed entity writes (insert, update, delete).
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Stored row including soft-deleted ones, for assertions.
    pub fn raw(&self, code: &str) -> Option<(EntityRecord, bool)> {
        lock(&self.entities)
            .get(code)
            .map(|s| (s.record.clone(), s.deleted))
    }

    pub fn history_rows(&self) -> Vec<HistoryRecord> {
        lock(&self.history).clone()
    }

    fn check_available(&self) -> Result<(), RepoError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepoError::Db(DbError::Connection(
                "memory store offline".to_string(),
            )));
        }
        Ok(())
    }

    fn check_entity_write(&self) -> Result<(), RepoError> {
        self.check_available()?;
        if self.fail_entity_writes.load(Ordering::SeqCst) {
            return Err(RepoError::WriteFailed {
                table: self.kind.table,
                detail: "injected write failure".to_string(),
            });
        }
        Ok(())
    }

    /// Compare-and-set against the stored version, then apply `f`.
    fn cas<F>(&self, code: &str, expected_version: i64, f: F) -> Result<(), RepoError>
    where
        F: FnOnce(&mut StoredEntity),
    {
        self.check_entity_write()?;
        let mut map = lock(&self.entities);
        let stored = match map.get_mut(code) {
            Some(s) if !s.deleted => s,
            _ => {
                return Err(RepoError::NotFound {
                    kind: self.kind.name,
                    code: code.to_string(),
                })
            }
        };
        if stored.record.version != expected_version {
            return Err(RepoError::Conflict {
                kind: self.kind.name,
                code: code.to_string(),
                expected_version,
            });
        }
        f(stored);
        stored.record.version += 1;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl EntityRepository for MemoryRepository {
    fn kind(&self) -> &'static EntityKind {
        self.kind
    }

    async fn find_by_code(&self, code: &str) -> Result<EntityRecord, RepoError> {
        self.check_available()?;
        lock(&self.entities)
            .get(code)
            .filter(|s| !s.deleted)
            .map(|s| s.record.clone())
            .ok_or_else(|| RepoError::NotFound {
                kind: self.kind.name,
                code: code.to_string(),
            })
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<EntityRecord>, RepoError> {
        self.check_available()?;
        filter.validate(self.kind)?;
        let limit = self.limits.effective(filter.limit) as usize;
        // BTreeMap iteration is already ordered by code.
        Ok(lock(&self.entities)
            .values()
            .filter(|s| !s.deleted && filter.matches(&s.record))
            .map(|s| s.record.clone())
            .take(limit)
            .collect())
    }

    async fn insert(&self, entity: &EntityRecord) -> Result<(), RepoError> {
        self.check_entity_write()?;
        let mut map = lock(&self.entities);
        if map.contains_key(&entity.code) {
            return Err(RepoError::Duplicate {
                kind: self.kind.name,
                code: entity.code.clone(),
            });
        }
        map.insert(
            entity.code.clone(),
            StoredEntity {
                record: entity.clone(),
                deleted: false,
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_status(&self, code: &str, write: &StatusWrite) -> Result<(), RepoError> {
        self.cas(code, write.expected_version, |s| {
            let r = &mut s.record;
            r.status = write.status;
            r.is_active = write.is_active;
            r.approved_by = write.approved_by.clone();
            r.approved_at = write.approved_at;
            r.closed_by = write.closed_by.clone();
            r.closed_at = write.closed_at;
            r.reason = write.reason.clone();
            r.updated_by = write.actor.clone();
            r.updated_at = write.at;
        })
    }

    async fn update_fields(&self, code: &str, write: &FieldsWrite) -> Result<(), RepoError> {
        self.cas(code, write.expected_version, |s| {
            let r = &mut s.record;
            r.name = write.name.clone();
            r.fields = write.fields.clone();
            r.status = write.status;
            r.is_active = write.status.is_active();
            r.reason = write.reason.clone();
            r.updated_by = write.actor.clone();
            r.updated_at = write.at;
        })
    }

    async fn soft_delete(&self, code: &str, write: &DeleteWrite) -> Result<(), RepoError> {
        self.cas(code, write.expected_version, |s| {
            s.deleted = true;
            s.record.is_active = false;
            s.record.updated_by = write.actor.clone();
            s.record.updated_at = write.at;
        })
    }

    async fn append_history(&self, entry: NewHistoryRecord) -> Result<HistoryRecord, RepoError> {
        self.check_available()?;
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(RepoError::WriteFailed {
                table: tm_db::repo::HISTORY_TABLE,
                detail: "injected history failure".to_string(),
            });
        }
        let mut rows = lock(&self.history);
        // Strictly increasing timestamps so timelines sort deterministically.
        let mut at = Utc::now().trunc_subsecs(6);
        if let Some(last) = rows.iter().map(|h| h.created_at).max() {
            if at <= last {
                at = last + Duration::microseconds(1);
            }
        }
        let rec = HistoryRecord::from_new(entry, at);
        rows.push(rec.clone());
        Ok(rec)
    }

    async fn restore_history(&self, record: &HistoryRecord) -> Result<bool, RepoError> {
        self.check_available()?;
        let mut rows = lock(&self.history);
        if rows.iter().any(|h| h.history_id == record.history_id) {
            return Ok(false);
        }
        rows.push(record.clone());
        Ok(true)
    }

    async fn history(&self, code: &str) -> Result<Vec<HistoryRecord>, RepoError> {
        self.check_available()?;
        // Reverse insertion order: callers must not rely on store order.
        Ok(lock(&self.history)
            .iter()
            .rev()
            .filter(|h| h.entity_type == self.kind.name && h.entity_id == code)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryAuditTrail
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryAuditTrail {
    records: Mutex<Vec<AuditRecord>>,
    failing: AtomicBool,
}

impl MemoryAuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// While on, `log_action` and `restore` fail with a retryable error.
    pub fn set_failing(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        lock(&self.records).clone()
    }

    pub fn count(&self, code: &str, outcome: AuditOutcome) -> usize {
        lock(&self.records)
            .iter()
            .filter(|r| r.entity_id == code && r.outcome == outcome)
            .count()
    }

    fn check(&self) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Db(DbError::Connection(
                "audit store offline".to_string(),
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AuditTrail for MemoryAuditTrail {
    async fn log_action(&self, entry: NewAuditRecord) -> Result<AuditRecord, AuditError> {
        self.check()?;
        let rec = seal(entry)?;
        lock(&self.records).push(rec.clone());
        Ok(rec)
    }

    async fn restore(&self, record: &AuditRecord) -> Result<bool, AuditError> {
        self.check()?;
        if !verify_record_hash(record) {
            return Err(AuditError::HashMismatch {
                audit_id: record.audit_id,
            });
        }
        let mut rows = lock(&self.records);
        if rows.iter().any(|r| r.audit_id == record.audit_id) {
            return Ok(false);
        }
        rows.push(record.clone());
        Ok(true)
    }

    async fn by_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        let mut out: Vec<AuditRecord> = lock(&self.records)
            .iter()
            .filter(|r| r.entity_type == entity_type && r.entity_id == entity_id)
            .cloned()
            .collect();
        tm_audit::sort_ascending(&mut out);
        Ok(out)
    }

    async fn statistics(&self, window: Duration) -> Result<AuditStatistics, AuditError> {
        let since = Utc::now() - window;
        Ok(AuditStatistics::from_records(since, lock(&self.records).iter()))
    }

    async fn search(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
        filter.validate()?;
        let mut out: Vec<AuditRecord> = lock(&self.records)
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        sort_descending(&mut out);
        out.truncate(filter.effective_limit() as usize);
        Ok(out)
    }
}
