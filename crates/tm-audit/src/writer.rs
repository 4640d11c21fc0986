//! SQL-backed audit log. This module issues INSERT and SELECT only; audit
//! rows are never updated or deleted.

use async_trait::async_trait;
use chrono::{Duration, SubsecRound, Utc};
use std::sync::Arc;
use tm_db::{DbError, QueryEngine, Row, SqlValue};
use tm_schemas::{AuditOutcome, AuditRecord, FieldDiff, NewAuditRecord, RequestContext, WorkflowAction};
use uuid::Uuid;

use crate::{
    canonical_json_line, sha256_hex, sort_ascending, sort_descending, AuditError, AuditFilter,
    AuditStatistics, AuditTrail,
};

pub const AUDIT_TABLE: &str = "audit_logs";

const COLUMNS: &str = "audit_id, entity_type, entity_id, action, actor, actor_name, description, \
                       changes, outcome, context, created_at, record_hash";

/// SHA-256 over the canonical JSON of `rec` with `record_hash` blanked.
pub fn compute_record_hash(rec: &AuditRecord) -> anyhow::Result<String> {
    let mut clone = rec.clone();
    clone.record_hash = String::new();
    let canonical = canonical_json_line(&clone)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

pub fn verify_record_hash(rec: &AuditRecord) -> bool {
    compute_record_hash(rec)
        .map(|h| h == rec.record_hash)
        .unwrap_or(false)
}

/// Build the immutable record for `entry`: id, timestamp, hash.
pub fn seal(entry: NewAuditRecord) -> Result<AuditRecord, AuditError> {
    let mut rec = AuditRecord {
        audit_id: Uuid::new_v4(),
        entity_type: entry.entity_type,
        entity_id: entry.entity_id,
        action: entry.action,
        actor: entry.actor,
        actor_name: entry.actor_name,
        description: entry.description,
        changes: entry.changes,
        outcome: entry.outcome,
        context: entry.context,
        // Storage keeps microseconds; hash what will be read back.
        created_at: Utc::now().trunc_subsecs(6),
        record_hash: String::new(),
    };
    rec.record_hash =
        compute_record_hash(&rec).map_err(|e| AuditError::WriteFailed(format!("{e:#}")))?;
    Ok(rec)
}

pub struct AuditLogWriter<E: QueryEngine> {
    engine: Arc<E>,
}

impl<E: QueryEngine> AuditLogWriter<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }

    async fn insert(&self, rec: &AuditRecord) -> Result<(), AuditError> {
        let changes = serde_json::to_value(&rec.changes)
            .map_err(|e| AuditError::WriteFailed(format!("serialize changes: {e}")))?;
        let context = serde_json::to_value(&rec.context)
            .map_err(|e| AuditError::WriteFailed(format!("serialize context: {e}")))?;

        let sql = format!(
            "insert into {AUDIT_TABLE} ({COLUMNS}) \
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        );
        let params: Vec<SqlValue> = vec![
            rec.audit_id.into(),
            rec.entity_type.as_str().into(),
            rec.entity_id.as_str().into(),
            rec.action.as_str().into(),
            rec.actor.as_str().into(),
            rec.actor_name.as_str().into(),
            rec.description.as_str().into(),
            changes.into(),
            rec.outcome.as_str().into(),
            context.into(),
            rec.created_at.into(),
            rec.record_hash.as_str().into(),
        ];

        let n = self
            .engine
            .execute_statement(&sql, &params)
            .await
            .map_err(|e| match e {
                DbError::Query(detail) | DbError::UniqueViolation(detail) => {
                    AuditError::WriteFailed(detail)
                }
                other => AuditError::Db(other),
            })?;
        if n != 1 {
            return Err(AuditError::WriteFailed(format!("insert affected {n} rows")));
        }
        Ok(())
    }

    async fn select(&self, where_sql: &str, params: &[SqlValue]) -> Result<Vec<AuditRecord>, AuditError> {
        let sql = format!("select {COLUMNS} from {AUDIT_TABLE} {where_sql}");
        let rows = self.engine.execute_query(&sql, params).await?;
        rows.iter().map(audit_from_row).collect()
    }
}

#[async_trait]
impl<E: QueryEngine + 'static> AuditTrail for AuditLogWriter<E> {
    async fn log_action(&self, entry: NewAuditRecord) -> Result<AuditRecord, AuditError> {
        let rec = seal(entry)?;
        self.insert(&rec).await?;
        tracing::debug!(
            audit_id = %rec.audit_id,
            entity_type = %rec.entity_type,
            entity_id = %rec.entity_id,
            action = rec.action.as_str(),
            outcome = rec.outcome.as_str(),
            "audit record written"
        );
        Ok(rec)
    }

    async fn restore(&self, record: &AuditRecord) -> Result<bool, AuditError> {
        if !verify_record_hash(record) {
            return Err(AuditError::HashMismatch {
                audit_id: record.audit_id,
            });
        }
        let existing = self
            .engine
            .execute_query(
                &format!("select audit_id from {AUDIT_TABLE} where audit_id = $1 limit 1"),
                &[SqlValue::from(record.audit_id)],
            )
            .await?;
        if !existing.is_empty() {
            return Ok(false);
        }
        self.insert(record).await?;
        Ok(true)
    }

    async fn by_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        let mut out = self
            .select(
                "where entity_type = $1 and entity_id = $2",
                &[SqlValue::from(entity_type), SqlValue::from(entity_id)],
            )
            .await?;
        sort_ascending(&mut out);
        Ok(out)
    }

    async fn statistics(&self, window: Duration) -> Result<AuditStatistics, AuditError> {
        let since = Utc::now() - window;
        let mut stats = AuditStatistics {
            since: Some(since),
            ..Default::default()
        };

        let rows = self
            .engine
            .execute_query(
                &format!(
                    "select action, outcome, count(*) as n from {AUDIT_TABLE} \
                     where created_at >= $1 group by action, outcome"
                ),
                &[SqlValue::from(since)],
            )
            .await?;
        for row in &rows {
            let n = count(row)?;
            let outcome_raw = row.text("outcome")?;
            let outcome = AuditOutcome::parse(&outcome_raw).ok_or_else(|| DbError::Decode {
                column: "outcome".to_string(),
                problem: format!("'{outcome_raw}' is not a known outcome"),
            })?;
            stats.total += n;
            match outcome {
                AuditOutcome::Success => stats.successes += n,
                AuditOutcome::Failure => stats.failures += n,
            }
            *stats.by_action.entry(row.text("action")?).or_default() += n;
        }

        let rows = self
            .engine
            .execute_query(
                &format!(
                    "select actor, count(*) as n from {AUDIT_TABLE} \
                     where created_at >= $1 group by actor"
                ),
                &[SqlValue::from(since)],
            )
            .await?;
        for row in &rows {
            *stats.by_actor.entry(row.text("actor")?).or_default() += count(row)?;
        }

        Ok(stats)
    }

    async fn search(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
        filter.validate()?;

        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        let mut eq = |col: &str, v: SqlValue, clauses: &mut Vec<String>| {
            params.push(v);
            clauses.push(format!("{col} = ${}", params.len()));
        };
        if let Some(t) = &filter.entity_type {
            eq("entity_type", t.as_str().into(), &mut clauses);
        }
        if let Some(id) = &filter.entity_id {
            eq("entity_id", id.as_str().into(), &mut clauses);
        }
        if let Some(a) = &filter.actor {
            eq("actor", a.as_str().into(), &mut clauses);
        }
        if let Some(a) = filter.action {
            eq("action", a.as_str().into(), &mut clauses);
        }
        if let Some(o) = filter.outcome {
            eq("outcome", o.as_str().into(), &mut clauses);
        }
        if let Some(t) = filter.since {
            params.push(t.into());
            clauses.push(format!("created_at >= ${}", params.len()));
        }
        if let Some(t) = filter.until {
            params.push(t.into());
            clauses.push(format!("created_at <= ${}", params.len()));
        }

        let limit = filter.effective_limit();
        params.push(SqlValue::Int(i64::from(limit)));

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("where {}", clauses.join(" and "))
        };
        let tail = format!("{where_sql} order by created_at desc limit ${}", params.len());

        let mut out = self.select(&tail, &params).await?;
        sort_descending(&mut out);
        out.truncate(limit as usize);
        Ok(out)
    }
}

fn count(row: &Row) -> Result<u64, DbError> {
    let n = row.int("n")?;
    u64::try_from(n).map_err(|_| DbError::Decode {
        column: "n".to_string(),
        problem: format!("negative count {n}"),
    })
}

pub fn audit_from_row(row: &Row) -> Result<AuditRecord, AuditError> {
    let decode = |column: &str, problem: String| DbError::Decode {
        column: column.to_string(),
        problem,
    };

    let action_raw = row.text("action")?;
    let action = WorkflowAction::parse(&action_raw)
        .ok_or_else(|| decode("action", format!("'{action_raw}' is not a known action")))?;
    let outcome_raw = row.text("outcome")?;
    let outcome = AuditOutcome::parse(&outcome_raw)
        .ok_or_else(|| decode("outcome", format!("'{outcome_raw}' is not a known outcome")))?;
    let changes: Vec<FieldDiff> = serde_json::from_value(row.json("changes")?)
        .map_err(|e| decode("changes", e.to_string()))?;
    let context: RequestContext = serde_json::from_value(row.json("context")?)
        .map_err(|e| decode("context", e.to_string()))?;

    Ok(AuditRecord {
        audit_id: row.uuid("audit_id")?,
        entity_type: row.text("entity_type")?,
        entity_id: row.text("entity_id")?,
        action,
        actor: row.text("actor")?,
        actor_name: row.text("actor_name")?,
        description: row.text("description")?,
        changes,
        outcome,
        context,
        created_at: row.timestamp("created_at")?,
        record_hash: row.text("record_hash")?,
    })
}
