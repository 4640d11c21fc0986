//! Entity Repository: domain operations translated into SQL.
//!
//! One repository instance serves one [`EntityKind`]. The repository cannot
//! make "read status -> guard -> write -> append history" atomic; instead
//! every write is a compare-and-set on the `version` column, so a stale
//! writer matches zero rows and gets [`RepoError::Conflict`] back.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tm_schemas::{
    EntityKind, EntityRecord, EntityStatus, FieldDiff, HistoryRecord, NewHistoryRecord,
    WorkflowAction,
};

use crate::engine::{DbError, QueryEngine, Row, SqlValue};

pub const HISTORY_TABLE: &str = "entity_history";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("{kind} '{code}' not found")]
    NotFound { kind: &'static str, code: String },
    #[error("{kind} '{code}' already exists")]
    Duplicate { kind: &'static str, code: String },
    /// The compare-and-set matched nothing: someone else wrote first.
    #[error("{kind} '{code}' was modified after version {expected_version}")]
    Conflict {
        kind: &'static str,
        code: String,
        expected_version: i64,
    },
    /// The engine accepted the call but did not confirm the write.
    #[error("write to {table} not confirmed: {detail}")]
    WriteFailed { table: &'static str, detail: String },
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl RepoError {
    /// Lost compare-and-set races and infrastructure errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            RepoError::Conflict { .. } => true,
            RepoError::Db(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Write-path mapping: a rejected statement is a failed write; transport
/// failures stay infrastructure errors.
fn write_error(table: &'static str, err: DbError) -> RepoError {
    match err {
        DbError::Query(detail) | DbError::UniqueViolation(detail) => {
            RepoError::WriteFailed { table, detail }
        }
        other => RepoError::Db(other),
    }
}

// ---------------------------------------------------------------------------
// Filters and writes
// ---------------------------------------------------------------------------

/// Row caps for `list`. No implicit unbounded scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListLimits {
    pub default_limit: u32,
    pub max_limit: u32,
}

impl Default for ListLimits {
    fn default() -> Self {
        Self {
            default_limit: 100,
            max_limit: 1000,
        }
    }
}

impl ListLimits {
    pub fn effective(&self, requested: Option<u32>) -> u32 {
        match requested {
            None | Some(0) => self.default_limit.min(self.max_limit),
            Some(n) => n.min(self.max_limit),
        }
    }
}

/// `list` filters. Present filters combine with AND; absent ones do not
/// restrict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub status: Option<EntityStatus>,
    /// Case-insensitive substring match on code or name.
    pub search: Option<String>,
    /// Exact match on the kind's dimension columns.
    pub dimensions: BTreeMap<String, String>,
    pub limit: Option<u32>,
}

impl ListFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: EntityStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    pub fn dimension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(name.into(), value.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    fn search_term(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }

    /// Reject dimension names the kind does not declare. Dimension names are
    /// interpolated into SQL, so this check is what keeps them safe.
    pub fn validate(&self, kind: &EntityKind) -> Result<(), RepoError> {
        for name in self.dimensions.keys() {
            if !kind.is_dimension(name) {
                return Err(RepoError::InvalidFilter(format!(
                    "'{}' is not a filterable {} column (expected one of: {})",
                    name,
                    kind.name,
                    kind.dimensions.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// In-process evaluation with the same semantics as the SQL translation.
    pub fn matches(&self, rec: &EntityRecord) -> bool {
        if let Some(status) = self.status {
            if rec.status != status {
                return false;
            }
        }
        if let Some(term) = self.search_term() {
            if !rec.code.to_lowercase().contains(&term) && !rec.name.to_lowercase().contains(&term)
            {
                return false;
            }
        }
        self.dimensions
            .iter()
            .all(|(k, v)| rec.field(k) == Some(v.as_str()))
    }
}

/// Status transition write (submit, approve, reject, close, reactivate).
/// Carries the full intended values; nothing is derived in SQL except the
/// version increment.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusWrite {
    pub status: EntityStatus,
    pub is_active: bool,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub closed_by: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub actor: String,
    pub at: DateTime<Utc>,
    pub expected_version: i64,
}

/// Business-field write (edit).
#[derive(Debug, Clone, PartialEq)]
pub struct FieldsWrite {
    pub name: String,
    pub fields: BTreeMap<String, String>,
    pub status: EntityStatus,
    pub reason: Option<String>,
    pub actor: String,
    pub at: DateTime<Utc>,
    pub expected_version: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteWrite {
    pub actor: String,
    pub at: DateTime<Utc>,
    pub expected_version: i64,
}

// ---------------------------------------------------------------------------
// EntityRepository
// ---------------------------------------------------------------------------

#[async_trait]
pub trait EntityRepository: Send + Sync {
    fn kind(&self) -> &'static EntityKind;

    /// Soft-deleted rows are reported as not found.
    async fn find_by_code(&self, code: &str) -> Result<EntityRecord, RepoError>;

    async fn list(&self, filter: &ListFilter) -> Result<Vec<EntityRecord>, RepoError>;

    async fn insert(&self, entity: &EntityRecord) -> Result<(), RepoError>;

    async fn update_status(&self, code: &str, write: &StatusWrite) -> Result<(), RepoError>;

    async fn update_fields(&self, code: &str, write: &FieldsWrite) -> Result<(), RepoError>;

    async fn soft_delete(&self, code: &str, write: &DeleteWrite) -> Result<(), RepoError>;

    async fn append_history(&self, entry: NewHistoryRecord) -> Result<HistoryRecord, RepoError>;

    /// Insert a previously built history record unless its id is already
    /// stored. Returns whether a row was written. Used by spool replay.
    async fn restore_history(&self, record: &HistoryRecord) -> Result<bool, RepoError>;

    /// All history rows for `code`, in whatever order the store returns.
    async fn history(&self, code: &str) -> Result<Vec<HistoryRecord>, RepoError>;
}

const LIFECYCLE_COLUMNS: &[&str] = &[
    "status",
    "is_active",
    "is_deleted",
    "created_by",
    "created_at",
    "approved_by",
    "approved_at",
    "closed_by",
    "closed_at",
    "updated_by",
    "updated_at",
    "reason",
    "version",
];

/// SQL-backed repository for one entity kind.
pub struct SqlEntityRepository<E: QueryEngine> {
    engine: Arc<E>,
    kind: &'static EntityKind,
    limits: ListLimits,
}

impl<E: QueryEngine + 'static> SqlEntityRepository<E> {
    pub fn new(engine: Arc<E>, kind: &'static EntityKind) -> Self {
        Self {
            engine,
            kind,
            limits: ListLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: ListLimits) -> Self {
        self.limits = limits;
        self
    }

    fn select_columns(&self) -> String {
        let mut cols: Vec<&str> = vec!["code", "name"];
        cols.extend(self.kind.fields.iter().map(|f| f.name));
        cols.extend(LIFECYCLE_COLUMNS.iter().copied());
        cols.join(", ")
    }

    fn entity_from_row(&self, row: &Row) -> Result<EntityRecord, RepoError> {
        let status_raw = row.text("status")?;
        let status = EntityStatus::parse(&status_raw).ok_or_else(|| DbError::Decode {
            column: "status".to_string(),
            problem: format!("'{status_raw}' is not a known status"),
        })?;

        let mut fields = BTreeMap::new();
        for spec in self.kind.fields {
            if let Some(v) = row.opt_text(spec.name)? {
                fields.insert(spec.name.to_string(), v);
            }
        }

        Ok(EntityRecord {
            code: row.text("code")?,
            name: row.text("name")?,
            fields,
            status,
            is_active: row.bool("is_active")?,
            created_by: row.text("created_by")?,
            created_at: row.timestamp("created_at")?,
            approved_by: row.opt_text("approved_by")?,
            approved_at: row.opt_timestamp("approved_at")?,
            closed_by: row.opt_text("closed_by")?,
            closed_at: row.opt_timestamp("closed_at")?,
            updated_by: row.text("updated_by")?,
            updated_at: row.timestamp("updated_at")?,
            reason: row.opt_text("reason")?,
            version: row.int("version")?,
        })
    }

    async fn insert_history(&self, rec: &HistoryRecord) -> Result<(), RepoError> {
        let changes = serde_json::to_value(&rec.changes).map_err(|e| RepoError::WriteFailed {
            table: HISTORY_TABLE,
            detail: format!("serialize changes: {e}"),
        })?;

        let sql = format!(
            "insert into {HISTORY_TABLE} (history_id, entity_type, entity_id, action, status, \
             changes, comments, performed_by, created_at) \
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        );
        let params: Vec<SqlValue> = vec![
            rec.history_id.into(),
            rec.entity_type.as_str().into(),
            rec.entity_id.as_str().into(),
            rec.action.as_str().into(),
            rec.status.as_str().into(),
            changes.into(),
            rec.comment.clone().into(),
            rec.performed_by.as_str().into(),
            rec.created_at.into(),
        ];

        let n = self
            .engine
            .execute_statement(&sql, &params)
            .await
            .map_err(|e| write_error(HISTORY_TABLE, e))?;
        if n != 1 {
            return Err(RepoError::WriteFailed {
                table: HISTORY_TABLE,
                detail: format!("insert affected {n} rows"),
            });
        }
        Ok(())
    }

    /// A compare-and-set must touch exactly one row. Zero means a missing row
    /// or a lost race; more than one means the table holds duplicate codes.
    async fn confirm_single_row(
        &self,
        n: u64,
        code: &str,
        expected_version: i64,
    ) -> Result<(), RepoError> {
        match n {
            1 => Ok(()),
            0 => Err(self.zero_rows_error(code, expected_version).await),
            n => {
                tracing::error!(kind = self.kind.name, code, n, "compare-and-set matched several rows");
                Err(RepoError::WriteFailed {
                    table: self.kind.table,
                    detail: format!("update of '{code}' matched {n} rows"),
                })
            }
        }
    }

    async fn zero_rows_error(&self, code: &str, expected_version: i64) -> RepoError {
        match self.find_by_code(code).await {
            Err(RepoError::NotFound { .. }) => RepoError::NotFound {
                kind: self.kind.name,
                code: code.to_string(),
            },
            _ => RepoError::Conflict {
                kind: self.kind.name,
                code: code.to_string(),
                expected_version,
            },
        }
    }
}

#[async_trait]
impl<E: QueryEngine + 'static> EntityRepository for SqlEntityRepository<E> {
    fn kind(&self) -> &'static EntityKind {
        self.kind
    }

    async fn find_by_code(&self, code: &str) -> Result<EntityRecord, RepoError> {
        let sql = format!(
            "select {} from {} where code = $1 and is_deleted = false",
            self.select_columns(),
            self.kind.table
        );
        let rows = self
            .engine
            .execute_query(&sql, &[SqlValue::from(code)])
            .await?;

        match rows.as_slice() {
            [row] => self.entity_from_row(row),
            [] => Err(RepoError::NotFound {
                kind: self.kind.name,
                code: code.to_string(),
            }),
            _ => {
                tracing::error!(kind = self.kind.name, code, n = rows.len(), "duplicate entity rows");
                Err(RepoError::Db(DbError::Decode {
                    column: "code".to_string(),
                    problem: format!("{} live rows share code '{code}'", rows.len()),
                }))
            }
        }
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<EntityRecord>, RepoError> {
        filter.validate(self.kind)?;

        let mut clauses: Vec<String> = vec!["is_deleted = false".to_string()];
        let mut params: Vec<SqlValue> = Vec::new();

        if let Some(status) = filter.status {
            params.push(status.as_str().into());
            clauses.push(format!("status = ${}", params.len()));
        }
        if let Some(term) = filter.search_term() {
            params.push(format!("%{}%", escape_like(&term)).into());
            let n = params.len();
            clauses.push(format!("(lower(code) like ${n} or lower(name) like ${n})"));
        }
        for (name, value) in &filter.dimensions {
            params.push(value.clone().into());
            clauses.push(format!("{} = ${}", name, params.len()));
        }

        let limit = self.limits.effective(filter.limit);
        params.push(SqlValue::Int(i64::from(limit)));

        let sql = format!(
            "select {} from {} where {} order by code limit ${}",
            self.select_columns(),
            self.kind.table,
            clauses.join(" and "),
            params.len()
        );

        let rows = self.engine.execute_query(&sql, &params).await?;
        let mut out = rows
            .iter()
            .map(|r| self.entity_from_row(r))
            .collect::<Result<Vec<_>, _>>()?;
        // Ordering is not guaranteed by every engine; enforce it here.
        out.sort_by(|a, b| a.code.cmp(&b.code));
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn insert(&self, entity: &EntityRecord) -> Result<(), RepoError> {
        let existing = self
            .engine
            .execute_query(
                &format!("select code from {} where code = $1 limit 1", self.kind.table),
                &[SqlValue::from(entity.code.as_str())],
            )
            .await?;
        if !existing.is_empty() {
            return Err(RepoError::Duplicate {
                kind: self.kind.name,
                code: entity.code.clone(),
            });
        }

        let mut cols: Vec<&str> = vec!["code", "name"];
        let mut params: Vec<SqlValue> = vec![
            entity.code.as_str().into(),
            entity.name.as_str().into(),
        ];
        for spec in self.kind.fields {
            cols.push(spec.name);
            params.push(entity.field(spec.name).into());
        }
        cols.extend(LIFECYCLE_COLUMNS.iter().copied());
        let lifecycle: [SqlValue; 13] = [
            entity.status.as_str().into(),
            entity.is_active.into(),
            false.into(),
            entity.created_by.as_str().into(),
            entity.created_at.into(),
            entity.approved_by.clone().into(),
            entity.approved_at.into(),
            entity.closed_by.clone().into(),
            entity.closed_at.into(),
            entity.updated_by.as_str().into(),
            entity.updated_at.into(),
            entity.reason.clone().into(),
            entity.version.into(),
        ];
        params.extend(lifecycle);

        let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("${i}")).collect();
        let sql = format!(
            "insert into {} ({}) values ({})",
            self.kind.table,
            cols.join(", "),
            placeholders.join(", ")
        );

        // The select above is advisory; the unique index on `code` decides.
        let n = self
            .engine
            .execute_statement(&sql, &params)
            .await
            .map_err(|e| match e {
                DbError::UniqueViolation(_) => RepoError::Duplicate {
                    kind: self.kind.name,
                    code: entity.code.clone(),
                },
                other => write_error(self.kind.table, other),
            })?;
        if n != 1 {
            return Err(RepoError::WriteFailed {
                table: self.kind.table,
                detail: format!("insert affected {n} rows"),
            });
        }
        Ok(())
    }

    async fn update_status(&self, code: &str, write: &StatusWrite) -> Result<(), RepoError> {
        let sql = format!(
            "update {} set status = $1, is_active = $2, approved_by = $3, approved_at = $4, \
             closed_by = $5, closed_at = $6, reason = $7, updated_by = $8, updated_at = $9, \
             version = version + 1 \
             where code = $10 and version = $11 and is_deleted = false",
            self.kind.table
        );
        let params: Vec<SqlValue> = vec![
            write.status.as_str().into(),
            write.is_active.into(),
            write.approved_by.clone().into(),
            write.approved_at.into(),
            write.closed_by.clone().into(),
            write.closed_at.into(),
            write.reason.clone().into(),
            write.actor.as_str().into(),
            write.at.into(),
            code.into(),
            write.expected_version.into(),
        ];

        let n = self
            .engine
            .execute_statement(&sql, &params)
            .await
            .map_err(|e| write_error(self.kind.table, e))?;
        self.confirm_single_row(n, code, write.expected_version).await
    }

    async fn update_fields(&self, code: &str, write: &FieldsWrite) -> Result<(), RepoError> {
        let mut sets: Vec<String> = vec!["name = $1".to_string()];
        let mut params: Vec<SqlValue> = vec![write.name.as_str().into()];
        for spec in self.kind.fields {
            params.push(write.fields.get(spec.name).cloned().into());
            sets.push(format!("{} = ${}", spec.name, params.len()));
        }
        for (col, value) in [
            ("status", SqlValue::from(write.status.as_str())),
            ("is_active", SqlValue::from(write.status.is_active())),
            ("reason", SqlValue::from(write.reason.clone())),
            ("updated_by", SqlValue::from(write.actor.as_str())),
            ("updated_at", SqlValue::from(write.at)),
        ] {
            params.push(value);
            sets.push(format!("{} = ${}", col, params.len()));
        }
        sets.push("version = version + 1".to_string());

        params.push(code.into());
        let code_idx = params.len();
        params.push(write.expected_version.into());
        let version_idx = params.len();

        let sql = format!(
            "update {} set {} where code = ${} and version = ${} and is_deleted = false",
            self.kind.table,
            sets.join(", "),
            code_idx,
            version_idx
        );

        let n = self
            .engine
            .execute_statement(&sql, &params)
            .await
            .map_err(|e| write_error(self.kind.table, e))?;
        self.confirm_single_row(n, code, write.expected_version).await
    }

    async fn soft_delete(&self, code: &str, write: &DeleteWrite) -> Result<(), RepoError> {
        let sql = format!(
            "update {} set is_deleted = true, is_active = false, updated_by = $1, updated_at = $2, \
             version = version + 1 \
             where code = $3 and version = $4 and is_deleted = false",
            self.kind.table
        );
        let params: Vec<SqlValue> = vec![
            write.actor.as_str().into(),
            write.at.into(),
            code.into(),
            write.expected_version.into(),
        ];
        let n = self
            .engine
            .execute_statement(&sql, &params)
            .await
            .map_err(|e| write_error(self.kind.table, e))?;
        self.confirm_single_row(n, code, write.expected_version).await
    }

    async fn append_history(&self, entry: NewHistoryRecord) -> Result<HistoryRecord, RepoError> {
        let rec = HistoryRecord::from_new(entry, Utc::now().trunc_subsecs(6));
        self.insert_history(&rec).await?;
        Ok(rec)
    }

    async fn restore_history(&self, record: &HistoryRecord) -> Result<bool, RepoError> {
        let existing = self
            .engine
            .execute_query(
                &format!("select history_id from {HISTORY_TABLE} where history_id = $1 limit 1"),
                &[SqlValue::from(record.history_id)],
            )
            .await?;
        if !existing.is_empty() {
            return Ok(false);
        }
        self.insert_history(record).await?;
        Ok(true)
    }

    async fn history(&self, code: &str) -> Result<Vec<HistoryRecord>, RepoError> {
        let sql = format!(
            "select history_id, entity_type, entity_id, action, status, changes, comments, \
             performed_by, created_at from {HISTORY_TABLE} \
             where entity_type = $1 and entity_id = $2"
        );
        let rows = self
            .engine
            .execute_query(&sql, &[SqlValue::from(self.kind.name), SqlValue::from(code)])
            .await?;
        rows.iter().map(history_from_row).collect()
    }
}

pub fn history_from_row(row: &Row) -> Result<HistoryRecord, RepoError> {
    let action_raw = row.text("action")?;
    let action = WorkflowAction::parse(&action_raw).ok_or_else(|| DbError::Decode {
        column: "action".to_string(),
        problem: format!("'{action_raw}' is not a known action"),
    })?;
    let status_raw = row.text("status")?;
    let status = EntityStatus::parse(&status_raw).ok_or_else(|| DbError::Decode {
        column: "status".to_string(),
        problem: format!("'{status_raw}' is not a known status"),
    })?;
    let changes: Vec<FieldDiff> =
        serde_json::from_value(row.json("changes")?).map_err(|e| DbError::Decode {
            column: "changes".to_string(),
            problem: e.to_string(),
        })?;

    Ok(HistoryRecord {
        history_id: row.uuid("history_id")?,
        entity_type: row.text("entity_type")?,
        entity_id: row.text("entity_id")?,
        action,
        status,
        changes,
        comment: row.opt_text("comments")?,
        performed_by: row.text("performed_by")?,
        created_at: row.timestamp("created_at")?,
    })
}

/// Escape LIKE metacharacters so user text matches literally.
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SqlType;
    use crate::testkit::RecordingEngine;
    use tm_schemas::{NewEntity, PORTFOLIO};

    fn portfolio_row(code: &str, status: &str, version: i64) -> Row {
        let now = Utc::now();
        Row::new()
            .with("code", code)
            .with("name", "Global Macro")
            .with("base_currency", "USD")
            .with("manager", "desk-a")
            .with("strategy", None::<String>)
            .with("status", status)
            .with("is_active", status == "ACTIVE")
            .with("is_deleted", false)
            .with("created_by", "u1")
            .with("created_at", now)
            .with("approved_by", None::<String>)
            .with("approved_at", None::<DateTime<Utc>>)
            .with("closed_by", None::<String>)
            .with("closed_at", None::<DateTime<Utc>>)
            .with("updated_by", "u1")
            .with("updated_at", now)
            .with("reason", None::<String>)
            .with("version", version)
    }

    fn repo(engine: &Arc<RecordingEngine>) -> SqlEntityRepository<RecordingEngine> {
        SqlEntityRepository::new(Arc::clone(engine), &PORTFOLIO)
    }

    #[tokio::test]
    async fn find_by_code_maps_row_and_excludes_deleted() {
        let engine = Arc::new(RecordingEngine::new());
        engine.push_rows(vec![portfolio_row("PF001", "DRAFT", 1)]);

        let rec = repo(&engine).find_by_code("PF001").await.unwrap();
        assert_eq!(rec.code, "PF001");
        assert_eq!(rec.status, EntityStatus::Draft);
        assert_eq!(rec.field("base_currency"), Some("USD"));
        assert_eq!(rec.field("strategy"), None);

        let calls = engine.calls();
        assert!(calls[0].sql.contains("from portfolios where code = $1 and is_deleted = false"));
        assert_eq!(calls[0].params, vec![SqlValue::from("PF001")]);
    }

    #[tokio::test]
    async fn find_by_code_missing_is_not_found() {
        let engine = Arc::new(RecordingEngine::new());
        let err = repo(&engine).find_by_code("NOPE").await.unwrap_err();
        assert!(matches!(err, RepoError::NotFound { code, .. } if code == "NOPE"));
    }

    #[tokio::test]
    async fn unknown_status_is_a_decode_error() {
        let engine = Arc::new(RecordingEngine::new());
        engine.push_rows(vec![portfolio_row("PF001", "ARCHIVED", 1)]);
        let err = repo(&engine).find_by_code("PF001").await.unwrap_err();
        assert!(matches!(err, RepoError::Db(DbError::Decode { .. })));
    }

    #[tokio::test]
    async fn list_combines_filters_with_and_and_caps_limit() {
        let engine = Arc::new(RecordingEngine::new());
        let filter = ListFilter::new()
            .status(EntityStatus::Active)
            .search("Mac%")
            .dimension("base_currency", "USD")
            .limit(50_000);
        repo(&engine).list(&filter).await.unwrap();

        let call = &engine.calls()[0];
        assert!(call.sql.contains(
            "where is_deleted = false and status = $1 and (lower(code) like $2 or lower(name) like $2) and base_currency = $3"
        ), "{}", call.sql);
        assert!(call.sql.ends_with("order by code limit $4"), "{}", call.sql);
        assert_eq!(
            call.params,
            vec![
                SqlValue::from("ACTIVE"),
                SqlValue::from("%mac\\%%"),
                SqlValue::from("USD"),
                SqlValue::Int(1000),
            ]
        );
    }

    #[tokio::test]
    async fn list_without_filters_uses_default_limit() {
        let engine = Arc::new(RecordingEngine::new());
        engine.push_rows(vec![
            portfolio_row("PF002", "DRAFT", 1),
            portfolio_row("PF001", "DRAFT", 1),
        ]);
        let out = repo(&engine).list(&ListFilter::new()).await.unwrap();
        assert_eq!(
            out.iter().map(|r| r.code.as_str()).collect::<Vec<_>>(),
            vec!["PF001", "PF002"],
            "results are sorted client-side"
        );
        let call = &engine.calls()[0];
        assert_eq!(call.params, vec![SqlValue::Int(100)]);
    }

    #[tokio::test]
    async fn list_rejects_undeclared_dimension() {
        let engine = Arc::new(RecordingEngine::new());
        let filter = ListFilter::new().dimension("1=1; drop table portfolios", "x");
        let err = repo(&engine).list(&filter).await.unwrap_err();
        assert!(matches!(err, RepoError::InvalidFilter(_)));
        assert!(engine.calls().is_empty(), "nothing reaches the engine");
    }

    #[tokio::test]
    async fn insert_refuses_existing_code() {
        let engine = Arc::new(RecordingEngine::new());
        engine.push_rows(vec![Row::new().with("code", "PF001")]);
        let rec = EntityRecord::draft(
            NewEntity::new("PF001", "Dup")
                .field("base_currency", "USD")
                .field("manager", "m"),
            "u1",
            Utc::now(),
        );
        let err = repo(&engine).insert(&rec).await.unwrap_err();
        assert!(matches!(err, RepoError::Duplicate { .. }));
        assert_eq!(engine.calls().len(), 1, "no insert issued");
    }

    #[tokio::test]
    async fn insert_losing_the_unique_index_race_is_duplicate() {
        let engine = Arc::new(RecordingEngine::new());
        // The lookup saw nothing; a concurrent create got the row in first.
        engine.push_statement_error(DbError::UniqueViolation(
            "duplicate key value violates unique constraint \"ux_portfolios_code\"".into(),
        ));
        let rec = EntityRecord::draft(
            NewEntity::new("PF001", "Racer")
                .field("base_currency", "USD")
                .field("manager", "m"),
            "u1",
            Utc::now(),
        );
        let err = repo(&engine).insert(&rec).await.unwrap_err();
        assert!(matches!(err, RepoError::Duplicate { ref code, .. } if code == "PF001"), "{err:?}");
        assert_eq!(engine.statements().len(), 1);
    }

    #[tokio::test]
    async fn compare_and_set_touching_several_rows_is_write_failed() {
        let engine = Arc::new(RecordingEngine::new());
        engine.push_affected(2);
        let write = StatusWrite {
            status: EntityStatus::Active,
            is_active: true,
            approved_by: Some("u2".into()),
            approved_at: Some(Utc::now()),
            closed_by: None,
            closed_at: None,
            reason: None,
            actor: "u2".into(),
            at: Utc::now(),
            expected_version: 2,
        };
        let err = repo(&engine).update_status("PF001", &write).await.unwrap_err();
        assert!(matches!(err, RepoError::WriteFailed { table: "portfolios", .. }), "{err:?}");

        engine.push_affected(3);
        let delete = DeleteWrite {
            actor: "u1".into(),
            at: Utc::now(),
            expected_version: 1,
        };
        let err = repo(&engine).soft_delete("PF001", &delete).await.unwrap_err();
        assert!(matches!(err, RepoError::WriteFailed { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn ambiguous_code_is_an_error_not_a_pick() {
        let engine = Arc::new(RecordingEngine::new());
        engine.push_rows(vec![
            portfolio_row("PF001", "DRAFT", 1),
            portfolio_row("PF001", "ACTIVE", 3),
        ]);
        let err = repo(&engine).find_by_code("PF001").await.unwrap_err();
        assert!(matches!(err, RepoError::Db(DbError::Decode { ref column, .. }) if column == "code"), "{err:?}");
    }

    #[tokio::test]
    async fn insert_binds_every_column() {
        let engine = Arc::new(RecordingEngine::new());
        let rec = EntityRecord::draft(
            NewEntity::new("PF001", "Growth")
                .field("base_currency", "USD")
                .field("manager", "m"),
            "u1",
            Utc::now(),
        );
        repo(&engine).insert(&rec).await.unwrap();

        let insert = &engine.calls()[1];
        assert!(insert.sql.starts_with("insert into portfolios (code, name, base_currency, manager, strategy, status"));
        // code, name, 3 business fields, 13 lifecycle columns
        assert_eq!(insert.params.len(), 18);
        assert_eq!(insert.params[4], SqlValue::Null(SqlType::Text), "strategy absent");
    }

    #[tokio::test]
    async fn update_status_is_compare_and_set() {
        let engine = Arc::new(RecordingEngine::new());
        let write = StatusWrite {
            status: EntityStatus::PendingApproval,
            is_active: false,
            approved_by: None,
            approved_at: None,
            closed_by: None,
            closed_at: None,
            reason: None,
            actor: "u1".into(),
            at: Utc::now(),
            expected_version: 4,
        };
        repo(&engine).update_status("PF001", &write).await.unwrap();

        let call = &engine.calls()[0];
        assert!(call.sql.contains("version = version + 1"));
        assert!(call.sql.contains("where code = $10 and version = $11"));
        assert_eq!(call.params[9], SqlValue::from("PF001"));
        assert_eq!(call.params[10], SqlValue::Int(4));
    }

    #[tokio::test]
    async fn zero_rows_on_existing_entity_is_conflict() {
        let engine = Arc::new(RecordingEngine::new());
        engine.push_affected(0);
        engine.push_rows(vec![portfolio_row("PF001", "ACTIVE", 5)]);
        let write = DeleteWrite {
            actor: "u1".into(),
            at: Utc::now(),
            expected_version: 4,
        };
        let err = repo(&engine).soft_delete("PF001", &write).await.unwrap_err();
        assert!(matches!(err, RepoError::Conflict { expected_version: 4, .. }));
    }

    #[tokio::test]
    async fn zero_rows_on_missing_entity_is_not_found() {
        let engine = Arc::new(RecordingEngine::new());
        engine.push_affected(0);
        let write = DeleteWrite {
            actor: "u1".into(),
            at: Utc::now(),
            expected_version: 1,
        };
        let err = repo(&engine).soft_delete("GONE", &write).await.unwrap_err();
        assert!(matches!(err, RepoError::NotFound { .. }));
    }

    #[tokio::test]
    async fn rejected_write_is_write_failed_but_pool_timeout_stays_retryable() {
        let engine = Arc::new(RecordingEngine::new());
        engine.push_statement_error(DbError::Query("column does not exist".into()));
        let write = DeleteWrite {
            actor: "u1".into(),
            at: Utc::now(),
            expected_version: 1,
        };
        let err = repo(&engine).soft_delete("PF001", &write).await.unwrap_err();
        assert!(matches!(err, RepoError::WriteFailed { table: "portfolios", .. }));
        assert!(!err.is_retryable());

        engine.push_statement_error(DbError::PoolExhausted { waited_ms: 10 });
        let err = repo(&engine).soft_delete("PF001", &write).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn history_round_trips_changes() {
        let engine = Arc::new(RecordingEngine::new());
        let r = repo(&engine);
        let rec = r
            .append_history(NewHistoryRecord {
                entity_type: "portfolio".into(),
                entity_id: "PF001".into(),
                action: WorkflowAction::Edit,
                status: EntityStatus::Draft,
                changes: vec![FieldDiff {
                    field: "manager".into(),
                    before: Some("a".into()),
                    after: Some("b".into()),
                }],
                comment: None,
                performed_by: "u1".into(),
            })
            .await
            .unwrap();

        let insert = engine.calls()[0].clone();
        assert!(insert.sql.starts_with("insert into entity_history"));
        assert_eq!(rec.created_at.timestamp_subsec_nanos() % 1_000, 0, "stamped at µs precision");

        engine.push_rows(vec![Row::new()
            .with("history_id", rec.history_id)
            .with("entity_type", "portfolio")
            .with("entity_id", "PF001")
            .with("action", "edit")
            .with("status", "DRAFT")
            .with("changes", insert.params[5].clone())
            .with("comments", None::<String>)
            .with("performed_by", "u1")
            .with("created_at", rec.created_at)]);
        let back = r.history("PF001").await.unwrap();
        assert_eq!(back, vec![rec]);
    }

    #[tokio::test]
    async fn restore_history_skips_known_ids() {
        let engine = Arc::new(RecordingEngine::new());
        let rec = HistoryRecord::from_new(
            NewHistoryRecord {
                entity_type: "portfolio".into(),
                entity_id: "PF001".into(),
                action: WorkflowAction::Submit,
                status: EntityStatus::PendingApproval,
                changes: vec![],
                comment: None,
                performed_by: "u1".into(),
            },
            Utc::now(),
        );

        engine.push_rows(vec![Row::new().with("history_id", rec.history_id)]);
        assert!(!repo(&engine).restore_history(&rec).await.unwrap());
        assert!(engine.statements().is_empty());

        assert!(repo(&engine).restore_history(&rec).await.unwrap());
        let stmts = engine.statements();
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].params[0], SqlValue::Uuid(rec.history_id));
    }

    #[test]
    fn default_limit_never_exceeds_the_cap() {
        let limits = ListLimits {
            default_limit: 5_000,
            max_limit: 1_000,
        };
        assert_eq!(limits.effective(None), 1_000);
        assert_eq!(limits.effective(Some(0)), 1_000);
        assert_eq!(limits.effective(Some(20)), 20);
        assert_eq!(ListLimits::default().effective(None), 100);
    }

    #[test]
    fn filter_matches_mirror_sql_semantics() {
        let rec = EntityRecord::draft(
            NewEntity::new("PF001", "Global Macro")
                .field("base_currency", "USD")
                .field("manager", "m"),
            "u1",
            Utc::now(),
        );
        assert!(ListFilter::new().matches(&rec));
        assert!(ListFilter::new().search("macro").matches(&rec));
        assert!(ListFilter::new().search("pf0").matches(&rec));
        assert!(!ListFilter::new().status(EntityStatus::Active).matches(&rec));
        assert!(!ListFilter::new().dimension("base_currency", "EUR").matches(&rec));
        assert!(ListFilter::new()
            .status(EntityStatus::Draft)
            .dimension("base_currency", "USD")
            .matches(&rec));
    }
}
