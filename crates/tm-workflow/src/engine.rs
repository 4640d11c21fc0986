//! Maker-checker workflow engine.
//!
//! One engine instance serves one entity kind (the kind of its repository).
//! Every call runs the same pipeline:
//!
//! 0. validate input            -> `Validation`
//! 1. load the persisted entity -> `NotFound`
//! 2. evaluate the guard table  -> `IllegalTransition`
//! 3. compute the field diff
//! 4. re-read, then compare-and-set write -> `Conflict` / `WriteFailed`
//! 5. audit SUCCESS + history append
//!
//! Failures in 0-4 are audited once as FAILURE and returned. Failures in 5
//! do not undo the committed write: the call returns
//! [`TransitionOutcome::Degraded`] and the unwritten records go to the
//! reconciliation spool when one is configured.

use chrono::{DateTime, SubsecRound, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tm_audit::{diff_entity, seal, AuditTrail, HistoryTracker, ReconcileSpool, SpoolRecord};
use tm_db::{DeleteWrite, EntityRepository, FieldsWrite, ListFilter, StatusWrite};
use tm_schemas::{
    Actor, AuditOutcome, AuditRecord, EntityKind, EntityRecord, EntityStatus, FieldDiff,
    HistoryRecord, NewAuditRecord, NewEntity, NewHistoryRecord, RequestContext, WorkflowAction,
};

use crate::error::WorkflowError;
use crate::guard;
use crate::permissions::PermissionService;

const MAX_REASON_LEN: usize = 500;

// ---------------------------------------------------------------------------
// Commands and outcomes
// ---------------------------------------------------------------------------

/// A transition on an existing entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowCommand {
    /// Replace name and business fields.
    Edit {
        name: String,
        fields: BTreeMap<String, String>,
    },
    Submit,
    Approve { comment: Option<String> },
    /// `reason` is mandatory.
    Reject { reason: String },
    Delete,
    Close { reason: Option<String> },
    /// `comment` is mandatory.
    Reactivate { comment: String },
}

impl WorkflowCommand {
    pub fn action(&self) -> WorkflowAction {
        match self {
            WorkflowCommand::Edit { .. } => WorkflowAction::Edit,
            WorkflowCommand::Submit => WorkflowAction::Submit,
            WorkflowCommand::Approve { .. } => WorkflowAction::Approve,
            WorkflowCommand::Reject { .. } => WorkflowAction::Reject,
            WorkflowCommand::Delete => WorkflowAction::Delete,
            WorkflowCommand::Close { .. } => WorkflowAction::Close,
            WorkflowCommand::Reactivate { .. } => WorkflowAction::Reactivate,
        }
    }

    /// Free-text remark carried into history, if any.
    fn comment(&self) -> Option<String> {
        match self {
            WorkflowCommand::Approve { comment } => clean(comment.as_deref()),
            WorkflowCommand::Reject { reason } => clean(Some(reason)),
            WorkflowCommand::Close { reason } => clean(reason.as_deref()),
            WorkflowCommand::Reactivate { comment } => clean(Some(comment)),
            _ => None,
        }
    }
}

fn clean(s: Option<&str>) -> Option<String> {
    s.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Records that could not be written after the mutation committed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuditGap {
    pub audit_error: Option<String>,
    pub history_error: Option<String>,
    /// Every missing record was appended to the reconciliation spool.
    pub spooled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Committed(EntityRecord),
    /// The entity was mutated but its audit and/or history record is missing.
    Degraded {
        entity: EntityRecord,
        gap: AuditGap,
    },
}

impl TransitionOutcome {
    pub fn entity(&self) -> &EntityRecord {
        match self {
            TransitionOutcome::Committed(e) => e,
            TransitionOutcome::Degraded { entity, .. } => entity,
        }
    }

    pub fn into_entity(self) -> EntityRecord {
        match self {
            TransitionOutcome::Committed(e) => e,
            TransitionOutcome::Degraded { entity, .. } => entity,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, TransitionOutcome::Degraded { .. })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct WorkflowEngine {
    repo: Arc<dyn EntityRepository>,
    history: HistoryTracker,
    audit: Arc<dyn AuditTrail>,
    permissions: Arc<dyn PermissionService>,
    spool: Option<Arc<ReconcileSpool>>,
}

/// What a successful write produced, before step 5.
struct Applied {
    entity: EntityRecord,
    changes: Vec<FieldDiff>,
    history_status: EntityStatus,
    description: String,
}

impl WorkflowEngine {
    pub fn new(
        repo: Arc<dyn EntityRepository>,
        audit: Arc<dyn AuditTrail>,
        permissions: Arc<dyn PermissionService>,
    ) -> Self {
        Self {
            history: HistoryTracker::new(Arc::clone(&repo)),
            repo,
            audit,
            permissions,
            spool: None,
        }
    }

    pub fn with_spool(mut self, spool: Arc<ReconcileSpool>) -> Self {
        self.spool = Some(spool);
        self
    }

    pub fn kind(&self) -> &'static EntityKind {
        self.repo.kind()
    }

    // -----------------------------------------------------------------------
    // Reads (not audited)
    // -----------------------------------------------------------------------

    pub async fn get(&self, code: &str) -> Result<EntityRecord, WorkflowError> {
        self.repo
            .find_by_code(code)
            .await
            .map_err(|e| WorkflowError::from_repo(e, self.kind().label))
    }

    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<EntityRecord>, WorkflowError> {
        self.repo
            .list(filter)
            .await
            .map_err(|e| WorkflowError::from_repo(e, self.kind().label))
    }

    pub async fn timeline(&self, code: &str) -> Result<Vec<HistoryRecord>, WorkflowError> {
        self.history
            .timeline(code)
            .await
            .map_err(|e| WorkflowError::from_repo(e, self.kind().label))
    }

    pub async fn audit_trail(&self, code: &str) -> Result<Vec<AuditRecord>, WorkflowError> {
        self.audit
            .by_entity(self.kind().name, code)
            .await
            .map_err(WorkflowError::from_audit)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub async fn create(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        input: NewEntity,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let action = WorkflowAction::Create;
        let code = input.code.trim().to_string();
        match self.try_create(actor, &code, input).await {
            Ok(done) => Ok(self.finish(actor, ctx, action, done, None).await),
            Err(err) => Err(self.fail(actor, ctx, action, &code, err).await),
        }
    }

    pub async fn edit(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        code: &str,
        name: impl Into<String>,
        fields: BTreeMap<String, String>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let cmd = WorkflowCommand::Edit {
            name: name.into(),
            fields,
        };
        self.transition(actor, ctx, code, cmd).await
    }

    pub async fn submit(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        code: &str,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.transition(actor, ctx, code, WorkflowCommand::Submit).await
    }

    pub async fn approve(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        code: &str,
        comment: Option<String>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.transition(actor, ctx, code, WorkflowCommand::Approve { comment })
            .await
    }

    pub async fn reject(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        code: &str,
        reason: impl Into<String>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let cmd = WorkflowCommand::Reject {
            reason: reason.into(),
        };
        self.transition(actor, ctx, code, cmd).await
    }

    pub async fn delete(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        code: &str,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.transition(actor, ctx, code, WorkflowCommand::Delete).await
    }

    pub async fn close(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        code: &str,
        reason: Option<String>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.transition(actor, ctx, code, WorkflowCommand::Close { reason })
            .await
    }

    pub async fn reactivate(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        code: &str,
        comment: impl Into<String>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let cmd = WorkflowCommand::Reactivate {
            comment: comment.into(),
        };
        self.transition(actor, ctx, code, cmd).await
    }

    /// Apply `cmd` to the entity `code` on behalf of `actor`.
    pub async fn transition(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        code: &str,
        cmd: WorkflowCommand,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let action = cmd.action();
        let comment = cmd.comment();
        match self.try_transition(actor, code, cmd).await {
            Ok(done) => Ok(self.finish(actor, ctx, action, done, comment).await),
            Err(err) => Err(self.fail(actor, ctx, action, code, err).await),
        }
    }

    // -----------------------------------------------------------------------
    // Steps 0-4
    // -----------------------------------------------------------------------

    async fn try_create(
        &self,
        actor: &Actor,
        code: &str,
        input: NewEntity,
    ) -> Result<Applied, WorkflowError> {
        let kind = self.kind();
        kind.validate_code(code).map_err(WorkflowError::Validation)?;
        kind.validate_name(&input.name)
            .map_err(WorkflowError::Validation)?;
        kind.validate_fields(&input.fields)
            .map_err(WorkflowError::Validation)?;

        let perm = kind.action_code(WorkflowAction::Create);
        self.require_permission(actor, WorkflowAction::Create, code, &perm)
            .await?;

        let entity = EntityRecord::draft(
            NewEntity {
                code: code.to_string(),
                ..input
            },
            &actor.user_id,
            now(),
        );
        self.repo
            .insert(&entity)
            .await
            .map_err(|e| WorkflowError::from_repo(e, kind.label))?;

        Ok(Applied {
            changes: diff_entity(None, &entity.name, &entity.fields),
            history_status: entity.status,
            description: format!("{} '{}' created as draft", kind.label, entity.code),
            entity,
        })
    }

    async fn try_transition(
        &self,
        actor: &Actor,
        code: &str,
        cmd: WorkflowCommand,
    ) -> Result<Applied, WorkflowError> {
        let kind = self.kind();
        let action = cmd.action();

        // 0. input
        validate_command(kind, code, &cmd)?;

        // 1. load
        let loaded = self.get(code).await?;

        // 2. guard
        let needed = guard::check(kind, action, &loaded, actor).map_err(|reason| {
            WorkflowError::IllegalTransition { action, reason }
        })?;
        if let Some(perm) = needed {
            self.require_permission(actor, action, code, &perm).await?;
        }

        // 3. diff + intended write
        let at = now();
        let plan = plan_write(kind, &loaded, actor, at, &cmd)?;

        // 4. re-read, then compare-and-set
        let current = self.get(code).await?;
        if current.version != loaded.version || current.status != loaded.status {
            return Err(WorkflowError::Conflict {
                label: kind.label,
                code: code.to_string(),
            });
        }

        let label = kind.label;
        let res = match &plan.write {
            PlannedWrite::Status(w) => self.repo.update_status(code, w).await,
            PlannedWrite::Fields(w) => self.repo.update_fields(code, w).await,
            PlannedWrite::Delete(w) => self.repo.soft_delete(code, w).await,
        };
        res.map_err(|e| WorkflowError::from_repo(e, label))?;

        Ok(Applied {
            entity: plan.after,
            changes: plan.changes,
            history_status: plan.history_status,
            description: plan.description,
        })
    }

    /// Query the permission service once. Failure to answer is a denial.
    async fn require_permission(
        &self,
        actor: &Actor,
        action: WorkflowAction,
        code: &str,
        perm: &str,
    ) -> Result<(), WorkflowError> {
        let granted = match self.permissions.has_permission(actor, perm).await {
            Ok(g) => g,
            Err(e) => {
                tracing::error!(perm, actor = %actor.user_id, error = %format!("{e:#}"), "permission check failed");
                false
            }
        };
        if granted {
            Ok(())
        } else {
            Err(WorkflowError::IllegalTransition {
                action,
                reason: guard::permission_denied(self.kind(), action, code),
            })
        }
    }

    // -----------------------------------------------------------------------
    // Step 5 and failure auditing
    // -----------------------------------------------------------------------

    async fn finish(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        action: WorkflowAction,
        done: Applied,
        comment: Option<String>,
    ) -> TransitionOutcome {
        let kind = self.kind();
        let code = done.entity.code.clone();

        let audit_entry = NewAuditRecord {
            entity_type: kind.name.to_string(),
            entity_id: code.clone(),
            action,
            actor: actor.user_id.clone(),
            actor_name: actor.username.clone(),
            description: done.description.clone(),
            changes: done.changes.clone(),
            outcome: AuditOutcome::Success,
            context: ctx.clone(),
        };
        let mut gap = AuditGap::default();
        let mut to_spool: Vec<(SpoolRecord, String)> = Vec::new();
        let mut unsealed = false;

        if let Err(e) = self.audit.log_action(audit_entry.clone()).await {
            let msg = e.to_string();
            tracing::error!(kind = kind.name, code = %code, action = action.as_str(), error = %msg, "audit write failed after committed mutation");
            match seal(audit_entry) {
                Ok(rec) => to_spool.push((SpoolRecord::Audit(rec), msg.clone())),
                Err(se) => {
                    tracing::error!(error = %se, "could not seal audit record for spool");
                    unsealed = true;
                }
            }
            gap.audit_error = Some(msg);
        }

        let recorded = self
            .history
            .record(
                &code,
                action,
                done.history_status,
                done.changes.clone(),
                comment.clone(),
                &actor.user_id,
            )
            .await;
        if let Err(e) = recorded {
            let msg = e.to_string();
            tracing::error!(kind = kind.name, code = %code, action = action.as_str(), error = %msg, "history write failed after committed mutation");
            let entry = NewHistoryRecord {
                entity_type: kind.name.to_string(),
                entity_id: code.clone(),
                action,
                status: done.history_status,
                changes: done.changes,
                comment,
                performed_by: actor.user_id.clone(),
            };
            to_spool.push((
                SpoolRecord::History(HistoryRecord::from_new(entry, now())),
                msg.clone(),
            ));
            gap.history_error = Some(msg);
        }

        if gap.audit_error.is_none() && gap.history_error.is_none() {
            tracing::info!(
                kind = kind.name,
                code = %code,
                action = action.as_str(),
                actor = %actor.user_id,
                status = done.entity.status.as_str(),
                "transition committed"
            );
            return TransitionOutcome::Committed(done.entity);
        }

        gap.spooled = !unsealed && self.spool_all(to_spool);
        TransitionOutcome::Degraded {
            entity: done.entity,
            gap,
        }
    }

    /// Append every record; true only if all of them made it.
    fn spool_all(&self, records: Vec<(SpoolRecord, String)>) -> bool {
        let Some(spool) = &self.spool else {
            tracing::error!("no reconciliation spool configured; audit gap is unrecorded");
            return false;
        };
        let expected = records.len();
        let mut written = 0usize;
        for (record, reason) in records {
            match spool.append(record, &reason) {
                Ok(_) => written += 1,
                Err(e) => tracing::error!(error = %format!("{e:#}"), path = ?spool.path(), "spool append failed"),
            }
        }
        written == expected
    }

    async fn fail(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        action: WorkflowAction,
        code: &str,
        err: WorkflowError,
    ) -> WorkflowError {
        let kind = self.kind();
        match &err {
            WorkflowError::IllegalTransition { .. } | WorkflowError::Conflict { .. } => {
                tracing::warn!(kind = kind.name, code, action = action.as_str(), actor = %actor.user_id, error = %err, "transition denied");
            }
            WorkflowError::Validation(_) | WorkflowError::NotFound { .. } => {
                tracing::info!(kind = kind.name, code, action = action.as_str(), actor = %actor.user_id, error = %err, "transition rejected");
            }
            WorkflowError::WriteFailed { .. } | WorkflowError::Unavailable(_) => {
                tracing::error!(kind = kind.name, code, action = action.as_str(), actor = %actor.user_id, error = %err, "transition failed");
            }
        }

        let entry = NewAuditRecord {
            entity_type: kind.name.to_string(),
            entity_id: code.to_string(),
            action,
            actor: actor.user_id.clone(),
            actor_name: actor.username.clone(),
            description: err.user_message(),
            changes: Vec::new(),
            outcome: AuditOutcome::Failure,
            context: ctx.clone(),
        };
        if let Err(audit_err) = self.audit.log_action(entry).await {
            tracing::error!(
                kind = kind.name,
                code,
                action = action.as_str(),
                error = %audit_err,
                "failure audit could not be written"
            );
        }
        err
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn validate_command(kind: &EntityKind, code: &str, cmd: &WorkflowCommand) -> Result<(), WorkflowError> {
    let v = |r: Result<(), String>| r.map_err(WorkflowError::Validation);
    v(kind.validate_code(code))?;

    let bounded = |what: &str, text: &str| -> Result<(), WorkflowError> {
        if text.trim().chars().count() > MAX_REASON_LEN {
            return Err(WorkflowError::Validation(format!(
                "{what} must be at most {MAX_REASON_LEN} characters."
            )));
        }
        Ok(())
    };

    match cmd {
        WorkflowCommand::Edit { name, fields } => {
            v(kind.validate_name(name))?;
            v(kind.validate_fields(fields))?;
        }
        WorkflowCommand::Reject { reason } => {
            if reason.trim().is_empty() {
                return Err(WorkflowError::Validation(
                    "A reason is required to reject.".to_string(),
                ));
            }
            bounded("Rejection reason", reason)?;
        }
        WorkflowCommand::Reactivate { comment } => {
            if comment.trim().is_empty() {
                return Err(WorkflowError::Validation(
                    "A comment is required to reactivate.".to_string(),
                ));
            }
            bounded("Reactivation comment", comment)?;
        }
        WorkflowCommand::Close { reason: Some(r) } => bounded("Close reason", r)?,
        WorkflowCommand::Approve { comment: Some(c) } => bounded("Approval comment", c)?,
        _ => {}
    }
    Ok(())
}

enum PlannedWrite {
    Status(StatusWrite),
    Fields(FieldsWrite),
    Delete(DeleteWrite),
}

struct Plan {
    write: PlannedWrite,
    after: EntityRecord,
    changes: Vec<FieldDiff>,
    history_status: EntityStatus,
    description: String,
}

/// Compute the write for an already-guarded command and the record as it
/// will read back afterwards. Post-states come from the guard table.
fn plan_write(
    kind: &EntityKind,
    loaded: &EntityRecord,
    actor: &Actor,
    at: DateTime<Utc>,
    cmd: &WorkflowCommand,
) -> Result<Plan, WorkflowError> {
    let action = cmd.action();
    let next = || {
        guard::target_status(action, loaded.status).ok_or_else(|| {
            WorkflowError::IllegalTransition {
                action,
                reason: format!(
                    "{} '{}' is {}; {} has no defined outcome from there.",
                    kind.label,
                    loaded.code,
                    loaded.status.label(),
                    action
                ),
            }
        })
    };
    let who = actor.user_id.clone();
    let mut after = loaded.clone();
    after.updated_by = who.clone();
    after.updated_at = at;
    after.version = loaded.version + 1;

    let subject = format!("{} '{}'", kind.label, loaded.code);

    let status_plan = |mut after: EntityRecord, status: EntityStatus, description: String| {
        after.status = status;
        after.is_active = status.is_active();
        let write = StatusWrite {
            status,
            is_active: after.is_active,
            approved_by: after.approved_by.clone(),
            approved_at: after.approved_at,
            closed_by: after.closed_by.clone(),
            closed_at: after.closed_at,
            reason: after.reason.clone(),
            actor: who.clone(),
            at,
            expected_version: loaded.version,
        };
        Plan {
            write: PlannedWrite::Status(write),
            history_status: status,
            changes: status_change(loaded.status, status),
            after,
            description,
        }
    };

    match cmd {
        WorkflowCommand::Edit { name, fields } => {
            let status = next()?;
            let name = name.trim().to_string();
            let fields: BTreeMap<String, String> = fields
                .iter()
                .map(|(k, v)| (k.clone(), v.trim().to_string()))
                .filter(|(_, v)| !v.is_empty())
                .collect();
            let changes = diff_entity(Some(loaded), &name, &fields);
            after.name = name.clone();
            after.fields = fields.clone();
            after.status = status;
            after.is_active = status.is_active();
            after.reason = None;
            Ok(Plan {
                write: PlannedWrite::Fields(FieldsWrite {
                    name,
                    fields,
                    status,
                    reason: None,
                    actor: who.clone(),
                    at,
                    expected_version: loaded.version,
                }),
                history_status: status,
                changes,
                after,
                description: format!("{subject} edited"),
            })
        }
        WorkflowCommand::Submit => {
            after.approved_by = None;
            after.approved_at = None;
            after.reason = None;
            Ok(status_plan(
                after,
                next()?,
                format!("{subject} submitted for approval"),
            ))
        }
        WorkflowCommand::Approve { .. } => {
            after.approved_by = Some(who.clone());
            after.approved_at = Some(at);
            after.reason = None;
            Ok(status_plan(after, next()?, format!("{subject} approved")))
        }
        WorkflowCommand::Reject { reason } => {
            let reason = reason.trim().to_string();
            after.approved_by = None;
            after.approved_at = None;
            after.reason = Some(reason.clone());
            Ok(status_plan(
                after,
                next()?,
                format!("{subject} rejected: {reason}"),
            ))
        }
        WorkflowCommand::Close { reason } => {
            after.closed_by = Some(who.clone());
            after.closed_at = Some(at);
            after.reason = clean(reason.as_deref());
            Ok(status_plan(after, next()?, format!("{subject} closed")))
        }
        WorkflowCommand::Reactivate { comment } => {
            after.closed_by = None;
            after.closed_at = None;
            after.reason = clean(Some(comment));
            Ok(status_plan(after, next()?, format!("{subject} reactivated")))
        }
        WorkflowCommand::Delete => {
            after.is_active = false;
            Ok(Plan {
                write: PlannedWrite::Delete(DeleteWrite {
                    actor: who.clone(),
                    at,
                    expected_version: loaded.version,
                }),
                history_status: loaded.status,
                changes: Vec::new(),
                after,
                description: format!("{subject} deleted"),
            })
        }
    }
}

fn status_change(from: EntityStatus, to: EntityStatus) -> Vec<FieldDiff> {
    if from == to {
        return Vec::new();
    }
    vec![FieldDiff {
        field: "status".to_string(),
        before: Some(from.as_str().to_string()),
        after: Some(to.as_str().to_string()),
    }]
}
