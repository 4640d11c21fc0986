use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EntityStatus, RequestContext, WorkflowAction};

/// Before/after value of one business field. `None` means absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "SUCCESS",
            AuditOutcome::Failure => "FAILURE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => Some(AuditOutcome::Success),
            "FAILURE" => Some(AuditOutcome::Failure),
            _ => None,
        }
    }
}

/// Audit entry as handed to the writer. The writer assigns id, timestamp
/// and hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditRecord {
    pub entity_type: String,
    pub entity_id: String,
    pub action: WorkflowAction,
    pub actor: String,
    pub actor_name: String,
    pub description: String,
    pub changes: Vec<FieldDiff>,
    pub outcome: AuditOutcome,
    pub context: RequestContext,
}

/// Immutable audit entry for one transition attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub action: WorkflowAction,
    pub actor: String,
    pub actor_name: String,
    pub description: String,
    pub changes: Vec<FieldDiff>,
    pub outcome: AuditOutcome,
    pub context: RequestContext,
    pub created_at: DateTime<Utc>,
    /// SHA-256 of the canonical JSON of this record with `record_hash` empty.
    pub record_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewHistoryRecord {
    pub entity_type: String,
    pub entity_id: String,
    pub action: WorkflowAction,
    pub status: EntityStatus,
    pub changes: Vec<FieldDiff>,
    pub comment: Option<String>,
    pub performed_by: String,
}

/// One entry of an entity's change history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub history_id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub action: WorkflowAction,
    pub status: EntityStatus,
    pub changes: Vec<FieldDiff>,
    pub comment: Option<String>,
    pub performed_by: String,
    pub created_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn from_new(entry: NewHistoryRecord, created_at: DateTime<Utc>) -> Self {
        Self {
            history_id: Uuid::new_v4(),
            entity_type: entry.entity_type,
            entity_id: entry.entity_id,
            action: entry.action,
            status: entry.status,
            changes: entry.changes,
            comment: entry.comment,
            performed_by: entry.performed_by,
            created_at,
        }
    }
}
