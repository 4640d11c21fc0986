//! Shared domain types for the trade-management core.
//!
//! Everything here is plain data: no I/O, no async. The repository, audit and
//! workflow crates all speak in these types so that a record read from the
//! query engine is the same value the engine guards against.

pub mod entity;
pub mod records;

pub use entity::{
    kind_by_name, EntityKind, EntityRecord, EntityStatus, FieldFormat, FieldSpec, NewEntity,
    ALL_KINDS, ORDER, PORTFOLIO, UDF,
};
pub use records::{
    AuditOutcome, AuditRecord, FieldDiff, HistoryRecord, NewAuditRecord, NewHistoryRecord,
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The identity performing an operation, as supplied by the external
/// identity provider. Four-eyes checks compare `user_id` only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: String,
    pub username: String,
    pub email: Option<String>,
    pub roles: Vec<String>,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            email: None,
            roles: Vec::new(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Per-request metadata carried into every audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub client_addr: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            client_addr: None,
            user_agent: None,
        }
    }

    pub fn with_client_addr(mut self, addr: impl Into<String>) -> Self {
        self.client_addr = Some(addr.into());
        self
    }

    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Every action the workflow engine accepts. `as_str` is both the audit
/// `action` column value and the suffix of the permission code
/// (`<kind>.<action>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowAction {
    Create,
    Edit,
    Submit,
    Approve,
    Reject,
    Delete,
    Close,
    Reactivate,
}

impl WorkflowAction {
    pub const ALL: [WorkflowAction; 8] = [
        WorkflowAction::Create,
        WorkflowAction::Edit,
        WorkflowAction::Submit,
        WorkflowAction::Approve,
        WorkflowAction::Reject,
        WorkflowAction::Delete,
        WorkflowAction::Close,
        WorkflowAction::Reactivate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowAction::Create => "create",
            WorkflowAction::Edit => "edit",
            WorkflowAction::Submit => "submit",
            WorkflowAction::Approve => "approve",
            WorkflowAction::Reject => "reject",
            WorkflowAction::Delete => "delete",
            WorkflowAction::Close => "close",
            WorkflowAction::Reactivate => "reactivate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

impl std::fmt::Display for WorkflowAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
