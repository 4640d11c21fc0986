//! Four-eyes maker-checker workflow over portfolios, orders and UDFs.

mod engine;
mod error;
pub mod guard;
mod permissions;

pub use engine::{AuditGap, TransitionOutcome, WorkflowCommand, WorkflowEngine};
pub use error::WorkflowError;
pub use permissions::{PermissionService, RolePermissions};
