//! Maker-checker guard table.
//!
//! ```text
//!   create ──► Draft ──submit──► PendingApproval ──approve──► Active
//!               ▲  │                    │                     │   ▲
//!          edit │  │ delete          reject                close  reactivate
//!               │  ▼ (soft)             ▼                     ▼   │
//!             Rejected ◄────────────────┘                   Inactive
//!   (edit on Rejected returns to Draft)
//! ```
//!
//! Identity rules compare `Actor::user_id` against the persisted record:
//! approve/reject need an actor other than `created_by`; reactivate needs an
//! actor other than `closed_by`; edit/submit/delete are creator-only.

use tm_schemas::{Actor, EntityKind, EntityRecord, EntityStatus, WorkflowAction};

/// Status the entity lands in after `action` succeeds from `from`.
/// `None` for create and delete (no post-state on an existing row).
pub fn target_status(action: WorkflowAction, from: EntityStatus) -> Option<EntityStatus> {
    use EntityStatus::*;
    use WorkflowAction as A;
    match (action, from) {
        (A::Edit, Draft | Rejected) => Some(Draft),
        (A::Submit, Draft) => Some(PendingApproval),
        (A::Approve, PendingApproval) => Some(Active),
        (A::Reject, PendingApproval) => Some(Rejected),
        (A::Close, Active) => Some(Inactive),
        (A::Reactivate, Inactive) => Some(Active),
        _ => None,
    }
}

/// Statuses from which `action` is allowed.
pub fn allowed_from(action: WorkflowAction) -> &'static [EntityStatus] {
    use EntityStatus::*;
    match action {
        WorkflowAction::Create => &[],
        WorkflowAction::Edit => &[Draft, Rejected],
        WorkflowAction::Submit | WorkflowAction::Delete => &[Draft],
        WorkflowAction::Approve | WorkflowAction::Reject => &[PendingApproval],
        WorkflowAction::Close => &[Active],
        WorkflowAction::Reactivate => &[Inactive],
    }
}

/// The permission an action requires, if any. Reject is gated by the
/// approve permission.
pub fn required_permission(action: WorkflowAction) -> Option<WorkflowAction> {
    match action {
        WorkflowAction::Create => Some(WorkflowAction::Create),
        WorkflowAction::Approve | WorkflowAction::Reject => Some(WorkflowAction::Approve),
        WorkflowAction::Close => Some(WorkflowAction::Close),
        WorkflowAction::Reactivate => Some(WorkflowAction::Reactivate),
        WorkflowAction::Edit | WorkflowAction::Submit | WorkflowAction::Delete => None,
    }
}

/// Status and identity rows of the guard table for an existing entity.
///
/// `Ok(Some(code))` means the caller must still confirm the actor holds
/// permission `code`; `Ok(None)` means the action is allowed outright.
/// `Err` carries the human-readable denial reason.
pub fn check(
    kind: &EntityKind,
    action: WorkflowAction,
    entity: &EntityRecord,
    actor: &Actor,
) -> Result<Option<String>, String> {
    let allowed = allowed_from(action);
    if !allowed.contains(&entity.status) {
        let wanted = allowed
            .iter()
            .map(|s| s.label())
            .collect::<Vec<_>>()
            .join(" or ");
        return Err(format!(
            "{} '{}' is {}; {} is only possible when it is {}.",
            kind.label,
            entity.code,
            entity.status.label(),
            action,
            wanted
        ));
    }

    let is_creator = entity.created_by == actor.user_id;
    match action {
        WorkflowAction::Edit | WorkflowAction::Submit | WorkflowAction::Delete if !is_creator => {
            return Err(format!(
                "Only the creator of {} '{}' may {} it.",
                kind.label, entity.code, action
            ));
        }
        WorkflowAction::Approve | WorkflowAction::Reject if is_creator => {
            return Err(format!(
                "{} '{}' was created by you; another user must {} it.",
                kind.label, entity.code, action
            ));
        }
        WorkflowAction::Reactivate
            if entity.closed_by.as_deref() == Some(actor.user_id.as_str()) =>
        {
            return Err(format!(
                "{} '{}' was closed by you; another user must reactivate it.",
                kind.label, entity.code
            ));
        }
        _ => {}
    }

    Ok(required_permission(action).map(|p| kind.action_code(p)))
}

pub fn permission_denied(kind: &EntityKind, action: WorkflowAction, code: &str) -> String {
    format!(
        "You do not have permission to {} {} '{}'.",
        action,
        kind.label.to_lowercase(),
        code
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tm_schemas::{NewEntity, PORTFOLIO};

    fn entity(status: EntityStatus) -> EntityRecord {
        let mut e = EntityRecord::draft(
            NewEntity::new("PF001", "Growth")
                .field("base_currency", "USD")
                .field("manager", "m"),
            "maker",
            Utc::now(),
        );
        e.status = status;
        e
    }

    fn actor(id: &str) -> Actor {
        Actor::new(id, id)
    }

    #[test]
    fn every_action_outside_its_statuses_is_denied() {
        for action in WorkflowAction::ALL {
            if action == WorkflowAction::Create {
                continue;
            }
            for status in EntityStatus::ALL {
                let e = entity(status);
                let who = match action {
                    WorkflowAction::Approve | WorkflowAction::Reject => actor("checker"),
                    _ => actor("maker"),
                };
                let res = check(&PORTFOLIO, action, &e, &who);
                assert_eq!(
                    res.is_ok(),
                    allowed_from(action).contains(&status),
                    "{action} from {status}"
                );
                if res.is_ok() {
                    assert!(target_status(action, status).is_some() || action == WorkflowAction::Delete);
                }
            }
        }
    }

    #[test]
    fn self_approval_and_self_reject_denied() {
        let e = entity(EntityStatus::PendingApproval);
        for action in [WorkflowAction::Approve, WorkflowAction::Reject] {
            let err = check(&PORTFOLIO, action, &e, &actor("maker")).unwrap_err();
            assert!(err.contains("another user"), "{err}");
        }
        assert_eq!(
            check(&PORTFOLIO, WorkflowAction::Approve, &e, &actor("checker")),
            Ok(Some("portfolio.approve".to_string()))
        );
        assert_eq!(
            check(&PORTFOLIO, WorkflowAction::Reject, &e, &actor("checker")),
            Ok(Some("portfolio.approve".to_string())),
            "reject is gated by the approve permission"
        );
    }

    #[test]
    fn closer_cannot_reactivate() {
        let mut e = entity(EntityStatus::Inactive);
        e.closed_by = Some("closer".into());
        assert!(check(&PORTFOLIO, WorkflowAction::Reactivate, &e, &actor("closer")).is_err());
        assert_eq!(
            check(&PORTFOLIO, WorkflowAction::Reactivate, &e, &actor("other")),
            Ok(Some("portfolio.reactivate".to_string()))
        );
    }

    #[test]
    fn only_creator_edits_submits_deletes() {
        let e = entity(EntityStatus::Draft);
        for action in [WorkflowAction::Edit, WorkflowAction::Submit, WorkflowAction::Delete] {
            assert!(check(&PORTFOLIO, action, &e, &actor("intruder")).is_err());
            assert_eq!(check(&PORTFOLIO, action, &e, &actor("maker")), Ok(None));
        }
    }

    #[test]
    fn rejected_edit_returns_to_draft() {
        assert_eq!(
            target_status(WorkflowAction::Edit, EntityStatus::Rejected),
            Some(EntityStatus::Draft)
        );
        assert_eq!(target_status(WorkflowAction::Submit, EntityStatus::Rejected), None);
    }
}
