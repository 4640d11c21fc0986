//! Scenario: audit/history write fails after the entity mutation committed.
//!
//! # Invariants under test
//!
//! 1. The call returns `Degraded`, not an error; the entity is mutated.
//! 2. The missing record is appended to the reconciliation spool, whose hash
//!    chain verifies.
//! 3. Replaying the spool writes the record back exactly once; a second
//!    replay finds it already present.
//! 4. Without a spool the gap is still reported, with `spooled == false`.

use std::sync::Arc;
use tm_audit::{read_entries, replay, verify_hash_chain, SpoolRecord, VerifyResult};
use tm_db::EntityRepository;
use tm_schemas::{AuditOutcome, EntityStatus, WorkflowAction, PORTFOLIO};
use tm_testkit::{checker, ctx, Harness};
use tm_workflow::TransitionOutcome;

#[tokio::test]
async fn audit_failure_after_approve_is_spooled_and_replayed() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let spool_path = dir.path().join("reconcile").join("audit_gap.jsonl");
    let h = Harness::new(&PORTFOLIO).with_spool(&spool_path)?;
    h.pending("PF200").await?;

    h.audit.set_failing(true);
    let out = h.engine.approve(&checker(), &ctx(), "PF200", None).await?;
    h.audit.set_failing(false);

    let TransitionOutcome::Degraded { entity, gap } = &out else {
        panic!("expected degraded outcome, got {out:?}");
    };
    assert_eq!(entity.status, EntityStatus::Active);
    assert!(gap.audit_error.is_some());
    assert!(gap.history_error.is_none());
    assert!(gap.spooled);

    // Committed regardless.
    let stored = h.engine.get("PF200").await?;
    assert_eq!(stored.status, EntityStatus::Active);
    assert_eq!(stored.approved_by.as_deref(), Some("u-checker"));
    assert_eq!(h.audit.count("PF200", AuditOutcome::Success), 2);

    assert_eq!(verify_hash_chain(&spool_path)?, VerifyResult::Valid { lines: 1 });
    let entries = read_entries(&spool_path)?;
    assert_eq!(entries.len(), 1);
    let SpoolRecord::Audit(rec) = &entries[0].payload else {
        panic!("expected audit payload, got {:?}", entries[0].payload);
    };
    assert_eq!(rec.action, WorkflowAction::Approve);
    assert_eq!(rec.outcome, AuditOutcome::Success);
    assert_eq!(rec.actor, "u-checker");
    assert!(tm_audit::verify_record_hash(rec));

    let repo: Arc<dyn EntityRepository> = h.repo.clone();
    let repos = [repo];
    let report = replay(&entries, h.audit.as_ref(), &repos).await;
    assert_eq!(report.restored, 1);
    assert!(report.is_complete());
    assert_eq!(h.audit.count("PF200", AuditOutcome::Success), 3);

    let again = replay(&entries, h.audit.as_ref(), &repos).await;
    assert_eq!(again.restored, 0);
    assert_eq!(again.already_present, 1);
    assert_eq!(h.audit.count("PF200", AuditOutcome::Success), 3);
    Ok(())
}

#[tokio::test]
async fn history_failure_after_close_is_spooled_and_replayed() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let spool_path = dir.path().join("gap.jsonl");
    let h = Harness::new(&PORTFOLIO).with_spool(&spool_path)?;
    h.active("PF201").await?;

    h.repo.fail_history(true);
    let out = h
        .engine
        .close(&checker(), &ctx(), "PF201", Some("mandate ended".into()))
        .await?;
    h.repo.fail_history(false);

    let TransitionOutcome::Degraded { gap, .. } = &out else {
        panic!("expected degraded outcome, got {out:?}");
    };
    assert!(gap.audit_error.is_none());
    assert!(gap.history_error.is_some());
    assert!(gap.spooled);
    assert_eq!(out.entity().status, EntityStatus::Inactive);
    assert_eq!(h.audit.count("PF201", AuditOutcome::Success), 4);
    assert_eq!(h.engine.timeline("PF201").await?.len(), 3);

    let entries = read_entries(&spool_path)?;
    let repo: Arc<dyn EntityRepository> = h.repo.clone();
    let report = replay(&entries, h.audit.as_ref(), &[repo]).await;
    assert_eq!(report.restored, 1);

    let timeline = h.engine.timeline("PF201").await?;
    let last = timeline.last().expect("history present");
    assert_eq!(last.action, WorkflowAction::Close);
    assert_eq!(last.status, EntityStatus::Inactive);
    assert_eq!(last.comment.as_deref(), Some("mandate ended"));
    Ok(())
}

#[tokio::test]
async fn both_records_missing_land_in_one_chain() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let spool_path = dir.path().join("gap.jsonl");
    let h = Harness::new(&PORTFOLIO).with_spool(&spool_path)?;
    h.pending("PF202").await?;

    h.audit.set_failing(true);
    h.repo.fail_history(true);
    let out = h
        .engine
        .reject(&checker(), &ctx(), "PF202", "wrong currency")
        .await?;
    assert!(out.is_degraded());
    assert_eq!(out.entity().status, EntityStatus::Rejected);

    assert_eq!(verify_hash_chain(&spool_path)?, VerifyResult::Valid { lines: 2 });
    let kinds: Vec<_> = read_entries(&spool_path)?
        .into_iter()
        .map(|e| matches!(e.payload, SpoolRecord::Audit(_)))
        .collect();
    assert_eq!(kinds, vec![true, false]);
    Ok(())
}

#[tokio::test]
async fn gap_without_spool_is_reported_unspooled() -> anyhow::Result<()> {
    let h = Harness::new(&PORTFOLIO);
    h.pending("PF203").await?;

    h.audit.set_failing(true);
    let out = h.engine.approve(&checker(), &ctx(), "PF203", None).await?;
    match out {
        TransitionOutcome::Degraded { entity, gap } => {
            assert_eq!(entity.status, EntityStatus::Active);
            assert!(!gap.spooled);
        }
        other => panic!("expected degraded outcome, got {other:?}"),
    }
    assert_eq!(h.engine.get("PF203").await?.status, EntityStatus::Active);
    Ok(())
}
