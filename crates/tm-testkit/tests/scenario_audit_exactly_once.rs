//! Scenario: audit accounting and store failures.
//!
//! # Invariants under test
//!
//! 1. Every successful call writes exactly one SUCCESS record; every failed
//!    call writes exactly one FAILURE record with a non-empty description.
//! 2. Input validation happens before the entity is loaded: a blank
//!    reactivate comment is a validation error even when the store is down.
//! 3. create -> get round-trips the business fields.
//! 4. A write the store does not confirm leaves the entity untouched and
//!    surfaces `WriteFailed` without backend text in the user message.

use chrono::Duration;
use tm_audit::{AuditFilter, AuditTrail};
use tm_db::ListFilter;
use tm_schemas::{AuditOutcome, EntityStatus, WorkflowAction, ORDER, PORTFOLIO, UDF};
use tm_testkit::{checker, ctx, maker, order, portfolio, udf, Harness};
use tm_workflow::WorkflowError;

#[tokio::test]
async fn one_record_per_call_whatever_the_outcome() -> anyhow::Result<()> {
    let h = Harness::new(&PORTFOLIO);
    let mut expected_success = 0;
    let mut expected_failure = 0;

    h.engine.create(&maker(), &ctx(), portfolio("PF020")).await?;
    expected_success += 1;

    // Approve from Draft, submit by a stranger, reject without reason.
    assert!(h.engine.approve(&checker(), &ctx(), "PF020", None).await.is_err());
    assert!(h.engine.submit(&checker(), &ctx(), "PF020").await.is_err());
    assert!(h.engine.reject(&checker(), &ctx(), "PF020", "").await.is_err());
    expected_failure += 3;

    h.engine.submit(&maker(), &ctx(), "PF020").await?;
    h.engine.approve(&checker(), &ctx(), "PF020", None).await?;
    expected_success += 2;

    assert!(h.engine.delete(&maker(), &ctx(), "PF020").await.is_err());
    expected_failure += 1;

    assert_eq!(h.audit.count("PF020", AuditOutcome::Success), expected_success);
    assert_eq!(h.audit.count("PF020", AuditOutcome::Failure), expected_failure);
    for rec in h.audit.records() {
        assert!(!rec.description.trim().is_empty(), "{rec:?}");
        assert!(tm_audit::verify_record_hash(&rec));
        assert_eq!(rec.entity_type, "portfolio");
        assert_eq!(rec.context.client_addr.as_deref(), Some("10.0.0.5"));
    }
    Ok(())
}

#[tokio::test]
async fn success_records_carry_the_field_diff() -> anyhow::Result<()> {
    let h = Harness::new(&PORTFOLIO);
    h.engine.create(&maker(), &ctx(), portfolio("PF021")).await?;
    h.engine.submit(&maker(), &ctx(), "PF021").await?;

    let trail = h.engine.audit_trail("PF021").await?;
    let create = trail
        .iter()
        .find(|r| r.action == WorkflowAction::Create)
        .expect("create audited");
    assert!(create
        .changes
        .iter()
        .any(|d| d.field == "base_currency" && d.before.is_none() && d.after.as_deref() == Some("USD")));

    let submit = trail
        .iter()
        .find(|r| r.action == WorkflowAction::Submit)
        .expect("submit audited");
    assert_eq!(submit.changes.len(), 1);
    assert_eq!(submit.changes[0].field, "status");
    assert_eq!(submit.changes[0].before.as_deref(), Some("DRAFT"));
    assert_eq!(submit.changes[0].after.as_deref(), Some("PENDING_APPROVAL"));
    Ok(())
}

#[tokio::test]
async fn blank_reactivate_comment_rejected_before_load() -> anyhow::Result<()> {
    let h = Harness::new(&PORTFOLIO);
    h.repo.set_unavailable(true);

    let err = h
        .engine
        .reactivate(&checker(), &ctx(), "PF022", "  ")
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)), "{err:?}");
    assert_eq!(h.audit.count("PF022", AuditOutcome::Failure), 1);

    // With a comment, the same call reaches the store and reports it.
    let err = h
        .engine
        .reactivate(&checker(), &ctx(), "PF022", "back")
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Unavailable(_)), "{err:?}");
    assert!(err.is_retryable());
    Ok(())
}

#[tokio::test]
async fn create_then_read_round_trips_every_kind() -> anyhow::Result<()> {
    for (kind, input) in [
        (&PORTFOLIO, portfolio("PF023")),
        (&ORDER, order("ORD-23")),
        (&UDF, udf("UDF_23")),
    ] {
        let h = Harness::new(kind);
        let code = input.code.clone();
        h.engine.create(&maker(), &ctx(), input.clone()).await?;

        let stored = h.engine.get(&code).await?;
        assert_eq!(stored.code, code);
        assert_eq!(stored.name, input.name);
        assert_eq!(stored.fields, input.fields, "{kind}");
        assert_eq!(stored.status, EntityStatus::Draft);
        assert_eq!(stored.created_by, "u-maker");
    }
    Ok(())
}

#[tokio::test]
async fn invalid_input_and_duplicates_are_validation_errors() -> anyhow::Result<()> {
    let h = Harness::new(&ORDER);

    let bad_side = order("ORD-24").field("side", "HOLD");
    let err = h.engine.create(&maker(), &ctx(), bad_side).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(ref m) if m.contains("side")), "{err:?}");

    let bad_code = order("ORD 24");
    assert!(matches!(
        h.engine.create(&maker(), &ctx(), bad_code).await,
        Err(WorkflowError::Validation(_))
    ));

    h.engine.create(&maker(), &ctx(), order("ORD-24")).await?;
    let err = h
        .engine
        .create(&maker(), &ctx(), order("ORD-24"))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(ref m) if m.contains("already exists")), "{err:?}");
    assert_eq!(h.repo.write_count(), 1);
    Ok(())
}

#[tokio::test]
async fn unconfirmed_write_leaves_entity_untouched() -> anyhow::Result<()> {
    let h = Harness::new(&PORTFOLIO);
    h.engine.create(&maker(), &ctx(), portfolio("PF025")).await?;
    let before = h.engine.get("PF025").await?;

    h.repo.fail_entity_writes(true);
    let err = h
        .engine
        .submit(&maker(), &ctx(), "PF025")
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::WriteFailed { .. }), "{err:?}");
    assert!(!err.is_retryable());
    assert!(!err.user_message().contains("injected"));
    h.repo.fail_entity_writes(false);

    assert_eq!(h.engine.get("PF025").await?, before);
    assert_eq!(h.audit.count("PF025", AuditOutcome::Success), 1);
    assert_eq!(h.audit.count("PF025", AuditOutcome::Failure), 1);
    assert_eq!(h.engine.timeline("PF025").await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn list_filters_and_audit_queries() -> anyhow::Result<()> {
    let h = Harness::new(&PORTFOLIO);
    h.engine
        .create(&maker(), &ctx(), portfolio("PF030").field("base_currency", "EUR"))
        .await?;
    h.engine.create(&maker(), &ctx(), portfolio("PF031")).await?;
    h.active("PF032").await?;

    let eur = h
        .engine
        .list(&ListFilter::new().dimension("base_currency", "EUR"))
        .await?;
    assert_eq!(eur.iter().map(|e| e.code.as_str()).collect::<Vec<_>>(), ["PF030"]);

    let active = h.engine.list(&ListFilter::new().status(EntityStatus::Active)).await?;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].code, "PF032");

    let searched = h.engine.list(&ListFilter::new().search("pf03").limit(2)).await?;
    assert_eq!(searched.len(), 2);

    let err = h
        .engine
        .list(&ListFilter::new().dimension("name; drop table portfolios", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)), "{err:?}");

    assert!(h.engine.approve(&maker(), &ctx(), "PF031", None).await.is_err());

    let stats = h.audit.statistics(Duration::hours(1)).await?;
    assert_eq!(stats.total, 6);
    assert_eq!(stats.successes, 5);
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.by_action.get("create"), Some(&3));
    assert_eq!(stats.by_actor.get("u-checker"), Some(&1));

    let failures = h
        .audit
        .search(&AuditFilter {
            outcome: Some(AuditOutcome::Failure),
            ..AuditFilter::default()
        })
        .await?;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].entity_id, "PF031");
    Ok(())
}
