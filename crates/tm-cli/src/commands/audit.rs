use anyhow::{Context, Result};
use tm_audit::{AuditFilter, AuditTrail};
use tm_schemas::{AuditOutcome, WorkflowAction};

use super::{parse_kind, Session};
use crate::AuditCmd;

pub async fn run(session: &Session, cmd: AuditCmd) -> Result<()> {
    match cmd {
        AuditCmd::Show { kind, code } => {
            let kind = parse_kind(&kind)?;
            for rec in session.workflow(kind).audit_trail(&code).await? {
                println!("{}", serde_json::to_string(&rec)?);
            }
        }

        AuditCmd::Stats { hours } => {
            if hours <= 0 {
                anyhow::bail!("--hours must be > 0");
            }
            let stats = session
                .audit()
                .statistics(chrono::Duration::hours(hours))
                .await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        AuditCmd::Search {
            kind,
            code,
            actor,
            action,
            outcome,
            limit,
        } => {
            let entity_type = kind.map(|k| parse_kind(&k).map(|k| k.name.to_string())).transpose()?;
            let action = action
                .map(|a| {
                    WorkflowAction::parse(&a).with_context(|| format!("invalid --action '{a}'"))
                })
                .transpose()?;
            let outcome = outcome
                .map(|o| {
                    AuditOutcome::parse(&o)
                        .with_context(|| format!("invalid --outcome '{o}'"))
                })
                .transpose()?;

            let filter = AuditFilter {
                entity_type,
                entity_id: code,
                actor,
                action,
                outcome,
                limit,
                ..AuditFilter::default()
            };
            let rows = session.audit().search(&filter).await?;
            for rec in &rows {
                println!("{}", serde_json::to_string(rec)?);
            }
            println!("count={}", rows.len());
        }
    }
    Ok(())
}
