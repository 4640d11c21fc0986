use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tm_audit::{read_entries, verify_hash_chain, VerifyResult};
use tm_config::PlatformConfig;
use tm_db::EntityRepository;

use super::Session;

pub fn resolve_path(explicit: Option<String>, cfg: &PlatformConfig) -> Result<PathBuf> {
    explicit
        .or_else(|| cfg.audit.spool_path.clone())
        .map(PathBuf::from)
        .context("no spool path: pass --path or set audit.spool_path")
}

fn require_valid(path: &Path) -> Result<usize> {
    match verify_hash_chain(path)? {
        VerifyResult::Valid { lines } => Ok(lines),
        VerifyResult::Broken { line, reason } => {
            anyhow::bail!("spool chain broken at line {line}: {reason}")
        }
    }
}

pub fn verify(path: &Path) -> Result<()> {
    let lines = require_valid(path)?;
    println!("spool_valid=true lines={lines} path={}", path.display());
    Ok(())
}

pub async fn replay(session: &Session, path: &Path) -> Result<()> {
    require_valid(path)?;
    let entries = read_entries(path)?;

    let repos: Vec<Arc<dyn EntityRepository>> = tm_schemas::ALL_KINDS
        .iter()
        .map(|k| session.repository(*k))
        .collect();
    let audit = session.audit();

    let report = tm_audit::replay(&entries, audit.as_ref(), &repos).await;
    tracing::info!(
        restored = report.restored,
        already_present = report.already_present,
        failed = report.failed.len(),
        path = %path.display(),
        "spool replay finished"
    );
    println!(
        "restored={} already_present={} failed={}",
        report.restored,
        report.already_present,
        report.failed.len()
    );
    for (entry_id, err) in &report.failed {
        println!("failed_entry={entry_id} error={err}");
    }
    if !report.is_complete() {
        anyhow::bail!("{} spool entries could not be replayed", report.failed.len());
    }
    Ok(())
}
