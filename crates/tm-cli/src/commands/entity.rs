use anyhow::{Context, Result};
use tm_db::ListFilter;
use tm_schemas::EntityStatus;

use super::{parse_kind, Session};
use crate::EntityCmd;

pub async fn run(session: &Session, cmd: EntityCmd) -> Result<()> {
    match cmd {
        EntityCmd::List {
            kind,
            status,
            search,
            dims,
            limit,
        } => {
            let kind = parse_kind(&kind)?;
            let mut filter = ListFilter::new();
            if let Some(s) = status {
                let parsed = EntityStatus::parse(&s)
                    .with_context(|| format!("invalid --status '{s}'"))?;
                filter = filter.status(parsed);
            }
            if let Some(s) = search {
                filter = filter.search(s);
            }
            for d in &dims {
                let (name, value) = d
                    .split_once('=')
                    .with_context(|| format!("--dim must be name=value, got '{d}'"))?;
                filter = filter.dimension(name.trim(), value.trim());
            }
            if let Some(n) = limit {
                filter = filter.limit(n);
            }

            let rows = session.workflow(kind).list(&filter).await?;
            for e in &rows {
                println!(
                    "code={} status={} version={} name={}",
                    e.code,
                    e.status.as_str(),
                    e.version,
                    e.name
                );
            }
            println!("count={}", rows.len());
        }

        EntityCmd::Show { kind, code } => {
            let kind = parse_kind(&kind)?;
            let e = session.workflow(kind).get(&code).await?;
            println!("{}", serde_json::to_string_pretty(&e)?);
        }

        EntityCmd::History { kind, code } => {
            let kind = parse_kind(&kind)?;
            for h in session.workflow(kind).timeline(&code).await? {
                println!("{}", serde_json::to_string(&h)?);
            }
        }
    }
    Ok(())
}
