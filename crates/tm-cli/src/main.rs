use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{audit, entity, spool, Session};

#[derive(Parser)]
#[command(name = "tm")]
#[command(about = "Trade management operator CLI", long_about = None)]
struct Cli {
    /// Layered config paths in merge order (base -> env -> site). Defaults
    /// apply when none are given.
    #[arg(long = "config", global = true)]
    config_paths: Vec<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order
        #[arg(required = true)]
        paths: Vec<String>,

        /// Fail instead of warn when the merged config has keys nothing reads.
        #[arg(long, default_value_t = false)]
        strict: bool,
    },

    /// Read-only entity inspection
    Entity {
        #[command(subcommand)]
        cmd: EntityCmd,
    },

    /// Audit trail queries
    Audit {
        #[command(subcommand)]
        cmd: AuditCmd,
    },

    /// Reconciliation spool utilities
    Spool {
        #[command(subcommand)]
        cmd: SpoolCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    /// Connectivity and schema presence
    Status,
    /// Apply embedded migrations (idempotent)
    Migrate,
}

#[derive(Subcommand)]
pub enum EntityCmd {
    /// List entities of one kind, ordered by code
    List {
        /// portfolio | order | udf
        #[arg(long)]
        kind: String,
        /// DRAFT | PENDING_APPROVAL | ACTIVE | REJECTED | INACTIVE
        #[arg(long)]
        status: Option<String>,
        /// Case-insensitive substring of code or name
        #[arg(long)]
        search: Option<String>,
        /// Exact match on a dimension column, `name=value`. Repeatable.
        #[arg(long = "dim")]
        dims: Vec<String>,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Print one entity as JSON
    Show {
        #[arg(long)]
        kind: String,
        #[arg(long)]
        code: String,
    },
    /// Print the entity's history timeline, oldest first
    History {
        #[arg(long)]
        kind: String,
        #[arg(long)]
        code: String,
    },
}

#[derive(Subcommand)]
pub enum AuditCmd {
    /// Every audit record for one entity, oldest first
    Show {
        #[arg(long)]
        kind: String,
        #[arg(long)]
        code: String,
    },
    /// Totals over a trailing window
    Stats {
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    /// Filtered search, newest first
    Search {
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        actor: Option<String>,
        /// create | edit | submit | approve | reject | delete | close | reactivate
        #[arg(long)]
        action: Option<String>,
        /// SUCCESS | FAILURE
        #[arg(long)]
        outcome: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
    },
}

#[derive(Subcommand)]
pub enum SpoolCmd {
    /// Check the spool's hash chain
    Verify {
        /// Spool file; defaults to audit.spool_path from config
        #[arg(long)]
        path: Option<String>,
    },
    /// Write spooled records back to the database. Refuses a broken chain.
    Replay {
        #[arg(long)]
        path: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::ConfigHash { paths, strict } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = tm_config::load_layered_yaml(&path_refs)?;
            let policy = if strict {
                tm_config::UnusedKeyPolicy::Fail
            } else {
                tm_config::UnusedKeyPolicy::Warn
            };
            let report = tm_config::report_unused_keys(&loaded.config_json, policy)?;
            for key in &report.unused_leaf_pointers {
                tracing::warn!(key = %key, "config key is not read by anything");
            }
            loaded.platform()?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Spool {
            cmd: SpoolCmd::Verify { path },
        } => {
            let cfg = commands::load_config(&cli.config_paths)?;
            spool::verify(&spool::resolve_path(path, &cfg)?)?;
        }

        Commands::Db { cmd } => {
            let session = Session::open(&cli.config_paths).await?;
            match cmd {
                DbCmd::Status => {
                    let s = tm_db::status(session.engine.as_ref()).await?;
                    println!("db_ok={} has_schema={}", s.ok, s.has_schema);
                }
                DbCmd::Migrate => {
                    tm_db::migrate(&session.engine).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::Entity { cmd } => {
            let session = Session::open(&cli.config_paths).await?;
            entity::run(&session, cmd).await?;
        }

        Commands::Audit { cmd } => {
            let session = Session::open(&cli.config_paths).await?;
            audit::run(&session, cmd).await?;
        }

        Commands::Spool {
            cmd: SpoolCmd::Replay { path },
        } => {
            let session = Session::open(&cli.config_paths).await?;
            let path = spool::resolve_path(path, &session.config)?;
            spool::replay(&session, &path).await?;
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
