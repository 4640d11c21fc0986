//! Command handler modules for tm-cli.
//!
//! Shared session setup lives here; command-specific logic lives in the
//! submodules.

pub mod audit;
pub mod entity;
pub mod spool;

use anyhow::{Context, Result};
use std::sync::Arc;
use tm_audit::AuditLogWriter;
use tm_config::PlatformConfig;
use tm_db::{EntityRepository, ListLimits, PgQueryEngine, SqlEntityRepository};
use tm_schemas::EntityKind;
use tm_workflow::{RolePermissions, WorkflowEngine};

/// Merged platform config, or defaults when no paths are given.
pub fn load_config(paths: &[String]) -> Result<PlatformConfig> {
    if paths.is_empty() {
        return Ok(PlatformConfig::default());
    }
    let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    let loaded = tm_config::load_layered_yaml(&path_refs)?;
    tracing::debug!(config_hash = %loaded.config_hash, "config loaded");
    loaded.platform()
}

pub fn parse_kind(name: &str) -> Result<&'static EntityKind> {
    tm_schemas::kind_by_name(name).with_context(|| {
        let known: Vec<&str> = tm_schemas::ALL_KINDS.iter().map(|k| k.name).collect();
        format!("unknown --kind '{}'. expected one of: {}", name, known.join(" | "))
    })
}

/// Config plus a connected engine.
pub struct Session {
    pub config: PlatformConfig,
    pub engine: Arc<PgQueryEngine>,
}

impl Session {
    pub async fn open(config_paths: &[String]) -> Result<Self> {
        let config = load_config(config_paths)?;
        let db = &config.database;
        let url = db.resolve_url()?;
        let settings = tm_db::pool_settings(
            db.max_connections,
            db.min_connections,
            db.idle_ttl_secs,
            db.acquire_timeout_secs,
        );
        let engine = PgQueryEngine::connect(url.expose(), &settings)
            .await
            .with_context(|| format!("connect using {}", db.url_env))?;
        Ok(Self {
            config,
            engine: Arc::new(engine),
        })
    }

    pub fn repository(&self, kind: &'static EntityKind) -> Arc<dyn EntityRepository> {
        let limits = ListLimits {
            default_limit: self.config.query.default_limit,
            max_limit: self.config.query.max_limit,
        };
        Arc::new(SqlEntityRepository::new(self.engine.clone(), kind).with_limits(limits))
    }

    pub fn audit(&self) -> Arc<AuditLogWriter<PgQueryEngine>> {
        Arc::new(AuditLogWriter::new(self.engine.clone()))
    }

    /// Engine over the SQL stores. The CLI only calls its read side.
    pub fn workflow(&self, kind: &'static EntityKind) -> WorkflowEngine {
        WorkflowEngine::new(
            self.repository(kind),
            self.audit(),
            Arc::new(RolePermissions::new(self.config.permissions.clone())),
        )
    }
}
