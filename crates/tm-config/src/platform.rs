//! Typed view over the merged configuration document.
//!
//! Only env var NAMES live in config. The database URL is resolved from the
//! environment once at startup through [`DatabaseSettings::resolve_url`];
//! the resolved value never appears in `Debug` output or error messages.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const DEFAULT_DB_URL_ENV: &str = "TM_DATABASE_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PlatformConfig {
    pub database: DatabaseSettings,
    pub query: QuerySettings,
    pub audit: AuditSettings,
    /// Role name -> permission patterns (`portfolio.approve`, `order.*`, `*`).
    pub permissions: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Name of the env var holding the connection URL.
    pub url_env: String,
    pub max_connections: u32,
    /// Warm minimum kept open by the pool.
    pub min_connections: u32,
    /// Idle connections older than this are discarded.
    pub idle_ttl_secs: u64,
    /// Upper bound on blocking for a free connection.
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url_env: DEFAULT_DB_URL_ENV.to_string(),
            max_connections: 10,
            min_connections: 2,
            idle_ttl_secs: 300,
            acquire_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    pub default_limit: u32,
    pub max_limit: u32,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            default_limit: 100,
            max_limit: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuditSettings {
    /// JSONL file receiving audit/history records that could not be written
    /// after a committed mutation. Unset disables spooling.
    pub spool_path: Option<String>,
}

impl PlatformConfig {
    pub fn from_json(v: &Value) -> Result<Self> {
        let cfg: PlatformConfig =
            serde_json::from_value(v.clone()).context("platform config has invalid shape")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let db = &self.database;
        if db.url_env.trim().is_empty() {
            bail!("database.url_env must name an environment variable");
        }
        if db.max_connections == 0 {
            bail!("database.max_connections must be > 0");
        }
        if db.min_connections > db.max_connections {
            bail!(
                "database.min_connections ({}) exceeds max_connections ({})",
                db.min_connections,
                db.max_connections
            );
        }
        if db.acquire_timeout_secs == 0 {
            bail!("database.acquire_timeout_secs must be > 0");
        }
        let q = &self.query;
        if q.default_limit == 0 || q.max_limit == 0 {
            bail!("query limits must be > 0");
        }
        if q.default_limit > q.max_limit {
            bail!(
                "query.default_limit ({}) exceeds query.max_limit ({})",
                q.default_limit,
                q.max_limit
            );
        }
        Ok(())
    }
}

/// A database URL pulled from the environment. **Redacted in `Debug`.**
#[derive(Clone)]
pub struct ResolvedDatabaseUrl(String);

impl ResolvedDatabaseUrl {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ResolvedDatabaseUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResolvedDatabaseUrl(<REDACTED>)")
    }
}

impl DatabaseSettings {
    /// Read the URL from the configured env var. Errors name the variable,
    /// never the value.
    pub fn resolve_url(&self) -> Result<ResolvedDatabaseUrl> {
        self.resolve_url_with(|name| std::env::var(name).ok())
    }

    pub fn resolve_url_with<F>(&self, lookup: F) -> Result<ResolvedDatabaseUrl>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(&self.url_env).map(|v| v.trim().to_string()) {
            Some(v) if !v.is_empty() => Ok(ResolvedDatabaseUrl(v)),
            _ => bail!("missing env var {}", self.url_env),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_apply_for_missing_sections() {
        let cfg = PlatformConfig::from_json(&json!({})).unwrap();
        assert_eq!(cfg.query.default_limit, 100);
        assert_eq!(cfg.query.max_limit, 1000);
        assert_eq!(cfg.database.url_env, DEFAULT_DB_URL_ENV);
        assert!(cfg.audit.spool_path.is_none());
    }

    #[test]
    fn min_above_max_connections_rejected() {
        let v = json!({"database": {"max_connections": 2, "min_connections": 5}});
        let err = PlatformConfig::from_json(&v).unwrap_err();
        assert!(format!("{err}").contains("min_connections"));
    }

    #[test]
    fn resolved_url_is_redacted() {
        let db = DatabaseSettings::default();
        let url = db
            .resolve_url_with(|_| Some("postgres://u:p@h/db".to_string()))
            .unwrap();
        assert_eq!(format!("{url:?}"), "ResolvedDatabaseUrl(<REDACTED>)");
        assert_eq!(url.expose(), "postgres://u:p@h/db");
    }

    #[test]
    fn missing_url_names_the_variable() {
        let db = DatabaseSettings::default();
        let err = db.resolve_url_with(|_| None).unwrap_err();
        assert_eq!(format!("{err}"), format!("missing env var {DEFAULT_DB_URL_ENV}"));
    }
}
