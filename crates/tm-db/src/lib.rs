use std::time::Duration;

pub mod engine;
pub mod repo;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use engine::{DbError, PgQueryEngine, PoolSettings, QueryEngine, Row, SqlType, SqlValue};
pub use repo::{
    DeleteWrite, EntityRepository, FieldsWrite, ListFilter, ListLimits, RepoError,
    SqlEntityRepository, StatusWrite,
};

pub const ENV_DB_URL: &str = "TM_DATABASE_URL";

/// Connect using TM_DATABASE_URL and default pool settings.
pub async fn connect_from_env() -> Result<PgQueryEngine, DbError> {
    let url = std::env::var(ENV_DB_URL)
        .map_err(|_| DbError::Connection(format!("missing env var {ENV_DB_URL}")))?;
    PgQueryEngine::connect(&url, &PoolSettings::default()).await
}

/// Apply embedded migrations. Every statement is idempotent
/// (`create ... if not exists`), so re-running on a live schema is safe.
pub async fn migrate(engine: &PgQueryEngine) -> Result<(), DbError> {
    sqlx::migrate!("./migrations")
        .run(engine.pool())
        .await
        .map_err(|e| DbError::Query(format!("db migrate failed: {e}")))?;
    Ok(())
}

/// Connectivity + schema presence.
pub async fn status(engine: &dyn QueryEngine) -> Result<DbStatus, DbError> {
    let rows = engine.execute_query("select 1::bigint as one", &[]).await?;
    let ok = rows
        .first()
        .map(|r| r.int("one"))
        .transpose()?
        .map(|v| v == 1)
        .unwrap_or(false);

    let rows = engine
        .execute_query(
            r#"
            select count(*) as n
            from information_schema.tables
            where table_name in ('portfolios', 'orders', 'udfs', 'entity_history', 'audit_logs')
            "#,
            &[],
        )
        .await?;
    let tables = rows.first().map(|r| r.int("n")).transpose()?.unwrap_or(0);

    Ok(DbStatus {
        ok,
        has_schema: tables == 5,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_schema: bool,
}

/// Pool settings from config values (seconds).
pub fn pool_settings(
    max_connections: u32,
    min_connections: u32,
    idle_ttl_secs: u64,
    acquire_timeout_secs: u64,
) -> PoolSettings {
    PoolSettings {
        max_connections,
        min_connections,
        idle_ttl: Duration::from_secs(idle_ttl_secs),
        acquire_timeout: Duration::from_secs(acquire_timeout_secs),
    }
}
