//! Test harness for the workflow engine.
//!
//! In-memory repository and audit trail with fault switches, a barrier
//! wrapper that lines up concurrent writes, and fixtures for actors,
//! permissions and sample entities. Scenario tests live in `tests/`.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Barrier;
use tm_audit::ReconcileSpool;
use tm_db::{
    DeleteWrite, EntityRepository, FieldsWrite, ListFilter, RepoError, StatusWrite,
};
use tm_schemas::{
    Actor, EntityKind, EntityRecord, HistoryRecord, NewEntity, NewHistoryRecord, RequestContext,
    ORDER, PORTFOLIO, UDF,
};
use tm_workflow::{PermissionService, RolePermissions, WorkflowEngine};

pub mod memory;

pub use memory::{MemoryAuditTrail, MemoryRepository};

// ---------------------------------------------------------------------------
// Actors and permissions
// ---------------------------------------------------------------------------

pub fn maker() -> Actor {
    Actor::new("u-maker", "mia.maker")
        .with_email("mia@example.test")
        .with_roles(["maker"])
}

pub fn second_maker() -> Actor {
    Actor::new("u-maker-2", "max.maker").with_roles(["maker"])
}

pub fn checker() -> Actor {
    Actor::new("u-checker", "chen.checker").with_roles(["checker"])
}

pub fn second_checker() -> Actor {
    Actor::new("u-checker-2", "cora.checker").with_roles(["checker"])
}

/// Holds every permission, including approve. Still subject to four-eyes.
pub fn supervisor() -> Actor {
    Actor::new("u-super", "sam.supervisor").with_roles(["maker", "checker"])
}

pub fn outsider() -> Actor {
    Actor::new("u-nobody", "nora.nobody")
}

/// maker: create on every kind; checker: everything.
pub fn default_permissions() -> RolePermissions {
    let mut perms = RolePermissions::default();
    for kind in [&PORTFOLIO, &ORDER, &UDF] {
        perms = perms
            .grant("maker", format!("{}.create", kind.name))
            .grant("checker", format!("{}.*", kind.name));
    }
    perms
}

pub fn ctx() -> RequestContext {
    RequestContext::new()
        .with_client_addr("10.0.0.5")
        .with_user_agent("tm-testkit")
}

/// Counts every permission query before delegating.
pub struct CountingPermissions<P> {
    inner: P,
    calls: AtomicUsize,
}

impl<P: PermissionService> CountingPermissions<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<P: PermissionService> PermissionService for CountingPermissions<P> {
    async fn has_permission(&self, actor: &Actor, action_code: &str) -> anyhow::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.has_permission(actor, action_code).await
    }
}

/// Permission backend that is always down.
pub struct BrokenPermissions;

#[async_trait]
impl PermissionService for BrokenPermissions {
    async fn has_permission(&self, _actor: &Actor, _action_code: &str) -> anyhow::Result<bool> {
        anyhow::bail!("permission service timed out")
    }
}

// ---------------------------------------------------------------------------
// Sample entities
// ---------------------------------------------------------------------------

pub fn portfolio(code: &str) -> NewEntity {
    NewEntity::new(code, format!("Portfolio {code}"))
        .field("base_currency", "USD")
        .field("manager", "J. Smith")
        .field("strategy", "Global equity")
}

pub fn order(code: &str) -> NewEntity {
    NewEntity::new(code, format!("Order {code}"))
        .field("portfolio_code", "PF001")
        .field("instrument", "AAPL")
        .field("side", "BUY")
        .field("quantity", "100")
        .field("limit_price", "187.25")
}

pub fn udf(code: &str) -> NewEntity {
    NewEntity::new(code, format!("Field {code}"))
        .field("data_type", "TEXT")
        .field("applies_to", "portfolio")
}

pub fn sample(kind: &EntityKind, code: &str) -> NewEntity {
    match kind.name {
        "order" => order(code),
        "udf" => udf(code),
        _ => portfolio(code),
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// One engine over in-memory stores, with handles kept for assertions and
/// fault injection.
pub struct Harness {
    pub repo: Arc<MemoryRepository>,
    pub audit: Arc<MemoryAuditTrail>,
    pub engine: WorkflowEngine,
}

impl Harness {
    pub fn new(kind: &'static EntityKind) -> Self {
        Self::with_permissions(kind, Arc::new(default_permissions()))
    }

    pub fn with_permissions(
        kind: &'static EntityKind,
        permissions: Arc<dyn PermissionService>,
    ) -> Self {
        let repo = Arc::new(MemoryRepository::new(kind));
        let audit = Arc::new(MemoryAuditTrail::new());
        let engine = WorkflowEngine::new(repo.clone(), audit.clone(), permissions);
        Self {
            repo,
            audit,
            engine,
        }
    }

    /// Same stores, with a reconciliation spool at `path`.
    pub fn with_spool(self, path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let spool = Arc::new(ReconcileSpool::open(path)?);
        Ok(Self {
            engine: self.engine.with_spool(spool),
            ..self
        })
    }

    /// create -> submit, returning the pending record.
    pub async fn pending(&self, code: &str) -> anyhow::Result<EntityRecord> {
        let input = sample(self.engine.kind(), code);
        self.engine.create(&maker(), &ctx(), input).await?;
        Ok(self.engine.submit(&maker(), &ctx(), code).await?.into_entity())
    }

    /// create -> submit -> approve, returning the active record.
    pub async fn active(&self, code: &str) -> anyhow::Result<EntityRecord> {
        self.pending(code).await?;
        Ok(self
            .engine
            .approve(&checker(), &ctx(), code, None)
            .await?
            .into_entity())
    }
}

// ---------------------------------------------------------------------------
// BarrierRepository
// ---------------------------------------------------------------------------

/// Holds every status write at a barrier until `parties` callers have
/// arrived, so that concurrent transitions all pass their re-read before
/// any of them writes.
pub struct BarrierRepository {
    inner: Arc<dyn EntityRepository>,
    barrier: Barrier,
}

impl BarrierRepository {
    pub fn new(inner: Arc<dyn EntityRepository>, parties: usize) -> Self {
        Self {
            inner,
            barrier: Barrier::new(parties),
        }
    }
}

#[async_trait]
impl EntityRepository for BarrierRepository {
    fn kind(&self) -> &'static EntityKind {
        self.inner.kind()
    }

    async fn find_by_code(&self, code: &str) -> Result<EntityRecord, RepoError> {
        self.inner.find_by_code(code).await
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<EntityRecord>, RepoError> {
        self.inner.list(filter).await
    }

    async fn insert(&self, entity: &EntityRecord) -> Result<(), RepoError> {
        self.inner.insert(entity).await
    }

    async fn update_status(&self, code: &str, write: &StatusWrite) -> Result<(), RepoError> {
        self.barrier.wait().await;
        self.inner.update_status(code, write).await
    }

    async fn update_fields(&self, code: &str, write: &FieldsWrite) -> Result<(), RepoError> {
        self.inner.update_fields(code, write).await
    }

    async fn soft_delete(&self, code: &str, write: &DeleteWrite) -> Result<(), RepoError> {
        self.inner.soft_delete(code, write).await
    }

    async fn append_history(&self, entry: NewHistoryRecord) -> Result<HistoryRecord, RepoError> {
        self.inner.append_history(entry).await
    }

    async fn restore_history(&self, record: &HistoryRecord) -> Result<bool, RepoError> {
        self.inner.restore_history(record).await
    }

    async fn history(&self, code: &str) -> Result<Vec<HistoryRecord>, RepoError> {
        self.inner.history(code).await
    }
}
