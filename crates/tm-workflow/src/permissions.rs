use async_trait::async_trait;
use std::collections::BTreeMap;
use tm_schemas::Actor;

/// External authorization check. Action codes look like `portfolio.approve`.
#[async_trait]
pub trait PermissionService: Send + Sync {
    async fn has_permission(&self, actor: &Actor, action_code: &str) -> anyhow::Result<bool>;
}

/// Role -> permission patterns, usually from the `permissions` config section.
///
/// A pattern is an exact action code, `<kind>.*`, or `*`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RolePermissions {
    roles: BTreeMap<String, Vec<String>>,
}

impl RolePermissions {
    pub fn new(roles: BTreeMap<String, Vec<String>>) -> Self {
        Self { roles }
    }

    pub fn grant(mut self, role: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.roles.entry(role.into()).or_default().push(pattern.into());
        self
    }

    pub fn allows(&self, actor: &Actor, action_code: &str) -> bool {
        actor.roles.iter().any(|role| {
            self.roles
                .get(role)
                .is_some_and(|patterns| patterns.iter().any(|p| pattern_matches(p, action_code)))
        })
    }
}

#[async_trait]
impl PermissionService for RolePermissions {
    async fn has_permission(&self, actor: &Actor, action_code: &str) -> anyhow::Result<bool> {
        Ok(self.allows(actor, action_code))
    }
}

fn pattern_matches(pattern: &str, code: &str) -> bool {
    let pattern = pattern.trim();
    if pattern == "*" || pattern.eq_ignore_ascii_case(code) {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => code
            .split_once('.')
            .is_some_and(|(kind, _)| kind.eq_ignore_ascii_case(prefix)),
        None => false,
    }
}
