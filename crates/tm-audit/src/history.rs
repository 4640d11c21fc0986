use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tm_db::{EntityRepository, RepoError};
use tm_schemas::{
    EntityRecord, EntityStatus, FieldDiff, HistoryRecord, NewHistoryRecord, WorkflowAction,
};

/// Append-only change timeline, stored next to the entity through its
/// repository.
#[derive(Clone)]
pub struct HistoryTracker {
    repo: Arc<dyn EntityRepository>,
}

impl HistoryTracker {
    pub fn new(repo: Arc<dyn EntityRepository>) -> Self {
        Self { repo }
    }

    pub async fn record(
        &self,
        code: &str,
        action: WorkflowAction,
        status: EntityStatus,
        changes: Vec<FieldDiff>,
        comment: Option<String>,
        performed_by: &str,
    ) -> Result<HistoryRecord, RepoError> {
        self.repo
            .append_history(NewHistoryRecord {
                entity_type: self.repo.kind().name.to_string(),
                entity_id: code.to_string(),
                action,
                status,
                changes,
                comment,
                performed_by: performed_by.to_string(),
            })
            .await
    }

    /// History oldest first (ties by id).
    pub async fn timeline(&self, code: &str) -> Result<Vec<HistoryRecord>, RepoError> {
        let mut out = self.repo.history(code).await?;
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.history_id.cmp(&b.history_id))
        });
        Ok(out)
    }
}

/// Field-level differences, keyed by field name. Absent and blank values
/// compare equal.
pub fn diff_fields(
    before: &BTreeMap<String, String>,
    after: &BTreeMap<String, String>,
) -> Vec<FieldDiff> {
    let norm = |m: &BTreeMap<String, String>, k: &str| {
        m.get(k)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    keys.into_iter()
        .filter_map(|k| {
            let b = norm(before, k);
            let a = norm(after, k);
            (a != b).then(|| FieldDiff {
                field: k.clone(),
                before: b,
                after: a,
            })
        })
        .collect()
}

/// Diff of a stored entity against a proposed name + business fields.
/// `before == None` diffs against nothing (creation).
pub fn diff_entity(
    before: Option<&EntityRecord>,
    name: &str,
    fields: &BTreeMap<String, String>,
) -> Vec<FieldDiff> {
    let snapshot = |name: &str, fields: &BTreeMap<String, String>| {
        let mut m = fields.clone();
        m.insert("name".to_string(), name.to_string());
        m
    };
    let b = before
        .map(|r| snapshot(&r.name, &r.fields))
        .unwrap_or_default();
    diff_fields(&b, &snapshot(name, fields))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn diff_reports_added_removed_and_changed() {
        let before = map(&[("manager", "a"), ("strategy", "macro")]);
        let after = map(&[("manager", "b"), ("base_currency", "USD")]);
        let d = diff_fields(&before, &after);

        assert_eq!(d.len(), 3);
        assert_eq!(d[0].field, "base_currency");
        assert_eq!(d[0].before, None);
        assert_eq!(d[0].after.as_deref(), Some("USD"));
        assert_eq!(d[1].field, "manager");
        assert_eq!(d[2].field, "strategy");
        assert_eq!(d[2].after, None);
    }

    #[test]
    fn blank_and_absent_are_the_same() {
        let before = map(&[("strategy", "  ")]);
        assert!(diff_fields(&before, &BTreeMap::new()).is_empty());
    }

    #[test]
    fn creation_diff_includes_name() {
        let d = diff_entity(None, "Growth", &map(&[("manager", "m")]));
        assert_eq!(
            d.iter().map(|x| x.field.as_str()).collect::<Vec<_>>(),
            vec!["manager", "name"]
        );
    }
}
