//! Entity descriptors and the generic entity record.
//!
//! Portfolios, orders and user-defined fields share one lifecycle. What
//! differs between them (table, business columns, list dimensions) lives in
//! an [`EntityKind`] descriptor, so the repository and the workflow engine
//! are written once and parameterized by kind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::WorkflowAction;

// ---------------------------------------------------------------------------
// EntityStatus
// ---------------------------------------------------------------------------

/// The fixed set of lifecycle states. Stored as the upper-case string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityStatus {
    /// Initial, freely editable state. The only state that permits delete.
    Draft,
    /// Submitted by the maker; waiting for a checker.
    PendingApproval,
    /// Approved and live.
    Active,
    /// Declined by a checker. Editing returns the entity to `Draft`.
    Rejected,
    /// Closed after being active. Reactivation needs a different actor.
    Inactive,
}

impl EntityStatus {
    pub const ALL: [EntityStatus; 5] = [
        EntityStatus::Draft,
        EntityStatus::PendingApproval,
        EntityStatus::Active,
        EntityStatus::Rejected,
        EntityStatus::Inactive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Draft => "DRAFT",
            EntityStatus::PendingApproval => "PENDING_APPROVAL",
            EntityStatus::Active => "ACTIVE",
            EntityStatus::Rejected => "REJECTED",
            EntityStatus::Inactive => "INACTIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DRAFT" => Some(EntityStatus::Draft),
            "PENDING_APPROVAL" => Some(EntityStatus::PendingApproval),
            "ACTIVE" => Some(EntityStatus::Active),
            "REJECTED" => Some(EntityStatus::Rejected),
            "INACTIVE" => Some(EntityStatus::Inactive),
            _ => None,
        }
    }

    /// Human label used in user-facing reasons ("not in pending state").
    pub fn label(&self) -> &'static str {
        match self {
            EntityStatus::Draft => "draft",
            EntityStatus::PendingApproval => "pending approval",
            EntityStatus::Active => "active",
            EntityStatus::Rejected => "rejected",
            EntityStatus::Inactive => "inactive",
        }
    }

    /// `is_active` column value implied by this status.
    pub fn is_active(&self) -> bool {
        matches!(self, EntityStatus::Active)
    }
}

impl std::fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Field descriptors
// ---------------------------------------------------------------------------

/// Accepted shape of a business field value. All business columns are
/// stored as text; the format is enforced before any write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldFormat {
    Text,
    /// Three upper-case ASCII letters (ISO 4217 style).
    Currency,
    /// Finite decimal strictly greater than zero.
    PositiveDecimal,
    OneOf(&'static [&'static str]),
}

impl FieldFormat {
    pub fn check(&self, value: &str) -> Result<(), String> {
        match self {
            FieldFormat::Text => Ok(()),
            FieldFormat::Currency => {
                if value.len() == 3 && value.chars().all(|c| c.is_ascii_uppercase()) {
                    Ok(())
                } else {
                    Err("must be a 3-letter currency code".to_string())
                }
            }
            FieldFormat::PositiveDecimal => match value.trim().parse::<f64>() {
                Ok(v) if v.is_finite() && v > 0.0 => Ok(()),
                _ => Err("must be a positive number".to_string()),
            },
            FieldFormat::OneOf(options) => {
                if options.contains(&value) {
                    Ok(())
                } else {
                    Err(format!("must be one of {}", options.join(", ")))
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub required: bool,
    pub format: FieldFormat,
}

const fn field(name: &'static str, required: bool, format: FieldFormat) -> FieldSpec {
    FieldSpec {
        name,
        required,
        format,
    }
}

// ---------------------------------------------------------------------------
// EntityKind
// ---------------------------------------------------------------------------

/// Descriptor for one entity type: where it lives and what it carries.
#[derive(Debug, PartialEq, Eq)]
pub struct EntityKind {
    /// Stable identifier: audit `entity_type`, permission code prefix.
    pub name: &'static str,
    /// Display name used in messages.
    pub label: &'static str,
    pub table: &'static str,
    /// Business columns besides `code` and `name`.
    pub fields: &'static [FieldSpec],
    /// Business columns usable as exact-match list filters.
    pub dimensions: &'static [&'static str],
}

pub static PORTFOLIO: EntityKind = EntityKind {
    name: "portfolio",
    label: "Portfolio",
    table: "portfolios",
    fields: &[
        field("base_currency", true, FieldFormat::Currency),
        field("manager", true, FieldFormat::Text),
        field("strategy", false, FieldFormat::Text),
    ],
    dimensions: &["base_currency", "manager"],
};

pub static ORDER: EntityKind = EntityKind {
    name: "order",
    label: "Order",
    table: "orders",
    fields: &[
        field("portfolio_code", true, FieldFormat::Text),
        field("instrument", true, FieldFormat::Text),
        field("side", true, FieldFormat::OneOf(&["BUY", "SELL"])),
        field("quantity", true, FieldFormat::PositiveDecimal),
        field("limit_price", false, FieldFormat::PositiveDecimal),
    ],
    dimensions: &["portfolio_code", "instrument", "side"],
};

pub static UDF: EntityKind = EntityKind {
    name: "udf",
    label: "User-defined field",
    table: "udfs",
    fields: &[
        field(
            "data_type",
            true,
            FieldFormat::OneOf(&["TEXT", "NUMBER", "DATE", "BOOLEAN"]),
        ),
        field("applies_to", true, FieldFormat::Text),
        field("default_value", false, FieldFormat::Text),
    ],
    dimensions: &["data_type", "applies_to"],
};

pub static ALL_KINDS: [&EntityKind; 3] = [&PORTFOLIO, &ORDER, &UDF];

pub fn kind_by_name(name: &str) -> Option<&'static EntityKind> {
    ALL_KINDS
        .iter()
        .copied()
        .find(|k| k.name.eq_ignore_ascii_case(name.trim()))
}

const MAX_CODE_LEN: usize = 32;
const MAX_NAME_LEN: usize = 200;
const MAX_FIELD_LEN: usize = 500;

impl EntityKind {
    /// Permission code checked for guarded actions, e.g. `portfolio.approve`.
    pub fn action_code(&self, action: WorkflowAction) -> String {
        format!("{}.{}", self.name, action.as_str())
    }

    pub fn field_spec(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_dimension(&self, name: &str) -> bool {
        self.dimensions.contains(&name)
    }

    pub fn validate_code(&self, code: &str) -> Result<(), String> {
        if code.trim().is_empty() {
            return Err(format!("{} code is required", self.label));
        }
        if code.chars().count() > MAX_CODE_LEN {
            return Err(format!(
                "{} code must be at most {MAX_CODE_LEN} characters",
                self.label
            ));
        }
        if !code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(format!(
                "{} code may only contain letters, digits, '-' and '_'",
                self.label
            ));
        }
        Ok(())
    }

    pub fn validate_name(&self, name: &str) -> Result<(), String> {
        if name.trim().is_empty() {
            return Err(format!("{} name is required", self.label));
        }
        if name.trim().chars().count() > MAX_NAME_LEN {
            return Err(format!(
                "{} name must be at most {MAX_NAME_LEN} characters",
                self.label
            ));
        }
        Ok(())
    }

    /// Checks a complete set of business fields: no unknown keys, every
    /// required field present and non-blank, every value well formed.
    pub fn validate_fields(&self, fields: &BTreeMap<String, String>) -> Result<(), String> {
        for key in fields.keys() {
            if self.field_spec(key).is_none() {
                return Err(format!("unknown {} field '{}'", self.name, key));
            }
        }
        for spec in self.fields {
            match fields.get(spec.name).map(|v| v.trim()) {
                None | Some("") => {
                    if spec.required {
                        return Err(format!("field '{}' is required", spec.name));
                    }
                }
                Some(v) => {
                    if v.chars().count() > MAX_FIELD_LEN {
                        return Err(format!(
                            "field '{}' must be at most {MAX_FIELD_LEN} characters",
                            spec.name
                        ));
                    }
                    spec.format
                        .check(v)
                        .map_err(|e| format!("field '{}' {}", spec.name, e))?;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Maker input for `create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntity {
    pub code: String,
    pub name: String,
    pub fields: BTreeMap<String, String>,
}

impl NewEntity {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// One persisted entity row, independent of kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub code: String,
    pub name: String,
    pub fields: BTreeMap<String, String>,
    pub status: EntityStatus,
    pub is_active: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub closed_by: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
    pub reason: Option<String>,
    /// Concurrency token; every write compares and increments it.
    pub version: i64,
}

impl EntityRecord {
    /// A fresh draft as written by `create`.
    pub fn draft(entity: NewEntity, maker: &str, now: DateTime<Utc>) -> Self {
        let fields = entity
            .fields
            .into_iter()
            .map(|(k, v)| (k, v.trim().to_string()))
            .filter(|(_, v)| !v.is_empty())
            .collect();
        Self {
            code: entity.code,
            name: entity.name.trim().to_string(),
            fields,
            status: EntityStatus::Draft,
            is_active: false,
            created_by: maker.to_string(),
            created_at: now,
            approved_by: None,
            approved_at: None,
            closed_by: None,
            closed_at: None,
            updated_by: maker.to_string(),
            updated_at: now,
            reason: None,
            version: 1,
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_column_text() {
        for s in EntityStatus::ALL {
            assert_eq!(EntityStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(EntityStatus::parse("ARCHIVED"), None);
    }

    #[test]
    fn only_active_status_is_active() {
        let active: Vec<_> = EntityStatus::ALL
            .iter()
            .filter(|s| s.is_active())
            .collect();
        assert_eq!(active, vec![&EntityStatus::Active]);
    }

    #[test]
    fn portfolio_fields_validate() {
        let mut f = BTreeMap::new();
        f.insert("base_currency".to_string(), "USD".to_string());
        f.insert("manager".to_string(), "desk-a".to_string());
        assert!(PORTFOLIO.validate_fields(&f).is_ok());

        f.insert("base_currency".to_string(), "usd".to_string());
        let err = PORTFOLIO.validate_fields(&f).unwrap_err();
        assert!(err.contains("base_currency"), "{err}");

        f.insert("base_currency".to_string(), "USD".to_string());
        f.insert("colour".to_string(), "blue".to_string());
        let err = PORTFOLIO.validate_fields(&f).unwrap_err();
        assert!(err.contains("unknown"), "{err}");
    }

    #[test]
    fn order_requires_positive_quantity() {
        let mut f = BTreeMap::new();
        f.insert("portfolio_code".to_string(), "PF001".to_string());
        f.insert("instrument".to_string(), "AAPL".to_string());
        f.insert("side".to_string(), "BUY".to_string());
        f.insert("quantity".to_string(), "0".to_string());
        assert!(ORDER.validate_fields(&f).is_err());
        f.insert("quantity".to_string(), "100.5".to_string());
        assert!(ORDER.validate_fields(&f).is_ok());
        f.insert("quantity".to_string(), "NaN".to_string());
        assert!(ORDER.validate_fields(&f).is_err());
    }

    #[test]
    fn code_rules() {
        assert!(UDF.validate_code("RISK_BUCKET-1").is_ok());
        assert!(UDF.validate_code("").is_err());
        assert!(UDF.validate_code("has space").is_err());
        assert!(UDF.validate_code(&"X".repeat(33)).is_err());
    }

    #[test]
    fn length_limits_count_characters_not_bytes() {
        // 'é' is two bytes in UTF-8.
        let name = "é".repeat(MAX_NAME_LEN);
        assert!(PORTFOLIO.validate_name(&name).is_ok());
        assert!(PORTFOLIO.validate_name(&format!("{name}é")).is_err());

        let mut f = BTreeMap::new();
        f.insert("base_currency".to_string(), "CHF".to_string());
        f.insert("manager".to_string(), "Zoë Müller-Lüdenscheidt".repeat(20));
        assert!(f["manager"].len() > MAX_FIELD_LEN);
        assert!(PORTFOLIO.validate_fields(&f).is_ok());
    }

    #[test]
    fn draft_drops_blank_optional_fields() {
        let e = NewEntity::new("PF9", " Growth ")
            .field("base_currency", "EUR")
            .field("strategy", "  ");
        let rec = EntityRecord::draft(e, "u1", Utc::now());
        assert_eq!(rec.name, "Growth");
        assert_eq!(rec.field("strategy"), None);
        assert_eq!(rec.status, EntityStatus::Draft);
        assert_eq!(rec.version, 1);
    }

    #[test]
    fn kind_lookup_and_action_code() {
        let k = kind_by_name("Order").unwrap();
        assert_eq!(k.table, "orders");
        assert_eq!(k.action_code(WorkflowAction::Approve), "order.approve");
    }
}
