//! Declarative JSON queries over labelled state fields.
//!
//! Queries arrive from domain plugins as JSON documents:
//!
//! ```json
//! {
//!   "eq":    [{"field": "owner", "value": "0xf0e1..."}],
//!   "gt":    [{"field": "amount", "value": 100}],
//!   "limit": 10,
//!   "sort":  ["-amount"]
//! }
//! ```
//!
//! Only fields a schema marks `indexed` may be referenced. Comparisons are
//! numeric when both sides parse as unsigned 256-bit integers (decimal or
//! `0x` hex), and lexicographic otherwise. Results are deterministic: the
//! requested sort is always tie-broken by state ID bytewise, and the default
//! order is `(created_at asc, id asc)`.

use std::cmp::Ordering;

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StateError};
use crate::schema::Schema;
use crate::state::StateRecord;

// ═══════════════════════════════════════════════════════════════════════════════
// QUERY DOCUMENT
// ═══════════════════════════════════════════════════════════════════════════════

/// One field comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldFilter {
    /// The labelled field to compare.
    pub field: String,
    /// The comparison operand.
    pub value: Value,
}

/// A parsed state query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateQuery {
    /// Equality filters (all must hold).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub eq: Vec<FieldFilter>,
    /// Strictly-greater-than filters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gt: Vec<FieldFilter>,
    /// Strictly-less-than filters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lt: Vec<FieldFilter>,
    /// Maximum number of results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Sort fields, `-` prefix for descending.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<String>,
}

impl StateQuery {
    /// Parse a query from its JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| StateError::QueryInvalid(e.to_string()))
    }

    /// A query with no filters (everything available).
    #[must_use]
    pub fn unfiltered() -> Self {
        Self::default()
    }

    /// Check every referenced field is a label of `schema`.
    pub fn validate_for(&self, schema: &Schema) -> Result<()> {
        let labels = schema.definition.labels();
        let mut referenced: Vec<&str> = self
            .eq
            .iter()
            .chain(&self.gt)
            .chain(&self.lt)
            .map(|f| f.field.as_str())
            .collect();
        referenced.extend(self.sort.iter().map(|s| sort_field(s).0));
        for field in referenced {
            if !labels.contains(&field) {
                return Err(StateError::QueryInvalid(format!(
                    "field {field:?} is not a label of schema {}",
                    schema.id_string()
                )));
            }
        }
        Ok(())
    }

    /// Whether `data` satisfies every filter.
    #[must_use]
    pub fn matches(&self, data: &Value) -> bool {
        self.eq
            .iter()
            .all(|f| compare_values(field_of(data, &f.field), &f.value) == Some(Ordering::Equal))
            && self.gt.iter().all(|f| {
                compare_values(field_of(data, &f.field), &f.value) == Some(Ordering::Greater)
            })
            && self
                .lt
                .iter()
                .all(|f| compare_values(field_of(data, &f.field), &f.value) == Some(Ordering::Less))
    }

    /// Order two records per the query's sort, tie-broken by `(created_at, id)`.
    #[must_use]
    pub fn order(&self, a: &StateRecord, b: &StateRecord) -> Ordering {
        for spec in &self.sort {
            let (field, descending) = sort_field(spec);
            let ord = compare_values(field_of(&a.data, field), field_of(&b.data, field).unwrap_or(&Value::Null))
                .unwrap_or(Ordering::Equal);
            let ord = if descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.as_slice().cmp(b.id.as_slice()))
    }
}

fn sort_field(spec: &str) -> (&str, bool) {
    spec.strip_prefix('-').map_or((spec, false), |f| (f, true))
}

fn field_of<'a>(data: &'a Value, field: &str) -> Option<&'a Value> {
    data.get(field)
}

// ═══════════════════════════════════════════════════════════════════════════════
// VALUE COMPARISON
// ═══════════════════════════════════════════════════════════════════════════════

/// Parse a JSON value as a 256-bit unsigned integer if it looks like one.
fn value_as_u256(value: &Value) -> Option<U256> {
    match value {
        Value::Number(n) => n.as_u64().map(U256::from),
        Value::String(s) => {
            if let Some(hex) = s.strip_prefix("0x") {
                U256::from_str_radix(hex, 16).ok()
            } else {
                U256::from_str_radix(s, 10).ok()
            }
        }
        _ => None,
    }
}

/// Compare a field value against an operand.
///
/// Numeric when both sides parse as u256; case-insensitive string compare for
/// strings (addresses and hex IDs arrive in mixed case); `None` when the
/// field is absent or the shapes are incomparable.
fn compare_values(field: Option<&Value>, operand: &Value) -> Option<Ordering> {
    let field = field?;
    if let (Some(a), Some(b)) = (value_as_u256(field), value_as_u256(operand)) {
        return Some(a.cmp(&b));
    }
    match (field, operand) {
        (Value::String(a), Value::String(b)) => {
            Some(a.to_lowercase().cmp(&b.to_lowercase()))
        }
        (a, b) if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
