//! Rows and sync identity keys.

use crate::error::{ProtocolError, ProtocolResult};
use crate::filter::{compare_values, Filter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// A table row as a JSON object.
pub type Row = serde_json::Map<String, Value>;

/// Sort direction for one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Column name.
    pub field: String,
    /// Ascending when true.
    pub ascending: bool,
}

impl OrderBy {
    /// Ascending order on `field`.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: true,
        }
    }

    /// Descending order on `field`.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: false,
        }
    }
}

/// Returns a copy of `row` holding only `fields`. Missing fields are skipped.
pub fn pick_fields(row: &Row, fields: &[String]) -> Row {
    fields
        .iter()
        .filter_map(|f| row.get(f).map(|v| (f.clone(), v.clone())))
        .collect()
}

/// Returns a copy of `row` without `fields`.
pub fn omit_fields(row: &Row, fields: &[String]) -> Row {
    row.iter()
        .filter(|(k, _)| !fields.iter().any(|f| f == *k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Renders a JSON value for identity comparison.
///
/// Strings compare by their content, everything else by its JSON text, so
/// `1` and `"1"` identify the same row.
fn id_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Reads a numeric synced value from a JSON value. Numeric strings are
/// accepted since some drivers return big numerics as text.
pub fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

/// Identity and version columns of a synced table.
///
/// `id_fields` identify a row across client and server; `synced_field` is a
/// numeric column that only grows for a given identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncKeys {
    id_fields: Vec<String>,
    synced_field: String,
}

impl SyncKeys {
    /// Creates sync keys. `id_fields` must be non-empty and unique and must
    /// not contain `synced_field`. Id fields are kept sorted by name.
    pub fn new(
        id_fields: impl IntoIterator<Item = impl Into<String>>,
        synced_field: impl Into<String>,
    ) -> ProtocolResult<Self> {
        let synced_field = synced_field.into();
        let mut id_fields: Vec<String> = id_fields.into_iter().map(Into::into).collect();
        if id_fields.is_empty() {
            return Err(ProtocolError::InvalidKeys("id_fields must not be empty".into()));
        }
        if synced_field.is_empty() {
            return Err(ProtocolError::InvalidKeys("synced_field must not be empty".into()));
        }
        id_fields.sort();
        if id_fields.windows(2).any(|w| w[0] == w[1]) {
            return Err(ProtocolError::InvalidKeys("id_fields must be unique".into()));
        }
        if id_fields.contains(&synced_field) {
            return Err(ProtocolError::InvalidKeys(format!(
                "synced_field {synced_field:?} cannot also be an id field"
            )));
        }
        Ok(Self {
            id_fields,
            synced_field,
        })
    }

    /// Id fields, sorted by name.
    pub fn id_fields(&self) -> &[String] {
        &self.id_fields
    }

    /// The synced (version) field.
    pub fn synced_field(&self) -> &str {
        &self.synced_field
    }

    /// `[synced_field, id_fields...]`, the columns needed to compare rows.
    pub fn sync_fields(&self) -> Vec<String> {
        std::iter::once(self.synced_field.clone())
            .chain(self.id_fields.iter().cloned())
            .collect()
    }

    /// Sort order matching [`SyncKeys::compare`].
    pub fn order_by(&self, ascending: bool) -> Vec<OrderBy> {
        self.sync_fields()
            .into_iter()
            .map(|field| OrderBy { field, ascending })
            .collect()
    }

    /// Reads the synced value of a row.
    pub fn synced_value(&self, row: &Row) -> Option<f64> {
        row.get(&self.synced_field).and_then(numeric_value)
    }

    /// Reads the synced value of a row, failing if it is missing or not numeric.
    pub fn require_synced(&self, row: &Row) -> ProtocolResult<f64> {
        match row.get(&self.synced_field) {
            None => Err(ProtocolError::MissingField {
                field: self.synced_field.clone(),
            }),
            Some(v) => numeric_value(v).ok_or_else(|| ProtocolError::NonNumericSynced {
                field: self.synced_field.clone(),
                value: v.to_string(),
            }),
        }
    }

    /// Checks that a row carries every id field and a numeric synced value.
    pub fn validate(&self, row: &Row) -> ProtocolResult<()> {
        if let Some(missing) = self.id_fields.iter().find(|f| !row.contains_key(*f)) {
            return Err(ProtocolError::MissingField {
                field: missing.clone(),
            });
        }
        self.require_synced(row).map(|_| ())
    }

    /// True if both rows carry the same identity.
    pub fn ids_match(&self, a: &Row, b: &Row) -> bool {
        self.id_fields.iter().all(|key| match (a.get(key), b.get(key)) {
            (Some(x), Some(y)) => id_text(x) == id_text(y),
            _ => false,
        })
    }

    /// True if both rows exist, share an identity and have the same synced value.
    pub fn fully_match(&self, a: Option<&Row>, b: Option<&Row>) -> bool {
        match (a, b) {
            (Some(a), Some(b)) => {
                self.ids_match(a, b)
                    && match (self.synced_value(a), self.synced_value(b)) {
                        (Some(x), Some(y)) => x == y,
                        _ => false,
                    }
            }
            _ => false,
        }
    }

    /// A string that uniquely identifies a row's identity.
    pub fn id_key(&self, row: &Row) -> String {
        let parts: Vec<String> = self
            .id_fields
            .iter()
            .map(|key| row.get(key).map(id_text).unwrap_or_default())
            .collect();
        // JSON array text keeps composite keys unambiguous.
        serde_json::to_string(&parts).unwrap_or_else(|_| parts.join("."))
    }

    /// Equality filter on the row's id fields.
    pub fn id_filter(&self, row: &Row) -> Filter {
        Filter::and(self.id_fields.iter().map(|key| {
            Filter::eq(key.clone(), row.get(key).cloned().unwrap_or(Value::Null))
        }))
    }

    /// Equality filter on the row's id fields and numeric synced value.
    pub fn exact_filter(&self, row: &Row) -> Filter {
        let synced = match self.synced_value(row) {
            Some(v) => Value::from(v),
            None => row.get(&self.synced_field).cloned().unwrap_or(Value::Null),
        };
        self.id_filter(row)
            .and_also(Filter::eq(self.synced_field.clone(), synced))
    }

    /// Copy of the row holding only the id fields.
    pub fn pick_ids(&self, row: &Row) -> Row {
        pick_fields(row, &self.id_fields)
    }

    /// Copy of the row without the id fields.
    pub fn omit_ids(&self, row: &Row) -> Row {
        omit_fields(row, &self.id_fields)
    }

    /// Row order: synced value ascending, then id fields (sorted by name).
    ///
    /// Ids compare as native values, so numeric ids sort numerically the way
    /// the database orders them. Ids of different kinds fall back to text.
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        let sa = self.synced_value(a).unwrap_or(f64::NEG_INFINITY);
        let sb = self.synced_value(b).unwrap_or(f64::NEG_INFINITY);
        sa.total_cmp(&sb).then_with(|| {
            self.id_fields
                .iter()
                .map(|key| {
                    let x = a.get(key).unwrap_or(&Value::Null);
                    let y = b.get(key).unwrap_or(&Value::Null);
                    compare_values(x, y).unwrap_or_else(|| id_text(x).cmp(&id_text(y)))
                })
                .find(|o| o.is_ne())
                .unwrap_or(Ordering::Equal)
        })
    }

    /// Sorts rows in place by [`SyncKeys::compare`].
    pub fn sort(&self, rows: &mut [Row]) {
        rows.sort_by(|a, b| self.compare(a, b));
    }
}
