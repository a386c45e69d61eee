//! Row filters.
//!
//! A [`Filter`] is a small predicate tree over [`Row`]s. The same filter is
//! used in two places:
//! - evaluated in process by the in-memory table backend ([`Filter::matches`])
//! - rendered to a deterministic SQL condition ([`Filter::to_sql`]) that keys
//!   database triggers and is embedded in trigger bodies
//!
//! Rendering is deterministic so that two subscriptions with the same filter
//! share one trigger.

use crate::row::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt::Write;

/// Condition string used when a filter matches every row.
pub const TRUE_CONDITION: &str = "TRUE";

/// A predicate over rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    /// Matches every row.
    #[default]
    All,
    /// `field = value`
    Eq {
        /// Column name.
        field: String,
        /// Value to compare against.
        value: Value,
    },
    /// `field <> value`
    Ne {
        /// Column name.
        field: String,
        /// Value to compare against.
        value: Value,
    },
    /// `field > value`
    Gt {
        /// Column name.
        field: String,
        /// Value to compare against.
        value: Value,
    },
    /// `field >= value`
    Gte {
        /// Column name.
        field: String,
        /// Value to compare against.
        value: Value,
    },
    /// `field < value`
    Lt {
        /// Column name.
        field: String,
        /// Value to compare against.
        value: Value,
    },
    /// `field <= value`
    Lte {
        /// Column name.
        field: String,
        /// Value to compare against.
        value: Value,
    },
    /// `field IN (values)`
    In {
        /// Column name.
        field: String,
        /// Accepted values.
        values: Vec<Value>,
    },
    /// `field IS NULL`
    IsNull {
        /// Column name.
        field: String,
    },
    /// Every child filter matches.
    And {
        /// Child filters.
        filters: Vec<Filter>,
    },
    /// At least one child filter matches.
    Or {
        /// Child filters.
        filters: Vec<Filter>,
    },
    /// The child filter does not match.
    Not {
        /// Negated filter.
        filter: Box<Filter>,
    },
}

impl Filter {
    /// `field = value`
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    /// `field <> value`
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ne {
            field: field.into(),
            value: value.into(),
        }
    }

    /// `field > value`
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gt {
            field: field.into(),
            value: value.into(),
        }
    }

    /// `field >= value`
    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gte {
            field: field.into(),
            value: value.into(),
        }
    }

    /// `field < value`
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lt {
            field: field.into(),
            value: value.into(),
        }
    }

    /// `field <= value`
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lte {
            field: field.into(),
            value: value.into(),
        }
    }

    /// `field IN (values)`
    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In {
            field: field.into(),
            values,
        }
    }

    /// Conjunction of `filters`, dropping `All` children.
    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        let filters: Vec<Filter> = filters
            .into_iter()
            .filter(|f| !f.is_all())
            .collect();
        match filters.len() {
            0 => Filter::All,
            1 => filters.into_iter().next().unwrap_or_default(),
            _ => Filter::And { filters },
        }
    }

    /// Disjunction of `filters`.
    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Or {
            filters: filters.into_iter().collect(),
        }
    }

    /// Negation of `filter`.
    pub fn not(filter: Filter) -> Self {
        Filter::Not {
            filter: Box::new(filter),
        }
    }

    /// Returns `self AND other`.
    pub fn and_also(self, other: Filter) -> Self {
        Filter::and([self, other])
    }

    /// Returns true if this filter matches every row.
    pub fn is_all(&self) -> bool {
        matches!(self, Filter::All)
    }

    /// Evaluates the filter against a row. Missing fields read as `null`.
    pub fn matches(&self, row: &Row) -> bool {
        let field_value = |field: &str| row.get(field).unwrap_or(&Value::Null);
        match self {
            Filter::All => true,
            Filter::Eq { field, value } => values_equal(field_value(field), value),
            Filter::Ne { field, value } => !values_equal(field_value(field), value),
            Filter::Gt { field, value } => {
                compare_values(field_value(field), value) == Some(Ordering::Greater)
            }
            Filter::Gte { field, value } => matches!(
                compare_values(field_value(field), value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::Lt { field, value } => {
                compare_values(field_value(field), value) == Some(Ordering::Less)
            }
            Filter::Lte { field, value } => matches!(
                compare_values(field_value(field), value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Filter::In { field, values } => {
                let v = field_value(field);
                values.iter().any(|candidate| values_equal(v, candidate))
            }
            Filter::IsNull { field } => field_value(field).is_null(),
            Filter::And { filters } => filters.iter().all(|f| f.matches(row)),
            Filter::Or { filters } => filters.iter().any(|f| f.matches(row)),
            Filter::Not { filter } => !filter.matches(row),
        }
    }

    /// Renders the filter as a SQL boolean expression.
    ///
    /// The output is deterministic for a given filter and is used as the
    /// trigger condition key.
    pub fn to_sql(&self) -> String {
        let mut out = String::new();
        self.write_sql(&mut out);
        out
    }

    fn write_sql(&self, out: &mut String) {
        match self {
            Filter::All => out.push_str(TRUE_CONDITION),
            Filter::Eq { field, value } if value.is_null() => {
                let _ = write!(out, "{} IS NULL", quote_ident(field));
            }
            Filter::Ne { field, value } if value.is_null() => {
                let _ = write!(out, "{} IS NOT NULL", quote_ident(field));
            }
            Filter::Eq { field, value } => binary(out, field, "=", value),
            Filter::Ne { field, value } => binary(out, field, "<>", value),
            Filter::Gt { field, value } => binary(out, field, ">", value),
            Filter::Gte { field, value } => binary(out, field, ">=", value),
            Filter::Lt { field, value } => binary(out, field, "<", value),
            Filter::Lte { field, value } => binary(out, field, "<=", value),
            Filter::In { values, .. } if values.is_empty() => out.push_str("FALSE"),
            Filter::In { field, values } => {
                let _ = write!(out, "{} IN (", quote_ident(field));
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&quote_literal(v));
                }
                out.push(')');
            }
            Filter::IsNull { field } => {
                let _ = write!(out, "{} IS NULL", quote_ident(field));
            }
            Filter::And { filters } => join(out, filters, " AND ", TRUE_CONDITION),
            Filter::Or { filters } => join(out, filters, " OR ", "FALSE"),
            Filter::Not { filter } => {
                out.push_str("NOT (");
                filter.write_sql(out);
                out.push(')');
            }
        }
    }
}

fn binary(out: &mut String, field: &str, op: &str, value: &Value) {
    let _ = write!(out, "{} {} {}", quote_ident(field), op, quote_literal(value));
}

fn join(out: &mut String, filters: &[Filter], sep: &str, empty: &str) {
    if filters.is_empty() {
        out.push_str(empty);
        return;
    }
    out.push('(');
    for (i, f) in filters.iter().enumerate() {
        if i > 0 {
            out.push_str(sep);
        }
        f.write_sql(out);
    }
    out.push(')');
}

/// Quotes a SQL identifier, doubling embedded double quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Renders a JSON value as a SQL literal.
pub fn quote_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".into(),
        Value::Bool(true) => "TRUE".into(),
        Value::Bool(false) => "FALSE".into(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'::jsonb", other.to_string().replace('\'', "''")),
    }
}

/// Equality on JSON values where numbers compare numerically.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Orders two JSON scalars of the same kind. Mixed kinds are unordered.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
