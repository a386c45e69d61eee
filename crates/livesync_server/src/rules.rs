//! Table rule resolution.

use crate::error::ServerResult;
use async_trait::async_trait;
use livesync_engine::TableRules;
use std::collections::HashMap;

/// Resolves the rules a connection has on a table.
///
/// Session and rule evaluation live outside the server; this is the seam.
#[async_trait]
pub trait RuleResolver: Send + Sync {
    /// Rules for `table` on `connection`, or `None` if the table is not
    /// exposed to it.
    async fn table_rules(&self, connection: &str, table: &str) -> ServerResult<Option<TableRules>>;
}

/// The same rules for every connection.
#[derive(Debug, Clone, Default)]
pub struct StaticRules {
    tables: HashMap<String, TableRules>,
    fallback: Option<TableRules>,
}

impl StaticRules {
    /// Creates an empty rule set. No table is exposed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the rules of one table.
    pub fn with_table(mut self, table: impl Into<String>, rules: TableRules) -> Self {
        self.tables.insert(table.into(), rules);
        self
    }

    /// Sets the rules of tables without an entry.
    pub fn with_fallback(mut self, rules: TableRules) -> Self {
        self.fallback = Some(rules);
        self
    }
}

#[async_trait]
impl RuleResolver for StaticRules {
    async fn table_rules(
        &self,
        _connection: &str,
        table: &str,
    ) -> ServerResult<Option<TableRules>> {
        Ok(self
            .tables
            .get(table)
            .cloned()
            .or_else(|| self.fallback.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn table_entries_win_over_fallback() {
        let rules = StaticRules::new()
            .with_table("items", TableRules::all())
            .with_fallback(TableRules::read_only());

        let items = rules.table_rules("c1", "items").await.unwrap().unwrap();
        assert!(items.insert);
        let other = rules.table_rules("c1", "other").await.unwrap().unwrap();
        assert!(other.select);
        assert!(!other.insert);
    }

    #[tokio::test]
    async fn nothing_exposed_by_default() {
        let rules = StaticRules::new();
        assert!(rules.table_rules("c1", "items").await.unwrap().is_none());
    }
}
