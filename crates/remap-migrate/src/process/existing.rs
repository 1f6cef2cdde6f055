//! Records already present in the target, indexed by discriminator values.

use std::collections::{HashMap, HashSet};
use tracing::info;

use crate::error::Result;
use crate::mapping::Mapping;
use crate::store::identifier::{quote_column_list, quote_pg};
use crate::store::{Side, StoreQuery};

#[derive(Debug, Clone, Default)]
struct TableRecords {
    /// Discriminator values, in discriminator order, to the record id.
    index: HashMap<Vec<String>, Option<i64>>,
}

/// Existing target records of every discriminated table.
#[derive(Debug, Clone, Default)]
pub struct ExistingRecords {
    tables: HashMap<String, TableRecords>,
}

impl ExistingRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the discriminator columns (and the id, when the table has one) of
    /// every discriminated target table.
    ///
    /// Records holding a NULL discriminator can never match and are skipped.
    pub async fn extract(
        store: &dyn StoreQuery,
        mapping: &Mapping,
        target_tables: &[String],
        tables_without_id: &HashSet<String>,
        id_column: &str,
    ) -> Result<Self> {
        let mut records = Self::new();
        for table in target_tables {
            let discriminators = mapping.discriminators(table);
            if discriminators.is_empty() {
                continue;
            }
            let with_id = !tables_without_id.contains(table);
            let mut columns = discriminators.to_vec();
            if with_id {
                columns.push(id_column.to_string());
            }
            let sql = format!(
                "SELECT {} FROM {}",
                quote_column_list(&columns)?,
                quote_pg(table)?
            );

            let rows = store.query_text(Side::Target, &sql).await?;
            let count = rows.len();
            for mut row in rows {
                let id = if with_id {
                    row.pop()
                        .flatten()
                        .and_then(|id| id.parse::<i64>().ok())
                } else {
                    None
                };
                if let Some(values) = row.into_iter().collect::<Option<Vec<String>>>() {
                    records.insert(table, values, id);
                }
            }
            info!("Extracted {} existing records from {}", count, table);
        }
        Ok(records)
    }

    /// Record an existing row. The first record seen for a value set wins.
    pub fn insert(&mut self, table: &str, values: Vec<String>, id: Option<i64>) {
        self.tables
            .entry(table.to_string())
            .or_default()
            .index
            .entry(values)
            .or_insert(id);
    }

    /// True when some existing record of `table` has exactly these values.
    pub fn contains(&self, table: &str, values: &[String]) -> bool {
        self.tables
            .get(table)
            .map(|records| records.index.contains_key(values))
            .unwrap_or(false)
    }

    /// Identifier of the existing record with exactly these values.
    pub fn find_id(&self, table: &str, values: &[String]) -> Option<i64> {
        self.tables
            .get(table)
            .and_then(|records| records.index.get(values).copied().flatten())
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(|t| t.index.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingDocuments;
    use crate::store::memory::MemoryStore;
    use crate::transform::TransformRegistry;

    fn values(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_extract_with_and_without_id() {
        let yaml = r#"
base:
  res_users.__discriminator__: [login]
  res_groups_users_rel.__discriminator__: [gid, uid]
"#;
        let docs = MappingDocuments::from_yaml(yaml).unwrap();
        let mapping =
            Mapping::compile(docs.merge(&["base".to_string()]).unwrap(), &TransformRegistry::builtin(), false)
                .unwrap();

        let store = MemoryStore::new()
            .with_query(
                Side::Target,
                r#"SELECT "login", "id" FROM "res_users""#,
                vec![vec!["admin", "1"], vec!["demo", "6"]],
            )
            .with_query(
                Side::Target,
                r#"SELECT "gid", "uid" FROM "res_groups_users_rel""#,
                vec![vec!["3", "1"]],
            );

        let tables = values(&["res_users", "res_groups_users_rel", "res_partner"]);
        let without_id = HashSet::from(["res_groups_users_rel".to_string()]);
        let existing = ExistingRecords::extract(&store, &mapping, &tables, &without_id, "id")
            .await
            .unwrap();

        assert_eq!(existing.find_id("res_users", &values(&["demo"])), Some(6));
        assert!(existing.contains("res_groups_users_rel", &values(&["3", "1"])));
        assert_eq!(existing.find_id("res_groups_users_rel", &values(&["3", "1"])), None);
        assert!(!existing.contains("res_users", &values(&["nobody"])));
        assert_eq!(existing.len(), 3);
    }

    #[test]
    fn test_first_record_wins() {
        let mut existing = ExistingRecords::new();
        existing.insert("t", values(&["a"]), Some(1));
        existing.insert("t", values(&["a"]), Some(2));
        assert_eq!(existing.find_id("t", &values(&["a"])), Some(1));
    }
}
