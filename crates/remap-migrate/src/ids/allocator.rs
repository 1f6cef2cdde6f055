//! Per-table identifier offsets and fresh identifiers.

use std::collections::HashMap;
use tracing::debug;

use crate::error::Result;
use crate::store::{Side, StoreQuery};

/// Issues non-colliding identifiers for rows inserted into the target.
///
/// Plain inserts keep their source identifier shifted by the target's current
/// maximum ([`IdAllocator::offset`]). Moved rows get a fresh identifier above
/// the source maximum ([`IdAllocator::allocate`]) which is offset the same way
/// when the row is written, so the two ranges never meet.
#[derive(Debug, Clone, Default)]
pub struct IdAllocator {
    max_source_id: HashMap<String, i64>,
    max_target_id: HashMap<String, i64>,
    next_id: HashMap<String, i64>,
}

impl IdAllocator {
    /// Create an allocator from known maxima.
    pub fn new(max_source_id: HashMap<String, i64>, max_target_id: HashMap<String, i64>) -> Self {
        let next_id = max_target_id
            .keys()
            .map(|table| (table.clone(), max_source_id.get(table).copied().unwrap_or(0)))
            .collect();
        Self {
            max_source_id,
            max_target_id,
            next_id,
        }
    }

    /// Query the maximum identifier of every source and target table.
    ///
    /// Tables without an identifier column are recorded as zero.
    pub async fn initialize(
        store: &dyn StoreQuery,
        source_tables: &[String],
        target_tables: &[String],
        id_column: &str,
    ) -> Result<Self> {
        let mut max_source_id = HashMap::new();
        for table in source_tables {
            let max = store.max_id(Side::Source, table, id_column).await?;
            if max.is_none() {
                debug!("{}: no {} column in source", table, id_column);
            }
            max_source_id.insert(table.clone(), max.unwrap_or(0));
        }

        let mut max_target_id = HashMap::new();
        for table in target_tables {
            let max = store.max_id(Side::Target, table, id_column).await?;
            if max.is_none() {
                debug!("{}: no {} column in target", table, id_column);
            }
            max_target_id.insert(table.clone(), max.unwrap_or(0));
        }

        Ok(Self::new(max_source_id, max_target_id))
    }

    pub fn max_source_id(&self, table: &str) -> i64 {
        self.max_source_id.get(table).copied().unwrap_or(0)
    }

    pub fn max_target_id(&self, table: &str) -> i64 {
        self.max_target_id.get(table).copied().unwrap_or(0)
    }

    /// Return a strictly increasing fresh identifier for `table`.
    pub fn allocate(&mut self, table: &str) -> i64 {
        let base = self.max_source_id(table);
        let next = self.next_id.entry(table.to_string()).or_insert(base);
        *next += 1;
        *next
    }

    /// Shift a source identifier past the target's current maximum.
    pub fn offset(&self, table: &str, original_id: i64) -> i64 {
        original_id + self.max_target_id(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn allocator() -> IdAllocator {
        IdAllocator::new(
            HashMap::from([("res_partner".to_string(), 40)]),
            HashMap::from([("res_partner".to_string(), 100)]),
        )
    }

    #[test]
    fn test_offset_adds_target_max() {
        let ids = allocator();
        assert_eq!(ids.offset("res_partner", 1), 101);
        assert_eq!(ids.offset("unknown", 7), 7);
    }

    #[test]
    fn test_allocate_starts_after_source_max() {
        let mut ids = allocator();
        assert_eq!(ids.allocate("res_partner"), 41);
        assert_eq!(ids.allocate("res_partner"), 42);
    }

    #[test]
    fn test_allocated_and_offset_ranges_do_not_overlap() {
        let mut ids = allocator();
        let highest_offset = ids.offset("res_partner", ids.max_source_id("res_partner"));
        let moved = ids.allocate("res_partner");
        assert!(ids.offset("res_partner", moved) > highest_offset);
    }

    #[tokio::test]
    async fn test_initialize_tolerates_missing_id_column() {
        let store = MemoryStore::new()
            .with_max_id(Side::Source, "res_partner", Some(12))
            .with_max_id(Side::Source, "res_groups_users_rel", None)
            .with_max_id(Side::Target, "res_partner", Some(30))
            .with_max_id(Side::Target, "res_groups_users_rel", None);

        let tables = vec!["res_partner".to_string(), "res_groups_users_rel".to_string()];
        let mut ids = IdAllocator::initialize(&store, &tables, &tables, "id")
            .await
            .unwrap();

        assert_eq!(ids.max_source_id("res_partner"), 12);
        assert_eq!(ids.max_target_id("res_groups_users_rel"), 0);
        assert_eq!(ids.allocate("res_partner"), 13);
        assert_eq!(ids.offset("res_partner", 5), 35);
    }
}
