//! Original to final identifier table.

use std::collections::HashMap;

/// Per-table mapping from original source identifier to final target identifier.
///
/// Filled while rows are transformed (existing-record matches, moved rows) and
/// consulted when foreign keys are fixed in the second pass.
#[derive(Debug, Clone, Default)]
pub struct IdRemap {
    tables: HashMap<String, HashMap<i64, i64>>,
}

impl IdRemap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: &str, original: i64, target: i64) {
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(original, target);
    }

    pub fn get(&self, table: &str, original: i64) -> Option<i64> {
        self.tables.get(table).and_then(|ids| ids.get(&original).copied())
    }

    pub fn contains(&self, table: &str, original: i64) -> bool {
        self.get(table, original).is_some()
    }

    /// Number of remapped identifiers across all tables.
    pub fn len(&self) -> usize {
        self.tables.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
