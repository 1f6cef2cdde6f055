//! Second pass: resolve foreign keys and polymorphic references once every
//! table has been transformed.

use tracing::debug;

use super::{RunState, TransformEnv};
use crate::error::Result;
use crate::ids::parse_id;
use crate::interchange::Row;

/// Rewrites first-pass rows using the completed identifier remap.
pub struct ReferenceFixer<'a> {
    env: TransformEnv<'a>,
    state: &'a RunState,
}

impl<'a> ReferenceFixer<'a> {
    pub fn new(env: TransformEnv<'a>, state: &'a RunState) -> Self {
        Self { env, state }
    }

    /// Final identifier of a source identifier of `table`: the remapped one
    /// when the row was matched or moved, the offset one otherwise.
    pub fn resolve(&self, table: &str, id: i64) -> i64 {
        self.state
            .remap
            .get(table, id)
            .unwrap_or_else(|| self.state.ids.offset(table, id))
    }

    /// Fix one row of `table`. `None` means the row already exists in the
    /// target and must not be written.
    pub fn postprocess(&self, table: &str, row: &Row) -> Result<Option<Row>> {
        let mut fixed = row.clone();

        for (column, value) in row {
            if value.is_empty() {
                continue;
            }
            let field = format!("{}.{}", table, column);

            if let Some(referenced) = self.env.foreign_keys.get(&field) {
                let id = parse_id(table, column, value)?;
                fixed.insert(column.clone(), self.resolve(referenced, id).to_string());
            } else if let Some(ref_column) = self.env.mapping.reference(table, column) {
                if let Some(resolved) = self.resolve_reference(row, column, ref_column, value) {
                    fixed.insert(column.clone(), resolved);
                }
            }
        }

        if !fixed.contains_key(self.env.id_column) {
            let discriminators = self.env.mapping.discriminators(table);
            if !discriminators.is_empty() {
                let values: Vec<String> = discriminators
                    .iter()
                    .map(|d| fixed.get(d).cloned().unwrap_or_default())
                    .collect();
                if self.env.existing.contains(table, &values) {
                    return Ok(None);
                }
            }
        }
        Ok(Some(fixed))
    }

    /// A reference is either `model,id` in the column itself, or an id whose
    /// model is named by a sibling column. Model names map to tables by
    /// replacing dots with underscores.
    fn resolve_reference(&self, row: &Row, column: &str, ref_column: &str, value: &str) -> Option<String> {
        if ref_column == column {
            let (model, id) = value.split_once(',')?;
            let Ok(id) = id.trim().parse::<i64>() else {
                debug!("Leaving unparseable reference {:?} in {}", value, column);
                return None;
            };
            let resolved = self.resolve(&model.replace('.', "_"), id);
            return Some(format!("{},{}", model, resolved));
        }

        let model = row.get(ref_column).filter(|m| !m.is_empty())?;
        let Ok(id) = value.trim().parse::<i64>() else {
            debug!("Leaving unparseable reference {:?} in {}", value, column);
            return None;
        };
        Some(self.resolve(&model.replace('.', "_"), id).to_string())
    }
}
