//! First pass: one source row to insert and update rows of target tables.

use indexmap::IndexMap;
use std::collections::HashSet;

use super::{RunState, TransformEnv};
use crate::error::Result;
use crate::ids::parse_id;
use crate::interchange::Row;
use crate::mapping::{TablePlan, Transform, SYNTHETIC_COLUMN};
use crate::transform::{TransformContext, TransformOutput};

/// Which file of a target table a row goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Insert,
    Update,
}

/// A target row produced by the transformer.
#[derive(Debug, Clone, PartialEq)]
pub struct Emitted {
    pub table: String,
    pub stream: Stream,
    pub row: Row,
}

/// Rewrites source rows, reconciling them with existing target records.
pub struct RowTransformer<'a> {
    env: TransformEnv<'a>,
    state: &'a mut RunState,
}

impl<'a> RowTransformer<'a> {
    pub fn new(env: TransformEnv<'a>, state: &'a mut RunState) -> Self {
        Self { env, state }
    }

    /// Transform one row of the plan's source table.
    pub async fn transform(&mut self, plan: &TablePlan, source_row: &Row) -> Result<Vec<Emitted>> {
        let source_table = plan.table.as_str();
        let mut target_rows: IndexMap<String, Row> = IndexMap::new();
        let mut discarded: HashSet<String> = HashSet::new();

        for (column, targets) in &plan.columns {
            let value = source_row.get(column).map(String::as_str).unwrap_or("");

            for target in targets {
                target_rows.entry(target.table.clone()).or_default();
                if target.column == SYNTHETIC_COLUMN {
                    continue;
                }

                let written = match &target.transform {
                    Transform::Copy | Transform::Reference(_) => Some(value.to_string()),
                    Transform::Forget => {
                        if let Some(row) = target_rows.get_mut(&target.table) {
                            row.shift_remove(&target.column);
                        }
                        None
                    }
                    Transform::Moved => {
                        self.state.moved_tables.insert(source_table.to_string());
                        let new_id = self.state.ids.allocate(&target.table);
                        let original = parse_id(source_table, column, value)?;
                        let final_id = self.state.ids.offset(&target.table, new_id);
                        self.state.remap.insert(source_table, original, final_id);
                        Some(new_id.to_string())
                    }
                    Transform::Function(function) => {
                        let output = {
                            let mut ctx = TransformContext {
                                source_table,
                                source_column: column,
                                target_table: &target.table,
                                target_column: &target.column,
                                id_column: self.env.id_column,
                                source_row,
                                target_rows: &target_rows,
                                ids: &mut self.state.ids,
                                store: self.env.store,
                            };
                            function.apply(&mut ctx).await?
                        };
                        match output {
                            TransformOutput::Value(value) => Some(value),
                            TransformOutput::DiscardRow => {
                                discarded.insert(target.table.clone());
                                None
                            }
                        }
                    }
                };

                if let (Some(written), Some(row)) = (written, target_rows.get_mut(&target.table)) {
                    row.insert(target.column.clone(), written);
                }
            }
        }

        let mut emitted = Vec::with_capacity(target_rows.len());
        for (table, row) in target_rows {
            if discarded.contains(&table) || row.values().all(String::is_empty) {
                continue;
            }
            self.reconcile(source_table, source_row, table, row, &mut emitted)?;
        }
        Ok(emitted)
    }

    /// Route a finished target row to the update stream when it matches an
    /// existing record, otherwise offset it and split deferred columns off.
    fn reconcile(
        &mut self,
        source_table: &str,
        source_row: &Row,
        table: String,
        mut row: Row,
        emitted: &mut Vec<Emitted>,
    ) -> Result<()> {
        let env = self.env;
        let id_column = env.id_column;
        let discriminators = env.mapping.discriminators(&table);
        let row_id = row.get(id_column).cloned();

        if let Some(row_id) = &row_id {
            if !discriminators.is_empty() {
                let values = self.discriminator_values(&table, discriminators, &row);
                let existing_id = if values.iter().all(|v| !v.is_empty()) {
                    env.existing.find_id(&table, &values)
                } else {
                    None
                };

                if let Some(existing_id) = existing_id {
                    let original = parse_id(&table, id_column, row_id)?;
                    self.state.remap.insert(&table, original, existing_id);

                    if self.state.moved_tables.contains(source_table) {
                        let source_value = source_row.get(id_column).map(String::as_str).unwrap_or("");
                        let source_id = parse_id(source_table, id_column, source_value)?;
                        if self.state.remap.contains(source_table, source_id) {
                            self.state.remap.insert(source_table, source_id, existing_id);
                        }
                    }

                    row.insert(id_column.to_string(), existing_id.to_string());
                    emitted.push(Emitted {
                        table,
                        stream: Stream::Update,
                        row,
                    });
                    return Ok(());
                }
            }
        }

        match row_id {
            Some(row_id) => {
                let original = parse_id(&table, id_column, &row_id)?;
                let final_id = self.state.ids.offset(&table, original).to_string();
                row.insert(id_column.to_string(), final_id.clone());

                if let Some(deferred) = env.mapping.deferred(&table) {
                    let mut update = Row::new();
                    update.insert(id_column.to_string(), final_id);
                    for column in deferred {
                        if let Some(value) = row.shift_remove(column) {
                            if !value.is_empty() {
                                update.insert(column.clone(), value);
                            }
                        }
                    }
                    if update.len() > 1 {
                        emitted.push(Emitted {
                            table: table.clone(),
                            stream: Stream::Update,
                            row: update,
                        });
                    }
                }
            }
            None => {
                if row.len() == 2 && row.values().any(String::is_empty) {
                    return Ok(());
                }
            }
        }

        emitted.push(Emitted {
            table,
            stream: Stream::Insert,
            row,
        });
        Ok(())
    }

    /// Discriminator values of a row, with foreign-key values translated
    /// through the identifier remap collected so far.
    fn discriminator_values(&self, table: &str, discriminators: &[String], row: &Row) -> Vec<String> {
        discriminators
            .iter()
            .map(|column| {
                let value = row.get(column).cloned().unwrap_or_default();
                let referenced = match self.env.foreign_keys.get(&format!("{}.{}", table, column)) {
                    Some(referenced) if !value.is_empty() => referenced,
                    _ => return value,
                };
                value
                    .parse::<i64>()
                    .ok()
                    .and_then(|id| self.state.remap.get(referenced, id))
                    .map(|id| id.to_string())
                    .unwrap_or(value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::IdAllocator;
    use crate::mapping::{ForeignKeyMap, Mapping, MappingDocuments};
    use crate::process::ExistingRecords;
    use crate::store::memory::MemoryStore;
    use crate::transform::TransformRegistry;
    use std::collections::HashMap;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn mapping(yaml: &str) -> Mapping {
        let docs = MappingDocuments::from_yaml(yaml).unwrap();
        Mapping::compile(
            docs.merge(&["base".to_string()]).unwrap(),
            &TransformRegistry::builtin(),
            false,
        )
        .unwrap()
    }

    fn state(tables: &[(&str, i64, i64)]) -> RunState {
        let source = tables.iter().map(|(t, s, _)| (t.to_string(), *s)).collect();
        let target = tables.iter().map(|(t, _, m)| (t.to_string(), *m)).collect();
        RunState::new(IdAllocator::new(source, target))
    }

    struct Fixture {
        mapping: Mapping,
        foreign_keys: ForeignKeyMap,
        existing: ExistingRecords,
        store: MemoryStore,
    }

    impl Fixture {
        fn new(yaml: &str) -> Self {
            Self {
                mapping: mapping(yaml),
                foreign_keys: HashMap::new(),
                existing: ExistingRecords::new(),
                store: MemoryStore::new(),
            }
        }

        fn env(&self) -> TransformEnv<'_> {
            TransformEnv {
                mapping: &self.mapping,
                foreign_keys: &self.foreign_keys,
                existing: &self.existing,
                store: &self.store,
                id_column: "id",
            }
        }

        async fn run(&self, state: &mut RunState, table: &str, source: &Row) -> Vec<Emitted> {
            let headers: Vec<String> = source.keys().cloned().collect();
            let plan = self.mapping.plan(table, &headers);
            RowTransformer::new(self.env(), state)
                .transform(&plan, source)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_insert_offsets_identifier() {
        let fixture = Fixture::new(
            "base:\n  t1.id:\n    t2.id:\n  t1.name:\n    t2.label:\n",
        );
        let mut state = state(&[("t2", 1, 100)]);

        let emitted = fixture.run(&mut state, "t1", &row(&[("id", "1"), ("name", "a")])).await;

        assert_eq!(
            emitted,
            vec![Emitted {
                table: "t2".into(),
                stream: Stream::Insert,
                row: row(&[("id", "101"), ("label", "a")]),
            }]
        );
    }

    #[tokio::test]
    async fn test_deferred_column_only_in_update_stream() {
        let fixture = Fixture::new(
            "base:\n  t2.id:\n    t2.id:\n  t2.name:\n    t2.name:\n  t2.parent_id:\n    t2.parent_id: __defer__\n",
        );
        let mut state = state(&[("t2", 5, 100)]);

        let emitted = fixture
            .run(&mut state, "t2", &row(&[("id", "2"), ("name", "child"), ("parent_id", "5")]))
            .await;

        assert_eq!(emitted.len(), 2);
        let update = &emitted[0];
        assert_eq!(update.stream, Stream::Update);
        assert_eq!(update.row, row(&[("id", "102"), ("parent_id", "5")]));
        let insert = &emitted[1];
        assert_eq!(insert.stream, Stream::Insert);
        assert_eq!(insert.row, row(&[("id", "102"), ("name", "child")]));

        let emitted = fixture
            .run(&mut state, "t2", &row(&[("id", "5"), ("name", "root"), ("parent_id", "")]))
            .await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].stream, Stream::Insert);
        assert!(!emitted[0].row.contains_key("parent_id"));
    }

    #[tokio::test]
    async fn test_existing_record_goes_to_update_and_is_remapped() {
        let mut fixture = Fixture::new(
            "base:\n  res_users.id:\n    res_users.id:\n  res_users.login:\n    res_users.login:\n  res_users.__discriminator__: [login]\n",
        );
        fixture
            .existing
            .insert("res_users", vec!["admin".to_string()], Some(1));
        let mut state = state(&[("res_users", 10, 50)]);

        let emitted = fixture
            .run(&mut state, "res_users", &row(&[("id", "3"), ("login", "admin")]))
            .await;
        assert_eq!(emitted[0].stream, Stream::Update);
        assert_eq!(emitted[0].row["id"], "1");
        assert_eq!(state.remap.get("res_users", 3), Some(1));

        let emitted = fixture
            .run(&mut state, "res_users", &row(&[("id", "4"), ("login", "demo")]))
            .await;
        assert_eq!(emitted[0].stream, Stream::Insert);
        assert_eq!(emitted[0].row["id"], "54");
    }

    #[tokio::test]
    async fn test_moved_row_matching_existing_record_remaps_source_id() {
        let mut fixture = Fixture::new(
            "base:\n  old_users.id:\n    res_users.id: __moved__\n  old_users.login:\n    res_users.login:\n  res_users.__discriminator__: [login]\n",
        );
        fixture
            .existing
            .insert("res_users", vec!["admin".to_string()], Some(1));
        let mut state = state(&[("res_users", 10, 50)]);

        let emitted = fixture
            .run(&mut state, "old_users", &row(&[("id", "3"), ("login", "admin")]))
            .await;
        assert_eq!(
            emitted,
            vec![Emitted {
                table: "res_users".into(),
                stream: Stream::Update,
                row: row(&[("id", "1"), ("login", "admin")]),
            }]
        );
        assert!(state.moved_tables.contains("old_users"));
        assert_eq!(state.remap.get("res_users", 11), Some(1));
        assert_eq!(state.remap.get("old_users", 3), Some(1));

        let emitted = fixture
            .run(&mut state, "old_users", &row(&[("id", "4"), ("login", "demo")]))
            .await;
        assert_eq!(emitted[0].stream, Stream::Insert);
        assert_eq!(emitted[0].row["id"], "62");
        assert_eq!(state.remap.get("old_users", 4), Some(62));
    }

    #[tokio::test]
    async fn test_discriminator_foreign_key_corrected_through_remap() {
        let mut fixture = Fixture::new(
            "base:\n  res_partner.id:\n    res_partner.id:\n  res_partner.user_id:\n    res_partner.user_id:\n  res_partner.__discriminator__: [user_id]\n",
        );
        fixture
            .foreign_keys
            .insert("res_partner.user_id".to_string(), "res_users".to_string());
        fixture
            .existing
            .insert("res_partner", vec!["1".to_string()], Some(7));
        let mut state = state(&[("res_partner", 10, 50)]);
        state.remap.insert("res_users", 3, 1);

        let emitted = fixture
            .run(&mut state, "res_partner", &row(&[("id", "9"), ("user_id", "3")]))
            .await;
        assert_eq!(emitted[0].stream, Stream::Update);
        assert_eq!(emitted[0].row["id"], "7");
        assert_eq!(state.remap.get("res_partner", 9), Some(7));
    }

    #[tokio::test]
    async fn test_moved_rows_get_fresh_identifier() {
        let fixture = Fixture::new(
            "base:\n  res_partner_address.id:\n    res_partner.id: __moved__\n  res_partner_address.street:\n    res_partner.street:\n",
        );
        let mut state = state(&[("res_partner", 40, 100)]);

        let emitted = fixture
            .run(&mut state, "res_partner_address", &row(&[("id", "3"), ("street", "Main")]))
            .await;

        assert_eq!(emitted[0].row, row(&[("id", "141"), ("street", "Main")]));
        assert_eq!(state.remap.get("res_partner_address", 3), Some(141));
        assert!(state.moved_tables.contains("res_partner_address"));
    }

    #[tokio::test]
    async fn test_discarded_empty_and_broken_link_rows_are_dropped() {
        let fixture = Fixture::new(
            r#"
base:
  t1.id:
    t2.id:
  t1.email:
    t2.email: discard_if_empty
  rel.a_id:
    rel.a_id:
  rel.b_id:
    rel.b_id:
  t1._:
    t3._:
"#,
        );
        let mut state = state(&[("t2", 0, 0)]);

        let emitted = fixture.run(&mut state, "t1", &row(&[("id", "1"), ("email", "")])).await;
        assert!(emitted.is_empty());

        let emitted = fixture.run(&mut state, "rel", &row(&[("a_id", "1"), ("b_id", "")])).await;
        assert!(emitted.is_empty());

        let emitted = fixture.run(&mut state, "rel", &row(&[("a_id", "1"), ("b_id", "2")])).await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].stream, Stream::Insert);
    }
}
