//! Mapping compiler.
//!
//! Mapping documents are keyed by module, then by `source_table.source_column`,
//! with `target_table.target_column: directive` pairs underneath:
//!
//! ```yaml
//! base:
//!   res_partner.id:
//!     res_partner.id: __copy__
//!   res_partner.parent_id:
//!     res_partner.parent_id: __defer__
//!   res_partner.state:
//!     res_partner.active: map draft=f done=t
//!   res_partner.__discriminator__: [email]
//!   res_partner_address.*:
//!     res_partner.*:
//! ```
//!
//! [`Mapping::compile`] merges the enabled modules and resolves every
//! directive once. The result is immutable for the rest of the run.

pub mod directive;
mod document;

pub use document::{MappingDocuments, MergedEntry, MergedMapping};

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use self::directive::Directive;
use self::document::split_key;
use crate::error::{MigrateError, Result};
use crate::transform::{ColumnTransform, TransformRegistry};

/// Target `table.column` to the table its values reference.
pub type ForeignKeyMap = HashMap<String, String>;

/// Name of the synthetic source column used to fill target-only columns.
pub const SYNTHETIC_COLUMN: &str = "_";

/// How one target column is produced from one source column.
#[derive(Clone)]
pub enum Transform {
    Copy,
    /// Remove the target column from the row being built.
    Forget,
    /// Give the row a fresh identifier and remember the old one.
    Moved,
    /// Copy, then resolve the polymorphic pointer after all tables ran.
    Reference(String),
    Function(Arc<dyn ColumnTransform>),
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Copy => f.write_str("Copy"),
            Transform::Forget => f.write_str("Forget"),
            Transform::Moved => f.write_str("Moved"),
            Transform::Reference(column) => f.debug_tuple("Reference").field(column).finish(),
            Transform::Function(function) => {
                f.debug_tuple("Function").field(&function.name()).finish()
            }
        }
    }
}

/// One resolved target of a source column.
#[derive(Debug, Clone)]
pub struct TargetColumn {
    pub table: String,
    pub column: String,
    pub transform: Transform,
}

#[derive(Debug, Clone)]
enum SourceEntry {
    Forget,
    Targets(Vec<TargetColumn>),
}

/// The columns of one source table with their resolved targets.
#[derive(Debug, Clone)]
pub struct TablePlan {
    pub table: String,
    pub columns: Vec<(String, Vec<TargetColumn>)>,
}

/// The compiled mapping.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    entries: HashMap<String, SourceEntry>,
    discriminators: HashMap<String, Vec<String>>,
    deferred: HashMap<String, BTreeSet<String>>,
    foreign_keys: ForeignKeyMap,
    references: HashMap<String, String>,
    stored: HashMap<String, Vec<String>>,
}

/// Printable overview of a compiled mapping.
#[derive(Debug, Clone, Serialize)]
pub struct MappingSummary {
    pub source_columns: usize,
    pub forgotten_columns: usize,
    pub target_tables: Vec<String>,
    pub discriminators: BTreeMap<String, Vec<String>>,
    pub deferred: BTreeMap<String, Vec<String>>,
    pub foreign_keys: BTreeMap<String, String>,
    pub references: BTreeMap<String, String>,
    pub stored: BTreeMap<String, Vec<String>>,
}

impl Mapping {
    /// Read mapping files and compile them for the enabled modules.
    pub fn load<P: AsRef<Path>>(
        paths: &[P],
        modules: &[String],
        registry: &TransformRegistry,
        drop_foreign_keys: bool,
    ) -> Result<Self> {
        let documents = MappingDocuments::load(paths)?;
        Self::compile(documents.merge(modules)?, registry, drop_foreign_keys)
    }

    /// Resolve every directive of a merged mapping.
    ///
    /// Deferred columns are not recorded when foreign keys are dropped for the
    /// load, since the insert can then carry them directly.
    pub fn compile(
        merged: MergedMapping,
        registry: &TransformRegistry,
        drop_foreign_keys: bool,
    ) -> Result<Self> {
        let mut mapping = Mapping {
            discriminators: merged.discriminators.into_iter().collect(),
            stored: merged.stored.into_iter().collect(),
            ..Default::default()
        };

        for (source, entry) in merged.entries {
            let targets = match entry {
                MergedEntry::Forget => {
                    mapping.entries.insert(source, SourceEntry::Forget);
                    continue;
                }
                MergedEntry::Targets(targets) => targets,
            };

            let mut resolved = Vec::with_capacity(targets.len());
            for (target, value) in targets {
                let (table, column) = split_key(&target).ok_or_else(|| {
                    MigrateError::mapping(&source, &target, "target must be table.column")
                })?;
                let directive = Directive::parse(&value)
                    .map_err(|message| MigrateError::mapping(&source, &target, message))?;

                let transform = match directive {
                    Directive::Copy => Transform::Copy,
                    Directive::Forget => Transform::Forget,
                    Directive::Moved => Transform::Moved,
                    Directive::Defer => {
                        if !drop_foreign_keys {
                            mapping
                                .deferred
                                .entry(table.to_string())
                                .or_default()
                                .insert(column.to_string());
                        }
                        Transform::Copy
                    }
                    Directive::ForeignKey(referenced) => {
                        mapping.foreign_keys.insert(target.clone(), referenced);
                        Transform::Copy
                    }
                    Directive::Reference(ref_column) => {
                        mapping
                            .references
                            .insert(target.clone(), ref_column.clone());
                        Transform::Reference(ref_column)
                    }
                    Directive::Function(expression) => {
                        let function = registry
                            .resolve(&expression)
                            .map_err(|message| MigrateError::mapping(&source, &target, message))?;
                        Transform::Function(function)
                    }
                };

                resolved.push(TargetColumn {
                    table: table.to_string(),
                    column: column.to_string(),
                    transform,
                });
            }
            mapping.entries.insert(source, SourceEntry::Targets(resolved));
        }

        debug!(
            "Compiled mapping: {} source columns, {} discriminated tables, {} foreign keys",
            mapping.entries.len(),
            mapping.discriminators.len(),
            mapping.foreign_keys.len()
        );
        Ok(mapping)
    }

    /// Targets of `table.column`, falling back to `table.*` then `*.*`.
    ///
    /// `None` means the column is not mapped at all; an empty list means it
    /// is mapped to nothing (forgotten).
    pub fn targets(&self, table: &str, column: &str) -> Option<Vec<TargetColumn>> {
        let key = format!("{}.{}", table, column);
        if let Some(entry) = self.entries.get(&key) {
            return Some(match entry {
                SourceEntry::Forget => Vec::new(),
                SourceEntry::Targets(targets) => targets.clone(),
            });
        }

        match self.entries.get(&format!("{}.*", table)) {
            Some(SourceEntry::Forget) => Some(Vec::new()),
            Some(SourceEntry::Targets(targets)) if targets.is_empty() => {
                Some(vec![copy_through(table, column)])
            }
            Some(SourceEntry::Targets(targets)) => Some(
                targets
                    .iter()
                    .map(|target| TargetColumn {
                        table: target.table.replace('*', column),
                        column: target.column.replace('*', column),
                        transform: target.transform.clone(),
                    })
                    .collect(),
            ),
            None if self.entries.contains_key("*.*") => Some(vec![copy_through(table, column)]),
            None => None,
        }
    }

    /// Resolve the targets of every column of a source table, plus the
    /// synthetic column. Unmapped columns are left out.
    pub fn plan(&self, table: &str, headers: &[String]) -> TablePlan {
        let columns = headers
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(SYNTHETIC_COLUMN))
            .filter_map(|column| {
                self.targets(table, column)
                    .map(|targets| (column.to_string(), targets))
            })
            .collect();
        TablePlan {
            table: table.to_string(),
            columns,
        }
    }

    /// Sorted target columns of every target table reachable from the given
    /// source tables and their headers.
    pub fn target_columns(&self, sources: &[(String, Vec<String>)]) -> BTreeMap<String, Vec<String>> {
        let mut columns: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (table, headers) in sources {
            for header in headers.iter().map(String::as_str).chain([SYNTHETIC_COLUMN]) {
                match self.targets(table, header) {
                    None if header != SYNTHETIC_COLUMN => {
                        warn!("No mapping definition found for column {}.{}", table, header);
                    }
                    None => {}
                    Some(targets) => {
                        for target in targets {
                            let entry = columns.entry(target.table).or_default();
                            if target.column != SYNTHETIC_COLUMN {
                                entry.insert(target.column);
                            }
                        }
                    }
                }
            }
        }
        columns
            .into_iter()
            .map(|(table, columns)| (table, columns.into_iter().collect()))
            .collect()
    }

    pub fn discriminators(&self, table: &str) -> &[String] {
        self.discriminators
            .get(table)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every table with a discriminator set, with its columns.
    pub fn all_discriminators(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.discriminators
            .iter()
            .map(|(table, columns)| (table.as_str(), columns.as_slice()))
    }

    pub fn deferred(&self, table: &str) -> Option<&BTreeSet<String>> {
        self.deferred.get(table)
    }

    /// Foreign keys declared with `__fk__`.
    pub fn foreign_keys(&self) -> &ForeignKeyMap {
        &self.foreign_keys
    }

    /// Column naming the referenced table of a `__ref__` target column.
    pub fn reference(&self, table: &str, column: &str) -> Option<&str> {
        self.references
            .get(&format!("{}.{}", table, column))
            .map(String::as_str)
    }

    pub fn stored(&self, table: &str) -> &[String] {
        self.stored.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn summary(&self) -> MappingSummary {
        let mut target_tables = BTreeSet::new();
        let mut forgotten_columns = 0;
        for entry in self.entries.values() {
            match entry {
                SourceEntry::Forget => forgotten_columns += 1,
                SourceEntry::Targets(targets) => {
                    target_tables.extend(
                        targets
                            .iter()
                            .filter(|t| !t.table.contains('*'))
                            .map(|t| t.table.clone()),
                    );
                }
            }
        }

        MappingSummary {
            source_columns: self.entries.len(),
            forgotten_columns,
            target_tables: target_tables.into_iter().collect(),
            discriminators: self.discriminators.clone().into_iter().collect(),
            deferred: self
                .deferred
                .iter()
                .map(|(table, columns)| (table.clone(), columns.iter().cloned().collect()))
                .collect(),
            foreign_keys: self.foreign_keys.clone().into_iter().collect(),
            references: self.references.clone().into_iter().collect(),
            stored: self.stored.clone().into_iter().collect(),
        }
    }
}

fn copy_through(table: &str, column: &str) -> TargetColumn {
    TargetColumn {
        table: table.to_string(),
        column: column.to_string(),
        transform: Transform::Copy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
base:
  t1.id:
    t2.id:
  t1.name:
    t2.label: __copy__
  t1.parent_id:
    t2.parent_id: __defer__
  t1.partner_id:
    t2.partner_id: __fk__ res_partner
  t1.res_id:
    t2.res_id: __ref__ model
  t1.state:
    t2.state: map draft=new
  t1.fax: __forget__
  t1.__discriminator__: [label]
  legacy.*:
    t3.old_*:
  notes.*:
  audit.*: false
  t3.__stored__: [total]
"#;

    fn compile(yaml: &str, drop_fk: bool) -> Result<Mapping> {
        let docs = MappingDocuments::from_yaml(yaml)?;
        Mapping::compile(
            docs.merge(&["base".to_string()])?,
            &TransformRegistry::builtin(),
            drop_fk,
        )
    }

    fn names(targets: &[TargetColumn]) -> Vec<String> {
        targets
            .iter()
            .map(|t| format!("{}.{}", t.table, t.column))
            .collect()
    }

    #[test]
    fn test_compile_annotations() {
        let mapping = compile(DOC, false).unwrap();
        assert!(mapping.deferred("t2").unwrap().contains("parent_id"));
        assert_eq!(mapping.foreign_keys()["t2.partner_id"], "res_partner");
        assert_eq!(mapping.reference("t2", "res_id"), Some("model"));
        assert_eq!(mapping.discriminators("t1"), ["label"]);
        assert_eq!(mapping.stored("t3"), ["total"]);
        assert!(mapping.discriminators("t2").is_empty());

        let targets = mapping.targets("t1", "state").unwrap();
        assert!(matches!(&targets[0].transform, Transform::Function(f) if f.name() == "map"));
        assert!(matches!(
            mapping.targets("t1", "parent_id").unwrap()[0].transform,
            Transform::Copy
        ));
    }

    #[test]
    fn test_defer_not_recorded_when_dropping_foreign_keys() {
        let mapping = compile(DOC, true).unwrap();
        assert!(mapping.deferred("t2").is_none());
    }

    #[test]
    fn test_wildcards() {
        let mapping = compile(DOC, false).unwrap();
        assert_eq!(names(&mapping.targets("t1", "name").unwrap()), vec!["t2.label"]);
        assert!(mapping.targets("t1", "fax").unwrap().is_empty());
        assert!(mapping.targets("t1", "unknown").is_none());
        assert_eq!(
            names(&mapping.targets("legacy", "code").unwrap()),
            vec!["t3.old_code"]
        );
        assert_eq!(names(&mapping.targets("notes", "body").unwrap()), vec!["notes.body"]);
        assert!(mapping.targets("audit", "body").unwrap().is_empty());

        let everything = compile("base:\n  '*.*':\n  t1.name:\n    t2.label:\n", false).unwrap();
        assert_eq!(names(&everything.targets("t1", "name").unwrap()), vec!["t2.label"]);
        assert_eq!(names(&everything.targets("t9", "x").unwrap()), vec!["t9.x"]);
    }

    #[test]
    fn test_malformed_directive_names_column_pair() {
        let err = compile("base:\n  t1.partner_id:\n    t2.partner_id: __fk__\n", false).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("t1.partner_id -> t2.partner_id"), "{}", text);

        let err = compile("base:\n  t1.a:\n    t2.a: nosuchfunction 1\n", false).unwrap_err();
        assert!(matches!(err, MigrateError::Mapping { .. }));

        let err = compile("base:\n  t1.a:\n    t2: __copy__\n", false).unwrap_err();
        assert!(err.to_string().contains("target must be table.column"));
    }

    #[test]
    fn test_target_columns_and_plan() {
        let mapping = compile(DOC, false).unwrap();
        let sources = vec![(
            "t1".to_string(),
            vec!["id".to_string(), "name".to_string(), "fax".to_string(), "zip".to_string()],
        )];
        let columns = mapping.target_columns(&sources);
        assert_eq!(columns["t2"], vec!["id", "label"]);

        let plan = mapping.plan("t1", &sources[0].1);
        let planned: Vec<&str> = plan.columns.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(planned, vec!["id", "name", "fax"]);
    }

    #[test]
    fn test_summary() {
        let summary = compile(DOC, false).unwrap().summary();
        assert_eq!(summary.forgotten_columns, 2);
        assert_eq!(summary.target_tables, vec!["t2", "t3"]);
        assert_eq!(summary.deferred["t2"], vec!["parent_id"]);
    }
}
