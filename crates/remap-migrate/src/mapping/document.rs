//! Loading and merging of per-module mapping documents.

use indexmap::IndexMap;
use serde_yaml::{Mapping as YamlMapping, Value};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{MigrateError, Result};

const NOTHING_TO_DO: &str = "__nothing_to_do__";
const DISCRIMINATOR_KEY: &str = "__discriminator__";
const STORED_KEY: &str = "__stored__";

/// Body of one module in a mapping document.
#[derive(Debug, Clone)]
enum ModuleBody {
    NothingToDo,
    Entries(YamlMapping),
}

/// All modules read from one or more mapping files.
///
/// When several files define the same module the last one wins.
#[derive(Debug, Clone, Default)]
pub struct MappingDocuments {
    modules: IndexMap<String, ModuleBody>,
}

/// A merged source column entry.
#[derive(Debug, Clone, PartialEq)]
pub enum MergedEntry {
    /// Forgotten by at least one module.
    Forget,
    /// Target key to directive value, in merge order.
    Targets(IndexMap<String, Value>),
}

/// The enabled modules' entries merged into one table.
#[derive(Debug, Clone, Default)]
pub struct MergedMapping {
    pub entries: IndexMap<String, MergedEntry>,
    pub discriminators: IndexMap<String, Vec<String>>,
    pub stored: IndexMap<String, Vec<String>>,
}

impl MappingDocuments {
    /// Read and combine mapping files in order.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut documents = Self::default();
        for path in paths {
            let path = path.as_ref();
            debug!("Reading mapping {}", path.display());
            let content = std::fs::read_to_string(path)?;
            documents.add_yaml(&content)?;
        }
        Ok(documents)
    }

    /// Parse a single mapping document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut documents = Self::default();
        documents.add_yaml(yaml)?;
        Ok(documents)
    }

    /// Add the modules of one document, replacing modules already present.
    pub fn add_yaml(&mut self, yaml: &str) -> Result<()> {
        let root: Value = serde_yaml::from_str(yaml)?;
        let modules = match root {
            Value::Mapping(modules) => modules,
            Value::Null => return Ok(()),
            _ => {
                return Err(MigrateError::Config(
                    "mapping document must be a mapping of module names".to_string(),
                ))
            }
        };

        for (name, body) in modules {
            let name = key_string(&name)?;
            let body = match body {
                Value::String(marker) if marker == NOTHING_TO_DO => ModuleBody::NothingToDo,
                Value::Mapping(entries) => ModuleBody::Entries(entries),
                Value::Null => ModuleBody::Entries(YamlMapping::new()),
                other => {
                    return Err(MigrateError::Config(format!(
                        "module {}: {:?} is invalid here",
                        name, other
                    )))
                }
            };
            self.modules.insert(name, body);
        }
        Ok(())
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Merge the entries of `modules`, in order.
    ///
    /// A source column forgotten by any module stays forgotten; otherwise
    /// later modules add or replace target columns.
    pub fn merge(&self, modules: &[String]) -> Result<MergedMapping> {
        let mut merged = MergedMapping::default();

        for module in modules {
            let entries = match self.modules.get(module) {
                None => {
                    warn!("Mapping is not complete: module {} is missing", module);
                    continue;
                }
                Some(ModuleBody::NothingToDo) => continue,
                Some(ModuleBody::Entries(entries)) => entries,
            };

            for (key, value) in entries {
                let key = key_string(key)?;
                let (table, column) = split_key(&key)
                    .ok_or_else(|| MigrateError::mapping(&key, "", "key must be table.column"))?;

                if column == DISCRIMINATOR_KEY {
                    merged
                        .discriminators
                        .insert(table.to_string(), string_list(&key, value)?);
                    continue;
                }
                if column == STORED_KEY {
                    let stored = merged.stored.entry(table.to_string()).or_default();
                    for column in string_list(&key, value)? {
                        if !stored.contains(&column) {
                            stored.push(column);
                        }
                    }
                    continue;
                }
                if column.starts_with("__") && column.ends_with("__") {
                    warn!("Ignoring unknown mapping marker {} in module {}", key, module);
                    continue;
                }

                merge_entry(&mut merged.entries, &key, value)?;
            }
        }
        Ok(merged)
    }
}

fn merge_entry(entries: &mut IndexMap<String, MergedEntry>, key: &str, value: &Value) -> Result<()> {
    let is_forget = matches!(value, Value::Bool(false))
        || matches!(value, Value::String(marker) if marker.trim() == "__forget__");
    if is_forget {
        entries.insert(key.to_string(), MergedEntry::Forget);
        return Ok(());
    }

    let targets = match value {
        Value::Null => YamlMapping::new(),
        Value::Mapping(targets) => targets.clone(),
        other => {
            return Err(MigrateError::mapping(
                key,
                "",
                format!("{:?} is invalid here", other),
            ))
        }
    };

    let entry = entries
        .entry(key.to_string())
        .or_insert_with(|| MergedEntry::Targets(IndexMap::new()));
    if let MergedEntry::Targets(existing) = entry {
        for (target, directive) in targets {
            let target = key_string(&target)?;
            existing.insert(target, directive);
        }
    }
    Ok(())
}

fn key_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(MigrateError::Config(format!(
            "mapping keys must be strings, got {:?}",
            other
        ))),
    }
}

/// Split `table.column` at the first dot.
pub(crate) fn split_key(key: &str) -> Option<(&str, &str)> {
    match key.split_once('.') {
        Some((table, column)) if !table.is_empty() && !column.is_empty() => Some((table, column)),
        _ => None,
    }
}

fn string_list(key: &str, value: &Value) -> Result<Vec<String>> {
    match value {
        Value::Sequence(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(MigrateError::mapping(
                    key,
                    "",
                    format!("expected a list of column names, found {:?}", other),
                )),
            })
            .collect(),
        Value::Null => Ok(Vec::new()),
        other => Err(MigrateError::mapping(
            key,
            "",
            format!("expected a list of column names, found {:?}", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
base:
  res_partner.name:
    res_partner.name: __copy__
  res_partner.fax:
    res_partner.fax:
  res_partner.__discriminator__: [email]
  res_partner.__stored__: [display_name]
account: __nothing_to_do__
crm:
  res_partner.fax: __forget__
  res_partner.name:
    crm_lead.contact_name:
  res_partner.__stored__: [display_name, commercial_partner_id]
"#;

    fn modules(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_merge_adds_targets_in_module_order() {
        let docs = MappingDocuments::from_yaml(BASE).unwrap();
        let merged = docs.merge(&modules(&["base", "account", "crm"])).unwrap();

        match &merged.entries["res_partner.name"] {
            MergedEntry::Targets(targets) => {
                let keys: Vec<&String> = targets.keys().collect();
                assert_eq!(keys, vec!["res_partner.name", "crm_lead.contact_name"]);
            }
            other => panic!("unexpected entry {:?}", other),
        }
        assert_eq!(merged.discriminators["res_partner"], vec!["email"]);
        assert_eq!(
            merged.stored["res_partner"],
            vec!["display_name", "commercial_partner_id"]
        );
    }

    #[test]
    fn test_forget_is_sticky_in_any_order() {
        let docs = MappingDocuments::from_yaml(BASE).unwrap();
        for order in [&["base", "crm"], &["crm", "base"]] {
            let merged = docs.merge(&modules(order)).unwrap();
            assert_eq!(merged.entries["res_partner.fax"], MergedEntry::Forget);
        }
    }

    #[test]
    fn test_missing_and_disabled_modules_are_skipped() {
        let docs = MappingDocuments::from_yaml(BASE).unwrap();
        let merged = docs.merge(&modules(&["account", "sale"])).unwrap();
        assert!(merged.entries.is_empty());
        assert!(merged.discriminators.is_empty());
    }

    #[test]
    fn test_later_document_replaces_module() {
        let mut docs = MappingDocuments::from_yaml(BASE).unwrap();
        docs.add_yaml("crm:\n  crm_lead.name:\n").unwrap();
        let merged = docs.merge(&modules(&["crm"])).unwrap();
        assert_eq!(merged.entries.len(), 1);
        assert!(merged.entries.contains_key("crm_lead.name"));
        assert_eq!(docs.module_names().count(), 3);
    }

    #[test]
    fn test_invalid_entries() {
        let docs = MappingDocuments::from_yaml("base:\n  res_partner: 3\n").unwrap();
        let err = docs.merge(&modules(&["base"])).unwrap_err();
        assert!(err.to_string().contains("key must be table.column"));

        let docs = MappingDocuments::from_yaml("base:\n  res_partner.name: 3\n").unwrap();
        assert!(docs.merge(&modules(&["base"])).is_err());

        assert!(MappingDocuments::from_yaml("- a\n- b\n").is_err());
    }
}
