//! Which tables take part in a run, and which foreign keys need fixing.

use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

use crate::mapping::ForeignKeyMap;
use crate::store::ForeignKeyRef;

/// Source tables to export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelatedTables {
    /// Sorted tables to export, link tables included.
    pub tables: Vec<String>,
    /// Link tables: no identifier column, two foreign keys into `tables`.
    pub many_to_many: Vec<String>,
}

/// Expand the requested tables with everything they reach through foreign
/// keys, skipping excluded tables, then add the link tables between them.
pub fn related_tables(
    requested: &[String],
    excluded: &[String],
    foreign_keys: &[ForeignKeyRef],
    columns: &HashMap<String, Vec<String>>,
    id_column: &str,
) -> RelatedTables {
    let excluded: HashSet<&str> = excluded.iter().map(String::as_str).collect();
    let mut tables: BTreeSet<String> = BTreeSet::new();
    let mut queue: Vec<&str> = requested
        .iter()
        .map(String::as_str)
        .filter(|t| !excluded.contains(t))
        .collect();

    while let Some(table) = queue.pop() {
        if !tables.insert(table.to_string()) {
            continue;
        }
        for fk in foreign_keys.iter().filter(|fk| fk.table == table) {
            let referenced = fk.referenced_table.as_str();
            if !excluded.contains(referenced) && !tables.contains(referenced) {
                debug!("{} pulls in {} through {}", table, referenced, fk.column);
                queue.push(referenced);
            }
        }
    }

    let mut links: HashMap<&str, Vec<&str>> = HashMap::new();
    for fk in foreign_keys {
        links
            .entry(fk.table.as_str())
            .or_default()
            .push(fk.referenced_table.as_str());
    }
    let mut many_to_many: Vec<String> = links
        .into_iter()
        .filter(|(table, referenced)| {
            referenced.len() == 2
                && !excluded.contains(table)
                && !tables.contains(*table)
                && referenced.iter().all(|r| tables.contains(*r))
                && columns
                    .get(*table)
                    .map(|cols| !cols.iter().any(|c| c == id_column))
                    .unwrap_or(false)
        })
        .map(|(table, _)| table.to_string())
        .collect();
    many_to_many.sort();

    tables.extend(many_to_many.iter().cloned());
    info!(
        "{} tables to export ({} requested, {} link tables)",
        tables.len(),
        requested.len(),
        many_to_many.len()
    );
    RelatedTables {
        tables: tables.into_iter().collect(),
        many_to_many,
    }
}

/// Foreign keys of the target tables, overridden by mapping annotations.
pub fn foreign_keys_to_fix(
    declared: &[ForeignKeyRef],
    target_tables: &[String],
    annotated: &ForeignKeyMap,
) -> ForeignKeyMap {
    let mut keys: ForeignKeyMap = declared
        .iter()
        .filter(|fk| target_tables.contains(&fk.table))
        .map(|fk| (format!("{}.{}", fk.table, fk.column), fk.referenced_table.clone()))
        .collect();
    keys.extend(annotated.iter().map(|(k, v)| (k.clone(), v.clone())));
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fk(table: &str, column: &str, referenced: &str) -> ForeignKeyRef {
        ForeignKeyRef {
            table: table.to_string(),
            column: column.to_string(),
            referenced_table: referenced.to_string(),
        }
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn schema() -> (Vec<ForeignKeyRef>, HashMap<String, Vec<String>>) {
        let fks = vec![
            fk("res_users", "partner_id", "res_partner"),
            fk("res_partner", "country_id", "res_country"),
            fk("res_partner", "create_uid", "res_users"),
            fk("res_country", "write_uid", "ir_model"),
            fk("res_groups_users_rel", "gid", "res_groups"),
            fk("res_groups_users_rel", "uid", "res_users"),
            fk("res_partner_category_rel", "partner_id", "res_partner"),
            fk("res_partner_category_rel", "category_id", "res_partner_category"),
        ];
        let columns = HashMap::from([
            ("res_groups_users_rel".to_string(), strings(&["gid", "uid"])),
            ("res_partner_category_rel".to_string(), strings(&["partner_id", "category_id"])),
        ]);
        (fks, columns)
    }

    #[test]
    fn test_closure_over_foreign_keys() {
        let (fks, columns) = schema();
        let related = related_tables(
            &strings(&["res_users", "res_groups"]),
            &strings(&["ir_model"]),
            &fks,
            &columns,
            "id",
        );
        assert_eq!(
            related.tables,
            strings(&[
                "res_country",
                "res_groups",
                "res_groups_users_rel",
                "res_partner",
                "res_users",
            ])
        );
        assert_eq!(related.many_to_many, strings(&["res_groups_users_rel"]));
    }

    #[test]
    fn test_excluded_requested_table_is_dropped() {
        let (fks, columns) = schema();
        let related = related_tables(&strings(&["ir_model"]), &strings(&["ir_model"]), &fks, &columns, "id");
        assert!(related.tables.is_empty());
    }

    #[test]
    fn test_mapping_annotations_override_declared_keys() {
        let declared = vec![
            fk("res_partner", "parent_id", "res_partner"),
            fk("res_partner", "user_id", "res_users"),
            fk("mail_message", "author_id", "res_partner"),
        ];
        let annotated = ForeignKeyMap::from([(
            "res_partner.user_id".to_string(),
            "res_partner".to_string(),
        )]);
        let keys = foreign_keys_to_fix(&declared, &strings(&["res_partner"]), &annotated);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys["res_partner.parent_id"], "res_partner");
        assert_eq!(keys["res_partner.user_id"], "res_partner");
    }
}
