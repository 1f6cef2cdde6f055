//! Order in which source tables are transformed.

use std::collections::BTreeSet;

use crate::mapping::{ForeignKeyMap, Mapping};

/// Put the tables that discriminator columns point at in front of the
/// tables whose discriminators reference them, and `process_last` tables at
/// the very end.
///
/// Only a best-effort ordering: a discriminated table pointing at a table
/// that is itself discriminated through a foreign key may still run first.
pub fn processing_order(
    tables: &[String],
    mapping: &Mapping,
    foreign_keys: &ForeignKeyMap,
    process_last: &[String],
) -> Vec<String> {
    let mut pointed: BTreeSet<&str> = BTreeSet::new();
    for (table, columns) in mapping.all_discriminators() {
        for column in columns {
            if let Some(referenced) = foreign_keys.get(&format!("{}.{}", table, column)) {
                pointed.insert(referenced.as_str());
            }
        }
    }

    let is_last = |table: &str| process_last.iter().any(|t| t == table);
    let has_fk_discriminator = |table: &str| {
        mapping
            .discriminators(table)
            .iter()
            .any(|column| foreign_keys.contains_key(&format!("{}.{}", table, column)))
    };

    let mut first: Vec<String> = Vec::new();
    for table in pointed.iter().copied() {
        if is_last(table) || !tables.iter().any(|t| t == table) {
            continue;
        }
        if has_fk_discriminator(table) {
            first.push(table.to_string());
        } else {
            first.insert(0, table.to_string());
        }
    }

    let middle = tables
        .iter()
        .filter(|t| !pointed.contains(t.as_str()) && !is_last(t.as_str()))
        .cloned();
    let last = process_last
        .iter()
        .filter(|t| tables.contains(*t))
        .cloned();

    first.into_iter().chain(middle).chain(last).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingDocuments;
    use crate::transform::TransformRegistry;
    use std::collections::HashMap;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
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

    #[test]
    fn test_referenced_tables_first_and_process_last_at_end() {
        let mapping = mapping(
            r#"
base:
  res_users.__discriminator__: [login]
  res_partner.__discriminator__: [name, country_id]
  res_groups_users_rel.__discriminator__: [gid, uid]
"#,
        );
        let foreign_keys: ForeignKeyMap = HashMap::from([
            ("res_partner.country_id".to_string(), "res_country".to_string()),
            ("res_groups_users_rel.uid".to_string(), "res_users".to_string()),
            ("res_groups_users_rel.gid".to_string(), "res_groups".to_string()),
        ]);
        let tables = strings(&[
            "ir_property",
            "res_groups_users_rel",
            "res_partner",
            "res_users",
            "res_country",
        ]);

        let order = processing_order(&tables, &mapping, &foreign_keys, &strings(&["ir_property"]));

        assert_eq!(
            order,
            strings(&[
                "res_users",
                "res_country",
                "res_groups_users_rel",
                "res_partner",
                "ir_property",
            ])
        );
    }

    #[test]
    fn test_keeps_order_without_discriminators() {
        let mapping = mapping("base:\n  t1.a:\n");
        let tables = strings(&["b", "a", "c"]);
        let order = processing_order(&tables, &mapping, &HashMap::new(), &strings(&["ir_property"]));
        assert_eq!(order, tables);
    }
}
