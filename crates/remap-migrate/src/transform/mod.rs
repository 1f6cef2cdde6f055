//! Named column transforms.
//!
//! A mapping directive that is not one of the built-in markers names a
//! transform: the first whitespace-separated token selects an entry of the
//! [`TransformRegistry`] and the remaining tokens are its arguments. Resolution
//! happens once, when the mapping is compiled; rows only ever see the resolved
//! [`ColumnTransform`] object.

mod builtin;

use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::ids::IdAllocator;
use crate::interchange::Row;
use crate::store::StoreQuery;

pub use builtin::{
    ColumnValue, DiscardIfEmpty, DiscardUnless, FkLookup, LiteralValue, NewId, SqlValue,
    ValueMap,
};

/// Result of applying a transform to one column of one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformOutput {
    /// Write this value into the target column.
    Value(String),
    /// Drop the whole target row.
    DiscardRow,
}

/// What a transform may look at and touch while it runs.
pub struct TransformContext<'a> {
    pub source_table: &'a str,
    pub source_column: &'a str,
    pub target_table: &'a str,
    pub target_column: &'a str,
    pub id_column: &'a str,
    /// The source row being transformed.
    pub source_row: &'a Row,
    /// Target rows built so far from this source row, keyed by target table.
    pub target_rows: &'a IndexMap<String, Row>,
    pub ids: &'a mut IdAllocator,
    pub store: &'a dyn StoreQuery,
}

impl TransformContext<'_> {
    /// Current value of the source column, empty for the synthetic column.
    pub fn value(&self) -> &str {
        self.source_row
            .get(self.source_column)
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// A statically typed column transform.
#[async_trait]
pub trait ColumnTransform: Send + Sync {
    /// Registry name, used in logs.
    fn name(&self) -> &str;

    async fn apply(&self, ctx: &mut TransformContext<'_>) -> Result<TransformOutput>;
}

type Factory = Box<dyn Fn(&[String]) -> std::result::Result<Arc<dyn ColumnTransform>, String> + Send + Sync>;

/// Transforms available to mapping directives, by name.
pub struct TransformRegistry {
    factories: HashMap<String, Factory>,
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("TransformRegistry")
            .field("transforms", &names)
            .finish()
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TransformRegistry {
    /// A registry with no transforms.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry holding the built-in transforms.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("newid", |args| {
            expect_args("newid", args, 0, 0)?;
            Ok(Arc::new(NewId) as Arc<dyn ColumnTransform>)
        });
        registry.register("value", |args| {
            expect_args("value", args, 1, usize::MAX)?;
            Ok(Arc::new(LiteralValue::new(args.join(" "))) as Arc<dyn ColumnTransform>)
        });
        registry.register("column", |args| {
            expect_args("column", args, 1, 1)?;
            Ok(Arc::new(ColumnValue::new(&args[0])) as Arc<dyn ColumnTransform>)
        });
        registry.register("map", |args| {
            expect_args("map", args, 1, usize::MAX)?;
            Ok(Arc::new(ValueMap::parse(args)?) as Arc<dyn ColumnTransform>)
        });
        registry.register("discard_if_empty", |args| {
            expect_args("discard_if_empty", args, 0, 0)?;
            Ok(Arc::new(DiscardIfEmpty) as Arc<dyn ColumnTransform>)
        });
        registry.register("discard_unless", |args| {
            expect_args("discard_unless", args, 2, 2)?;
            Ok(Arc::new(DiscardUnless::new(&args[0], &args[1])) as Arc<dyn ColumnTransform>)
        });
        registry.register("fk_lookup", |args| {
            expect_args("fk_lookup", args, 2, 3)?;
            Ok(Arc::new(FkLookup::parse(args)?) as Arc<dyn ColumnTransform>)
        });
        registry.register("sql", |args| {
            expect_args("sql", args, 2, usize::MAX)?;
            Ok(Arc::new(SqlValue::parse(args)?) as Arc<dyn ColumnTransform>)
        });
        registry
    }

    /// Register (or replace) a transform factory under `name`.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&[String]) -> std::result::Result<Arc<dyn ColumnTransform>, String>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Resolve a directive expression such as `map a=b c=d`.
    pub fn resolve(&self, expression: &str) -> std::result::Result<Arc<dyn ColumnTransform>, String> {
        let mut tokens = expression.split_whitespace().map(str::to_string);
        let name = tokens
            .next()
            .ok_or_else(|| "empty transform expression".to_string())?;
        let args: Vec<String> = tokens.collect();
        let factory = self
            .factories
            .get(&name)
            .ok_or_else(|| format!("unknown transform '{}'", name))?;
        factory(&args)
    }
}

fn expect_args(name: &str, args: &[String], min: usize, max: usize) -> std::result::Result<(), String> {
    if args.len() < min || args.len() > max {
        let expected = match (min, max) {
            (min, max) if min == max => format!("{}", min),
            (min, usize::MAX) => format!("at least {}", min),
            (min, max) => format!("{} to {}", min, max),
        };
        return Err(format!(
            "{} takes {} argument(s), got {}",
            name,
            expected,
            args.len()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_builtin() {
        let registry = TransformRegistry::builtin();
        assert_eq!(registry.resolve("newid").unwrap().name(), "newid");
        assert_eq!(registry.resolve("map draft=new done=closed").unwrap().name(), "map");
        assert_eq!(
            registry
                .resolve("sql target SELECT id FROM res_country WHERE code = $value")
                .unwrap()
                .name(),
            "sql"
        );
    }

    #[test]
    fn test_resolve_rejects_unknown_and_bad_arity() {
        let registry = TransformRegistry::builtin();
        let err = registry.resolve("frobnicate x").err().unwrap();
        assert!(err.contains("unknown transform 'frobnicate'"));

        let err = registry.resolve("newid 3").err().unwrap();
        assert_eq!(err, "newid takes 0 argument(s), got 1");

        let err = registry.resolve("discard_unless state").err().unwrap();
        assert!(err.contains("discard_unless takes 2 argument(s)"));

        assert!(registry.resolve("fk_lookup res_country").is_err());
        assert!(registry.resolve("").is_err());
    }

    #[test]
    fn test_register_custom_transform() {
        let mut registry = TransformRegistry::empty();
        assert!(!registry.contains("newid"));
        registry.register("constant", |_| {
            Ok(Arc::new(LiteralValue::new("42")) as Arc<dyn ColumnTransform>)
        });
        assert!(registry.contains("constant"));
        assert_eq!(registry.resolve("constant").unwrap().name(), "value");
    }
}
