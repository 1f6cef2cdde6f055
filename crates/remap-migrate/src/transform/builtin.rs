//! Built-in transforms.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::debug;

use super::{ColumnTransform, TransformContext, TransformOutput};
use crate::error::{MigrateError, Result};
use crate::store::identifier::{quote_literal, quote_pg, validate_identifier};
use crate::store::Side;

/// `newid`: a fresh identifier for the target table.
#[derive(Debug)]
pub struct NewId;

#[async_trait]
impl ColumnTransform for NewId {
    fn name(&self) -> &str {
        "newid"
    }

    async fn apply(&self, ctx: &mut TransformContext<'_>) -> Result<TransformOutput> {
        let id = ctx.ids.allocate(ctx.target_table);
        Ok(TransformOutput::Value(id.to_string()))
    }
}

/// `value <literal>`: a constant.
#[derive(Debug)]
pub struct LiteralValue {
    value: String,
}

impl LiteralValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

#[async_trait]
impl ColumnTransform for LiteralValue {
    fn name(&self) -> &str {
        "value"
    }

    async fn apply(&self, _ctx: &mut TransformContext<'_>) -> Result<TransformOutput> {
        Ok(TransformOutput::Value(self.value.clone()))
    }
}

/// `column <name>`: the value of another column of the source row.
#[derive(Debug)]
pub struct ColumnValue {
    column: String,
}

impl ColumnValue {
    pub fn new(column: &str) -> Self {
        Self {
            column: column.to_string(),
        }
    }
}

#[async_trait]
impl ColumnTransform for ColumnValue {
    fn name(&self) -> &str {
        "column"
    }

    async fn apply(&self, ctx: &mut TransformContext<'_>) -> Result<TransformOutput> {
        match ctx.source_row.get(&self.column) {
            Some(value) => Ok(TransformOutput::Value(value.clone())),
            None => Err(MigrateError::transform(
                ctx.source_table,
                format!("no column {} in source row", self.column),
            )),
        }
    }
}

/// `map from=to ...`: translate values, passing unknown ones through.
#[derive(Debug)]
pub struct ValueMap {
    values: HashMap<String, String>,
}

impl ValueMap {
    pub fn parse(args: &[String]) -> std::result::Result<Self, String> {
        let values = args
            .iter()
            .map(|pair| {
                pair.split_once('=')
                    .map(|(from, to)| (from.to_string(), to.to_string()))
                    .ok_or_else(|| format!("map expects from=to pairs, got '{}'", pair))
            })
            .collect::<std::result::Result<_, _>>()?;
        Ok(Self { values })
    }
}

#[async_trait]
impl ColumnTransform for ValueMap {
    fn name(&self) -> &str {
        "map"
    }

    async fn apply(&self, ctx: &mut TransformContext<'_>) -> Result<TransformOutput> {
        let value = ctx.value();
        let mapped = self.values.get(value).map(String::as_str).unwrap_or(value);
        Ok(TransformOutput::Value(mapped.to_string()))
    }
}

/// `discard_if_empty`: drop the target row when the value is empty.
#[derive(Debug)]
pub struct DiscardIfEmpty;

#[async_trait]
impl ColumnTransform for DiscardIfEmpty {
    fn name(&self) -> &str {
        "discard_if_empty"
    }

    async fn apply(&self, ctx: &mut TransformContext<'_>) -> Result<TransformOutput> {
        if ctx.value().is_empty() {
            return Ok(TransformOutput::DiscardRow);
        }
        Ok(TransformOutput::Value(ctx.value().to_string()))
    }
}

/// `discard_unless <column> <value>`: keep the target row only when a source
/// column holds the given value.
#[derive(Debug)]
pub struct DiscardUnless {
    column: String,
    expected: String,
}

impl DiscardUnless {
    pub fn new(column: &str, expected: &str) -> Self {
        Self {
            column: column.to_string(),
            expected: expected.to_string(),
        }
    }
}

#[async_trait]
impl ColumnTransform for DiscardUnless {
    fn name(&self) -> &str {
        "discard_unless"
    }

    async fn apply(&self, ctx: &mut TransformContext<'_>) -> Result<TransformOutput> {
        let actual = ctx.source_row.get(&self.column).map(String::as_str);
        if actual != Some(self.expected.as_str()) {
            return Ok(TransformOutput::DiscardRow);
        }
        Ok(TransformOutput::Value(ctx.value().to_string()))
    }
}

/// `fk_lookup <table> <key_column> [strict]`: translate a source identifier
/// of `table` into the target identifier of the record sharing the same
/// natural key.
///
/// Both sides are read once and cached for the rest of the run. A value with
/// no counterpart becomes NULL, or an error in strict mode.
#[derive(Debug)]
pub struct FkLookup {
    table: String,
    key_column: String,
    strict: bool,
    cache: OnceCell<HashMap<String, String>>,
}

impl FkLookup {
    pub fn parse(args: &[String]) -> std::result::Result<Self, String> {
        for name in &args[..2] {
            validate_identifier(name).map_err(|e| e.to_string())?;
        }
        let strict = match args.get(2).map(String::as_str) {
            None => false,
            Some("strict") => true,
            Some(other) => return Err(format!("fk_lookup: unknown option '{}'", other)),
        };
        Ok(Self {
            table: args[0].clone(),
            key_column: args[1].clone(),
            strict,
            cache: OnceCell::new(),
        })
    }

    async fn load(&self, ctx: &TransformContext<'_>) -> Result<HashMap<String, String>> {
        let sql = format!(
            "SELECT {}, {} FROM {}",
            quote_pg(&self.key_column)?,
            quote_pg(ctx.id_column)?,
            quote_pg(&self.table)?
        );

        let mut by_key = HashMap::new();
        for row in ctx.store.query_text(Side::Source, &sql).await? {
            if let [Some(key), Some(id)] = row.as_slice() {
                by_key.insert(key.clone(), id.clone());
            }
        }

        let mut ids = HashMap::new();
        for row in ctx.store.query_text(Side::Target, &sql).await? {
            if let [Some(key), Some(target_id)] = row.as_slice() {
                if let Some(source_id) = by_key.get(key) {
                    ids.insert(source_id.clone(), target_id.clone());
                }
            }
        }
        debug!(
            "fk_lookup {}.{}: {} identifiers matched",
            self.table,
            self.key_column,
            ids.len()
        );
        Ok(ids)
    }
}

#[async_trait]
impl ColumnTransform for FkLookup {
    fn name(&self) -> &str {
        "fk_lookup"
    }

    async fn apply(&self, ctx: &mut TransformContext<'_>) -> Result<TransformOutput> {
        let ctx: &TransformContext<'_> = ctx;
        let value = ctx.value();
        if value.is_empty() {
            return Ok(TransformOutput::Value(String::new()));
        }
        let ids = self.cache.get_or_try_init(|| self.load(ctx)).await?;
        match ids.get(value) {
            Some(id) => Ok(TransformOutput::Value(id.clone())),
            None if self.strict => Err(MigrateError::transform(
                ctx.source_table,
                format!(
                    "{}: no {} record matches {}.{} of id {}",
                    ctx.source_column, self.table, self.table, self.key_column, value
                ),
            )),
            None => Ok(TransformOutput::Value(String::new())),
        }
    }
}

/// `sql <source|target> <query>`: the first cell of a read-only query.
///
/// `$value` in the query is replaced by the quoted current value.
#[derive(Debug)]
pub struct SqlValue {
    side: Side,
    query: String,
}

impl SqlValue {
    pub fn parse(args: &[String]) -> std::result::Result<Self, String> {
        let side = args[0].parse::<Side>().map_err(|e| e.to_string())?;
        Ok(Self {
            side,
            query: args[1..].join(" "),
        })
    }

    fn render(&self, value: &str) -> String {
        self.query.replace("$value", &quote_literal(value))
    }
}

#[async_trait]
impl ColumnTransform for SqlValue {
    fn name(&self) -> &str {
        "sql"
    }

    async fn apply(&self, ctx: &mut TransformContext<'_>) -> Result<TransformOutput> {
        let sql = self.render(ctx.value());
        let rows = ctx.store.query_text(self.side, &sql).await?;
        let first = rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .flatten()
            .unwrap_or_default();
        Ok(TransformOutput::Value(first))
    }
}
