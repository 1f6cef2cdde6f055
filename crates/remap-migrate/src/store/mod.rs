//! Relational store boundary.
//!
//! The core only needs two capabilities from a database:
//!
//! - [`StoreQuery`]: read-only text queries against the source or the target,
//!   handed to transforms and used for identifier bookkeeping
//! - [`crate::load::LoadTarget`]: savepoint-scoped bulk loading of one file
//!
//! [`postgres::PgStore`] implements both on top of deadpool-postgres pools and
//! also carries the introspection and DDL helpers used by the orchestrator.

pub mod identifier;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{MigrateError, Result};

pub use postgres::{PgSession, PgStore};

/// One result row, every cell rendered as text (`None` is SQL NULL).
pub type TextRow = Vec<Option<String>>;

/// Which database a query runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Source,
    Target,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => f.write_str("source"),
            Side::Target => f.write_str("target"),
        }
    }
}

impl FromStr for Side {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "source" => Ok(Side::Source),
            "target" => Ok(Side::Target),
            other => Err(MigrateError::Config(format!(
                "database side must be 'source' or 'target', got '{}'",
                other
            ))),
        }
    }
}

/// Read-only query capability.
#[async_trait]
pub trait StoreQuery: Send + Sync {
    /// Run a read-only query and return every cell as text.
    async fn query_text(&self, side: Side, sql: &str) -> Result<Vec<TextRow>>;

    /// Maximum identifier stored in `table`.
    ///
    /// Returns `Ok(None)` when the table has no identifier column.
    async fn max_id(&self, side: Side, table: &str, id_column: &str) -> Result<Option<i64>>;
}

/// A declared foreign key column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
    pub referenced_table: String,
}

/// A foreign-key constraint as a paired drop/restore statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintDdl {
    pub table: String,
    pub drop: String,
    pub restore: String,
}
