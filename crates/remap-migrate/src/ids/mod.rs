//! Run-scoped identifier bookkeeping.
//!
//! - [`IdAllocator`]: per-table maximum identifiers and fresh id issuance
//! - [`IdRemap`]: original source identifier to final target identifier
//!
//! Both are owned by one migration run and mutated only by the transformer;
//! the postprocessing pass reads them.

mod allocator;
mod remap;

pub use allocator::IdAllocator;
pub use remap::IdRemap;

use crate::error::{MigrateError, Result};

/// Parse an identifier cell.
pub fn parse_id(table: &str, column: &str, value: &str) -> Result<i64> {
    value.trim().parse::<i64>().map_err(|_| {
        MigrateError::transform(
            table,
            format!("column {} holds non-numeric identifier {:?}", column, value),
        )
    })
}
