//! Parallel export of source tables into the work directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use crate::error::{MigrateError, Result};
use crate::interchange::{phase_path, Phase};
use crate::parallel::run_bounded;
use crate::store::PgStore;

/// Tables whose raw export already exists in `dir`.
pub fn existing_exports(dir: &Path, tables: &[String]) -> Vec<String> {
    tables
        .iter()
        .filter(|table| phase_path(dir, table, Phase::Export).is_file())
        .cloned()
        .collect()
}

/// Export every table to `<dir>/<table>.csv` with at most `workers`
/// connections in use. With `reuse`, tables already exported are skipped.
///
/// Returns the number of bytes written.
pub async fn export_tables(
    store: &PgStore,
    tables: &[String],
    dir: &Path,
    workers: usize,
    reuse: bool,
) -> Result<u64> {
    let pending: Vec<String> = if reuse {
        let existing = existing_exports(dir, tables);
        if !existing.is_empty() {
            info!("Reusing {} existing exports", existing.len());
        }
        tables
            .iter()
            .filter(|t| !existing.contains(*t))
            .cloned()
            .collect()
    } else {
        tables.to_vec()
    };

    info!("Exporting {} tables with {} workers", pending.len(), workers);
    let dir: Arc<PathBuf> = Arc::new(dir.to_path_buf());
    let results = run_bounded(pending, workers, |table| {
        let store = store.clone();
        let dir = dir.clone();
        async move { store.export_table(&table, &dir).await }
    })
    .await;

    let mut written = 0u64;
    let mut failed = Vec::new();
    for (table, result) in results {
        match result {
            Ok(bytes) => written += bytes,
            Err(e) => {
                error!("Failed to export {}: {}", table, e);
                failed.push(table);
            }
        }
    }

    if !failed.is_empty() {
        return Err(MigrateError::load(
            failed.join(", "),
            "export from the source database failed",
        ));
    }
    Ok(written)
}
