//! Bulk loading of postprocessed files into the target.
//!
//! Loading with constraints in place goes through the [`Scheduler`]: every
//! file is tried inside its own savepoint and files failing on a missing
//! dependency are retried until a full pass makes no progress. With foreign
//! keys dropped, [`load_unordered`] pushes all files in parallel instead.

mod order;
mod scheduler;

pub use order::{LoadOrder, RetryInPlace};
pub use scheduler::{LoadReport, Scheduler, SchedulerState};

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio_postgres::error::SqlState;
use tracing::{error, info, warn};

use crate::error::{MigrateError, Result};
use crate::interchange::{disabled_path, phase_path, Phase};
use crate::parallel::run_bounded;

/// One file to load into one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadFile {
    pub table: String,
    pub path: PathBuf,
    /// Deferred updates that only make sense once this file is loaded.
    pub companion: Option<PathBuf>,
}

impl LoadFile {
    /// The postprocessed insert file of `table`, with its update file.
    pub fn for_table(work_dir: &Path, table: &str) -> Self {
        Self {
            table: table.to_string(),
            path: phase_path(work_dir, table, Phase::PostInsert),
            companion: Some(phase_path(work_dir, table, Phase::PostUpdate)),
        }
    }
}

/// Result of one load attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { rows: u64 },
    /// A referenced row is not there yet; `depends_on` names its table when
    /// the store reported it.
    ForeignKeyViolation {
        depends_on: Option<String>,
        message: String,
    },
    /// The file has a column the target table lacks.
    MissingColumn {
        column: Option<String>,
        message: String,
    },
    /// Anything else. Not retried.
    Failed { message: String },
}

/// Somewhere files can be loaded, one at a time, each attempt isolated from
/// the others.
#[async_trait]
pub trait LoadTarget: Send {
    async fn load(&mut self, file: &LoadFile) -> Result<LoadOutcome>;
}

/// Classify an error raised while loading a file.
pub fn classify_load_error(err: &MigrateError) -> LoadOutcome {
    if let MigrateError::Store(e) = err {
        if let Some(db) = e.as_db_error() {
            let message = db.message().to_string();
            if *db.code() == SqlState::FOREIGN_KEY_VIOLATION {
                return LoadOutcome::ForeignKeyViolation {
                    depends_on: db.detail().and_then(referenced_table),
                    message,
                };
            }
            if *db.code() == SqlState::UNDEFINED_COLUMN {
                return LoadOutcome::MissingColumn {
                    column: missing_column(&message),
                    message,
                };
            }
        }
    }
    LoadOutcome::Failed {
        message: err.to_string(),
    }
}

/// Table named in a foreign-key violation detail such as
/// `Key (partner_id)=(12) is not present in table "res_partner".`
pub fn referenced_table(detail: &str) -> Option<String> {
    let rest = detail.split("is not present in table \"").nth(1)?;
    rest.split('"').next().map(str::to_string)
}

/// Column named in `column "foo" of relation "bar" does not exist`.
pub fn missing_column(message: &str) -> Option<String> {
    let rest = message.strip_prefix("column \"")?;
    rest.split('"').next().map(str::to_string)
}

/// Rename a file's update companion so it is never applied.
pub async fn quarantine(file: &LoadFile) -> Result<()> {
    let Some(companion) = &file.companion else {
        return Ok(());
    };
    if tokio::fs::try_exists(companion).await? {
        let disabled = disabled_path(companion);
        tokio::fs::rename(companion, &disabled).await?;
        warn!("Disabled {} since {} was not loaded", disabled.display(), file.table);
    }
    Ok(())
}

/// Load files in parallel, with no ordering and no retry.
///
/// Each job is expected to use its own connection. Files that fail are
/// reported as remaining and their companions quarantined.
pub async fn load_unordered<F, Fut>(files: Vec<LoadFile>, workers: usize, job: F) -> Result<LoadReport>
where
    F: Fn(LoadFile) -> Fut,
    Fut: Future<Output = Result<LoadOutcome>> + Send + 'static,
{
    let mut report = LoadReport {
        iterations: 1,
        ..Default::default()
    };

    for (file, result) in run_bounded(files, workers, job).await {
        let outcome = result.unwrap_or_else(|e| LoadOutcome::Failed {
            message: e.to_string(),
        });
        match outcome {
            LoadOutcome::Loaded { rows } => {
                info!("Imported {} ({} rows)", file.table, rows);
                report.imported.push(file.table);
            }
            LoadOutcome::MissingColumn { column, message } => {
                warn!("{}: {}", file.table, message);
                if let Some(column) = column {
                    report
                        .missing_columns
                        .entry(file.table.clone())
                        .or_default()
                        .insert(column);
                }
                quarantine(&file).await?;
                report.remaining.push(file.table);
            }
            LoadOutcome::ForeignKeyViolation { message, .. } | LoadOutcome::Failed { message } => {
                error!("Failed to import {}: {}", file.table, message);
                quarantine(&file).await?;
                report.failed.insert(file.table, message);
            }
        }
    }

    report.state = if report.is_complete() {
        SchedulerState::Done
    } else {
        SchedulerState::Stuck
    };
    Ok(report)
}
