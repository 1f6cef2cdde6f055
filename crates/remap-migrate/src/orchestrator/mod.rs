//! Migration orchestrator - main workflow coordinator.

use crate::config::{Config, DatabaseConfig, MigrationConfig};
use crate::discovery::{foreign_keys_to_fix, related_tables};
use crate::error::{MigrateError, Result};
use crate::export::export_tables;
use crate::ids::IdAllocator;
use crate::interchange::{phase_path, read_header, Phase};
use crate::load::{load_unordered, LoadFile, LoadReport, Scheduler};
use crate::mapping::Mapping;
use crate::process::{CsvProcessor, ExistingRecords, ProcessSummary, RunState, TransformEnv};
use crate::store::postgres::{create_database, drop_database};
use crate::store::{PgStore, Side, StoreQuery};
use crate::transform::TransformRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// File in the work directory holding the statements that restore dropped
/// foreign keys.
pub const RESTORE_SCRIPT: &str = "restore_constraints.sql";

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    registry: TransformRegistry,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status: completed, rolled_back or incomplete.
    pub status: String,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// When the migration completed.
    pub completed_at: DateTime<Utc>,

    /// Database the rows were loaded into.
    pub target_database: String,

    /// Directory holding the interchange files.
    pub work_dir: PathBuf,

    /// Modules the mapping was compiled for.
    pub modules: Vec<String>,

    /// Source tables exported, related and link tables included.
    pub tables_exported: Vec<String>,

    /// Source rows transformed.
    pub lines_processed: u64,

    /// Average throughput (lines/second).
    pub lines_per_second: i64,

    /// Rows written to insert files.
    pub rows_inserted: u64,

    /// Rows written to update files.
    pub rows_updated: u64,

    /// Rows dropped because they already exist in the target.
    pub rows_skipped_existing: u64,

    /// Tables loaded, in load order.
    pub tables_imported: Vec<String>,

    /// Tables left unloaded when the load stopped.
    pub tables_remaining: Vec<String>,

    /// Tables that failed with an unclassified error.
    pub failed_tables: BTreeMap<String, String>,

    /// Columns the target reported missing, per table.
    pub missing_columns: BTreeMap<String, BTreeSet<String>>,

    /// Tables each unloaded table was waiting for.
    pub dependencies: BTreeMap<String, BTreeSet<String>>,

    /// Load passes run.
    pub load_iterations: usize,

    /// Tables whose update file was applied.
    pub updates_applied: Vec<String>,

    /// Tables whose update file failed to apply.
    pub updates_failed: Vec<String>,

    /// Sequences set to their table's maximum identifier.
    pub sequences_reset: usize,

    /// Whether the target transaction was committed.
    pub committed: bool,

    /// Rows were loaded on autocommitted connections because foreign keys
    /// were dropped. Such a run cannot be rolled back; unless it commits, the
    /// fresh database is dropped instead.
    pub loads_autocommitted: bool,

    /// False when dropped foreign keys could not be restored; the restore
    /// script is then left in the work directory.
    pub constraints_restored: bool,
}

/// What happened inside the target database, before cleanup.
struct RunOutcome {
    modules: Vec<String>,
    tables_exported: Vec<String>,
    summary: ProcessSummary,
    report: LoadReport,
    updates_applied: Vec<String>,
    updates_failed: Vec<String>,
    sequences_reset: usize,
    committed: bool,
    constraints_restored: bool,
}

impl Orchestrator {
    /// Create a new orchestrator with the built-in transforms.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry: TransformRegistry::builtin(),
        })
    }

    /// Use a registry carrying additional transforms.
    pub fn with_registry(mut self, registry: TransformRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Test the connections to both databases.
    pub async fn health_check(&self) -> Result<()> {
        let store = PgStore::connect(&self.config.source, &self.config.target, 1).await?;
        store.health_check().await
    }

    /// Run the migration.
    ///
    /// Unloaded tables do not make the run fail: the result then carries
    /// status `incomplete`, nothing is committed and the work directory is
    /// kept.
    pub async fn run(self) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let start = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let migration = &self.config.migration;
        info!("Starting migration run: {}", run_id);

        let mut target = self.config.target.clone();
        if let Some(name) = &migration.new_database {
            info!("Phase 1: Creating database {} from {}", name, target.database);
            create_database(&self.config.target, name).await?;
            target.database = name.clone();
        }

        let (work_dir, temporary) = match &migration.work_dir {
            Some(dir) => (dir.clone(), false),
            None => (
                std::env::temp_dir().join(format!(
                    "{}_{}",
                    self.config.source.database,
                    &run_id[..8]
                )),
                true,
            ),
        };
        tokio::fs::create_dir_all(&work_dir).await?;
        info!("Working directory: {}", work_dir.display());

        let outcome = self.migrate(&target, &work_dir).await;

        let committed = matches!(&outcome, Ok(o) if o.committed);
        if let Some(name) = &migration.new_database {
            if keeps_new_database(migration, committed) {
                if !committed {
                    warn!("Database {} kept after an uncommitted run", name);
                }
            } else {
                if migration.write {
                    warn!("Dropping database {}: the run was not committed", name);
                }
                if let Err(e) = drop_database(&self.config.target, name).await {
                    warn!("Could not drop database {}: {}", name, e);
                    if migration.drop_foreign_keys {
                        warn!(
                            "Foreign keys of {} may still be dropped, restore them with {}",
                            name,
                            work_dir.join(RESTORE_SCRIPT).display()
                        );
                    }
                }
            }
        }

        if temporary && !migration.keep_csv {
            if work_dir_disposable(&outcome) {
                if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
                    warn!("Could not remove {}: {}", work_dir.display(), e);
                }
            } else {
                warn!("Keeping {} to re-run from the exported files", work_dir.display());
            }
        }

        let outcome = outcome?;
        let completed_at = Utc::now();
        let duration = start.elapsed().as_secs_f64();
        let lines_per_second = if duration > 0.0 {
            (outcome.summary.lines as f64 / duration) as i64
        } else {
            0
        };
        let status = if !outcome.report.is_complete() {
            "incomplete"
        } else if outcome.committed {
            "completed"
        } else {
            "rolled_back"
        };

        info!(
            "Migration {}: {} lines in {:.1}s ({} lines/s)",
            status, outcome.summary.lines, duration, lines_per_second
        );

        Ok(MigrationResult {
            run_id,
            status: status.to_string(),
            duration_seconds: duration,
            started_at,
            completed_at,
            target_database: target.database,
            work_dir,
            modules: outcome.modules,
            tables_exported: outcome.tables_exported,
            lines_processed: outcome.summary.lines,
            lines_per_second,
            rows_inserted: outcome.summary.inserted,
            rows_updated: outcome.summary.updated,
            rows_skipped_existing: outcome.summary.skipped_existing,
            tables_imported: outcome.report.imported,
            tables_remaining: outcome.report.remaining,
            failed_tables: outcome.report.failed,
            missing_columns: outcome.report.missing_columns,
            dependencies: outcome.report.dependencies,
            load_iterations: outcome.report.iterations,
            updates_applied: outcome.updates_applied,
            updates_failed: outcome.updates_failed,
            sequences_reset: outcome.sequences_reset,
            committed: outcome.committed,
            loads_autocommitted: migration.drop_foreign_keys,
            constraints_restored: outcome.constraints_restored,
        })
    }

    async fn migrate(&self, target: &DatabaseConfig, work_dir: &Path) -> Result<RunOutcome> {
        let migration = &self.config.migration;
        let workers = migration.get_workers();
        let id_column = migration.id_column.as_str();

        // One connection per worker plus the session holding the transaction
        let store = PgStore::connect(&self.config.source, target, workers + 1).await?;

        let modules = enabled_modules(migration, &store).await?;
        info!("{} modules enabled", modules.len());

        info!("Phase 2: Discovering related tables");
        let source_columns = store.columns(Side::Source).await?;
        let source_keys = store.foreign_keys(Side::Source).await?;
        let related = related_tables(
            &migration.tables,
            &migration.excluded_tables,
            &source_keys,
            &source_columns,
            id_column,
        );

        info!("Phase 3: Exporting source tables");
        let bytes = export_tables(
            &store,
            &related.tables,
            work_dir,
            workers,
            migration.reuse_export,
        )
        .await?;
        debug!("Exported {} bytes", bytes);

        info!("Phase 4: Compiling mapping");
        let mapping = Mapping::load(
            &migration.resolved_mappings(),
            &modules,
            &self.registry,
            migration.drop_foreign_keys,
        )?;
        let sources = related
            .tables
            .iter()
            .map(|table| {
                let headers = read_header(&phase_path(work_dir, table, Phase::Export))?;
                Ok((table.clone(), headers))
            })
            .collect::<Result<Vec<_>>>()?;
        let target_columns = mapping.target_columns(&sources);
        let target_tables: Vec<String> = target_columns.keys().cloned().collect();

        let ids = IdAllocator::initialize(&store, &related.tables, &target_tables, id_column).await?;
        let target_keys = store.foreign_keys(Side::Target).await?;
        let foreign_keys = foreign_keys_to_fix(&target_keys, &target_tables, mapping.foreign_keys());

        info!("Phase 5: Extracting existing target records");
        let target_schema = store.columns(Side::Target).await?;
        let mut without_id = tables_without_id(&target_tables, &target_schema, id_column);
        without_id.extend(
            related
                .many_to_many
                .iter()
                .filter(|table| target_tables.contains(*table))
                .cloned(),
        );
        let existing =
            ExistingRecords::extract(&store, &mapping, &target_tables, &without_id, id_column).await?;

        info!("Phase 6: Processing rows");
        let env = TransformEnv {
            mapping: &mapping,
            foreign_keys: &foreign_keys,
            existing: &existing,
            store: &store,
            id_column,
        };
        let mut processor = CsvProcessor::new(env, &migration.process_last, RunState::new(ids));
        let summary = processor.process(work_dir, &related.tables, &target_columns).await?;

        let mut restore = Vec::new();
        if migration.drop_foreign_keys {
            let constraints = store.foreign_key_constraints(&target_tables).await?;
            restore = constraints.iter().map(|c| c.restore.clone()).collect();
            let script = work_dir.join(RESTORE_SCRIPT);
            let text: String = restore.iter().map(|sql| format!("{};\n", sql)).collect();
            tokio::fs::write(&script, text).await?;
            info!(
                "Dropping {} foreign key constraints (restore script: {})",
                constraints.len(),
                script.display()
            );
            let drops: Vec<String> = constraints.into_iter().map(|c| c.drop).collect();
            store.execute_batch(Side::Target, &drops).await?;
        }

        info!("Phase 7: Loading target tables");
        let files: Vec<LoadFile> = target_tables
            .iter()
            .map(|table| LoadFile::for_table(work_dir, table))
            .filter(|file| file.path.is_file())
            .collect();

        let mut session = store.session().await?;
        session.begin().await?;
        let report = if migration.drop_foreign_keys {
            load_unordered(files, workers, |file| {
                let store = store.clone();
                async move { store.load_file(file).await }
            })
            .await
        } else {
            Scheduler::new().run(files, &mut session).await
        };
        let report = match report {
            Ok(report) => report,
            Err(e) => {
                session.rollback().await?;
                return Err(e);
            }
        };

        let mut updates_applied = Vec::new();
        let mut updates_failed = Vec::new();
        let mut sequences_reset = 0;
        if report.is_complete() {
            for table in &target_tables {
                let path = phase_path(work_dir, table, Phase::PostUpdate);
                if !path.is_file() {
                    warn!("Not updating {} as it was not imported", table);
                    continue;
                }
                match session.apply_updates(table, &path).await {
                    Ok(rows) => {
                        debug!("Updated {} rows of {}", rows, table);
                        updates_applied.push(table.clone());
                    }
                    Err(e) => {
                        error!("Error applying updates to {}: {}", table, e);
                        updates_failed.push(table.clone());
                    }
                }
            }
            for table in &target_tables {
                if session.reset_sequence(table, id_column).await? {
                    sequences_reset += 1;
                }
            }
        } else {
            error!(
                "Could not import remaining tables: {}",
                report.unresolved().join(", ")
            );
            for (table, columns) in &report.missing_columns {
                let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
                error!("{} is missing columns: {}", table, columns.join(", "));
            }
        }

        let committed = migration.write && report.is_complete();
        if committed {
            session.commit().await?;
            info!("Committed");
        } else {
            session.rollback().await?;
            info!("Rolled back");
        }

        let mut constraints_restored = true;
        if migration.drop_foreign_keys && keeps_new_database(migration, committed) {
            info!("Restoring {} foreign key constraints", restore.len());
            if let Err(e) = store.execute_batch(Side::Target, &restore).await {
                error!(
                    "Could not restore foreign key constraints: {}. Run {} by hand",
                    e,
                    work_dir.join(RESTORE_SCRIPT).display()
                );
                constraints_restored = false;
            }
        }

        Ok(RunOutcome {
            modules,
            tables_exported: related.tables,
            summary,
            report,
            updates_applied,
            updates_failed,
            sequences_reset,
            committed,
            constraints_restored,
        })
    }
}

/// Whether a fresh target database survives the run.
///
/// With foreign keys dropped the loads are already committed, so only a
/// committed run may keep them.
fn keeps_new_database(migration: &MigrationConfig, committed: bool) -> bool {
    if migration.drop_foreign_keys {
        committed
    } else {
        migration.write
    }
}

/// A temporary work directory is only removed after a clean run; otherwise
/// its exports, quarantined files and restore script stay for a re-run.
fn work_dir_disposable(outcome: &Result<RunOutcome>) -> bool {
    matches!(
        outcome,
        Ok(o) if o.report.is_complete() && o.updates_failed.is_empty() && o.constraints_restored
    )
}

/// Modules the mapping is compiled for: the configured list, or the modules
/// the target reports installed, minus the excluded ones.
pub async fn enabled_modules(config: &MigrationConfig, store: &dyn StoreQuery) -> Result<Vec<String>> {
    let mut modules = match &config.modules {
        Some(modules) => modules.clone(),
        None => store
            .query_text(Side::Target, &config.modules_query)
            .await?
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect(),
    };
    if modules.is_empty() {
        return Err(MigrateError::Config("no module is enabled".into()));
    }
    modules.retain(|m| !config.excluded_modules.contains(m));
    modules.sort();
    modules.dedup();
    Ok(modules)
}

/// Target tables that exist but carry no identifier column.
pub fn tables_without_id(
    target_tables: &[String],
    schema: &HashMap<String, Vec<String>>,
    id_column: &str,
) -> HashSet<String> {
    target_tables
        .iter()
        .filter(|table| {
            schema
                .get(table.as_str())
                .map(|columns| !columns.iter().any(|c| c == id_column))
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

impl MigrationResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// True when every table was loaded.
    pub fn is_complete(&self) -> bool {
        self.tables_remaining.is_empty() && self.failed_tables.is_empty()
    }
}
