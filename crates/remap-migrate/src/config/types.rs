//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();

        Self {
            cpu_cores: sys.cpus().len().max(1),
        }
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database (old application schema).
    pub source: DatabaseConfig,

    /// Target database (new application schema).
    pub target: DatabaseConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

/// PostgreSQL connection settings, shared by source and target.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    #[serde(default = "default_user")]
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Database used for CREATE/DROP DATABASE statements (default: "postgres").
    #[serde(default = "default_maintenance_database")]
    pub maintenance_database: String,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("maintenance_database", &self.maintenance_database)
            .finish()
    }
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Tables requested for migration. Related tables are added automatically.
    #[serde(default)]
    pub tables: Vec<String>,

    /// Tables never exported, even when referenced.
    #[serde(default = "default_excluded_tables")]
    pub excluded_tables: Vec<String>,

    /// Mapping files, merged in order.
    #[serde(default)]
    pub mappings: Vec<PathBuf>,

    /// Directory searched for mapping files not found as given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_dir: Option<PathBuf>,

    /// Explicit list of enabled modules. Queried from the target when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modules: Option<Vec<String>>,

    /// Query returning the names of the modules installed in the target.
    #[serde(default = "default_modules_query")]
    pub modules_query: String,

    /// Modules removed from the enabled list.
    #[serde(default)]
    pub excluded_modules: Vec<String>,

    /// Global property tables transformed after every other table.
    #[serde(default = "default_process_last")]
    pub process_last: Vec<String>,

    /// Name of the numeric identifier column.
    #[serde(default = "default_id_column")]
    pub id_column: String,

    /// Number of parallel export/import workers. Auto-tuned if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Directory for interchange files. A fresh temporary directory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,

    /// Keep the interchange files after the run.
    #[serde(default)]
    pub keep_csv: bool,

    /// Reuse raw exports already present in `work_dir` instead of exporting again.
    #[serde(default)]
    pub reuse_export: bool,

    /// Commit the target transaction when the migration succeeds.
    #[serde(default)]
    pub write: bool,

    /// Drop foreign keys on target tables during the load and restore them afterwards.
    #[serde(default)]
    pub drop_foreign_keys: bool,

    /// Create this database from the target as a template and migrate into it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_database: Option<String>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            excluded_tables: default_excluded_tables(),
            mappings: Vec::new(),
            mapping_dir: None,
            modules: None,
            modules_query: default_modules_query(),
            excluded_modules: Vec::new(),
            process_last: default_process_last(),
            id_column: default_id_column(),
            workers: None,
            work_dir: None,
            keep_csv: false,
            reuse_export: false,
            write: false,
            drop_foreign_keys: false,
            new_database: None,
        }
    }
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        // Export and unconstrained import are I/O bound; one connection per core, capped.
        if self.workers.is_none() {
            let workers = resources.cpu_cores.clamp(2, 16);
            self.workers = Some(workers);
            info!("Auto-tuned config: workers={}", workers);
        }
        self
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(8)
    }

    /// Resolve mapping file paths, falling back to `mapping_dir` for missing files.
    pub fn resolved_mappings(&self) -> Vec<PathBuf> {
        self.mappings
            .iter()
            .map(|path| match &self.mapping_dir {
                Some(dir) if !path.exists() => {
                    let candidate = dir.join(path);
                    tracing::warn!("{:?} not found. Trying {:?}", path, candidate);
                    candidate
                }
                _ => path.clone(),
            })
            .collect()
    }
}

// Default value functions for serde
fn default_host() -> String {
    "localhost".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_maintenance_database() -> String {
    "postgres".to_string()
}

fn default_excluded_tables() -> Vec<String> {
    vec!["ir_model".to_string()]
}

fn default_modules_query() -> String {
    "SELECT name FROM ir_module_module WHERE state = 'installed'".to_string()
}

fn default_process_last() -> Vec<String> {
    vec!["ir_property".to_string()]
}

fn default_id_column() -> String {
    "id".to_string()
}
