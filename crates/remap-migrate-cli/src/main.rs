//! remap-migrate CLI - schema-remapping migration between PostgreSQL databases.

use clap::{Parser, Subcommand};
use remap_migrate::{
    Config, Mapping, MigrateError, MigrationResult, Orchestrator, TransformRegistry,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "remap-migrate")]
#[command(about = "Migrate application data between PostgreSQL schemas through mapping files")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a migration
    Run(RunArgs),

    /// Compile mapping files offline and print what they resolve to
    Compile {
        /// Mapping files, merged in order [default: from the configuration]
        #[arg(short, long, num_args = 1..)]
        path: Vec<PathBuf>,

        /// Enabled modules [default: from the configuration]
        #[arg(short, long = "module", value_delimiter = ',')]
        modules: Vec<String>,

        /// Compile as for a load with foreign keys dropped
        #[arg(short = 'f', long)]
        drop_fk: bool,
    },

    /// Test database connections
    HealthCheck,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Override source database name
    #[arg(short, long)]
    source: Option<String>,

    /// Override target database name
    #[arg(short, long)]
    target: Option<String>,

    /// Tables to migrate; related tables are added automatically
    #[arg(short = 'r', long = "relation", num_args = 1..)]
    relations: Vec<String>,

    /// Tables to exclude
    #[arg(short = 'x', long, num_args = 1..)]
    excluded: Vec<String>,

    /// Mapping files, merged in order
    #[arg(short, long, num_args = 1..)]
    path: Vec<PathBuf>,

    /// Modules to leave out of the mapping
    #[arg(long = "exclude-module", value_delimiter = ',')]
    exclude_modules: Vec<String>,

    /// Commit to the target database if the migration succeeds
    #[arg(short, long)]
    write: bool,

    /// Create a new database from the target and migrate into it
    #[arg(short = 'n', long)]
    new_db: Option<String>,

    /// Drop foreign key constraints during the load (requires --new-db)
    #[arg(short = 'f', long)]
    drop_fk: bool,

    /// Drop foreign keys, creating a new database if --new-db is not given
    #[arg(short, long)]
    quick: bool,

    /// Keep the CSV files after the run
    #[arg(short, long)]
    keep_csv: bool,

    /// Directory for the CSV files
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Reuse exports already present in the work directory
    #[arg(long)]
    reuse_export: bool,

    /// Override number of workers
    #[arg(long)]
    workers: Option<usize>,
}

impl RunArgs {
    fn apply(self, config: &mut Config) {
        if let Some(source) = self.source {
            config.source.database = source;
        }
        if let Some(target) = self.target {
            config.target.database = target;
        }

        let migration = &mut config.migration;
        if !self.relations.is_empty() {
            migration.tables = self.relations;
        }
        if !self.excluded.is_empty() {
            migration.excluded_tables = self.excluded;
        }
        if !self.path.is_empty() {
            migration.mappings = self.path;
        }
        migration.excluded_modules.extend(self.exclude_modules);
        migration.write |= self.write;
        migration.keep_csv |= self.keep_csv;
        migration.reuse_export |= self.reuse_export;
        if self.work_dir.is_some() {
            migration.work_dir = self.work_dir;
        }
        if self.workers.is_some() {
            migration.workers = self.workers;
        }
        if self.new_db.is_some() {
            migration.new_database = self.new_db;
        }
        migration.drop_foreign_keys |= self.drop_fk || self.quick;
        if self.quick && migration.new_database.is_none() {
            let stamp = chrono::Utc::now().timestamp() % 10_000;
            let name = format!("{}_{:04}", config.source.database, stamp).to_lowercase();
            config.migration.new_database = Some(name);
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    match cli.command {
        Commands::Run(args) => {
            let mut config = Config::read(&cli.config)?;
            info!("Loaded configuration from {:?}", cli.config);
            args.apply(&mut config);
            config.validate()?;
            if let Some(name) = &config.migration.new_database {
                println!("Migrating into database {}", name);
            }

            let result = Orchestrator::new(config.with_auto_tuning())?.run().await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                print_result(&result);
            }

            if result.is_complete() {
                Ok(ExitCode::SUCCESS)
            } else {
                let mut tables = result.tables_remaining.clone();
                tables.extend(result.failed_tables.keys().cloned());
                let err = MigrateError::Incomplete { tables };
                eprintln!("{}", err);
                Ok(ExitCode::from(err.exit_code()))
            }
        }

        Commands::Compile {
            path,
            modules,
            drop_fk,
        } => {
            let (paths, modules) = if path.is_empty() || modules.is_empty() {
                let config = Config::read(&cli.config)?;
                let paths = if path.is_empty() {
                    config.migration.resolved_mappings()
                } else {
                    path
                };
                let modules = if modules.is_empty() {
                    config.migration.modules.unwrap_or_default()
                } else {
                    modules
                };
                (paths, modules)
            } else {
                (path, modules)
            };
            if modules.is_empty() {
                return Err(MigrateError::Config(
                    "no module given: use --module or migration.modules".into(),
                ));
            }

            let mapping = Mapping::load(&paths, &modules, &TransformRegistry::builtin(), drop_fk)?;
            let summary = mapping.summary();

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("Mapping compiled for {} modules", modules.len());
                println!("  Source columns: {}", summary.source_columns);
                println!("  Forgotten columns: {}", summary.forgotten_columns);
                println!("  Target tables: {}", summary.target_tables.join(", "));
                for (table, columns) in &summary.discriminators {
                    println!("  Discriminator {}: {}", table, columns.join(", "));
                }
                for (table, columns) in &summary.deferred {
                    println!("  Deferred {}: {}", table, columns.join(", "));
                }
                for (column, table) in &summary.foreign_keys {
                    println!("  Foreign key {} -> {}", column, table);
                }
                for (column, sibling) in &summary.references {
                    println!("  Reference {} via {}", column, sibling);
                }
                for table in &summary.target_tables {
                    let stored = mapping.stored(table);
                    if !stored.is_empty() {
                        println!("  Stored {}: {}", table, stored.join(", "));
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::HealthCheck => {
            let config = Config::load(&cli.config)?;
            let orchestrator = Orchestrator::new(config)?;
            orchestrator.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::json!({ "healthy": true }));
            } else {
                println!("Health Check Results:");
                println!("  Source: OK");
                println!("  Target: OK");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_result(result: &MigrationResult) {
    let status_msg = match result.status.as_str() {
        "completed" => "Migration completed!",
        "rolled_back" => "Migration finished and rolled back (use --write to commit)",
        _ => "Migration incomplete!",
    };
    println!("\n{}", status_msg);
    println!("  Run ID: {}", result.run_id);
    println!("  Database: {}", result.target_database);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!("  Lines: {}", result.lines_processed);
    println!("  Throughput: {} lines/sec", result.lines_per_second);
    println!(
        "  Tables imported: {}/{}",
        result.tables_imported.len(),
        result.tables_imported.len() + result.tables_remaining.len() + result.failed_tables.len()
    );
    if !result.tables_remaining.is_empty() {
        println!("  Remaining tables: {}", result.tables_remaining.join(", "));
    }
    for (table, message) in &result.failed_tables {
        println!("  Failed {}: {}", table, message);
    }
    for (table, columns) in &result.missing_columns {
        let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
        println!("  Missing columns in {}: {}", table, columns.join(", "));
    }
    for (table, waiting) in &result.dependencies {
        let waiting: Vec<&str> = waiting.iter().map(String::as_str).collect();
        println!("  {} waits for: {}", table, waiting.join(", "));
    }
    if !result.constraints_restored {
        println!(
            "  Foreign keys not restored, see restore_constraints.sql in {}",
            result.work_dir.display()
        );
    }
    if !result.updates_failed.is_empty() {
        println!("  Failed updates: {}", result.updates_failed.join(", "));
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // RUST_LOG wins over --verbosity when set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
