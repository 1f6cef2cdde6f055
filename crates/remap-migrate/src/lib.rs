//! # remap-migrate
//!
//! Schema-remapping data migration between two PostgreSQL application
//! databases.
//!
//! Rows are exported from the source, rewritten column by column according to
//! per-module YAML mapping files, and loaded into the target with:
//!
//! - **Identifier offsetting** so migrated rows never collide with rows
//!   already in the target
//! - **Existing-record matching** through discriminator columns
//! - **Deferred columns** split into a second update pass for self references
//! - **Dependency retry** loading, using the target's foreign-key checks to
//!   find a working load order
//! - **Parallel export and unconstrained import** with a bounded worker pool
//!
//! ## Example
//!
//! ```rust,no_run
//! use remap_migrate::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), remap_migrate::MigrateError> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let result = Orchestrator::new(config)?.run().await?;
//!     println!("Processed {} lines", result.lines_processed);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod export;
pub mod ids;
pub mod interchange;
pub mod load;
pub mod mapping;
pub mod orchestrator;
pub mod parallel;
pub mod process;
pub mod store;
pub mod transform;

// Re-exports for convenient access
pub use config::{Config, DatabaseConfig, MigrationConfig};
pub use error::{MigrateError, Result};
pub use ids::{IdAllocator, IdRemap};
pub use load::{LoadReport, Scheduler, SchedulerState};
pub use mapping::{Mapping, MappingSummary};
pub use orchestrator::{MigrationResult, Orchestrator};
pub use store::{PgStore, Side, StoreQuery};
pub use transform::{ColumnTransform, TransformContext, TransformOutput, TransformRegistry};
