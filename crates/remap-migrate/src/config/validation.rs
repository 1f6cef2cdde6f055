//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};
use crate::store::identifier::validate_database_name;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(MigrateError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(MigrateError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(MigrateError::Config("source.user is required".into()));
    }

    // Target validation
    if config.target.host.is_empty() {
        return Err(MigrateError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(MigrateError::Config("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(MigrateError::Config("target.user is required".into()));
    }

    // Cannot migrate into the database we read from
    if config.source.host == config.target.host
        && config.source.port == config.target.port
        && config.source.database == config.target.database
    {
        return Err(MigrateError::Config(
            "source and target cannot be the same database".into(),
        ));
    }

    let migration = &config.migration;
    if migration.tables.is_empty() {
        return Err(MigrateError::Config(
            "migration.tables must list at least one table".into(),
        ));
    }
    if migration.mappings.is_empty() {
        return Err(MigrateError::Config(
            "migration.mappings must list at least one mapping file".into(),
        ));
    }
    if migration.id_column.is_empty() {
        return Err(MigrateError::Config("migration.id_column is required".into()));
    }
    if let Some(0) = migration.workers {
        return Err(MigrateError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }
    if migration.reuse_export && migration.work_dir.is_none() {
        return Err(MigrateError::Config(
            "migration.reuse_export requires migration.work_dir".into(),
        ));
    }

    // Constraints cannot be rolled back once dropped, so only a throwaway copy is allowed
    if migration.drop_foreign_keys && migration.new_database.is_none() {
        return Err(MigrateError::Config(
            "dropping foreign keys is only valid together with a new database".into(),
        ));
    }
    if let Some(new_db) = &migration.new_database {
        if new_db == &config.target.database {
            return Err(MigrateError::Config(
                "the new database must have a different name than the target".into(),
            ));
        }
        validate_database_name(new_db)?;
        validate_database_name(&config.target.database)?;
    }

    Ok(())
}
