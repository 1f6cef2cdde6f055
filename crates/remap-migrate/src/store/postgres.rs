//! PostgreSQL store adapter built on deadpool-postgres.
//!
//! - [`PgStore`]: one pool per side, read-only queries, introspection, DDL,
//!   export and autocommit loads
//! - [`PgSession`]: a dedicated target connection holding the run's outer
//!   transaction; every file load and update runs inside a savepoint of it

use async_trait::async_trait;
use bytes::BytesMut;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, info, warn};

use super::identifier::{quote_column_list, quote_literal, quote_pg, validate_database_name};
use super::{ConstraintDdl, ForeignKeyRef, Side, StoreQuery, TextRow};
use crate::config::DatabaseConfig;
use crate::error::{MigrateError, Result};
use crate::interchange::{has_rows, phase_path, read_header, Phase};
use crate::load::{classify_load_error, LoadFile, LoadOutcome, LoadTarget};

/// Bytes sent per COPY message.
const COPY_CHUNK_SIZE: usize = 1024 * 1024;

const SAVEPOINT: &str = "import";

const UPDATE_TABLE: &str = "remap_pending_update";

const COLUMNS_QUERY: &str = "SELECT table_name, column_name FROM information_schema.columns \
     WHERE table_schema = 'public' ORDER BY table_name, ordinal_position";

const FOREIGN_KEYS_QUERY: &str = "SELECT cl.relname, att.attname, ref.relname \
     FROM pg_constraint con \
     JOIN pg_class cl ON cl.oid = con.conrelid \
     JOIN pg_class ref ON ref.oid = con.confrelid \
     JOIN pg_namespace ns ON ns.oid = cl.relnamespace \
     JOIN pg_attribute att ON att.attrelid = con.conrelid AND att.attnum = con.conkey[1] \
     WHERE con.contype = 'f' AND ns.nspname = 'public' AND array_length(con.conkey, 1) = 1 \
     ORDER BY cl.relname, att.attname";

/// Pools for the source and the target database.
#[derive(Clone)]
pub struct PgStore {
    source: Pool,
    target: Pool,
}

impl PgStore {
    /// Create both pools and test one connection of each.
    pub async fn connect(source: &DatabaseConfig, target: &DatabaseConfig, max_conns: usize) -> Result<Self> {
        let store = Self {
            source: build_pool(source, max_conns)?,
            target: build_pool(target, max_conns)?,
        };
        store.health_check().await?;
        info!(
            "Connected to source {}:{}/{} and target {}:{}/{}",
            source.host, source.port, source.database, target.host, target.port, target.database
        );
        Ok(store)
    }

    fn pool(&self, side: Side) -> &Pool {
        match side {
            Side::Source => &self.source,
            Side::Target => &self.target,
        }
    }

    async fn client(&self, side: Side) -> Result<Object> {
        self.pool(side)
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), format!("getting {} connection", side)))
    }

    /// Run `SELECT 1` on both sides.
    pub async fn health_check(&self) -> Result<()> {
        for side in [Side::Source, Side::Target] {
            let client = self.client(side).await?;
            client.simple_query("SELECT 1").await?;
        }
        Ok(())
    }

    /// A dedicated target connection for the run's transaction.
    pub async fn session(&self) -> Result<PgSession> {
        Ok(PgSession {
            client: self.client(Side::Target).await?,
            in_transaction: false,
        })
    }

    /// Column names of every table in the public schema.
    pub async fn columns(&self, side: Side) -> Result<HashMap<String, Vec<String>>> {
        let mut columns: HashMap<String, Vec<String>> = HashMap::new();
        for row in self.query_text(side, COLUMNS_QUERY).await? {
            if let [Some(table), Some(column)] = row.as_slice() {
                columns.entry(table.clone()).or_default().push(column.clone());
            }
        }
        Ok(columns)
    }

    /// Single-column foreign keys of the public schema.
    pub async fn foreign_keys(&self, side: Side) -> Result<Vec<ForeignKeyRef>> {
        let rows = self.query_text(side, FOREIGN_KEYS_QUERY).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row.as_slice() {
                [Some(table), Some(column), Some(referenced)] => Some(ForeignKeyRef {
                    table: table.clone(),
                    column: column.clone(),
                    referenced_table: referenced.clone(),
                }),
                _ => None,
            })
            .collect())
    }

    /// Foreign-key constraints of `tables` in the target, as drop/restore pairs.
    pub async fn foreign_key_constraints(&self, tables: &[String]) -> Result<Vec<ConstraintDdl>> {
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        let names = tables
            .iter()
            .map(|t| quote_literal(t))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT relname, \
               'ALTER TABLE ' || quote_ident(nspname) || '.' || quote_ident(relname) \
                 || ' DROP CONSTRAINT ' || quote_ident(conname), \
               'ALTER TABLE ' || quote_ident(nspname) || '.' || quote_ident(relname) \
                 || ' ADD CONSTRAINT ' || quote_ident(conname) || ' ' || pg_get_constraintdef(pg_constraint.oid) \
             FROM pg_constraint \
             JOIN pg_class ON conrelid = pg_class.oid \
             JOIN pg_namespace ON pg_namespace.oid = pg_class.relnamespace \
             WHERE contype = 'f' AND relname IN ({}) \
             ORDER BY nspname, relname, conname",
            names
        );
        let rows = self.query_text(Side::Target, &sql).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row.as_slice() {
                [Some(table), Some(drop), Some(restore)] => Some(ConstraintDdl {
                    table: table.clone(),
                    drop: drop.clone(),
                    restore: restore.clone(),
                }),
                _ => None,
            })
            .collect())
    }

    /// Execute statements outside of any explicit transaction.
    pub async fn execute_batch(&self, side: Side, statements: &[String]) -> Result<()> {
        if statements.is_empty() {
            return Ok(());
        }
        let client = self.client(side).await?;
        client.batch_execute(&statements.join(";\n")).await?;
        Ok(())
    }

    /// Export one source table into the work directory; returns bytes written.
    pub async fn export_table(&self, table: &str, dir: &Path) -> Result<u64> {
        let path = phase_path(dir, table, Phase::Export);
        let sql = format!(
            "COPY {} TO STDOUT WITH (FORMAT csv, HEADER true, NULL '')",
            quote_pg(table)?
        );
        let client = self.client(Side::Source).await?;
        let stream = client.copy_out(sql.as_str()).await?;
        futures::pin_mut!(stream);

        let mut file = tokio::fs::File::create(&path).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        debug!("Exported {} ({} bytes)", table, written);
        Ok(written)
    }

    /// Load a file on its own pooled connection, in autocommit mode.
    pub async fn load_file(&self, file: LoadFile) -> Result<LoadOutcome> {
        let client = self.client(Side::Target).await?;
        match copy_file(&client, &file.table, &file.path).await {
            Ok(rows) => Ok(LoadOutcome::Loaded { rows }),
            Err(e) => Ok(classify_load_error(&e)),
        }
    }
}

#[async_trait]
impl StoreQuery for PgStore {
    async fn query_text(&self, side: Side, sql: &str) -> Result<Vec<TextRow>> {
        let client = self.client(side).await?;
        simple_rows(&client, sql).await
    }

    async fn max_id(&self, side: Side, table: &str, id_column: &str) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT MAX({})::bigint FROM {}",
            quote_pg(id_column)?,
            quote_pg(table)?
        );
        let client = self.client(side).await?;
        match simple_rows(&client, &sql).await {
            Ok(rows) => {
                let max = rows
                    .into_iter()
                    .next()
                    .and_then(|row| row.into_iter().next().flatten());
                match max {
                    Some(value) => value.parse::<i64>().map(Some).map_err(|_| {
                        MigrateError::transform(table, format!("non-numeric maximum {:?}", value))
                    }),
                    None => Ok(Some(0)),
                }
            }
            Err(e) if has_code(&e, &[SqlState::UNDEFINED_COLUMN, SqlState::UNDEFINED_TABLE]) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// The run's outer transaction on the target.
pub struct PgSession {
    client: Object,
    in_transaction: bool,
}

impl PgSession {
    pub async fn begin(&mut self) -> Result<()> {
        self.client.batch_execute("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<()> {
        if self.in_transaction {
            self.client.batch_execute("COMMIT").await?;
            self.in_transaction = false;
        }
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<()> {
        if self.in_transaction {
            self.client.batch_execute("ROLLBACK").await?;
            self.in_transaction = false;
        }
        Ok(())
    }

    async fn savepoint(&self) -> Result<()> {
        self.client
            .batch_execute(&format!("SAVEPOINT {}", SAVEPOINT))
            .await?;
        Ok(())
    }

    async fn release_savepoint(&self) -> Result<()> {
        self.client
            .batch_execute(&format!("RELEASE SAVEPOINT {}", SAVEPOINT))
            .await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&self) -> Result<()> {
        self.client
            .batch_execute(&format!("ROLLBACK TO SAVEPOINT {}", SAVEPOINT))
            .await?;
        Ok(())
    }

    /// Apply an update file: every non-NULL value overwrites the column of
    /// the row with the same primary key.
    ///
    /// Runs inside a savepoint; on failure the savepoint is rolled back and
    /// the error returned.
    pub async fn apply_updates(&mut self, table: &str, path: &Path) -> Result<u64> {
        if !has_rows(path)? {
            return Ok(0);
        }
        let Some(pkey) = self.primary_key(table).await? else {
            warn!("Can't update {} without a primary key", table);
            return Ok(0);
        };
        let columns = read_header(path)?;

        self.savepoint().await?;
        match self.update_from_file(table, &pkey, &columns, path).await {
            Ok(rows) => {
                self.release_savepoint().await?;
                Ok(rows)
            }
            Err(e) => {
                self.rollback_to_savepoint().await?;
                Err(e)
            }
        }
    }

    async fn update_from_file(&self, table: &str, pkey: &str, columns: &[String], path: &Path) -> Result<u64> {
        let target = quote_pg(table)?;
        let temp = quote_pg(UPDATE_TABLE)?;
        let key = quote_pg(pkey)?;

        self.client
            .batch_execute(&format!(
                "CREATE TEMP TABLE {} AS SELECT * FROM {} WITH NO DATA",
                temp, target
            ))
            .await?;
        copy_file(&self.client, UPDATE_TABLE, path).await?;

        let assignments = columns
            .iter()
            .filter(|c| c.as_str() != pkey)
            .map(|c| {
                let c = quote_pg(c)?;
                Ok(format!("{c} = COALESCE({temp}.{c}, {target}.{c})"))
            })
            .collect::<Result<Vec<_>>>()?;

        let rows = if assignments.is_empty() {
            0
        } else {
            let sql = format!(
                "UPDATE {target} SET {} FROM {temp} WHERE {target}.{key} = {temp}.{key}",
                assignments.join(", ")
            );
            self.client.execute(sql.as_str(), &[]).await?
        };
        self.client
            .batch_execute(&format!("DROP TABLE {}", temp))
            .await?;
        Ok(rows)
    }

    async fn primary_key(&self, table: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT a.attname FROM pg_index i \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
             WHERE i.indrelid = {}::regclass AND i.indisprimary",
            quote_literal(&quote_pg(table)?)
        );
        let mut keys: Vec<String> = simple_rows(&self.client, &sql)
            .await?
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect();
        if keys.len() > 1 {
            warn!("{} has a composite primary key, not updating", table);
            return Ok(None);
        }
        Ok(keys.pop())
    }

    /// Set the serial sequence of `table` to its maximum identifier.
    ///
    /// Returns false when the table has no such sequence.
    pub async fn reset_sequence(&mut self, table: &str, id_column: &str) -> Result<bool> {
        let table_name = quote_literal(&quote_pg(table)?);
        let sql = format!(
            "SELECT setval(seq, max_id) FROM \
               (SELECT pg_get_serial_sequence({}, {}) AS seq, \
                       (SELECT MAX({}) FROM {}) AS max_id) s \
             WHERE seq IS NOT NULL AND max_id IS NOT NULL",
            table_name,
            quote_literal(id_column),
            quote_pg(id_column)?,
            quote_pg(table)?
        );

        self.savepoint().await?;
        match simple_rows(&self.client, &sql).await {
            Ok(rows) => {
                self.release_savepoint().await?;
                Ok(!rows.is_empty())
            }
            Err(e) => {
                self.rollback_to_savepoint().await?;
                debug!("No sequence reset for {}: {}", table, e);
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl LoadTarget for PgSession {
    async fn load(&mut self, file: &LoadFile) -> Result<LoadOutcome> {
        self.savepoint().await?;
        match copy_file(&self.client, &file.table, &file.path).await {
            Ok(rows) => {
                self.release_savepoint().await?;
                Ok(LoadOutcome::Loaded { rows })
            }
            Err(e) => {
                self.rollback_to_savepoint().await?;
                Ok(classify_load_error(&e))
            }
        }
    }
}

/// Create `name` from the configured database as a template.
///
/// Connections to both databases are terminated first, since PostgreSQL
/// refuses to copy a database that is in use.
pub async fn create_database(config: &DatabaseConfig, name: &str) -> Result<()> {
    validate_database_name(name)?;
    validate_database_name(&config.database)?;
    let client = maintenance_client(config).await?;

    for database in [name, config.database.as_str()] {
        terminate_connections(&client, database).await?;
    }
    client
        .batch_execute(&format!("DROP DATABASE IF EXISTS {}", name))
        .await?;
    for database in [name, config.database.as_str()] {
        terminate_connections(&client, database).await?;
    }
    client
        .batch_execute(&format!(
            "CREATE DATABASE {} TEMPLATE {}",
            name, config.database
        ))
        .await?;
    info!("Created database {} from {}", name, config.database);
    Ok(())
}

/// Drop database `name`.
pub async fn drop_database(config: &DatabaseConfig, name: &str) -> Result<()> {
    validate_database_name(name)?;
    let client = maintenance_client(config).await?;
    terminate_connections(&client, name).await?;
    client
        .batch_execute(&format!("DROP DATABASE IF EXISTS {}", name))
        .await?;
    info!("Dropped database {}", name);
    Ok(())
}

async fn maintenance_client(config: &DatabaseConfig) -> Result<Client> {
    let (client, connection) = config.maintenance_pg_config().connect(NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!("Maintenance connection error: {}", e);
        }
    });
    Ok(client)
}

async fn terminate_connections(client: &Client, database: &str) -> Result<()> {
    client
        .simple_query(&format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = {} AND pid <> pg_backend_pid()",
            quote_literal(database)
        ))
        .await?;
    Ok(())
}

fn build_pool(config: &DatabaseConfig, max_conns: usize) -> Result<Pool> {
    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let mgr = Manager::from_config(config.pg_config(), NoTls, mgr_config);
    Pool::builder(mgr)
        .max_size(max_conns.max(1))
        .build()
        .map_err(|e| MigrateError::pool(e.to_string(), format!("creating pool for {}", config.database)))
}

async fn simple_rows(client: &Client, sql: &str) -> Result<Vec<TextRow>> {
    let mut rows = Vec::new();
    for message in client.simple_query(sql).await? {
        if let SimpleQueryMessage::Row(row) = message {
            rows.push((0..row.len()).map(|i| row.get(i).map(str::to_string)).collect());
        }
    }
    Ok(rows)
}

fn has_code(err: &MigrateError, codes: &[SqlState]) -> bool {
    match err {
        MigrateError::Store(e) => e.code().map(|code| codes.contains(code)).unwrap_or(false),
        _ => false,
    }
}

/// Stream an interchange file into `table` with COPY, using its header as
/// the column list.
async fn copy_file(client: &Client, table: &str, path: &Path) -> Result<u64> {
    let columns = read_header(path)?;
    let sql = format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT csv, HEADER true, NULL '')",
        quote_pg(table)?,
        quote_column_list(&columns)?
    );

    let sink = client.copy_in(sql.as_str()).await?;
    futures::pin_mut!(sink);

    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = BytesMut::with_capacity(COPY_CHUNK_SIZE);
    loop {
        buf.reserve(COPY_CHUNK_SIZE);
        let read = file.read_buf(&mut buf).await?;
        if read == 0 {
            break;
        }
        if buf.len() >= COPY_CHUNK_SIZE {
            sink.send(buf.split().freeze()).await?;
        }
    }
    if !buf.is_empty() {
        sink.send(buf.split().freeze()).await?;
    }

    let rows = sink.finish().await?;
    debug!("Copied {} rows into {}", rows, table);
    Ok(rows)
}
