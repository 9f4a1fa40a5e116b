//! Applies protocol events to the local database
//!
//! Every batch is loaded in its own transaction with change capture
//! suppressed, so replicated rows are not captured again. The batch is
//! first acquired through [`IncomingBatchService`]; a batch that was
//! already loaded or ignored is read but not applied.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use rusqlite::types::Value;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, error, info, warn};

use crate::db::schema::CONFIG_TABLES;
use crate::db::{in_transaction, Dialect, Platform};
use crate::error::{Error, Result};
use crate::io::csv::CsvRow;
use crate::io::data::{Batch, BinaryEncoding, CsvData};
use crate::io::writer::DataWriter;
use crate::model::{elapsed_millis, Column, DataEventType, IncomingBatch, IncomingBatchStatus, Table};
use crate::service::incoming_batch::IncomingBatchService;
use crate::service::parameter::{self, ParameterService};

/// Loader options read from parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseWriterSettings {
    /// Skip rows for tables that do not exist locally
    pub ignore_missing_tables: bool,
    /// Write missing tables with the column list carried in the batch
    pub use_source_table_shape: bool,
}

impl Default for DatabaseWriterSettings {
    fn default() -> Self {
        Self {
            ignore_missing_tables: false,
            use_source_table_shape: true,
        }
    }
}

impl DatabaseWriterSettings {
    pub fn from_parameters(parameters: &ParameterService) -> Self {
        let defaults = Self::default();
        Self {
            ignore_missing_tables: parameters.is(
                parameter::DATA_LOADER_IGNORE_MISSING_TABLES,
                defaults.ignore_missing_tables,
            ),
            use_source_table_shape: parameters.is(
                parameter::DATA_LOADER_USE_SOURCE_TABLE_SHAPE,
                defaults.use_source_table_shape,
            ),
        }
    }
}

/// Table rows are written to, with each written column's position in the
/// incoming row
#[derive(Debug, Clone)]
struct TargetTable {
    qualified_name: String,
    name: String,
    columns: Vec<(usize, Column)>,
    /// Key columns with their position among the incoming key values
    keys: Vec<(usize, Column)>,
    /// Position of each key column in the incoming row
    key_positions: Vec<Option<usize>>,
}

/// Batch being loaded
struct LoadState {
    batch: IncomingBatch,
    /// False when the batch was already loaded or ignored
    apply: bool,
    binary_encoding: BinaryEncoding,
    started: Instant,
    rows: i64,
}

pub struct DefaultDatabaseWriter<'a> {
    conn: &'a Connection,
    incoming_batches: &'a IncomingBatchService,
    platform: &'a Platform,
    dialect: &'a dyn Dialect,
    settings: DatabaseWriterSettings,
    tx: Option<Transaction<'a>>,
    state: Option<LoadState>,
    /// Resolved tables of the current batch; `None` skips the table's rows
    tables: HashMap<String, Option<TargetTable>>,
    current: Option<TargetTable>,
    skipping_table: bool,
    warned_missing: HashSet<String>,
    completed: Vec<IncomingBatch>,
    config_touched: bool,
}

impl<'a> DefaultDatabaseWriter<'a> {
    pub fn new(
        conn: &'a Connection,
        incoming_batches: &'a IncomingBatchService,
        platform: &'a Platform,
        dialect: &'a dyn Dialect,
        settings: DatabaseWriterSettings,
    ) -> Self {
        Self {
            conn,
            incoming_batches,
            platform,
            dialect,
            settings,
            tx: None,
            state: None,
            tables: HashMap::new(),
            current: None,
            skipping_table: false,
            warned_missing: HashSet::new(),
            completed: Vec::new(),
            config_touched: false,
        }
    }

    /// Batches that finished loading, failed or were skipped, in stream order
    pub fn completed(&self) -> &[IncomingBatch] {
        &self.completed
    }

    pub fn into_completed(self) -> Vec<IncomingBatch> {
        self.completed
    }

    /// Whether a loaded batch changed trigger, router or channel configuration
    pub fn config_touched(&self) -> bool {
        self.config_touched
    }

    fn state_mut(&mut self) -> Result<&mut LoadState> {
        self.state
            .as_mut()
            .ok_or_else(|| Error::Internal("no batch is being loaded".into()))
    }

    fn resolve_table(&mut self, table: &Table) -> Result<Option<TargetTable>> {
        let key = table.fully_qualified_name();
        if let Some(resolved) = self.tables.get(&key) {
            return Ok(resolved.clone());
        }

        let local = self.platform.get_table(
            self.conn,
            table.catalog.as_deref(),
            table.schema.as_deref(),
            &table.name,
            true,
        )?;
        let shape = match local {
            Some(local) => Some(local),
            None if self.settings.ignore_missing_tables => {
                if self.warned_missing.insert(key.clone()) {
                    warn!("Table {} is missing, its rows will be skipped", key);
                }
                None
            }
            None if self.settings.use_source_table_shape => {
                debug!("Table {} is not known locally, using the incoming shape", key);
                Some(table.clone())
            }
            None => return Err(Error::NotFound(format!("table {}", key))),
        };

        let resolved = shape.map(|local| target_table(table, &local));
        if let Some(target) = &resolved {
            if CONFIG_TABLES
                .iter()
                .any(|name| name.eq_ignore_ascii_case(&target.name))
            {
                self.config_touched = true;
            }
        }
        self.tables.insert(key, resolved.clone());
        Ok(resolved)
    }

    fn apply(&mut self, data: &CsvData) -> Result<()> {
        let binary_encoding = self.state_mut()?.binary_encoding;
        match data.event_type {
            DataEventType::Insert | DataEventType::Update | DataEventType::Delete => {
                let target = match (&self.current, self.skipping_table) {
                    (_, true) => return Ok(()),
                    (Some(target), false) => target.clone(),
                    (None, false) => return Err(Error::Internal("row data before table".into())),
                };
                self.apply_dml(&target, data, binary_encoding)
            }
            DataEventType::Sql => {
                let sql = data.text_value().unwrap_or_default();
                debug!("Running sql event: {}", sql);
                self.conn.execute_batch(sql)?;
                self.state_mut()?.batch.statement_count += 1;
                Ok(())
            }
            DataEventType::Create => {
                let ddl = data.text_value().unwrap_or_default();
                info!("Running create event: {}", ddl);
                self.conn.execute_batch(ddl)?;
                self.platform.reset_cache();
                self.tables.clear();
                self.state_mut()?.batch.statement_count += 1;
                Ok(())
            }
            DataEventType::Bsh => {
                warn!("Skipping bsh event; scripts are not supported");
                Ok(())
            }
            DataEventType::Reload => Err(Error::Internal(
                "reload events are not sent over the wire".into(),
            )),
        }
    }

    fn apply_dml(&mut self, target: &TargetTable, data: &CsvData, encoding: BinaryEncoding) -> Result<()> {
        let conn = self.conn;
        let empty = Vec::new();
        let row = data.row_data.as_ref().unwrap_or(&empty);
        match data.event_type {
            DataEventType::Insert => {
                let values = column_values(target, row, encoding)?;
                match insert(conn, target, &values) {
                    Ok(_) => {}
                    Err(e) if e.is_unique_violation() => {
                        let keys = keys_from_row(target, row, encoding)?;
                        update(conn, target, &values, &keys)?;
                        self.state_mut()?.batch.fallback_update_count += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            DataEventType::Update => {
                let values = column_values(target, row, encoding)?;
                let keys = match &data.pk_data {
                    Some(pk) if !pk.is_empty() => key_values(target, pk, encoding)?,
                    _ => keys_from_row(target, row, encoding)?,
                };
                if update(conn, target, &values, &keys)? == 0 {
                    insert(conn, target, &values)?;
                    self.state_mut()?.batch.fallback_insert_count += 1;
                }
            }
            DataEventType::Delete => {
                let pk = data.pk_data.as_ref().unwrap_or(&empty);
                let keys = key_values(target, pk, encoding)?;
                if delete(conn, target, &keys)? == 0 {
                    self.state_mut()?.batch.missing_delete_count += 1;
                }
            }
            _ => {}
        }
        self.state_mut()?.batch.statement_count += 1;
        Ok(())
    }

    fn reset_batch(&mut self) {
        self.tx = None;
        self.state = None;
        self.tables.clear();
        self.current = None;
        self.skipping_table = false;
    }
}

impl DataWriter for DefaultDatabaseWriter<'_> {
    fn start_batch(&mut self, batch: &Batch) -> Result<()> {
        let mut incoming = IncomingBatch::new(
            batch.batch_id,
            batch.source_node_id.clone(),
            batch.channel_id.clone(),
        );
        let incoming_batches = self.incoming_batches;
        let apply = in_transaction(self.conn, |tx| {
            incoming_batches.acquire_incoming_batch(tx, &mut incoming)
        })?;

        if apply {
            let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
            self.dialect
                .disable_sync_triggers(&tx, Some(&batch.source_node_id))?;
            self.tx = Some(tx);
            debug!("Loading batch {}", incoming.node_batch_id());
        }
        self.state = Some(LoadState {
            batch: incoming,
            apply,
            binary_encoding: batch.binary_encoding,
            started: Instant::now(),
            rows: 0,
        });
        Ok(())
    }

    fn start_table(&mut self, table: &Table) -> Result<bool> {
        if !self.state_mut()?.apply {
            return Ok(false);
        }
        self.current = self.resolve_table(table)?;
        self.skipping_table = self.current.is_none();
        Ok(!self.skipping_table)
    }

    fn write(&mut self, data: &CsvData) -> Result<()> {
        if !self.state_mut()?.apply {
            return Ok(());
        }
        self.apply(data)?;
        self.state_mut()?.rows += 1;
        Ok(())
    }

    fn end_table(&mut self, _table: &Table) -> Result<()> {
        self.current = None;
        self.skipping_table = false;
        Ok(())
    }

    fn end_batch(&mut self, batch: &Batch) -> Result<()> {
        let mut state = self
            .state
            .take()
            .ok_or_else(|| Error::Internal("end of a batch that was not started".into()))?;
        if !state.apply {
            self.completed.push(state.batch);
            self.reset_batch();
            return Ok(());
        }

        let tx = self
            .tx
            .take()
            .ok_or_else(|| Error::Internal("batch transaction is not open".into()))?;
        let finished = (|| {
            self.dialect.enable_sync_triggers(&tx)?;
            state.batch.status = IncomingBatchStatus::Ok;
            if batch.ignored {
                state.batch.ignore_count += 1;
            }
            state.batch.byte_count = i64::try_from(batch.byte_count).unwrap_or(i64::MAX);
            state.batch.database_millis = elapsed_millis(state.started);
            self.incoming_batches.record_outcome(&tx, &mut state.batch)?;
            tx.commit()?;
            Ok::<(), Error>(())
        })();

        if let Err(e) = finished {
            // Restore the state so the reader's abort can record the failure
            self.state = Some(state);
            return Err(e);
        }
        debug!(
            "Loaded batch {} with {} statements",
            state.batch.node_batch_id(),
            state.batch.statement_count
        );
        self.completed.push(state.batch);
        self.reset_batch();
        Ok(())
    }

    fn abort_batch(&mut self, batch: &Batch, error: &Error) -> Result<()> {
        self.tx = None;
        let mut state = match self.state.take() {
            Some(state) => state,
            None => {
                self.reset_batch();
                return Ok(());
            }
        };
        if !state.apply {
            self.reset_batch();
            return Ok(());
        }

        let (sql_state, sql_code, sql_message) = error.sql_details();
        let incoming = &mut state.batch;
        incoming.status = IncomingBatchStatus::Error;
        incoming.failed_row_number = state.rows;
        if let Error::Protocol { line, .. } = error {
            incoming.failed_line_number = i64::try_from(*line).unwrap_or(i64::MAX);
        }
        incoming.byte_count = i64::try_from(batch.byte_count).unwrap_or(i64::MAX);
        incoming.database_millis = elapsed_millis(state.started);
        incoming.sql_state = sql_state;
        incoming.sql_code = sql_code;
        incoming.sql_message = Some(sql_message);
        error!(
            "Failed to load batch {} at row {}: {}",
            incoming.node_batch_id(),
            incoming.failed_row_number,
            error
        );

        let incoming_batches = self.incoming_batches;
        let recorded = in_transaction(self.conn, |tx| incoming_batches.record_outcome(tx, incoming));
        self.completed.push(state.batch);
        self.reset_batch();
        recorded
    }
}

/// Match incoming columns to the local table, dropping columns it lacks
fn target_table(incoming: &Table, local: &Table) -> TargetTable {
    let columns: Vec<(usize, Column)> = incoming
        .columns
        .iter()
        .enumerate()
        .filter_map(|(i, c)| match local.find_column(&c.name) {
            Some(found) => Some((i, found.clone())),
            None => {
                debug!(
                    "Column {} is not in {}, its values are dropped",
                    c.name, local.name
                );
                None
            }
        })
        .collect();

    let mut incoming_keys: Vec<&Column> = incoming.primary_key_columns();
    if incoming_keys.is_empty() {
        incoming_keys = incoming.columns.iter().collect();
    }
    let keys: Vec<(usize, Column)> = incoming_keys
        .iter()
        .enumerate()
        .filter_map(|(i, c)| local.find_column(&c.name).map(|found| (i, found.clone())))
        .collect();
    let key_positions = keys
        .iter()
        .map(|(_, key)| {
            incoming
                .columns
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(&key.name))
        })
        .collect();

    let schema_prefix = local
        .schema
        .as_deref()
        .map(|s| format!("{}.", quote(s)))
        .unwrap_or_default();
    TargetTable {
        qualified_name: format!("{}{}", schema_prefix, quote(&local.name)),
        name: local.name.clone(),
        columns,
        keys,
        key_positions,
    }
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn to_value(column: &Column, value: Option<&String>, encoding: BinaryEncoding) -> Result<Value> {
    Ok(match value {
        None => Value::Null,
        Some(text) if column.column_type.is_binary() => Value::Blob(encoding.decode(text)?),
        Some(text) => Value::Text(text.clone()),
    })
}

fn column_values(target: &TargetTable, row: &CsvRow, encoding: BinaryEncoding) -> Result<Vec<(String, Value)>> {
    target
        .columns
        .iter()
        .map(|(i, column)| {
            let value = row.get(*i).and_then(|v| v.as_ref());
            Ok((column.name.clone(), to_value(column, value, encoding)?))
        })
        .collect()
}

fn key_values(target: &TargetTable, pk: &CsvRow, encoding: BinaryEncoding) -> Result<Vec<(String, Value)>> {
    target
        .keys
        .iter()
        .map(|(i, column)| {
            let value = pk.get(*i).and_then(|v| v.as_ref());
            Ok((column.name.clone(), to_value(column, value, encoding)?))
        })
        .collect()
}

fn keys_from_row(target: &TargetTable, row: &CsvRow, encoding: BinaryEncoding) -> Result<Vec<(String, Value)>> {
    target
        .keys
        .iter()
        .zip(&target.key_positions)
        .map(|((_, column), position)| {
            let value = position.and_then(|p| row.get(p)).and_then(|v| v.as_ref());
            Ok((column.name.clone(), to_value(column, value, encoding)?))
        })
        .collect()
}

/// `"k" = ?n` for set keys, `"k" is null` for null keys
fn where_clause(keys: &[(String, Value)], first_param: usize, params: &mut Vec<Value>) -> String {
    let mut next = first_param;
    keys.iter()
        .map(|(name, value)| {
            if *value == Value::Null {
                format!("{} is null", quote(name))
            } else {
                params.push(value.clone());
                let clause = format!("{} = ?{}", quote(name), next);
                next += 1;
                clause
            }
        })
        .collect::<Vec<_>>()
        .join(" and ")
}

fn insert(conn: &Connection, target: &TargetTable, values: &[(String, Value)]) -> Result<usize> {
    let names = values.iter().map(|(n, _)| quote(n)).collect::<Vec<_>>().join(", ");
    let params = (1..=values.len()).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ");
    let sql = format!(
        "insert into {} ({}) values ({})",
        target.qualified_name, names, params
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let count = stmt.execute(rusqlite::params_from_iter(values.iter().map(|(_, v)| v)))?;
    Ok(count)
}

fn update(
    conn: &Connection,
    target: &TargetTable,
    values: &[(String, Value)],
    keys: &[(String, Value)],
) -> Result<usize> {
    if keys.is_empty() {
        return Err(Error::Internal(format!("no key columns to update {}", target.name)));
    }
    let mut params: Vec<Value> = values.iter().map(|(_, v)| v.clone()).collect();
    let assignments = values
        .iter()
        .enumerate()
        .map(|(i, (n, _))| format!("{} = ?{}", quote(n), i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let filter = where_clause(keys, values.len() + 1, &mut params);
    let sql = format!(
        "update {} set {} where {}",
        target.qualified_name, assignments, filter
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.execute(rusqlite::params_from_iter(params.iter()))?)
}

fn delete(conn: &Connection, target: &TargetTable, keys: &[(String, Value)]) -> Result<usize> {
    if keys.is_empty() {
        return Err(Error::Internal(format!("no key columns to delete from {}", target.name)));
    }
    let mut params = Vec::new();
    let filter = where_clause(keys, 1, &mut params);
    let sql = format!("delete from {} where {}", target.qualified_name, filter);
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.execute(rusqlite::params_from_iter(params.iter()))?)
}
