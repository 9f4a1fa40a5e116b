//! Incoming batch bookkeeping and the redelivery guard

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::{now_timestamp, IncomingBatch, IncomingBatchStatus};
use crate::service::outgoing_batch::host_name;
use crate::service::parameter::{self, ParameterService};

const SELECT_INCOMING_BATCH: &str = r#"
    SELECT batch_id, node_id, channel_id, status, error_flag, network_millis, filter_millis,
           database_millis, failed_row_number, failed_line_number, byte_count,
           statement_count, fallback_insert_count, fallback_update_count, ignore_count,
           missing_delete_count, skip_count, sql_state, sql_code, sql_message,
           last_update_hostname, last_update_time, create_time
    FROM sym_incoming_batch
"#;

pub struct IncomingBatchService {
    parameters: Arc<ParameterService>,
}

impl IncomingBatchService {
    pub fn new(parameters: Arc<ParameterService>) -> Self {
        Self { parameters }
    }

    fn record_ok_batches(&self) -> bool {
        self.parameters.is(parameter::INCOMING_BATCHES_RECORD_OK, true)
    }

    fn skip_duplicates(&self) -> bool {
        self.parameters.is(parameter::INCOMING_BATCHES_SKIP_DUPLICATES, true)
    }

    /// Decide whether a delivered batch should be loaded.
    ///
    /// Returns false when the batch was already loaded or was ignored by an
    /// operator; the stored row then records the skip or ignore. Must run in
    /// the same transaction as any later update of the row.
    pub fn acquire_incoming_batch(&self, conn: &Connection, batch: &mut IncomingBatch) -> Result<bool> {
        let existing = if self.record_ok_batches() {
            match self.insert_incoming_batch(conn, batch) {
                Ok(()) => return Ok(true),
                Err(e) if e.is_unique_violation() => {
                    self.find_incoming_batch(conn, batch.batch_id, &batch.node_id)?
                }
                Err(e) => return Err(e),
            }
        } else {
            match self.find_incoming_batch(conn, batch.batch_id, &batch.node_id)? {
                Some(existing) => Some(existing),
                None => return Ok(true),
            }
        };

        let existing = match existing {
            Some(existing) => existing,
            None => return Ok(true),
        };

        batch.retry = true;
        let process = match existing.status {
            IncomingBatchStatus::Error | IncomingBatchStatus::Loading => {
                info!("Retrying batch {}", batch.node_batch_id());
                true
            }
            _ if !self.skip_duplicates() => {
                info!(
                    "Reloading batch {} that was already {}",
                    batch.node_batch_id(),
                    existing.status
                );
                true
            }
            IncomingBatchStatus::Ignored => {
                info!("Ignoring batch {}", batch.node_batch_id());
                batch.status = IncomingBatchStatus::Ignored;
                batch.copy_statistics_from(&existing);
                batch.ignore_count = existing.ignore_count + 1;
                batch.skip_count = existing.skip_count;
                false
            }
            IncomingBatchStatus::Ok => {
                warn!(
                    "Skipping batch {} because it was already loaded",
                    batch.node_batch_id()
                );
                batch.status = IncomingBatchStatus::Ok;
                batch.copy_statistics_from(&existing);
                batch.skip_count = existing.skip_count + 1;
                false
            }
        };

        if process {
            batch.status = IncomingBatchStatus::Loading;
            batch.skip_count = existing.skip_count;
            batch.ignore_count = existing.ignore_count;
        }
        batch.sql_state = if process { None } else { existing.sql_state.clone() };
        batch.sql_code = if process { 0 } else { existing.sql_code };
        batch.sql_message = if process { None } else { existing.sql_message.clone() };
        self.update_incoming_batch(conn, batch)?;
        Ok(process)
    }

    pub fn insert_incoming_batch(&self, conn: &Connection, batch: &mut IncomingBatch) -> Result<()> {
        let now = now_timestamp();
        batch.create_time = Some(now.clone());
        batch.last_update_time = Some(now);
        batch.last_update_hostname = Some(host_name());
        batch.error_flag = batch.status == IncomingBatchStatus::Error;
        conn.execute(
            r#"
            INSERT INTO sym_incoming_batch (batch_id, node_id, channel_id, status, error_flag,
                network_millis, filter_millis, database_millis, failed_row_number,
                failed_line_number, byte_count, statement_count, fallback_insert_count,
                fallback_update_count, ignore_count, missing_delete_count, skip_count,
                sql_state, sql_code, sql_message, last_update_hostname, last_update_time,
                create_time)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                ?18, ?19, ?20, ?21, ?22, ?23)
            "#,
            params![
                batch.batch_id,
                batch.node_id,
                batch.channel_id,
                batch.status.code(),
                batch.error_flag,
                batch.network_millis,
                batch.filter_millis,
                batch.database_millis,
                batch.failed_row_number,
                batch.failed_line_number,
                batch.byte_count,
                batch.statement_count,
                batch.fallback_insert_count,
                batch.fallback_update_count,
                batch.ignore_count,
                batch.missing_delete_count,
                batch.skip_count,
                batch.sql_state,
                batch.sql_code,
                batch.sql_message,
                batch.last_update_hostname,
                batch.last_update_time,
                batch.create_time,
            ],
        )?;
        Ok(())
    }

    /// Persist status and statistics; returns the number of rows changed
    pub fn update_incoming_batch(&self, conn: &Connection, batch: &mut IncomingBatch) -> Result<usize> {
        batch.error_flag = batch.status == IncomingBatchStatus::Error;
        batch.last_update_time = Some(now_timestamp());
        batch.last_update_hostname = Some(host_name());
        let updated = conn.execute(
            r#"
            UPDATE sym_incoming_batch SET status = ?3, error_flag = ?4, network_millis = ?5,
                filter_millis = ?6, database_millis = ?7, failed_row_number = ?8,
                failed_line_number = ?9, byte_count = ?10, statement_count = ?11,
                fallback_insert_count = ?12, fallback_update_count = ?13, ignore_count = ?14,
                missing_delete_count = ?15, skip_count = ?16, sql_state = ?17, sql_code = ?18,
                sql_message = ?19, last_update_hostname = ?20, last_update_time = ?21
            WHERE batch_id = ?1 AND node_id = ?2
            "#,
            params![
                batch.batch_id,
                batch.node_id,
                batch.status.code(),
                batch.error_flag,
                batch.network_millis,
                batch.filter_millis,
                batch.database_millis,
                batch.failed_row_number,
                batch.failed_line_number,
                batch.byte_count,
                batch.statement_count,
                batch.fallback_insert_count,
                batch.fallback_update_count,
                batch.ignore_count,
                batch.missing_delete_count,
                batch.skip_count,
                batch.sql_state,
                batch.sql_code,
                batch.sql_message,
                batch.last_update_hostname,
                batch.last_update_time,
            ],
        )?;
        Ok(updated)
    }

    /// Record the final outcome of a load.
    ///
    /// Without `incoming.batches.record.ok.enabled` a successful batch leaves
    /// no row behind and failures are inserted on first sight.
    pub fn record_outcome(&self, conn: &Connection, batch: &mut IncomingBatch) -> Result<()> {
        if batch.status == IncomingBatchStatus::Ok && !self.record_ok_batches() {
            self.delete_incoming_batch(conn, batch)?;
            return Ok(());
        }
        if self.update_incoming_batch(conn, batch)? == 0 {
            self.insert_incoming_batch(conn, batch)?;
        }
        Ok(())
    }

    pub fn delete_incoming_batch(&self, conn: &Connection, batch: &IncomingBatch) -> Result<()> {
        conn.execute(
            "DELETE FROM sym_incoming_batch WHERE batch_id = ?1 AND node_id = ?2",
            params![batch.batch_id, batch.node_id],
        )?;
        Ok(())
    }

    pub fn find_incoming_batch(
        &self,
        conn: &Connection,
        batch_id: i64,
        node_id: &str,
    ) -> Result<Option<IncomingBatch>> {
        let sql = format!("{} WHERE batch_id = ?1 AND node_id = ?2", SELECT_INCOMING_BATCH);
        conn.query_row(&sql, params![batch_id, node_id], map_incoming_batch)
            .optional()?
            .transpose()
    }

    /// Most recent batches, newest first
    pub fn list_incoming_batches(
        &self,
        conn: &Connection,
        status: Option<IncomingBatchStatus>,
        limit: i64,
    ) -> Result<Vec<IncomingBatch>> {
        let rows = match status {
            Some(status) => {
                let sql = format!(
                    "{} WHERE status = ?1 ORDER BY create_time DESC, batch_id DESC LIMIT ?2",
                    SELECT_INCOMING_BATCH
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt
                    .query_map(params![status.code(), limit], map_incoming_batch)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let sql = format!(
                    "{} ORDER BY create_time DESC, batch_id DESC LIMIT ?1",
                    SELECT_INCOMING_BATCH
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt
                    .query_map(params![limit], map_incoming_batch)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
        };
        rows.into_iter().collect()
    }
}

fn map_incoming_batch(row: &Row<'_>) -> rusqlite::Result<Result<IncomingBatch>> {
    let code: String = row.get(3)?;
    let status = match IncomingBatchStatus::from_code(&code) {
        Some(status) => status,
        None => {
            return Ok(Err(Error::Internal(format!(
                "unknown incoming batch status '{}'",
                code
            ))))
        }
    };
    let mut batch = IncomingBatch::new(
        row.get::<_, i64>(0)?,
        row.get::<_, String>(1)?,
        row.get::<_, Option<String>>(2)?.unwrap_or_default(),
    );
    batch.status = status;
    batch.error_flag = row.get::<_, Option<bool>>(4)?.unwrap_or(false);
    batch.network_millis = row.get(5)?;
    batch.filter_millis = row.get(6)?;
    batch.database_millis = row.get(7)?;
    batch.failed_row_number = row.get(8)?;
    batch.failed_line_number = row.get(9)?;
    batch.byte_count = row.get(10)?;
    batch.statement_count = row.get(11)?;
    batch.fallback_insert_count = row.get(12)?;
    batch.fallback_update_count = row.get(13)?;
    batch.ignore_count = row.get(14)?;
    batch.missing_delete_count = row.get(15)?;
    batch.skip_count = row.get(16)?;
    batch.sql_state = row.get(17)?;
    batch.sql_code = row.get(18)?;
    batch.sql_message = row.get(19)?;
    batch.last_update_hostname = row.get(20)?;
    batch.last_update_time = row.get(21)?;
    batch.create_time = row.get(22)?;
    Ok(Ok(batch))
}
