//! Serializes outgoing batches into the wire protocol

use std::sync::Arc;
use std::time::Instant;

use rusqlite::Connection;
use tracing::{debug, error, info};

use crate::db::{Dialect, Platform};
use crate::error::{Error, Result};
use crate::io::csv::{parse_line, CsvRow};
use crate::io::{Batch, CsvData, DataWriter, ProtocolDataWriter};
use crate::model::{
    elapsed_millis, Data, DataEventType, Node, OutgoingBatch, OutgoingBatchStatus, Table, TriggerHistory,
    TriggerRouter,
};
use crate::service::data::DataService;
use crate::service::node::NodeService;
use crate::service::outgoing_batch::OutgoingBatchService;
use crate::service::trigger_router::TriggerRouterService;

/// Protocol bytes for a node and the batches they carry
#[derive(Debug, Default)]
pub struct ExtractedBatches {
    pub payload: Vec<u8>,
    pub batches: Vec<OutgoingBatch>,
}

impl ExtractedBatches {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

pub struct DataExtractorService {
    nodes: Arc<NodeService>,
    trigger_routers: Arc<TriggerRouterService>,
    data: Arc<DataService>,
    outgoing_batches: Arc<OutgoingBatchService>,
    platform: Arc<Platform>,
    dialect: Arc<dyn Dialect>,
}

impl DataExtractorService {
    pub fn new(
        nodes: Arc<NodeService>,
        trigger_routers: Arc<TriggerRouterService>,
        data: Arc<DataService>,
        outgoing_batches: Arc<OutgoingBatchService>,
        platform: Arc<Platform>,
        dialect: Arc<dyn Dialect>,
    ) -> Self {
        Self {
            nodes,
            trigger_routers,
            data,
            outgoing_batches,
            platform,
            dialect,
        }
    }

    /// Extract every batch waiting for `target`.
    ///
    /// Each batch moves to QUERYING while it is read and to SENDING once it
    /// is in the payload. A batch that fails to extract is set to ERROR and
    /// ends the extraction; the payload holds only complete batches.
    /// IGNORED batches keep their status and go out as empty envelopes.
    pub fn extract(&self, conn: &Connection, target: &Node) -> Result<ExtractedBatches> {
        let local = self
            .nodes
            .find_identity(conn)?
            .ok_or_else(|| Error::Config("this node has no identity".into()))?;
        let batches = self
            .outgoing_batches
            .get_outgoing_batches(conn, &target.node_id)?;
        if batches.is_empty() {
            return Ok(ExtractedBatches::default());
        }

        let mut writer = ProtocolDataWriter::new(local.node_id.clone(), Vec::new());
        let mut extracted = Vec::with_capacity(batches.len());
        for mut batch in batches {
            let started = Instant::now();
            let ignored = batch.status == OutgoingBatchStatus::Ignored;
            if !ignored {
                batch.status = OutgoingBatchStatus::Querying;
            }
            batch.extract_count += 1;
            self.outgoing_batches.update_outgoing_batch(conn, &mut batch)?;

            let mark = writer.get_mut().len();
            match self.extract_outgoing_batch(conn, target, &mut writer, &batch) {
                Ok(rows) => {
                    if !ignored {
                        batch.status = OutgoingBatchStatus::Sending;
                    }
                    batch.sent_count += 1;
                    batch.byte_count = i64::try_from(writer.batch_bytes()).unwrap_or(i64::MAX);
                    batch.extract_millis = elapsed_millis(started);
                    self.outgoing_batches.update_outgoing_batch(conn, &mut batch)?;
                    debug!(
                        "Extracted batch {} with {} rows in {} bytes",
                        batch.node_batch_id(),
                        rows,
                        batch.byte_count
                    );
                    extracted.push(batch);
                }
                Err(e) => {
                    writer.get_mut().truncate(mark);
                    error!("Failed to extract batch {}: {}", batch.node_batch_id(), e);
                    let (sql_state, sql_code, sql_message) = e.sql_details();
                    batch.status = OutgoingBatchStatus::Error;
                    batch.sql_state = sql_state;
                    batch.sql_code = sql_code;
                    batch.sql_message = Some(sql_message);
                    self.outgoing_batches.update_outgoing_batch(conn, &mut batch)?;
                    break;
                }
            }
        }

        if !extracted.is_empty() {
            info!(
                "Extracted {} batches for node {}",
                extracted.len(),
                target.node_id
            );
        }
        Ok(ExtractedBatches {
            payload: writer.into_inner(),
            batches: extracted,
        })
    }

    /// Stream one batch through `writer`, returning the rows written.
    ///
    /// Rows come out in data id order; a table event is emitted whenever
    /// the target table changes between consecutive rows. An IGNORED batch
    /// is written as an `ignore` envelope with no rows.
    pub fn extract_outgoing_batch(
        &self,
        conn: &Connection,
        target: &Node,
        writer: &mut dyn DataWriter,
        batch: &OutgoingBatch,
    ) -> Result<usize> {
        let local_node_id = self
            .nodes
            .find_identity_node_id(conn)?
            .ok_or_else(|| Error::Config("this node has no identity".into()))?;
        let mut envelope = Batch::new(batch.batch_id, local_node_id, batch.channel_id.clone());
        if batch.status == OutgoingBatchStatus::Ignored {
            envelope.ignored = true;
            debug!("Sending batch {} as ignored", batch.node_batch_id());
            writer.start_batch(&envelope)?;
            writer.end_batch(&envelope)?;
            return Ok(0);
        }
        let rows = self.data.select_data_for_batch(conn, batch.batch_id)?;
        debug!(
            "Extracting {} data rows of batch {} for node {}",
            rows.len(),
            batch.batch_id,
            target.node_id
        );

        writer.start_batch(&envelope)?;
        let mut current: Option<Table> = None;
        let mut written = 0;
        for row in rows {
            let data = row.data;
            let history = self
                .trigger_routers
                .get_trigger_history(conn, data.trigger_hist_id)?
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "trigger history {} of data {}",
                        data.trigger_hist_id, data.data_id
                    ))
                })?;
            let trigger_router =
                self.trigger_routers
                    .find_trigger_router(conn, &history.trigger_id, &row.router_id)?;
            let table = target_table(&history, trigger_router.as_ref());

            if current.as_ref() != Some(&table) {
                if let Some(previous) = current.take() {
                    writer.end_table(&previous)?;
                }
                writer.start_table(&table)?;
                current = Some(table);
            }

            if data.event_type == DataEventType::Reload {
                written += self.extract_reload(conn, &history, &data, trigger_router.as_ref(), writer)?;
            } else {
                writer.write(&to_csv_data(&data, &history)?)?;
                written += 1;
            }
        }
        if let Some(table) = current {
            writer.end_table(&table)?;
        }
        writer.end_batch(&envelope)?;
        Ok(written)
    }

    /// Current rows of the source table, written as inserts
    fn extract_reload(
        &self,
        conn: &Connection,
        history: &TriggerHistory,
        data: &Data,
        trigger_router: Option<&TriggerRouter>,
        writer: &mut dyn DataWriter,
    ) -> Result<usize> {
        let table = self
            .platform
            .get_table(
                conn,
                history.source_catalog_name.as_deref(),
                history.source_schema_name.as_deref(),
                &history.source_table_name,
                true,
            )?
            .ok_or_else(|| Error::NotFound(format!("table {}", history.source_table_name)))?;
        let where_clause = data
            .row_data
            .as_deref()
            .or_else(|| trigger_router.and_then(|tr| tr.initial_load_select.as_deref()));
        let sql = self
            .dialect
            .template()
            .initial_load_sql(history, &table, where_clause)?;

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut written = 0;
        while let Some(row) = rows.next()? {
            let values: String = row.get(0)?;
            writer.write(&CsvData::insert(parse_line(&values)?))?;
            written += 1;
        }
        info!(
            "Extracted {} rows of {} for reload",
            written, history.source_table_name
        );
        Ok(written)
    }
}

/// Table as the target node knows it: router renames applied, captured
/// columns in capture order
fn target_table(history: &TriggerHistory, trigger_router: Option<&TriggerRouter>) -> Table {
    let mut table = history.to_table();
    if let Some(tr) = trigger_router {
        let router = &tr.router;
        table.name = tr.target_table_name(&history.source_table_name).to_string();
        let (catalog, schema) = if router.use_source_catalog_schema {
            (
                router.target_catalog_name.clone().or(table.catalog.take()),
                router.target_schema_name.clone().or(table.schema.take()),
            )
        } else {
            (
                router.target_catalog_name.clone(),
                router.target_schema_name.clone(),
            )
        };
        table.catalog = catalog;
        table.schema = schema;
    }
    table
}

fn to_csv_data(data: &Data, history: &TriggerHistory) -> Result<CsvData> {
    let missing = |what: &str| {
        Error::Internal(format!("{} data {} has no {}", data.event_type, data.data_id, what))
    };
    let csv = match data.event_type {
        DataEventType::Insert => {
            CsvData::insert(data.parsed_row_data()?.ok_or_else(|| missing("row data"))?)
        }
        DataEventType::Update => {
            let row = data.parsed_row_data()?.ok_or_else(|| missing("row data"))?;
            let pk = match data.parsed_pk_data()? {
                Some(pk) => pk,
                None => key_values(history, &row),
            };
            CsvData::update(row, pk).with_old(data.parsed_old_data()?)
        }
        DataEventType::Delete => {
            let old = data.parsed_old_data()?;
            let pk = match (data.parsed_pk_data()?, &old) {
                (Some(pk), _) => pk,
                (None, Some(old)) => key_values(history, old),
                (None, None) => return Err(missing("key data")),
            };
            CsvData::delete(pk).with_old(old)
        }
        DataEventType::Sql => CsvData::sql(text_of(data)?.ok_or_else(|| missing("sql"))?),
        DataEventType::Create => CsvData::create(text_of(data)?.ok_or_else(|| missing("ddl"))?),
        DataEventType::Bsh => CsvData::bsh(text_of(data)?.ok_or_else(|| missing("script"))?),
        DataEventType::Reload => {
            return Err(Error::Internal("reload data is extracted from the table".into()))
        }
    };
    Ok(csv)
}

fn text_of(data: &Data) -> Result<Option<String>> {
    Ok(data
        .parsed_row_data()?
        .and_then(|row| row.into_iter().next())
        .flatten())
}

/// Key column values picked out of a full row
fn key_values(history: &TriggerHistory, row: &CsvRow) -> CsvRow {
    let columns = history.parsed_column_names();
    history
        .parsed_pk_column_names()
        .iter()
        .map(|pk| {
            columns
                .iter()
                .position(|c| c == pk)
                .and_then(|i| row.get(i).cloned())
                .flatten()
        })
        .collect()
}
