//! Outgoing batch persistence and selection

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{now_timestamp, OutgoingBatch, OutgoingBatchStatus};
use crate::service::configuration::ConfigurationService;
use crate::service::sequence::{SequenceService, OUTGOING_BATCH};

const SELECT_OUTGOING_BATCH: &str = r#"
    SELECT batch_id, node_id, channel_id, status, load_flag, error_flag, common_flag,
           ignore_count, byte_count, extract_count, sent_count, load_count, data_event_count,
           reload_event_count, insert_event_count, update_event_count, delete_event_count,
           other_event_count, router_millis, network_millis, filter_millis, load_millis,
           extract_millis, sql_state, sql_code, sql_message, failed_data_id,
           failed_line_number, last_update_hostname, last_update_time, create_time, create_by
    FROM sym_outgoing_batch
"#;

pub struct OutgoingBatchService {
    sequences: Arc<SequenceService>,
    configuration: Arc<ConfigurationService>,
}

impl OutgoingBatchService {
    pub fn new(sequences: Arc<SequenceService>, configuration: Arc<ConfigurationService>) -> Self {
        Self {
            sequences,
            configuration,
        }
    }

    /// Allocate a batch id and store the batch
    pub fn insert_outgoing_batch(&self, conn: &Connection, batch: &mut OutgoingBatch) -> Result<()> {
        batch.batch_id = self.sequences.next_val(conn, OUTGOING_BATCH)?;
        let now = now_timestamp();
        batch.create_time = Some(now.clone());
        batch.last_update_time = Some(now);
        batch.last_update_hostname = Some(host_name());
        conn.execute(
            r#"
            INSERT INTO sym_outgoing_batch (batch_id, node_id, channel_id, status, load_flag,
                error_flag, common_flag, ignore_count, byte_count, extract_count, sent_count,
                load_count, data_event_count, reload_event_count, insert_event_count,
                update_event_count, delete_event_count, other_event_count, router_millis,
                network_millis, filter_millis, load_millis, extract_millis, sql_state, sql_code,
                sql_message, failed_data_id, failed_line_number, last_update_hostname,
                last_update_time, create_time, create_by)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32)
            "#,
            params![
                batch.batch_id,
                batch.node_id,
                batch.channel_id,
                batch.status.code(),
                batch.load_flag,
                batch.error_flag,
                batch.common_flag,
                batch.ignore_count,
                batch.byte_count,
                batch.extract_count,
                batch.sent_count,
                batch.load_count,
                batch.data_event_count,
                batch.reload_event_count,
                batch.insert_event_count,
                batch.update_event_count,
                batch.delete_event_count,
                batch.other_event_count,
                batch.router_millis,
                batch.network_millis,
                batch.filter_millis,
                batch.load_millis,
                batch.extract_millis,
                batch.sql_state,
                batch.sql_code,
                batch.sql_message,
                batch.failed_data_id,
                batch.failed_line_number,
                batch.last_update_hostname,
                batch.last_update_time,
                batch.create_time,
                batch.create_by,
            ],
        )?;
        debug!("Created outgoing batch {}", batch.node_batch_id());
        Ok(())
    }

    /// Persist status, counters and error details of a batch
    pub fn update_outgoing_batch(&self, conn: &Connection, batch: &mut OutgoingBatch) -> Result<()> {
        batch.error_flag = batch.status == OutgoingBatchStatus::Error;
        batch.last_update_time = Some(now_timestamp());
        batch.last_update_hostname = Some(host_name());
        let updated = conn.execute(
            r#"
            UPDATE sym_outgoing_batch SET status = ?3, load_flag = ?4, error_flag = ?5,
                common_flag = ?6, ignore_count = ?7, byte_count = ?8, extract_count = ?9,
                sent_count = ?10, load_count = ?11, data_event_count = ?12,
                reload_event_count = ?13, insert_event_count = ?14, update_event_count = ?15,
                delete_event_count = ?16, other_event_count = ?17, router_millis = ?18,
                network_millis = ?19, filter_millis = ?20, load_millis = ?21,
                extract_millis = ?22, sql_state = ?23, sql_code = ?24, sql_message = ?25,
                failed_data_id = ?26, failed_line_number = ?27, last_update_hostname = ?28,
                last_update_time = ?29
            WHERE batch_id = ?1 AND node_id = ?2
            "#,
            params![
                batch.batch_id,
                batch.node_id,
                batch.status.code(),
                batch.load_flag,
                batch.error_flag,
                batch.common_flag,
                batch.ignore_count,
                batch.byte_count,
                batch.extract_count,
                batch.sent_count,
                batch.load_count,
                batch.data_event_count,
                batch.reload_event_count,
                batch.insert_event_count,
                batch.update_event_count,
                batch.delete_event_count,
                batch.other_event_count,
                batch.router_millis,
                batch.network_millis,
                batch.filter_millis,
                batch.load_millis,
                batch.extract_millis,
                batch.sql_state,
                batch.sql_code,
                batch.sql_message,
                batch.failed_data_id,
                batch.failed_line_number,
                batch.last_update_hostname,
                batch.last_update_time,
            ],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!(
                "outgoing batch {}",
                batch.node_batch_id()
            )));
        }
        Ok(())
    }

    /// Find a batch by id; batch ids are unique, so `node_id` only narrows the lookup
    pub fn find_outgoing_batch(
        &self,
        conn: &Connection,
        batch_id: i64,
        node_id: Option<&str>,
    ) -> Result<Option<OutgoingBatch>> {
        let batch = match node_id {
            Some(node_id) => {
                let sql = format!("{} WHERE batch_id = ?1 AND node_id = ?2", SELECT_OUTGOING_BATCH);
                conn.query_row(&sql, params![batch_id, node_id], map_outgoing_batch)
                    .optional()?
            }
            None => {
                let sql = format!("{} WHERE batch_id = ?1 LIMIT 1", SELECT_OUTGOING_BATCH);
                conn.query_row(&sql, params![batch_id], map_outgoing_batch)
                    .optional()?
            }
        };
        batch.transpose()
    }

    /// Batches waiting to be sent to a node.
    ///
    /// Ordered by batch id, skipping disabled channels and keeping at most
    /// `max_batch_to_send` batches per channel. IGNORED batches are included
    /// until the node has acknowledged them once (`load_count` > 0).
    pub fn get_outgoing_batches(&self, conn: &Connection, node_id: &str) -> Result<Vec<OutgoingBatch>> {
        let sql = format!(
            "{} WHERE node_id = ?1 AND status NOT IN ('OK', 'RT') \
             AND NOT (status = 'IG' AND load_count > 0) ORDER BY batch_id",
            SELECT_OUTGOING_BATCH
        );
        let batches = self.query_batches(conn, &sql, params![node_id])?;
        let channels = self.configuration.get_channels(conn, false)?;

        let mut per_channel: HashMap<String, i32> = HashMap::new();
        let mut selected = Vec::with_capacity(batches.len());
        for batch in batches {
            let limit = match channels.get(&batch.channel_id) {
                Some(channel) if !channel.enabled => continue,
                Some(channel) => channel.max_batch_to_send,
                None => i32::MAX,
            };
            let count = per_channel.entry(batch.channel_id.clone()).or_insert(0);
            if *count >= limit {
                continue;
            }
            *count += 1;
            selected.push(batch);
        }
        Ok(selected)
    }

    /// Batches in a status, newest first
    pub fn find_outgoing_batches_by_status(
        &self,
        conn: &Connection,
        status: Option<OutgoingBatchStatus>,
        limit: i64,
    ) -> Result<Vec<OutgoingBatch>> {
        match status {
            Some(status) => {
                let sql = format!(
                    "{} WHERE status = ?1 ORDER BY batch_id DESC LIMIT ?2",
                    SELECT_OUTGOING_BATCH
                );
                self.query_batches(conn, &sql, params![status.code(), limit])
            }
            None => {
                let sql = format!("{} ORDER BY batch_id DESC LIMIT ?1", SELECT_OUTGOING_BATCH);
                self.query_batches(conn, &sql, params![limit])
            }
        }
    }

    /// Number of batches per status code
    pub fn count_batches_by_status(&self, conn: &Connection) -> Result<HashMap<String, i64>> {
        let mut stmt = conn.prepare_cached(
            "SELECT status, COUNT(*) FROM sym_outgoing_batch WHERE node_id != '-1' GROUP BY status",
        )?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;
        Ok(counts)
    }

    /// Operator override: force a batch to OK or IGNORED
    pub fn mark_batch(
        &self,
        conn: &Connection,
        node_id: &str,
        batch_id: i64,
        status: OutgoingBatchStatus,
    ) -> Result<OutgoingBatch> {
        let mut batch = self
            .find_outgoing_batch(conn, batch_id, Some(node_id))?
            .ok_or_else(|| Error::NotFound(format!("outgoing batch {}-{}", node_id, batch_id)))?;
        if status == OutgoingBatchStatus::Ignored {
            batch.ignore_count += 1;
        }
        batch.status = status;
        self.update_outgoing_batch(conn, &mut batch)?;
        info!("Marked outgoing batch {} as {}", batch.node_batch_id(), status);
        Ok(batch)
    }

    fn query_batches<P: rusqlite::Params>(
        &self,
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> Result<Vec<OutgoingBatch>> {
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params, map_outgoing_batch)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }
}

/// Host name recorded on batches this node updates
pub(crate) fn host_name() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}

fn map_outgoing_batch(row: &Row<'_>) -> rusqlite::Result<Result<OutgoingBatch>> {
    let code: String = row.get(3)?;
    let status = match OutgoingBatchStatus::from_code(&code) {
        Some(status) => status,
        None => {
            return Ok(Err(Error::Internal(format!(
                "unknown outgoing batch status '{}'",
                code
            ))))
        }
    };
    let mut batch = OutgoingBatch::new(row.get::<_, String>(1)?, row.get::<_, Option<String>>(2)?.unwrap_or_default(), status);
    batch.batch_id = row.get(0)?;
    batch.load_flag = row.get::<_, Option<bool>>(4)?.unwrap_or(false);
    batch.error_flag = row.get::<_, Option<bool>>(5)?.unwrap_or(false);
    batch.common_flag = row.get::<_, Option<bool>>(6)?.unwrap_or(false);
    batch.ignore_count = row.get(7)?;
    batch.byte_count = row.get(8)?;
    batch.extract_count = row.get(9)?;
    batch.sent_count = row.get(10)?;
    batch.load_count = row.get(11)?;
    batch.data_event_count = row.get(12)?;
    batch.reload_event_count = row.get(13)?;
    batch.insert_event_count = row.get(14)?;
    batch.update_event_count = row.get(15)?;
    batch.delete_event_count = row.get(16)?;
    batch.other_event_count = row.get(17)?;
    batch.router_millis = row.get(18)?;
    batch.network_millis = row.get(19)?;
    batch.filter_millis = row.get(20)?;
    batch.load_millis = row.get(21)?;
    batch.extract_millis = row.get(22)?;
    batch.sql_state = row.get(23)?;
    batch.sql_code = row.get(24)?;
    batch.sql_message = row.get(25)?;
    batch.failed_data_id = row.get(26)?;
    batch.failed_line_number = row.get(27)?;
    batch.last_update_hostname = row.get(28)?;
    batch.last_update_time = row.get(29)?;
    batch.create_time = row.get(30)?;
    batch.create_by = row.get(31)?;
    Ok(Ok(batch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::create_sym_tables;
    use crate::model::{Channel, DataEventType};

    fn setup() -> (Connection, OutgoingBatchService, Arc<ConfigurationService>) {
        let conn = Connection::open_in_memory().unwrap();
        create_sym_tables(&conn).unwrap();
        let sequences = Arc::new(SequenceService::new());
        sequences.init(&conn).unwrap();
        let configuration = Arc::new(ConfigurationService::new());
        configuration.ensure_default_channels(&conn).unwrap();
        let service = OutgoingBatchService::new(sequences, configuration.clone());
        (conn, service, configuration)
    }

    fn new_batch(conn: &Connection, service: &OutgoingBatchService, node: &str, channel: &str) -> OutgoingBatch {
        let mut batch = OutgoingBatch::new(node, channel, OutgoingBatchStatus::New);
        service.insert_outgoing_batch(conn, &mut batch).unwrap();
        batch
    }

    #[test]
    fn test_insert_allocates_ids_and_round_trips() {
        let (conn, service, _) = setup();
        let mut first = OutgoingBatch::new("001", "default", OutgoingBatchStatus::New);
        first.increment_event_count(DataEventType::Insert);
        first.increment_event_count(DataEventType::Reload);
        service.insert_outgoing_batch(&conn, &mut first).unwrap();
        let second = new_batch(&conn, &service, "001", "default");
        assert_eq!(first.batch_id, 1);
        assert_eq!(second.batch_id, 2);

        let found = service.find_outgoing_batch(&conn, 1, None).unwrap().unwrap();
        assert_eq!(found.insert_event_count, 1);
        assert_eq!(found.reload_event_count, 1);
        assert_eq!(found.data_event_count, 2);
        assert!(found.load_flag);
        assert!(service.find_outgoing_batch(&conn, 1, Some("002")).unwrap().is_none());
    }

    #[test]
    fn test_update_sets_error_flag() {
        let (conn, service, _) = setup();
        let mut batch = new_batch(&conn, &service, "001", "default");
        batch.status = OutgoingBatchStatus::Error;
        batch.sql_message = Some("boom".into());
        service.update_outgoing_batch(&conn, &mut batch).unwrap();
        let found = service.find_outgoing_batch(&conn, batch.batch_id, Some("001")).unwrap().unwrap();
        assert!(found.error_flag);
        assert_eq!(found.status, OutgoingBatchStatus::Error);
        assert_eq!(found.sql_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_selection_respects_channel_settings() {
        let (conn, service, configuration) = setup();
        let mut limited = Channel::new("sales", 5);
        limited.max_batch_to_send = 2;
        configuration.save_channel(&conn, &limited).unwrap();
        let mut disabled = Channel::new("audit", 6);
        disabled.enabled = false;
        configuration.save_channel(&conn, &disabled).unwrap();

        for _ in 0..3 {
            new_batch(&conn, &service, "001", "sales");
        }
        new_batch(&conn, &service, "001", "audit");
        let mut done = new_batch(&conn, &service, "001", "default");
        done.status = OutgoingBatchStatus::Ok;
        service.update_outgoing_batch(&conn, &mut done).unwrap();
        let pending = new_batch(&conn, &service, "001", "default");
        new_batch(&conn, &service, "002", "default");

        let ids: Vec<i64> = service
            .get_outgoing_batches(&conn, "001")
            .unwrap()
            .into_iter()
            .map(|b| b.batch_id)
            .collect();
        assert_eq!(ids, vec![1, 2, pending.batch_id]);
    }

    #[test]
    fn test_mark_batch_and_counts() {
        let (conn, service, _) = setup();
        let batch = new_batch(&conn, &service, "001", "default");
        new_batch(&conn, &service, "001", "default");
        let ignored = service
            .mark_batch(&conn, "001", batch.batch_id, OutgoingBatchStatus::Ignored)
            .unwrap();
        assert_eq!(ignored.ignore_count, 1);

        let counts = service.count_batches_by_status(&conn).unwrap();
        assert_eq!(counts.get("IG"), Some(&1));
        assert_eq!(counts.get("NE"), Some(&1));
        assert!(matches!(
            service.mark_batch(&conn, "001", 99, OutgoingBatchStatus::Ok),
            Err(Error::NotFound(_))
        ));
        let listed = service
            .find_outgoing_batches_by_status(&conn, Some(OutgoingBatchStatus::Ignored), 10)
            .unwrap();
        assert_eq!(listed.len(), 1);
    }
}
