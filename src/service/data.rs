//! Captured change rows and their batch bindings

use std::sync::Arc;

use rusqlite::{params, Connection, Row};
use tracing::info;

use crate::error::Result;
use crate::io::csv::join_row;
use crate::model::{
    now_timestamp, Data, DataEventType, Node, OutgoingBatch, OutgoingBatchStatus, TriggerHistory,
    TriggerRouter,
};
use crate::service::outgoing_batch::OutgoingBatchService;

const SELECT_DATA: &str = r#"
    SELECT d.data_id, d.table_name, d.event_type, d.row_data, d.pk_data, d.old_data,
           d.trigger_hist_id, d.channel_id, d.transaction_id, d.source_node_id,
           d.external_data, d.node_list, d.create_time
    FROM sym_data d
"#;

/// A data row together with the router that placed it in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchedData {
    pub data: Data,
    pub router_id: String,
}

pub struct DataService {
    outgoing_batches: Arc<OutgoingBatchService>,
}

impl DataService {
    pub fn new(outgoing_batches: Arc<OutgoingBatchService>) -> Self {
        Self { outgoing_batches }
    }

    /// Insert a change row, returning its id
    pub fn insert_data(&self, conn: &Connection, data: &mut Data) -> Result<i64> {
        let create_time = data.create_time.clone().unwrap_or_else(now_timestamp);
        conn.execute(
            r#"
            INSERT INTO sym_data (table_name, event_type, row_data, pk_data, old_data,
                trigger_hist_id, channel_id, transaction_id, source_node_id, external_data,
                node_list, create_time)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                data.table_name,
                data.event_type.code(),
                data.row_data,
                data.pk_data,
                data.old_data,
                data.trigger_hist_id,
                data.channel_id,
                data.transaction_id,
                data.source_node_id,
                data.external_data,
                data.node_list,
                create_time,
            ],
        )?;
        data.data_id = conn.last_insert_rowid();
        data.create_time = Some(create_time);
        Ok(data.data_id)
    }

    pub fn insert_data_event(
        &self,
        conn: &Connection,
        data_id: i64,
        batch_id: i64,
        router_id: &str,
    ) -> Result<()> {
        let mut stmt = conn.prepare_cached(
            r#"
            INSERT INTO sym_data_event (data_id, batch_id, router_id, create_time)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )?;
        stmt.execute(params![data_id, batch_id, router_id, now_timestamp()])?;
        Ok(())
    }

    /// Data on a channel that no batch references yet, oldest first
    pub fn select_unrouted_data(
        &self,
        conn: &Connection,
        channel_id: &str,
        limit: i64,
    ) -> Result<Vec<Data>> {
        let sql = format!(
            r#"{} LEFT JOIN sym_data_event e ON d.data_id = e.data_id
               WHERE d.channel_id = ?1 AND e.data_id IS NULL
               ORDER BY d.data_id LIMIT ?2"#,
            SELECT_DATA
        );
        self.query_data(conn, &sql, params![channel_id, limit])
    }

    /// Data bound to a batch, in capture order
    pub fn select_data_for_batch(&self, conn: &Connection, batch_id: i64) -> Result<Vec<BatchedData>> {
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT d.data_id, d.table_name, d.event_type, d.row_data, d.pk_data, d.old_data,
                   d.trigger_hist_id, d.channel_id, d.transaction_id, d.source_node_id,
                   d.external_data, d.node_list, d.create_time, e.router_id
            FROM sym_data d INNER JOIN sym_data_event e ON d.data_id = e.data_id
            WHERE e.batch_id = ?1
            ORDER BY d.data_id
            "#,
        )?;
        let rows = stmt
            .query_map(params![batch_id], |row| {
                let (data, code) = map_data(row)?;
                let router_id: String = row.get(13)?;
                Ok((data, code, router_id))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(mut data, code, router_id)| {
                data.event_type = DataEventType::from_code(&code)?;
                Ok(BatchedData { data, router_id })
            })
            .collect()
    }

    /// Ids of the data in a batch, in capture order
    pub fn select_data_ids_for_batch(&self, conn: &Connection, batch_id: i64) -> Result<Vec<i64>> {
        let mut stmt = conn.prepare_cached(
            "SELECT data_id FROM sym_data_event WHERE batch_id = ?1 ORDER BY data_id",
        )?;
        let ids = stmt
            .query_map(params![batch_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    pub fn find_data(&self, conn: &Connection, data_id: i64) -> Result<Option<Data>> {
        let sql = format!("{} WHERE d.data_id = ?1", SELECT_DATA);
        Ok(self.query_data(conn, &sql, params![data_id])?.into_iter().next())
    }

    /// Queue a reload of a table for one node. Must run inside a transaction.
    ///
    /// The event is batched directly for the target node on the trigger's
    /// reload channel and never passes through the router. `where_clause`
    /// restricts the rows extracted.
    pub fn insert_reload_event(
        &self,
        conn: &Connection,
        target: &Node,
        trigger_router: &TriggerRouter,
        history: &TriggerHistory,
        where_clause: Option<&str>,
    ) -> Result<i64> {
        let mut data = Data::new(
            history.source_table_name.clone(),
            DataEventType::Reload,
            history.trigger_hist_id,
            trigger_router.trigger.reload_channel_id.clone(),
        );
        data.row_data = where_clause
            .filter(|w| !w.trim().is_empty())
            .map(|w| w.to_string());
        data.node_list = Some(target.node_id.clone());
        let batch_id = self.insert_data_for_node(conn, &mut data, target, &trigger_router.router.router_id)?;
        info!(
            "Queued reload of {} for node {} in batch {}",
            history.source_table_name, target.node_id, batch_id
        );
        Ok(batch_id)
    }

    /// Queue a sql statement to be run on one node. Must run inside a transaction.
    pub fn insert_sql_event(
        &self,
        conn: &Connection,
        target: &Node,
        history: &TriggerHistory,
        channel_id: &str,
        sql: &str,
    ) -> Result<i64> {
        self.insert_text_event(conn, target, history, channel_id, DataEventType::Sql, sql)
    }

    /// Queue a DDL statement to be run on one node. Must run inside a transaction.
    pub fn insert_create_event(
        &self,
        conn: &Connection,
        target: &Node,
        history: &TriggerHistory,
        channel_id: &str,
        ddl: &str,
    ) -> Result<i64> {
        self.insert_text_event(conn, target, history, channel_id, DataEventType::Create, ddl)
    }

    fn insert_text_event(
        &self,
        conn: &Connection,
        target: &Node,
        history: &TriggerHistory,
        channel_id: &str,
        event_type: DataEventType,
        text: &str,
    ) -> Result<i64> {
        let mut data = Data::new(
            history.source_table_name.clone(),
            event_type,
            history.trigger_hist_id,
            channel_id,
        );
        data.row_data = Some(join_row(&[Some(text.to_string())]));
        data.node_list = Some(target.node_id.clone());
        self.insert_data_for_node(conn, &mut data, target, crate::model::UNKNOWN_ROUTER_ID)
    }

    /// Insert `data` and bind it to a fresh batch for `target`.
    ///
    /// Writes three rows; callers run it inside `in_transaction` so a
    /// failure cannot leave a batch without its data event.
    fn insert_data_for_node(
        &self,
        conn: &Connection,
        data: &mut Data,
        target: &Node,
        router_id: &str,
    ) -> Result<i64> {
        self.insert_data(conn, data)?;
        let mut batch = OutgoingBatch::new(
            target.node_id.clone(),
            data.channel_id.clone(),
            OutgoingBatchStatus::New,
        );
        batch.increment_event_count(data.event_type);
        self.outgoing_batches.insert_outgoing_batch(conn, &mut batch)?;
        self.insert_data_event(conn, data.data_id, batch.batch_id, router_id)?;
        Ok(batch.batch_id)
    }

    fn query_data<P: rusqlite::Params>(&self, conn: &Connection, sql: &str, params: P) -> Result<Vec<Data>> {
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params, map_data)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(mut data, code)| {
                data.event_type = DataEventType::from_code(&code)?;
                Ok(data)
            })
            .collect()
    }
}

/// Map a sym_data row; the event type code is decoded by the caller so an
/// unknown code surfaces as its own error
fn map_data(row: &Row<'_>) -> rusqlite::Result<(Data, String)> {
    let code: String = row.get(2)?;
    let data = Data {
        data_id: row.get(0)?,
        table_name: row.get(1)?,
        event_type: DataEventType::Insert,
        row_data: row.get(3)?,
        pk_data: row.get(4)?,
        old_data: row.get(5)?,
        trigger_hist_id: row.get(6)?,
        channel_id: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        transaction_id: row.get(8)?,
        source_node_id: row.get(9)?,
        external_data: row.get(10)?,
        node_list: row.get(11)?,
        create_time: row.get(12)?,
    };
    Ok((data, code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::create_sym_tables;
    use crate::error::Error;
    use crate::model::{NodeGroupLink, NodeGroupLinkAction, Router, Table, Trigger, TriggerReBuildReason};
    use crate::service::configuration::ConfigurationService;
    use crate::service::sequence::SequenceService;

    fn setup() -> (Connection, DataService) {
        let conn = Connection::open_in_memory().unwrap();
        create_sym_tables(&conn).unwrap();
        let sequences = Arc::new(SequenceService::new());
        sequences.init(&conn).unwrap();
        let outgoing = Arc::new(OutgoingBatchService::new(
            sequences,
            Arc::new(ConfigurationService::new()),
        ));
        (conn, DataService::new(outgoing))
    }

    fn insert(conn: &Connection, service: &DataService, channel: &str) -> i64 {
        let mut data = Data::new("item", DataEventType::Insert, 1, channel);
        data.row_data = Some("\"1\",\"a\"".into());
        service.insert_data(conn, &mut data).unwrap()
    }

    #[test]
    fn test_unrouted_data_excludes_batched_rows() {
        let (conn, service) = setup();
        let first = insert(&conn, &service, "default");
        let second = insert(&conn, &service, "default");
        insert(&conn, &service, "other");

        service.insert_data_event(&conn, first, 10, "r1").unwrap();
        let unrouted = service.select_unrouted_data(&conn, "default", 100).unwrap();
        assert_eq!(unrouted.len(), 1);
        assert_eq!(unrouted[0].data_id, second);
        assert_eq!(unrouted[0].event_type, DataEventType::Insert);
        assert_eq!(unrouted[0].parsed_row_data().unwrap().unwrap().len(), 2);

        assert_eq!(service.select_unrouted_data(&conn, "default", 0).unwrap().len(), 0);
    }

    #[test]
    fn test_data_for_batch_in_capture_order() {
        let (conn, service) = setup();
        let a = insert(&conn, &service, "default");
        let b = insert(&conn, &service, "default");
        service.insert_data_event(&conn, b, 7, "r2").unwrap();
        service.insert_data_event(&conn, a, 7, "r1").unwrap();

        let batched = service.select_data_for_batch(&conn, 7).unwrap();
        let ids: Vec<i64> = batched.iter().map(|d| d.data.data_id).collect();
        assert_eq!(ids, vec![a, b]);
        assert_eq!(batched[0].router_id, "r1");
        assert_eq!(service.select_data_ids_for_batch(&conn, 7).unwrap(), vec![a, b]);
    }

    #[test]
    fn test_unknown_event_code_is_reported() {
        let (conn, service) = setup();
        conn.execute(
            "INSERT INTO sym_data (table_name, event_type, trigger_hist_id, channel_id) VALUES ('item', 'Z', 1, 'default')",
            [],
        )
        .unwrap();
        assert!(matches!(
            service.select_unrouted_data(&conn, "default", 10),
            Err(Error::UnknownEventType(code)) if code == "Z"
        ));
    }

    #[test]
    fn test_reload_event_is_batched_for_target() {
        let (conn, service) = setup();
        let link = NodeGroupLink::new("corp", "store", NodeGroupLinkAction::WaitForPull);
        let trigger_router = TriggerRouter::new(
            Trigger::new("item", "item", "default"),
            Router::new("corp_2_store", link),
        );
        let table = Table::new("item");
        let mut history = TriggerHistory::new(
            &trigger_router.trigger,
            &table,
            0,
            TriggerReBuildReason::New,
        );
        history.trigger_hist_id = 3;
        let target = Node::new("001", "store", "001");

        let batch_id = service
            .insert_reload_event(&conn, &target, &trigger_router, &history, Some("id > 5"))
            .unwrap();
        let batched = service.select_data_for_batch(&conn, batch_id).unwrap();
        assert_eq!(batched.len(), 1);
        assert_eq!(batched[0].data.event_type, DataEventType::Reload);
        assert_eq!(batched[0].data.channel_id, "reload");
        assert_eq!(batched[0].data.row_data.as_deref(), Some("id > 5"));
        assert!(service.select_unrouted_data(&conn, "reload", 10).unwrap().is_empty());

        let sql_batch = service
            .insert_sql_event(&conn, &target, &history, "config", "delete from item")
            .unwrap();
        let sql = service.select_data_for_batch(&conn, sql_batch).unwrap();
        assert_eq!(
            sql[0].data.parsed_row_data().unwrap(),
            Some(vec![Some("delete from item".to_string())])
        );
    }
}
