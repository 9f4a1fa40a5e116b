//! Database dialect: installing, removing and suppressing capture triggers

use rusqlite::Connection;

use crate::db::template::TriggerTemplate;
use crate::error::Result;
use crate::model::{Channel, DataEventType, Table, Trigger, TriggerHistory};

/// Per-database behaviour behind trigger management
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn template(&self) -> &dyn TriggerTemplate;

    /// Longest trigger name the database accepts
    fn max_trigger_name_length(&self) -> usize;

    /// Render and install one capture trigger
    fn create_trigger(
        &self,
        conn: &Connection,
        event_type: DataEventType,
        trigger: &Trigger,
        history: &TriggerHistory,
        channel: &Channel,
        table: &Table,
    ) -> Result<()> {
        let ddl = self
            .template()
            .render(event_type, trigger, history, channel, table)?;
        tracing::debug!("Creating {} trigger on {}: {}", event_type, table.name, ddl);
        conn.execute_batch(&ddl)?;
        Ok(())
    }

    fn remove_trigger(
        &self,
        conn: &Connection,
        schema: Option<&str>,
        trigger_name: &str,
    ) -> Result<()>;

    fn does_trigger_exist(
        &self,
        conn: &Connection,
        schema: Option<&str>,
        table_name: &str,
        trigger_name: &str,
    ) -> Result<bool>;

    /// Suppress capture for changes made on this connection, recording
    /// `node_id` as the source of any change still captured
    fn disable_sync_triggers(&self, conn: &Connection, node_id: Option<&str>) -> Result<()>;

    fn enable_sync_triggers(&self, conn: &Connection) -> Result<()>;
}
