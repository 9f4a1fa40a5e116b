//! SQLite dialect and trigger templates

use rusqlite::{params, Connection};

use crate::db::dialect::Dialect;
use crate::db::template::TriggerTemplate;
use crate::error::Result;
use crate::model::{ColumnType, DataEventType};

const INSERT_TRIGGER_TEMPLATE: &str = r#"create trigger $(schemaName)$(triggerName) after insert on $(tableName)
for each row when ($(syncOnEventCondition) and $(syncOnIncomingBatchCondition))
begin
  insert into sym_data (table_name, event_type, trigger_hist_id, row_data, channel_id, transaction_id, source_node_id, external_data, create_time)
  values ('$(targetTableName)', 'I', $(triggerHistoryId), $(columns), $(channelExpression), $(txIdExpression), $(sourceNodeExpression), $(externalSelect), strftime('%Y-%m-%d %H:%M:%f','now'));
  $(customText)
end;"#;

const UPDATE_TRIGGER_TEMPLATE: &str = r#"create trigger $(schemaName)$(triggerName) after update on $(tableName)
for each row when ($(syncOnEventCondition) and $(syncOnIncomingBatchCondition))
begin
  insert into sym_data (table_name, event_type, trigger_hist_id, pk_data, row_data, old_data, channel_id, transaction_id, source_node_id, external_data, create_time)
  values ('$(targetTableName)', 'U', $(triggerHistoryId), $(oldKeys), $(columns), $(oldColumns), $(channelExpression), $(txIdExpression), $(sourceNodeExpression), $(externalSelect), strftime('%Y-%m-%d %H:%M:%f','now'));
  $(customText)
end;"#;

const DELETE_TRIGGER_TEMPLATE: &str = r#"create trigger $(schemaName)$(triggerName) after delete on $(tableName)
for each row when ($(syncOnEventCondition) and $(syncOnIncomingBatchCondition))
begin
  insert into sym_data (table_name, event_type, trigger_hist_id, pk_data, old_data, channel_id, transaction_id, source_node_id, external_data, create_time)
  values ('$(targetTableName)', 'D', $(triggerHistoryId), $(oldKeys), $(oldColumns), $(channelExpression), $(txIdExpression), $(sourceNodeExpression), $(externalSelect), strftime('%Y-%m-%d %H:%M:%f','now'));
  $(customText)
end;"#;

const INITIAL_LOAD_TEMPLATE: &str =
    "select $(columns) from $(schemaName)$(tableName) t where $(whereClause) order by $(orderBy)";

const STRING_COLUMN_TEMPLATE: &str = r#"case when $(tableAlias)."$(columnName)" is null then '' else '"' || replace(replace($(tableAlias)."$(columnName)",'\','\\'),'"','\"') || '"' end"#;

const NUMBER_COLUMN_TEMPLATE: &str = r#"case when $(tableAlias)."$(columnName)" is null then '' else '"' || cast($(tableAlias)."$(columnName)" as text) || '"' end"#;

const BOOLEAN_COLUMN_TEMPLATE: &str = r#"case when $(tableAlias)."$(columnName)" is null then '' when $(tableAlias)."$(columnName)" then '"1"' else '"0"' end"#;

const BLOB_COLUMN_TEMPLATE: &str = r#"case when $(tableAlias)."$(columnName)" is null then '' else '"' || hex($(tableAlias)."$(columnName)") || '"' end"#;

const DATETIME_COLUMN_TEMPLATE: &str = r#"case when $(tableAlias)."$(columnName)" is null then '' else '"' || coalesce(strftime('%Y-%m-%d %H:%M:%f', $(tableAlias)."$(columnName)"), $(tableAlias)."$(columnName)") || '"' end"#;

const DATE_COLUMN_TEMPLATE: &str = r#"case when $(tableAlias)."$(columnName)" is null then '' else '"' || coalesce(strftime('%Y-%m-%d', $(tableAlias)."$(columnName)"), $(tableAlias)."$(columnName)") || '"' end"#;

const TIME_COLUMN_TEMPLATE: &str = r#"case when $(tableAlias)."$(columnName)" is null then '' else '"' || coalesce(strftime('%H:%M:%f', $(tableAlias)."$(columnName)"), $(tableAlias)."$(columnName)") || '"' end"#;

/// Trigger template text for SQLite
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteTriggerTemplate;

impl TriggerTemplate for SqliteTriggerTemplate {
    fn ddl_template(&self, event_type: DataEventType) -> Option<&'static str> {
        match event_type {
            DataEventType::Insert => Some(INSERT_TRIGGER_TEMPLATE),
            DataEventType::Update => Some(UPDATE_TRIGGER_TEMPLATE),
            DataEventType::Delete => Some(DELETE_TRIGGER_TEMPLATE),
            _ => None,
        }
    }

    fn column_template(&self, column_type: &ColumnType) -> Option<&'static str> {
        match column_type {
            ColumnType::Text => Some(STRING_COLUMN_TEMPLATE),
            ColumnType::Integer | ColumnType::Numeric => Some(NUMBER_COLUMN_TEMPLATE),
            ColumnType::Boolean => Some(BOOLEAN_COLUMN_TEMPLATE),
            ColumnType::Binary => Some(BLOB_COLUMN_TEMPLATE),
            ColumnType::Timestamp => Some(DATETIME_COLUMN_TEMPLATE),
            ColumnType::Date => Some(DATE_COLUMN_TEMPLATE),
            ColumnType::Time => Some(TIME_COLUMN_TEMPLATE),
            ColumnType::Other(_) => None,
        }
    }

    fn initial_load_template(&self) -> &'static str {
        INITIAL_LOAD_TEMPLATE
    }

    fn column_separator(&self) -> &'static str {
        " ||','|| "
    }

    fn sync_triggers_enabled_condition(&self) -> &'static str {
        "(select context_value from sym_context where name = 'sync_triggers_disabled') is null"
    }

    fn source_node_expression(&self) -> &'static str {
        "(select context_value from sym_context where name = 'sync_node_disabled')"
    }
}

/// SQLite dialect
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDialect {
    template: SqliteTriggerTemplate,
}

impl SqliteDialect {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn template(&self) -> &dyn TriggerTemplate {
        &self.template
    }

    fn max_trigger_name_length(&self) -> usize {
        50
    }

    fn remove_trigger(
        &self,
        conn: &Connection,
        schema: Option<&str>,
        trigger_name: &str,
    ) -> Result<()> {
        let sql = format!(
            "drop trigger if exists {}{}",
            self.template.schema_prefix(schema),
            self.template.quote_identifier(trigger_name)
        );
        conn.execute_batch(&sql)?;
        Ok(())
    }

    fn does_trigger_exist(
        &self,
        conn: &Connection,
        _schema: Option<&str>,
        table_name: &str,
        trigger_name: &str,
    ) -> Result<bool> {
        let count: i64 = conn.query_row(
            "select count(*) from sqlite_master where type = 'trigger' and name = ?1 collate nocase and tbl_name = ?2 collate nocase",
            params![trigger_name, table_name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn disable_sync_triggers(&self, conn: &Connection, node_id: Option<&str>) -> Result<()> {
        conn.execute(
            "insert or replace into sym_context (name, context_value, create_time, last_update_time) values ('sync_triggers_disabled', '1', strftime('%Y-%m-%d %H:%M:%f','now'), strftime('%Y-%m-%d %H:%M:%f','now'))",
            [],
        )?;
        if let Some(node_id) = node_id {
            conn.execute(
                "insert or replace into sym_context (name, context_value, create_time, last_update_time) values ('sync_node_disabled', ?1, strftime('%Y-%m-%d %H:%M:%f','now'), strftime('%Y-%m-%d %H:%M:%f','now'))",
                params![node_id],
            )?;
        }
        Ok(())
    }

    fn enable_sync_triggers(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "delete from sym_context where name in ('sync_triggers_disabled', 'sync_node_disabled')",
            [],
        )?;
        Ok(())
    }
}
