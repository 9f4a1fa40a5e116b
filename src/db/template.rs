//! Trigger template engine
//!
//! A dialect supplies template text: one DDL template per DML event and
//! one value expression per column type. Rendering is shared: column
//! expressions are joined into a single row expression and `$(name)`
//! placeholders are substituted from a fixed set of values, so the same
//! inputs always yield the same DDL.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::model::{Channel, Column, ColumnType, DataEventType, Table, Trigger, TriggerHistory};

/// Alias of the table in initial load selects
pub const LOAD_TABLE_ALIAS: &str = "t";

/// Dialect-specific template text
pub trait TriggerTemplate: Send + Sync {
    /// DDL template for an insert, update or delete trigger
    fn ddl_template(&self, event_type: DataEventType) -> Option<&'static str>;

    /// Value expression for one column type, `None` when the type cannot be captured
    fn column_template(&self, column_type: &ColumnType) -> Option<&'static str>;

    /// Select used to extract current table rows with the capture expressions
    fn initial_load_template(&self) -> &'static str;

    /// Operator joining column expressions into one row expression
    fn column_separator(&self) -> &'static str;

    /// Condition that holds while sync triggers are enabled
    fn sync_triggers_enabled_condition(&self) -> &'static str;

    /// Expression yielding the node id a loaded change came from
    fn source_node_expression(&self) -> &'static str;

    fn new_row_alias(&self) -> &'static str {
        "new"
    }

    fn old_row_alias(&self) -> &'static str {
        "old"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Prefix qualifying objects with a schema, empty when unqualified
    fn schema_prefix(&self, schema: Option<&str>) -> String {
        match schema.filter(|s| !s.trim().is_empty()) {
            Some(schema) => format!("{}.", self.quote_identifier(schema)),
            None => String::new(),
        }
    }

    /// Value expression for one column of the given row alias
    fn column_expression(&self, table: &Table, column: &Column, alias: &str) -> Result<String> {
        let template = self.column_template(&column.column_type).ok_or_else(|| {
            Error::UnsupportedColumnType {
                table: table.fully_qualified_name(),
                column: column.name.clone(),
                type_name: column.type_name.clone(),
            }
        })?;
        let mut values = HashMap::new();
        values.insert("tableAlias", alias.to_string());
        values.insert("columnName", column.name.replace('"', "\"\""));
        substitute(template, &values)
    }

    /// Row expression serializing `columns` as one CSV line
    fn columns_expression(&self, table: &Table, columns: &[Column], alias: &str) -> Result<String> {
        if columns.is_empty() {
            return Ok("null".to_string());
        }
        let expressions = columns
            .iter()
            .map(|c| self.column_expression(table, c, alias))
            .collect::<Result<Vec<_>>>()?;
        Ok(expressions.join(self.column_separator()))
    }

    /// Render the DDL that installs the capture trigger for one event type
    fn render(
        &self,
        event_type: DataEventType,
        trigger: &Trigger,
        history: &TriggerHistory,
        channel: &Channel,
        table: &Table,
    ) -> Result<String> {
        let template = self.ddl_template(event_type).ok_or_else(|| {
            Error::Internal(format!("no trigger template for {} events", event_type))
        })?;
        let trigger_name = history.trigger_name_for(event_type).ok_or_else(|| {
            Error::Internal(format!(
                "trigger history {} has no {} trigger name",
                history.trigger_hist_id, event_type
            ))
        })?;

        let new_alias = self.new_row_alias();
        let old_alias = self.old_row_alias();
        let columns = trigger.order_columns_for_table(table);
        let keys = trigger.sync_key_columns(table);

        let mut values = HashMap::new();
        values.insert("triggerName", self.quote_identifier(trigger_name));
        values.insert("schemaName", self.schema_prefix(table.schema.as_deref()));
        values.insert("tableName", self.quote_identifier(&table.name));
        values.insert("targetTableName", sql_string(&history.source_table_name));
        values.insert("triggerHistoryId", history.trigger_hist_id.to_string());
        values.insert(
            "channelExpression",
            match trigger.channel_expression.as_deref().filter(|e| !e.trim().is_empty()) {
                Some(expression) => expression.to_string(),
                None => format!("'{}'", sql_string(&channel.channel_id)),
            },
        );
        values.insert(
            "txIdExpression",
            trigger
                .tx_id_expression
                .as_deref()
                .filter(|e| !e.trim().is_empty())
                .unwrap_or("null")
                .to_string(),
        );
        values.insert(
            "externalSelect",
            match trigger.external_select.as_deref().filter(|e| !e.trim().is_empty()) {
                Some(select) => format!("({})", select),
                None => "null".to_string(),
            },
        );
        values.insert(
            "syncOnEventCondition",
            trigger
                .sync_condition(event_type)
                .map(|c| {
                    c.replace("$(newTriggerValue)", new_alias)
                        .replace("$(oldTriggerValue)", old_alias)
                })
                .unwrap_or_else(|| "1=1".to_string()),
        );
        values.insert(
            "syncOnIncomingBatchCondition",
            if trigger.sync_on_incoming_batch {
                "1=1".to_string()
            } else {
                self.sync_triggers_enabled_condition().to_string()
            },
        );
        values.insert("sourceNodeExpression", self.source_node_expression().to_string());
        values.insert("columns", self.columns_expression(table, &columns, new_alias)?);
        values.insert(
            "oldColumns",
            if trigger.use_capture_old_data {
                self.columns_expression(table, &columns, old_alias)?
            } else {
                "null".to_string()
            },
        );
        values.insert("oldKeys", self.columns_expression(table, &keys, old_alias)?);
        values.insert("newKeys", self.columns_expression(table, &keys, new_alias)?);
        values.insert(
            "customText",
            trigger.custom_text(event_type).unwrap_or_default().to_string(),
        );

        substitute(template, &values)
    }

    /// Select returning current rows of a table serialized the way the
    /// trigger captures them, one text column per row
    fn initial_load_sql(
        &self,
        history: &TriggerHistory,
        table: &Table,
        where_clause: Option<&str>,
    ) -> Result<String> {
        let columns = history
            .parsed_column_names()
            .iter()
            .map(|name| {
                table.find_column(name).cloned().ok_or_else(|| {
                    Error::NotFound(format!(
                        "column {} of {}",
                        name,
                        table.fully_qualified_name()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let order_by = history
            .parsed_pk_column_names()
            .iter()
            .map(|name| format!("{}.{}", LOAD_TABLE_ALIAS, self.quote_identifier(name)))
            .collect::<Vec<_>>();

        let mut values = HashMap::new();
        values.insert("columns", self.columns_expression(table, &columns, LOAD_TABLE_ALIAS)?);
        values.insert("schemaName", self.schema_prefix(table.schema.as_deref()));
        values.insert("tableName", self.quote_identifier(&table.name));
        values.insert(
            "whereClause",
            where_clause
                .filter(|w| !w.trim().is_empty())
                .unwrap_or("1=1")
                .to_string(),
        );
        values.insert(
            "orderBy",
            if order_by.is_empty() {
                "1".to_string()
            } else {
                order_by.join(", ")
            },
        );
        substitute(self.initial_load_template(), &values)
    }

    /// Stable hash over the template text, recorded on trigger history
    fn template_hash(&self) -> i64 {
        let mut hasher = crc32fast::Hasher::new();
        for event_type in [
            DataEventType::Insert,
            DataEventType::Update,
            DataEventType::Delete,
        ] {
            hasher.update(self.ddl_template(event_type).unwrap_or("").as_bytes());
        }
        for column_type in [
            ColumnType::Boolean,
            ColumnType::Integer,
            ColumnType::Numeric,
            ColumnType::Text,
            ColumnType::Binary,
            ColumnType::Date,
            ColumnType::Time,
            ColumnType::Timestamp,
        ] {
            hasher.update(self.column_template(&column_type).unwrap_or("").as_bytes());
        }
        hasher.finalize() as i64
    }
}

/// Escape text for use inside a single quoted SQL literal
pub fn sql_string(value: &str) -> String {
    value.replace('\'', "''")
}

/// Replace each `$(name)` with its value.
///
/// A placeholder without a value is an error so that a template typo
/// never produces silently broken DDL.
pub fn substitute(template: &str, values: &HashMap<&str, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len() * 2);
    let mut rest = template;
    while let Some(start) = rest.find("$(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find(')').ok_or_else(|| {
            Error::Internal(format!("unterminated placeholder in template: {}", after))
        })?;
        let name = &after[..end];
        let value = values
            .get(name)
            .ok_or_else(|| Error::Internal(format!("no value for template placeholder $({})", name)))?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute() {
        let mut values = HashMap::new();
        values.insert("a", "1".to_string());
        values.insert("b", "two".to_string());
        assert_eq!(substitute("$(a) + $(b) = ?", &values).unwrap(), "1 + two = ?");
        assert!(substitute("$(c)", &values).is_err());
        assert!(substitute("$(a", &values).is_err());
    }

    #[test]
    fn test_sql_string() {
        assert_eq!(sql_string("o'clock"), "o''clock");
    }
}
