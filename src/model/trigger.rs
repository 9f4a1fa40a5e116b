//! Trigger, router and trigger history configuration

use serde::{Deserialize, Serialize};

use crate::model::{split_names, Column, DataEventType, NodeGroupLink, Table};

/// Change capture policy for one source table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub trigger_id: String,
    pub source_catalog_name: Option<String>,
    pub source_schema_name: Option<String>,
    pub source_table_name: String,
    pub channel_id: String,
    pub reload_channel_id: String,
    pub sync_on_update: bool,
    pub sync_on_insert: bool,
    pub sync_on_delete: bool,
    pub sync_on_incoming_batch: bool,
    pub name_for_update_trigger: Option<String>,
    pub name_for_insert_trigger: Option<String>,
    pub name_for_delete_trigger: Option<String>,
    pub sync_on_update_condition: Option<String>,
    pub sync_on_insert_condition: Option<String>,
    pub sync_on_delete_condition: Option<String>,
    pub custom_on_update_text: Option<String>,
    pub custom_on_insert_text: Option<String>,
    pub custom_on_delete_text: Option<String>,
    pub external_select: Option<String>,
    pub tx_id_expression: Option<String>,
    pub channel_expression: Option<String>,
    pub excluded_column_names: Option<String>,
    pub sync_key_names: Option<String>,
    pub use_capture_old_data: bool,
    pub use_capture_lobs: bool,
    pub use_stream_lobs: bool,
    pub use_handle_key_updates: bool,
    pub create_time: Option<String>,
    pub last_update_time: Option<String>,
}

impl Trigger {
    pub fn new(
        trigger_id: impl Into<String>,
        source_table_name: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            trigger_id: trigger_id.into(),
            source_catalog_name: None,
            source_schema_name: None,
            source_table_name: source_table_name.into(),
            channel_id: channel_id.into(),
            reload_channel_id: "reload".to_string(),
            sync_on_update: true,
            sync_on_insert: true,
            sync_on_delete: true,
            sync_on_incoming_batch: false,
            name_for_update_trigger: None,
            name_for_insert_trigger: None,
            name_for_delete_trigger: None,
            sync_on_update_condition: None,
            sync_on_insert_condition: None,
            sync_on_delete_condition: None,
            custom_on_update_text: None,
            custom_on_insert_text: None,
            custom_on_delete_text: None,
            external_select: None,
            tx_id_expression: None,
            channel_expression: None,
            excluded_column_names: None,
            sync_key_names: None,
            use_capture_old_data: true,
            use_capture_lobs: false,
            use_stream_lobs: false,
            use_handle_key_updates: false,
            create_time: None,
            last_update_time: None,
        }
    }

    pub fn syncs(&self, event_type: DataEventType) -> bool {
        match event_type {
            DataEventType::Insert => self.sync_on_insert,
            DataEventType::Update => self.sync_on_update,
            DataEventType::Delete => self.sync_on_delete,
            _ => false,
        }
    }

    pub fn sync_condition(&self, event_type: DataEventType) -> Option<&str> {
        let condition = match event_type {
            DataEventType::Insert => self.sync_on_insert_condition.as_deref(),
            DataEventType::Update => self.sync_on_update_condition.as_deref(),
            DataEventType::Delete => self.sync_on_delete_condition.as_deref(),
            _ => None,
        };
        condition.filter(|c| !c.trim().is_empty())
    }

    pub fn custom_text(&self, event_type: DataEventType) -> Option<&str> {
        let text = match event_type {
            DataEventType::Insert => self.custom_on_insert_text.as_deref(),
            DataEventType::Update => self.custom_on_update_text.as_deref(),
            DataEventType::Delete => self.custom_on_delete_text.as_deref(),
            _ => None,
        };
        text.filter(|t| !t.trim().is_empty())
    }

    pub fn configured_trigger_name(&self, event_type: DataEventType) -> Option<&str> {
        let name = match event_type {
            DataEventType::Insert => self.name_for_insert_trigger.as_deref(),
            DataEventType::Update => self.name_for_update_trigger.as_deref(),
            DataEventType::Delete => self.name_for_delete_trigger.as_deref(),
            _ => None,
        };
        name.filter(|n| !n.trim().is_empty())
    }

    pub fn excluded_columns(&self) -> Vec<String> {
        self.excluded_column_names
            .as_deref()
            .map(split_names)
            .unwrap_or_default()
    }

    pub fn sync_keys(&self) -> Vec<String> {
        self.sync_key_names
            .as_deref()
            .map(split_names)
            .unwrap_or_default()
    }

    fn is_excluded(&self, column: &str) -> bool {
        self.excluded_columns()
            .iter()
            .any(|c| c.eq_ignore_ascii_case(column))
    }

    /// Columns identifying a row: configured sync keys, else the
    /// primary key, else every captured column
    pub fn sync_key_columns(&self, table: &Table) -> Vec<Column> {
        let sync_keys = self.sync_keys();
        let keys: Vec<Column> = if !sync_keys.is_empty() {
            sync_keys
                .iter()
                .filter_map(|k| table.find_column(k).cloned())
                .collect()
        } else {
            table.primary_key_columns().into_iter().cloned().collect()
        };

        let keys = if keys.is_empty() {
            table
                .columns
                .iter()
                .filter(|c| !self.is_excluded(&c.name))
                .cloned()
                .collect()
        } else {
            keys
        };

        keys.into_iter()
            .map(|mut c| {
                c.primary_key = true;
                c
            })
            .collect()
    }

    /// Captured columns in capture order: key columns first, excluded dropped
    pub fn order_columns_for_table(&self, table: &Table) -> Vec<Column> {
        let keys = self.sync_key_columns(table);
        let mut ordered: Vec<Column> = keys.clone();
        for column in &table.columns {
            if self.is_excluded(&column.name) {
                continue;
            }
            if keys.iter().any(|k| k.name.eq_ignore_ascii_case(&column.name)) {
                continue;
            }
            let mut column = column.clone();
            column.primary_key = false;
            ordered.push(column);
        }
        ordered
    }

    /// Default database trigger name for an event type
    pub fn default_trigger_name(
        &self,
        event_type: DataEventType,
        node_group_id: &str,
        max_length: usize,
    ) -> String {
        let name = format!(
            "SYM_ON_{}_FOR_{}_{}",
            event_type.code(),
            sanitize(&self.trigger_id),
            sanitize(node_group_id)
        )
        .to_uppercase();

        if name.len() <= max_length {
            return name;
        }

        let suffix = format!("_{:08X}", crc32fast::hash(name.as_bytes()));
        let keep = max_length.saturating_sub(suffix.len());
        format!("{}{}", &name[..keep], suffix)
    }

    /// Stable hash over the attributes that shape generated triggers
    pub fn to_hash_value(&self) -> i64 {
        let mut hasher = crc32fast::Hasher::new();
        let flags = [
            self.sync_on_update,
            self.sync_on_insert,
            self.sync_on_delete,
            self.sync_on_incoming_batch,
            self.use_capture_old_data,
            self.use_capture_lobs,
            self.use_stream_lobs,
            self.use_handle_key_updates,
        ];
        for flag in flags {
            hasher.update(if flag { b"1" } else { b"0" });
        }
        let texts = [
            Some(self.trigger_id.as_str()),
            self.source_catalog_name.as_deref(),
            self.source_schema_name.as_deref(),
            Some(self.source_table_name.as_str()),
            Some(self.channel_id.as_str()),
            Some(self.reload_channel_id.as_str()),
            self.name_for_update_trigger.as_deref(),
            self.name_for_insert_trigger.as_deref(),
            self.name_for_delete_trigger.as_deref(),
            self.sync_on_update_condition.as_deref(),
            self.sync_on_insert_condition.as_deref(),
            self.sync_on_delete_condition.as_deref(),
            self.custom_on_update_text.as_deref(),
            self.custom_on_insert_text.as_deref(),
            self.custom_on_delete_text.as_deref(),
            self.external_select.as_deref(),
            self.tx_id_expression.as_deref(),
            self.channel_expression.as_deref(),
            self.excluded_column_names.as_deref(),
            self.sync_key_names.as_deref(),
        ];
        for text in texts {
            hasher.update(b"|");
            hasher.update(text.unwrap_or("").as_bytes());
        }
        hasher.finalize() as i64
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Policy deciding which nodes of a target group receive captured data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub router_id: String,
    pub target_catalog_name: Option<String>,
    pub target_schema_name: Option<String>,
    pub target_table_name: Option<String>,
    pub node_group_link: NodeGroupLink,
    pub router_type: Option<String>,
    pub router_expression: Option<String>,
    pub sync_on_update: bool,
    pub sync_on_insert: bool,
    pub sync_on_delete: bool,
    pub use_source_catalog_schema: bool,
}

impl Router {
    pub fn new(router_id: impl Into<String>, node_group_link: NodeGroupLink) -> Self {
        Self {
            router_id: router_id.into(),
            target_catalog_name: None,
            target_schema_name: None,
            target_table_name: None,
            node_group_link,
            router_type: None,
            router_expression: None,
            sync_on_update: true,
            sync_on_insert: true,
            sync_on_delete: true,
            use_source_catalog_schema: true,
        }
    }

    /// Router type, `default` when unset
    pub fn router_type(&self) -> &str {
        self.router_type
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or("default")
    }

    /// Whether this router carries events of the given type
    pub fn syncs(&self, event_type: DataEventType) -> bool {
        match event_type {
            DataEventType::Insert => self.sync_on_insert,
            DataEventType::Update => self.sync_on_update,
            DataEventType::Delete => self.sync_on_delete,
            _ => true,
        }
    }
}

/// Binding of a trigger to a router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRouter {
    pub trigger: Trigger,
    pub router: Router,
    pub enabled: bool,
    pub initial_load_order: i32,
    pub initial_load_select: Option<String>,
    pub ping_back_enabled: bool,
}

impl TriggerRouter {
    pub fn new(trigger: Trigger, router: Router) -> Self {
        Self {
            trigger,
            router,
            enabled: true,
            initial_load_order: 1,
            initial_load_select: None,
            ping_back_enabled: false,
        }
    }

    /// Name of the table on the target node
    pub fn target_table_name<'a>(&'a self, source_table_name: &'a str) -> &'a str {
        self.router
            .target_table_name
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(source_table_name)
    }
}

/// Why a trigger history row was written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerReBuildReason {
    New,
    TableSchemaChanged,
    TriggerChanged,
    TriggerTemplateChanged,
    Forced,
}

impl TriggerReBuildReason {
    pub fn code(&self) -> &'static str {
        match self {
            TriggerReBuildReason::New => "N",
            TriggerReBuildReason::TableSchemaChanged => "S",
            TriggerReBuildReason::TriggerChanged => "T",
            TriggerReBuildReason::TriggerTemplateChanged => "E",
            TriggerReBuildReason::Forced => "F",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "N" => Some(TriggerReBuildReason::New),
            "S" => Some(TriggerReBuildReason::TableSchemaChanged),
            "T" => Some(TriggerReBuildReason::TriggerChanged),
            "E" => Some(TriggerReBuildReason::TriggerTemplateChanged),
            "F" => Some(TriggerReBuildReason::Forced),
            _ => None,
        }
    }
}

/// Snapshot of the columns and hashes a trigger was built with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerHistory {
    pub trigger_hist_id: i64,
    pub trigger_id: String,
    pub source_table_name: String,
    pub source_catalog_name: Option<String>,
    pub source_schema_name: Option<String>,
    pub name_for_insert_trigger: Option<String>,
    pub name_for_update_trigger: Option<String>,
    pub name_for_delete_trigger: Option<String>,
    pub table_hash: i64,
    pub trigger_row_hash: i64,
    pub trigger_template_hash: i64,
    /// Comma separated captured column names
    pub column_names: String,
    /// Comma separated key column names
    pub pk_column_names: String,
    pub last_trigger_build_reason: TriggerReBuildReason,
    pub error_message: Option<String>,
    pub create_time: Option<String>,
    pub inactive_time: Option<String>,
}

impl TriggerHistory {
    /// Snapshot a trigger against the current table shape
    pub fn new(
        trigger: &Trigger,
        table: &Table,
        trigger_template_hash: i64,
        reason: TriggerReBuildReason,
    ) -> Self {
        let columns = trigger.order_columns_for_table(table);
        let keys = trigger.sync_key_columns(table);
        Self {
            trigger_hist_id: 0,
            trigger_id: trigger.trigger_id.clone(),
            source_table_name: table.name.clone(),
            source_catalog_name: trigger.source_catalog_name.clone(),
            source_schema_name: trigger.source_schema_name.clone(),
            name_for_insert_trigger: None,
            name_for_update_trigger: None,
            name_for_delete_trigger: None,
            table_hash: table.calculate_table_hash(),
            trigger_row_hash: trigger.to_hash_value(),
            trigger_template_hash,
            column_names: columns
                .iter()
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
                .join(","),
            pk_column_names: keys
                .iter()
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
                .join(","),
            last_trigger_build_reason: reason,
            error_message: None,
            create_time: None,
            inactive_time: None,
        }
    }

    pub fn parsed_column_names(&self) -> Vec<String> {
        split_names(&self.column_names)
    }

    pub fn parsed_pk_column_names(&self) -> Vec<String> {
        split_names(&self.pk_column_names)
    }

    pub fn trigger_name_for(&self, event_type: DataEventType) -> Option<&str> {
        match event_type {
            DataEventType::Insert => self.name_for_insert_trigger.as_deref(),
            DataEventType::Update => self.name_for_update_trigger.as_deref(),
            DataEventType::Delete => self.name_for_delete_trigger.as_deref(),
            _ => None,
        }
    }

    pub fn set_trigger_name(&mut self, event_type: DataEventType, name: String) {
        match event_type {
            DataEventType::Insert => self.name_for_insert_trigger = Some(name),
            DataEventType::Update => self.name_for_update_trigger = Some(name),
            DataEventType::Delete => self.name_for_delete_trigger = Some(name),
            _ => {}
        }
    }

    /// Table shape the captured rows were written with
    pub fn to_table(&self) -> Table {
        Table::from_names(
            self.source_catalog_name.clone(),
            self.source_schema_name.clone(),
            self.source_table_name.clone(),
            &self.parsed_column_names(),
            &self.parsed_pk_column_names(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item_table() -> Table {
        Table::new("item").with_columns(vec![
            Column::new("name", "VARCHAR"),
            Column::new("id", "INTEGER").primary_key(),
            Column::new("secret", "VARCHAR"),
        ])
    }

    #[test]
    fn test_order_columns_keys_first_and_excluded_dropped() {
        let mut trigger = Trigger::new("item", "item", "default");
        trigger.excluded_column_names = Some("secret".into());
        let names: Vec<String> = trigger
            .order_columns_for_table(&item_table())
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["id", "name"]);
    }

    #[test]
    fn test_sync_keys_replace_primary_key() {
        let mut trigger = Trigger::new("item", "item", "default");
        trigger.sync_key_names = Some("name".into());
        let keys = trigger.sync_key_columns(&item_table());
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].name, "name");

        let history = TriggerHistory::new(&trigger, &item_table(), 1, TriggerReBuildReason::New);
        assert_eq!(history.pk_column_names, "name");
        assert_eq!(history.column_names, "name,id,secret");
    }

    #[test]
    fn test_table_without_key_uses_all_columns() {
        let table = Table::new("log").with_columns(vec![
            Column::new("a", "TEXT"),
            Column::new("b", "TEXT"),
        ]);
        let trigger = Trigger::new("log", "log", "default");
        assert_eq!(trigger.sync_key_columns(&table).len(), 2);
    }

    #[test]
    fn test_default_trigger_name() {
        let trigger = Trigger::new("item-trigger", "item", "default");
        assert_eq!(
            trigger.default_trigger_name(DataEventType::Insert, "store", 50),
            "SYM_ON_I_FOR_ITEM_TRIGGER_STORE"
        );

        let long = trigger.default_trigger_name(DataEventType::Update, "a_very_long_node_group_name", 30);
        assert_eq!(long.len(), 30);
        assert_eq!(
            long,
            trigger.default_trigger_name(DataEventType::Update, "a_very_long_node_group_name", 30)
        );
    }

    #[test]
    fn test_trigger_hash_changes_with_definition() {
        let a = Trigger::new("item", "item", "default");
        let mut b = a.clone();
        assert_eq!(a.to_hash_value(), b.to_hash_value());
        b.sync_on_delete = false;
        assert_ne!(a.to_hash_value(), b.to_hash_value());
    }
}
