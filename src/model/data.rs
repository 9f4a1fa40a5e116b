//! Captured change data

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Kind of a captured change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataEventType {
    Insert,
    Update,
    Delete,
    Sql,
    Create,
    Reload,
    Bsh,
}

impl DataEventType {
    /// Single letter code stored in sym_data.event_type
    pub fn code(&self) -> &'static str {
        match self {
            DataEventType::Insert => "I",
            DataEventType::Update => "U",
            DataEventType::Delete => "D",
            DataEventType::Sql => "S",
            DataEventType::Create => "C",
            DataEventType::Reload => "R",
            DataEventType::Bsh => "B",
        }
    }

    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "I" => Ok(DataEventType::Insert),
            "U" => Ok(DataEventType::Update),
            "D" => Ok(DataEventType::Delete),
            "S" => Ok(DataEventType::Sql),
            "C" => Ok(DataEventType::Create),
            "R" => Ok(DataEventType::Reload),
            "B" => Ok(DataEventType::Bsh),
            other => Err(Error::UnknownEventType(other.to_string())),
        }
    }

    /// Row level DML captured by a trigger
    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            DataEventType::Insert | DataEventType::Update | DataEventType::Delete
        )
    }
}

impl fmt::Display for DataEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataEventType::Insert => "INSERT",
            DataEventType::Update => "UPDATE",
            DataEventType::Delete => "DELETE",
            DataEventType::Sql => "SQL",
            DataEventType::Create => "CREATE",
            DataEventType::Reload => "RELOAD",
            DataEventType::Bsh => "BSH",
        };
        f.write_str(name)
    }
}

/// One captured change as stored in sym_data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    pub data_id: i64,
    pub table_name: String,
    pub event_type: DataEventType,
    /// CSV encoded row values
    pub row_data: Option<String>,
    /// CSV encoded primary key values
    pub pk_data: Option<String>,
    /// CSV encoded values before the change
    pub old_data: Option<String>,
    pub trigger_hist_id: i64,
    pub channel_id: String,
    pub transaction_id: Option<String>,
    pub source_node_id: Option<String>,
    pub external_data: Option<String>,
    pub node_list: Option<String>,
    pub create_time: Option<String>,
}

impl Data {
    pub fn new(
        table_name: impl Into<String>,
        event_type: DataEventType,
        trigger_hist_id: i64,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            data_id: 0,
            table_name: table_name.into(),
            event_type,
            row_data: None,
            pk_data: None,
            old_data: None,
            trigger_hist_id,
            channel_id: channel_id.into(),
            transaction_id: None,
            source_node_id: None,
            external_data: None,
            node_list: None,
            create_time: None,
        }
    }

    pub fn parsed_row_data(&self) -> Result<Option<Vec<Option<String>>>> {
        parse_optional(self.row_data.as_deref())
    }

    pub fn parsed_pk_data(&self) -> Result<Option<Vec<Option<String>>>> {
        parse_optional(self.pk_data.as_deref())
    }

    pub fn parsed_old_data(&self) -> Result<Option<Vec<Option<String>>>> {
        parse_optional(self.old_data.as_deref())
    }
}

fn parse_optional(value: Option<&str>) -> Result<Option<Vec<Option<String>>>> {
    match value {
        Some(text) if !text.is_empty() => Ok(Some(crate::io::csv::parse_line(text)?)),
        _ => Ok(None),
    }
}

/// Binding of a captured change to the batch it was routed into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEvent {
    pub data_id: i64,
    pub batch_id: i64,
    pub router_id: String,
}
