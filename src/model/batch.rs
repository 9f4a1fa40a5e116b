//! Outgoing and incoming batches

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::DataEventType;

/// Lifecycle of a batch sent to another node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutgoingBatchStatus {
    New,
    Routing,
    Querying,
    Sending,
    Loading,
    Ok,
    Error,
    Ignored,
}

impl OutgoingBatchStatus {
    pub fn code(&self) -> &'static str {
        match self {
            OutgoingBatchStatus::New => "NE",
            OutgoingBatchStatus::Routing => "RT",
            OutgoingBatchStatus::Querying => "QY",
            OutgoingBatchStatus::Sending => "SE",
            OutgoingBatchStatus::Loading => "LD",
            OutgoingBatchStatus::Ok => "OK",
            OutgoingBatchStatus::Error => "ER",
            OutgoingBatchStatus::Ignored => "IG",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "NE" => Some(OutgoingBatchStatus::New),
            "RT" => Some(OutgoingBatchStatus::Routing),
            "QY" => Some(OutgoingBatchStatus::Querying),
            "SE" => Some(OutgoingBatchStatus::Sending),
            "LD" => Some(OutgoingBatchStatus::Loading),
            "OK" => Some(OutgoingBatchStatus::Ok),
            "ER" => Some(OutgoingBatchStatus::Error),
            "IG" => Some(OutgoingBatchStatus::Ignored),
            _ => None,
        }
    }

    /// No further delivery happens in this status
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutgoingBatchStatus::Ok | OutgoingBatchStatus::Ignored)
    }
}

impl fmt::Display for OutgoingBatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Lifecycle of a batch received from another node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncomingBatchStatus {
    Loading,
    Ok,
    Error,
    Ignored,
}

impl IncomingBatchStatus {
    pub fn code(&self) -> &'static str {
        match self {
            IncomingBatchStatus::Loading => "LD",
            IncomingBatchStatus::Ok => "OK",
            IncomingBatchStatus::Error => "ER",
            IncomingBatchStatus::Ignored => "IG",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "LD" => Some(IncomingBatchStatus::Loading),
            "OK" => Some(IncomingBatchStatus::Ok),
            "ER" => Some(IncomingBatchStatus::Error),
            "IG" => Some(IncomingBatchStatus::Ignored),
            _ => None,
        }
    }
}

impl fmt::Display for IncomingBatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// One unit of change delivery to one node on one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingBatch {
    pub batch_id: i64,
    pub node_id: String,
    pub channel_id: String,
    pub status: OutgoingBatchStatus,
    pub load_flag: bool,
    pub error_flag: bool,
    pub common_flag: bool,
    pub ignore_count: i64,
    pub byte_count: i64,
    pub extract_count: i64,
    pub sent_count: i64,
    pub load_count: i64,
    pub data_event_count: i64,
    pub reload_event_count: i64,
    pub insert_event_count: i64,
    pub update_event_count: i64,
    pub delete_event_count: i64,
    pub other_event_count: i64,
    pub router_millis: i64,
    pub network_millis: i64,
    pub filter_millis: i64,
    pub load_millis: i64,
    pub extract_millis: i64,
    pub sql_state: Option<String>,
    pub sql_code: i32,
    pub sql_message: Option<String>,
    pub failed_data_id: i64,
    pub failed_line_number: i64,
    pub last_update_hostname: Option<String>,
    pub last_update_time: Option<String>,
    pub create_time: Option<String>,
    pub create_by: Option<String>,
}

impl OutgoingBatch {
    pub fn new(
        node_id: impl Into<String>,
        channel_id: impl Into<String>,
        status: OutgoingBatchStatus,
    ) -> Self {
        Self {
            batch_id: 0,
            node_id: node_id.into(),
            channel_id: channel_id.into(),
            status,
            load_flag: false,
            error_flag: false,
            common_flag: false,
            ignore_count: 0,
            byte_count: 0,
            extract_count: 0,
            sent_count: 0,
            load_count: 0,
            data_event_count: 0,
            reload_event_count: 0,
            insert_event_count: 0,
            update_event_count: 0,
            delete_event_count: 0,
            other_event_count: 0,
            router_millis: 0,
            network_millis: 0,
            filter_millis: 0,
            load_millis: 0,
            extract_millis: 0,
            sql_state: None,
            sql_code: 0,
            sql_message: None,
            failed_data_id: 0,
            failed_line_number: 0,
            last_update_hostname: None,
            last_update_time: None,
            create_time: None,
            create_by: None,
        }
    }

    /// Count one more event of the given type
    pub fn increment_event_count(&mut self, event_type: DataEventType) {
        self.data_event_count += 1;
        match event_type {
            DataEventType::Insert => self.insert_event_count += 1,
            DataEventType::Update => self.update_event_count += 1,
            DataEventType::Delete => self.delete_event_count += 1,
            DataEventType::Reload => {
                self.reload_event_count += 1;
                self.load_flag = true;
            }
            _ => self.other_event_count += 1,
        }
    }

    pub fn node_batch_id(&self) -> String {
        format!("{}-{}", self.node_id, self.batch_id)
    }
}

/// Mirror of an outgoing batch on the receiving node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingBatch {
    pub batch_id: i64,
    pub node_id: String,
    pub channel_id: String,
    pub status: IncomingBatchStatus,
    pub error_flag: bool,
    pub network_millis: i64,
    pub filter_millis: i64,
    pub database_millis: i64,
    pub failed_row_number: i64,
    pub failed_line_number: i64,
    pub byte_count: i64,
    pub statement_count: i64,
    pub fallback_insert_count: i64,
    pub fallback_update_count: i64,
    pub ignore_count: i64,
    pub missing_delete_count: i64,
    pub skip_count: i64,
    pub sql_state: Option<String>,
    pub sql_code: i32,
    pub sql_message: Option<String>,
    pub last_update_hostname: Option<String>,
    pub last_update_time: Option<String>,
    pub create_time: Option<String>,
    /// Set when the batch was seen before; never persisted
    #[serde(skip)]
    pub retry: bool,
}

impl IncomingBatch {
    pub fn new(batch_id: i64, node_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            batch_id,
            node_id: node_id.into(),
            channel_id: channel_id.into(),
            status: IncomingBatchStatus::Loading,
            error_flag: false,
            network_millis: 0,
            filter_millis: 0,
            database_millis: 0,
            failed_row_number: 0,
            failed_line_number: 0,
            byte_count: 0,
            statement_count: 0,
            fallback_insert_count: 0,
            fallback_update_count: 0,
            ignore_count: 0,
            missing_delete_count: 0,
            skip_count: 0,
            sql_state: None,
            sql_code: 0,
            sql_message: None,
            last_update_hostname: None,
            last_update_time: None,
            create_time: None,
            retry: false,
        }
    }

    pub fn node_batch_id(&self) -> String {
        format!("{}-{}", self.node_id, self.batch_id)
    }

    /// Copy load statistics from an earlier delivery of the same batch
    pub fn copy_statistics_from(&mut self, other: &IncomingBatch) {
        self.byte_count = other.byte_count;
        self.network_millis = other.network_millis;
        self.filter_millis = other.filter_millis;
        self.database_millis = other.database_millis;
        self.statement_count = other.statement_count;
        self.fallback_insert_count = other.fallback_insert_count;
        self.fallback_update_count = other.fallback_update_count;
        self.missing_delete_count = other.missing_delete_count;
        self.ignore_count = other.ignore_count;
        self.failed_row_number = other.failed_row_number;
        self.failed_line_number = other.failed_line_number;
    }
}

/// Acknowledgement of one batch, sent back to the batch's origin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAck {
    pub batch_id: i64,
    pub node_id: Option<String>,
    pub ok: bool,
    /// Zero-based index of the failing row within the batch
    pub error_line: i64,
    pub network_millis: i64,
    pub filter_millis: i64,
    pub database_millis: i64,
    pub byte_count: i64,
    pub sql_state: Option<String>,
    pub sql_code: i32,
    pub sql_message: Option<String>,
}

impl BatchAck {
    pub fn ok(batch_id: i64) -> Self {
        Self {
            batch_id,
            node_id: None,
            ok: true,
            error_line: 0,
            network_millis: 0,
            filter_millis: 0,
            database_millis: 0,
            byte_count: 0,
            sql_state: None,
            sql_code: 0,
            sql_message: None,
        }
    }

    pub fn error(batch_id: i64, error_line: i64) -> Self {
        Self {
            ok: false,
            error_line,
            ..Self::ok(batch_id)
        }
    }
}

impl From<&IncomingBatch> for BatchAck {
    fn from(batch: &IncomingBatch) -> Self {
        let ok = batch.status != IncomingBatchStatus::Error;
        Self {
            batch_id: batch.batch_id,
            node_id: Some(batch.node_id.clone()),
            ok,
            error_line: if ok { 0 } else { batch.failed_row_number },
            network_millis: batch.network_millis,
            filter_millis: batch.filter_millis,
            database_millis: batch.database_millis,
            byte_count: batch.byte_count,
            sql_state: batch.sql_state.clone(),
            sql_code: batch.sql_code,
            sql_message: batch.sql_message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        for status in [
            OutgoingBatchStatus::New,
            OutgoingBatchStatus::Routing,
            OutgoingBatchStatus::Querying,
            OutgoingBatchStatus::Sending,
            OutgoingBatchStatus::Loading,
            OutgoingBatchStatus::Ok,
            OutgoingBatchStatus::Error,
            OutgoingBatchStatus::Ignored,
        ] {
            assert_eq!(OutgoingBatchStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(OutgoingBatchStatus::from_code("ZZ"), None);
        assert_eq!(
            IncomingBatchStatus::from_code("ER"),
            Some(IncomingBatchStatus::Error)
        );
    }

    #[test]
    fn test_event_counters() {
        let mut batch = OutgoingBatch::new("002", "sales", OutgoingBatchStatus::Routing);
        batch.increment_event_count(DataEventType::Insert);
        batch.increment_event_count(DataEventType::Update);
        batch.increment_event_count(DataEventType::Sql);
        batch.increment_event_count(DataEventType::Reload);
        assert_eq!(batch.data_event_count, 4);
        assert_eq!(batch.insert_event_count, 1);
        assert_eq!(batch.update_event_count, 1);
        assert_eq!(batch.other_event_count, 1);
        assert_eq!(batch.reload_event_count, 1);
        assert!(batch.load_flag);
    }

    #[test]
    fn test_ack_from_failed_incoming_batch() {
        let mut batch = IncomingBatch::new(7, "001", "sales");
        batch.status = IncomingBatchStatus::Error;
        batch.failed_row_number = 3;
        batch.sql_code = 19;
        let ack = BatchAck::from(&batch);
        assert!(!ack.ok);
        assert_eq!(ack.error_line, 3);
        assert_eq!(ack.sql_code, 19);
    }
}
