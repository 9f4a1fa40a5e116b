//! Domain model
//!
//! Value types shared by the capture, routing, extraction and loading
//! pipeline: tables and columns, trigger configuration, captured data,
//! batches and nodes.

pub mod batch;
pub mod channel;
pub mod data;
pub mod node;
pub mod table;
pub mod trigger;

pub use batch::{BatchAck, IncomingBatch, IncomingBatchStatus, OutgoingBatch, OutgoingBatchStatus};
pub use channel::Channel;
pub use data::{Data, DataEvent, DataEventType};
pub use node::{Node, NodeGroupLink, NodeGroupLinkAction, NodeSecurity, RemoteNodeStatus, RemoteStatus};
pub use table::{Column, ColumnType, Table};
pub use trigger::{Router, Trigger, TriggerHistory, TriggerReBuildReason, TriggerRouter};

/// Node id of the synthetic node that receives data no router claimed
pub const UNROUTED_NODE_ID: &str = "-1";

/// Router id recorded for data that was not routed by a configured router
pub const UNKNOWN_ROUTER_ID: &str = "?";

/// Current time formatted the way timestamps are stored in sym_ tables
pub fn now_timestamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%d %H:%M:%S%.3f")
        .to_string()
}

/// Milliseconds since `started`, saturating at `i64::MAX`
pub fn elapsed_millis(started: std::time::Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

/// Split a comma separated name list, dropping blanks
pub fn split_names(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
