//! Nodes of the synchronization mesh

use serde::{Deserialize, Serialize};

use crate::model::{BatchAck, IncomingBatch, IncomingBatchStatus, OutgoingBatch};

/// One participant in the mesh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub node_group_id: String,
    pub external_id: String,
    pub sync_enabled: bool,
    pub sync_url: Option<String>,
    pub schema_version: Option<String>,
    pub symmetric_version: Option<String>,
    pub database_type: Option<String>,
    pub database_version: Option<String>,
    pub heartbeat_time: Option<String>,
    pub timezone_offset: Option<String>,
    pub batch_to_send_count: i64,
    pub batch_in_error_count: i64,
    pub created_at_node_id: Option<String>,
    pub deployment_type: Option<String>,
}

impl Node {
    pub fn new(
        node_id: impl Into<String>,
        node_group_id: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_group_id: node_group_id.into(),
            external_id: external_id.into(),
            sync_enabled: true,
            sync_url: None,
            schema_version: None,
            symmetric_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            database_type: Some("sqlite".to_string()),
            database_version: Some(rusqlite::version().to_string()),
            heartbeat_time: None,
            timezone_offset: None,
            batch_to_send_count: 0,
            batch_in_error_count: 0,
            created_at_node_id: None,
            deployment_type: Some("symsync".to_string()),
        }
    }

    pub fn with_sync_url(mut self, sync_url: impl Into<String>) -> Self {
        self.sync_url = Some(sync_url.into());
        self
    }
}

/// Credentials a node presents to its peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSecurity {
    pub node_id: String,
    pub node_password: String,
    pub registration_enabled: bool,
    pub registration_time: Option<String>,
    pub initial_load_enabled: bool,
    pub initial_load_time: Option<String>,
    pub created_at_node_id: Option<String>,
}

impl NodeSecurity {
    pub fn new(node_id: impl Into<String>, node_password: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_password: node_password.into(),
            registration_enabled: false,
            registration_time: None,
            initial_load_enabled: false,
            initial_load_time: None,
            created_at_node_id: None,
        }
    }
}

/// Direction data moves across a node group link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeGroupLinkAction {
    /// Target nodes pull from the source
    WaitForPull,
    /// Source nodes push to the target
    Push,
    /// Route only, never transfer
    RouteOnly,
}

impl NodeGroupLinkAction {
    pub fn code(&self) -> &'static str {
        match self {
            NodeGroupLinkAction::WaitForPull => "W",
            NodeGroupLinkAction::Push => "P",
            NodeGroupLinkAction::RouteOnly => "R",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "W" => Some(NodeGroupLinkAction::WaitForPull),
            "P" => Some(NodeGroupLinkAction::Push),
            "R" => Some(NodeGroupLinkAction::RouteOnly),
            _ => None,
        }
    }
}

/// Directed link between two node groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupLink {
    pub source_node_group_id: String,
    pub target_node_group_id: String,
    pub data_event_action: NodeGroupLinkAction,
    pub sync_config_enabled: bool,
}

impl NodeGroupLink {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        action: NodeGroupLinkAction,
    ) -> Self {
        Self {
            source_node_group_id: source.into(),
            target_node_group_id: target.into(),
            data_event_action: action,
            sync_config_enabled: true,
        }
    }
}

/// Outcome of talking to a remote node during push or pull
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteStatus {
    NoData,
    DataProcessed,
    DataError,
    Offline,
    Busy,
    NotAuthorized,
    SyncDisabled,
    UnknownError,
}

/// Per-remote result of one push or pull cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNodeStatus {
    pub node_id: String,
    pub status: RemoteStatus,
    pub failure_message: Option<String>,
    pub data_processed: i64,
    pub batches_processed: i64,
    pub reload_batches_processed: i64,
    pub complete: bool,
}

impl RemoteNodeStatus {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: RemoteStatus::NoData,
            failure_message: None,
            data_processed: 0,
            batches_processed: 0,
            reload_batches_processed: 0,
            complete: false,
        }
    }

    /// Record the batches loaded from this remote
    pub fn update_incoming_status(&mut self, batches: &[IncomingBatch]) {
        for batch in batches {
            self.batches_processed += 1;
            self.data_processed += batch.statement_count;
            if batch.status == IncomingBatchStatus::Error {
                self.status = RemoteStatus::DataError;
                self.failure_message = batch.sql_message.clone();
            } else if self.status != RemoteStatus::DataError {
                self.status = RemoteStatus::DataProcessed;
            }
        }
    }

    /// Record the batches sent to this remote and the acks it returned
    pub fn update_outgoing_status(&mut self, batches: &[OutgoingBatch], acks: &[BatchAck]) {
        for batch in batches {
            self.batches_processed += 1;
            self.data_processed += batch.data_event_count;
            if batch.load_flag {
                self.reload_batches_processed += 1;
            }
        }
        if !batches.is_empty() && self.status != RemoteStatus::DataError {
            self.status = RemoteStatus::DataProcessed;
        }
        if let Some(failed) = acks.iter().find(|a| !a.ok) {
            self.status = RemoteStatus::DataError;
            self.failure_message = failed.sql_message.clone();
        }
    }

    /// Record a transport or storage failure
    pub fn fail(&mut self, error: &crate::Error) {
        self.status = match error {
            crate::Error::ConnectionFailed { .. } => RemoteStatus::Offline,
            crate::Error::ConnectionRejected(_) => RemoteStatus::Busy,
            crate::Error::AuthenticationFailed(_) => RemoteStatus::NotAuthorized,
            crate::Error::SyncDisabled(_) => RemoteStatus::SyncDisabled,
            _ => RemoteStatus::UnknownError,
        };
        self.failure_message = Some(error.to_string());
    }

    pub fn failed(&self) -> bool {
        !matches!(
            self.status,
            RemoteStatus::NoData | RemoteStatus::DataProcessed
        )
    }
}
