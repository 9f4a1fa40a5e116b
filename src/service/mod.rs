//! Services Module
//!
//! Synchronous services operate on a borrowed connection so callers can
//! group several calls in one transaction. The loader, push and pull
//! services are async and own the database handle and transport.

pub mod acknowledge;
pub mod configuration;
pub mod data;
pub mod extractor;
pub mod incoming_batch;
pub mod loader;
pub mod node;
pub mod outgoing_batch;
pub mod parameter;
pub mod pull;
pub mod push;
pub mod router;
pub mod sequence;
pub mod trigger_router;

pub use acknowledge::AcknowledgeService;
pub use configuration::ConfigurationService;
pub use data::DataService;
pub use extractor::{DataExtractorService, ExtractedBatches};
pub use incoming_batch::IncomingBatchService;
pub use loader::{DataLoaderService, LoadResult};
pub use node::NodeService;
pub use outgoing_batch::OutgoingBatchService;
pub use parameter::ParameterService;
pub use pull::PullService;
pub use push::PushService;
pub use router::{DataRouter, RouterService};
pub use sequence::SequenceService;
pub use trigger_router::{SyncTriggersSummary, TriggerRouterService};

use std::sync::Arc;

use rusqlite::Connection;

use crate::db::{Dialect, Platform, SqliteDialect};
use crate::error::{Error, Result};
use crate::model::Node;
use crate::transport::Credentials;

/// The connection-scoped services of one node, wired together
pub struct Services {
    pub parameters: Arc<ParameterService>,
    pub configuration: Arc<ConfigurationService>,
    pub nodes: Arc<NodeService>,
    pub sequences: Arc<SequenceService>,
    pub platform: Arc<Platform>,
    pub dialect: Arc<dyn Dialect>,
    pub trigger_routers: Arc<TriggerRouterService>,
    pub outgoing_batches: Arc<OutgoingBatchService>,
    pub incoming_batches: Arc<IncomingBatchService>,
    pub data: Arc<DataService>,
    pub acknowledge: Arc<AcknowledgeService>,
    pub router: Arc<RouterService>,
    pub extractor: Arc<DataExtractorService>,
}

impl Services {
    pub fn new(parameters: Arc<ParameterService>) -> Self {
        let configuration = Arc::new(ConfigurationService::new());
        let nodes = Arc::new(NodeService::new());
        let sequences = Arc::new(SequenceService::new());
        let platform = Arc::new(Platform::new());
        let dialect: Arc<dyn Dialect> = Arc::new(SqliteDialect::new());
        let trigger_routers = Arc::new(TriggerRouterService::new(
            parameters.clone(),
            configuration.clone(),
            platform.clone(),
            dialect.clone(),
        ));
        let outgoing_batches = Arc::new(OutgoingBatchService::new(
            sequences.clone(),
            configuration.clone(),
        ));
        let incoming_batches = Arc::new(IncomingBatchService::new(parameters.clone()));
        let data = Arc::new(DataService::new(outgoing_batches.clone()));
        let acknowledge = Arc::new(AcknowledgeService::new(
            outgoing_batches.clone(),
            data.clone(),
        ));
        let router = Arc::new(RouterService::new(
            parameters.clone(),
            configuration.clone(),
            nodes.clone(),
            trigger_routers.clone(),
            data.clone(),
            outgoing_batches.clone(),
        ));
        let extractor = Arc::new(DataExtractorService::new(
            nodes.clone(),
            trigger_routers.clone(),
            data.clone(),
            outgoing_batches.clone(),
            platform.clone(),
            dialect.clone(),
        ));

        Self {
            parameters,
            configuration,
            nodes,
            sequences,
            platform,
            dialect,
            trigger_routers,
            outgoing_batches,
            incoming_batches,
            data,
            acknowledge,
            router,
            extractor,
        }
    }

    /// Seed sequences and built-in channels, then load database parameters
    pub fn init(&self, conn: &Connection) -> Result<()> {
        self.sequences.init(conn)?;
        self.configuration.ensure_default_channels(conn)?;
        self.parameters.refresh(conn)?;
        Ok(())
    }

    /// This node and the credentials it presents to remote nodes
    pub fn local_credentials(&self, conn: &Connection) -> Result<(Node, Credentials)> {
        let local = self
            .nodes
            .find_identity(conn)?
            .ok_or_else(|| Error::Config("this node has no identity".into()))?;
        let token = self
            .nodes
            .find_node_security(conn, &local.node_id)?
            .map(|security| security.node_password)
            .unwrap_or_default();
        let credentials = Credentials::new(local.node_id.clone(), token);
        Ok((local, credentials))
    }

    /// Drop every cached configuration row
    pub fn clear_caches(&self) {
        self.configuration.clear_cache();
        self.trigger_routers.clear_cache();
        self.nodes.flush_cache();
        self.platform.reset_cache();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A corp node `000` routing the `item` table to store nodes `001` and `002`

    use std::collections::HashMap;
    use std::sync::Arc;

    use rusqlite::Connection;

    use super::{ParameterService, Services};
    use crate::db::schema::create_sym_tables;
    use crate::model::{Node, NodeGroupLink, NodeGroupLinkAction, Router, Trigger, TriggerRouter};

    pub const ITEM_DDL: &str =
        "CREATE TABLE item (id INTEGER PRIMARY KEY, name TEXT, price REAL, image BLOB);";

    pub fn services(node_id: &str, group: &str, parameters: HashMap<String, String>) -> (Connection, Services) {
        let conn = Connection::open_in_memory().unwrap();
        create_sym_tables(&conn).unwrap();
        conn.execute_batch(ITEM_DDL).unwrap();
        let services = Services::new(Arc::new(ParameterService::new(node_id, group, parameters)));
        services.init(&conn).unwrap();
        services
            .nodes
            .save_identity(&conn, &Node::new(node_id, group, node_id))
            .unwrap();
        (conn, services)
    }

    /// Corp node with triggers installed on `item`
    pub fn corp() -> (Connection, Services) {
        let (conn, services) = services("000", "corp", HashMap::new());
        services
            .nodes
            .save_node(&conn, &Node::new("001", "store", "001"))
            .unwrap();
        services
            .nodes
            .save_node(&conn, &Node::new("002", "store", "002"))
            .unwrap();
        let link = NodeGroupLink::new("corp", "store", NodeGroupLinkAction::WaitForPull);
        services.configuration.save_node_group_link(&conn, &link).unwrap();
        services
            .trigger_routers
            .save_trigger_router(
                &conn,
                &TriggerRouter::new(
                    Trigger::new("item", "item", "default"),
                    Router::new("corp_2_store", link),
                ),
            )
            .unwrap();
        services.trigger_routers.sync_triggers(&conn, "corp", false).unwrap();
        (conn, services)
    }
}
