//! Pulls batches from nodes that wait for this node to pull

use std::sync::Arc;

use tracing::warn;

use crate::db::Database;
use crate::error::Result;
use crate::model::{RemoteNodeStatus, RemoteStatus};
use crate::service::loader::DataLoaderService;
use crate::service::Services;

pub struct PullService {
    database: Arc<Database>,
    services: Arc<Services>,
    loader: Arc<DataLoaderService>,
}

impl PullService {
    pub fn new(database: Arc<Database>, services: Arc<Services>, loader: Arc<DataLoaderService>) -> Self {
        Self {
            database,
            services,
            loader,
        }
    }

    /// Pull from every node this node pulls from, one at a time.
    ///
    /// A node keeps being pulled while it returns data without errors, so a
    /// backlog larger than one delivery drains in a single run.
    pub async fn pull_data(&self) -> Result<Vec<RemoteNodeStatus>> {
        let (credentials, remotes) = {
            let conn = self.database.lock().await;
            let (local, credentials) = self.services.local_credentials(&conn)?;
            let remotes = self.services.nodes.find_nodes_to_pull(&conn, &local)?;
            (credentials, remotes)
        };

        let mut statuses = Vec::with_capacity(remotes.len());
        for remote in &remotes {
            let mut total = RemoteNodeStatus::new(remote.node_id.clone());
            loop {
                let status = self.loader.load_data_from_pull(remote, &credentials).await;
                let more = status.status == RemoteStatus::DataProcessed
                    && status.batches_processed > 0;
                merge(&mut total, status);
                if !more {
                    break;
                }
            }
            if total.failed() {
                warn!(
                    "Pull from node {} ended with {:?}: {}",
                    remote.node_id,
                    total.status,
                    total.failure_message.as_deref().unwrap_or("")
                );
            }
            statuses.push(total);
        }
        Ok(statuses)
    }
}

/// Fold the result of one pull into the node's running status
fn merge(total: &mut RemoteNodeStatus, status: RemoteNodeStatus) {
    total.data_processed += status.data_processed;
    total.batches_processed += status.batches_processed;
    total.reload_batches_processed += status.reload_batches_processed;
    total.complete = status.complete;
    if status.failed() || total.status != RemoteStatus::DataProcessed {
        total.status = status.status;
        total.failure_message = status.failure_message;
    }
}
