//! In-process transport between engines sharing one runtime

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{BatchAck, Node};
use crate::transport::{BufferedTransport, Credentials, IncomingTransport, SyncEndpoint, TransportManager};

/// Routes requests to registered endpoints by node id
#[derive(Clone, Default)]
pub struct InternalTransportManager {
    endpoints: Arc<RwLock<HashMap<String, Weak<dyn SyncEndpoint>>>>,
}

impl InternalTransportManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an endpoint reachable. Only a weak reference is kept, so a
    /// dropped engine goes offline.
    pub fn register(&self, endpoint: &Arc<dyn SyncEndpoint>) {
        if let Ok(mut endpoints) = self.endpoints.write() {
            debug!("Registering internal endpoint {}", endpoint.node_id());
            endpoints.insert(endpoint.node_id().to_string(), Arc::downgrade(endpoint));
        }
    }

    pub fn unregister(&self, node_id: &str) {
        if let Ok(mut endpoints) = self.endpoints.write() {
            endpoints.remove(node_id);
        }
    }

    fn endpoint(&self, remote: &Node) -> Result<Arc<dyn SyncEndpoint>> {
        let endpoints = self
            .endpoints
            .read()
            .map_err(|_| Error::Internal("internal transport registry poisoned".into()))?;
        endpoints
            .get(&remote.node_id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::ConnectionFailed {
                url: format!("internal://{}", remote.node_id),
                reason: "no engine is running for this node".into(),
            })
    }
}

#[async_trait]
impl TransportManager for InternalTransportManager {
    async fn pull(&self, remote: &Node, credentials: &Credentials) -> Result<Box<dyn IncomingTransport>> {
        let payload = self.endpoint(remote)?.handle_pull(credentials).await?;
        Ok(Box::new(BufferedTransport::new(payload)))
    }

    async fn push(&self, remote: &Node, credentials: &Credentials, payload: Bytes) -> Result<Vec<BatchAck>> {
        self.endpoint(remote)?.handle_push(credentials, payload).await
    }

    async fn send_acks(&self, remote: &Node, credentials: &Credentials, acks: &[BatchAck]) -> Result<()> {
        self.endpoint(remote)?
            .handle_ack(credentials, acks.to_vec())
            .await
    }
}
