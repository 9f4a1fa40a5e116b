//! Transport Module
//!
//! Moves protocol bytes and acknowledgements between nodes. The HTTP
//! transport talks to remote sync servers; the internal transport hands
//! requests to engines running in the same process.

pub mod ack;
pub mod http;
pub mod internal;

pub use ack::{encode_acks, parse_acks};
pub use http::HttpTransportManager;
pub use internal::InternalTransportManager;

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::model::{BatchAck, Node};

/// Node id and password presented to a remote node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub node_id: String,
    pub security_token: String,
}

impl Credentials {
    pub fn new(node_id: impl Into<String>, security_token: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            security_token: security_token.into(),
        }
    }
}

/// Stream of protocol bytes received from a remote node
#[async_trait]
pub trait IncomingTransport: Send {
    /// Next chunk of the stream, `None` at its end
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Incoming stream over bytes already in memory
pub struct BufferedTransport {
    chunks: VecDeque<Bytes>,
}

impl BufferedTransport {
    /// Chunk size used when splitting a buffered payload
    pub const CHUNK_SIZE: usize = 8 * 1024;

    pub fn new(payload: Bytes) -> Self {
        let mut chunks = VecDeque::new();
        let mut rest = payload;
        while !rest.is_empty() {
            let size = rest.len().min(Self::CHUNK_SIZE);
            chunks.push_back(rest.split_to(size));
        }
        Self { chunks }
    }
}

#[async_trait]
impl IncomingTransport for BufferedTransport {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.chunks.pop_front())
    }
}

/// Client side of the sync protocol
#[async_trait]
pub trait TransportManager: Send + Sync {
    /// Open a pull of the batches `remote` holds for us
    async fn pull(&self, remote: &Node, credentials: &Credentials) -> Result<Box<dyn IncomingTransport>>;

    /// Deliver a payload and return the remote's acknowledgements
    async fn push(&self, remote: &Node, credentials: &Credentials, payload: Bytes) -> Result<Vec<BatchAck>>;

    /// Acknowledge batches pulled from `remote`
    async fn send_acks(&self, remote: &Node, credentials: &Credentials, acks: &[BatchAck]) -> Result<()>;
}

/// Server side of the sync protocol, served by an engine
#[async_trait]
pub trait SyncEndpoint: Send + Sync {
    /// Node id this endpoint serves as
    fn node_id(&self) -> &str;

    /// Extract the batches waiting for the calling node
    async fn handle_pull(&self, credentials: &Credentials) -> Result<Bytes>;

    /// Load a payload sent by the calling node
    async fn handle_push(&self, credentials: &Credentials, payload: Bytes) -> Result<Vec<BatchAck>>;

    /// Apply acknowledgements sent by the calling node
    async fn handle_ack(&self, credentials: &Credentials, acks: Vec<BatchAck>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffered_transport_chunks() {
        let payload = Bytes::from(vec![b'x'; BufferedTransport::CHUNK_SIZE * 2 + 10]);
        let mut transport = BufferedTransport::new(payload);
        let mut sizes = Vec::new();
        while let Some(chunk) = transport.next_chunk().await.unwrap() {
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, vec![BufferedTransport::CHUNK_SIZE, BufferedTransport::CHUNK_SIZE, 10]);

        let mut empty = BufferedTransport::new(Bytes::new());
        assert!(empty.next_chunk().await.unwrap().is_none());
    }
}
