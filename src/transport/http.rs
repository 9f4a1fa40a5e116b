//! HTTP transport to remote sync servers
//!
//! `GET {sync_url}/pull` streams batches back, `PUT {sync_url}/push`
//! sends a payload and reads the ack body, `POST {sync_url}/ack` reports
//! the outcome of pulled batches.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{StatusCode, Url};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{BatchAck, Node};
use crate::service::outgoing_batch::host_name;
use crate::transport::{ack, Credentials, IncomingTransport, TransportManager};

/// The remote refused because sync is disabled on it
pub const SYNC_DISABLED: u16 = 658;
/// The remote did not accept the node's credentials
pub const FORBIDDEN: u16 = 659;
/// The remote is serving too many nodes
pub const SERVICE_BUSY: u16 = 670;

pub struct HttpTransportManager {
    client: reqwest::Client,
}

impl HttpTransportManager {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn url(remote: &Node, action: &str, credentials: &Credentials) -> Result<Url> {
        let base = remote.sync_url.as_deref().ok_or_else(|| {
            Error::Config(format!("node {} has no sync url", remote.node_id))
        })?;
        let mut url = Url::parse(&format!("{}/{}", base.trim_end_matches('/'), action))
            .map_err(|e| Error::Config(format!("invalid sync url '{}': {}", base, e)))?;
        url.query_pairs_mut()
            .append_pair("nodeId", &credentials.node_id)
            .append_pair("securityToken", &credentials.security_token)
            .append_pair("hostName", &host_name());
        Ok(url)
    }
}

/// Map a non-success response to the error the caller reports
fn check_status(url: &Url, status: StatusCode) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    let target = format!("{}://{}{}", url.scheme(), url.host_str().unwrap_or(""), url.path());
    Err(match status.as_u16() {
        401 | 403 | FORBIDDEN => Error::AuthenticationFailed(target),
        SYNC_DISABLED => Error::SyncDisabled(target),
        503 | SERVICE_BUSY => Error::ConnectionRejected(target),
        code => Error::Transport(format!("{} returned status {}", target, code)),
    })
}

/// Response body read chunk by chunk
struct HttpIncomingTransport {
    response: reqwest::Response,
}

#[async_trait]
impl IncomingTransport for HttpIncomingTransport {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.response.chunk().await?)
    }
}

#[async_trait]
impl TransportManager for HttpTransportManager {
    async fn pull(&self, remote: &Node, credentials: &Credentials) -> Result<Box<dyn IncomingTransport>> {
        let url = Self::url(remote, "pull", credentials)?;
        debug!("Pulling from {}", remote.node_id);
        let response = self.client.get(url.clone()).send().await?;
        check_status(&url, response.status())?;
        Ok(Box::new(HttpIncomingTransport { response }))
    }

    async fn push(&self, remote: &Node, credentials: &Credentials, payload: Bytes) -> Result<Vec<BatchAck>> {
        let url = Self::url(remote, "push", credentials)?;
        debug!("Pushing {} bytes to {}", payload.len(), remote.node_id);
        let response = self
            .client
            .put(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(payload)
            .send()
            .await?;
        check_status(&url, response.status())?;
        let body = response.text().await?;
        // The first line carries the acks; later lines are extensions
        ack::parse_acks(body.lines().next().unwrap_or(""))
    }

    async fn send_acks(&self, remote: &Node, credentials: &Credentials, acks: &[BatchAck]) -> Result<()> {
        let url = Self::url(remote, "ack", credentials)?;
        let response = self
            .client
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(ack::encode_acks(acks))
            .send()
            .await?;
        check_status(&url, response.status())
    }
}
