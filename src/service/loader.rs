//! Loads protocol streams into the local database and acknowledges them

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::error::{Error, Result};
use crate::io::{DatabaseWriterSettings, DefaultDatabaseWriter, ProtocolDataReader};
use crate::model::{elapsed_millis, BatchAck, IncomingBatch, IncomingBatchStatus, Node, RemoteNodeStatus};
use crate::service::parameter;
use crate::service::Services;
use crate::transport::{Credentials, IncomingTransport, TransportManager};

/// Outcome of loading one stream
#[derive(Debug, Default)]
pub struct LoadResult {
    /// Batches loaded, skipped or failed, in stream order
    pub batches: Vec<IncomingBatch>,
    /// A loaded batch changed trigger, router or channel configuration
    pub config_touched: bool,
    /// Error that stopped the read
    pub failure: Option<Error>,
}

impl LoadResult {
    /// One ack per batch from the acknowledging node, OK unless the
    /// batch failed
    pub fn acks(&self, node_id: &str) -> Vec<BatchAck> {
        self.batches
            .iter()
            .map(|batch| BatchAck {
                node_id: Some(node_id.to_string()),
                ..BatchAck::from(batch)
            })
            .collect()
    }

    pub fn has_errors(&self) -> bool {
        self.failure.is_some()
            || self
                .batches
                .iter()
                .any(|b| b.status == IncomingBatchStatus::Error)
    }
}

pub struct DataLoaderService {
    database: Arc<Database>,
    services: Arc<Services>,
    transport: Arc<dyn TransportManager>,
}

impl DataLoaderService {
    pub fn new(database: Arc<Database>, services: Arc<Services>, transport: Arc<dyn TransportManager>) -> Self {
        Self {
            database,
            services,
            transport,
        }
    }

    /// Pull from `remote`, load what it sends and acknowledge the batches
    pub async fn load_data_from_pull(&self, remote: &Node, credentials: &Credentials) -> RemoteNodeStatus {
        let mut status = RemoteNodeStatus::new(remote.node_id.clone());
        let loaded: Result<LoadResult> = async {
            let mut incoming = self.transport.pull(remote, credentials).await?;
            self.load(incoming.as_mut()).await
        }
        .await;

        match loaded {
            Ok(result) => {
                status.update_incoming_status(&result.batches);
                if let Some(e) = &result.failure {
                    if result.batches.is_empty() {
                        status.fail(e);
                    }
                }
                if !result.batches.is_empty() {
                    let acks = result.acks(&credentials.node_id);
                    if !self.send_acks(remote, credentials, &acks).await {
                        status.fail(&Error::Transport(format!(
                            "acknowledgements for {} batches were not delivered",
                            acks.len()
                        )));
                    }
                }
            }
            Err(e) => {
                warn!("Failed to pull from node {}: {}", remote.node_id, e);
                status.fail(&e);
            }
        }
        status.complete = true;
        status
    }

    /// Load a pushed payload, returning the acks `local_node_id` sends back
    pub async fn load_payload(&self, payload: Bytes, local_node_id: &str) -> Result<Vec<BatchAck>> {
        let mut incoming = crate::transport::BufferedTransport::new(payload);
        let result = self.load(&mut incoming).await?;
        if let Some(e) = &result.failure {
            if result.batches.is_empty() {
                return Err(Error::Transport(format!("pushed payload was not loaded: {}", e)));
            }
        }
        Ok(result.acks(local_node_id))
    }

    /// Read a whole stream, then apply it batch by batch.
    ///
    /// A failed batch is rolled back, recorded as ER and ends the load;
    /// batches before it stay committed.
    pub async fn load(&self, transport: &mut dyn IncomingTransport) -> Result<LoadResult> {
        let started = Instant::now();
        let mut chunks = Vec::new();
        while let Some(chunk) = transport.next_chunk().await? {
            chunks.push(chunk);
        }
        let network_millis = elapsed_millis(started);
        let bytes: usize = chunks.iter().map(Bytes::len).sum();
        if bytes == 0 {
            debug!("Received an empty stream");
            return Ok(LoadResult::default());
        }

        let services = &self.services;
        let conn = self.database.lock().await;
        let settings = DatabaseWriterSettings::from_parameters(&services.parameters);
        let mut writer = DefaultDatabaseWriter::new(
            &conn,
            &services.incoming_batches,
            &services.platform,
            services.dialect.as_ref(),
            settings,
        );
        let mut reader = ProtocolDataReader::new();
        let mut failure = None;
        for chunk in &chunks {
            if let Err(e) = reader.feed(chunk, &mut writer) {
                failure = Some(e);
                break;
            }
        }
        if failure.is_none() {
            if let Err(e) = reader.finish(&mut writer) {
                failure = Some(e);
            }
        }

        let config_touched = writer.config_touched();
        let mut batches = writer.into_completed();
        for batch in batches.iter_mut() {
            batch.network_millis = network_millis;
        }
        if let Some(e) = &failure {
            error!(
                "Stopped loading from node {} after {} batches: {}",
                reader.source_node_id().unwrap_or("unknown"),
                batches.len(),
                e
            );
        } else {
            info!(
                "Loaded {} batches ({} bytes) from node {}",
                batches.len(),
                bytes,
                reader.source_node_id().unwrap_or("unknown")
            );
        }

        if config_touched {
            self.sync_triggers_after_config(&conn);
        }
        Ok(LoadResult {
            batches,
            config_touched,
            failure,
        })
    }

    /// Send acks to `remote`.
    ///
    /// `num.of.ack.retries` is the total number of attempts, including the
    /// first one, and is raised to one when set lower. Attempts are spaced
    /// by `time.between.ack.retries.ms`. Returns false when every attempt
    /// failed; the remote then redelivers on the next pull.
    pub async fn send_acks(&self, remote: &Node, credentials: &Credentials, acks: &[BatchAck]) -> bool {
        let parameters = &self.services.parameters;
        let attempts = parameters.get_int(parameter::NUM_OF_ACK_RETRIES, 5).max(1);
        let delay = Duration::from_millis(
            u64::try_from(parameters.get_long(parameter::TIME_BETWEEN_ACK_RETRIES, 5000)).unwrap_or(0),
        );

        for attempt in 1..=attempts {
            match self.transport.send_acks(remote, credentials, acks).await {
                Ok(()) => {
                    debug!("Sent {} acks to node {}", acks.len(), remote.node_id);
                    return true;
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        "Failed to send acks to node {} (attempt {} of {}): {}",
                        remote.node_id, attempt, attempts, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        "Giving up sending acks to node {} after {} attempts: {}",
                        remote.node_id, attempts, e
                    );
                }
            }
        }
        false
    }

    fn sync_triggers_after_config(&self, conn: &rusqlite::Connection) {
        let parameters = &self.services.parameters;
        if !parameters.is(parameter::AUTO_SYNC_TRIGGERS, true)
            || !parameters.is(parameter::AUTO_SYNC_TRIGGERS_AFTER_CONFIG_LOADED, true)
        {
            debug!("Configuration changed; automatic trigger sync is disabled");
            return;
        }
        self.services.clear_caches();
        match self
            .services
            .trigger_routers
            .sync_triggers(conn, parameters.node_group_id(), false)
        {
            Ok(summary) => info!(
                "Synchronized triggers after configuration load: {} rebuilt, {} removed",
                summary.rebuilt, summary.removed
            ),
            Err(e) => error!("Failed to synchronize triggers after configuration load: {}", e),
        }
    }
}
