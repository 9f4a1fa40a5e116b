//! Applies batch acknowledgements to outgoing batches

use std::sync::Arc;

use rusqlite::Connection;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::model::{BatchAck, OutgoingBatchStatus};
use crate::service::data::DataService;
use crate::service::outgoing_batch::OutgoingBatchService;

pub struct AcknowledgeService {
    outgoing_batches: Arc<OutgoingBatchService>,
    data: Arc<DataService>,
}

impl AcknowledgeService {
    pub fn new(outgoing_batches: Arc<OutgoingBatchService>, data: Arc<DataService>) -> Self {
        Self {
            outgoing_batches,
            data,
        }
    }

    /// Apply one acknowledgement.
    ///
    /// Batches already OK or IGNORED keep their status, so a late error ack
    /// cannot undo a successful delivery. The first OK ack of an IGNORED
    /// batch only records its delivery. Returns whether the batch changed.
    pub fn ack(&self, conn: &Connection, ack: &BatchAck) -> Result<bool> {
        let mut batch = match self
            .outgoing_batches
            .find_outgoing_batch(conn, ack.batch_id, ack.node_id.as_deref())?
        {
            Some(batch) => batch,
            None => {
                warn!("Received an acknowledgement for unknown batch {}", ack.batch_id);
                return Ok(false);
            }
        };

        if batch.status == OutgoingBatchStatus::Ignored && ack.ok && batch.load_count == 0 {
            batch.load_count += 1;
            batch.network_millis = ack.network_millis;
            self.outgoing_batches.update_outgoing_batch(conn, &mut batch)?;
            debug!("Node acknowledged ignored batch {}", batch.node_batch_id());
            return Ok(true);
        }

        if batch.status.is_terminal() {
            debug!(
                "Ignoring acknowledgement for batch {} already {}",
                batch.node_batch_id(),
                batch.status
            );
            return Ok(false);
        }

        batch.network_millis = ack.network_millis;
        batch.filter_millis = ack.filter_millis;
        batch.load_millis = ack.database_millis;
        batch.sql_state = ack.sql_state.clone();
        batch.sql_code = ack.sql_code;
        batch.sql_message = ack.sql_message.clone();

        if ack.ok {
            batch.status = OutgoingBatchStatus::Ok;
            batch.load_count += 1;
            batch.failed_data_id = 0;
            batch.failed_line_number = 0;
        } else {
            batch.status = OutgoingBatchStatus::Error;
            batch.failed_line_number = ack.error_line;
            let data_ids = self.data.select_data_ids_for_batch(conn, batch.batch_id)?;
            batch.failed_data_id = usize::try_from(ack.error_line)
                .ok()
                .and_then(|line| data_ids.get(line).copied())
                .unwrap_or(0);
            error!(
                "Batch {} failed to load at data id {}: {}",
                batch.node_batch_id(),
                batch.failed_data_id,
                batch.sql_message.as_deref().unwrap_or("unknown error")
            );
        }

        self.outgoing_batches.update_outgoing_batch(conn, &mut batch)?;
        Ok(true)
    }

    /// Apply a set of acknowledgements, returning how many changed a batch
    pub fn ack_all(&self, conn: &Connection, acks: &[BatchAck]) -> Result<usize> {
        let mut changed = 0;
        for ack in acks {
            if self.ack(conn, ack)? {
                changed += 1;
            }
        }
        Ok(changed)
    }
}
