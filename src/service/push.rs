//! Pushes outgoing batches to nodes linked with a push action

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::db::{in_transaction, Database};
use crate::error::Result;
use crate::model::{BatchAck, Node, OutgoingBatchStatus, RemoteNodeStatus};
use crate::service::Services;
use crate::transport::{Credentials, TransportManager};

pub struct PushService {
    database: Arc<Database>,
    services: Arc<Services>,
    transport: Arc<dyn TransportManager>,
}

impl PushService {
    pub fn new(database: Arc<Database>, services: Arc<Services>, transport: Arc<dyn TransportManager>) -> Self {
        Self {
            database,
            services,
            transport,
        }
    }

    /// Push to every node this node pushes to, one at a time
    pub async fn push_data(&self) -> Result<Vec<RemoteNodeStatus>> {
        let (credentials, remotes) = {
            let conn = self.database.lock().await;
            let (local, credentials) = self.services.local_credentials(&conn)?;
            let remotes = self.services.nodes.find_nodes_to_push_to(&conn, &local)?;
            (credentials, remotes)
        };

        let mut statuses = Vec::with_capacity(remotes.len());
        for remote in &remotes {
            let status = self.push_to_node(remote, &credentials).await;
            if status.failed() {
                warn!(
                    "Push to node {} ended with {:?}: {}",
                    remote.node_id,
                    status.status,
                    status.failure_message.as_deref().unwrap_or("")
                );
            }
            statuses.push(status);
        }
        Ok(statuses)
    }

    /// Extract the batches waiting for `remote`, send them and apply the
    /// acks it answers with.
    ///
    /// Delivered batches move to LOADING until their ack arrives. When the
    /// send fails they stay SENDING and go out again on the next push.
    pub async fn push_to_node(&self, remote: &Node, credentials: &Credentials) -> RemoteNodeStatus {
        let mut status = RemoteNodeStatus::new(remote.node_id.clone());

        let extracted = {
            let conn = self.database.lock().await;
            self.services.extractor.extract(&conn, remote)
        };
        let extracted = match extracted {
            Ok(extracted) if extracted.is_empty() => {
                debug!("Nothing to push to node {}", remote.node_id);
                status.complete = true;
                return status;
            }
            Ok(extracted) => extracted,
            Err(e) => {
                status.fail(&e);
                return status;
            }
        };

        let batches = extracted.batches;
        let acks = match self
            .transport
            .push(remote, credentials, Bytes::from(extracted.payload))
            .await
        {
            Ok(acks) => acks,
            Err(e) => {
                status.fail(&e);
                return status;
            }
        };

        let acks: Vec<BatchAck> = acks
            .into_iter()
            .map(|ack| BatchAck {
                node_id: Some(remote.node_id.clone()),
                ..ack
            })
            .collect();
        let applied = {
            let conn = self.database.lock().await;
            in_transaction(&conn, |tx| {
                for batch in batches.iter().filter(|b| b.status == OutgoingBatchStatus::Sending) {
                    let mut delivered = batch.clone();
                    delivered.status = OutgoingBatchStatus::Loading;
                    self.services
                        .outgoing_batches
                        .update_outgoing_batch(tx, &mut delivered)?;
                }
                self.services.acknowledge.ack_all(tx, &acks)
            })
        };
        match applied {
            Ok(changed) => {
                info!(
                    "Pushed {} batches to node {}, {} acknowledged",
                    batches.len(),
                    remote.node_id,
                    changed
                );
                status.update_outgoing_status(&batches, &acks);
                status.complete = true;
            }
            Err(e) => status.fail(&e),
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::Error;
    use crate::model::{NodeGroupLink, NodeGroupLinkAction, RemoteStatus};
    use crate::service::testing;
    use crate::transport::IncomingTransport;

    enum Answer {
        /// Ack every batch in the payload as loaded
        AckAll,
        /// Accept the payload without acks
        Silent,
        Offline,
    }

    struct Receiver {
        answer: Answer,
        payloads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TransportManager for Receiver {
        async fn pull(&self, _remote: &Node, _credentials: &Credentials) -> Result<Box<dyn IncomingTransport>> {
            Err(Error::Transport("not used".into()))
        }

        async fn push(&self, _remote: &Node, _credentials: &Credentials, payload: Bytes) -> Result<Vec<BatchAck>> {
            let text = String::from_utf8(payload.to_vec()).unwrap();
            self.payloads.lock().unwrap().push(text.clone());
            match self.answer {
                Answer::AckAll => Ok(text
                    .lines()
                    .filter_map(|line| line.strip_prefix("batch,"))
                    .map(|id| BatchAck::ok(id.parse().unwrap()))
                    .collect()),
                Answer::Silent => Ok(Vec::new()),
                Answer::Offline => Err(Error::ConnectionFailed {
                    url: "http://store".into(),
                    reason: "refused".into(),
                }),
            }
        }

        async fn send_acks(&self, _remote: &Node, _credentials: &Credentials, _acks: &[BatchAck]) -> Result<()> {
            Ok(())
        }
    }

    /// Corp pushing to its stores, with one captured row routed to both
    fn setup(answer: Answer) -> (PushService, Arc<Receiver>, i64) {
        let (conn, services) = testing::corp();
        let link = NodeGroupLink::new("corp", "store", NodeGroupLinkAction::Push);
        services.configuration.save_node_group_link(&conn, &link).unwrap();
        services.clear_caches();
        conn.execute("INSERT INTO item (id, name) VALUES (1, 'pen')", [])
            .unwrap();
        services.router.route_data(&conn).unwrap();
        let batch_id = services
            .outgoing_batches
            .get_outgoing_batches(&conn, "001")
            .unwrap()[0]
            .batch_id;

        let receiver = Arc::new(Receiver {
            answer,
            payloads: Mutex::new(Vec::new()),
        });
        let push = PushService::new(
            Arc::new(Database::from_connection(conn)),
            Arc::new(services),
            receiver.clone(),
        );
        (push, receiver, batch_id)
    }

    async fn batch_status(push: &PushService, batch_id: i64) -> OutgoingBatchStatus {
        let conn = push.database.lock().await;
        push.services
            .outgoing_batches
            .find_outgoing_batch(&conn, batch_id, Some("001"))
            .unwrap()
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn test_push_applies_acks() {
        let (push, receiver, batch_id) = setup(Answer::AckAll);
        let statuses = push.push_data().await.unwrap();

        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].node_id, "001");
        assert_eq!(statuses[0].status, RemoteStatus::DataProcessed);
        assert_eq!(statuses[0].batches_processed, 1);
        assert_eq!(receiver.payloads.lock().unwrap().len(), 2);
        assert_eq!(batch_status(&push, batch_id).await, OutgoingBatchStatus::Ok);
    }

    #[tokio::test]
    async fn test_unacked_batches_stay_loading() {
        let (push, receiver, batch_id) = setup(Answer::Silent);
        let remote = Node::new("001", "store", "001");
        let status = push.push_to_node(&remote, &Credentials::new("000", "")).await;

        assert!(status.complete);
        let payloads = receiver.payloads.lock().unwrap().clone();
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].starts_with("nodeid,000\n"));
        assert!(payloads[0].contains("insert,\"1\",\"pen\""));
        assert_eq!(batch_status(&push, batch_id).await, OutgoingBatchStatus::Loading);
    }

    #[tokio::test]
    async fn test_pushed_ignored_batch_stays_ignored() {
        let (push, receiver, batch_id) = setup(Answer::Silent);
        {
            let conn = push.database.lock().await;
            push.services
                .outgoing_batches
                .mark_batch(&conn, "001", batch_id, OutgoingBatchStatus::Ignored)
                .unwrap();
        }
        let remote = Node::new("001", "store", "001");
        push.push_to_node(&remote, &Credentials::new("000", "")).await;

        let payloads = receiver.payloads.lock().unwrap().clone();
        assert!(payloads[0].contains(&format!("batch,{0}\nignore\ncommit,{0}\n", batch_id)));
        assert_eq!(batch_status(&push, batch_id).await, OutgoingBatchStatus::Ignored);
    }

    #[tokio::test]
    async fn test_offline_remote_keeps_batches_sending() {
        let (push, _, batch_id) = setup(Answer::Offline);
        let remote = Node::new("001", "store", "001");
        let status = push.push_to_node(&remote, &Credentials::new("000", "")).await;

        assert_eq!(status.status, RemoteStatus::Offline);
        assert!(status.failed());
        assert_eq!(batch_status(&push, batch_id).await, OutgoingBatchStatus::Sending);
    }

    #[tokio::test]
    async fn test_nothing_to_push() {
        let (push, receiver, _) = setup(Answer::AckAll);
        let remote = Node::new("009", "store", "009");
        let status = push.push_to_node(&remote, &Credentials::new("000", "")).await;
        assert_eq!(status.status, RemoteStatus::NoData);
        assert!(receiver.payloads.lock().unwrap().is_empty());
    }
}
