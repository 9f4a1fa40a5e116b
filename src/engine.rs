//! Sync Engine
//!
//! Wires the database, services and transport of one node together, runs
//! the periodic jobs and serves the sync endpoints other nodes call.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use serde::Serialize;
use rusqlite::Connection;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::db::{in_transaction, Database};
use crate::error::{Error, Result};
use crate::model::{
    BatchAck, DataEventType, Node, NodeSecurity, OutgoingBatchStatus, RemoteNodeStatus,
    TriggerHistory, TriggerRouter,
};
use crate::service::{
    parameter, DataLoaderService, ParameterService, PullService, PushService, Services,
    SyncTriggersSummary,
};
use crate::transport::{Credentials, HttpTransportManager, SyncEndpoint, TransportManager};

/// Periodic work an engine runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    SyncTriggers,
    Route,
    Push,
    Pull,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Job::SyncTriggers => "sync triggers",
            Job::Route => "route",
            Job::Push => "push",
            Job::Pull => "pull",
        })
    }
}

/// Snapshot of a node for operators
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub engine_name: String,
    pub node: Option<Node>,
    pub outgoing_batches: HashMap<String, i64>,
    pub shutting_down: bool,
}

/// One node of the mesh
pub struct SyncEngine {
    config: SyncConfig,
    database: Arc<Database>,
    services: Arc<Services>,
    loader: Arc<DataLoaderService>,
    push: PushService,
    pull: PullService,
    shutdown: watch::Sender<bool>,
}

impl SyncEngine {
    /// Open the configured database and talk to peers over HTTP
    pub async fn open(config: SyncConfig) -> Result<Self> {
        let database = Arc::new(Database::open(&config.database.path, config.busy_timeout())?);
        let timeout = config
            .parameters
            .get(parameter::TRANSPORT_HTTP_TIMEOUT)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(90_000);
        let transport = Arc::new(HttpTransportManager::new(Duration::from_millis(timeout))?);
        Self::new(config, database, transport).await
    }

    /// Build an engine over an open database.
    ///
    /// Seeds sequences and channels, records this node's identity on first
    /// start and applies the peers and links from the configuration.
    pub async fn new(
        config: SyncConfig,
        database: Arc<Database>,
        transport: Arc<dyn TransportManager>,
    ) -> Result<Self> {
        config.validate()?;
        let parameters = Arc::new(ParameterService::new(
            config.node.external_id.clone(),
            config.node.group_id.clone(),
            config.parameters.clone(),
        ));
        let services = Arc::new(Services::new(parameters));

        {
            let conn = database.lock().await;
            services.init(&conn)?;
            in_transaction(&conn, |tx| bootstrap(tx, &services, &config))?;
        }

        let loader = Arc::new(DataLoaderService::new(
            database.clone(),
            services.clone(),
            transport.clone(),
        ));
        let push = PushService::new(database.clone(), services.clone(), transport);
        let pull = PullService::new(database.clone(), services.clone(), loader.clone());
        let (shutdown, _) = watch::channel(false);

        info!(
            "Engine {} ready as node {} in group {}",
            config.node.engine_name,
            config.node_id(),
            config.node.group_id
        );

        Ok(Self {
            config,
            database,
            services,
            loader,
            push,
            pull,
            shutdown,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Rebuild database triggers that are missing or out of date.
    ///
    /// Skipped when `auto.sync.triggers` is off unless `force` is set.
    pub async fn sync_triggers(&self, force: bool) -> Result<SyncTriggersSummary> {
        let conn = self.database.lock().await;
        self.services.parameters.refresh(&conn)?;
        if !force && !self.services.parameters.is(parameter::AUTO_SYNC_TRIGGERS, true) {
            debug!("Trigger sync skipped because {} is off", parameter::AUTO_SYNC_TRIGGERS);
            return Ok(SyncTriggersSummary::default());
        }
        self.services.clear_caches();
        self.services
            .trigger_routers
            .sync_triggers(&conn, &self.config.node.group_id, force)
    }

    /// Route captured data into outgoing batches
    pub async fn route(&self) -> Result<usize> {
        let conn = self.database.lock().await;
        let routed = self.services.router.route_data(&conn)?;
        self.services.nodes.update_heartbeat(&conn, self.config.node_id())?;
        Ok(routed)
    }

    pub async fn push(&self) -> Result<Vec<RemoteNodeStatus>> {
        self.push.push_data().await
    }

    pub async fn pull(&self) -> Result<Vec<RemoteNodeStatus>> {
        self.pull.pull_data().await
    }

    /// Queue a reload of the table behind `trigger_id` for one node,
    /// returning the batch ids created
    pub async fn reload_table(
        &self,
        node_id: &str,
        trigger_id: &str,
        where_clause: Option<&str>,
    ) -> Result<Vec<i64>> {
        let conn = self.database.lock().await;
        let services = &self.services;
        let (target, history, trigger_routers) = self.trigger_target(&conn, node_id, trigger_id)?;
        in_transaction(&conn, |tx| {
            trigger_routers
                .iter()
                .map(|tr| {
                    services
                        .data
                        .insert_reload_event(tx, &target, tr, &history, where_clause)
                })
                .collect()
        })
    }

    /// Queue a SQL statement to run on one node, on the channel of
    /// `trigger_id`. Returns the batch id.
    pub async fn send_sql(&self, node_id: &str, trigger_id: &str, sql: &str) -> Result<i64> {
        self.send_text(node_id, trigger_id, DataEventType::Sql, sql).await
    }

    /// Queue DDL to run on one node ahead of the data of `trigger_id`.
    /// Returns the batch id.
    pub async fn send_schema(&self, node_id: &str, trigger_id: &str, ddl: &str) -> Result<i64> {
        self.send_text(node_id, trigger_id, DataEventType::Create, ddl).await
    }

    async fn send_text(
        &self,
        node_id: &str,
        trigger_id: &str,
        event_type: DataEventType,
        text: &str,
    ) -> Result<i64> {
        if text.trim().is_empty() {
            return Err(Error::Config(format!("empty {} event for node {}", event_type, node_id)));
        }
        let conn = self.database.lock().await;
        let (target, history, trigger_routers) = self.trigger_target(&conn, node_id, trigger_id)?;
        let channel_id = trigger_routers[0].trigger.channel_id.clone();
        let data = &self.services.data;
        let batch_id = in_transaction(&conn, |tx| match event_type {
            DataEventType::Create => data.insert_create_event(tx, &target, &history, &channel_id, text),
            _ => data.insert_sql_event(tx, &target, &history, &channel_id, text),
        })?;
        info!(
            "Queued {} event for node {} in batch {}",
            event_type, node_id, batch_id
        );
        Ok(batch_id)
    }

    /// The node, newest trigger history and trigger routers reaching that
    /// node's group for an operator request
    fn trigger_target(
        &self,
        conn: &Connection,
        node_id: &str,
        trigger_id: &str,
    ) -> Result<(Node, TriggerHistory, Vec<TriggerRouter>)> {
        let services = &self.services;
        let target = services
            .nodes
            .find_node(conn, node_id)?
            .ok_or_else(|| Error::NotFound(format!("node {}", node_id)))?;
        let history = services
            .trigger_routers
            .get_newest_trigger_history(conn, trigger_id)?
            .ok_or_else(|| Error::NotFound(format!("active trigger history for {}", trigger_id)))?;
        let trigger_routers: Vec<_> = services
            .trigger_routers
            .get_trigger_routers_for_trigger(conn, trigger_id, &self.config.node.group_id)?
            .into_iter()
            .filter(|tr| tr.router.node_group_link.target_node_group_id == target.node_group_id)
            .collect();
        if trigger_routers.is_empty() {
            return Err(Error::NotFound(format!(
                "trigger {} routing to group {}",
                trigger_id, target.node_group_id
            )));
        }
        Ok((target, history, trigger_routers))
    }

    /// Force an outgoing batch to OK or IGNORED
    pub async fn mark_outgoing_batch(
        &self,
        node_id: &str,
        batch_id: i64,
        status: OutgoingBatchStatus,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::Config(format!(
                "batches can only be marked OK or IG, not {}",
                status
            )));
        }
        let conn = self.database.lock().await;
        self.services
            .outgoing_batches
            .mark_batch(&conn, node_id, batch_id, status)?;
        Ok(())
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let conn = self.database.lock().await;
        Ok(EngineStatus {
            engine_name: self.config.node.engine_name.clone(),
            node: self.services.nodes.find_identity(&conn)?,
            outgoing_batches: self.services.outgoing_batches.count_batches_by_status(&conn)?,
            shutting_down: self.is_shutting_down(),
        })
    }

    /// Run one job, logging instead of returning its failure
    pub async fn run_job(&self, job: Job) {
        let result = match job {
            Job::SyncTriggers => self.sync_triggers(false).await.map(|_| ()),
            Job::Route => self.route().await.map(|_| ()),
            Job::Push => self.push().await.map(log_statuses),
            Job::Pull => self.pull().await.map(log_statuses),
        };
        if let Err(e) = result {
            error!("The {} job failed: {}", job, e);
        }
    }

    /// Spawn the enabled jobs, each on its own interval
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let jobs = &self.config.jobs;
        let schedule = [
            (Job::SyncTriggers, jobs.sync_triggers_enabled, jobs.sync_triggers_period_ms),
            (Job::Route, jobs.route_enabled, jobs.route_period_ms),
            (Job::Push, jobs.push_enabled, jobs.push_period_ms),
            (Job::Pull, jobs.pull_enabled, jobs.pull_period_ms),
        ];
        let max_start_delay = self
            .services
            .parameters
            .get_long(parameter::JOB_RANDOM_MAX_START_TIME, 10_000)
            .max(0) as u64;

        schedule
            .into_iter()
            .filter(|(_, enabled, _)| *enabled)
            .map(|(job, _, period_ms)| {
                let start_delay = if max_start_delay > 0 {
                    rand::thread_rng().gen_range(0..=max_start_delay)
                } else {
                    0
                };
                self.spawn_job(
                    job,
                    Duration::from_millis(start_delay),
                    Duration::from_millis(period_ms.max(1)),
                )
            })
            .collect()
    }

    fn spawn_job(self: &Arc<Self>, job: Job, start_delay: Duration, period: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            info!(
                "Scheduling the {} job every {} ms after {} ms",
                job,
                period.as_millis(),
                start_delay.as_millis()
            );
            tokio::select! {
                _ = tokio::time::sleep(start_delay) => {}
                _ = shutdown.changed() => return,
            }

            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => engine.run_job(job).await,
                    _ = shutdown.changed() => break,
                }
            }
            debug!("The {} job stopped", job);
        })
    }

    /// Stop the jobs and refuse further sync requests
    pub fn shutdown(&self) {
        info!("Shutting down engine {}", self.config.node.engine_name);
        self.shutdown.send_replace(true);
    }

    /// Receiver that flips to true when the engine shuts down
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Check the caller's credentials and return its node
    async fn authorize(&self, credentials: &Credentials) -> Result<Node> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        let conn = self.database.lock().await;
        let nodes = &self.services.nodes;
        if !nodes.is_node_authorized(&conn, &credentials.node_id, &credentials.security_token)? {
            warn!("Rejected node {}: bad credentials", credentials.node_id);
            return Err(Error::AuthenticationFailed(format!("node {}", credentials.node_id)));
        }
        match nodes.find_node(&conn, &credentials.node_id)? {
            Some(node) if node.sync_enabled => Ok(node),
            Some(node) => Err(Error::SyncDisabled(format!("node {}", node.node_id))),
            None => Err(Error::AuthenticationFailed(format!(
                "unknown node {}",
                credentials.node_id
            ))),
        }
    }
}

#[async_trait]
impl SyncEndpoint for SyncEngine {
    fn node_id(&self) -> &str {
        self.config.node_id()
    }

    async fn handle_pull(&self, credentials: &Credentials) -> Result<Bytes> {
        let remote = self.authorize(credentials).await?;
        let conn = self.database.lock().await;
        let extracted = self.services.extractor.extract(&conn, &remote)?;
        Ok(Bytes::from(extracted.payload))
    }

    async fn handle_push(&self, credentials: &Credentials, payload: Bytes) -> Result<Vec<BatchAck>> {
        let remote = self.authorize(credentials).await?;
        debug!("Loading {} bytes pushed by node {}", payload.len(), remote.node_id);
        self.loader.load_payload(payload, self.config.node_id()).await
    }

    async fn handle_ack(&self, credentials: &Credentials, acks: Vec<BatchAck>) -> Result<()> {
        let remote = self.authorize(credentials).await?;
        let acks: Vec<BatchAck> = acks
            .into_iter()
            .map(|ack| BatchAck {
                node_id: Some(remote.node_id.clone()),
                ..ack
            })
            .collect();
        let conn = self.database.lock().await;
        let changed = in_transaction(&conn, |tx| self.services.acknowledge.ack_all(tx, &acks))?;
        debug!("Node {} acknowledged {} batches", remote.node_id, changed);
        Ok(())
    }
}

/// Record this node's identity on first start and apply configured peers
/// and links
fn bootstrap(conn: &Connection, services: &Services, config: &SyncConfig) -> Result<()> {
    let node_id = config.node_id();
    match services.nodes.find_identity(conn)? {
        Some(identity) if identity.node_id != node_id => {
            return Err(Error::Config(format!(
                "database belongs to node {}, configured node is {}",
                identity.node_id, node_id
            )));
        }
        Some(_) => {}
        None => {
            let mut node = Node::new(node_id, config.node.group_id.clone(), config.node.external_id.clone());
            node.sync_url = config.node.sync_url.clone();
            node.created_at_node_id = Some(node_id.to_string());
            services.nodes.save_identity(conn, &node)?;
            info!("Recorded identity of node {}", node_id);
        }
    }
    if let Some(password) = &config.node.node_password {
        services
            .nodes
            .save_node_security(conn, &NodeSecurity::new(node_id, password.clone()))?;
    }

    for peer in &config.peers {
        let external_id = peer.external_id.clone().unwrap_or_else(|| peer.node_id.clone());
        let mut node = Node::new(peer.node_id.clone(), peer.group_id.clone(), external_id);
        node.sync_url = peer.sync_url.clone();
        services.nodes.save_node(conn, &node)?;
        if let Some(password) = &peer.password {
            services
                .nodes
                .save_node_security(conn, &NodeSecurity::new(peer.node_id.clone(), password.clone()))?;
        }
    }
    for link in &config.links {
        services.configuration.save_node_group_link(conn, &link.to_link()?)?;
    }
    services.clear_caches();
    Ok(())
}

fn log_statuses(statuses: Vec<RemoteNodeStatus>) {
    for status in statuses.iter().filter(|s| s.batches_processed > 0) {
        info!(
            "Node {}: {:?}, {} batches, {} rows",
            status.node_id, status.status, status.batches_processed, status.data_processed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeGroupLink, NodeGroupLinkAction, RemoteStatus, Router, Trigger, TriggerRouter};
    use crate::transport::InternalTransportManager;

    fn config(node_id: &str, group: &str, extra: &str) -> SyncConfig {
        SyncConfig::from_str(&format!(
            r#"
[node]
group_id = "{group}"
external_id = "{node_id}"
registration_url = "internal://000"
node_password = "secret-{node_id}"

[database]
path = "unused.sqlite"

[parameters]
"job.random.max.start.time.ms" = "0"
{extra}
"#
        ))
        .unwrap()
    }

    async fn engine(config: SyncConfig, transport: &InternalTransportManager) -> Arc<SyncEngine> {
        let database = Arc::new(Database::open_in_memory().unwrap());
        database
            .lock()
            .await
            .execute_batch("CREATE TABLE item (id INTEGER PRIMARY KEY, name TEXT);")
            .unwrap();
        let engine = Arc::new(SyncEngine::new(config, database, Arc::new(transport.clone())).await.unwrap());
        let endpoint: Arc<dyn SyncEndpoint> = engine.clone();
        transport.register(&endpoint);
        engine
    }

    const CORP_PEERS: &str = r#"
[[peers]]
node_id = "001"
group_id = "store"
password = "secret-001"

[[links]]
source_group_id = "corp"
target_group_id = "store"
"#;

    async fn corp(transport: &InternalTransportManager) -> Arc<SyncEngine> {
        let corp = engine(config("000", "corp", CORP_PEERS), transport).await;
        {
            let conn = corp.database().lock().await;
            let link = NodeGroupLink::new("corp", "store", NodeGroupLinkAction::WaitForPull);
            corp.services()
                .trigger_routers
                .save_trigger_router(
                    &conn,
                    &TriggerRouter::new(
                        Trigger::new("item", "item", "default"),
                        Router::new("corp_2_store", link),
                    ),
                )
                .unwrap();
        }
        corp.sync_triggers(false).await.unwrap();
        corp
    }

    #[tokio::test]
    async fn test_bootstrap_records_identity_and_peers() {
        let transport = InternalTransportManager::new();
        let corp = corp(&transport).await;
        let conn = corp.database().lock().await;
        let (local, credentials) = corp.services().local_credentials(&conn).unwrap();
        assert_eq!(local.node_id, "000");
        assert_eq!(credentials.security_token, "secret-000");
        let store = corp.services().nodes.find_node(&conn, "001").unwrap().unwrap();
        assert_eq!(store.node_group_id, "store");
    }

    #[tokio::test]
    async fn test_identity_mismatch_is_rejected() {
        let database = Arc::new(Database::open_in_memory().unwrap());
        let transport: Arc<dyn TransportManager> = Arc::new(InternalTransportManager::new());
        SyncEngine::new(config("000", "corp", ""), database.clone(), transport.clone())
            .await
            .unwrap();
        let result = SyncEngine::new(config("001", "store", ""), database, transport).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_pull_requires_credentials() {
        let transport = InternalTransportManager::new();
        let corp = corp(&transport).await;

        let denied = corp.handle_pull(&Credentials::new("001", "wrong")).await;
        assert!(matches!(denied, Err(Error::AuthenticationFailed(_))));

        let unknown = corp.handle_pull(&Credentials::new("009", "x")).await;
        assert!(matches!(unknown, Err(Error::AuthenticationFailed(_))));

        {
            let conn = corp.database().lock().await;
            let mut store = corp.services().nodes.find_node(&conn, "001").unwrap().unwrap();
            store.sync_enabled = false;
            corp.services().nodes.save_node(&conn, &store).unwrap();
        }
        let disabled = corp.handle_pull(&Credentials::new("001", "secret-001")).await;
        assert!(matches!(disabled, Err(Error::SyncDisabled(_))));
    }

    #[tokio::test]
    async fn test_store_pulls_and_acks() {
        let transport = InternalTransportManager::new();
        let corp = corp(&transport).await;
        let store = engine(
            config(
                "001",
                "store",
                r#"
[[peers]]
node_id = "000"
group_id = "corp"

[[links]]
source_group_id = "corp"
target_group_id = "store"
"#,
            ),
            &transport,
        )
        .await;

        corp.database()
            .lock()
            .await
            .execute("INSERT INTO item (id, name) VALUES (7, 'lamp')", [])
            .unwrap();
        assert_eq!(corp.route().await.unwrap(), 1);

        let statuses = store.pull().await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, RemoteStatus::DataProcessed);

        let name: String = store
            .database()
            .lock()
            .await
            .query_row("SELECT name FROM item WHERE id = 7", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "lamp");

        let status = corp.status().await.unwrap();
        assert_eq!(status.outgoing_batches.get("OK"), Some(&1));
    }

    #[tokio::test]
    async fn test_reload_table_queues_batch() {
        let transport = InternalTransportManager::new();
        let corp = corp(&transport).await;

        let batch_ids = corp.reload_table("001", "item", Some("id > 5")).await.unwrap();
        assert_eq!(batch_ids.len(), 1);

        let missing = corp.reload_table("001", "nope", None).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
        let unknown_node = corp.reload_table("042", "item", None).await;
        assert!(matches!(unknown_node, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_sql_and_schema_events_reach_store() {
        let transport = InternalTransportManager::new();
        let corp = corp(&transport).await;
        let store = engine(
            config(
                "001",
                "store",
                r#"
[[peers]]
node_id = "000"
group_id = "corp"

[[links]]
source_group_id = "corp"
target_group_id = "store"
"#,
            ),
            &transport,
        )
        .await;

        let schema = corp
            .send_schema("001", "item", "CREATE TABLE extra (id INTEGER PRIMARY KEY)")
            .await
            .unwrap();
        let sql = corp
            .send_sql("001", "item", "INSERT INTO extra (id) VALUES (5)")
            .await
            .unwrap();
        assert!(schema < sql);
        let empty = corp.send_sql("001", "item", "  ").await;
        assert!(matches!(empty, Err(Error::Config(_))));
        let unknown = corp.send_sql("001", "nope", "SELECT 1").await;
        assert!(matches!(unknown, Err(Error::NotFound(_))));

        let statuses = store.pull().await.unwrap();
        assert_eq!(statuses[0].status, RemoteStatus::DataProcessed);
        let id: i64 = store
            .database()
            .lock()
            .await
            .query_row("SELECT id FROM extra", [], |row| row.get(0))
            .unwrap();
        assert_eq!(id, 5);
        let status = corp.status().await.unwrap();
        assert_eq!(status.outgoing_batches.get("OK"), Some(&2));
    }

    #[tokio::test]
    async fn test_mark_batch_rejects_non_terminal_status() {
        let transport = InternalTransportManager::new();
        let corp = corp(&transport).await;
        let result = corp
            .mark_outgoing_batch("001", 1, OutgoingBatchStatus::Sending)
            .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_jobs_stop_on_shutdown() {
        let transport = InternalTransportManager::new();
        let corp = corp(&transport).await;
        let handles = corp.start();
        assert_eq!(handles.len(), 4);

        corp.shutdown();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
        let refused = corp.handle_pull(&Credentials::new("001", "secret-001")).await;
        assert!(matches!(refused, Err(Error::ShuttingDown)));
    }
}
