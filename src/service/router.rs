//! Routing of captured data into outgoing batches
//!
//! Each enabled channel is routed in processing order. Unrouted data on the
//! channel is read oldest first, every applicable trigger router picks its
//! target nodes, and the assignments accumulate in a
//! [`ChannelRouterContext`] until a batch fills up or the channel runs dry.
//! A flush writes all accumulated batches and data events in one
//! transaction.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use rusqlite::Connection;
use tracing::{debug, error, info, warn};

use crate::db::in_transaction;
use crate::error::{Error, Result};
use crate::model::{
    elapsed_millis, Channel, Data, DataEventType, Node, OutgoingBatch, OutgoingBatchStatus, TriggerHistory,
    TriggerRouter, UNKNOWN_ROUTER_ID, UNROUTED_NODE_ID,
};
use crate::service::configuration::ConfigurationService;
use crate::service::data::DataService;
use crate::service::node::NodeService;
use crate::service::outgoing_batch::OutgoingBatchService;
use crate::service::parameter::{self, ParameterService};
use crate::service::trigger_router::TriggerRouterService;

/// A data row with the configuration it is being routed under
pub struct DataMetaData<'a> {
    pub data: &'a Data,
    pub history: Option<&'a TriggerHistory>,
    pub trigger_router: &'a TriggerRouter,
    pub channel: &'a Channel,
}

impl DataMetaData<'_> {
    /// Column values by name; old values carry an `OLD_` prefix
    pub fn data_map(&self) -> Result<HashMap<String, Option<String>>> {
        let mut map = HashMap::new();
        let history = match self.history {
            Some(history) => history,
            None => return Ok(map),
        };
        let columns = history.parsed_column_names();

        let row = match self.data.event_type {
            DataEventType::Delete => None,
            _ if self.channel.use_row_data_to_route => self.data.parsed_row_data()?,
            _ => None,
        };
        let old = if self.channel.use_old_data_to_route {
            self.data.parsed_old_data()?
        } else {
            None
        };

        let current = match self.data.event_type {
            DataEventType::Delete => old.as_ref(),
            _ => row.as_ref(),
        };
        if let Some(values) = current {
            for (column, value) in columns.iter().zip(values) {
                map.insert(column.clone(), value.clone());
            }
        } else if self.channel.use_pk_data_to_route {
            if let Some(values) = self.data.parsed_pk_data()? {
                for (column, value) in history.parsed_pk_column_names().iter().zip(values) {
                    map.insert(column.clone(), value);
                }
            }
        }

        if let Some(values) = old {
            for (column, value) in columns.iter().zip(values) {
                map.insert(format!("OLD_{}", column), value);
            }
        }
        Ok(map)
    }
}

/// Policy choosing which of a router's candidate nodes receive a data row
pub trait DataRouter: Send + Sync {
    fn route_to_nodes(
        &self,
        data: &DataMetaData<'_>,
        nodes: &[Node],
        local: &Node,
    ) -> Result<BTreeSet<String>>;
}

/// Sends every row to every enabled node of the target group
#[derive(Debug, Default)]
pub struct DefaultDataRouter;

impl DataRouter for DefaultDataRouter {
    fn route_to_nodes(
        &self,
        _data: &DataMetaData<'_>,
        nodes: &[Node],
        _local: &Node,
    ) -> Result<BTreeSet<String>> {
        Ok(nodes.iter().map(|n| n.node_id.clone()).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
}

impl Operator {
    /// Checked in this order so `!=` is not read as `=`
    const ALL: [(&'static str, Operator); 4] = [
        ("!=", Operator::NotEquals),
        ("=", Operator::Equals),
        ("not contains", Operator::NotContains),
        ("contains", Operator::Contains),
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Expression {
    column: String,
    operator: Operator,
    value: String,
}

impl Expression {
    fn matches(&self, column_value: Option<&str>, compare: Option<&str>) -> bool {
        match self.operator {
            Operator::Equals => column_value == compare,
            Operator::NotEquals => column_value != compare,
            Operator::Contains => match (column_value, compare) {
                (Some(list), Some(value)) => list.split(',').any(|v| v == value),
                _ => false,
            },
            Operator::NotContains => match (column_value, compare) {
                (Some(list), Some(value)) => !list.split(',').any(|v| v == value),
                _ => false,
            },
        }
    }
}

/// Routes on column values, e.g. `region=:EXTERNAL_ID` or `STATUS != 'X'`.
///
/// Expressions are separated by newlines or `or`; a row goes to the union of
/// the nodes each expression selects.
#[derive(Debug, Default)]
pub struct ColumnMatchDataRouter {
    expressions: RwLock<HashMap<String, Arc<Vec<Expression>>>>,
}

impl ColumnMatchDataRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn expressions(&self, text: &str) -> Result<Arc<Vec<Expression>>> {
        if let Ok(cache) = self.expressions.read() {
            if let Some(parsed) = cache.get(text) {
                return Ok(parsed.clone());
            }
        }
        let parsed = Arc::new(parse_expressions(text)?);
        if let Ok(mut cache) = self.expressions.write() {
            cache.insert(text.to_string(), parsed.clone());
        }
        Ok(parsed)
    }
}

fn parse_expressions(text: &str) -> Result<Vec<Expression>> {
    let mut expressions = Vec::new();
    for line in text.lines() {
        let mut line = line.trim();
        for prefix in ["or ", "OR "] {
            line = line.strip_prefix(prefix).unwrap_or(line);
        }
        for suffix in [" or", " OR"] {
            line = line.strip_suffix(suffix).unwrap_or(line);
        }
        for term in line.split(" or ").flat_map(|t| t.split(" OR ")) {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            expressions.push(parse_term(term).ok_or_else(|| {
                Error::Config(format!(
                    "invalid column match expression '{}' in '{}'",
                    term, text
                ))
            })?);
        }
    }
    if expressions.is_empty() {
        warn!("The column match expression is empty");
    }
    Ok(expressions)
}

fn parse_term(term: &str) -> Option<Expression> {
    for (token, operator) in Operator::ALL {
        if term.matches(token).count() != 1 {
            continue;
        }
        let (column, value) = term.split_once(token)?;
        let column = column.trim();
        let value = value.trim();
        if column.is_empty() || value.is_empty() {
            return None;
        }
        return Some(Expression {
            column: column.to_string(),
            operator,
            value: unquote(value),
        });
    }
    None
}

fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        value[1..value.len() - 1].replace("''", "'")
    } else {
        value.to_string()
    }
}

impl DataRouter for ColumnMatchDataRouter {
    fn route_to_nodes(
        &self,
        data: &DataMetaData<'_>,
        nodes: &[Node],
        _local: &Node,
    ) -> Result<BTreeSet<String>> {
        let text = data
            .trigger_router
            .router
            .router_expression
            .as_deref()
            .unwrap_or("");
        let expressions = self.expressions(text)?;
        let values = data.data_map()?;
        let mut node_ids = BTreeSet::new();
        if values.is_empty() {
            warn!("There were no columns to match for data {}", data.data.data_id);
            return Ok(node_ids);
        }

        for e in expressions.iter() {
            let column_value = values.get(&e.column).and_then(|v| v.as_deref());
            let per_node: Option<fn(&Node) -> &str> = match e.value.to_uppercase().as_str() {
                ":NODE_ID" => Some(|n| n.node_id.as_str()),
                ":EXTERNAL_ID" => Some(|n| n.external_id.as_str()),
                ":NODE_GROUP_ID" => Some(|n| n.node_group_id.as_str()),
                _ => None,
            };

            if let Some(node_value) = per_node {
                for node in nodes {
                    if e.matches(column_value, Some(node_value(node))) {
                        node_ids.insert(node.node_id.clone());
                    }
                }
                continue;
            }

            let compare = if e.value == "NULL" {
                None
            } else if let Some(column) = e.value.strip_prefix(':') {
                values.get(column).and_then(|v| v.as_deref())
            } else {
                Some(e.value.as_str())
            };
            if e.matches(column_value, compare) {
                node_ids.extend(nodes.iter().map(|n| n.node_id.clone()));
            }
        }
        Ok(node_ids)
    }
}

#[derive(Debug, Clone)]
struct PendingDataEvent {
    data_id: i64,
    node_id: String,
    router_id: String,
}

/// Routing state of one channel that has not been committed yet
pub struct ChannelRouterContext {
    channel: Channel,
    batches: BTreeMap<String, OutgoingBatch>,
    pending: Vec<PendingDataEvent>,
    routed: HashSet<(i64, String)>,
    nodes_by_group: HashMap<String, Vec<Node>>,
    warned_router_types: HashSet<String>,
    needs_commit: bool,
    data_events_committed: usize,
    started: Instant,
}

impl ChannelRouterContext {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            batches: BTreeMap::new(),
            pending: Vec::new(),
            routed: HashSet::new(),
            nodes_by_group: HashMap::new(),
            warned_router_types: HashSet::new(),
            needs_commit: false,
            data_events_committed: 0,
            started: Instant::now(),
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Queue a data row for a node. A row joins a node's batch at most once.
    pub fn add_data_event(&mut self, data: &Data, node_id: &str, router_id: &str) -> bool {
        if !self.routed.insert((data.data_id, node_id.to_string())) {
            return false;
        }
        let channel_id = self.channel.channel_id.clone();
        let batch = self
            .batches
            .entry(node_id.to_string())
            .or_insert_with(|| OutgoingBatch::new(node_id, channel_id, OutgoingBatchStatus::Routing));
        batch.increment_event_count(data.event_type);
        let full = self.channel.max_batch_size > 0
            && batch.data_event_count >= i64::from(self.channel.max_batch_size);
        self.pending.push(PendingDataEvent {
            data_id: data.data_id,
            node_id: node_id.to_string(),
            router_id: router_id.to_string(),
        });
        if full {
            self.needs_commit = true;
        }
        true
    }

    /// Set once a batch reached the channel's max batch size
    pub fn needs_commit(&self) -> bool {
        self.needs_commit
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Data events committed so far
    pub fn data_events_committed(&self) -> usize {
        self.data_events_committed
    }

    fn reset(&mut self) {
        self.batches.clear();
        self.pending.clear();
        self.routed.clear();
        self.needs_commit = false;
        self.started = Instant::now();
    }
}

pub struct RouterService {
    parameters: Arc<ParameterService>,
    configuration: Arc<ConfigurationService>,
    nodes: Arc<NodeService>,
    trigger_routers: Arc<TriggerRouterService>,
    data: Arc<DataService>,
    outgoing_batches: Arc<OutgoingBatchService>,
    routers: HashMap<&'static str, Box<dyn DataRouter>>,
}

impl RouterService {
    pub fn new(
        parameters: Arc<ParameterService>,
        configuration: Arc<ConfigurationService>,
        nodes: Arc<NodeService>,
        trigger_routers: Arc<TriggerRouterService>,
        data: Arc<DataService>,
        outgoing_batches: Arc<OutgoingBatchService>,
    ) -> Self {
        let mut routers: HashMap<&'static str, Box<dyn DataRouter>> = HashMap::new();
        routers.insert("default", Box::new(DefaultDataRouter));
        routers.insert("column", Box::new(ColumnMatchDataRouter::new()));
        Self {
            parameters,
            configuration,
            nodes,
            trigger_routers,
            data,
            outgoing_batches,
            routers,
        }
    }

    /// Register an additional router type
    pub fn add_data_router(&mut self, router_type: &'static str, router: Box<dyn DataRouter>) {
        self.routers.insert(router_type, router);
    }

    /// Route every enabled channel. A failing channel is logged and skipped.
    pub fn route_data(&self, conn: &Connection) -> Result<usize> {
        let local = match self.nodes.find_identity(conn)? {
            Some(local) => local,
            None => {
                debug!("Skipping routing because this node has no identity yet");
                return Ok(0);
            }
        };

        let started = Instant::now();
        let mut total = 0;
        for channel in self.configuration.get_ordered_channels(conn)? {
            if !channel.enabled {
                continue;
            }
            match self.route_channel(conn, &channel, &local) {
                Ok(count) => total += count,
                Err(e) => error!("Failed to route channel {}: {}", channel.channel_id, e),
            }
        }
        if total > 0 {
            info!(
                "Routed {} data events in {} ms",
                total,
                started.elapsed().as_millis()
            );
        }
        Ok(total)
    }

    /// Route the unrouted data of one channel, returning the data events written
    pub fn route_channel(&self, conn: &Connection, channel: &Channel, local: &Node) -> Result<usize> {
        let limit = if channel.max_data_to_route > 0 {
            i64::from(channel.max_data_to_route)
        } else {
            self.parameters
                .get_long(parameter::ROUTING_MAX_DATA_TO_ROUTE, 100_000)
        };
        let data = self.data.select_unrouted_data(conn, &channel.channel_id, limit)?;
        if data.is_empty() {
            return Ok(0);
        }

        let mut context = ChannelRouterContext::new(channel.clone());
        for row in &data {
            self.route_row(conn, &mut context, row, local)?;
            if context.needs_commit() {
                self.flush(conn, &mut context)?;
            }
        }
        self.flush(conn, &mut context)?;
        debug!(
            "Routed {} data rows on channel {} into {} data events",
            data.len(),
            channel.channel_id,
            context.data_events_committed()
        );
        Ok(context.data_events_committed())
    }

    fn route_row(
        &self,
        conn: &Connection,
        context: &mut ChannelRouterContext,
        data: &Data,
        local: &Node,
    ) -> Result<()> {
        let history = self.trigger_routers.get_trigger_history(conn, data.trigger_hist_id)?;
        let trigger_routers = match &history {
            Some(history) => {
                let found = self.trigger_routers.get_trigger_routers_for_trigger(
                    conn,
                    &history.trigger_id,
                    &local.node_group_id,
                )?;
                if found.is_empty() {
                    warn!(
                        "Could not find trigger routers for trigger {}, data {} is unrouted",
                        history.trigger_id, data.data_id
                    );
                }
                found
            }
            None => {
                warn!(
                    "Could not find trigger history {} for data {}",
                    data.trigger_hist_id, data.data_id
                );
                Vec::new()
            }
        };

        let mut routed = false;
        for trigger_router in &trigger_routers {
            if !trigger_router.router.syncs(data.event_type) {
                continue;
            }
            let nodes = self.nodes_for_group(
                conn,
                context,
                &trigger_router.router.node_group_link.target_node_group_id,
            )?;
            let router = self.data_router(context, trigger_router.router.router_type());
            let metadata = DataMetaData {
                data,
                history: history.as_ref(),
                trigger_router,
                channel: context.channel(),
            };
            let mut targets = router.route_to_nodes(&metadata, &nodes, local)?;

            targets.remove(&local.node_id);
            if !trigger_router.ping_back_enabled {
                if let Some(source) = data.source_node_id.as_deref() {
                    targets.remove(source);
                }
            }
            for node_id in targets {
                if context.add_data_event(data, &node_id, &trigger_router.router.router_id) {
                    routed = true;
                }
            }
        }

        if !routed {
            context.add_data_event(data, UNROUTED_NODE_ID, UNKNOWN_ROUTER_ID);
        }
        Ok(())
    }

    fn nodes_for_group(
        &self,
        conn: &Connection,
        context: &mut ChannelRouterContext,
        node_group_id: &str,
    ) -> Result<Vec<Node>> {
        if let Some(nodes) = context.nodes_by_group.get(node_group_id) {
            return Ok(nodes.clone());
        }
        let nodes = self.nodes.find_enabled_nodes_from_node_group(conn, node_group_id)?;
        context
            .nodes_by_group
            .insert(node_group_id.to_string(), nodes.clone());
        Ok(nodes)
    }

    fn data_router(&self, context: &mut ChannelRouterContext, router_type: &str) -> &dyn DataRouter {
        if let Some(router) = self.routers.get(router_type) {
            return router.as_ref();
        }
        if context.warned_router_types.insert(router_type.to_string()) {
            warn!(
                "Unknown router type '{}', using the default router",
                router_type
            );
        }
        &DefaultDataRouter
    }

    /// Write the accumulated batches and data events in one transaction
    fn flush(&self, conn: &Connection, context: &mut ChannelRouterContext) -> Result<()> {
        if context.is_empty() {
            return Ok(());
        }
        let router_millis = elapsed_millis(context.started);
        let batches = &mut context.batches;
        let pending = &context.pending;

        in_transaction(conn, |tx| {
            for batch in batches.values_mut() {
                self.outgoing_batches.insert_outgoing_batch(tx, batch)?;
            }
            for event in pending {
                let batch_id = batches
                    .get(&event.node_id)
                    .map(|b| b.batch_id)
                    .ok_or_else(|| Error::Internal(format!("no batch for node {}", event.node_id)))?;
                self.data
                    .insert_data_event(tx, event.data_id, batch_id, &event.router_id)?;
            }
            for batch in batches.values_mut() {
                batch.status = if batch.node_id == UNROUTED_NODE_ID {
                    OutgoingBatchStatus::Ok
                } else {
                    OutgoingBatchStatus::New
                };
                batch.router_millis = router_millis;
                self.outgoing_batches.update_outgoing_batch(tx, batch)?;
            }
            Ok(())
        })?;

        for batch in context.batches.values() {
            debug!(
                "Committed batch {} with {} data events",
                batch.node_batch_id(),
                batch.data_event_count
            );
        }
        context.data_events_committed += context.pending.len();
        context.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::create_sym_tables;
    use crate::db::{Platform, SqliteDialect};
    use crate::model::{
        Column, NodeGroupLink, NodeGroupLinkAction, Router, Table, Trigger, TriggerReBuildReason,
    };
    use crate::service::sequence::SequenceService;

    struct Fixture {
        conn: Connection,
        configuration: Arc<ConfigurationService>,
        trigger_routers: Arc<TriggerRouterService>,
        data: Arc<DataService>,
        outgoing: Arc<OutgoingBatchService>,
        router: RouterService,
    }

    fn setup(router: Router) -> Fixture {
        let conn = Connection::open_in_memory().unwrap();
        create_sym_tables(&conn).unwrap();
        conn.execute_batch("CREATE TABLE item (id INTEGER PRIMARY KEY, name TEXT, region TEXT);")
            .unwrap();

        let parameters = Arc::new(ParameterService::new("000", "corp", HashMap::new()));
        let configuration = Arc::new(ConfigurationService::new());
        configuration.ensure_default_channels(&conn).unwrap();
        let nodes = Arc::new(NodeService::new());
        nodes.save_identity(&conn, &Node::new("000", "corp", "000")).unwrap();
        nodes.save_node(&conn, &Node::new("001", "store", "east")).unwrap();
        nodes.save_node(&conn, &Node::new("002", "store", "west")).unwrap();

        let sequences = Arc::new(SequenceService::new());
        sequences.init(&conn).unwrap();
        let outgoing = Arc::new(OutgoingBatchService::new(sequences, configuration.clone()));
        let data = Arc::new(DataService::new(outgoing.clone()));
        let trigger_routers = Arc::new(TriggerRouterService::new(
            parameters.clone(),
            configuration.clone(),
            Arc::new(Platform::new()),
            Arc::new(SqliteDialect::new()),
        ));
        configuration
            .save_node_group_link(&conn, &router.node_group_link)
            .unwrap();
        trigger_routers
            .save_trigger_router(&conn, &TriggerRouter::new(Trigger::new("item", "item", "default"), router))
            .unwrap();
        trigger_routers.sync_triggers(&conn, "corp", false).unwrap();

        let router = RouterService::new(
            parameters,
            configuration.clone(),
            nodes,
            trigger_routers.clone(),
            data.clone(),
            outgoing.clone(),
        );
        Fixture {
            conn,
            configuration,
            trigger_routers,
            data,
            outgoing,
            router,
        }
    }

    fn corp_to_store() -> Router {
        Router::new(
            "corp_2_store",
            NodeGroupLink::new("corp", "store", NodeGroupLinkAction::WaitForPull),
        )
    }

    fn batches_for(f: &Fixture, node_id: &str) -> Vec<OutgoingBatch> {
        f.outgoing.get_outgoing_batches(&f.conn, node_id).unwrap()
    }

    fn unrouted_count(f: &Fixture) -> usize {
        f.data.select_unrouted_data(&f.conn, "default", 1000).unwrap().len()
    }

    #[test]
    fn test_default_router_batches_per_node() {
        let f = setup(corp_to_store());
        f.conn
            .execute_batch(
                "INSERT INTO item VALUES (1, 'a', 'east');
                 INSERT INTO item VALUES (2, 'b', 'west');
                 UPDATE item SET name = 'c' WHERE id = 1;",
            )
            .unwrap();

        let routed = f.router.route_data(&f.conn).unwrap();
        assert_eq!(routed, 6);
        assert_eq!(unrouted_count(&f), 0);

        for node_id in ["001", "002"] {
            let batches = batches_for(&f, node_id);
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0].status, OutgoingBatchStatus::New);
            assert_eq!(batches[0].insert_event_count, 2);
            assert_eq!(batches[0].update_event_count, 1);
            assert_eq!(
                f.data.select_data_ids_for_batch(&f.conn, batches[0].batch_id).unwrap().len(),
                3
            );
        }
        assert_eq!(f.router.route_data(&f.conn).unwrap(), 0);
    }

    #[test]
    fn test_max_batch_size_splits_batches() {
        let f = setup(corp_to_store());
        let channel = Channel::new("default", 99999).with_max_batch_size(2);
        f.configuration.save_channel(&f.conn, &channel).unwrap();
        for id in 1..=5 {
            f.conn
                .execute("INSERT INTO item VALUES (?1, 'x', 'east')", [id])
                .unwrap();
        }
        f.router.route_data(&f.conn).unwrap();

        let sizes: Vec<i64> = batches_for(&f, "001")
            .iter()
            .map(|b| b.data_event_count)
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(sizes.iter().all(|s| *s <= 2));
    }

    #[test]
    fn test_channel_batches_fill_in_data_id_order() {
        let mut router = corp_to_store();
        router.router_type = Some("column".into());
        router.router_expression = Some("region=:EXTERNAL_ID".into());
        let f = setup(router);
        let channel = Channel::new("sales", 10).with_max_batch_size(2);
        f.configuration.save_channel(&f.conn, &channel).unwrap();
        let history = f
            .trigger_routers
            .get_newest_trigger_history(&f.conn, "item")
            .unwrap()
            .unwrap();
        for id in [10, 11, 12] {
            f.conn
                .execute(
                    "INSERT INTO sym_data (data_id, table_name, event_type, row_data, trigger_hist_id, channel_id)
                     VALUES (?1, 'item', 'I', ?2, ?3, 'sales')",
                    rusqlite::params![id, format!("\"{}\",\"x\",\"west\"", id), history.trigger_hist_id],
                )
                .unwrap();
        }

        assert_eq!(f.router.route_data(&f.conn).unwrap(), 3);
        assert!(batches_for(&f, "001").is_empty());
        let batches = batches_for(&f, "002");
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.status == OutgoingBatchStatus::New && b.channel_id == "sales"));
        let ids: Vec<Vec<i64>> = batches
            .iter()
            .map(|b| f.data.select_data_ids_for_batch(&f.conn, b.batch_id).unwrap())
            .collect();
        assert_eq!(ids, vec![vec![10, 11], vec![12]]);
        assert_eq!(batches[0].data_event_count, 2);
        assert_eq!(batches[1].data_event_count, 1);
    }

    #[test]
    fn test_failed_flush_leaves_nothing_behind() {
        let f = setup(corp_to_store());
        f.conn
            .execute_batch(
                "INSERT INTO item VALUES (1, 'a', 'east');
                 INSERT INTO item VALUES (2, 'b', 'west');
                 CREATE TRIGGER reject_event BEFORE INSERT ON sym_data_event
                 WHEN NEW.data_id = (SELECT MAX(data_id) FROM sym_data) BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();
        let count = |sql: &str| -> i64 { f.conn.query_row(sql, [], |row| row.get(0)).unwrap() };
        let data_before = count("SELECT COUNT(*) FROM sym_data");

        let channel = Channel::new("default", 99999);
        let local = Node::new("000", "corp", "000");
        assert!(f.router.route_channel(&f.conn, &channel, &local).is_err());

        assert_eq!(count("SELECT COUNT(*) FROM sym_outgoing_batch"), 0);
        assert_eq!(count("SELECT COUNT(*) FROM sym_outgoing_batch WHERE status = 'RT'"), 0);
        assert_eq!(count("SELECT COUNT(*) FROM sym_data_event"), 0);
        assert_eq!(count("SELECT COUNT(*) FROM sym_data"), data_before);
        assert_eq!(unrouted_count(&f), 2);

        f.conn.execute_batch("DROP TRIGGER reject_event;").unwrap();
        assert_eq!(f.router.route_channel(&f.conn, &channel, &local).unwrap(), 4);
        assert_eq!(unrouted_count(&f), 0);
    }

    #[test]
    fn test_column_router_matches_external_id() {
        let mut router = corp_to_store();
        router.router_type = Some("column".into());
        router.router_expression = Some("region=:EXTERNAL_ID".into());
        let f = setup(router);
        f.conn
            .execute_batch("INSERT INTO item VALUES (1, 'a', 'east'); INSERT INTO item VALUES (2, 'b', 'north');")
            .unwrap();
        f.router.route_data(&f.conn).unwrap();

        assert_eq!(batches_for(&f, "001").len(), 1);
        assert_eq!(batches_for(&f, "001")[0].data_event_count, 1);
        assert!(batches_for(&f, "002").is_empty());

        let unrouted = f
            .outgoing
            .find_outgoing_batches_by_status(&f.conn, Some(OutgoingBatchStatus::Ok), 10)
            .unwrap();
        assert_eq!(unrouted.len(), 1);
        assert_eq!(unrouted[0].node_id, UNROUTED_NODE_ID);
        assert_eq!(unrouted[0].data_event_count, 1);
    }

    #[test]
    fn test_source_node_is_not_routed_back() {
        let f = setup(corp_to_store());
        let history = f
            .trigger_routers
            .get_newest_trigger_history(&f.conn, "item")
            .unwrap()
            .unwrap();
        let mut data = Data::new("item", DataEventType::Insert, history.trigger_hist_id, "default");
        data.row_data = Some("\"9\",\"z\",\"east\"".into());
        data.source_node_id = Some("001".into());
        f.data.insert_data(&f.conn, &mut data).unwrap();

        f.router.route_data(&f.conn).unwrap();
        assert!(batches_for(&f, "001").is_empty());
        assert_eq!(batches_for(&f, "002").len(), 1);
    }

    #[test]
    fn test_router_event_flags_and_missing_history() {
        let mut router = corp_to_store();
        router.sync_on_delete = false;
        let f = setup(router);
        f.conn
            .execute_batch("INSERT INTO item VALUES (1, 'a', 'east'); DELETE FROM item WHERE id = 1;")
            .unwrap();
        let mut orphan = Data::new("item", DataEventType::Insert, 4242, "default");
        f.data.insert_data(&f.conn, &mut orphan).unwrap();

        f.router.route_data(&f.conn).unwrap();
        assert_eq!(unrouted_count(&f), 0);
        let batch = &batches_for(&f, "001")[0];
        assert_eq!(batch.insert_event_count, 1);
        assert_eq!(batch.delete_event_count, 0);

        let unrouted = f
            .outgoing
            .find_outgoing_batches_by_status(&f.conn, Some(OutgoingBatchStatus::Ok), 10)
            .unwrap();
        assert_eq!(unrouted[0].data_event_count, 2);
    }

    #[test]
    fn test_disabled_channel_is_not_routed() {
        let f = setup(corp_to_store());
        let mut channel = Channel::new("default", 99999);
        channel.enabled = false;
        f.configuration.save_channel(&f.conn, &channel).unwrap();
        f.conn.execute_batch("INSERT INTO item VALUES (1, 'a', 'east');").unwrap();
        assert_eq!(f.router.route_data(&f.conn).unwrap(), 0);
        assert_eq!(unrouted_count(&f), 1);
    }

    fn metadata_fixture() -> (TriggerRouter, TriggerHistory, Channel, Vec<Node>) {
        let table = Table::new("item").with_columns(vec![
            Column::new("id", "INTEGER").primary_key(),
            Column::new("status", "TEXT"),
            Column::new("tags", "TEXT"),
        ]);
        let mut router = corp_to_store();
        router.router_type = Some("column".into());
        let trigger_router = TriggerRouter::new(Trigger::new("item", "item", "default"), router);
        let history = TriggerHistory::new(&trigger_router.trigger, &table, 0, TriggerReBuildReason::New);
        let nodes = vec![Node::new("001", "store", "east"), Node::new("002", "store", "west")];
        (trigger_router, history, Channel::new("default", 1), nodes)
    }

    fn column_route(expression: &str, data: &Data) -> Vec<String> {
        let (mut trigger_router, history, channel, nodes) = metadata_fixture();
        trigger_router.router.router_expression = Some(expression.to_string());
        let metadata = DataMetaData {
            data,
            history: Some(&history),
            trigger_router: &trigger_router,
            channel: &channel,
        };
        ColumnMatchDataRouter::new()
            .route_to_nodes(&metadata, &nodes, &Node::new("000", "corp", "000"))
            .unwrap()
            .into_iter()
            .collect()
    }

    fn item(row: &str, old: Option<&str>) -> Data {
        let mut data = Data::new("item", DataEventType::Update, 1, "default");
        data.row_data = Some(row.to_string());
        data.old_data = old.map(str::to_string);
        data
    }

    #[test]
    fn test_column_expressions() {
        let data = item("\"1\",\"OPEN\",\"a,b\"", Some("\"1\",\"NEW\","));
        assert_eq!(column_route("status=OPEN", &data), vec!["001", "002"]);
        assert_eq!(column_route("status = 'CLOSED'", &data), Vec::<String>::new());
        assert_eq!(column_route("status!=CLOSED", &data), vec!["001", "002"]);
        assert_eq!(column_route("tags contains b", &data), vec!["001", "002"]);
        assert_eq!(column_route("tags not contains b", &data), Vec::<String>::new());
        assert_eq!(column_route("OLD_status=NEW", &data), vec!["001", "002"]);
        assert_eq!(column_route("OLD_tags=NULL", &data), vec!["001", "002"]);
        assert_eq!(column_route("id=:NODE_ID", &data), Vec::<String>::new());
        assert_eq!(column_route("status=:OLD_status", &data), Vec::<String>::new());

        let data = item("\"002\",\"OPEN\",\"\"", None);
        assert_eq!(column_route("id=:NODE_ID", &data), vec!["002"]);
        assert_eq!(
            column_route("status=CLOSED or id=:NODE_ID\nid=001", &data),
            vec!["002"]
        );
    }

    #[test]
    fn test_invalid_expression_is_rejected() {
        assert!(parse_expressions("status").is_err());
        assert_eq!(parse_expressions("a=1\nOR b=2 or c != 3").unwrap().len(), 3);
        assert_eq!(unquote("'it''s'"), "it's");
    }
}
