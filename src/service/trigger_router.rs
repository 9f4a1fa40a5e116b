//! Trigger and router configuration, trigger history and trigger sync

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::db::{in_transaction, Dialect, Platform};
use crate::error::Result;
use crate::model::{
    now_timestamp, Channel, DataEventType, NodeGroupLink, NodeGroupLinkAction, Router, Table,
    Trigger, TriggerHistory, TriggerReBuildReason, TriggerRouter,
};
use crate::service::configuration::ConfigurationService;
use crate::service::parameter::{self, ParameterService};

const DML_EVENTS: [DataEventType; 3] = [
    DataEventType::Insert,
    DataEventType::Update,
    DataEventType::Delete,
];

const SELECT_TRIGGER_ROUTERS: &str = r#"
    SELECT t.trigger_id, t.source_catalog_name, t.source_schema_name, t.source_table_name,
           t.channel_id, t.reload_channel_id, t.sync_on_update, t.sync_on_insert,
           t.sync_on_delete, t.sync_on_incoming_batch, t.name_for_update_trigger,
           t.name_for_insert_trigger, t.name_for_delete_trigger, t.sync_on_update_condition,
           t.sync_on_insert_condition, t.sync_on_delete_condition, t.custom_on_update_text,
           t.custom_on_insert_text, t.custom_on_delete_text, t.external_select,
           t.tx_id_expression, t.channel_expression, t.excluded_column_names, t.sync_key_names,
           t.use_capture_old_data, t.use_capture_lobs, t.use_stream_lobs,
           t.use_handle_key_updates, t.create_time, t.last_update_time,
           r.router_id, r.target_catalog_name, r.target_schema_name, r.target_table_name,
           r.source_node_group_id, r.target_node_group_id, r.router_type, r.router_expression,
           r.sync_on_update, r.sync_on_insert, r.sync_on_delete, r.use_source_catalog_schema,
           tr.enabled, tr.initial_load_order, tr.initial_load_select, tr.ping_back_enabled,
           l.data_event_action, l.sync_config_enabled
    FROM sym_trigger_router tr
    INNER JOIN sym_trigger t ON tr.trigger_id = t.trigger_id
    INNER JOIN sym_router r ON tr.router_id = r.router_id
    LEFT JOIN sym_node_group_link l ON l.source_node_group_id = r.source_node_group_id
        AND l.target_node_group_id = r.target_node_group_id
    ORDER BY tr.initial_load_order, t.trigger_id, r.router_id
"#;

const SELECT_TRIGGER_HIST: &str = r#"
    SELECT trigger_hist_id, trigger_id, source_table_name, source_catalog_name,
           source_schema_name, name_for_insert_trigger, name_for_update_trigger,
           name_for_delete_trigger, table_hash, trigger_row_hash, trigger_template_hash,
           column_names, pk_column_names, last_trigger_build_reason, error_message,
           create_time, inactive_time
    FROM sym_trigger_hist
"#;

/// Outcome of one trigger sync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncTriggersSummary {
    /// Triggers whose database triggers were (re)built
    pub rebuilt: usize,
    /// Database triggers recreated for an unchanged history
    pub repaired: usize,
    /// Histories inactivated because their trigger was removed
    pub removed: usize,
    pub failed: usize,
}

struct CachedTriggerRouters {
    loaded_at: Instant,
    trigger_routers: Vec<TriggerRouter>,
}

pub struct TriggerRouterService {
    parameters: Arc<ParameterService>,
    configuration: Arc<ConfigurationService>,
    platform: Arc<Platform>,
    dialect: Arc<dyn Dialect>,
    trigger_routers: RwLock<Option<CachedTriggerRouters>>,
    histories: RwLock<HashMap<i64, TriggerHistory>>,
}

impl TriggerRouterService {
    pub fn new(
        parameters: Arc<ParameterService>,
        configuration: Arc<ConfigurationService>,
        platform: Arc<Platform>,
        dialect: Arc<dyn Dialect>,
    ) -> Self {
        Self {
            parameters,
            configuration,
            platform,
            dialect,
            trigger_routers: RwLock::new(None),
            histories: RwLock::new(HashMap::new()),
        }
    }

    /// Every configured trigger router, cached for `cache.trigger.router.time.ms`
    pub fn get_trigger_routers(&self, conn: &Connection, refresh: bool) -> Result<Vec<TriggerRouter>> {
        let timeout = Duration::from_millis(
            self.parameters
                .get_long(parameter::CACHE_TRIGGER_ROUTER_TIME, 600_000)
                .max(0) as u64,
        );
        if !refresh {
            if let Ok(cached) = self.trigger_routers.read() {
                if let Some(cached) = cached.as_ref() {
                    if cached.loaded_at.elapsed() < timeout {
                        return Ok(cached.trigger_routers.clone());
                    }
                }
            }
        }

        let mut stmt = conn.prepare_cached(SELECT_TRIGGER_ROUTERS)?;
        let trigger_routers = stmt
            .query_map([], map_trigger_router)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        debug!("Loaded {} trigger routers", trigger_routers.len());

        if let Ok(mut cached) = self.trigger_routers.write() {
            *cached = Some(CachedTriggerRouters {
                loaded_at: Instant::now(),
                trigger_routers: trigger_routers.clone(),
            });
        }
        Ok(trigger_routers)
    }

    /// Enabled trigger routers whose router starts at the given node group
    pub fn get_trigger_routers_for_node_group(
        &self,
        conn: &Connection,
        node_group_id: &str,
        refresh: bool,
    ) -> Result<Vec<TriggerRouter>> {
        Ok(self
            .get_trigger_routers(conn, refresh)?
            .into_iter()
            .filter(|tr| tr.enabled && tr.router.node_group_link.source_node_group_id == node_group_id)
            .collect())
    }

    /// Enabled trigger routers of one trigger, for the given source group
    pub fn get_trigger_routers_for_trigger(
        &self,
        conn: &Connection,
        trigger_id: &str,
        node_group_id: &str,
    ) -> Result<Vec<TriggerRouter>> {
        Ok(self
            .get_trigger_routers_for_node_group(conn, node_group_id, false)?
            .into_iter()
            .filter(|tr| tr.trigger.trigger_id == trigger_id)
            .collect())
    }

    pub fn find_trigger_router(
        &self,
        conn: &Connection,
        trigger_id: &str,
        router_id: &str,
    ) -> Result<Option<TriggerRouter>> {
        Ok(self
            .get_trigger_routers(conn, false)?
            .into_iter()
            .find(|tr| tr.trigger.trigger_id == trigger_id && tr.router.router_id == router_id))
    }

    /// Trigger history by id; superseded histories resolve too
    pub fn get_trigger_history(&self, conn: &Connection, hist_id: i64) -> Result<Option<TriggerHistory>> {
        if let Ok(cache) = self.histories.read() {
            if let Some(history) = cache.get(&hist_id) {
                return Ok(Some(history.clone()));
            }
        }
        let sql = format!("{} WHERE trigger_hist_id = ?1", SELECT_TRIGGER_HIST);
        let history = conn
            .query_row(&sql, params![hist_id], map_trigger_history)
            .optional()?;
        if let Some(history) = &history {
            if let Ok(mut cache) = self.histories.write() {
                cache.insert(hist_id, history.clone());
            }
        }
        Ok(history)
    }

    /// Newest active history for a trigger
    pub fn get_newest_trigger_history(
        &self,
        conn: &Connection,
        trigger_id: &str,
    ) -> Result<Option<TriggerHistory>> {
        let sql = format!(
            "{} WHERE trigger_id = ?1 AND inactive_time IS NULL ORDER BY trigger_hist_id DESC LIMIT 1",
            SELECT_TRIGGER_HIST
        );
        Ok(conn
            .query_row(&sql, params![trigger_id], map_trigger_history)
            .optional()?)
    }

    pub fn get_active_trigger_histories(&self, conn: &Connection) -> Result<Vec<TriggerHistory>> {
        let sql = format!(
            "{} WHERE inactive_time IS NULL ORDER BY trigger_hist_id",
            SELECT_TRIGGER_HIST
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let histories = stmt
            .query_map([], map_trigger_history)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(histories)
    }

    pub fn insert_trigger_history(&self, conn: &Connection, history: &mut TriggerHistory) -> Result<()> {
        let now = now_timestamp();
        conn.execute(
            r#"
            INSERT INTO sym_trigger_hist (trigger_id, source_table_name, source_catalog_name,
                source_schema_name, name_for_update_trigger, name_for_insert_trigger,
                name_for_delete_trigger, table_hash, trigger_row_hash, trigger_template_hash,
                column_names, pk_column_names, last_trigger_build_reason, error_message, create_time)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            params![
                history.trigger_id,
                history.source_table_name,
                history.source_catalog_name,
                history.source_schema_name,
                history.name_for_update_trigger,
                history.name_for_insert_trigger,
                history.name_for_delete_trigger,
                history.table_hash,
                history.trigger_row_hash,
                history.trigger_template_hash,
                history.column_names,
                history.pk_column_names,
                history.last_trigger_build_reason.code(),
                history.error_message,
                now,
            ],
        )?;
        history.trigger_hist_id = conn.last_insert_rowid();
        history.create_time = Some(now);
        Ok(())
    }

    pub fn inactivate_trigger_history(&self, conn: &Connection, hist_id: i64) -> Result<()> {
        conn.execute(
            "UPDATE sym_trigger_hist SET inactive_time = ?1 WHERE trigger_hist_id = ?2",
            params![now_timestamp(), hist_id],
        )?;
        if let Ok(mut cache) = self.histories.write() {
            cache.remove(&hist_id);
        }
        Ok(())
    }

    pub fn save_trigger(&self, conn: &Connection, trigger: &Trigger) -> Result<()> {
        let now = now_timestamp();
        conn.execute(
            r#"
            INSERT INTO sym_trigger (trigger_id, source_catalog_name, source_schema_name,
                source_table_name, channel_id, reload_channel_id, sync_on_update, sync_on_insert,
                sync_on_delete, sync_on_incoming_batch, name_for_update_trigger,
                name_for_insert_trigger, name_for_delete_trigger, sync_on_update_condition,
                sync_on_insert_condition, sync_on_delete_condition, custom_on_update_text,
                custom_on_insert_text, custom_on_delete_text, external_select, tx_id_expression,
                channel_expression, excluded_column_names, sync_key_names, use_capture_old_data,
                use_capture_lobs, use_stream_lobs, use_handle_key_updates, create_time,
                last_update_by, last_update_time)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, 'symsync', ?29)
            ON CONFLICT(trigger_id) DO UPDATE SET
                source_catalog_name = ?2, source_schema_name = ?3, source_table_name = ?4,
                channel_id = ?5, reload_channel_id = ?6, sync_on_update = ?7, sync_on_insert = ?8,
                sync_on_delete = ?9, sync_on_incoming_batch = ?10, name_for_update_trigger = ?11,
                name_for_insert_trigger = ?12, name_for_delete_trigger = ?13,
                sync_on_update_condition = ?14, sync_on_insert_condition = ?15,
                sync_on_delete_condition = ?16, custom_on_update_text = ?17,
                custom_on_insert_text = ?18, custom_on_delete_text = ?19, external_select = ?20,
                tx_id_expression = ?21, channel_expression = ?22, excluded_column_names = ?23,
                sync_key_names = ?24, use_capture_old_data = ?25, use_capture_lobs = ?26,
                use_stream_lobs = ?27, use_handle_key_updates = ?28, last_update_time = ?29
            "#,
            params![
                trigger.trigger_id,
                trigger.source_catalog_name,
                trigger.source_schema_name,
                trigger.source_table_name,
                trigger.channel_id,
                trigger.reload_channel_id,
                trigger.sync_on_update,
                trigger.sync_on_insert,
                trigger.sync_on_delete,
                trigger.sync_on_incoming_batch,
                trigger.name_for_update_trigger,
                trigger.name_for_insert_trigger,
                trigger.name_for_delete_trigger,
                trigger.sync_on_update_condition,
                trigger.sync_on_insert_condition,
                trigger.sync_on_delete_condition,
                trigger.custom_on_update_text,
                trigger.custom_on_insert_text,
                trigger.custom_on_delete_text,
                trigger.external_select,
                trigger.tx_id_expression,
                trigger.channel_expression,
                trigger.excluded_column_names,
                trigger.sync_key_names,
                trigger.use_capture_old_data,
                trigger.use_capture_lobs,
                trigger.use_stream_lobs,
                trigger.use_handle_key_updates,
                now,
            ],
        )?;
        self.clear_cache();
        Ok(())
    }

    pub fn save_router(&self, conn: &Connection, router: &Router) -> Result<()> {
        let now = now_timestamp();
        conn.execute(
            r#"
            INSERT INTO sym_router (router_id, target_catalog_name, target_schema_name,
                target_table_name, source_node_group_id, target_node_group_id, router_type,
                router_expression, sync_on_update, sync_on_insert, sync_on_delete,
                use_source_catalog_schema, create_time, last_update_by, last_update_time)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 'symsync', ?13)
            ON CONFLICT(router_id) DO UPDATE SET
                target_catalog_name = ?2, target_schema_name = ?3, target_table_name = ?4,
                source_node_group_id = ?5, target_node_group_id = ?6, router_type = ?7,
                router_expression = ?8, sync_on_update = ?9, sync_on_insert = ?10,
                sync_on_delete = ?11, use_source_catalog_schema = ?12, last_update_time = ?13
            "#,
            params![
                router.router_id,
                router.target_catalog_name,
                router.target_schema_name,
                router.target_table_name,
                router.node_group_link.source_node_group_id,
                router.node_group_link.target_node_group_id,
                router.router_type,
                router.router_expression,
                router.sync_on_update,
                router.sync_on_insert,
                router.sync_on_delete,
                router.use_source_catalog_schema,
                now,
            ],
        )?;
        self.clear_cache();
        Ok(())
    }

    /// Store a trigger router together with its trigger and router
    pub fn save_trigger_router(&self, conn: &Connection, trigger_router: &TriggerRouter) -> Result<()> {
        self.save_trigger(conn, &trigger_router.trigger)?;
        self.save_router(conn, &trigger_router.router)?;
        let now = now_timestamp();
        conn.execute(
            r#"
            INSERT INTO sym_trigger_router (trigger_id, router_id, enabled, initial_load_order,
                initial_load_select, ping_back_enabled, create_time, last_update_by, last_update_time)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'symsync', ?7)
            ON CONFLICT(trigger_id, router_id) DO UPDATE SET
                enabled = ?3, initial_load_order = ?4, initial_load_select = ?5,
                ping_back_enabled = ?6, last_update_time = ?7
            "#,
            params![
                trigger_router.trigger.trigger_id,
                trigger_router.router.router_id,
                trigger_router.enabled,
                trigger_router.initial_load_order,
                trigger_router.initial_load_select,
                trigger_router.ping_back_enabled,
                now,
            ],
        )?;
        self.clear_cache();
        Ok(())
    }

    pub fn delete_trigger_router(&self, conn: &Connection, trigger_id: &str, router_id: &str) -> Result<()> {
        conn.execute(
            "DELETE FROM sym_trigger_router WHERE trigger_id = ?1 AND router_id = ?2",
            params![trigger_id, router_id],
        )?;
        self.clear_cache();
        Ok(())
    }

    pub fn clear_cache(&self) {
        if let Ok(mut cached) = self.trigger_routers.write() {
            *cached = None;
        }
        if let Ok(mut cache) = self.histories.write() {
            cache.clear();
        }
    }

    /// Bring the database triggers in line with the configuration.
    ///
    /// A trigger is rebuilt when it has no active history, when the table
    /// shape, trigger definition or template changed, or when `force` is
    /// set. Triggers whose configuration disappeared are dropped.
    pub fn sync_triggers(
        &self,
        conn: &Connection,
        node_group_id: &str,
        force: bool,
    ) -> Result<SyncTriggersSummary> {
        let mut summary = SyncTriggersSummary::default();
        let template_hash = self.dialect.template().template_hash();

        let mut triggers: Vec<Trigger> = Vec::new();
        for trigger_router in self.get_trigger_routers_for_node_group(conn, node_group_id, true)? {
            if !triggers.iter().any(|t| t.trigger_id == trigger_router.trigger.trigger_id) {
                triggers.push(trigger_router.trigger);
            }
        }
        let configured: HashSet<String> = triggers.iter().map(|t| t.trigger_id.clone()).collect();

        for history in self.get_active_trigger_histories(conn)? {
            if configured.contains(&history.trigger_id) {
                continue;
            }
            info!(
                "Removing triggers for {} because trigger {} is no longer configured",
                history.source_table_name, history.trigger_id
            );
            match in_transaction(conn, |tx| self.drop_history_triggers(tx, &history)) {
                Ok(()) => summary.removed += 1,
                Err(e) => {
                    error!("Failed to remove triggers for {}: {}", history.trigger_id, e);
                    summary.failed += 1;
                }
            }
        }

        for trigger in &triggers {
            let result = in_transaction(conn, |tx| {
                self.sync_trigger(tx, trigger, node_group_id, template_hash, force)
            });
            match result {
                Ok(TriggerSyncOutcome::Rebuilt) => summary.rebuilt += 1,
                Ok(TriggerSyncOutcome::Repaired) => summary.repaired += 1,
                Ok(TriggerSyncOutcome::Unchanged) => {}
                Err(e) => {
                    error!(
                        "Failed to sync trigger {} for table {}: {}",
                        trigger.trigger_id, trigger.source_table_name, e
                    );
                    summary.failed += 1;
                }
            }
        }

        self.clear_cache();
        info!(
            "Synchronized triggers: {} rebuilt, {} repaired, {} removed, {} failed",
            summary.rebuilt, summary.repaired, summary.removed, summary.failed
        );
        Ok(summary)
    }

    fn sync_trigger(
        &self,
        conn: &Connection,
        trigger: &Trigger,
        node_group_id: &str,
        template_hash: i64,
        force: bool,
    ) -> Result<TriggerSyncOutcome> {
        let latest = self.get_newest_trigger_history(conn, &trigger.trigger_id)?;
        let table = self.platform.get_table(
            conn,
            trigger.source_catalog_name.as_deref(),
            trigger.source_schema_name.as_deref(),
            &trigger.source_table_name,
            false,
        )?;

        let table = match table {
            Some(table) => table,
            None => {
                warn!(
                    "Could not find table {} for trigger {}",
                    trigger.source_table_name, trigger.trigger_id
                );
                if let Some(history) = &latest {
                    self.drop_history_triggers(conn, history)?;
                    return Ok(TriggerSyncOutcome::Rebuilt);
                }
                return Ok(TriggerSyncOutcome::Unchanged);
            }
        };

        let channel = match self.configuration.get_channel(conn, &trigger.channel_id)? {
            Some(channel) => channel,
            None => {
                warn!(
                    "Trigger {} references unknown channel {}",
                    trigger.trigger_id, trigger.channel_id
                );
                Channel::new(trigger.channel_id.clone(), 0)
            }
        };

        let reason = rebuild_reason(latest.as_ref(), trigger, &table, template_hash, force);
        let history = match (reason, latest) {
            (Some(reason), latest) => {
                if let Some(old) = &latest {
                    self.drop_history_triggers(conn, old)?;
                }
                info!(
                    "Building triggers for {} ({:?})",
                    table.fully_qualified_name(),
                    reason
                );
                let mut history = TriggerHistory::new(trigger, &table, template_hash, reason);
                for event_type in DML_EVENTS {
                    let name = trigger
                        .configured_trigger_name(event_type)
                        .map(str::to_string)
                        .unwrap_or_else(|| {
                            trigger.default_trigger_name(
                                event_type,
                                node_group_id,
                                self.dialect.max_trigger_name_length(),
                            )
                        });
                    history.set_trigger_name(event_type, name);
                }
                self.insert_trigger_history(conn, &mut history)?;
                for event_type in DML_EVENTS {
                    if trigger.syncs(event_type) {
                        self.dialect
                            .create_trigger(conn, event_type, trigger, &history, &channel, &table)?;
                    }
                }
                return Ok(TriggerSyncOutcome::Rebuilt);
            }
            (None, Some(history)) => history,
            (None, None) => return Ok(TriggerSyncOutcome::Unchanged),
        };

        let mut outcome = TriggerSyncOutcome::Unchanged;
        for event_type in DML_EVENTS {
            if !trigger.syncs(event_type) {
                continue;
            }
            if let Some(name) = history.trigger_name_for(event_type) {
                if !self.dialect.does_trigger_exist(
                    conn,
                    table.schema.as_deref(),
                    &table.name,
                    name,
                )? {
                    warn!("Trigger {} is missing, recreating it", name);
                    self.dialect
                        .create_trigger(conn, event_type, trigger, &history, &channel, &table)?;
                    outcome = TriggerSyncOutcome::Repaired;
                }
            }
        }
        Ok(outcome)
    }

    fn drop_history_triggers(&self, conn: &Connection, history: &TriggerHistory) -> Result<()> {
        for event_type in DML_EVENTS {
            if let Some(name) = history.trigger_name_for(event_type) {
                self.dialect
                    .remove_trigger(conn, history.source_schema_name.as_deref(), name)?;
            }
        }
        self.inactivate_trigger_history(conn, history.trigger_hist_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TriggerSyncOutcome {
    Rebuilt,
    Repaired,
    Unchanged,
}

fn rebuild_reason(
    latest: Option<&TriggerHistory>,
    trigger: &Trigger,
    table: &Table,
    template_hash: i64,
    force: bool,
) -> Option<TriggerReBuildReason> {
    let latest = match latest {
        Some(latest) => latest,
        None => return Some(TriggerReBuildReason::New),
    };
    let fresh = TriggerHistory::new(trigger, table, template_hash, TriggerReBuildReason::New);
    if force {
        Some(TriggerReBuildReason::Forced)
    } else if latest.table_hash != fresh.table_hash
        || latest.column_names != fresh.column_names
        || latest.pk_column_names != fresh.pk_column_names
    {
        Some(TriggerReBuildReason::TableSchemaChanged)
    } else if latest.trigger_row_hash != fresh.trigger_row_hash {
        Some(TriggerReBuildReason::TriggerChanged)
    } else if latest.trigger_template_hash != template_hash {
        Some(TriggerReBuildReason::TriggerTemplateChanged)
    } else {
        None
    }
}

fn map_trigger_router(row: &Row<'_>) -> rusqlite::Result<TriggerRouter> {
    let trigger = Trigger {
        trigger_id: row.get(0)?,
        source_catalog_name: row.get(1)?,
        source_schema_name: row.get(2)?,
        source_table_name: row.get(3)?,
        channel_id: row.get(4)?,
        reload_channel_id: row.get(5)?,
        sync_on_update: row.get(6)?,
        sync_on_insert: row.get(7)?,
        sync_on_delete: row.get(8)?,
        sync_on_incoming_batch: row.get(9)?,
        name_for_update_trigger: row.get(10)?,
        name_for_insert_trigger: row.get(11)?,
        name_for_delete_trigger: row.get(12)?,
        sync_on_update_condition: row.get(13)?,
        sync_on_insert_condition: row.get(14)?,
        sync_on_delete_condition: row.get(15)?,
        custom_on_update_text: row.get(16)?,
        custom_on_insert_text: row.get(17)?,
        custom_on_delete_text: row.get(18)?,
        external_select: row.get(19)?,
        tx_id_expression: row.get(20)?,
        channel_expression: row.get(21)?,
        excluded_column_names: row.get(22)?,
        sync_key_names: row.get(23)?,
        use_capture_old_data: row.get(24)?,
        use_capture_lobs: row.get(25)?,
        use_stream_lobs: row.get(26)?,
        use_handle_key_updates: row.get(27)?,
        create_time: row.get(28)?,
        last_update_time: row.get(29)?,
    };

    let action: Option<String> = row.get(46)?;
    let link = NodeGroupLink {
        source_node_group_id: row.get(34)?,
        target_node_group_id: row.get(35)?,
        data_event_action: action
            .as_deref()
            .and_then(NodeGroupLinkAction::from_code)
            .unwrap_or(NodeGroupLinkAction::WaitForPull),
        sync_config_enabled: row.get::<_, Option<bool>>(47)?.unwrap_or(true),
    };
    let router = Router {
        router_id: row.get(30)?,
        target_catalog_name: row.get(31)?,
        target_schema_name: row.get(32)?,
        target_table_name: row.get(33)?,
        node_group_link: link,
        router_type: row.get(36)?,
        router_expression: row.get(37)?,
        sync_on_update: row.get(38)?,
        sync_on_insert: row.get(39)?,
        sync_on_delete: row.get(40)?,
        use_source_catalog_schema: row.get(41)?,
    };

    Ok(TriggerRouter {
        trigger,
        router,
        enabled: row.get(42)?,
        initial_load_order: row.get(43)?,
        initial_load_select: row.get(44)?,
        ping_back_enabled: row.get(45)?,
    })
}

fn map_trigger_history(row: &Row<'_>) -> rusqlite::Result<TriggerHistory> {
    let reason: String = row.get(13)?;
    Ok(TriggerHistory {
        trigger_hist_id: row.get(0)?,
        trigger_id: row.get(1)?,
        source_table_name: row.get(2)?,
        source_catalog_name: row.get(3)?,
        source_schema_name: row.get(4)?,
        name_for_insert_trigger: row.get(5)?,
        name_for_update_trigger: row.get(6)?,
        name_for_delete_trigger: row.get(7)?,
        table_hash: row.get(8)?,
        trigger_row_hash: row.get(9)?,
        trigger_template_hash: row.get(10)?,
        column_names: row.get(11)?,
        pk_column_names: row.get(12)?,
        last_trigger_build_reason: TriggerReBuildReason::from_code(&reason)
            .unwrap_or(TriggerReBuildReason::New),
        error_message: row.get(14)?,
        create_time: row.get(15)?,
        inactive_time: row.get(16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::create_sym_tables;
    use crate::db::SqliteDialect;
    use std::collections::HashMap as Map;

    fn setup() -> (Connection, TriggerRouterService) {
        let conn = Connection::open_in_memory().unwrap();
        create_sym_tables(&conn).unwrap();
        conn.execute_batch("CREATE TABLE item (id INTEGER PRIMARY KEY, name TEXT);")
            .unwrap();
        let configuration = Arc::new(ConfigurationService::new());
        configuration.ensure_default_channels(&conn).unwrap();
        let service = TriggerRouterService::new(
            Arc::new(ParameterService::new("000", "corp", Map::new())),
            configuration,
            Arc::new(Platform::new()),
            Arc::new(SqliteDialect::new()),
        );
        let link = NodeGroupLink::new("corp", "store", NodeGroupLinkAction::WaitForPull);
        let trigger_router = TriggerRouter::new(
            Trigger::new("item", "item", "default"),
            Router::new("corp_2_store", link),
        );
        service.save_trigger_router(&conn, &trigger_router).unwrap();
        (conn, service)
    }

    fn trigger_count(conn: &Connection) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger'",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_trigger_router_round_trip() {
        let (conn, service) = setup();
        let routers = service.get_trigger_routers(&conn, true).unwrap();
        assert_eq!(routers.len(), 1);
        assert_eq!(routers[0].router.node_group_link.target_node_group_id, "store");
        assert_eq!(routers[0].router.router_type(), "default");
        assert!(service
            .get_trigger_routers_for_trigger(&conn, "item", "store")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_sync_triggers_builds_once() {
        let (conn, service) = setup();
        let summary = service.sync_triggers(&conn, "corp", false).unwrap();
        assert_eq!(summary.rebuilt, 1);
        assert_eq!(trigger_count(&conn), 3);

        let history = service.get_newest_trigger_history(&conn, "item").unwrap().unwrap();
        assert_eq!(history.last_trigger_build_reason, TriggerReBuildReason::New);
        assert_eq!(history.column_names, "id,name");
        assert_eq!(
            history.name_for_insert_trigger.as_deref(),
            Some("SYM_ON_I_FOR_ITEM_CORP")
        );

        let again = service.sync_triggers(&conn, "corp", false).unwrap();
        assert_eq!(again, SyncTriggersSummary::default());
    }

    #[test]
    fn test_schema_change_supersedes_history() {
        let (conn, service) = setup();
        service.sync_triggers(&conn, "corp", false).unwrap();
        let first = service.get_newest_trigger_history(&conn, "item").unwrap().unwrap();

        conn.execute_batch("ALTER TABLE item ADD COLUMN price NUMERIC;").unwrap();
        service.sync_triggers(&conn, "corp", false).unwrap();
        let second = service.get_newest_trigger_history(&conn, "item").unwrap().unwrap();
        assert_ne!(first.trigger_hist_id, second.trigger_hist_id);
        assert_eq!(
            second.last_trigger_build_reason,
            TriggerReBuildReason::TableSchemaChanged
        );
        assert_eq!(second.column_names, "id,name,price");

        let old = service.get_trigger_history(&conn, first.trigger_hist_id).unwrap().unwrap();
        assert!(old.inactive_time.is_some());
        assert_eq!(trigger_count(&conn), 3);
    }

    #[test]
    fn test_force_and_trigger_change() {
        let (conn, service) = setup();
        service.sync_triggers(&conn, "corp", false).unwrap();
        service.sync_triggers(&conn, "corp", true).unwrap();
        let forced = service.get_newest_trigger_history(&conn, "item").unwrap().unwrap();
        assert_eq!(forced.last_trigger_build_reason, TriggerReBuildReason::Forced);

        let mut trigger = Trigger::new("item", "item", "default");
        trigger.sync_on_delete = false;
        service.save_trigger(&conn, &trigger).unwrap();
        service.sync_triggers(&conn, "corp", false).unwrap();
        let changed = service.get_newest_trigger_history(&conn, "item").unwrap().unwrap();
        assert_eq!(changed.last_trigger_build_reason, TriggerReBuildReason::TriggerChanged);
        assert_eq!(trigger_count(&conn), 2);
    }

    #[test]
    fn test_removed_configuration_drops_triggers() {
        let (conn, service) = setup();
        service.sync_triggers(&conn, "corp", false).unwrap();
        service.delete_trigger_router(&conn, "item", "corp_2_store").unwrap();
        let summary = service.sync_triggers(&conn, "corp", false).unwrap();
        assert_eq!(summary.removed, 1);
        assert_eq!(trigger_count(&conn), 0);
        assert!(service.get_newest_trigger_history(&conn, "item").unwrap().is_none());
    }

    #[test]
    fn test_missing_trigger_is_repaired() {
        let (conn, service) = setup();
        service.sync_triggers(&conn, "corp", false).unwrap();
        conn.execute_batch("DROP TRIGGER SYM_ON_U_FOR_ITEM_CORP;").unwrap();
        let summary = service.sync_triggers(&conn, "corp", false).unwrap();
        assert_eq!(summary.repaired, 1);
        assert_eq!(trigger_count(&conn), 3);
    }
}
