//! Channels, node groups and node group links

use std::collections::HashMap;
use std::sync::RwLock;

use rusqlite::{params, Connection};
use tracing::info;

use crate::error::Result;
use crate::model::{now_timestamp, Channel, NodeGroupLink, NodeGroupLinkAction};

pub const CONFIG_CHANNEL: &str = "config";
pub const RELOAD_CHANNEL: &str = "reload";
pub const HEARTBEAT_CHANNEL: &str = "heartbeat";
pub const DEFAULT_CHANNEL: &str = "default";

#[derive(Default)]
pub struct ConfigurationService {
    channels: RwLock<Option<HashMap<String, Channel>>>,
}

impl ConfigurationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the built-in channels that are missing
    pub fn ensure_default_channels(&self, conn: &Connection) -> Result<()> {
        let defaults = [
            Channel::new(CONFIG_CHANNEL, 0),
            Channel::new(RELOAD_CHANNEL, 1).reload(),
            Channel::new(HEARTBEAT_CHANNEL, 2),
            Channel::new(DEFAULT_CHANNEL, 99999),
        ];
        for channel in defaults {
            let inserted = conn.execute(
                r#"
                INSERT OR IGNORE INTO sym_channel (channel_id, processing_order, max_batch_size,
                    max_batch_to_send, max_data_to_route, enabled, reload_flag, batch_algorithm,
                    create_time, last_update_by, last_update_time)
                VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, 'default', ?7, 'symsync', ?7)
                "#,
                params![
                    channel.channel_id,
                    channel.processing_order,
                    channel.max_batch_size,
                    channel.max_batch_to_send,
                    channel.max_data_to_route,
                    channel.reload_flag,
                    now_timestamp(),
                ],
            )?;
            if inserted > 0 {
                info!("Created default channel {}", channel.channel_id);
            }
        }
        self.clear_cache();
        Ok(())
    }

    /// All channels by id
    pub fn get_channels(&self, conn: &Connection, refresh: bool) -> Result<HashMap<String, Channel>> {
        if !refresh {
            if let Ok(cached) = self.channels.read() {
                if let Some(channels) = cached.as_ref() {
                    return Ok(channels.clone());
                }
            }
        }

        let mut stmt = conn.prepare_cached(
            r#"
            SELECT channel_id, processing_order, max_batch_size, max_batch_to_send,
                   max_data_to_route, enabled, use_old_data_to_route, use_row_data_to_route,
                   use_pk_data_to_route, reload_flag, batch_algorithm, description
            FROM sym_channel
            "#,
        )?;
        let channels = stmt
            .query_map([], |row| {
                Ok(Channel {
                    channel_id: row.get(0)?,
                    processing_order: row.get(1)?,
                    max_batch_size: row.get(2)?,
                    max_batch_to_send: row.get(3)?,
                    max_data_to_route: row.get(4)?,
                    enabled: row.get(5)?,
                    use_old_data_to_route: row.get(6)?,
                    use_row_data_to_route: row.get(7)?,
                    use_pk_data_to_route: row.get(8)?,
                    reload_flag: row.get(9)?,
                    batch_algorithm: row.get(10)?,
                    description: row.get(11)?,
                })
            })?
            .map(|c| c.map(|c| (c.channel_id.clone(), c)))
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;

        if let Ok(mut cached) = self.channels.write() {
            *cached = Some(channels.clone());
        }
        Ok(channels)
    }

    /// Channels sorted by processing order, then id
    pub fn get_ordered_channels(&self, conn: &Connection) -> Result<Vec<Channel>> {
        let mut channels: Vec<Channel> = self.get_channels(conn, false)?.into_values().collect();
        channels.sort_by(|a, b| {
            a.processing_order
                .cmp(&b.processing_order)
                .then_with(|| a.channel_id.cmp(&b.channel_id))
        });
        Ok(channels)
    }

    pub fn get_channel(&self, conn: &Connection, channel_id: &str) -> Result<Option<Channel>> {
        Ok(self.get_channels(conn, false)?.remove(channel_id))
    }

    pub fn save_channel(&self, conn: &Connection, channel: &Channel) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO sym_channel (channel_id, processing_order, max_batch_size, max_batch_to_send,
                max_data_to_route, enabled, use_old_data_to_route, use_row_data_to_route,
                use_pk_data_to_route, reload_flag, batch_algorithm, description,
                create_time, last_update_by, last_update_time)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 'symsync', ?13)
            ON CONFLICT(channel_id) DO UPDATE SET
                processing_order = ?2, max_batch_size = ?3, max_batch_to_send = ?4,
                max_data_to_route = ?5, enabled = ?6, use_old_data_to_route = ?7,
                use_row_data_to_route = ?8, use_pk_data_to_route = ?9, reload_flag = ?10,
                batch_algorithm = ?11, description = ?12, last_update_time = ?13
            "#,
            params![
                channel.channel_id,
                channel.processing_order,
                channel.max_batch_size,
                channel.max_batch_to_send,
                channel.max_data_to_route,
                channel.enabled,
                channel.use_old_data_to_route,
                channel.use_row_data_to_route,
                channel.use_pk_data_to_route,
                channel.reload_flag,
                channel.batch_algorithm,
                channel.description,
                now_timestamp(),
            ],
        )?;
        self.clear_cache();
        Ok(())
    }

    pub fn save_node_group(
        &self,
        conn: &Connection,
        node_group_id: &str,
        description: Option<&str>,
    ) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO sym_node_group (node_group_id, description, create_time, last_update_by, last_update_time)
            VALUES (?1, ?2, ?3, 'symsync', ?3)
            ON CONFLICT(node_group_id) DO UPDATE SET description = ?2, last_update_time = ?3
            "#,
            params![node_group_id, description, now_timestamp()],
        )?;
        Ok(())
    }

    pub fn save_node_group_link(&self, conn: &Connection, link: &NodeGroupLink) -> Result<()> {
        self.save_node_group(conn, &link.source_node_group_id, None)?;
        self.save_node_group(conn, &link.target_node_group_id, None)?;
        conn.execute(
            r#"
            INSERT INTO sym_node_group_link (source_node_group_id, target_node_group_id,
                data_event_action, sync_config_enabled, create_time, last_update_by, last_update_time)
            VALUES (?1, ?2, ?3, ?4, ?5, 'symsync', ?5)
            ON CONFLICT(source_node_group_id, target_node_group_id) DO UPDATE SET
                data_event_action = ?3, sync_config_enabled = ?4, last_update_time = ?5
            "#,
            params![
                link.source_node_group_id,
                link.target_node_group_id,
                link.data_event_action.code(),
                link.sync_config_enabled,
                now_timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn get_node_group_links(&self, conn: &Connection) -> Result<Vec<NodeGroupLink>> {
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT source_node_group_id, target_node_group_id, data_event_action, sync_config_enabled
            FROM sym_node_group_link ORDER BY source_node_group_id, target_node_group_id
            "#,
        )?;
        let links = stmt
            .query_map([], |row| {
                let action: String = row.get(2)?;
                Ok(NodeGroupLink {
                    source_node_group_id: row.get(0)?,
                    target_node_group_id: row.get(1)?,
                    data_event_action: NodeGroupLinkAction::from_code(&action)
                        .unwrap_or(NodeGroupLinkAction::WaitForPull),
                    sync_config_enabled: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(links)
    }

    /// Links whose source is the given group
    pub fn get_node_group_links_for(
        &self,
        conn: &Connection,
        source_node_group_id: &str,
    ) -> Result<Vec<NodeGroupLink>> {
        Ok(self
            .get_node_group_links(conn)?
            .into_iter()
            .filter(|l| l.source_node_group_id == source_node_group_id)
            .collect())
    }

    pub fn clear_cache(&self) {
        if let Ok(mut cached) = self.channels.write() {
            *cached = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::create_sym_tables;

    #[test]
    fn test_default_channels_ordered() {
        let conn = Connection::open_in_memory().unwrap();
        create_sym_tables(&conn).unwrap();
        let service = ConfigurationService::new();
        service.ensure_default_channels(&conn).unwrap();
        service.save_channel(&conn, &Channel::new("sales", 10).with_max_batch_size(2)).unwrap();
        service.ensure_default_channels(&conn).unwrap();

        let ids: Vec<String> = service
            .get_ordered_channels(&conn)
            .unwrap()
            .into_iter()
            .map(|c| c.channel_id)
            .collect();
        assert_eq!(ids, vec!["config", "reload", "heartbeat", "sales", "default"]);

        let sales = service.get_channel(&conn, "sales").unwrap().unwrap();
        assert_eq!(sales.max_batch_size, 2);
        assert!(service.get_channel(&conn, "reload").unwrap().unwrap().reload_flag);
    }

    #[test]
    fn test_channel_cache_invalidated_on_save() {
        let conn = Connection::open_in_memory().unwrap();
        create_sym_tables(&conn).unwrap();
        let service = ConfigurationService::new();
        service.save_channel(&conn, &Channel::new("sales", 1)).unwrap();
        assert!(service.get_channel(&conn, "sales").unwrap().unwrap().enabled);

        let mut disabled = Channel::new("sales", 1);
        disabled.enabled = false;
        service.save_channel(&conn, &disabled).unwrap();
        assert!(!service.get_channel(&conn, "sales").unwrap().unwrap().enabled);
    }

    #[test]
    fn test_node_group_links() {
        let conn = Connection::open_in_memory().unwrap();
        create_sym_tables(&conn).unwrap();
        let service = ConfigurationService::new();
        service
            .save_node_group_link(&conn, &NodeGroupLink::new("corp", "store", NodeGroupLinkAction::WaitForPull))
            .unwrap();
        service
            .save_node_group_link(&conn, &NodeGroupLink::new("store", "corp", NodeGroupLinkAction::Push))
            .unwrap();
        let links = service.get_node_group_links_for(&conn, "store").unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].data_event_action, NodeGroupLinkAction::Push);
    }
}
