//! Node identity, peers and credentials

use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::model::{now_timestamp, Node, NodeSecurity};

const SELECT_NODE: &str = r#"
    SELECT n.node_id, n.node_group_id, n.external_id, n.sync_enabled, n.sync_url,
           n.schema_version, n.symmetric_version, n.database_type, n.database_version,
           n.heartbeat_time, n.timezone_offset, n.batch_to_send_count,
           n.batch_in_error_count, n.created_at_node_id, n.deployment_type
    FROM sym_node n
"#;

/// Lookups over sym_node, sym_node_identity and sym_node_security
#[derive(Default)]
pub struct NodeService {
    identity: Mutex<Option<Node>>,
}

impl NodeService {
    pub fn new() -> Self {
        Self::default()
    }

    /// This node, as recorded in sym_node_identity
    pub fn find_identity(&self, conn: &Connection) -> Result<Option<Node>> {
        if let Ok(cached) = self.identity.lock() {
            if cached.is_some() {
                return Ok(cached.clone());
            }
        }
        let sql = format!(
            "{} INNER JOIN sym_node_identity i ON n.node_id = i.node_id",
            SELECT_NODE
        );
        let node = conn.query_row(&sql, [], map_node).optional()?;
        if let Ok(mut cached) = self.identity.lock() {
            cached.clone_from(&node);
        }
        Ok(node)
    }

    pub fn find_identity_node_id(&self, conn: &Connection) -> Result<Option<String>> {
        Ok(self.find_identity(conn)?.map(|n| n.node_id))
    }

    /// Record `node` as this node's identity
    pub fn save_identity(&self, conn: &Connection, node: &Node) -> Result<()> {
        self.save_node(conn, node)?;
        conn.execute("DELETE FROM sym_node_identity", [])?;
        conn.execute(
            "INSERT INTO sym_node_identity (node_id) VALUES (?1)",
            params![node.node_id],
        )?;
        self.flush_cache();
        Ok(())
    }

    pub fn flush_cache(&self) {
        if let Ok(mut cached) = self.identity.lock() {
            *cached = None;
        }
    }

    pub fn find_node(&self, conn: &Connection, node_id: &str) -> Result<Option<Node>> {
        let sql = format!("{} WHERE n.node_id = ?1", SELECT_NODE);
        Ok(conn.query_row(&sql, params![node_id], map_node).optional()?)
    }

    pub fn find_node_security(
        &self,
        conn: &Connection,
        node_id: &str,
    ) -> Result<Option<NodeSecurity>> {
        let security = conn
            .query_row(
                r#"
                SELECT node_id, node_password, registration_enabled, registration_time,
                       initial_load_enabled, initial_load_time, created_at_node_id
                FROM sym_node_security WHERE node_id = ?1
                "#,
                params![node_id],
                |row| {
                    Ok(NodeSecurity {
                        node_id: row.get(0)?,
                        node_password: row.get(1)?,
                        registration_enabled: row.get::<_, Option<bool>>(2)?.unwrap_or(false),
                        registration_time: row.get(3)?,
                        initial_load_enabled: row.get::<_, Option<bool>>(4)?.unwrap_or(false),
                        initial_load_time: row.get(5)?,
                        created_at_node_id: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(security)
    }

    /// Check a password presented by a remote node
    pub fn is_node_authorized(
        &self,
        conn: &Connection,
        node_id: &str,
        password: &str,
    ) -> Result<bool> {
        Ok(self
            .find_node_security(conn, node_id)?
            .map(|s| s.node_password == password)
            .unwrap_or(false))
    }

    /// Nodes this node pulls from: sources of wait-for-pull links into our group
    pub fn find_nodes_to_pull(&self, conn: &Connection, local: &Node) -> Result<Vec<Node>> {
        let sql = format!(
            r#"{} INNER JOIN sym_node_group_link l ON n.node_group_id = l.source_node_group_id
               WHERE l.target_node_group_id = ?1 AND l.data_event_action = 'W'
                 AND n.sync_enabled = 1 AND n.node_id != ?2
               ORDER BY n.node_id"#,
            SELECT_NODE
        );
        self.query_nodes(conn, &sql, params![local.node_group_id, local.node_id])
    }

    /// Nodes this node pushes to: targets of push links out of our group
    pub fn find_nodes_to_push_to(&self, conn: &Connection, local: &Node) -> Result<Vec<Node>> {
        let sql = format!(
            r#"{} INNER JOIN sym_node_group_link l ON n.node_group_id = l.target_node_group_id
               WHERE l.source_node_group_id = ?1 AND l.data_event_action = 'P'
                 AND n.sync_enabled = 1 AND n.node_id != ?2
               ORDER BY n.node_id"#,
            SELECT_NODE
        );
        self.query_nodes(conn, &sql, params![local.node_group_id, local.node_id])
    }

    /// Sync enabled nodes of a group
    pub fn find_enabled_nodes_from_node_group(
        &self,
        conn: &Connection,
        node_group_id: &str,
    ) -> Result<Vec<Node>> {
        let sql = format!(
            "{} WHERE n.node_group_id = ?1 AND n.sync_enabled = 1 ORDER BY n.node_id",
            SELECT_NODE
        );
        self.query_nodes(conn, &sql, params![node_group_id])
    }

    pub fn save_node(&self, conn: &Connection, node: &Node) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO sym_node (node_id, node_group_id, external_id, sync_enabled, sync_url,
                schema_version, symmetric_version, database_type, database_version,
                heartbeat_time, timezone_offset, batch_to_send_count, batch_in_error_count,
                created_at_node_id, deployment_type)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(node_id) DO UPDATE SET
                node_group_id = ?2, external_id = ?3, sync_enabled = ?4, sync_url = ?5,
                schema_version = ?6, symmetric_version = ?7, database_type = ?8,
                database_version = ?9, heartbeat_time = ?10, timezone_offset = ?11,
                batch_to_send_count = ?12, batch_in_error_count = ?13,
                created_at_node_id = ?14, deployment_type = ?15
            "#,
            params![
                node.node_id,
                node.node_group_id,
                node.external_id,
                node.sync_enabled,
                node.sync_url,
                node.schema_version,
                node.symmetric_version,
                node.database_type,
                node.database_version,
                node.heartbeat_time,
                node.timezone_offset,
                node.batch_to_send_count,
                node.batch_in_error_count,
                node.created_at_node_id,
                node.deployment_type,
            ],
        )?;
        Ok(())
    }

    pub fn save_node_security(&self, conn: &Connection, security: &NodeSecurity) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO sym_node_security (node_id, node_password, registration_enabled,
                registration_time, initial_load_enabled, initial_load_time, created_at_node_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(node_id) DO UPDATE SET
                node_password = ?2, registration_enabled = ?3, registration_time = ?4,
                initial_load_enabled = ?5, initial_load_time = ?6, created_at_node_id = ?7
            "#,
            params![
                security.node_id,
                security.node_password,
                security.registration_enabled,
                security.registration_time,
                security.initial_load_enabled,
                security.initial_load_time,
                security.created_at_node_id,
            ],
        )?;
        Ok(())
    }

    /// Refresh heartbeat time and batch counters for this node
    pub fn update_heartbeat(&self, conn: &Connection, node_id: &str) -> Result<()> {
        conn.execute(
            r#"
            UPDATE sym_node SET heartbeat_time = ?2,
                batch_to_send_count = (SELECT COUNT(*) FROM sym_outgoing_batch
                    WHERE status IN ('NE', 'QY', 'SE', 'LD', 'ER') AND node_id != '-1'),
                batch_in_error_count = (SELECT COUNT(*) FROM sym_outgoing_batch WHERE status = 'ER')
            WHERE node_id = ?1
            "#,
            params![node_id, now_timestamp()],
        )?;
        self.flush_cache();
        Ok(())
    }

    fn query_nodes<P: rusqlite::Params>(
        &self,
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> Result<Vec<Node>> {
        let mut stmt = conn.prepare_cached(sql)?;
        let nodes = stmt
            .query_map(params, map_node)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(nodes)
    }
}

fn map_node(row: &Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        node_id: row.get(0)?,
        node_group_id: row.get(1)?,
        external_id: row.get(2)?,
        sync_enabled: row.get::<_, Option<bool>>(3)?.unwrap_or(false),
        sync_url: row.get(4)?,
        schema_version: row.get(5)?,
        symmetric_version: row.get(6)?,
        database_type: row.get(7)?,
        database_version: row.get(8)?,
        heartbeat_time: row.get(9)?,
        timezone_offset: row.get(10)?,
        batch_to_send_count: row.get::<_, Option<i64>>(11)?.unwrap_or(0),
        batch_in_error_count: row.get::<_, Option<i64>>(12)?.unwrap_or(0),
        created_at_node_id: row.get(13)?,
        deployment_type: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::create_sym_tables;

    fn setup() -> (Connection, NodeService) {
        let conn = Connection::open_in_memory().unwrap();
        create_sym_tables(&conn).unwrap();
        conn.execute_batch(
            r#"
            INSERT INTO sym_node_group_link (source_node_group_id, target_node_group_id, data_event_action) VALUES ('corp', 'store', 'W');
            INSERT INTO sym_node_group_link (source_node_group_id, target_node_group_id, data_event_action) VALUES ('store', 'corp', 'P');
            "#,
        )
        .unwrap();
        let service = NodeService::new();
        service
            .save_node(&conn, &Node::new("000", "corp", "000").with_sync_url("http://corp/sync"))
            .unwrap();
        let mut disabled = Node::new("099", "corp", "099");
        disabled.sync_enabled = false;
        service.save_node(&conn, &disabled).unwrap();
        service
            .save_identity(&conn, &Node::new("001", "store", "001"))
            .unwrap();
        (conn, service)
    }

    #[test]
    fn test_identity() {
        let (conn, service) = setup();
        let identity = service.find_identity(&conn).unwrap().unwrap();
        assert_eq!(identity.node_id, "001");
        assert_eq!(identity.node_group_id, "store");
    }

    #[test]
    fn test_nodes_to_pull_and_push() {
        let (conn, service) = setup();
        let local = service.find_identity(&conn).unwrap().unwrap();
        let pull: Vec<String> = service
            .find_nodes_to_pull(&conn, &local)
            .unwrap()
            .into_iter()
            .map(|n| n.node_id)
            .collect();
        assert_eq!(pull, vec!["000"]);
        let push = service.find_nodes_to_push_to(&conn, &local).unwrap();
        assert_eq!(push.len(), 1);
        assert_eq!(push[0].sync_url.as_deref(), Some("http://corp/sync"));
    }

    #[test]
    fn test_node_security() {
        let (conn, service) = setup();
        service
            .save_node_security(&conn, &NodeSecurity::new("000", "secret"))
            .unwrap();
        assert!(service.is_node_authorized(&conn, "000", "secret").unwrap());
        assert!(!service.is_node_authorized(&conn, "000", "wrong").unwrap());
        assert!(!service.is_node_authorized(&conn, "404", "secret").unwrap());
    }
}
