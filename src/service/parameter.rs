//! Layered parameter lookup
//!
//! `sym_parameter` rows override values from the config file, which
//! override the defaults passed at each call site. Rows for this node's
//! external id or group win over rows for `ALL`.

use std::collections::HashMap;
use std::sync::RwLock;

use rusqlite::{params, Connection};
use tracing::debug;

use crate::error::Result;
use crate::model::now_timestamp;

pub const AUTO_SYNC_TRIGGERS: &str = "auto.sync.triggers";
pub const AUTO_SYNC_TRIGGERS_AFTER_CONFIG_LOADED: &str = "auto.sync.triggers.after.config.loaded";
pub const INCOMING_BATCHES_RECORD_OK: &str = "incoming.batches.record.ok.enabled";
pub const INCOMING_BATCHES_SKIP_DUPLICATES: &str = "incoming.batches.skip.duplicates";
pub const DATA_LOADER_IGNORE_MISSING_TABLES: &str = "dataloader.ignore.missing.tables";
pub const DATA_LOADER_USE_SOURCE_TABLE_SHAPE: &str = "dataloader.use.source.table.shape";
/// Total ack attempts per batch set, including the first
pub const NUM_OF_ACK_RETRIES: &str = "num.of.ack.retries";
pub const TIME_BETWEEN_ACK_RETRIES: &str = "time.between.ack.retries.ms";
pub const CACHE_TRIGGER_ROUTER_TIME: &str = "cache.trigger.router.time.ms";
pub const JOB_RANDOM_MAX_START_TIME: &str = "job.random.max.start.time.ms";
pub const TRANSPORT_HTTP_TIMEOUT: &str = "http.timeout.ms";
pub const ROUTING_MAX_DATA_TO_ROUTE: &str = "routing.max.data.to.route";

/// Value used in sym_parameter for rows that apply to every node
pub const ALL: &str = "ALL";

/// Typed access to SymmetricDS parameters
pub struct ParameterService {
    external_id: String,
    node_group_id: String,
    file_parameters: HashMap<String, String>,
    /// Merged file and database parameters, rebuilt by `refresh`
    parameters: RwLock<HashMap<String, String>>,
}

impl ParameterService {
    pub fn new(
        external_id: impl Into<String>,
        node_group_id: impl Into<String>,
        file_parameters: HashMap<String, String>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            node_group_id: node_group_id.into(),
            parameters: RwLock::new(file_parameters.clone()),
            file_parameters,
        }
    }

    /// Reload database parameters on top of the file parameters
    pub fn refresh(&self, conn: &Connection) -> Result<()> {
        let mut merged = self.file_parameters.clone();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT param_key, param_value FROM sym_parameter
            WHERE (external_id = ?1 OR external_id = ?3)
              AND (node_group_id = ?2 OR node_group_id = ?3)
            ORDER BY CASE WHEN external_id = ?3 THEN 0 ELSE 1 END,
                     CASE WHEN node_group_id = ?3 THEN 0 ELSE 1 END
            "#,
        )?;
        let rows = stmt.query_map(params![self.external_id, self.node_group_id, ALL], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        let mut count = 0;
        for row in rows {
            let (key, value) = row?;
            if let Some(value) = value {
                merged.insert(key, value);
                count += 1;
            }
        }
        debug!("Loaded {} parameters from the database", count);

        if let Ok(mut parameters) = self.parameters.write() {
            *parameters = merged;
        }
        Ok(())
    }

    /// Store a parameter row and apply it to this service
    pub fn save_parameter(
        &self,
        conn: &Connection,
        external_id: &str,
        node_group_id: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let now = now_timestamp();
        conn.execute(
            r#"
            INSERT INTO sym_parameter (external_id, node_group_id, param_key, param_value, create_time, last_update_by, last_update_time)
            VALUES (?1, ?2, ?3, ?4, ?5, 'symsync', ?5)
            ON CONFLICT(external_id, node_group_id, param_key)
            DO UPDATE SET param_value = ?4, last_update_time = ?5
            "#,
            params![external_id, node_group_id, key, value, now],
        )?;
        self.refresh(conn)
    }

    fn lookup(&self, name: &str) -> Option<String> {
        self.parameters
            .read()
            .ok()
            .and_then(|parameters| parameters.get(name).cloned())
            .filter(|v| !v.trim().is_empty())
    }

    pub fn get_string(&self, name: &str, default: &str) -> String {
        self.lookup(name).unwrap_or_else(|| default.to_string())
    }

    pub fn get_long(&self, name: &str, default: i64) -> i64 {
        self.lookup(name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn get_int(&self, name: &str, default: i32) -> i32 {
        self.lookup(name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Boolean parameter; accepts true/false, 1/0 and yes/no
    pub fn is(&self, name: &str, default: bool) -> bool {
        match self.lookup(name).map(|v| v.trim().to_lowercase()) {
            Some(v) if v == "true" || v == "1" || v == "yes" => true,
            Some(v) if v == "false" || v == "0" || v == "no" => false,
            _ => default,
        }
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    pub fn node_group_id(&self) -> &str {
        &self.node_group_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::create_sym_tables;

    fn service() -> (Connection, ParameterService) {
        let conn = Connection::open_in_memory().unwrap();
        create_sym_tables(&conn).unwrap();
        let mut file = HashMap::new();
        file.insert(NUM_OF_ACK_RETRIES.to_string(), "3".to_string());
        file.insert(INCOMING_BATCHES_RECORD_OK.to_string(), "false".to_string());
        (conn, ParameterService::new("store-1", "store", file))
    }

    #[test]
    fn test_defaults_and_file_values() {
        let (_conn, params) = service();
        assert_eq!(params.get_int(NUM_OF_ACK_RETRIES, 5), 3);
        assert!(!params.is(INCOMING_BATCHES_RECORD_OK, true));
        assert_eq!(params.get_long(TIME_BETWEEN_ACK_RETRIES, 5000), 5000);
        assert_eq!(params.get_string("missing", "x"), "x");
    }

    #[test]
    fn test_database_rows_override_file() {
        let (conn, params) = service();
        params
            .save_parameter(&conn, ALL, ALL, NUM_OF_ACK_RETRIES, "7")
            .unwrap();
        assert_eq!(params.get_int(NUM_OF_ACK_RETRIES, 5), 7);

        params
            .save_parameter(&conn, "store-1", ALL, NUM_OF_ACK_RETRIES, "9")
            .unwrap();
        assert_eq!(params.get_int(NUM_OF_ACK_RETRIES, 5), 9);

        params
            .save_parameter(&conn, "other", ALL, NUM_OF_ACK_RETRIES, "11")
            .unwrap();
        assert_eq!(params.get_int(NUM_OF_ACK_RETRIES, 5), 9);
    }

    #[test]
    fn test_boolean_spellings() {
        let (conn, params) = service();
        params.save_parameter(&conn, ALL, ALL, "flag", "YES").unwrap();
        assert!(params.is("flag", false));
        params.save_parameter(&conn, ALL, ALL, "flag", "maybe").unwrap();
        assert!(params.is("flag", true));
        assert!(!params.is("flag", false));
    }
}
