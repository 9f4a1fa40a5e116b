//! SymSync Configuration
//!
//! This module provides configuration structures for a SymSync node:
//! its identity in the mesh, the local database, job scheduling,
//! the operator API, logging and free-form sync parameters.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::model::{NodeGroupLink, NodeGroupLinkAction};

/// Main SymSync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Node identity configuration
    pub node: NodeConfig,

    /// Local database configuration
    pub database: DatabaseConfig,

    /// Job scheduling configuration
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Operator API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Sync parameters (SymmetricDS parameter keys)
    #[serde(default)]
    pub parameters: HashMap<String, String>,

    /// Known remote nodes, seeded into sym_node at startup
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Node group links, seeded into sym_node_group_link at startup
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

/// A remote node this node talks to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: String,

    pub group_id: String,

    /// External id (defaults to the node id)
    #[serde(default)]
    pub external_id: Option<String>,

    /// Base URL of the peer's sync endpoints
    #[serde(default)]
    pub sync_url: Option<String>,

    /// Password the peer presents when it calls this node
    #[serde(default)]
    pub password: Option<String>,
}

/// Link between two node groups
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub source_group_id: String,

    pub target_group_id: String,

    /// `W` (wait for pull), `P` (push) or `R` (route only)
    #[serde(default = "default_link_action")]
    pub action: String,
}

impl LinkConfig {
    pub fn to_link(&self) -> crate::Result<NodeGroupLink> {
        let action = NodeGroupLinkAction::from_code(&self.action).ok_or_else(|| {
            crate::Error::Config(format!(
                "link {} -> {} has unknown action '{}'",
                self.source_group_id, self.target_group_id, self.action
            ))
        })?;
        Ok(NodeGroupLink::new(
            self.source_group_id.clone(),
            self.target_group_id.clone(),
            action,
        ))
    }
}

/// Node identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Engine name used in logs
    #[serde(default = "default_engine_name")]
    pub engine_name: String,

    /// Node group this node belongs to
    pub group_id: String,

    /// External id of this node
    pub external_id: String,

    /// Node id (defaults to the external id)
    #[serde(default)]
    pub node_id: Option<String>,

    /// URL other nodes use to reach this node
    #[serde(default)]
    pub sync_url: Option<String>,

    /// URL of the registration server
    pub registration_url: String,

    /// Password presented to remote nodes
    #[serde(default)]
    pub node_password: Option<String>,

    /// Data directory for local state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Local database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file
    pub path: PathBuf,

    /// Busy timeout in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// Job scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_true")]
    pub sync_triggers_enabled: bool,

    #[serde(default = "default_sync_triggers_period_ms")]
    pub sync_triggers_period_ms: u64,

    #[serde(default = "default_true")]
    pub route_enabled: bool,

    #[serde(default = "default_route_period_ms")]
    pub route_period_ms: u64,

    #[serde(default = "default_true")]
    pub push_enabled: bool,

    #[serde(default = "default_push_period_ms")]
    pub push_period_ms: u64,

    #[serde(default = "default_true")]
    pub pull_enabled: bool,

    #[serde(default = "default_pull_period_ms")]
    pub pull_period_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable operator HTTP API
    #[serde(default)]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_engine_name() -> String {
    "symsync".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/symsync")
}

fn default_busy_timeout_ms() -> u64 {
    30_000
}

fn default_sync_triggers_period_ms() -> u64 {
    300_000
}

fn default_route_period_ms() -> u64 {
    10_000
}

fn default_push_period_ms() -> u64 {
    60_000
}

fn default_pull_period_ms() -> u64 {
    60_000
}

fn default_link_action() -> String {
    "W".to_string()
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "127.0.0.1:31415".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            sync_triggers_enabled: true,
            sync_triggers_period_ms: default_sync_triggers_period_ms(),
            route_enabled: true,
            route_period_ms: default_route_period_ms(),
            push_enabled: true,
            push_period_ms: default_push_period_ms(),
            pull_enabled: true,
            pull_period_ms: default_pull_period_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.group_id.trim().is_empty() {
            return Err(crate::Error::Config("node.group_id cannot be empty".into()));
        }

        if self.node.external_id.trim().is_empty() {
            return Err(crate::Error::Config("node.external_id cannot be empty".into()));
        }

        if self.node.registration_url.trim().is_empty() {
            return Err(crate::Error::Config(
                "node.registration_url cannot be empty".into(),
            ));
        }

        if self.database.path.as_os_str().is_empty() {
            return Err(crate::Error::Config("database.path cannot be empty".into()));
        }

        for peer in &self.peers {
            if peer.node_id.trim().is_empty() || peer.group_id.trim().is_empty() {
                return Err(crate::Error::Config(
                    "peers need a node_id and a group_id".into(),
                ));
            }
        }

        for link in &self.links {
            link.to_link()?;
        }

        Ok(())
    }

    /// Node id of this node
    pub fn node_id(&self) -> &str {
        self.node
            .node_id
            .as_deref()
            .unwrap_or(&self.node.external_id)
    }

    /// Sync URL advertised by this node (or the registration URL if not set)
    pub fn sync_url(&self) -> &str {
        self.node
            .sync_url
            .as_deref()
            .unwrap_or(&self.node.registration_url)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get busy timeout as Duration
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.database.busy_timeout_ms)
    }

    /// Render a starter configuration file
    pub fn template(node_id: &str, group_id: &str, registration_url: &str) -> String {
        format!(
            r#"# SymSync Configuration

[node]
engine_name = "{node_id}"
group_id = "{group_id}"
external_id = "{node_id}"
registration_url = "{registration_url}"
data_dir = "/var/lib/symsync"

[database]
path = "/var/lib/symsync/{node_id}.sqlite"

[jobs]
route_period_ms = 10000
push_period_ms = 60000
pull_period_ms = 60000

[api]
enabled = false
bind_address = "127.0.0.1:31415"

[logging]
level = "info"
format = "pretty"

[parameters]
"incoming.batches.record.ok.enabled" = "true"
"num.of.ack.retries" = "5"

# [[peers]]
# node_id = "000"
# group_id = "corp"
# sync_url = "http://central:31415/sync"

# [[links]]
# source_group_id = "corp"
# target_group_id = "{group_id}"
# action = "W"
"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
group_id = "store"
external_id = "001"
registration_url = "http://central:31415/sync/corp"

[database]
path = "/tmp/store-001.sqlite"

[jobs]
push_period_ms = 5000

[parameters]
"incoming.batches.record.ok.enabled" = "false"
"#;

        let config = SyncConfig::from_str(toml).unwrap();
        assert_eq!(config.node_id(), "001");
        assert_eq!(config.jobs.push_period_ms, 5000);
        assert_eq!(config.jobs.pull_period_ms, 60_000);
        assert_eq!(
            config.parameters.get("incoming.batches.record.ok.enabled"),
            Some(&"false".to_string())
        );
        assert_eq!(config.sync_url(), "http://central:31415/sync/corp");
    }

    #[test]
    fn test_missing_registration_url_fails() {
        let toml = r#"
[node]
group_id = "store"
external_id = "001"
registration_url = " "

[database]
path = "/tmp/store-001.sqlite"
"#;

        let err = SyncConfig::from_str(toml).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_peers_and_links() {
        let toml = r#"
[node]
group_id = "store"
external_id = "001"
registration_url = "http://central:31415/sync"

[database]
path = "/tmp/store-001.sqlite"

[[peers]]
node_id = "000"
group_id = "corp"
sync_url = "http://central:31415/sync"

[[links]]
source_group_id = "corp"
target_group_id = "store"

[[links]]
source_group_id = "store"
target_group_id = "corp"
action = "P"
"#;
        let config = SyncConfig::from_str(toml).unwrap();
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].external_id, None);
        let pull = config.links[0].to_link().unwrap();
        assert_eq!(pull.data_event_action, NodeGroupLinkAction::WaitForPull);
        let push = config.links[1].to_link().unwrap();
        assert_eq!(push.data_event_action, NodeGroupLinkAction::Push);

        let bad = toml.replace("action = \"P\"", "action = \"X\"");
        assert!(matches!(SyncConfig::from_str(&bad), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_template_parses() {
        let rendered = SyncConfig::template("001", "store", "http://central/sync/corp");
        let config = SyncConfig::from_str(&rendered).unwrap();
        assert_eq!(config.node.group_id, "store");
        assert!(!config.api.enabled);
    }
}
