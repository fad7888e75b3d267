//! Configuration for the minivol daemon
//!
//! Loaded from an optional TOML file, then `MINIVOL__`-prefixed environment
//! variables (e.g. `MINIVOL__SERVER__MEMBER_NAME=node2`), then CLI overrides.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub migration: MigrationConfig,

    #[serde(default)]
    pub operations: OperationsConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Pools created on first start
    #[serde(default = "default_pools")]
    pub pools: Vec<PoolSeed>,

    /// Projects created on first start (`default` always exists)
    #[serde(default)]
    pub projects: Vec<ProjectSeed>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pools() -> Vec<PoolSeed> {
    vec![PoolSeed {
        name: "default".to_string(),
        driver: "dir".to_string(),
        description: String::new(),
        config: HashMap::new(),
    }]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cluster: ClusterConfig::default(),
            migration: MigrationConfig::default(),
            operations: OperationsConfig::default(),
            auth: AuthConfig::default(),
            pools: default_pools(),
            projects: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

/// Local member configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Cluster member name (unique identifier)
    #[serde(default = "default_member_name")]
    pub member_name: String,

    /// Bind address for the HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// URL other members use to reach this one, e.g. `https://10.0.0.2:8443`
    #[serde(default)]
    pub advertise_url: Option<String>,

    /// Root for the metadata store and node-local pools
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// PEM certificate served to clients and peers
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key matching `tls_cert`
    #[serde(default)]
    pub tls_key: Option<PathBuf>,

    /// Request body limit for binary imports
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_member_name() -> String {
    "none".to_string()
}
fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8443))
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./minivol-data")
}
fn default_max_upload_bytes() -> usize {
    4 * 1024 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            member_name: default_member_name(),
            bind_addr: default_bind_addr(),
            advertise_url: None,
            data_dir: default_data_dir(),
            tls_cert: None,
            tls_key: None,
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// URL this member advertises to the rest of the cluster
    pub fn advertised_url(&self) -> String {
        match &self.advertise_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let scheme = if self.tls_enabled() { "https" } else { "http" };
                format!("{}://{}", scheme, self.bind_addr)
            }
        }
    }
}

/// Seed entry for a peer member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberSeed {
    pub name: String,
    pub url: String,
}

/// Cluster membership configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Seconds without heartbeat before a member counts as offline
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold_secs: u64,

    /// Seconds between heartbeats
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Peers known at startup
    #[serde(default)]
    pub members: Vec<MemberSeed>,

    /// Shared cluster certificate (PEM) used to pin member-to-member TLS
    #[serde(default)]
    pub certificate: Option<PathBuf>,
}

fn default_offline_threshold() -> u64 {
    20
}
fn default_heartbeat_interval() -> u64 {
    10
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            offline_threshold_secs: default_offline_threshold(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            members: Vec::new(),
            certificate: None,
        }
    }
}

impl ClusterConfig {
    pub fn offline_threshold(&self) -> Duration {
        Duration::from_secs(self.offline_threshold_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Migration transport tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// How long a channel waits for its inbound connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Websocket dial and upgrade timeout
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Size of binary frames on the data channel
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_handshake_timeout() -> u64 {
    5
}
fn default_chunk_size() -> usize {
    256 * 1024
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl MigrationConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Operation tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationsConfig {
    /// Seconds a terminal operation stays queryable
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

fn default_retention() -> u64 {
    300
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention(),
        }
    }
}

/// API key entry; only the sha256 of the key is stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeySeed {
    pub name: String,
    pub key_sha256: String,
    #[serde(default)]
    pub role: crate::common::auth::Role,
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub keys: Vec<ApiKeySeed>,
}

/// Storage pool seed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSeed {
    pub name: String,
    /// `dir` (node-local) or `shared` (network-attached)
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default)]
    pub description: String,
    /// Driver config; `source` overrides the backing directory
    #[serde(default)]
    pub config: HashMap<String, String>,
}

fn default_driver() -> String {
    "dir".to_string()
}

/// Project seed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSeed {
    pub name: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

impl Config {
    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MINIVOL")
                .prefix_separator("__")
                .separator("__"),
        );

        let cfg: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Sanity-check values that would otherwise fail late
    pub fn validate(&self) -> Result<()> {
        if self.server.member_name.is_empty() {
            return Err(Error::InvalidConfig("server.member_name is empty".into()));
        }
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            return Err(Error::InvalidConfig(
                "server.tls_cert and server.tls_key must be set together".into(),
            ));
        }
        if self.migration.chunk_size == 0 {
            return Err(Error::InvalidConfig("migration.chunk_size must be > 0".into()));
        }
        for pool in &self.pools {
            if !matches!(pool.driver.as_str(), "dir" | "shared") {
                return Err(Error::InvalidConfig(format!(
                    "pool {:?}: unknown driver {:?}",
                    pool.name, pool.driver
                )));
            }
        }
        if self
            .cluster
            .members
            .iter()
            .any(|m| m.name == self.server.member_name)
        {
            return Err(Error::InvalidConfig(
                "cluster.members must not list the local member".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.migration.connect_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.cluster.offline_threshold(), Duration::from_secs(20));
        assert_eq!(cfg.pools.len(), 1);
        assert_eq!(cfg.server.advertised_url(), "http://127.0.0.1:8443");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[server]
member_name = "node1"
bind_addr = "0.0.0.0:9443"
advertise_url = "https://10.0.0.1:9443/"

[[cluster.members]]
name = "node2"
url = "https://10.0.0.2:9443"

[[pools]]
name = "remote"
driver = "shared"

[[projects]]
name = "web"
config = {{ "features.storage.volumes" = "false" }}
"#
        )
        .unwrap();

        let cfg = Config::load(Some(file.path())).unwrap();
        assert_eq!(cfg.server.member_name, "node1");
        assert_eq!(cfg.server.advertised_url(), "https://10.0.0.1:9443");
        assert_eq!(cfg.cluster.members[0].name, "node2");
        assert_eq!(cfg.pools[0].driver, "shared");
        assert_eq!(
            cfg.projects[0].config.get("features.storage.volumes").map(String::as_str),
            Some("false")
        );
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn test_validate_rejects_unknown_driver() {
        let mut cfg = Config::default();
        cfg.pools[0].driver = "zfs".into();
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_half_tls() {
        let mut cfg = Config::default();
        cfg.server.tls_cert = Some(PathBuf::from("/tmp/cert.pem"));
        assert!(cfg.validate().is_err());
    }
}
