//! Configuration file support for nlad
//!
//! Loads and validates nlad configuration from TOML files.
//! Default location: /etc/nla/nlad.conf
//!
//! The node role is decided once from the node id and the presence of a
//! master address, see [`NladConfig::role`].

use crate::api::SessionTimeouts;
use crate::error::{NladError, Result};
use nla_msg::NodeId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/nla/nlad.conf";

/// Node identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node id, 0 for the aggregator
    #[serde(default)]
    pub nid: u8,
}

/// Addresses and capture sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NlaConfig {
    /// Listen address for slave connections (master only)
    #[serde(default = "default_core_addr")]
    pub core: String,

    /// Listen address for external subscribers (master only)
    #[serde(default = "default_api_addr")]
    pub api: String,

    /// Master core address; its presence makes this node a slave
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,

    /// Depth of the raw datagram queue between socket reader and parser
    #[serde(default = "default_recv_chan_size")]
    pub recv_chan_size: usize,

    /// Kernel socket receive buffer in bytes
    #[serde(default = "default_recv_sock_buf")]
    pub recv_sock_buf: usize,
}

/// Node manager queues
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Depth of each of the local and API envelope queues
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

/// Cluster API tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Fixed delay between reconnection attempts in milliseconds
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,

    /// Per-subscriber envelope buffer
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// Consecutive overflows after which a subscriber is disconnected
    #[serde(default = "default_max_overflows")]
    pub max_overflows: u32,

    /// Maximum number of concurrent subscribers
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers: usize,

    /// Depth of the slave's outbound queue to the master
    #[serde(default = "default_forward_queue")]
    pub forward_queue: usize,

    /// Ask the capture source for a kernel dump after each (re)connection
    #[serde(default)]
    pub resync_on_connect: bool,

    /// TCP connect to the master in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Hello/Welcome exchange in milliseconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Time a single frame write may block on a slow peer in milliseconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Interval between slave pings in milliseconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a peer is dropped in milliseconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
}

/// Prometheus endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve `/metrics` over HTTP
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

/// Capture source options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Capture local kernel events; an aggregator-only master may turn it off
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Request link/addr/neigh/route dumps at startup
    #[serde(default = "default_true")]
    pub dump_on_start: bool,
}

/// Logging options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Complete nlad configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NladConfig {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub nla: NlaConfig,

    #[serde(default)]
    pub manager: ManagerConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// Role of this process in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Aggregator: merges every node's stream and serves it
    Master,
    /// Forwarder: captures locally and streams to the master
    Slave { master_addr: String },
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Slave { .. } => "slave",
        }
    }
}

// Default functions
fn default_core_addr() -> String {
    "0.0.0.0:50061".to_string()
}

fn default_api_addr() -> String {
    "0.0.0.0:50062".to_string()
}

fn default_recv_chan_size() -> usize {
    65536
}

fn default_recv_sock_buf() -> usize {
    1024 * 1024
}

fn default_queue_size() -> usize {
    4096
}

fn default_retry_interval() -> u64 {
    1000
}

fn default_subscriber_buffer() -> usize {
    1024
}

fn default_max_overflows() -> u32 {
    64
}

fn default_max_subscribers() -> usize {
    100
}

fn default_forward_queue() -> usize {
    4096
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_handshake_timeout() -> u64 {
    10_000
}

fn default_write_timeout() -> u64 {
    5000
}

fn default_heartbeat_interval() -> u64 {
    1000
}

fn default_idle_timeout() -> u64 {
    5000
}

fn default_metrics_listen() -> String {
    "127.0.0.1:9102".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations
impl Default for NlaConfig {
    fn default() -> Self {
        Self {
            core: default_core_addr(),
            api: default_api_addr(),
            master: None,
            recv_chan_size: default_recv_chan_size(),
            recv_sock_buf: default_recv_sock_buf(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval(),
            subscriber_buffer: default_subscriber_buffer(),
            max_overflows: default_max_overflows(),
            max_subscribers: default_max_subscribers(),
            forward_queue: default_forward_queue(),
            resync_on_connect: false,
            connect_timeout_ms: default_connect_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            write_timeout_ms: default_write_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            idle_timeout_ms: default_idle_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            listen: default_metrics_listen(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            dump_on_start: default_true(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl NladConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).map_err(|e| {
                NladError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(NladError::Io(e)),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| NladError::Config(e.to_string()))
    }

    pub fn nid(&self) -> NodeId {
        NodeId(self.node.nid)
    }

    /// Decides the role: nid 0 without a master address is the master, any
    /// other nid with a master address is a slave.
    pub fn role(&self) -> Result<Role> {
        let nid = self.nid();
        match (&self.nla.master, nid.is_master()) {
            (None, true) => Ok(Role::Master),
            (Some(addr), false) => Ok(Role::Slave {
                master_addr: addr.clone(),
            }),
            (Some(_), true) => Err(NladError::Config(
                "nid 0 is reserved for the master and cannot dial a master".to_string(),
            )),
            (None, false) => Err(NladError::Config(format!(
                "nid {} requires a master address",
                nid
            ))),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.nid().is_all() {
            return Err(NladError::Config("nid 255 is reserved".to_string()));
        }

        self.role()?;

        if self.nla.recv_chan_size == 0 || self.manager.queue_size == 0 {
            return Err(NladError::Config("queue sizes must be > 0".to_string()));
        }

        if self.api.subscriber_buffer == 0 || self.api.forward_queue == 0 {
            return Err(NladError::Config("api buffers must be > 0".to_string()));
        }

        if self.api.max_subscribers == 0 {
            return Err(NladError::Config("max_subscribers must be > 0".to_string()));
        }

        let timeouts = [
            self.api.connect_timeout_ms,
            self.api.handshake_timeout_ms,
            self.api.write_timeout_ms,
            self.api.heartbeat_interval_ms,
            self.api.idle_timeout_ms,
        ];
        if timeouts.contains(&0) {
            return Err(NladError::Config("api timeouts must be > 0".to_string()));
        }

        if self.api.idle_timeout_ms <= self.api.heartbeat_interval_ms {
            return Err(NladError::Config(
                "idle_timeout_ms must exceed heartbeat_interval_ms".to_string(),
            ));
        }

        Ok(())
    }

    /// Get retry interval as Duration
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.api.retry_interval_ms)
    }

    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            connect: Duration::from_millis(self.api.connect_timeout_ms),
            handshake: Duration::from_millis(self.api.handshake_timeout_ms),
            write: Duration::from_millis(self.api.write_timeout_ms),
            heartbeat: Duration::from_millis(self.api.heartbeat_interval_ms),
            idle: Duration::from_millis(self.api.idle_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = NladConfig::default();
        assert_eq!(config.node.nid, 0);
        assert_eq!(config.nla.recv_chan_size, 65536);
        assert_eq!(config.nla.recv_sock_buf, 1024 * 1024);
        assert_eq!(config.api.max_subscribers, 100);
        assert!(config.capture.dump_on_start);
        assert!(!config.api.resync_on_connect);
    }

    #[test]
    fn test_role_master() {
        let config = NladConfig::default();
        assert_eq!(config.role().unwrap(), Role::Master);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_role_slave() {
        let config = NladConfig::from_toml(
            r#"
[node]
nid = 3

[nla]
master = "192.168.0.1:50061"
"#,
        )
        .unwrap();
        assert_eq!(
            config.role().unwrap(),
            Role::Slave {
                master_addr: "192.168.0.1:50061".to_string()
            }
        );
    }

    #[test]
    fn test_role_inconsistent() {
        let mut config = NladConfig::default();
        config.nla.master = Some("10.0.0.1:50061".to_string());
        assert!(config.role().is_err());

        let mut config = NladConfig::default();
        config.node.nid = 2;
        assert!(config.role().is_err());
    }

    #[test]
    fn test_validate_reserved_nid() {
        let mut config = NladConfig::default();
        config.node.nid = 255;
        config.nla.master = Some("10.0.0.1:50061".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_queue() {
        let mut config = NladConfig::default();
        config.manager.queue_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_session_timeouts() {
        let config = NladConfig::default();
        assert_eq!(config.session_timeouts(), SessionTimeouts::default());
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.listen, "127.0.0.1:9102");
    }

    #[test]
    fn test_validate_idle_must_exceed_heartbeat() {
        let mut config = NladConfig::default();
        config.api.idle_timeout_ms = config.api.heartbeat_interval_ms;
        assert!(config.validate().is_err());

        let mut config = NladConfig::default();
        config.api.write_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_interval_duration() {
        let config = NladConfig::default();
        assert_eq!(config.retry_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[node]
nid = 0

[nla]
core = "127.0.0.1:0"
recv_sock_buf = 2097152

[api]
subscriber_buffer = 16
"#
        )
        .unwrap();

        let config = NladConfig::load_or_default(file.path()).unwrap();
        assert_eq!(config.nla.core, "127.0.0.1:0");
        assert_eq!(config.nla.recv_sock_buf, 2097152);
        assert_eq!(config.api.subscriber_buffer, 16);
        // Unspecified values should use defaults
        assert_eq!(config.api.max_overflows, 64);
    }

    #[test]
    fn test_load_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[node]\nnid = \"three\"").unwrap();
        assert!(NladConfig::load_or_default(file.path()).is_err());
    }

    #[test]
    fn test_load_nonexistent_file_defaults() {
        let config = NladConfig::load_or_default("/nonexistent/nlad.conf").unwrap();
        assert_eq!(config.nla.api, "0.0.0.0:50062");
    }
}
