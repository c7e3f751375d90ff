use std::{collections::HashMap, path::Path};

use lattice_net::DispatchPolicy;
use lattice_proto::CodecKind;
use lattice_timing::Micros;
use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::error::CoreError;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// tracing env-filter directive, e.g. "info" or "lattice=debug".
    pub level: String,
    /// Log file path; stdout when absent.
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".into(), file: None }
    }
}

/// One network node: ourselves or a configured upstream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub server_type: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    #[serde(default = "default_true")]
    pub is_primary: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[default]
    Millisecond,
    Second,
}

impl TimeUnit {
    pub fn to_millis(self, value: u64) -> u64 {
        match self {
            TimeUnit::Millisecond => value,
            TimeUnit::Second => value * 1_000,
        }
    }
}

/// Periods of the built-in timed tasks, in the configured time unit.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Intervals {
    pub message_clean: u64,
    pub session_clean: u64,
    pub heartbeat: u64,
    pub log_flushing: u64,
}

impl Default for Intervals {
    fn default() -> Self {
        Self { message_clean: 1_000, session_clean: 1_000, heartbeat: 1_000, log_flushing: 1_000 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Timeouts {
    pub default_message_processing: Micros,
    pub max_message_processing: Micros,
    pub session_keeping: Micros,
    pub default_waiting_for_peer_reply: Micros,
    pub longest_waiting_for_peer_reply: Micros,
    pub connect_trying: Micros,
    pub poll_waiting: Micros,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            default_message_processing: Micros::from_secs(10),
            max_message_processing: Micros::from_secs(120),
            session_keeping: Micros::from_secs(600),
            default_waiting_for_peer_reply: Micros::from_secs(5),
            longest_waiting_for_peer_reply: Micros::from_secs(30),
            connect_trying: Micros::from_secs(3),
            poll_waiting: Micros::from_millis(2),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TimedTaskSettings {
    pub time_unit: TimeUnit,
    pub intervals: Intervals,
    pub timeouts: Timeouts,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BufferSizes {
    pub tcp_send: usize,
    pub tcp_receive: usize,
}

impl Default for BufferSizes {
    fn default() -> Self {
        Self { tcp_send: 64 * 1024, tcp_receive: 64 * 1024 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Counters {
    pub message_processing_per_round: usize,
    pub forward_retries_on_failure: usize,
    /// Parsed for compatibility; the core stays single-threaded.
    pub worker_thread: usize,
}

impl Default for Counters {
    fn default() -> Self {
        Self { message_processing_per_round: 100, forward_retries_on_failure: 3, worker_thread: 0 }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub policy: DispatchPolicy,
}

/// What the secondary connection cache is for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SecondaryMode {
    /// Unicast picks fall through to the secondary only when the primary
    /// has nothing alive.
    #[default]
    Failover,
    /// Fan-out walks both caches.
    Fanout,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    pub self_node: NodeConfig,
    /// Whether this node opens a listener for inbound peers.
    #[serde(default = "default_true")]
    pub accepts_clients: bool,
    #[serde(default)]
    pub upstreams: Vec<NodeConfig>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub timed_task_settings: TimedTaskSettings,
    #[serde(default)]
    pub buffer_settings: BufferSizes,
    #[serde(default)]
    pub counters: Counters,
    #[serde(default)]
    pub dispatch_settings: DispatchConfig,
    #[serde(default)]
    pub secondary_mode: SecondaryMode,
    #[serde(default)]
    pub body_codec: CodecKind,
    /// Numeric wire value of each server type, used by the identity
    /// exchange.
    #[serde(default)]
    pub server_types: HashMap<String, u32>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("open {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| CoreError::Config(format!("parse {}: {e}", path.display())))
    }

    /// Minimal standalone config; tests and examples start from this.
    pub fn for_node(server_type: &str, name: &str, ip: &str, port: u16) -> Self {
        Self {
            log: LogConfig::default(),
            self_node: NodeConfig {
                server_type: server_type.into(),
                name: name.into(),
                ip: ip.into(),
                port,
                is_primary: true,
            },
            accepts_clients: true,
            upstreams: Vec::new(),
            timezone: None,
            timed_task_settings: TimedTaskSettings::default(),
            buffer_settings: BufferSizes::default(),
            counters: Counters::default(),
            dispatch_settings: DispatchConfig::default(),
            secondary_mode: SecondaryMode::default(),
            body_codec: CodecKind::default(),
            server_types: HashMap::new(),
        }
    }

    /// Numeric type value this node reports during the identity exchange.
    pub fn self_type_value(&self) -> u32 {
        self.server_types.get(&self.self_node.server_type).copied().unwrap_or(0)
    }

    /// Reverse lookup for identity requests carrying a numeric type.
    pub fn type_name_for(&self, value: u32) -> Option<&str> {
        self.server_types
            .iter()
            .find(|(_, v)| **v == value)
            .map(|(k, _)| k.as_str())
    }
}
