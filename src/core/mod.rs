/// Topology model: nodes, data sources, clusters and the versioned aggregate
pub mod cluster;
pub mod datasource;
pub mod pointcut;
pub mod topology;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

pub use cluster::ClusterConfiguration;
pub use datasource::DataSourceConfiguration;
pub use pointcut::PointcutConfiguration;
pub use topology::{SqlXConfiguration, Topology};

/// Read/write capability class of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Read,
    Write,
    #[default]
    ReadWrite,
    /// Standalone node that must never be grouped into a cluster
    Independent,
}

impl NodeType {
    pub fn can_write(self) -> bool {
        matches!(self, NodeType::Write | NodeType::ReadWrite | NodeType::Independent)
    }

    pub fn can_read(self) -> bool {
        matches!(self, NodeType::Read | NodeType::ReadWrite | NodeType::Independent)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Read => write!(f, "READ"),
            NodeType::Write => write!(f, "WRITE"),
            NodeType::ReadWrite => write!(f, "READ_WRITE"),
            NodeType::Independent => write!(f, "INDEPENDENT"),
        }
    }
}

/// Health state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum NodeState {
    #[default]
    Unknown = 0,
    Up = 1,
    Down = 2,
    OutOfService = 3,
}

impl NodeState {
    /// Only UP and UNKNOWN nodes take traffic
    pub fn is_available(self) -> bool {
        matches!(self, NodeState::Up | NodeState::Unknown)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => NodeState::Up,
            2 => NodeState::Down,
            3 => NodeState::OutOfService,
            _ => NodeState::Unknown,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Unknown => write!(f, "UNKNOWN"),
            NodeState::Up => write!(f, "UP"),
            NodeState::Down => write!(f, "DOWN"),
            NodeState::OutOfService => write!(f, "OUT_OF_SERVICE"),
        }
    }
}

/// One physical database endpoint.
///
/// Identity (name, url, type) is fixed at construction. Weight and state are
/// atomics so the admin layer and the heartbeat monitor can change them while
/// load balancers are choosing.
#[derive(Debug)]
pub struct NodeAttribute {
    name: String,
    url: String,
    database_type: String,
    node_type: NodeType,
    weight: AtomicU32,
    state: AtomicU8,
    heartbeat_sql: Option<String>,
    heartbeat_interval: Duration,
}

impl NodeAttribute {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        node_type: NodeType,
        weight: u32,
    ) -> Self {
        let url = url.into();
        let database_type = crate::utils::database_type_of(&url).unwrap_or_default();
        Self {
            name: name.into(),
            url,
            database_type,
            node_type,
            weight: AtomicU32::new(weight),
            state: AtomicU8::new(NodeState::Unknown as u8),
            heartbeat_sql: None,
            heartbeat_interval: Duration::from_millis(datasource::DEFAULT_HEARTBEAT_INTERVAL_MS),
        }
    }

    pub fn with_heartbeat(mut self, sql: Option<String>, interval: Duration) -> Self {
        self.heartbeat_sql = sql;
        self.heartbeat_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn database_type(&self) -> &str {
        &self.database_type
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Ordering::Relaxed);
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: NodeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_available(&self) -> bool {
        self.state().is_available()
    }

    pub fn heartbeat_sql(&self) -> Option<&str> {
        self.heartbeat_sql.as_deref()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }
}

impl PartialEq for NodeAttribute {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for NodeAttribute {}

impl fmt::Display for NodeAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}, weight={}, {}]",
            self.name,
            self.node_type,
            self.weight(),
            self.state()
        )
    }
}
