/// Heartbeat probing and node state tracking
use crate::core::{DataSourceConfiguration, NodeAttribute, NodeState};
use crate::error::{DbResult, SqlXError, SqlXResult};
use crate::proxy::{ConnectionFactory, StatementKind};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Outcome of one heartbeat
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
    /// Nothing to probe, e.g. no heartbeat SQL configured
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
            HealthStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// The error a failed heartbeat of `data_source` stands for
    pub fn failure(&self, data_source: &str) -> Option<SqlXError> {
        match self {
            HealthStatus::Unhealthy { reason } => {
                Some(SqlXError::database(format!("heartbeat of {} failed: {}", data_source, reason)))
            }
            HealthStatus::Timeout => Some(SqlXError::timeout(format!("heartbeat of {}", data_source))),
            HealthStatus::Healthy | HealthStatus::Unknown => None,
        }
    }
}

/// Checks whether a data source answers
#[async_trait]
pub trait HeartbeatProbe: Send + Sync {
    async fn probe(&self, data_source: &DataSourceConfiguration) -> HealthStatus;
}

/// Runs the data source's heartbeat SQL over a fresh physical connection
pub struct ConnectionFactoryProbe {
    factory: Arc<dyn ConnectionFactory>,
}

impl ConnectionFactoryProbe {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl HeartbeatProbe for ConnectionFactoryProbe {
    async fn probe(&self, data_source: &DataSourceConfiguration) -> HealthStatus {
        let Some(sql) = data_source.node_attribute().heartbeat_sql().map(str::to_string) else {
            return HealthStatus::Unknown;
        };
        let factory = Arc::clone(&self.factory);
        let data_source = data_source.clone();
        let outcome = tokio::task::spawn_blocking(move || heartbeat(factory.as_ref(), &data_source, &sql)).await;
        match outcome {
            Ok(Ok(())) => HealthStatus::Healthy,
            Ok(Err(e)) => HealthStatus::Unhealthy { reason: e.to_string() },
            Err(e) => HealthStatus::Unhealthy {
                reason: format!("heartbeat task failed: {}", e),
            },
        }
    }
}

fn heartbeat(factory: &dyn ConnectionFactory, data_source: &DataSourceConfiguration, sql: &str) -> DbResult<()> {
    let mut connection = factory.connect(data_source, None)?;
    let executed = connection
        .create_statement(StatementKind::Plain, None)
        .and_then(|mut statement| {
            let result = statement.execute(Some(sql)).map(|_| ());
            if let Err(e) = statement.close() {
                debug!("closing heartbeat statement on {}: {}", data_source.name, e);
            }
            result
        });
    let closed = connection.close();
    executed.and(closed)
}

async fn probe_with_timeout(
    probe: &dyn HeartbeatProbe,
    limit: Duration,
    data_source: &DataSourceConfiguration,
) -> HealthStatus {
    match timeout(limit, probe.probe(data_source)).await {
        Ok(status) => status,
        Err(_) => HealthStatus::Timeout,
    }
}

/// Move the node between UP and DOWN; OUT_OF_SERVICE is left to the operator
fn apply(node: &NodeAttribute, status: &HealthStatus) {
    let current = node.state();
    if current == NodeState::OutOfService {
        return;
    }
    if status.is_healthy() && current != NodeState::Up {
        node.set_state(NodeState::Up);
        info!("node {} is UP (was {})", node.name(), current);
    } else if let Some(failure) = status.failure(node.name()) {
        if current != NodeState::Down {
            node.set_state(NodeState::Down);
            error!("node {} is DOWN: {}", node.name(), failure);
        }
    }
}

/// Periodic heartbeat per data source, driving `NodeAttribute` state
pub struct NodeStateMonitor {
    probe: Arc<dyn HeartbeatProbe>,
    timeout: Duration,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl NodeStateMonitor {
    pub fn new(probe: Arc<dyn HeartbeatProbe>, timeout: Duration) -> Self {
        Self {
            probe,
            timeout,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe once and update the node state
    pub async fn check(&self, data_source: &DataSourceConfiguration) -> HealthStatus {
        let status = probe_with_timeout(self.probe.as_ref(), self.timeout, data_source).await;
        apply(&data_source.node_attribute(), &status);
        status
    }

    pub async fn check_all(&self, data_sources: &[Arc<DataSourceConfiguration>]) -> Vec<(String, HealthStatus)> {
        let checks = data_sources.iter().map(|ds| async move { (ds.name.clone(), self.check(ds).await) });
        join_all(checks).await
    }

    /// Start the periodic heartbeat for `data_source`.
    ///
    /// Returns false when it is already monitored or has no heartbeat SQL.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, data_source: &DataSourceConfiguration) -> SqlXResult<bool> {
        let node = data_source.node_attribute();
        if node.heartbeat_sql().is_none() {
            warn!("data source {} has no heartbeat sql, not monitored", data_source.name);
            return Ok(false);
        }
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&data_source.name) {
            return Ok(false);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SqlXError::internal(format!("node monitor needs a tokio runtime: {}", e)))?;

        let probe = Arc::clone(&self.probe);
        let limit = self.timeout;
        let period = node.heartbeat_interval();
        let data_source = data_source.clone();
        let name = data_source.name.clone();
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let status = probe_with_timeout(probe.as_ref(), limit, &data_source).await;
                debug!("heartbeat {}: {}", data_source.name, status);
                apply(&node, &status);
            }
        });
        debug!("monitoring {} every {:?}", name, period);
        tasks.insert(name, task);
        Ok(true)
    }

    pub fn stop(&self, name: &str) -> bool {
        match self.tasks.lock().remove(name) {
            Some(task) => {
                task.abort();
                debug!("stopped monitoring {}", name);
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
    }

    pub fn is_monitoring(&self, name: &str) -> bool {
        self.tasks.lock().contains_key(name)
    }

    pub fn monitored(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Drop for NodeStateMonitor {
    fn drop(&mut self) {
        self.stop_all();
    }
}
