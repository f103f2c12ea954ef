/// sqlx-router - read/write splitting and load balancing for database connections
///
/// Applications obtain a `ProxyConnection` from `SqlXDataSource`. The
/// connection stays unbound until its first statement, which is classified,
/// routed through the cluster's rule chain and balancers, and bound to one
/// physical connection for the rest of its life. The topology can be changed
/// at runtime; every change is validated on a draft and either published
/// atomically or rolled back.
pub mod balancer;
pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod listener;
pub mod proxy;
pub mod routing;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

use crate::config::Config;
use crate::core::{
    ClusterConfiguration, DataSourceConfiguration, NodeAttribute, NodeState, PointcutConfiguration, SqlXConfiguration,
};
use crate::error::{SqlXError, SqlXResult};
use crate::health::{ConnectionFactoryProbe, NodeStateMonitor};
use crate::listener::{CompositeEventListener, EventListener, LoggingEventListener};
use crate::proxy::connection::ConnectionContext;
use crate::proxy::{ConnectionFactory, Credentials, ProxyConnection};
use crate::routing::{Router, RoutingAttribute, RoutingSettings, SimpleSqlClassifier, SqlClassifier, StickyWritePolicy};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Entry point handing out routed logical connections
pub struct SqlXDataSource {
    configuration: Arc<SqlXConfiguration>,
    factory: Arc<dyn ConnectionFactory>,
    classifier: Arc<dyn SqlClassifier>,
    settings: RoutingSettings,
    listener: Arc<CompositeEventListener>,
    router: Arc<Router>,
    monitor: Option<Arc<NodeStateMonitor>>,
}

impl SqlXDataSource {
    pub fn new(configuration: Arc<SqlXConfiguration>, factory: Arc<dyn ConnectionFactory>) -> Self {
        let classifier: Arc<dyn SqlClassifier> = Arc::new(SimpleSqlClassifier::new());
        let settings = RoutingSettings::default();
        let router = Arc::new(Router::new(
            Arc::clone(&configuration),
            Arc::clone(&classifier),
            settings.sql_parsing_fail_behavior,
        ));
        Self {
            configuration,
            factory,
            classifier,
            settings,
            listener: Arc::new(CompositeEventListener::default()),
            router,
            monitor: None,
        }
    }

    /// Build the topology from `config`, keeping its routing settings.
    ///
    /// Lifecycle events are logged through `LoggingEventListener`; statements
    /// are included at `debug` and `trace` levels. With `heartbeat_enabled`
    /// the node monitor is installed, and started right away when called
    /// inside a tokio runtime. Otherwise call `start_monitoring` later.
    pub fn from_config(config: Config, factory: Arc<dyn ConnectionFactory>) -> SqlXResult<Self> {
        let settings = config.routing.clone();
        let log_sql = matches!(config.logging.level.as_str(), "debug" | "trace");
        let configuration = Arc::new(config.into_configuration()?);
        let heartbeat_enabled = settings.heartbeat_enabled;
        let mut data_source = Self::new(configuration, factory)
            .with_settings(settings)
            .with_listener(Arc::new(LoggingEventListener::new(log_sql)));

        if heartbeat_enabled {
            data_source = data_source.with_heartbeat();
            if tokio::runtime::Handle::try_current().is_ok() {
                data_source.start_monitoring()?;
            } else {
                info!("no tokio runtime, heartbeat waits for start_monitoring");
            }
        }
        Ok(data_source)
    }

    fn rebuild_router(&mut self) {
        self.router = Arc::new(Router::new(
            Arc::clone(&self.configuration),
            Arc::clone(&self.classifier),
            self.settings.sql_parsing_fail_behavior,
        ));
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn SqlClassifier>) -> Self {
        self.classifier = classifier;
        self.rebuild_router();
        self
    }

    pub fn with_settings(mut self, settings: RoutingSettings) -> Self {
        self.settings = settings;
        self.rebuild_router();
        self
    }

    pub fn with_sticky_write_policy(mut self, policy: StickyWritePolicy) -> Self {
        self.settings.sticky_write_policy = policy;
        self
    }

    /// Register a listener after the ones already present
    pub fn with_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        let mut composite = CompositeEventListener::clone(&self.listener);
        composite.add(listener);
        self.listener = Arc::new(composite);
        self
    }

    pub fn with_node_monitor(mut self, monitor: Arc<NodeStateMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Heartbeat every data source through the connection factory
    pub fn with_heartbeat(self) -> Self {
        let probe = Arc::new(ConnectionFactoryProbe::new(Arc::clone(&self.factory)));
        let timeout = Duration::from_millis(self.settings.heartbeat_timeout_ms);
        self.with_node_monitor(Arc::new(NodeStateMonitor::new(probe, timeout)))
    }

    /// Start heartbeats for every current data source; returns how many were started
    pub fn start_monitoring(&self) -> SqlXResult<usize> {
        let Some(monitor) = &self.monitor else {
            return Ok(0);
        };
        let mut started = 0;
        for data_source in self.configuration.snapshot().data_sources() {
            if monitor.start(data_source)? {
                started += 1;
            }
        }
        info!("heartbeat started for {} data source(s)", started);
        Ok(started)
    }

    pub fn configuration(&self) -> &Arc<SqlXConfiguration> {
        &self.configuration
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn settings(&self) -> &RoutingSettings {
        &self.settings
    }

    pub fn node_monitor(&self) -> Option<&Arc<NodeStateMonitor>> {
        self.monitor.as_ref()
    }

    fn context(&self, credentials: Option<Credentials>) -> ConnectionContext {
        let listener: Arc<dyn EventListener> = self.listener.clone();
        ConnectionContext {
            router: Arc::clone(&self.router),
            factory: Arc::clone(&self.factory),
            listener,
            sticky_write_policy: self.settings.sticky_write_policy,
            credentials,
        }
    }

    /// A new unbound logical connection; nothing is acquired until the first statement
    pub fn get_connection(&self) -> ProxyConnection {
        ProxyConnection::new(self.context(None), None)
    }

    pub fn get_connection_with(&self, credentials: Credentials) -> ProxyConnection {
        ProxyConnection::new(self.context(Some(credentials)), None)
    }

    /// A connection carrying the override of the pointcut matching `target`, if any
    pub fn get_connection_for(&self, target: &str) -> ProxyConnection {
        let routing = self
            .configuration
            .snapshot()
            .pointcut_for(target)
            .map(PointcutConfiguration::routing_attribute);
        ProxyConnection::new(self.context(None), routing)
    }

    pub fn get_connection_routed(&self, routing: RoutingAttribute) -> ProxyConnection {
        ProxyConnection::new(self.context(None), Some(routing))
    }

    /// Check the data source answers, add it to the topology, then start its heartbeat
    pub fn add_data_source(&self, data_source: DataSourceConfiguration) -> SqlXResult<Arc<NodeAttribute>> {
        data_source.validate()?;
        let mut probe = self.factory.connect(&data_source, None).map_err(|e| {
            SqlXError::management(format!("add data source {}", data_source.name), e.into(), false)
        })?;
        if let Err(e) = probe.close() {
            warn!("closing test connection to {}: {}", data_source.name, e);
        }

        let name = data_source.name.clone();
        let node = self.configuration.add_data_source_configuration(data_source)?;
        if let Some(monitor) = &self.monitor {
            let snapshot = self.configuration.snapshot();
            if let Some(added) = snapshot.data_source(&name) {
                if let Err(e) = monitor.start(added) {
                    warn!("heartbeat for {} not started: {}", name, e);
                }
            }
        }
        Ok(node)
    }

    pub fn remove_data_source(&self, name: &str) -> SqlXResult<bool> {
        let removed = self.configuration.remove_data_source_configuration(name)?;
        if removed {
            if let Some(monitor) = &self.monitor {
                monitor.stop(name);
            }
        }
        Ok(removed)
    }

    pub fn add_cluster(&self, cluster: ClusterConfiguration) -> SqlXResult<()> {
        self.configuration.add_cluster_configuration(cluster)
    }

    pub fn remove_cluster(&self, name: &str) -> SqlXResult<bool> {
        self.configuration.remove_cluster_configuration(name)
    }

    pub fn add_node_in_cluster(&self, cluster: &str, node: &str) -> SqlXResult<()> {
        self.configuration.add_node_in_cluster(cluster, node)
    }

    pub fn remove_node_in_cluster(&self, cluster: &str, node: &str) -> SqlXResult<bool> {
        self.configuration.remove_node_in_cluster(cluster, node)
    }

    pub fn add_pointcut(&self, pointcut: PointcutConfiguration) -> SqlXResult<()> {
        self.configuration.add_pointcut(pointcut)
    }

    pub fn remove_pointcut(&self, expression: &str) -> SqlXResult<bool> {
        self.configuration.remove_pointcut(expression)
    }

    pub fn set_node_state(&self, name: &str, state: NodeState) -> SqlXResult<()> {
        self.configuration.set_node_state(name, state)
    }

    pub fn set_node_weight(&self, name: &str, weight: u32) -> SqlXResult<()> {
        self.configuration.set_node_weight(name, weight)
    }

    pub fn cluster(&self, name: &str) -> Option<Arc<ClusterConfiguration>> {
        self.configuration.get_cluster(name)
    }

    pub fn contains_data_source(&self, name: &str) -> bool {
        self.configuration.contains_data_source(name)
    }

    pub fn contains_cluster(&self, name: &str) -> bool {
        self.configuration.contains_cluster(name)
    }

    pub fn topology_version(&self) -> u64 {
        self.configuration.version()
    }
}
