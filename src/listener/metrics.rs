use crate::error::SqlXError;
use crate::listener::{EventListener, ListenerResult};
use crate::proxy::{ConnectionInfo, ExecuteKind, StatementInfo};
use crate::routing::RouteInfo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Counters for one node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeMetrics {
    pub routed: u64,
    pub executions: u64,
    pub failed_executions: u64,
    pub total_execute_time: Duration,
}

/// Point-in-time copy of the collected counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingMetrics {
    pub routing_failures: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub nodes: HashMap<String, NodeMetrics>,
}

impl RoutingMetrics {
    pub fn node(&self, name: &str) -> Option<&NodeMetrics> {
        self.nodes.get(name)
    }

    pub fn total_routed(&self) -> u64 {
        self.nodes.values().map(|n| n.routed).sum()
    }
}

/// In-process routing counters, keyed by node name
#[derive(Debug, Default)]
pub struct RoutingMetricsListener {
    metrics: Mutex<RoutingMetrics>,
}

impl RoutingMetricsListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RoutingMetrics {
        self.metrics.lock().clone()
    }

    pub fn reset(&self) {
        *self.metrics.lock() = RoutingMetrics::default();
    }
}

impl EventListener for RoutingMetricsListener {
    fn on_after_routing(&self, route_info: &RouteInfo, error: Option<&SqlXError>) -> ListenerResult {
        let mut metrics = self.metrics.lock();
        match (&route_info.hit_node_attr, error) {
            (Some(node), None) => metrics.nodes.entry(node.name().to_string()).or_default().routed += 1,
            _ => metrics.routing_failures += 1,
        }
        Ok(())
    }

    fn on_after_execute(&self, statement: &StatementInfo, _kind: ExecuteKind, error: Option<&SqlXError>) -> ListenerResult {
        let Some(node) = statement.route_info.as_ref().and_then(|r| r.hit_node_attr.as_ref()) else {
            return Ok(());
        };
        let mut metrics = self.metrics.lock();
        let entry = metrics.nodes.entry(node.name().to_string()).or_default();
        entry.executions += 1;
        if error.is_some() {
            entry.failed_executions += 1;
        }
        if let Some(elapsed) = statement.execute_elapsed() {
            entry.total_execute_time += elapsed;
        }
        Ok(())
    }

    fn on_after_commit(&self, _connection: &ConnectionInfo, error: Option<&SqlXError>) -> ListenerResult {
        if error.is_none() {
            self.metrics.lock().commits += 1;
        }
        Ok(())
    }

    fn on_after_rollback(&self, _connection: &ConnectionInfo, error: Option<&SqlXError>) -> ListenerResult {
        if error.is_none() {
            self.metrics.lock().rollbacks += 1;
        }
        Ok(())
    }
}
