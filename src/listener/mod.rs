/// Lifecycle callbacks around routing, connections and statements
pub mod logging;
pub mod metrics;

use crate::error::SqlXError;
use crate::proxy::{ConnectionInfo, ExecuteKind, ParameterKey, Savepoint, StatementInfo, Value};
use crate::routing::RouteInfo;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub use logging::LoggingEventListener;
pub use metrics::{NodeMetrics, RoutingMetrics, RoutingMetricsListener};

/// Listener callbacks report their own failures here; the proxy logs them and carries on
pub type ListenerResult = anyhow::Result<()>;

/// Observer of every lifecycle transition.
///
/// `on_before_*` callbacks must not change state. `on_after_*` callbacks get
/// the outcome error, `None` on success. Every method defaults to a no-op.
#[allow(unused_variables)]
pub trait EventListener: Send + Sync {
    fn on_before_routing(&self, route_info: &RouteInfo) -> ListenerResult {
        Ok(())
    }

    fn on_after_routing(&self, route_info: &RouteInfo, error: Option<&SqlXError>) -> ListenerResult {
        Ok(())
    }

    fn on_before_get_connection(&self, connection: &ConnectionInfo) -> ListenerResult {
        Ok(())
    }

    fn on_after_get_connection(&self, connection: &ConnectionInfo, error: Option<&SqlXError>) -> ListenerResult {
        Ok(())
    }

    fn on_before_connection_close(&self, connection: &ConnectionInfo) -> ListenerResult {
        Ok(())
    }

    fn on_after_connection_close(&self, connection: &ConnectionInfo, error: Option<&SqlXError>) -> ListenerResult {
        Ok(())
    }

    fn on_before_set_auto_commit(&self, connection: &ConnectionInfo, auto_commit: bool, old: bool) -> ListenerResult {
        Ok(())
    }

    fn on_after_set_auto_commit(
        &self,
        connection: &ConnectionInfo,
        auto_commit: bool,
        old: bool,
        error: Option<&SqlXError>,
    ) -> ListenerResult {
        Ok(())
    }

    fn on_before_commit(&self, connection: &ConnectionInfo) -> ListenerResult {
        Ok(())
    }

    fn on_after_commit(&self, connection: &ConnectionInfo, error: Option<&SqlXError>) -> ListenerResult {
        Ok(())
    }

    fn on_before_rollback(&self, connection: &ConnectionInfo) -> ListenerResult {
        Ok(())
    }

    fn on_after_rollback(&self, connection: &ConnectionInfo, error: Option<&SqlXError>) -> ListenerResult {
        Ok(())
    }

    fn on_before_set_savepoint(&self, connection: &ConnectionInfo, name: Option<&str>) -> ListenerResult {
        Ok(())
    }

    fn on_after_set_savepoint(
        &self,
        connection: &ConnectionInfo,
        savepoint: Option<&Savepoint>,
        error: Option<&SqlXError>,
    ) -> ListenerResult {
        Ok(())
    }

    fn on_before_release_savepoint(&self, connection: &ConnectionInfo, savepoint: &Savepoint) -> ListenerResult {
        Ok(())
    }

    fn on_after_release_savepoint(
        &self,
        connection: &ConnectionInfo,
        savepoint: &Savepoint,
        error: Option<&SqlXError>,
    ) -> ListenerResult {
        Ok(())
    }

    fn on_before_savepoint_rollback(&self, connection: &ConnectionInfo, savepoint: &Savepoint) -> ListenerResult {
        Ok(())
    }

    fn on_after_savepoint_rollback(
        &self,
        connection: &ConnectionInfo,
        savepoint: &Savepoint,
        error: Option<&SqlXError>,
    ) -> ListenerResult {
        Ok(())
    }

    fn on_before_create_statement(&self, statement: &StatementInfo) -> ListenerResult {
        Ok(())
    }

    fn on_after_create_statement(&self, statement: &StatementInfo, error: Option<&SqlXError>) -> ListenerResult {
        Ok(())
    }

    fn on_before_close_statement(&self, statement: &StatementInfo) -> ListenerResult {
        Ok(())
    }

    fn on_after_close_statement(&self, statement: &StatementInfo, error: Option<&SqlXError>) -> ListenerResult {
        Ok(())
    }

    fn on_before_execute(&self, statement: &StatementInfo, kind: ExecuteKind) -> ListenerResult {
        Ok(())
    }

    fn on_after_execute(&self, statement: &StatementInfo, kind: ExecuteKind, error: Option<&SqlXError>) -> ListenerResult {
        Ok(())
    }

    fn on_before_add_batch(&self, statement: &StatementInfo) -> ListenerResult {
        Ok(())
    }

    fn on_after_add_batch(&self, statement: &StatementInfo, error: Option<&SqlXError>) -> ListenerResult {
        Ok(())
    }

    fn on_after_set_parameter(
        &self,
        statement: &StatementInfo,
        key: &ParameterKey,
        value: &Value,
        error: Option<&SqlXError>,
    ) -> ListenerResult {
        Ok(())
    }

    fn on_before_result_set_next(&self, statement: &StatementInfo) -> ListenerResult {
        Ok(())
    }

    fn on_after_result_set_next(
        &self,
        statement: &StatementInfo,
        elapsed: Duration,
        has_row: bool,
        error: Option<&SqlXError>,
    ) -> ListenerResult {
        Ok(())
    }

    fn on_after_result_set_close(&self, statement: &StatementInfo, error: Option<&SqlXError>) -> ListenerResult {
        Ok(())
    }
}

/// Listener that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventListener;

impl EventListener for NoopEventListener {}

/// Fans each callback out to every registered listener in order.
///
/// All listeners run even when one fails; the first failure is returned
/// after the last listener.
#[derive(Clone, Default)]
pub struct CompositeEventListener {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl CompositeEventListener {
    pub fn new(listeners: Vec<Arc<dyn EventListener>>) -> Self {
        Self { listeners }
    }

    pub fn add(&mut self, listener: Arc<dyn EventListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn each<F>(&self, callback: F) -> ListenerResult
    where
        F: Fn(&dyn EventListener) -> ListenerResult,
    {
        let mut first_error = None;
        for listener in &self.listeners {
            if let Err(error) = callback(listener.as_ref()) {
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl EventListener for CompositeEventListener {
    fn on_before_routing(&self, route_info: &RouteInfo) -> ListenerResult {
        self.each(|l| l.on_before_routing(route_info))
    }

    fn on_after_routing(&self, route_info: &RouteInfo, error: Option<&SqlXError>) -> ListenerResult {
        self.each(|l| l.on_after_routing(route_info, error))
    }

    fn on_before_get_connection(&self, connection: &ConnectionInfo) -> ListenerResult {
        self.each(|l| l.on_before_get_connection(connection))
    }

    fn on_after_get_connection(&self, connection: &ConnectionInfo, error: Option<&SqlXError>) -> ListenerResult {
        self.each(|l| l.on_after_get_connection(connection, error))
    }

    fn on_before_connection_close(&self, connection: &ConnectionInfo) -> ListenerResult {
        self.each(|l| l.on_before_connection_close(connection))
    }

    fn on_after_connection_close(&self, connection: &ConnectionInfo, error: Option<&SqlXError>) -> ListenerResult {
        self.each(|l| l.on_after_connection_close(connection, error))
    }

    fn on_before_set_auto_commit(&self, connection: &ConnectionInfo, auto_commit: bool, old: bool) -> ListenerResult {
        self.each(|l| l.on_before_set_auto_commit(connection, auto_commit, old))
    }

    fn on_after_set_auto_commit(
        &self,
        connection: &ConnectionInfo,
        auto_commit: bool,
        old: bool,
        error: Option<&SqlXError>,
    ) -> ListenerResult {
        self.each(|l| l.on_after_set_auto_commit(connection, auto_commit, old, error))
    }

    fn on_before_commit(&self, connection: &ConnectionInfo) -> ListenerResult {
        self.each(|l| l.on_before_commit(connection))
    }

    fn on_after_commit(&self, connection: &ConnectionInfo, error: Option<&SqlXError>) -> ListenerResult {
        self.each(|l| l.on_after_commit(connection, error))
    }

    fn on_before_rollback(&self, connection: &ConnectionInfo) -> ListenerResult {
        self.each(|l| l.on_before_rollback(connection))
    }

    fn on_after_rollback(&self, connection: &ConnectionInfo, error: Option<&SqlXError>) -> ListenerResult {
        self.each(|l| l.on_after_rollback(connection, error))
    }

    fn on_before_set_savepoint(&self, connection: &ConnectionInfo, name: Option<&str>) -> ListenerResult {
        self.each(|l| l.on_before_set_savepoint(connection, name))
    }

    fn on_after_set_savepoint(
        &self,
        connection: &ConnectionInfo,
        savepoint: Option<&Savepoint>,
        error: Option<&SqlXError>,
    ) -> ListenerResult {
        self.each(|l| l.on_after_set_savepoint(connection, savepoint, error))
    }

    fn on_before_release_savepoint(&self, connection: &ConnectionInfo, savepoint: &Savepoint) -> ListenerResult {
        self.each(|l| l.on_before_release_savepoint(connection, savepoint))
    }

    fn on_after_release_savepoint(
        &self,
        connection: &ConnectionInfo,
        savepoint: &Savepoint,
        error: Option<&SqlXError>,
    ) -> ListenerResult {
        self.each(|l| l.on_after_release_savepoint(connection, savepoint, error))
    }

    fn on_before_savepoint_rollback(&self, connection: &ConnectionInfo, savepoint: &Savepoint) -> ListenerResult {
        self.each(|l| l.on_before_savepoint_rollback(connection, savepoint))
    }

    fn on_after_savepoint_rollback(
        &self,
        connection: &ConnectionInfo,
        savepoint: &Savepoint,
        error: Option<&SqlXError>,
    ) -> ListenerResult {
        self.each(|l| l.on_after_savepoint_rollback(connection, savepoint, error))
    }

    fn on_before_create_statement(&self, statement: &StatementInfo) -> ListenerResult {
        self.each(|l| l.on_before_create_statement(statement))
    }

    fn on_after_create_statement(&self, statement: &StatementInfo, error: Option<&SqlXError>) -> ListenerResult {
        self.each(|l| l.on_after_create_statement(statement, error))
    }

    fn on_before_close_statement(&self, statement: &StatementInfo) -> ListenerResult {
        self.each(|l| l.on_before_close_statement(statement))
    }

    fn on_after_close_statement(&self, statement: &StatementInfo, error: Option<&SqlXError>) -> ListenerResult {
        self.each(|l| l.on_after_close_statement(statement, error))
    }

    fn on_before_execute(&self, statement: &StatementInfo, kind: ExecuteKind) -> ListenerResult {
        self.each(|l| l.on_before_execute(statement, kind))
    }

    fn on_after_execute(&self, statement: &StatementInfo, kind: ExecuteKind, error: Option<&SqlXError>) -> ListenerResult {
        self.each(|l| l.on_after_execute(statement, kind, error))
    }

    fn on_before_add_batch(&self, statement: &StatementInfo) -> ListenerResult {
        self.each(|l| l.on_before_add_batch(statement))
    }

    fn on_after_add_batch(&self, statement: &StatementInfo, error: Option<&SqlXError>) -> ListenerResult {
        self.each(|l| l.on_after_add_batch(statement, error))
    }

    fn on_after_set_parameter(
        &self,
        statement: &StatementInfo,
        key: &ParameterKey,
        value: &Value,
        error: Option<&SqlXError>,
    ) -> ListenerResult {
        self.each(|l| l.on_after_set_parameter(statement, key, value, error))
    }

    fn on_before_result_set_next(&self, statement: &StatementInfo) -> ListenerResult {
        self.each(|l| l.on_before_result_set_next(statement))
    }

    fn on_after_result_set_next(
        &self,
        statement: &StatementInfo,
        elapsed: Duration,
        has_row: bool,
        error: Option<&SqlXError>,
    ) -> ListenerResult {
        self.each(|l| l.on_after_result_set_next(statement, elapsed, has_row, error))
    }

    fn on_after_result_set_close(&self, statement: &StatementInfo, error: Option<&SqlXError>) -> ListenerResult {
        self.each(|l| l.on_after_result_set_close(statement, error))
    }
}

/// Run one callback, logging instead of propagating its failure
pub(crate) fn notify(event: &str, result: ListenerResult) {
    if let Err(error) = result {
        warn!("event listener failed on {}: {:#}", event, error);
    }
}
