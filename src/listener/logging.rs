use crate::error::SqlXError;
use crate::listener::{EventListener, ListenerResult};
use crate::proxy::{ConnectionInfo, ExecuteKind, StatementInfo};
use crate::routing::RouteInfo;
use tracing::{debug, info, warn};

/// Writes routing, transaction and execution events to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventListener {
    /// Log each statement with its bound values
    pub log_sql: bool,
}

impl LoggingEventListener {
    pub fn new(log_sql: bool) -> Self {
        Self { log_sql }
    }
}

impl EventListener for LoggingEventListener {
    fn on_after_routing(&self, route_info: &RouteInfo, error: Option<&SqlXError>) -> ListenerResult {
        match (error, &route_info.hit_node_attr) {
            (Some(error), _) => warn!(
                route_id = %route_info.route_id,
                group = route_info.hit_routing_group.as_deref().unwrap_or("-"),
                "routing failed: {}",
                error
            ),
            (None, Some(node)) => debug!(
                route_id = %route_info.route_id,
                group = route_info.hit_routing_group.as_deref().unwrap_or("-"),
                rule = %route_info.hit_rule.map(|r| r.to_string()).unwrap_or_default(),
                node = node.name(),
                elapsed = ?route_info.timing.elapsed(),
                "routed"
            ),
            (None, None) => {}
        }
        Ok(())
    }

    fn on_after_get_connection(&self, connection: &ConnectionInfo, error: Option<&SqlXError>) -> ListenerResult {
        let node = connection.bound_node.as_ref().map(|n| n.name().to_string());
        match error {
            Some(error) => warn!(connection_id = %connection.connection_id, "physical connection failed: {}", error),
            None => debug!(
                connection_id = %connection.connection_id,
                node = node.as_deref().unwrap_or("-"),
                elapsed = ?connection.get_connection_elapsed(),
                "physical connection acquired"
            ),
        }
        Ok(())
    }

    fn on_after_commit(&self, connection: &ConnectionInfo, error: Option<&SqlXError>) -> ListenerResult {
        match error {
            Some(error) => warn!(connection_id = %connection.connection_id, "commit failed: {}", error),
            None => debug!(connection_id = %connection.connection_id, elapsed = ?connection.commit_elapsed(), "committed"),
        }
        Ok(())
    }

    fn on_after_rollback(&self, connection: &ConnectionInfo, error: Option<&SqlXError>) -> ListenerResult {
        match error {
            Some(error) => warn!(connection_id = %connection.connection_id, "rollback failed: {}", error),
            None => info!(connection_id = %connection.connection_id, elapsed = ?connection.rollback_elapsed(), "rolled back"),
        }
        Ok(())
    }

    fn on_after_execute(&self, statement: &StatementInfo, kind: ExecuteKind, error: Option<&SqlXError>) -> ListenerResult {
        let sql = if self.log_sql { statement.sql_with_values() } else { None };
        match error {
            Some(error) => warn!(
                statement_id = %statement.statement_id,
                sql = sql.as_deref().unwrap_or("-"),
                "{} failed: {}",
                kind,
                error
            ),
            None => debug!(
                statement_id = %statement.statement_id,
                sql = sql.as_deref().unwrap_or("-"),
                elapsed = ?statement.execute_elapsed(),
                "{}",
                kind
            ),
        }
        Ok(())
    }

    fn on_after_connection_close(&self, connection: &ConnectionInfo, error: Option<&SqlXError>) -> ListenerResult {
        if let Some(error) = error {
            warn!(connection_id = %connection.connection_id, "close failed: {}", error);
        }
        Ok(())
    }
}
