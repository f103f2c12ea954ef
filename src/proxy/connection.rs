/// Logical connection: lazy routing, sticky binding and property replay
use crate::core::NodeAttribute;
use crate::error::{DbResult, SqlXError, SqlXResult};
use crate::listener::{notify, EventListener};
use crate::proxy::info::{ConnectionInfo, StatementInfo};
use crate::proxy::statement::{ProxyPreparedStatement, ProxyStatement};
use crate::proxy::{
    ConnectionFactory, Credentials, Holdability, IsolationLevel, PhysicalConnection, PhysicalStatement,
    Savepoint, StatementKind,
};
use crate::routing::{RouteInfo, RouteRule, Router, RoutingAttribute, StickyWritePolicy};
use crate::utils::{format_duration, generate_id};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Connection-level settings buffered until a physical connection exists, then replayed on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionProperties {
    pub auto_commit: bool,
    pub read_only: bool,
    pub isolation: Option<IsolationLevel>,
    pub schema: Option<String>,
    pub catalog: Option<String>,
    pub holdability: Option<Holdability>,
    pub client_info: BTreeMap<String, String>,
    pub type_map: Option<BTreeMap<String, String>>,
    pub network_timeout: Option<Duration>,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            auto_commit: true,
            read_only: false,
            isolation: None,
            schema: None,
            catalog: None,
            holdability: None,
            client_info: BTreeMap::new(),
            type_map: None,
            network_timeout: None,
        }
    }
}

impl ConnectionProperties {
    fn replay(&self, physical: &mut dyn PhysicalConnection) -> DbResult<()> {
        physical.set_auto_commit(self.auto_commit)?;
        if self.read_only {
            physical.set_read_only(true)?;
        }
        if let Some(level) = self.isolation {
            physical.set_transaction_isolation(level)?;
        }
        if let Some(schema) = &self.schema {
            physical.set_schema(schema)?;
        }
        if let Some(catalog) = &self.catalog {
            physical.set_catalog(catalog)?;
        }
        if let Some(holdability) = self.holdability {
            physical.set_holdability(holdability)?;
        }
        for (name, value) in &self.client_info {
            physical.set_client_info(name, value)?;
        }
        if let Some(type_map) = &self.type_map {
            physical.set_type_map(type_map)?;
        }
        if let Some(timeout) = self.network_timeout {
            physical.set_network_timeout(timeout)?;
        }
        Ok(())
    }
}

/// Collaborators shared by every logical connection of a data source
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub router: Arc<Router>,
    pub factory: Arc<dyn ConnectionFactory>,
    pub listener: Arc<dyn EventListener>,
    pub sticky_write_policy: StickyWritePolicy,
    pub credentials: Option<Credentials>,
}

struct Binding {
    node: Arc<NodeAttribute>,
    cluster: Option<String>,
    routing_group: Option<String>,
    physical: Box<dyn PhysicalConnection>,
}

enum Phase {
    Unbound,
    Bound(Binding),
    Closed,
}

struct ConnectionState {
    phase: Phase,
    properties: ConnectionProperties,
    routing: Option<RoutingAttribute>,
    info: ConnectionInfo,
}

impl ConnectionState {
    fn ensure_open(&self) -> SqlXResult<()> {
        match self.phase {
            Phase::Closed => Err(SqlXError::Closed { resource: "connection" }),
            _ => Ok(()),
        }
    }

    fn binding_mut(&mut self) -> SqlXResult<&mut Binding> {
        match &mut self.phase {
            Phase::Bound(binding) => Ok(binding),
            Phase::Unbound => Err(SqlXError::internal("connection is not bound after routing")),
            Phase::Closed => Err(SqlXError::Closed { resource: "connection" }),
        }
    }

    /// Route one statement, binding a physical connection on first use.
    ///
    /// The RouteInfo is recorded whether or not routing succeeds.
    fn route(&mut self, context: &ConnectionContext, sql: Option<&str>) -> SqlXResult<RouteInfo> {
        self.ensure_open()?;
        let mut route = RouteInfo::new(sql);
        route.transaction_active = !self.properties.auto_commit;
        if route.transaction_active {
            let transaction_id = self.info.transaction_id.get_or_insert_with(|| generate_id("tx"));
            route.transaction_id = Some(transaction_id.clone());
        }
        route.transaction_name = self.info.transaction_name.clone();

        route.timing.begin();
        notify("before_routing", context.listener.on_before_routing(&route));
        let outcome = self.resolve(context, &mut route, sql);
        route.timing.end();
        if let Err(error) = &outcome {
            route.exception = Some(error.clone());
        }
        notify("after_routing", context.listener.on_after_routing(&route, outcome.as_ref().err()));

        self.info.route_infos.push(route.clone());
        outcome.map(|_| route)
    }

    fn resolve(&mut self, context: &ConnectionContext, route: &mut RouteInfo, sql: Option<&str>) -> SqlXResult<()> {
        if let Some(sql) = sql {
            route.sql_attribute = context.router.classify(sql)?;
        }

        if let Phase::Bound(binding) = &self.phase {
            if context.sticky_write_policy == StickyWritePolicy::Reject
                && route.is_write()
                && !binding.node.node_type().can_write()
            {
                return Err(SqlXError::routing(format!(
                    "connection is bound to {} node {}, write statement rejected",
                    binding.node.node_type(),
                    binding.node.name()
                )));
            }
            route.cluster = binding.cluster.clone();
            route.hit_routing_group = binding.routing_group.clone();
            route.hit_rule = Some(RouteRule::Sticky);
            route.hit_node_attr = Some(Arc::clone(&binding.node));
            return Ok(());
        }

        let node = context.router.route(route, self.routing.as_ref())?;
        self.acquire(context, route, node)?;

        let binding = self.binding_mut()?;
        match binding.physical.catalog() {
            Ok(Some(database)) => {
                if let Some(attribute) = route.sql_attribute.as_mut() {
                    attribute.set_default_database(Some(database));
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to read catalog of {}: {}", binding.node.name(), e),
        }
        Ok(())
    }

    fn acquire(&mut self, context: &ConnectionContext, route: &RouteInfo, node: Arc<NodeAttribute>) -> SqlXResult<()> {
        self.info.get_connection.begin();
        notify("before_get_connection", context.listener.on_before_get_connection(&self.info));
        let result = self.connect(context, &node);
        self.info.get_connection.end();

        match result {
            Ok(physical) => {
                debug!(
                    "connection {} bound to {} in {:?}",
                    self.info.connection_id,
                    node.name(),
                    self.info.get_connection_elapsed()
                );
                self.phase = Phase::Bound(Binding {
                    node: Arc::clone(&node),
                    cluster: route.cluster.clone(),
                    routing_group: route.hit_routing_group.clone(),
                    physical,
                });
                self.info.bound_node = Some(node);
                notify("after_get_connection", context.listener.on_after_get_connection(&self.info, None));
                Ok(())
            }
            Err(error) => {
                self.info.exceptions.push(error.clone());
                notify(
                    "after_get_connection",
                    context.listener.on_after_get_connection(&self.info, Some(&error)),
                );
                Err(error)
            }
        }
    }

    fn connect(&self, context: &ConnectionContext, node: &NodeAttribute) -> SqlXResult<Box<dyn PhysicalConnection>> {
        let topology = context.router.configuration().snapshot();
        let data_source = topology
            .data_source(node.name())
            .ok_or_else(|| SqlXError::routing(format!("data source {} was removed", node.name())))?;
        let mut physical = context.factory.connect(data_source, context.credentials.as_ref())?;
        if let Err(error) = self.properties.replay(physical.as_mut()) {
            if let Err(close_error) = physical.close() {
                warn!("closing {} after failed property replay: {}", node.name(), close_error);
            }
            return Err(error.into());
        }
        Ok(physical)
    }
}

/// State shared between a logical connection and its statements
pub(crate) struct ConnectionShared {
    context: ConnectionContext,
    state: Mutex<ConnectionState>,
}

impl ConnectionShared {
    pub(crate) fn listener(&self) -> Arc<dyn EventListener> {
        Arc::clone(&self.context.listener)
    }

    pub(crate) fn connection_id(&self) -> String {
        self.state.lock().info.connection_id.clone()
    }

    pub(crate) fn ensure_open(&self) -> SqlXResult<()> {
        self.state.lock().ensure_open()
    }

    pub(crate) fn route_statement(&self, sql: &str) -> SqlXResult<RouteInfo> {
        self.state.lock().route(&self.context, Some(sql))
    }

    /// Route `sql` and create a physical statement on the bound connection
    pub(crate) fn open_statement(
        &self,
        kind: StatementKind,
        sql: &str,
    ) -> SqlXResult<(RouteInfo, Box<dyn PhysicalStatement>)> {
        let mut state = self.state.lock();
        let route = state.route(&self.context, Some(sql))?;
        let native_sql = match kind {
            StatementKind::Plain => None,
            StatementKind::Prepared | StatementKind::Callable => route.native_sql(),
        };
        let physical = state
            .binding_mut()?
            .physical
            .create_statement(kind, native_sql)
            .map_err(|error| {
                let error = SqlXError::from(error);
                state.info.exceptions.push(error.clone());
                error
            });
        physical.map(|physical| (route, physical))
    }

    /// Keep the final record of a closed statement
    pub(crate) fn archive(&self, statement: StatementInfo) {
        self.state.lock().info.statement_infos.push(statement);
    }
}

/// The application-facing connection.
///
/// Starts unbound; the first routed statement binds it to one physical
/// connection, reused by every later statement until `close`. Listener
/// callbacks run under the connection lock and must not call back into the
/// connection.
pub struct ProxyConnection {
    shared: Arc<ConnectionShared>,
}

impl ProxyConnection {
    pub(crate) fn new(context: ConnectionContext, routing: Option<RoutingAttribute>) -> Self {
        Self {
            shared: Arc::new(ConnectionShared {
                context,
                state: Mutex::new(ConnectionState {
                    phase: Phase::Unbound,
                    properties: ConnectionProperties::default(),
                    routing,
                    info: ConnectionInfo::new(),
                }),
            }),
        }
    }

    /// Override cluster or node selection for statements routed from now on
    pub fn with_routing_attribute(self, routing: RoutingAttribute) -> Self {
        self.shared.state.lock().routing = Some(routing);
        self
    }

    pub fn set_routing_attribute(&self, routing: Option<RoutingAttribute>) {
        self.shared.state.lock().routing = routing;
    }

    pub fn routing_attribute(&self) -> Option<RoutingAttribute> {
        self.shared.state.lock().routing.clone()
    }

    pub fn set_transaction_name(&self, name: Option<String>) {
        self.shared.state.lock().info.transaction_name = name;
    }

    pub fn connection_id(&self) -> String {
        self.shared.connection_id()
    }

    /// Snapshot of everything recorded so far
    pub fn connection_info(&self) -> ConnectionInfo {
        self.shared.state.lock().info.clone()
    }

    pub fn properties(&self) -> ConnectionProperties {
        self.shared.state.lock().properties.clone()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.shared.state.lock().phase, Phase::Closed)
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.shared.state.lock().phase, Phase::Bound(_))
    }

    pub fn bound_node(&self) -> Option<Arc<NodeAttribute>> {
        match &self.shared.state.lock().phase {
            Phase::Bound(binding) => Some(Arc::clone(&binding.node)),
            _ => None,
        }
    }

    /// Route `sql` now without executing anything
    pub fn route(&self, sql: &str) -> SqlXResult<RouteInfo> {
        self.shared.route_statement(sql)
    }

    pub fn native_sql(&self, sql: &str) -> SqlXResult<String> {
        self.shared.ensure_open()?;
        let attribute = self.shared.context.router.classify(sql)?;
        Ok(attribute.map_or_else(|| sql.to_string(), |a| a.native_sql))
    }

    pub fn create_statement(&self) -> SqlXResult<ProxyStatement> {
        self.shared.ensure_open()?;
        Ok(ProxyStatement::new(Arc::clone(&self.shared)))
    }

    pub fn prepare_statement(&self, sql: &str) -> SqlXResult<ProxyPreparedStatement> {
        ProxyPreparedStatement::prepare(Arc::clone(&self.shared), StatementKind::Prepared, sql)
    }

    pub fn prepare_call(&self, sql: &str) -> SqlXResult<ProxyPreparedStatement> {
        ProxyPreparedStatement::prepare(Arc::clone(&self.shared), StatementKind::Callable, sql)
    }

    /// Buffer a property and forward it to the physical connection if one is bound
    fn update<B, F>(&self, buffer: B, forward: F) -> SqlXResult<()>
    where
        B: FnOnce(&mut ConnectionProperties),
        F: FnOnce(&mut dyn PhysicalConnection) -> DbResult<()>,
    {
        let mut state = self.shared.state.lock();
        state.ensure_open()?;
        let ConnectionState { phase, properties, info, .. } = &mut *state;
        if let Phase::Bound(binding) = phase {
            if let Err(error) = forward(binding.physical.as_mut()) {
                let error = SqlXError::from(error);
                info.exceptions.push(error.clone());
                return Err(error);
            }
        }
        buffer(properties);
        Ok(())
    }

    pub fn set_auto_commit(&self, auto_commit: bool) -> SqlXResult<()> {
        let listener = &self.shared.context.listener;
        let mut state = self.shared.state.lock();
        state.ensure_open()?;
        let old = state.properties.auto_commit;
        notify(
            "before_set_auto_commit",
            listener.on_before_set_auto_commit(&state.info, auto_commit, old),
        );

        let ConnectionState { phase, properties, info, .. } = &mut *state;
        let result = match phase {
            Phase::Bound(binding) => binding.physical.set_auto_commit(auto_commit).map_err(SqlXError::from),
            _ => Ok(()),
        };
        match &result {
            Ok(()) => {
                properties.auto_commit = auto_commit;
                if auto_commit {
                    info.transaction_id = None;
                }
            }
            Err(error) => info.exceptions.push(error.clone()),
        }
        notify(
            "after_set_auto_commit",
            listener.on_after_set_auto_commit(info, auto_commit, old, result.as_ref().err()),
        );
        result
    }

    pub fn auto_commit(&self) -> bool {
        self.shared.state.lock().properties.auto_commit
    }

    pub fn set_read_only(&self, read_only: bool) -> SqlXResult<()> {
        self.update(|p| p.read_only = read_only, |c| c.set_read_only(read_only))
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.state.lock().properties.read_only
    }

    pub fn set_transaction_isolation(&self, level: IsolationLevel) -> SqlXResult<()> {
        self.update(|p| p.isolation = Some(level), |c| c.set_transaction_isolation(level))
    }

    pub fn set_schema(&self, schema: &str) -> SqlXResult<()> {
        self.update(|p| p.schema = Some(schema.to_string()), |c| c.set_schema(schema))
    }

    pub fn set_catalog(&self, catalog: &str) -> SqlXResult<()> {
        self.update(|p| p.catalog = Some(catalog.to_string()), |c| c.set_catalog(catalog))
    }

    pub fn set_holdability(&self, holdability: Holdability) -> SqlXResult<()> {
        self.update(|p| p.holdability = Some(holdability), |c| c.set_holdability(holdability))
    }

    pub fn set_client_info(&self, name: &str, value: &str) -> SqlXResult<()> {
        self.update(
            |p| {
                p.client_info.insert(name.to_string(), value.to_string());
            },
            |c| c.set_client_info(name, value),
        )
    }

    pub fn set_type_map(&self, type_map: BTreeMap<String, String>) -> SqlXResult<()> {
        let forwarded = type_map.clone();
        self.update(|p| p.type_map = Some(type_map), move |c| c.set_type_map(&forwarded))
    }

    pub fn set_network_timeout(&self, timeout: Duration) -> SqlXResult<()> {
        self.update(|p| p.network_timeout = Some(timeout), |c| c.set_network_timeout(timeout))
    }

    pub fn commit(&self) -> SqlXResult<()> {
        let listener = &self.shared.context.listener;
        let mut state = self.shared.state.lock();
        state.ensure_open()?;
        let ConnectionState { phase, info, .. } = &mut *state;
        let Phase::Bound(binding) = phase else {
            return Err(SqlXError::database("physical connection is not initialized, unable to commit"));
        };

        info.commit.begin();
        notify("before_commit", listener.on_before_commit(info));
        let result = binding.physical.commit().map_err(SqlXError::from);
        info.commit.end();
        match &result {
            Ok(()) => {
                info.commit_count += 1;
                info.transaction_id = None;
            }
            Err(error) => info.exceptions.push(error.clone()),
        }
        notify("after_commit", listener.on_after_commit(info, result.as_ref().err()));
        result
    }

    pub fn rollback(&self) -> SqlXResult<()> {
        let listener = &self.shared.context.listener;
        let mut state = self.shared.state.lock();
        state.ensure_open()?;
        let ConnectionState { phase, info, .. } = &mut *state;
        let Phase::Bound(binding) = phase else {
            return Err(SqlXError::database("physical connection is not initialized, unable to rollback"));
        };

        info.rollback.begin();
        notify("before_rollback", listener.on_before_rollback(info));
        let result = binding.physical.rollback().map_err(SqlXError::from);
        info.rollback.end();
        match &result {
            Ok(()) => {
                info.rollback_count += 1;
                info.transaction_id = None;
            }
            Err(error) => info.exceptions.push(error.clone()),
        }
        notify("after_rollback", listener.on_after_rollback(info, result.as_ref().err()));
        result
    }

    pub fn set_savepoint(&self, name: Option<&str>) -> SqlXResult<Savepoint> {
        let listener = &self.shared.context.listener;
        let mut state = self.shared.state.lock();
        state.ensure_open()?;
        let ConnectionState { phase, info, .. } = &mut *state;
        let Phase::Bound(binding) = phase else {
            return Err(SqlXError::database("physical connection is not initialized, unable to set savepoint"));
        };

        notify("before_set_savepoint", listener.on_before_set_savepoint(info, name));
        let result = binding.physical.set_savepoint(name).map_err(SqlXError::from);
        if let Err(error) = &result {
            info.exceptions.push(error.clone());
        }
        notify(
            "after_set_savepoint",
            listener.on_after_set_savepoint(info, result.as_ref().ok(), result.as_ref().err()),
        );
        result
    }

    pub fn rollback_to_savepoint(&self, savepoint: &Savepoint) -> SqlXResult<()> {
        let listener = &self.shared.context.listener;
        let mut state = self.shared.state.lock();
        state.ensure_open()?;
        let ConnectionState { phase, info, .. } = &mut *state;
        let Phase::Bound(binding) = phase else {
            return Err(SqlXError::database("physical connection is not initialized, unable to rollback"));
        };

        info.rollback.begin();
        notify("before_savepoint_rollback", listener.on_before_savepoint_rollback(info, savepoint));
        let result = binding.physical.rollback_to_savepoint(savepoint).map_err(SqlXError::from);
        info.rollback.end();
        if let Err(error) = &result {
            info.exceptions.push(error.clone());
        }
        notify(
            "after_savepoint_rollback",
            listener.on_after_savepoint_rollback(info, savepoint, result.as_ref().err()),
        );
        result
    }

    pub fn release_savepoint(&self, savepoint: &Savepoint) -> SqlXResult<()> {
        let listener = &self.shared.context.listener;
        let mut state = self.shared.state.lock();
        state.ensure_open()?;
        let ConnectionState { phase, info, .. } = &mut *state;
        let Phase::Bound(binding) = phase else {
            return Err(SqlXError::database("physical connection is not initialized, unable to release savepoint"));
        };

        notify("before_release_savepoint", listener.on_before_release_savepoint(info, savepoint));
        let result = binding.physical.release_savepoint(savepoint).map_err(SqlXError::from);
        if let Err(error) = &result {
            info.exceptions.push(error.clone());
        }
        notify(
            "after_release_savepoint",
            listener.on_after_release_savepoint(info, savepoint, result.as_ref().err()),
        );
        result
    }

    pub fn is_valid(&self, timeout: Duration) -> SqlXResult<bool> {
        match &mut self.shared.state.lock().phase {
            Phase::Closed => Ok(false),
            Phase::Unbound => Ok(true),
            Phase::Bound(binding) => Ok(binding.physical.is_valid(timeout)?),
        }
    }

    pub fn abort(&self) -> SqlXResult<()> {
        Err(SqlXError::unsupported("abort"))
    }

    /// Release the physical connection, if any. Closing twice is a no-op.
    pub fn close(&self) -> SqlXResult<()> {
        let listener = &self.shared.context.listener;
        let mut state = self.shared.state.lock();
        if matches!(state.phase, Phase::Closed) {
            return Ok(());
        }
        let ConnectionState { phase, info, .. } = &mut *state;
        let previous = std::mem::replace(phase, Phase::Closed);

        info.close.begin();
        notify("before_connection_close", listener.on_before_connection_close(info));
        let result = match previous {
            Phase::Bound(mut binding) => binding.physical.close().map_err(SqlXError::from),
            _ => Ok(()),
        };
        info.close.end();
        if let Err(error) = &result {
            info.exceptions.push(error.clone());
        }
        debug!(
            "connection {} closed after {} with {} route(s), {} statement(s)",
            info.connection_id,
            info.alive_duration().map(format_duration).unwrap_or_else(|| "-".to_string()),
            info.route_count(),
            info.statement_infos.len()
        );
        notify("after_connection_close", listener.on_after_connection_close(info, result.as_ref().err()));
        result
    }
}

impl Drop for ProxyConnection {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            warn!("closing dropped connection failed: {}", error);
        }
    }
}
