//! In-crate mock driver and fixtures for unit tests

use crate::core::{ClusterConfiguration, DataSourceConfiguration, NodeType, SqlXConfiguration, Topology};
use crate::error::{DatabaseError, DbResult, SqlXError};
use crate::listener::{EventListener, ListenerResult};
use crate::proxy::{
    ConnectionFactory, ConnectionInfo, Credentials, ExecuteKind, FetchDirection, Holdability, IsolationLevel,
    ParameterKey, PhysicalConnection, PhysicalResultSet, PhysicalStatement, Row, Savepoint, StatementInfo,
    StatementKind, Value,
};
use crate::routing::RouteInfo;
use crate::SqlXDataSource;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct MockState {
    log: Vec<String>,
    failing_ops: HashSet<String>,
    failing_nodes: HashSet<String>,
    rows: usize,
    connects: usize,
    closes: usize,
    savepoints: u64,
}

type Shared = Arc<Mutex<MockState>>;

/// Records `"<node>#<n> <op> <detail>"` for every driver call
#[derive(Default)]
pub struct MockConnectionFactory {
    state: Shared,
}

impl MockConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Make every later call of `op` fail
    pub fn fail_on(&self, op: &str) {
        self.state.lock().failing_ops.insert(op.to_string());
    }

    pub fn fail_connect(&self, node: &str) {
        self.state.lock().failing_nodes.insert(node.to_string());
    }

    /// Rows returned by each query
    pub fn set_rows(&self, rows: usize) {
        self.state.lock().rows = rows;
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    pub fn open_connections(&self) -> usize {
        let state = self.state.lock();
        state.connects - state.closes
    }
}

fn record(state: &Shared, label: &str, op: &str, detail: &str) -> DbResult<()> {
    let mut state = state.lock();
    if state.failing_ops.contains(op) {
        return Err(DatabaseError::new(format!("{} failed on {}", op, label)).with_sql_state("08006"));
    }
    let line = if detail.is_empty() {
        format!("{} {}", label, op)
    } else {
        format!("{} {} {}", label, op, detail)
    };
    state.log.push(line);
    Ok(())
}

impl ConnectionFactory for MockConnectionFactory {
    fn connect(
        &self,
        data_source: &DataSourceConfiguration,
        _credentials: Option<&Credentials>,
    ) -> DbResult<Box<dyn PhysicalConnection>> {
        let mut state = self.state.lock();
        if state.failing_nodes.contains(&data_source.name) {
            return Err(DatabaseError::new(format!("connection refused by {}", data_source.name)).with_sql_state("08001"));
        }
        state.connects += 1;
        Ok(Box::new(MockConnection {
            label: format!("{}#{}", data_source.name, state.connects),
            state: Arc::clone(&self.state),
            catalog: None,
        }))
    }
}

pub struct MockConnection {
    label: String,
    state: Shared,
    catalog: Option<String>,
}

impl MockConnection {
    fn record(&self, op: &str, detail: &str) -> DbResult<()> {
        record(&self.state, &self.label, op, detail)
    }
}

impl PhysicalConnection for MockConnection {
    fn set_auto_commit(&mut self, auto_commit: bool) -> DbResult<()> {
        self.record("set_auto_commit", &auto_commit.to_string())
    }

    fn set_read_only(&mut self, read_only: bool) -> DbResult<()> {
        self.record("set_read_only", &read_only.to_string())
    }

    fn set_transaction_isolation(&mut self, level: IsolationLevel) -> DbResult<()> {
        self.record("set_transaction_isolation", &format!("{:?}", level))
    }

    fn set_schema(&mut self, schema: &str) -> DbResult<()> {
        self.record("set_schema", schema)
    }

    fn set_catalog(&mut self, catalog: &str) -> DbResult<()> {
        self.record("set_catalog", catalog)?;
        self.catalog = Some(catalog.to_string());
        Ok(())
    }

    fn catalog(&mut self) -> DbResult<Option<String>> {
        if self.state.lock().failing_ops.contains("catalog") {
            return Err(DatabaseError::new(format!("catalog failed on {}", self.label)));
        }
        Ok(self.catalog.clone())
    }

    fn set_holdability(&mut self, holdability: Holdability) -> DbResult<()> {
        self.record("set_holdability", &format!("{:?}", holdability))
    }

    fn set_client_info(&mut self, name: &str, value: &str) -> DbResult<()> {
        self.record("set_client_info", &format!("{}={}", name, value))
    }

    fn set_type_map(&mut self, type_map: &BTreeMap<String, String>) -> DbResult<()> {
        self.record("set_type_map", &type_map.len().to_string())
    }

    fn set_network_timeout(&mut self, timeout: Duration) -> DbResult<()> {
        self.record("set_network_timeout", &format!("{:?}", timeout))
    }

    fn commit(&mut self) -> DbResult<()> {
        self.record("commit", "")
    }

    fn rollback(&mut self) -> DbResult<()> {
        self.record("rollback", "")
    }

    fn set_savepoint(&mut self, name: Option<&str>) -> DbResult<Savepoint> {
        self.record("set_savepoint", name.unwrap_or(""))?;
        let mut state = self.state.lock();
        state.savepoints += 1;
        Ok(Savepoint {
            id: state.savepoints,
            name: name.map(str::to_string),
        })
    }

    fn rollback_to_savepoint(&mut self, savepoint: &Savepoint) -> DbResult<()> {
        let name = savepoint.name.clone().unwrap_or_else(|| savepoint.id.to_string());
        self.record("rollback_to", &name)
    }

    fn release_savepoint(&mut self, savepoint: &Savepoint) -> DbResult<()> {
        self.record("release_savepoint", &savepoint.id.to_string())
    }

    fn create_statement(&mut self, kind: StatementKind, sql: Option<&str>) -> DbResult<Box<dyn PhysicalStatement>> {
        let detail = match sql {
            Some(sql) => format!("{:?} {}", kind, sql),
            None => format!("{:?}", kind),
        };
        self.record("create_statement", &detail)?;
        Ok(Box::new(MockStatement {
            label: self.label.clone(),
            state: Arc::clone(&self.state),
            batch: 0,
        }))
    }

    fn close(&mut self) -> DbResult<()> {
        let result = self.record("close", "");
        self.state.lock().closes += 1;
        result
    }
}

pub struct MockStatement {
    label: String,
    state: Shared,
    batch: usize,
}

impl MockStatement {
    fn record(&self, op: &str, detail: &str) -> DbResult<()> {
        record(&self.state, &self.label, op, detail)
    }
}

impl PhysicalStatement for MockStatement {
    fn set_fetch_size(&mut self, rows: u32) -> DbResult<()> {
        self.record("set_fetch_size", &rows.to_string())
    }

    fn set_fetch_direction(&mut self, direction: FetchDirection) -> DbResult<()> {
        self.record("set_fetch_direction", &format!("{:?}", direction))
    }

    fn set_max_rows(&mut self, rows: u64) -> DbResult<()> {
        self.record("set_max_rows", &rows.to_string())
    }

    fn set_query_timeout(&mut self, timeout: Duration) -> DbResult<()> {
        self.record("set_query_timeout", &format!("{:?}", timeout))
    }

    fn set_cursor_name(&mut self, name: &str) -> DbResult<()> {
        self.record("set_cursor_name", name)
    }

    fn bind(&mut self, key: &ParameterKey, value: &Value) -> DbResult<()> {
        self.record("bind", &format!("{}={}", key, value))
    }

    fn execute_query(&mut self, sql: Option<&str>) -> DbResult<Box<dyn PhysicalResultSet>> {
        self.record("execute_query", sql.unwrap_or(""))?;
        let rows = self.state.lock().rows;
        Ok(Box::new(MockResultSet {
            rows: (0..rows).map(|i| vec![Value::Int(i as i64)]).collect(),
        }))
    }

    fn execute_update(&mut self, sql: Option<&str>) -> DbResult<u64> {
        self.record("execute_update", sql.unwrap_or(""))?;
        Ok(1)
    }

    fn execute(&mut self, sql: Option<&str>) -> DbResult<bool> {
        self.record("execute", sql.unwrap_or(""))?;
        Ok(true)
    }

    fn add_batch(&mut self, sql: Option<&str>) -> DbResult<()> {
        self.record("add_batch", sql.unwrap_or(""))?;
        self.batch += 1;
        Ok(())
    }

    fn execute_batch(&mut self) -> DbResult<Vec<u64>> {
        self.record("execute_batch", "")?;
        let counts = vec![1; self.batch];
        self.batch = 0;
        Ok(counts)
    }

    fn cancel(&mut self) -> DbResult<()> {
        self.record("cancel", "")
    }

    fn close(&mut self) -> DbResult<()> {
        self.record("close_statement", "")
    }
}

pub struct MockResultSet {
    rows: Vec<Row>,
}

impl PhysicalResultSet for MockResultSet {
    fn next(&mut self) -> DbResult<Option<Row>> {
        if self.rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.rows.remove(0)))
        }
    }
}

/// Records callback names in order
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingListener {
    /// Records like the default one but fails every callback
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn push(&self, event: &str) -> ListenerResult {
        self.events.lock().push(event.to_string());
        if self.fail {
            anyhow::bail!("listener rejected {}", event);
        }
        Ok(())
    }
}

impl EventListener for RecordingListener {
    fn on_before_routing(&self, _route_info: &RouteInfo) -> ListenerResult {
        self.push("before_routing")
    }

    fn on_after_routing(&self, _route_info: &RouteInfo, _error: Option<&SqlXError>) -> ListenerResult {
        self.push("after_routing")
    }

    fn on_before_get_connection(&self, _connection: &ConnectionInfo) -> ListenerResult {
        self.push("before_get_connection")
    }

    fn on_after_get_connection(&self, _connection: &ConnectionInfo, _error: Option<&SqlXError>) -> ListenerResult {
        self.push("after_get_connection")
    }

    fn on_before_connection_close(&self, _connection: &ConnectionInfo) -> ListenerResult {
        self.push("before_connection_close")
    }

    fn on_after_connection_close(&self, _connection: &ConnectionInfo, _error: Option<&SqlXError>) -> ListenerResult {
        self.push("after_connection_close")
    }

    fn on_before_set_savepoint(&self, _connection: &ConnectionInfo, _name: Option<&str>) -> ListenerResult {
        self.push("before_set_savepoint")
    }

    fn on_after_set_savepoint(
        &self,
        _connection: &ConnectionInfo,
        _savepoint: Option<&Savepoint>,
        _error: Option<&SqlXError>,
    ) -> ListenerResult {
        self.push("after_set_savepoint")
    }

    fn on_before_release_savepoint(&self, _connection: &ConnectionInfo, _savepoint: &Savepoint) -> ListenerResult {
        self.push("before_release_savepoint")
    }

    fn on_after_release_savepoint(
        &self,
        _connection: &ConnectionInfo,
        _savepoint: &Savepoint,
        _error: Option<&SqlXError>,
    ) -> ListenerResult {
        self.push("after_release_savepoint")
    }

    fn on_before_savepoint_rollback(&self, _connection: &ConnectionInfo, _savepoint: &Savepoint) -> ListenerResult {
        self.push("before_savepoint_rollback")
    }

    fn on_after_savepoint_rollback(
        &self,
        _connection: &ConnectionInfo,
        _savepoint: &Savepoint,
        _error: Option<&SqlXError>,
    ) -> ListenerResult {
        self.push("after_savepoint_rollback")
    }

    fn on_before_create_statement(&self, _statement: &StatementInfo) -> ListenerResult {
        self.push("before_create_statement")
    }

    fn on_after_create_statement(&self, _statement: &StatementInfo, _error: Option<&SqlXError>) -> ListenerResult {
        self.push("after_create_statement")
    }

    fn on_before_close_statement(&self, _statement: &StatementInfo) -> ListenerResult {
        self.push("before_close_statement")
    }

    fn on_after_close_statement(&self, _statement: &StatementInfo, _error: Option<&SqlXError>) -> ListenerResult {
        self.push("after_close_statement")
    }

    fn on_before_execute(&self, _statement: &StatementInfo, _kind: ExecuteKind) -> ListenerResult {
        self.push("before_execute")
    }

    fn on_after_execute(&self, _statement: &StatementInfo, _kind: ExecuteKind, _error: Option<&SqlXError>) -> ListenerResult {
        self.push("after_execute")
    }

    fn on_before_add_batch(&self, _statement: &StatementInfo) -> ListenerResult {
        self.push("before_add_batch")
    }

    fn on_after_add_batch(&self, _statement: &StatementInfo, _error: Option<&SqlXError>) -> ListenerResult {
        self.push("after_add_batch")
    }

    fn on_after_set_parameter(
        &self,
        _statement: &StatementInfo,
        _key: &ParameterKey,
        _value: &Value,
        _error: Option<&SqlXError>,
    ) -> ListenerResult {
        self.push("after_set_parameter")
    }
}

pub struct Fixture {
    pub data_source: SqlXDataSource,
    pub factory: Arc<MockConnectionFactory>,
}

/// One cluster named `main` holding every given node
pub fn fixture(nodes: &[(&str, NodeType, u32)]) -> Fixture {
    let data_sources = nodes
        .iter()
        .map(|(name, node_type, weight)| {
            DataSourceConfiguration::new(*name, format!("jdbc:mysql://{}/app", name), *node_type).with_weight(*weight)
        })
        .collect();
    let cluster = ClusterConfiguration::new("main", nodes.iter().map(|(name, _, _)| *name));
    let topology = Topology::new(
        data_sources,
        vec![cluster],
        Vec::new(),
        Default::default(),
        Default::default(),
    )
    .expect("fixture topology is valid");
    let factory = Arc::new(MockConnectionFactory::new());
    let data_source = SqlXDataSource::new(Arc::new(SqlXConfiguration::new(topology)), factory.clone());
    Fixture { data_source, factory }
}
