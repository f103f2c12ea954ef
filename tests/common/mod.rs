#![allow(dead_code)]

use parking_lot::Mutex;
use sqlx_router::core::{ClusterConfiguration, DataSourceConfiguration, NodeType, SqlXConfiguration, Topology};
use sqlx_router::error::{DatabaseError, DbResult};
use sqlx_router::proxy::{
    ConnectionFactory, Credentials, IsolationLevel, PhysicalConnection, PhysicalResultSet, PhysicalStatement, Row,
    StatementKind, Value,
};
use sqlx_router::SqlXDataSource;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Driver stand-in that tags every physical connection with `<node>-<serial>`
#[derive(Default)]
pub struct StubDriver {
    serial: AtomicUsize,
    refused: Mutex<HashSet<String>>,
    executed: Arc<Mutex<Vec<(String, String)>>>,
}

impl StubDriver {
    pub fn refuse(&self, node: &str) {
        self.refused.lock().insert(node.to_string());
    }

    /// `(connection tag, sql)` for every statement executed so far
    pub fn executed(&self) -> Vec<(String, String)> {
        self.executed.lock().clone()
    }

    pub fn connections_opened(&self) -> usize {
        self.serial.load(Ordering::SeqCst)
    }
}

impl ConnectionFactory for StubDriver {
    fn connect(
        &self,
        data_source: &DataSourceConfiguration,
        _credentials: Option<&Credentials>,
    ) -> DbResult<Box<dyn PhysicalConnection>> {
        if self.refused.lock().contains(&data_source.name) {
            return Err(DatabaseError::new("connection refused").with_sql_state("08001"));
        }
        let serial = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(StubConnection {
            tag: format!("{}-{}", data_source.name, serial),
            executed: Arc::clone(&self.executed),
        }))
    }
}

struct StubConnection {
    tag: String,
    executed: Arc<Mutex<Vec<(String, String)>>>,
}

impl PhysicalConnection for StubConnection {
    fn set_auto_commit(&mut self, _auto_commit: bool) -> DbResult<()> {
        Ok(())
    }

    fn set_read_only(&mut self, _read_only: bool) -> DbResult<()> {
        Ok(())
    }

    fn set_transaction_isolation(&mut self, _level: IsolationLevel) -> DbResult<()> {
        Ok(())
    }

    fn commit(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn rollback(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn create_statement(&mut self, _kind: StatementKind, sql: Option<&str>) -> DbResult<Box<dyn PhysicalStatement>> {
        Ok(Box::new(StubStatement {
            tag: self.tag.clone(),
            prepared: sql.map(str::to_string),
            executed: Arc::clone(&self.executed),
        }))
    }

    fn close(&mut self) -> DbResult<()> {
        Ok(())
    }
}

struct StubStatement {
    tag: String,
    prepared: Option<String>,
    executed: Arc<Mutex<Vec<(String, String)>>>,
}

impl StubStatement {
    fn record(&self, sql: Option<&str>) {
        let sql = sql.or(self.prepared.as_deref()).unwrap_or_default().to_string();
        self.executed.lock().push((self.tag.clone(), sql));
    }
}

impl PhysicalStatement for StubStatement {
    fn execute_query(&mut self, sql: Option<&str>) -> DbResult<Box<dyn PhysicalResultSet>> {
        self.record(sql);
        Ok(Box::new(OneRow { done: false }))
    }

    fn execute_update(&mut self, sql: Option<&str>) -> DbResult<u64> {
        self.record(sql);
        Ok(1)
    }

    fn execute(&mut self, sql: Option<&str>) -> DbResult<bool> {
        self.record(sql);
        Ok(false)
    }

    fn close(&mut self) -> DbResult<()> {
        Ok(())
    }
}

struct OneRow {
    done: bool,
}

impl PhysicalResultSet for OneRow {
    fn next(&mut self) -> DbResult<Option<Row>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        Ok(Some(vec![Value::Int(1)]))
    }
}

pub fn data_source(name: &str, node_type: NodeType, weight: u32) -> DataSourceConfiguration {
    DataSourceConfiguration::new(name, format!("jdbc:mysql://{}:3306/app", name), node_type).with_weight(weight)
}

/// Cluster `c1` over `nodes`, served through a fresh `StubDriver`
pub fn cluster_fixture(nodes: &[(&str, NodeType, u32)]) -> (SqlXDataSource, Arc<StubDriver>) {
    let data_sources = nodes.iter().map(|(n, t, w)| data_source(n, *t, *w)).collect();
    let cluster = ClusterConfiguration::new("c1", nodes.iter().map(|(n, _, _)| *n)).with_defaulted(true);
    let topology = Topology::new(data_sources, vec![cluster], Vec::new(), Default::default(), Default::default())
        .expect("valid topology");
    let driver = Arc::new(StubDriver::default());
    let data_source = SqlXDataSource::new(Arc::new(SqlXConfiguration::new(topology)), driver.clone());
    (data_source, driver)
}
