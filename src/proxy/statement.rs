/// Proxy statements and result sets
use crate::error::{DbResult, SqlXError, SqlXResult};
use crate::listener::{notify, EventListener};
use crate::proxy::connection::ConnectionShared;
use crate::proxy::info::StatementInfo;
use crate::proxy::{
    ExecuteKind, FetchDirection, ParameterKey, PhysicalResultSet, PhysicalStatement, Row, StatementKind, Value,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Statement-level settings replayed on every physical statement created for it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementProperties {
    pub fetch_size: Option<u32>,
    pub fetch_direction: Option<FetchDirection>,
    pub max_rows: Option<u64>,
    pub max_field_size: Option<u32>,
    pub query_timeout: Option<Duration>,
    pub poolable: Option<bool>,
    pub escape_processing: Option<bool>,
    pub cursor_name: Option<String>,
}

impl StatementProperties {
    fn replay(&self, physical: &mut dyn PhysicalStatement) -> DbResult<()> {
        if let Some(rows) = self.fetch_size {
            physical.set_fetch_size(rows)?;
        }
        if let Some(direction) = self.fetch_direction {
            physical.set_fetch_direction(direction)?;
        }
        if let Some(rows) = self.max_rows {
            physical.set_max_rows(rows)?;
        }
        if let Some(bytes) = self.max_field_size {
            physical.set_max_field_size(bytes)?;
        }
        if let Some(timeout) = self.query_timeout {
            physical.set_query_timeout(timeout)?;
        }
        if let Some(poolable) = self.poolable {
            physical.set_poolable(poolable)?;
        }
        if let Some(enabled) = self.escape_processing {
            physical.set_escape_processing(enabled)?;
        }
        if let Some(name) = &self.cursor_name {
            physical.set_cursor_name(name)?;
        }
        Ok(())
    }
}

/// State common to plain and prepared statements
pub struct StatementCore {
    connection: Arc<ConnectionShared>,
    listener: Arc<dyn EventListener>,
    info: StatementInfo,
    physical: Option<Box<dyn PhysicalStatement>>,
    properties: StatementProperties,
    closed: bool,
}

impl StatementCore {
    fn new(connection: Arc<ConnectionShared>, kind: StatementKind) -> Self {
        let info = StatementInfo::new(kind, &connection.connection_id());
        Self {
            listener: connection.listener(),
            connection,
            info,
            physical: None,
            properties: StatementProperties::default(),
            closed: false,
        }
    }

    fn ensure_open(&self) -> SqlXResult<()> {
        if self.closed {
            return Err(SqlXError::Closed { resource: "statement" });
        }
        self.connection.ensure_open()
    }

    fn physical(&mut self) -> SqlXResult<&mut Box<dyn PhysicalStatement>> {
        self.physical
            .as_mut()
            .ok_or_else(|| SqlXError::internal("statement has no physical statement"))
    }

    fn fail(&mut self, error: impl Into<SqlXError>) -> SqlXError {
        let error = error.into();
        self.info.add_exception(error.clone());
        error
    }

    /// Route `sql` and create the physical statement, replaying buffered properties
    fn open(&mut self, sql: &str) -> SqlXResult<()> {
        self.info.sql = Some(sql.to_string());
        self.info.create.begin();
        notify("before_create_statement", self.listener.on_before_create_statement(&self.info));

        let result = self
            .connection
            .open_statement(self.info.kind, sql)
            .and_then(|(route, mut physical)| match self.properties.replay(physical.as_mut()) {
                Ok(()) => Ok((route, physical)),
                Err(error) => {
                    if let Err(close_error) = physical.close() {
                        warn!("closing statement after failed property replay: {}", close_error);
                    }
                    Err(error.into())
                }
            });
        self.info.create.end();

        let result = match result {
            Ok((route, physical)) => {
                self.info.native_sql = route.native_sql().map(str::to_string);
                self.info.route_info = Some(route);
                self.physical = Some(physical);
                Ok(())
            }
            Err(error) => Err(self.fail(error)),
        };
        notify(
            "after_create_statement",
            self.listener.on_after_create_statement(&self.info, result.as_ref().err()),
        );
        result
    }

    /// Route `sql` on the already bound connection without creating a new physical statement
    fn reroute(&mut self, sql: &str) -> SqlXResult<()> {
        self.info.sql = Some(sql.to_string());
        match self.connection.route_statement(sql) {
            Ok(route) => {
                self.info.native_sql = route.native_sql().map(str::to_string);
                self.info.route_info = Some(route);
                Ok(())
            }
            Err(error) => Err(self.fail(error)),
        }
    }

    /// Execution bracket: timing, counters, exception capture and events
    fn run<T, F>(&mut self, kind: ExecuteKind, op: F) -> SqlXResult<T>
    where
        F: FnOnce(&mut dyn PhysicalStatement, Option<&str>) -> DbResult<T>,
    {
        self.ensure_open()?;
        self.info.execute.begin();
        notify("before_execute", self.listener.on_before_execute(&self.info, kind));

        let sql = match self.info.kind {
            StatementKind::Plain => self.info.native_sql.clone(),
            StatementKind::Prepared | StatementKind::Callable => None,
        };
        let result = match self.physical.as_mut() {
            Some(physical) => op(physical.as_mut(), sql.as_deref()).map_err(SqlXError::from),
            None => Err(SqlXError::internal("statement has no physical statement")),
        };

        self.info.execute.end();
        self.info.execute_count += 1;
        if let Some(elapsed) = self.info.execute_elapsed() {
            self.info.total_execute_time += elapsed;
        }
        let result = result.map_err(|error| self.fail(error));
        notify(
            "after_execute",
            self.listener.on_after_execute(&self.info, kind, result.as_ref().err()),
        );
        result
    }

    fn set_property<B, F>(&mut self, buffer: B, forward: F) -> SqlXResult<()>
    where
        B: FnOnce(&mut StatementProperties),
        F: FnOnce(&mut dyn PhysicalStatement) -> DbResult<()>,
    {
        self.ensure_open()?;
        let forwarded = match self.physical.as_mut() {
            Some(physical) => forward(physical.as_mut()),
            None => Ok(()),
        };
        if let Err(error) = forwarded {
            return Err(self.fail(error));
        }
        buffer(&mut self.properties);
        Ok(())
    }

    fn close(&mut self) -> SqlXResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.info.close.begin();
        notify("before_close_statement", self.listener.on_before_close_statement(&self.info));
        let result = match self.physical.take() {
            Some(mut physical) => physical.close().map_err(SqlXError::from),
            None => Ok(()),
        };
        self.info.close.end();
        let result = result.map_err(|error| self.fail(error));
        debug!(
            "statement {} closed after {} execution(s)",
            self.info.statement_id, self.info.execute_count
        );
        notify(
            "after_close_statement",
            self.listener.on_after_close_statement(&self.info, result.as_ref().err()),
        );
        self.connection.archive(self.info.clone());
        result
    }
}

impl Drop for StatementCore {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            warn!("closing dropped statement {} failed: {}", self.info.statement_id, error);
        }
    }
}

/// Settings and lifecycle shared by every statement kind
pub trait StatementHandle {
    #[doc(hidden)]
    fn core(&self) -> &StatementCore;
    #[doc(hidden)]
    fn core_mut(&mut self) -> &mut StatementCore;

    fn info(&self) -> &StatementInfo {
        &self.core().info
    }

    fn properties(&self) -> &StatementProperties {
        &self.core().properties
    }

    fn set_fetch_size(&mut self, rows: u32) -> SqlXResult<()> {
        self.core_mut()
            .set_property(|p| p.fetch_size = Some(rows), |s| s.set_fetch_size(rows))
    }

    fn set_fetch_direction(&mut self, direction: FetchDirection) -> SqlXResult<()> {
        self.core_mut()
            .set_property(|p| p.fetch_direction = Some(direction), |s| s.set_fetch_direction(direction))
    }

    fn set_max_rows(&mut self, rows: u64) -> SqlXResult<()> {
        self.core_mut()
            .set_property(|p| p.max_rows = Some(rows), |s| s.set_max_rows(rows))
    }

    fn set_max_field_size(&mut self, bytes: u32) -> SqlXResult<()> {
        self.core_mut()
            .set_property(|p| p.max_field_size = Some(bytes), |s| s.set_max_field_size(bytes))
    }

    fn set_query_timeout(&mut self, timeout: Duration) -> SqlXResult<()> {
        self.core_mut()
            .set_property(|p| p.query_timeout = Some(timeout), |s| s.set_query_timeout(timeout))
    }

    fn set_poolable(&mut self, poolable: bool) -> SqlXResult<()> {
        self.core_mut()
            .set_property(|p| p.poolable = Some(poolable), |s| s.set_poolable(poolable))
    }

    fn set_escape_processing(&mut self, enabled: bool) -> SqlXResult<()> {
        self.core_mut()
            .set_property(|p| p.escape_processing = Some(enabled), |s| s.set_escape_processing(enabled))
    }

    fn set_cursor_name(&mut self, name: &str) -> SqlXResult<()> {
        self.core_mut()
            .set_property(|p| p.cursor_name = Some(name.to_string()), |s| s.set_cursor_name(name))
    }

    fn cancel(&mut self) -> SqlXResult<()> {
        let core = self.core_mut();
        core.ensure_open()?;
        let result = match core.physical.as_mut() {
            Some(physical) => physical.cancel(),
            None => Ok(()),
        };
        result.map_err(|error| core.fail(error))
    }

    fn is_closed(&self) -> bool {
        self.core().closed
    }

    /// Close the physical statement and archive the info. Closing twice is a no-op.
    fn close(&mut self) -> SqlXResult<()> {
        self.core_mut().close()
    }
}

/// Plain statement; SQL arrives with each execution
pub struct ProxyStatement {
    core: StatementCore,
}

impl ProxyStatement {
    pub(crate) fn new(connection: Arc<ConnectionShared>) -> Self {
        Self {
            core: StatementCore::new(connection, StatementKind::Plain),
        }
    }

    /// The physical statement is created on first use and reused afterwards
    fn acquire(&mut self, sql: &str) -> SqlXResult<()> {
        self.core.ensure_open()?;
        if self.core.physical.is_some() {
            self.core.reroute(sql)
        } else {
            self.core.open(sql)
        }
    }

    pub fn execute_query(&mut self, sql: &str) -> SqlXResult<ProxyResultSet<'_>> {
        self.acquire(sql)?;
        let inner = self.core.run(ExecuteKind::Query, |s, sql| s.execute_query(sql))?;
        Ok(ProxyResultSet::new(inner, &mut self.core.info, Arc::clone(&self.core.listener)))
    }

    pub fn execute_update(&mut self, sql: &str) -> SqlXResult<u64> {
        self.acquire(sql)?;
        let rows = self.core.run(ExecuteKind::Update, |s, sql| s.execute_update(sql))?;
        self.core.info.record_updated_rows(rows);
        Ok(rows)
    }

    pub fn execute(&mut self, sql: &str) -> SqlXResult<bool> {
        self.acquire(sql)?;
        self.core.run(ExecuteKind::Execute, |s, sql| s.execute(sql))
    }

    pub fn add_batch(&mut self, sql: &str) -> SqlXResult<()> {
        self.acquire(sql)?;
        let native = self.core.info.native_sql.clone().unwrap_or_else(|| sql.to_string());
        notify("before_add_batch", self.core.listener.on_before_add_batch(&self.core.info));
        let result = self
            .core
            .physical()
            .and_then(|s| s.add_batch(Some(&native)).map_err(SqlXError::from));
        let result = match result {
            Ok(()) => {
                self.core.info.batch.push(native);
                Ok(())
            }
            Err(error) => Err(self.core.fail(error)),
        };
        notify(
            "after_add_batch",
            self.core.listener.on_after_add_batch(&self.core.info, result.as_ref().err()),
        );
        result
    }

    pub fn execute_batch(&mut self) -> SqlXResult<Vec<u64>> {
        if self.core.physical.is_none() {
            self.core.ensure_open()?;
            return Ok(Vec::new());
        }
        let counts = self.core.run(ExecuteKind::Batch, |s, _| s.execute_batch())?;
        self.core.info.record_updated_rows(counts.iter().sum());
        self.core.info.batch.clear();
        Ok(counts)
    }
}

impl StatementHandle for ProxyStatement {
    fn core(&self) -> &StatementCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StatementCore {
        &mut self.core
    }
}

/// Prepared or callable statement; routed once at prepare time
pub struct ProxyPreparedStatement {
    core: StatementCore,
}

impl std::fmt::Debug for ProxyPreparedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyPreparedStatement").finish_non_exhaustive()
    }
}

impl ProxyPreparedStatement {
    pub(crate) fn prepare(connection: Arc<ConnectionShared>, kind: StatementKind, sql: &str) -> SqlXResult<Self> {
        connection.ensure_open()?;
        let mut statement = Self {
            core: StatementCore::new(connection, kind),
        };
        statement.core.open(sql)?;
        Ok(statement)
    }

    fn bind(&mut self, key: ParameterKey, value: Value) -> SqlXResult<()> {
        self.core.ensure_open()?;
        let result = self
            .core
            .physical()
            .and_then(|s| s.bind(&key, &value).map_err(SqlXError::from));
        let result = match result {
            Ok(()) => Ok(()),
            Err(error) => Err(self.core.fail(error)),
        };
        notify(
            "after_set_parameter",
            self.core
                .listener
                .on_after_set_parameter(&self.core.info, &key, &value, result.as_ref().err()),
        );
        if result.is_ok() {
            match key {
                ParameterKey::Index(index) => {
                    self.core.info.parameters.insert(index, value);
                }
                ParameterKey::Name(name) => {
                    self.core.info.named_parameters.insert(name, value);
                }
            }
        }
        result
    }

    /// Bind the 1-based parameter `index`
    pub fn set_parameter(&mut self, index: usize, value: impl Into<Value>) -> SqlXResult<()> {
        if index == 0 {
            return Err(SqlXError::database("parameter index starts at 1"));
        }
        self.bind(ParameterKey::Index(index), value.into())
    }

    pub fn set_null(&mut self, index: usize) -> SqlXResult<()> {
        self.set_parameter(index, Value::Null)
    }

    /// Named parameters exist on callable statements only
    pub fn set_named_parameter(&mut self, name: &str, value: impl Into<Value>) -> SqlXResult<()> {
        if self.core.info.kind != StatementKind::Callable {
            return Err(SqlXError::unsupported("named parameters on a prepared statement"));
        }
        self.bind(ParameterKey::Name(name.to_string()), value.into())
    }

    pub fn clear_parameters(&mut self) -> SqlXResult<()> {
        self.core.ensure_open()?;
        if let Err(error) = self.core.physical().and_then(|s| s.clear_parameters().map_err(SqlXError::from)) {
            return Err(self.core.fail(error));
        }
        self.core.info.parameters.clear();
        self.core.info.named_parameters.clear();
        Ok(())
    }

    pub fn execute_query(&mut self) -> SqlXResult<ProxyResultSet<'_>> {
        let inner = self.core.run(ExecuteKind::Query, |s, _| s.execute_query(None))?;
        Ok(ProxyResultSet::new(inner, &mut self.core.info, Arc::clone(&self.core.listener)))
    }

    pub fn execute_update(&mut self) -> SqlXResult<u64> {
        let rows = self.core.run(ExecuteKind::Update, |s, _| s.execute_update(None))?;
        self.core.info.record_updated_rows(rows);
        Ok(rows)
    }

    pub fn execute(&mut self) -> SqlXResult<bool> {
        self.core.run(ExecuteKind::Execute, |s, _| s.execute(None))
    }

    /// Queue the current parameter set
    pub fn add_batch(&mut self) -> SqlXResult<()> {
        self.core.ensure_open()?;
        notify("before_add_batch", self.core.listener.on_before_add_batch(&self.core.info));
        let result = self
            .core
            .physical()
            .and_then(|s| s.add_batch(None).map_err(SqlXError::from));
        let result = match result {
            Ok(()) => {
                let rendered = self.core.info.sql_with_values().unwrap_or_default();
                self.core.info.batch.push(rendered);
                Ok(())
            }
            Err(error) => Err(self.core.fail(error)),
        };
        notify(
            "after_add_batch",
            self.core.listener.on_after_add_batch(&self.core.info, result.as_ref().err()),
        );
        result
    }

    pub fn execute_batch(&mut self) -> SqlXResult<Vec<u64>> {
        let counts = self.core.run(ExecuteKind::Batch, |s, _| s.execute_batch())?;
        self.core.info.record_updated_rows(counts.iter().sum());
        self.core.info.batch.clear();
        Ok(counts)
    }
}

impl StatementHandle for ProxyPreparedStatement {
    fn core(&self) -> &StatementCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StatementCore {
        &mut self.core
    }
}

/// Rows of a query, counted into the owning statement's info
pub struct ProxyResultSet<'a> {
    inner: Box<dyn PhysicalResultSet>,
    info: &'a mut StatementInfo,
    listener: Arc<dyn EventListener>,
    closed: bool,
}

impl<'a> ProxyResultSet<'a> {
    fn new(inner: Box<dyn PhysicalResultSet>, info: &'a mut StatementInfo, listener: Arc<dyn EventListener>) -> Self {
        Self {
            inner,
            info,
            listener,
            closed: false,
        }
    }

    pub fn next(&mut self) -> SqlXResult<Option<Row>> {
        if self.closed {
            return Err(SqlXError::Closed { resource: "result set" });
        }
        notify("before_result_set_next", self.listener.on_before_result_set_next(&*self.info));
        let started = Instant::now();
        let result = self.inner.next().map_err(SqlXError::from);
        let elapsed = started.elapsed();

        let has_row = matches!(result, Ok(Some(_)));
        if has_row {
            self.info.selected_rows += 1;
        }
        if let Err(error) = &result {
            self.info.add_exception(error.clone());
        }
        notify(
            "after_result_set_next",
            self.listener
                .on_after_result_set_next(&*self.info, elapsed, has_row, result.as_ref().err()),
        );
        result
    }

    /// Drain the remaining rows
    pub fn collect_rows(&mut self) -> SqlXResult<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next()? {
            rows.push(row);
        }
        Ok(rows)
    }

    pub fn close(&mut self) -> SqlXResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.inner.close().map_err(SqlXError::from);
        if let Err(error) = &result {
            self.info.add_exception(error.clone());
        }
        notify(
            "after_result_set_close",
            self.listener.on_after_result_set_close(&*self.info, result.as_ref().err()),
        );
        result
    }
}

impl Drop for ProxyResultSet<'_> {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            warn!("closing dropped result set failed: {}", error);
        }
    }
}
