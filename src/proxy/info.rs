use crate::core::NodeAttribute;
use crate::error::SqlXError;
use crate::proxy::{StatementKind, Value};
use crate::routing::RouteInfo;
use crate::utils::{generate_id, Timing};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Everything recorded about one logical connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub transaction_id: Option<String>,
    pub transaction_name: Option<String>,
    /// One entry per routed statement, failed routes included
    pub route_infos: Vec<RouteInfo>,
    /// Statements closed on this connection
    pub statement_infos: Vec<StatementInfo>,
    pub bound_node: Option<Arc<NodeAttribute>>,
    pub get_connection: Timing,
    pub commit: Timing,
    pub rollback: Timing,
    pub close: Timing,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub exceptions: Vec<SqlXError>,
}

impl ConnectionInfo {
    pub fn new() -> Self {
        Self {
            connection_id: generate_id("conn"),
            transaction_id: None,
            transaction_name: None,
            route_infos: Vec::new(),
            statement_infos: Vec::new(),
            bound_node: None,
            get_connection: Timing::default(),
            commit: Timing::default(),
            rollback: Timing::default(),
            close: Timing::default(),
            commit_count: 0,
            rollback_count: 0,
            exceptions: Vec::new(),
        }
    }

    pub fn current_route_info(&self) -> Option<&RouteInfo> {
        self.route_infos.last()
    }

    pub fn get_connection_elapsed(&self) -> Option<Duration> {
        self.get_connection.elapsed()
    }

    pub fn commit_elapsed(&self) -> Option<Duration> {
        self.commit.elapsed()
    }

    pub fn rollback_elapsed(&self) -> Option<Duration> {
        self.rollback.elapsed()
    }

    /// From physical acquisition to the end of close
    pub fn alive_duration(&self) -> Option<Duration> {
        let acquired = self.get_connection.after()?;
        let closed = self.close.after()?;
        Some(closed.instant.saturating_duration_since(acquired.instant))
    }

    pub fn total_execute_time(&self) -> Duration {
        self.statement_infos.iter().map(|s| s.total_execute_time).sum()
    }

    pub fn total_selected_rows(&self) -> u64 {
        self.statement_infos.iter().map(|s| s.selected_rows).sum()
    }

    pub fn total_updated_rows(&self) -> u64 {
        self.statement_infos.iter().map(|s| s.total_updated_rows).sum()
    }

    pub fn route_count(&self) -> usize {
        self.route_infos.len()
    }
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything recorded about one statement object
#[derive(Debug, Clone)]
pub struct StatementInfo {
    pub statement_id: String,
    pub connection_id: String,
    pub kind: StatementKind,
    pub route_info: Option<RouteInfo>,
    pub sql: Option<String>,
    pub native_sql: Option<String>,
    /// Ordinal parameters by 1-based position
    pub parameters: BTreeMap<usize, Value>,
    /// Named parameters of callable statements
    pub named_parameters: BTreeMap<String, Value>,
    pub batch: Vec<String>,
    pub create: Timing,
    pub execute: Timing,
    pub close: Timing,
    pub execute_count: u64,
    pub total_execute_time: Duration,
    pub updated_rows: u64,
    pub total_updated_rows: u64,
    pub selected_rows: u64,
    pub exceptions: Vec<SqlXError>,
}

impl StatementInfo {
    pub fn new(kind: StatementKind, connection_id: &str) -> Self {
        Self {
            statement_id: generate_id("stmt"),
            connection_id: connection_id.to_string(),
            kind,
            route_info: None,
            sql: None,
            native_sql: None,
            parameters: BTreeMap::new(),
            named_parameters: BTreeMap::new(),
            batch: Vec::new(),
            create: Timing::default(),
            execute: Timing::default(),
            close: Timing::default(),
            execute_count: 0,
            total_execute_time: Duration::ZERO,
            updated_rows: 0,
            total_updated_rows: 0,
            selected_rows: 0,
            exceptions: Vec::new(),
        }
    }

    pub fn execute_elapsed(&self) -> Option<Duration> {
        self.execute.elapsed()
    }

    pub fn record_updated_rows(&mut self, rows: u64) {
        self.updated_rows = rows;
        self.total_updated_rows += rows;
    }

    pub fn add_exception(&mut self, error: SqlXError) {
        self.exceptions.push(error);
    }

    /// SQL with bound values substituted for display.
    ///
    /// Prepared statements replace each `?` in order; callable statements
    /// with named parameters append `name:value` pairs.
    pub fn sql_with_values(&self) -> Option<String> {
        let sql = self.native_sql.as_deref().or(self.sql.as_deref())?;
        match self.kind {
            StatementKind::Plain => Some(sql.to_string()),
            StatementKind::Prepared | StatementKind::Callable if self.named_parameters.is_empty() => {
                let mut rendered = String::with_capacity(sql.len());
                let mut position = 0usize;
                for c in sql.chars() {
                    if c == '?' {
                        position += 1;
                        match self.parameters.get(&position) {
                            Some(value) => rendered.push_str(&value.to_string()),
                            None => rendered.push('?'),
                        }
                    } else {
                        rendered.push(c);
                    }
                }
                Some(rendered)
            }
            _ => {
                let values: Vec<String> = self
                    .named_parameters
                    .iter()
                    .map(|(name, value)| format!("{}:{}", name, value))
                    .collect();
                Some(format!("{} [{}]", sql, values.join(", ")))
            }
        }
    }
}
