/// Logical connections and statements over lazily acquired physical connections
pub mod connection;
pub mod info;
pub mod statement;

use crate::core::DataSourceConfiguration;
use crate::error::{DatabaseError, DbResult};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub use connection::{ConnectionProperties, ProxyConnection};
pub use info::{ConnectionInfo, StatementInfo};
pub use statement::{
    ProxyPreparedStatement, ProxyResultSet, ProxyStatement, StatementHandle, StatementProperties,
};

/// A bound parameter or column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(value) => write!(f, "{}", value),
            Value::Int(value) => write!(f, "{}", value),
            Value::Float(value) => write!(f, "{}", value),
            Value::Text(value) => write!(f, "'{}'", value.replace('\'', "''")),
            Value::Bytes(value) => write!(f, "x'{}'", hex::encode(value)),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// One fetched row
pub type Row = Vec<Value>;

/// Ordinal (1-based) or named statement parameter
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParameterKey {
    Index(usize),
    Name(String),
}

impl fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterKey::Index(index) => write!(f, "{}", index),
            ParameterKey::Name(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holdability {
    HoldCursorsOverCommit,
    CloseCursorsAtCommit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDirection {
    Forward,
    Reverse,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    pub id: u64,
    pub name: Option<String>,
}

/// Credentials overriding those of the data source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Plain,
    Prepared,
    Callable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteKind {
    Query,
    Update,
    Execute,
    Batch,
}

impl fmt::Display for ExecuteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecuteKind::Query => write!(f, "executeQuery"),
            ExecuteKind::Update => write!(f, "executeUpdate"),
            ExecuteKind::Execute => write!(f, "execute"),
            ExecuteKind::Batch => write!(f, "executeBatch"),
        }
    }
}

fn unsupported<T>(operation: &str) -> DbResult<T> {
    Err(DatabaseError::new(format!("{} is not supported by this driver", operation)).with_sql_state("0A000"))
}

/// Opens physical connections to data sources
pub trait ConnectionFactory: Send + Sync {
    fn connect(
        &self,
        data_source: &DataSourceConfiguration,
        credentials: Option<&Credentials>,
    ) -> DbResult<Box<dyn PhysicalConnection>>;
}

/// A connection of the underlying database client
pub trait PhysicalConnection: Send {
    fn set_auto_commit(&mut self, auto_commit: bool) -> DbResult<()>;
    fn set_read_only(&mut self, read_only: bool) -> DbResult<()>;
    fn set_transaction_isolation(&mut self, level: IsolationLevel) -> DbResult<()>;

    fn set_schema(&mut self, _schema: &str) -> DbResult<()> {
        unsupported("setSchema")
    }

    fn set_catalog(&mut self, _catalog: &str) -> DbResult<()> {
        unsupported("setCatalog")
    }

    fn catalog(&mut self) -> DbResult<Option<String>> {
        Ok(None)
    }

    fn set_holdability(&mut self, _holdability: Holdability) -> DbResult<()> {
        unsupported("setHoldability")
    }

    fn set_client_info(&mut self, _name: &str, _value: &str) -> DbResult<()> {
        unsupported("setClientInfo")
    }

    fn set_type_map(&mut self, _type_map: &BTreeMap<String, String>) -> DbResult<()> {
        unsupported("setTypeMap")
    }

    fn set_network_timeout(&mut self, _timeout: Duration) -> DbResult<()> {
        unsupported("setNetworkTimeout")
    }

    fn commit(&mut self) -> DbResult<()>;
    fn rollback(&mut self) -> DbResult<()>;

    fn set_savepoint(&mut self, _name: Option<&str>) -> DbResult<Savepoint> {
        unsupported("setSavepoint")
    }

    fn rollback_to_savepoint(&mut self, _savepoint: &Savepoint) -> DbResult<()> {
        unsupported("rollback(Savepoint)")
    }

    fn release_savepoint(&mut self, _savepoint: &Savepoint) -> DbResult<()> {
        unsupported("releaseSavepoint")
    }

    /// `sql` is the native SQL for prepared and callable statements
    fn create_statement(&mut self, kind: StatementKind, sql: Option<&str>) -> DbResult<Box<dyn PhysicalStatement>>;

    fn is_valid(&mut self, _timeout: Duration) -> DbResult<bool> {
        Ok(true)
    }

    fn close(&mut self) -> DbResult<()>;
}

/// A statement of the underlying database client.
///
/// `sql` is `Some` for plain statements and `None` for prepared ones.
pub trait PhysicalStatement: Send {
    fn set_fetch_size(&mut self, _rows: u32) -> DbResult<()> {
        Ok(())
    }

    fn set_fetch_direction(&mut self, _direction: FetchDirection) -> DbResult<()> {
        Ok(())
    }

    fn set_max_rows(&mut self, _rows: u64) -> DbResult<()> {
        Ok(())
    }

    fn set_max_field_size(&mut self, _bytes: u32) -> DbResult<()> {
        Ok(())
    }

    fn set_query_timeout(&mut self, _timeout: Duration) -> DbResult<()> {
        Ok(())
    }

    fn set_poolable(&mut self, _poolable: bool) -> DbResult<()> {
        Ok(())
    }

    fn set_escape_processing(&mut self, _enabled: bool) -> DbResult<()> {
        Ok(())
    }

    fn set_cursor_name(&mut self, _name: &str) -> DbResult<()> {
        unsupported("setCursorName")
    }

    fn bind(&mut self, _key: &ParameterKey, _value: &Value) -> DbResult<()> {
        unsupported("parameter binding")
    }

    fn clear_parameters(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn execute_query(&mut self, sql: Option<&str>) -> DbResult<Box<dyn PhysicalResultSet>>;
    fn execute_update(&mut self, sql: Option<&str>) -> DbResult<u64>;
    fn execute(&mut self, sql: Option<&str>) -> DbResult<bool>;

    fn add_batch(&mut self, _sql: Option<&str>) -> DbResult<()> {
        unsupported("addBatch")
    }

    fn execute_batch(&mut self) -> DbResult<Vec<u64>> {
        unsupported("executeBatch")
    }

    fn cancel(&mut self) -> DbResult<()> {
        unsupported("cancel")
    }

    fn close(&mut self) -> DbResult<()>;
}

/// Rows of an executed query
pub trait PhysicalResultSet: Send {
    fn next(&mut self) -> DbResult<Option<Row>>;

    fn close(&mut self) -> DbResult<()> {
        Ok(())
    }
}
