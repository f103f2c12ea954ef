use crate::core::{NodeAttribute, NodeType};
use crate::error::{SqlXError, SqlXResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

pub const DEFAULT_HEARTBEAT_SQL: &str = "SELECT 1";
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;

/// Connection parameters for one physical database target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceConfiguration {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Driver identifier handed to the connection factory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub node_type: NodeType,
    /// Ungrouped fallback target when no cluster applies
    #[serde(default)]
    pub defaulted: bool,
    #[serde(default = "default_heartbeat_sql", skip_serializing_if = "Option::is_none")]
    pub heartbeat_sql: Option<String>,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Driver specific properties passed through untouched
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub props: BTreeMap<String, String>,
    #[serde(skip)]
    node_attribute: OnceLock<Arc<NodeAttribute>>,
}

fn default_weight() -> u32 {
    1
}

fn default_heartbeat_sql() -> Option<String> {
    Some(DEFAULT_HEARTBEAT_SQL.to_string())
}

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

impl DataSourceConfiguration {
    pub fn new(name: impl Into<String>, url: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            username: None,
            password: None,
            driver: None,
            weight: default_weight(),
            node_type,
            defaulted: false,
            heartbeat_sql: default_heartbeat_sql(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            props: BTreeMap::new(),
            node_attribute: OnceLock::new(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_defaulted(mut self, defaulted: bool) -> Self {
        self.defaulted = defaulted;
        self
    }

    pub fn with_heartbeat_sql(mut self, sql: Option<String>) -> Self {
        self.heartbeat_sql = sql;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// The node derived from this data source, built on first access and then shared
    pub fn node_attribute(&self) -> Arc<NodeAttribute> {
        self.node_attribute
            .get_or_init(|| {
                let heartbeat_sql = self
                    .heartbeat_sql
                    .as_ref()
                    .filter(|sql| !sql.trim().is_empty())
                    .cloned();
                Arc::new(
                    NodeAttribute::new(&self.name, &self.url, self.node_type, self.weight)
                        .with_heartbeat(heartbeat_sql, self.heartbeat_interval()),
                )
            })
            .clone()
    }

    pub fn database_type(&self) -> Option<String> {
        crate::utils::database_type_of(&self.url)
    }

    /// Standalone checks; topology-wide rules live in `Topology::validate`
    pub fn validate(&self) -> SqlXResult<()> {
        if self.name.trim().is_empty() {
            return Err(SqlXError::config("dataSources [name] attr must not be empty"));
        }
        if self.url.trim().is_empty() {
            return Err(SqlXError::config(format!(
                "dataSources [{}] [url] attr must not be empty",
                self.name
            )));
        }
        if self.database_type().is_none() {
            return Err(SqlXError::config(format!(
                "dataSources [{}] url {} has no database scheme",
                self.name, self.url
            )));
        }
        if let Some(driver) = &self.driver {
            if driver.trim().is_empty() || driver.chars().any(char::is_whitespace) {
                return Err(SqlXError::config(format!(
                    "dataSources [{}] driver [{}] is not a valid identifier",
                    self.name, driver
                )));
            }
        }
        if self.heartbeat_sql.is_some() && self.heartbeat_interval_ms == 0 {
            return Err(SqlXError::config(format!(
                "dataSources [{}] heartbeat interval must be greater than 0",
                self.name
            )));
        }
        Ok(())
    }
}

impl PartialEq for DataSourceConfiguration {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for DataSourceConfiguration {}
