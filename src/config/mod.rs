/// Configuration management for sqlx-router

use crate::core::{ClusterConfiguration, DataSourceConfiguration, NodeType, PointcutConfiguration, SqlXConfiguration, Topology};
use crate::error::{ConfigError, SqlXResult};
use crate::routing::RoutingSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Main sqlx-router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Routing behavior and global balancers
    #[serde(default)]
    pub routing: RoutingSettings,
    /// Physical database targets
    #[serde(default)]
    pub data_sources: Vec<DataSourceConfiguration>,
    /// Named groups of data sources
    #[serde(default)]
    pub clusters: Vec<ClusterConfiguration>,
    /// Entry point overrides
    #[serde(default)]
    pub pointcuts: Vec<PointcutConfiguration>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
    /// Log to stdout
    pub stdout: bool,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            stdout: true,
            file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            routing: RoutingSettings::default(),
            data_sources: vec![
                DataSourceConfiguration::new("primary", "jdbc:mysql://127.0.0.1:3306/app", NodeType::Write),
                DataSourceConfiguration::new("replica", "jdbc:mysql://127.0.0.1:3307/app", NodeType::Read),
            ],
            clusters: vec![ClusterConfiguration::new("main", ["primary", "replica"]).with_defaulted(true)],
            pointcuts: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate the file-level settings.
    ///
    /// Topology rules (duplicates, cluster membership, pointcut targets) are
    /// checked when the topology is built in `into_configuration`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log level: {}", self.logging.level)
            )),
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log format: {}", self.logging.format)
            )),
        }

        if self.data_sources.is_empty() {
            return Err(ConfigError::ValidationError(
                "dataSources must not be empty".to_string(),
            ));
        }

        if self.routing.heartbeat_enabled && self.routing.heartbeat_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "heartbeat_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Build the live topology aggregate from this configuration
    pub fn into_configuration(self) -> SqlXResult<SqlXConfiguration> {
        self.validate()?;
        let topology = Topology::new(
            self.data_sources,
            self.clusters,
            self.pointcuts,
            self.routing.read_load_balance_type,
            self.routing.write_load_balance_type,
        )?;
        Ok(SqlXConfiguration::new(topology))
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, mode: &str) -> Result<(), ConfigError> {
        let config = match mode {
            "cluster" => Config {
                data_sources: vec![
                    DataSourceConfiguration::new("write-0", "jdbc:mysql://10.0.1.10:3306/app", NodeType::Write)
                        .with_credentials("app", "change-me"),
                    DataSourceConfiguration::new("read-0", "jdbc:mysql://10.0.1.11:3306/app", NodeType::Read)
                        .with_credentials("app", "change-me")
                        .with_weight(2),
                    DataSourceConfiguration::new("read-1", "jdbc:mysql://10.0.1.12:3306/app", NodeType::Read)
                        .with_credentials("app", "change-me"),
                ],
                clusters: vec![
                    ClusterConfiguration::new("main", ["write-0", "read-0", "read-1"]).with_defaulted(true),
                ],
                pointcuts: vec![PointcutConfiguration::new("report.*").with_nodes(["read-1"])],
                ..Default::default()
            },
            "standalone" => Config {
                data_sources: vec![
                    DataSourceConfiguration::new("primary", "jdbc:postgresql://10.0.1.20:5432/app", NodeType::ReadWrite)
                        .with_defaulted(true),
                ],
                clusters: Vec::new(),
                ..Default::default()
            },
            _ => return Err(ConfigError::ValidationError(
                "Mode must be 'cluster' or 'standalone'".to_string(),
            )),
        };

        config.save_to_file(path)
    }
}
