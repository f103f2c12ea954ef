use crate::error::{SqlXError, SqlXResult};
use crate::routing::RoutingAttribute;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Explicit routing override attached to an application entry point.
///
/// `expression` is matched against the name the application passes to
/// `SqlXDataSource::get_connection_for`; a trailing `*` matches any suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointcutConfiguration {
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default = "default_propagation")]
    pub propagation: bool,
}

fn default_propagation() -> bool {
    true
}

impl PointcutConfiguration {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            cluster: None,
            nodes: Vec::new(),
            propagation: default_propagation(),
        }
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    pub fn with_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> SqlXResult<()> {
        if self.expression.trim().is_empty() {
            return Err(SqlXError::config("pointcuts [expression] attr must not be empty"));
        }
        let has_cluster = self.cluster.as_deref().is_some_and(|c| !c.trim().is_empty());
        if !has_cluster && self.nodes.is_empty() {
            return Err(SqlXError::config(format!(
                "pointcut {} [cluster] or [nodes] attr must not be empty",
                self.expression
            )));
        }
        Ok(())
    }

    pub fn matches(&self, target: &str) -> bool {
        match self.expression.strip_suffix('*') {
            Some(prefix) => target.starts_with(prefix),
            None => self.expression == target,
        }
    }

    pub fn remove_node(&mut self, name: &str) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|node| node != name);
        let removed = self.nodes.len() != before;
        if removed {
            info!("pointcut {} remove node {}", self.expression, name);
        }
        removed
    }

    pub fn routing_attribute(&self) -> RoutingAttribute {
        RoutingAttribute {
            cluster: self.cluster.clone(),
            nodes: self.nodes.clone(),
            propagation: self.propagation,
        }
    }
}
