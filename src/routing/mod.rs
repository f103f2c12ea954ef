/// Per-statement routing: cluster resolution, rule chain and the RouteInfo record
pub mod rule;
pub mod sql;

use crate::balancer::{ReadLoadBalanceType, WriteLoadBalanceType};
use crate::core::{NodeAttribute, SqlXConfiguration};
use crate::error::{SqlXError, SqlXResult};
use crate::utils::{generate_id, Timing};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

pub use rule::RouteRule;
pub use sql::{SimpleSqlClassifier, SqlAttribute, SqlClassifier, SqlType, NODE_NAME_HINT};

/// What to do with a write issued on a connection already bound to a node that cannot write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StickyWritePolicy {
    /// Keep using the bound connection
    #[default]
    Sticky,
    /// Fail the statement with a routing error
    Reject,
}

/// What to do when the classifier rejects a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlParsingFailBehavior {
    /// Log and route as unclassified
    #[default]
    Warning,
    Error,
}

/// Routing options from the `[routing]` config section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingSettings {
    #[serde(default)]
    pub sticky_write_policy: StickyWritePolicy,
    #[serde(default)]
    pub sql_parsing_fail_behavior: SqlParsingFailBehavior,
    /// Balancers used when no cluster applies
    #[serde(default)]
    pub read_load_balance_type: ReadLoadBalanceType,
    #[serde(default)]
    pub write_load_balance_type: WriteLoadBalanceType,
    #[serde(default = "default_heartbeat_enabled")]
    pub heartbeat_enabled: bool,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
}

fn default_heartbeat_enabled() -> bool {
    true
}

fn default_heartbeat_timeout_ms() -> u64 {
    5000
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            sticky_write_policy: StickyWritePolicy::default(),
            sql_parsing_fail_behavior: SqlParsingFailBehavior::default(),
            read_load_balance_type: ReadLoadBalanceType::default(),
            write_load_balance_type: WriteLoadBalanceType::default(),
            heartbeat_enabled: default_heartbeat_enabled(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

/// Explicit override attached to a logical connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingAttribute {
    pub cluster: Option<String>,
    pub nodes: Vec<String>,
    pub propagation: bool,
}

impl RoutingAttribute {
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            cluster: Some(name.into()),
            nodes: Vec::new(),
            propagation: true,
        }
    }

    pub fn nodes<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cluster: None,
            nodes: nodes.into_iter().map(Into::into).collect(),
            propagation: true,
        }
    }

    /// Restrict the forced nodes to those of the named cluster
    pub fn with_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes = nodes.into_iter().map(Into::into).collect();
        self
    }
}

/// Routing group label for statements resolved without a cluster
pub const NONE_CLUSTER_GROUP: &str = "none-cluster";

/// The routing record of one statement
#[derive(Debug, Clone)]
pub struct RouteInfo {
    pub route_id: String,
    pub sql: Option<String>,
    pub sql_attribute: Option<SqlAttribute>,
    pub cluster: Option<String>,
    pub hit_routing_group: Option<String>,
    pub hit_rule: Option<RouteRule>,
    pub hit_node_attr: Option<Arc<NodeAttribute>>,
    pub transaction_active: bool,
    pub transaction_id: Option<String>,
    pub transaction_name: Option<String>,
    pub timing: Timing,
    pub exception: Option<SqlXError>,
}

impl RouteInfo {
    pub fn new(sql: Option<&str>) -> Self {
        Self {
            route_id: generate_id("route"),
            sql: sql.map(str::to_string),
            sql_attribute: None,
            cluster: None,
            hit_routing_group: None,
            hit_rule: None,
            hit_node_attr: None,
            transaction_active: false,
            transaction_id: None,
            transaction_name: None,
            timing: Timing::default(),
            exception: None,
        }
    }

    pub fn native_sql(&self) -> Option<&str> {
        self.sql_attribute
            .as_ref()
            .map(|a| a.native_sql.as_str())
            .or(self.sql.as_deref())
    }

    pub fn is_write(&self) -> bool {
        self.sql_attribute.as_ref().map_or(true, SqlAttribute::is_write)
    }

    pub fn succeeded(&self) -> bool {
        self.exception.is_none() && self.hit_node_attr.is_some()
    }
}

/// Chooses the node for a statement from the current topology snapshot
pub struct Router {
    configuration: Arc<SqlXConfiguration>,
    classifier: Arc<dyn SqlClassifier>,
    fail_behavior: SqlParsingFailBehavior,
}

impl Router {
    pub fn new(
        configuration: Arc<SqlXConfiguration>,
        classifier: Arc<dyn SqlClassifier>,
        fail_behavior: SqlParsingFailBehavior,
    ) -> Self {
        Self {
            configuration,
            classifier,
            fail_behavior,
        }
    }

    pub fn configuration(&self) -> &Arc<SqlXConfiguration> {
        &self.configuration
    }

    /// Classify once per statement; a rejected statement is unclassified under `Warning`
    pub fn classify(&self, sql: &str) -> SqlXResult<Option<SqlAttribute>> {
        match self.classifier.classify(sql) {
            Ok(attribute) => Ok(Some(attribute)),
            Err(error) => match self.fail_behavior {
                SqlParsingFailBehavior::Warning => {
                    warn!("sql classification failed, routing as unclassified: {}", error);
                    Ok(None)
                }
                SqlParsingFailBehavior::Error => Err(error),
            },
        }
    }

    /// Resolve the cluster and run the rule chain, filling in `info`
    pub fn route(&self, info: &mut RouteInfo, routing: Option<&RoutingAttribute>) -> SqlXResult<Arc<NodeAttribute>> {
        let topology = self.configuration.snapshot();

        let cluster = match routing.and_then(|r| r.cluster.as_deref()) {
            Some(name) => Some(
                topology
                    .cluster(name)
                    .ok_or_else(|| SqlXError::routing(format!("cluster [{}] does not exist", name)))?,
            ),
            None => topology.default_cluster(),
        };
        info.cluster = cluster.map(|c| c.name.clone());
        info.hit_routing_group = Some(match cluster {
            Some(c) => format!("cluster:{}", c.name),
            None => NONE_CLUSTER_GROUP.to_string(),
        });

        let chain: &[RouteRule] = if cluster.is_some() {
            &RouteRule::CLUSTER_CHAIN
        } else {
            &RouteRule::NONE_CLUSTER_CHAIN
        };
        let context = rule::RuleContext {
            topology: &topology,
            cluster: cluster.map(|c| c.as_ref()),
            attribute: info.sql_attribute.as_ref(),
            routing,
        };

        let mut hit = None;
        for rule in chain {
            match rule.evaluate(&context)? {
                Some(node) if node.is_available() => {
                    hit = Some((*rule, node));
                    break;
                }
                Some(node) => warn!("{} hit node {} in state {}, trying next rule", rule, node.name(), node.state()),
                None => {}
            }
        }

        let (rule, node) = hit.ok_or_else(|| {
            SqlXError::routing(format!(
                "no route rule produced an available node in {}",
                info.hit_routing_group.as_deref().unwrap_or(NONE_CLUSTER_GROUP)
            ))
        })?;
        debug!("{} routed to {} by {}", info.route_id, node.name(), rule);
        info.hit_rule = Some(rule);
        info.hit_node_attr = Some(Arc::clone(&node));
        Ok(node)
    }
}
