/// Route rules, evaluated in order until one names a node
use crate::core::{ClusterConfiguration, NodeAttribute, Topology};
use crate::error::{SqlXError, SqlXResult};
use crate::routing::sql::{SqlAttribute, NODE_NAME_HINT};
use crate::routing::RoutingAttribute;
use rand::seq::SliceRandom;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteRule {
    /// The only data source when nothing is grouped
    SingleDataSource,
    /// `/*!nodeName=...*/` hint
    DataSourceNameHint,
    /// Nodes named by an explicit routing attribute
    Force,
    ReadWriteSplitting,
    /// Unclassified statements go to a writer
    NullSqlAttribute,
    DefaultDataSource,
    /// Reuse of the node the connection is already bound to
    Sticky,
}

impl RouteRule {
    pub const CLUSTER_CHAIN: [RouteRule; 4] = [
        RouteRule::DataSourceNameHint,
        RouteRule::Force,
        RouteRule::ReadWriteSplitting,
        RouteRule::NullSqlAttribute,
    ];

    pub const NONE_CLUSTER_CHAIN: [RouteRule; 6] = [
        RouteRule::SingleDataSource,
        RouteRule::DataSourceNameHint,
        RouteRule::Force,
        RouteRule::DefaultDataSource,
        RouteRule::ReadWriteSplitting,
        RouteRule::NullSqlAttribute,
    ];

    /// `Ok(None)` means the rule does not apply and the next one is tried
    pub(crate) fn evaluate(self, context: &RuleContext<'_>) -> SqlXResult<Option<Arc<NodeAttribute>>> {
        match self {
            RouteRule::SingleDataSource => Ok(match context.topology.data_sources() {
                [only] => Some(only.node_attribute()),
                _ => None,
            }),
            RouteRule::DataSourceNameHint => Ok(context.hinted_node()),
            RouteRule::Force => context.forced_node(),
            RouteRule::ReadWriteSplitting => match context.attribute {
                Some(attribute) if attribute.is_write() => context.choose_writer(),
                Some(_) => context.choose_reader(),
                None => Ok(None),
            },
            RouteRule::NullSqlAttribute => match context.attribute {
                None => context.choose_writer(),
                Some(_) => Ok(None),
            },
            RouteRule::DefaultDataSource => Ok(context.topology.default_data_source().map(|d| d.node_attribute())),
            RouteRule::Sticky => Ok(None),
        }
    }
}

impl fmt::Display for RouteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouteRule::SingleDataSource => "SingleDataSourceRule",
            RouteRule::DataSourceNameHint => "DataSourceNameSqlHintRule",
            RouteRule::Force => "ForceRouteRule",
            RouteRule::ReadWriteSplitting => "ReadWriteSplittingRule",
            RouteRule::NullSqlAttribute => "NullSqlAttributeRule",
            RouteRule::DefaultDataSource => "DefaultDataSourceRule",
            RouteRule::Sticky => "StickyRule",
        };
        write!(f, "{}", name)
    }
}

/// Inputs shared by every rule of one routing decision
pub(crate) struct RuleContext<'a> {
    pub topology: &'a Topology,
    pub cluster: Option<&'a ClusterConfiguration>,
    pub attribute: Option<&'a SqlAttribute>,
    pub routing: Option<&'a RoutingAttribute>,
}

impl RuleContext<'_> {
    fn lookup(&self, name: &str) -> Option<Arc<NodeAttribute>> {
        match self.cluster {
            Some(cluster) => cluster.node_attribute(name).cloned(),
            None => self.topology.node_attribute(name),
        }
    }

    fn hinted_node(&self) -> Option<Arc<NodeAttribute>> {
        let name = self.attribute?.hint(NODE_NAME_HINT)?;
        let node = self.lookup(name);
        if node.is_none() {
            warn!("sql hint names unknown node {}", name);
        }
        node
    }

    fn forced_node(&self) -> SqlXResult<Option<Arc<NodeAttribute>>> {
        let Some(routing) = self.routing.filter(|r| !r.nodes.is_empty()) else {
            return Ok(None);
        };
        // Without a named cluster the nodes are resolved against the whole topology
        let scoped = routing.cluster.is_some();
        let mut candidates: Vec<Arc<NodeAttribute>> = routing
            .nodes
            .iter()
            .filter_map(|name| {
                let node = if scoped { self.lookup(name) } else { self.topology.node_attribute(name) };
                if node.is_none() {
                    warn!("forced node {} is not part of the routing group", name);
                }
                node
            })
            .collect();

        let is_write = self.attribute.map_or(true, SqlAttribute::is_write);
        if scoped && is_write {
            candidates.retain(|node| node.node_type().can_write());
            if candidates.is_empty() {
                return Err(SqlXError::routing(format!(
                    "write statement forced to nodes {:?}, none of which can write",
                    routing.nodes
                )));
            }
        }

        candidates.retain(|node| node.is_available());
        Ok(candidates.choose(&mut rand::thread_rng()).cloned())
    }

    fn choose_writer(&self) -> SqlXResult<Option<Arc<NodeAttribute>>> {
        let balancer = match self.cluster {
            Some(cluster) => cluster.write_load_balance(),
            None => self.topology.write_load_balance(),
        };
        balancer.map(|lb| lb.choose()).transpose()
    }

    fn choose_reader(&self) -> SqlXResult<Option<Arc<NodeAttribute>>> {
        let balancer = match self.cluster {
            Some(cluster) => cluster.read_load_balance(),
            None => self.topology.read_load_balance(),
        };
        balancer.map(|lb| lb.choose()).transpose()
    }
}
