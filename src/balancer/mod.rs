/// Weighted load balancing over a dynamic node set
pub mod random;
pub mod round_robin;

use crate::core::{NodeAttribute, NodeType};
use crate::error::{SqlXError, SqlXResult};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

pub use random::WeightRandom;
pub use round_robin::WeightRoundRobin;

/// Snapshot of a balancer's members
pub type Members = Arc<Vec<Arc<NodeAttribute>>>;

/// Load balancing algorithm trait
pub trait LoadBalancingAlgorithm: Send + Sync {
    /// Select a node from the members, skipping unavailable ones
    fn select(&self, members: &Members) -> Option<Arc<NodeAttribute>>;
}

/// Selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    WeightRandom,
    WeightRoundRobin,
}

/// Which node types a balancer accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeScope {
    /// Every read-capable node
    Readable,
    ReadOnly,
    ReadWrite,
    /// Every write-capable node
    Writable,
    WriteOnly,
}

impl NodeScope {
    /// Independent nodes never join a balancer
    pub fn admits(self, node_type: NodeType) -> bool {
        match self {
            NodeScope::Readable => node_type.can_read() && node_type != NodeType::Independent,
            NodeScope::Writable => node_type.can_write() && node_type != NodeType::Independent,
            NodeScope::ReadOnly => node_type == NodeType::Read,
            NodeScope::WriteOnly => node_type == NodeType::Write,
            NodeScope::ReadWrite => node_type == NodeType::ReadWrite,
        }
    }
}

impl fmt::Display for NodeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeScope::Readable => write!(f, "readable"),
            NodeScope::ReadOnly => write!(f, "read-only"),
            NodeScope::ReadWrite => write!(f, "read-write"),
            NodeScope::Writable => write!(f, "writable"),
            NodeScope::WriteOnly => write!(f, "write-only"),
        }
    }
}

/// Policy and scope of one balancer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceSpec {
    pub policy: Policy,
    pub scope: NodeScope,
}

/// Read-side balancer kinds accepted in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadLoadBalanceType {
    #[default]
    WeightRandomBalanceReadable,
    WeightRandomBalanceOnlyRead,
    WeightRandomBalanceReadWrite,
    WeightRoundRobinBalanceReadable,
    WeightRoundRobinBalanceOnlyRead,
    WeightRoundRobinBalanceReadWrite,
}

impl From<ReadLoadBalanceType> for BalanceSpec {
    fn from(kind: ReadLoadBalanceType) -> Self {
        use ReadLoadBalanceType::*;
        let (policy, scope) = match kind {
            WeightRandomBalanceReadable => (Policy::WeightRandom, NodeScope::Readable),
            WeightRandomBalanceOnlyRead => (Policy::WeightRandom, NodeScope::ReadOnly),
            WeightRandomBalanceReadWrite => (Policy::WeightRandom, NodeScope::ReadWrite),
            WeightRoundRobinBalanceReadable => (Policy::WeightRoundRobin, NodeScope::Readable),
            WeightRoundRobinBalanceOnlyRead => (Policy::WeightRoundRobin, NodeScope::ReadOnly),
            WeightRoundRobinBalanceReadWrite => (Policy::WeightRoundRobin, NodeScope::ReadWrite),
        };
        BalanceSpec { policy, scope }
    }
}

/// Write-side balancer kinds accepted in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteLoadBalanceType {
    #[default]
    WeightRandomBalanceWritable,
    WeightRandomBalanceWriteOnly,
    WeightRandomBalanceReadWrite,
    WeightRoundRobinBalanceWritable,
    WeightRoundRobinBalanceWriteOnly,
    WeightRoundRobinBalanceReadWrite,
}

impl From<WriteLoadBalanceType> for BalanceSpec {
    fn from(kind: WriteLoadBalanceType) -> Self {
        use WriteLoadBalanceType::*;
        let (policy, scope) = match kind {
            WeightRandomBalanceWritable => (Policy::WeightRandom, NodeScope::Writable),
            WeightRandomBalanceWriteOnly => (Policy::WeightRandom, NodeScope::WriteOnly),
            WeightRandomBalanceReadWrite => (Policy::WeightRandom, NodeScope::ReadWrite),
            WeightRoundRobinBalanceWritable => (Policy::WeightRoundRobin, NodeScope::Writable),
            WeightRoundRobinBalanceWriteOnly => (Policy::WeightRoundRobin, NodeScope::WriteOnly),
            WeightRoundRobinBalanceReadWrite => (Policy::WeightRoundRobin, NodeScope::ReadWrite),
        };
        BalanceSpec { policy, scope }
    }
}

#[derive(Clone)]
enum Algorithm {
    WeightRandom(WeightRandom),
    WeightRoundRobin(WeightRoundRobin),
}

impl LoadBalancingAlgorithm for Algorithm {
    fn select(&self, members: &Members) -> Option<Arc<NodeAttribute>> {
        match self {
            Algorithm::WeightRandom(algorithm) => algorithm.select(members),
            Algorithm::WeightRoundRobin(algorithm) => algorithm.select(members),
        }
    }
}

/// Weighted selection over the nodes admitted by a scope.
///
/// Members live behind an `ArcSwap`: `choose` reads a snapshot without
/// locking while `add_option`/`remove_option` publish a fresh vector.
pub struct LoadBalancer {
    spec: BalanceSpec,
    options: ArcSwap<Vec<Arc<NodeAttribute>>>,
    algorithm: Algorithm,
}

impl LoadBalancer {
    /// Build a balancer over the admitted subset of `nodes`; an empty subset is a configuration error
    pub fn new<S, I>(spec: S, nodes: I) -> SqlXResult<Self>
    where
        S: Into<BalanceSpec>,
        I: IntoIterator<Item = Arc<NodeAttribute>>,
    {
        let spec = spec.into();
        let mut options: Vec<Arc<NodeAttribute>> = Vec::new();
        for node in nodes {
            if spec.scope.admits(node.node_type()) && !options.iter().any(|o| o.name() == node.name()) {
                options.push(node);
            }
        }
        if options.is_empty() {
            return Err(SqlXError::config(format!(
                "{} node is 0, load balancer {:?} requires at least one {} node",
                spec.scope, spec.policy, spec.scope
            )));
        }

        let algorithm = match spec.policy {
            Policy::WeightRandom => Algorithm::WeightRandom(WeightRandom::new()),
            Policy::WeightRoundRobin => Algorithm::WeightRoundRobin(WeightRoundRobin::new()),
        };

        Ok(Self {
            spec,
            options: ArcSwap::from_pointee(options),
            algorithm,
        })
    }

    pub fn spec(&self) -> BalanceSpec {
        self.spec
    }

    /// Add a node if the scope admits it; returns whether the member set changed
    pub fn add_option(&self, node: Arc<NodeAttribute>) -> bool {
        if !self.spec.scope.admits(node.node_type()) {
            debug!("Node {} not admitted by {} balancer", node.name(), self.spec.scope);
            return false;
        }
        let mut added = false;
        self.options.rcu(|current| {
            added = false;
            if current.iter().any(|o| o.name() == node.name()) {
                return Arc::clone(current);
            }
            added = true;
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&node));
            Arc::new(next)
        });
        if added {
            info!("Added {} to {} load balancer", node.name(), self.spec.scope);
        }
        added
    }

    /// Remove a node by name; returns whether the member set changed
    pub fn remove_option(&self, name: &str) -> bool {
        let mut removed = false;
        self.options.rcu(|current| {
            removed = current.iter().any(|o| o.name() == name);
            if !removed {
                return Arc::clone(current);
            }
            Arc::new(current.iter().filter(|o| o.name() != name).cloned().collect::<Vec<_>>())
        });
        if removed {
            info!("Removed {} from {} load balancer", name, self.spec.scope);
        }
        removed
    }

    pub fn options(&self) -> Members {
        self.options.load_full()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.options.load().iter().any(|o| o.name() == name)
    }

    pub fn len(&self) -> usize {
        self.options.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.load().is_empty()
    }

    /// Pick one available node
    pub fn choose(&self) -> SqlXResult<Arc<NodeAttribute>> {
        let members = self.options.load_full();
        self.algorithm.select(&members).ok_or_else(|| {
            SqlXError::routing(format!(
                "no available {} node among {} option(s)",
                self.spec.scope,
                members.len()
            ))
        })
    }
}

impl Clone for LoadBalancer {
    fn clone(&self) -> Self {
        Self {
            spec: self.spec,
            options: ArcSwap::new(self.options.load_full()),
            algorithm: self.algorithm.clone(),
        }
    }
}

impl fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.options.load().iter().map(|o| o.name().to_string()).collect();
        f.debug_struct("LoadBalancer")
            .field("spec", &self.spec)
            .field("options", &names)
            .finish()
    }
}

/// Members that can take traffic right now
pub(crate) fn available(members: &[Arc<NodeAttribute>]) -> Vec<&Arc<NodeAttribute>> {
    members.iter().filter(|m| m.is_available()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeState;
    use std::collections::HashMap;

    fn node(name: &str, node_type: NodeType, weight: u32) -> Arc<NodeAttribute> {
        Arc::new(NodeAttribute::new(name, format!("jdbc:mysql://{name}/app"), node_type, weight))
    }

    fn distribution(lb: &LoadBalancer, picks: usize) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for _ in 0..picks {
            let chosen = lb.choose().unwrap();
            *counts.entry(chosen.name().to_string()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_scope_admits() {
        assert!(NodeScope::Readable.admits(NodeType::ReadWrite));
        assert!(!NodeScope::Readable.admits(NodeType::Independent));
        assert!(NodeScope::ReadOnly.admits(NodeType::Read));
        assert!(!NodeScope::ReadOnly.admits(NodeType::ReadWrite));
        assert!(NodeScope::Writable.admits(NodeType::Write));
        assert!(!NodeScope::WriteOnly.admits(NodeType::ReadWrite));
    }

    #[test]
    fn test_empty_scope_is_config_error() {
        let result = LoadBalancer::new(
            ReadLoadBalanceType::WeightRandomBalanceOnlyRead,
            vec![node("w1", NodeType::Write, 1)],
        );
        assert!(matches!(result, Err(SqlXError::Config(_))));
    }

    #[test]
    fn test_single_writer_takes_all_writes() {
        let lb = LoadBalancer::new(
            WriteLoadBalanceType::WeightRandomBalanceWritable,
            vec![node("w1", NodeType::Write, 10), node("r1", NodeType::Read, 5)],
        )
        .unwrap();
        let counts = distribution(&lb, 1000);
        assert_eq!(counts.get("w1"), Some(&1000));
        assert_eq!(counts.len(), 1);
    }

    #[test]
    fn test_weighted_random_ratio() {
        let lb = LoadBalancer::new(
            ReadLoadBalanceType::WeightRandomBalanceReadable,
            vec![node("w1", NodeType::ReadWrite, 10), node("r1", NodeType::Read, 5)],
        )
        .unwrap();
        let counts = distribution(&lb, 10_000);
        let w1 = *counts.get("w1").unwrap_or(&0) as f64 / 10_000.0;
        assert!((w1 - 10.0 / 15.0).abs() < 0.05, "w1 share was {w1}");
    }

    #[test]
    fn test_weighted_round_robin_ratio() {
        let lb = LoadBalancer::new(
            ReadLoadBalanceType::WeightRoundRobinBalanceReadable,
            vec![node("w1", NodeType::ReadWrite, 10), node("r1", NodeType::Read, 5)],
        )
        .unwrap();
        let counts = distribution(&lb, 15_000);
        assert_eq!(counts.get("w1"), Some(&10_000));
        assert_eq!(counts.get("r1"), Some(&5_000));
    }

    #[test]
    fn test_add_option_is_idempotent_and_scoped() {
        let lb = LoadBalancer::new(
            ReadLoadBalanceType::WeightRandomBalanceReadable,
            vec![node("r1", NodeType::Read, 1)],
        )
        .unwrap();
        assert!(lb.add_option(node("r2", NodeType::Read, 1)));
        assert!(!lb.add_option(node("r2", NodeType::Read, 1)));
        assert!(!lb.add_option(node("w1", NodeType::Write, 1)));
        assert_eq!(lb.len(), 2);
    }

    #[test]
    fn test_removed_option_is_never_chosen() {
        for kind in [
            ReadLoadBalanceType::WeightRandomBalanceReadable,
            ReadLoadBalanceType::WeightRoundRobinBalanceReadable,
        ] {
            let lb = LoadBalancer::new(
                kind,
                vec![node("r1", NodeType::Read, 1), node("r2", NodeType::Read, 3)],
            )
            .unwrap();
            let _ = distribution(&lb, 10);
            assert!(lb.remove_option("r2"));
            assert!(!lb.remove_option("r2"));
            let counts = distribution(&lb, 500);
            assert!(!counts.contains_key("r2"));
        }
    }

    #[test]
    fn test_unavailable_nodes_are_skipped() {
        let r1 = node("r1", NodeType::Read, 1);
        let r2 = node("r2", NodeType::Read, 1);
        let lb = LoadBalancer::new(
            ReadLoadBalanceType::WeightRoundRobinBalanceReadable,
            vec![Arc::clone(&r1), Arc::clone(&r2)],
        )
        .unwrap();
        r2.set_state(NodeState::Down);
        let counts = distribution(&lb, 100);
        assert_eq!(counts.get("r1"), Some(&100));

        r1.set_state(NodeState::OutOfService);
        assert!(matches!(lb.choose(), Err(SqlXError::Routing { .. })));
    }

    #[test]
    fn test_clone_is_independent() {
        let lb = LoadBalancer::new(
            ReadLoadBalanceType::WeightRandomBalanceReadable,
            vec![node("r1", NodeType::Read, 1)],
        )
        .unwrap();
        let draft = lb.clone();
        draft.add_option(node("r2", NodeType::Read, 1));
        assert_eq!(lb.len(), 1);
        assert_eq!(draft.len(), 2);
    }
}
