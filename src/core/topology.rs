/// Versioned topology snapshot and the single-writer mutation root
use crate::balancer::{BalanceSpec, LoadBalancer, ReadLoadBalanceType, WriteLoadBalanceType};
use crate::core::{
    ClusterConfiguration, DataSourceConfiguration, NodeAttribute, NodeState, PointcutConfiguration,
};
use crate::error::{SqlXError, SqlXResult};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// One immutable view of every data source, cluster and pointcut.
///
/// Routing reads a `Topology` through `SqlXConfiguration::snapshot` and
/// never sees a mutation half applied.
#[derive(Debug, Clone)]
pub struct Topology {
    version: u64,
    data_sources: Vec<Arc<DataSourceConfiguration>>,
    clusters: Vec<Arc<ClusterConfiguration>>,
    pointcuts: Vec<PointcutConfiguration>,
    read_load_balance_type: ReadLoadBalanceType,
    write_load_balance_type: WriteLoadBalanceType,
    read_load_balance: Option<LoadBalancer>,
    write_load_balance: Option<LoadBalancer>,
}

impl Topology {
    /// Build and validate a topology from configuration parts
    pub fn new(
        data_sources: Vec<DataSourceConfiguration>,
        clusters: Vec<ClusterConfiguration>,
        pointcuts: Vec<PointcutConfiguration>,
        read_load_balance_type: ReadLoadBalanceType,
        write_load_balance_type: WriteLoadBalanceType,
    ) -> SqlXResult<Self> {
        for data_source in &data_sources {
            data_source.validate()?;
        }
        let mut topology = Self {
            version: 0,
            data_sources: data_sources.into_iter().map(Arc::new).collect(),
            clusters: Vec::with_capacity(clusters.len()),
            pointcuts,
            read_load_balance_type,
            write_load_balance_type,
            read_load_balance: None,
            write_load_balance: None,
        };
        topology.rebuild_global_balancers()?;
        for mut cluster in clusters {
            cluster.bind(|name| topology.node_attribute(name))?;
            topology.clusters.push(Arc::new(cluster));
        }
        topology.validate()?;
        Ok(topology)
    }

    /// Pure check of every aggregate invariant, failing on the first broken one
    pub fn validate(&self) -> SqlXResult<()> {
        if self.data_sources.is_empty() {
            return Err(SqlXError::config("dataSources must not be empty"));
        }
        for data_source in &self.data_sources {
            data_source.validate()?;
        }
        let duplicates = duplicates(self.data_sources.iter().map(|d| d.name.as_str()));
        if !duplicates.is_empty() {
            return Err(SqlXError::config(format!(
                "dataSources name duplicate [{}]",
                duplicates.join(", ")
            )));
        }
        let defaulted: Vec<&str> = self
            .data_sources
            .iter()
            .filter(|d| d.defaulted)
            .map(|d| d.name.as_str())
            .collect();
        if defaulted.len() > 1 {
            return Err(SqlXError::config(format!(
                "only one default data source is allowed, found [{}]",
                defaulted.join(", ")
            )));
        }

        self.validate_clusters()?;
        self.validate_pointcuts()
    }

    fn validate_clusters(&self) -> SqlXResult<()> {
        let duplicates = duplicates(self.clusters.iter().map(|c| c.name.as_str()));
        if !duplicates.is_empty() {
            return Err(SqlXError::config(format!(
                "clusters name duplicate [{}]",
                duplicates.join(", ")
            )));
        }
        let defaulted = self.clusters.iter().filter(|c| c.defaulted).count();
        if defaulted > 1 {
            return Err(SqlXError::config("only one default cluster is allowed"));
        }
        if self.clusters.len() > 1 && defaulted == 0 {
            return Err(SqlXError::config(
                "a default cluster must be specified when more than one cluster is configured",
            ));
        }
        for cluster in &self.clusters {
            cluster.validate()?;
            for attribute in cluster.node_attributes() {
                let known = self
                    .node_attribute(attribute.name())
                    .is_some_and(|node| Arc::ptr_eq(&node, attribute));
                if !known {
                    return Err(SqlXError::config(format!(
                        "cluster [{}] node [{}] does not match any data source",
                        cluster.name,
                        attribute.name()
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_pointcuts(&self) -> SqlXResult<()> {
        for pointcut in &self.pointcuts {
            pointcut.validate()?;
            let expression = &pointcut.expression;
            match pointcut.cluster.as_deref().filter(|c| !c.trim().is_empty()) {
                Some(cluster_name) => {
                    let cluster = self.cluster(cluster_name).ok_or_else(|| {
                        SqlXError::config(format!(
                            "{} pointcut [cluster] attr {} Cluster does not exist",
                            expression, cluster_name
                        ))
                    })?;
                    if let Some(node) = pointcut.nodes.iter().find(|n| !cluster.contains_node(n)) {
                        return Err(SqlXError::config(format!(
                            "{} pointcut [nodes] attr [{}] Datasource Not belonging to [{}] cluster",
                            expression, node, cluster_name
                        )));
                    }
                }
                None => {
                    if let Some(node) = pointcut.nodes.iter().find(|n| !self.contains_data_source(n)) {
                        return Err(SqlXError::config(format!(
                            "{} pointcut [nodes] attr {} Datasource does not exist",
                            expression, node
                        )));
                    }
                }
            }
        }
        let duplicates = duplicates(self.pointcuts.iter().map(|p| p.expression.as_str()));
        if !duplicates.is_empty() {
            return Err(SqlXError::config(format!(
                "pointcut expression duplicate [{}]",
                duplicates.join(", ")
            )));
        }
        Ok(())
    }

    fn rebuild_global_balancers(&mut self) -> SqlXResult<()> {
        let nodes: Vec<Arc<NodeAttribute>> = self.data_sources.iter().map(|d| d.node_attribute()).collect();
        self.read_load_balance = global_balancer(self.read_load_balance_type, &nodes)?;
        self.write_load_balance = global_balancer(self.write_load_balance_type, &nodes)?;
        Ok(())
    }

    fn insert_data_source(&mut self, data_source: DataSourceConfiguration) -> SqlXResult<Arc<NodeAttribute>> {
        let node = data_source.node_attribute();
        self.data_sources.push(Arc::new(data_source));
        let read_registered = self.read_load_balance.as_ref().map(|lb| lb.add_option(Arc::clone(&node)));
        let write_registered = self.write_load_balance.as_ref().map(|lb| lb.add_option(Arc::clone(&node)));
        if read_registered.is_none() || write_registered.is_none() {
            self.rebuild_global_balancers()?;
        }
        Ok(node)
    }

    fn delete_data_source(&mut self, name: &str) -> Option<Arc<DataSourceConfiguration>> {
        let index = self.data_sources.iter().position(|d| d.name == name)?;
        let removed = self.data_sources.remove(index);
        for lb in [&mut self.read_load_balance, &mut self.write_load_balance] {
            if let Some(balancer) = lb {
                balancer.remove_option(name);
                if balancer.is_empty() {
                    *lb = None;
                }
            }
        }
        Some(removed)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn data_sources(&self) -> &[Arc<DataSourceConfiguration>] {
        &self.data_sources
    }

    pub fn data_source(&self, name: &str) -> Option<&Arc<DataSourceConfiguration>> {
        self.data_sources.iter().find(|d| d.name == name)
    }

    pub fn contains_data_source(&self, name: &str) -> bool {
        self.data_source(name).is_some()
    }

    pub fn node_attribute(&self, name: &str) -> Option<Arc<NodeAttribute>> {
        self.data_source(name).map(|d| d.node_attribute())
    }

    /// Ungrouped fallback target
    pub fn default_data_source(&self) -> Option<&Arc<DataSourceConfiguration>> {
        self.data_sources.iter().find(|d| d.defaulted)
    }

    pub fn clusters(&self) -> &[Arc<ClusterConfiguration>] {
        &self.clusters
    }

    pub fn cluster(&self, name: &str) -> Option<&Arc<ClusterConfiguration>> {
        self.clusters.iter().find(|c| c.name == name)
    }

    pub fn contains_cluster(&self, name: &str) -> bool {
        self.cluster(name).is_some()
    }

    /// The only cluster, or the defaulted one when several exist
    pub fn default_cluster(&self) -> Option<&Arc<ClusterConfiguration>> {
        if self.clusters.len() == 1 {
            return self.clusters.first();
        }
        self.clusters.iter().find(|c| c.defaulted)
    }

    pub fn pointcuts(&self) -> &[PointcutConfiguration] {
        &self.pointcuts
    }

    pub fn pointcut_for(&self, target: &str) -> Option<&PointcutConfiguration> {
        self.pointcuts.iter().find(|p| p.matches(target))
    }

    /// Global balancers over every data source, used when no cluster applies
    pub fn read_load_balance(&self) -> Option<&LoadBalancer> {
        self.read_load_balance.as_ref()
    }

    pub fn write_load_balance(&self) -> Option<&LoadBalancer> {
        self.write_load_balance.as_ref()
    }
}

fn global_balancer<S: Into<BalanceSpec>>(kind: S, nodes: &[Arc<NodeAttribute>]) -> SqlXResult<Option<LoadBalancer>> {
    let spec = kind.into();
    if !nodes.iter().any(|n| spec.scope.admits(n.node_type())) {
        return Ok(None);
    }
    LoadBalancer::new(spec, nodes.iter().cloned()).map(Some)
}

fn duplicates<'a, I: IntoIterator<Item = &'a str>>(names: I) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut repeated = Vec::new();
    for name in names {
        if !seen.insert(name) && !repeated.iter().any(|r: &String| r == name) {
            repeated.push(name.to_string());
        }
    }
    repeated
}

/// Root aggregate of the live topology.
///
/// Readers load the current snapshot without locking. Mutations are
/// serialized by `writer`, run against a cloned draft, and are published
/// only if the draft validates.
pub struct SqlXConfiguration {
    snapshot: ArcSwap<Topology>,
    writer: Mutex<()>,
}

impl SqlXConfiguration {
    pub fn new(topology: Topology) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(topology),
            writer: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<Topology> {
        self.snapshot.load_full()
    }

    pub fn version(&self) -> u64 {
        self.snapshot.load().version
    }

    /// Apply `forward` to a draft, validate it, then publish it.
    ///
    /// Errors from `forward` itself are returned unchanged since nothing was
    /// published. A draft that fails validation is dropped and the cause is
    /// wrapped in a rolled-back management error.
    fn mutate<T, F>(&self, operation: &str, forward: F) -> SqlXResult<T>
    where
        F: FnOnce(&mut Topology) -> SqlXResult<T>,
    {
        let _guard = self.writer.lock();
        let current = self.snapshot.load_full();
        let mut draft = Topology::clone(&current);
        let outcome = forward(&mut draft)?;

        if let Err(cause) = draft.validate() {
            warn!("{} rolled back: {}", operation, cause);
            return Err(SqlXError::management(operation, cause, true));
        }
        draft.version = current.version + 1;
        self.snapshot.store(Arc::new(draft));
        info!("{} committed, topology version {}", operation, current.version + 1);
        Ok(outcome)
    }

    pub fn add_data_source_configuration(&self, data_source: DataSourceConfiguration) -> SqlXResult<Arc<NodeAttribute>> {
        data_source.validate()?;
        self.mutate("add_data_source_configuration", |draft| draft.insert_data_source(data_source))
    }

    /// Returns `false` when no data source has that name
    pub fn remove_data_source_configuration(&self, name: &str) -> SqlXResult<bool> {
        self.mutate("remove_data_source_configuration", |draft| Ok(draft.delete_data_source(name).is_some()))
    }

    pub fn add_cluster_configuration(&self, mut cluster: ClusterConfiguration) -> SqlXResult<()> {
        self.mutate("add_cluster_configuration", |draft| {
            cluster.bind(|name| draft.node_attribute(name))?;
            draft.clusters.push(Arc::new(cluster));
            Ok(())
        })
    }

    /// Returns `false` when no cluster has that name
    pub fn remove_cluster_configuration(&self, name: &str) -> SqlXResult<bool> {
        self.mutate("remove_cluster_configuration", |draft| {
            let before = draft.clusters.len();
            draft.clusters.retain(|c| c.name != name);
            Ok(draft.clusters.len() != before)
        })
    }

    pub fn add_node_in_cluster(&self, cluster_name: &str, node_name: &str) -> SqlXResult<()> {
        self.mutate("add_node_in_cluster", |draft| {
            let node = draft
                .node_attribute(node_name)
                .ok_or_else(|| SqlXError::config(format!("data source [{}] does not exist", node_name)))?;
            let cluster = find_cluster_mut(draft, cluster_name)?;
            Arc::make_mut(cluster).add_node(node);
            Ok(())
        })
    }

    /// Remove a node from a cluster and from pointcuts targeting that cluster
    pub fn remove_node_in_cluster(&self, cluster_name: &str, node_name: &str) -> SqlXResult<bool> {
        self.mutate("remove_node_in_cluster", |draft| {
            let cluster = find_cluster_mut(draft, cluster_name)?;
            let removed = Arc::make_mut(cluster).remove_node(node_name).is_some();
            if removed {
                for pointcut in draft
                    .pointcuts
                    .iter_mut()
                    .filter(|p| p.cluster.as_deref() == Some(cluster_name))
                {
                    pointcut.remove_node(node_name);
                }
            }
            Ok(removed)
        })
    }

    pub fn add_pointcut(&self, pointcut: PointcutConfiguration) -> SqlXResult<()> {
        pointcut.validate()?;
        self.mutate("add_pointcut", |draft| {
            draft.pointcuts.push(pointcut);
            Ok(())
        })
    }

    pub fn remove_pointcut(&self, expression: &str) -> SqlXResult<bool> {
        self.mutate("remove_pointcut", |draft| {
            let before = draft.pointcuts.len();
            draft.pointcuts.retain(|p| p.expression != expression);
            Ok(draft.pointcuts.len() != before)
        })
    }

    /// Node state lives in an atomic on the node and needs no new snapshot
    pub fn set_node_state(&self, name: &str, state: NodeState) -> SqlXResult<()> {
        let node = self.require_node(name)?;
        let previous = node.state();
        node.set_state(state);
        info!("node {} state {} -> {}", name, previous, state);
        Ok(())
    }

    pub fn set_node_weight(&self, name: &str, weight: u32) -> SqlXResult<()> {
        let node = self.require_node(name)?;
        let previous = node.weight();
        node.set_weight(weight);
        info!("node {} weight {} -> {}", name, previous, weight);
        Ok(())
    }

    fn require_node(&self, name: &str) -> SqlXResult<Arc<NodeAttribute>> {
        self.snapshot()
            .node_attribute(name)
            .ok_or_else(|| SqlXError::config(format!("data source [{}] does not exist", name)))
    }

    pub fn get_cluster(&self, name: &str) -> Option<Arc<ClusterConfiguration>> {
        self.snapshot.load().cluster(name).cloned()
    }

    pub fn contains_data_source(&self, name: &str) -> bool {
        self.snapshot.load().contains_data_source(name)
    }

    pub fn contains_cluster(&self, name: &str) -> bool {
        self.snapshot.load().contains_cluster(name)
    }

    pub fn node_attribute(&self, name: &str) -> Option<Arc<NodeAttribute>> {
        self.snapshot.load().node_attribute(name)
    }
}

fn find_cluster_mut<'a>(draft: &'a mut Topology, name: &str) -> SqlXResult<&'a mut Arc<ClusterConfiguration>> {
    draft
        .clusters
        .iter_mut()
        .find(|c| c.name == name)
        .ok_or_else(|| SqlXError::config(format!("cluster [{}] does not exist", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeType;

    fn data_source(name: &str, node_type: NodeType, weight: u32) -> DataSourceConfiguration {
        DataSourceConfiguration::new(name, format!("jdbc:mysql://{name}:3306/app"), node_type).with_weight(weight)
    }

    fn configuration() -> SqlXConfiguration {
        let topology = Topology::new(
            vec![
                data_source("a", NodeType::Write, 1),
                data_source("b", NodeType::Read, 1),
                data_source("c", NodeType::Read, 1),
            ],
            vec![ClusterConfiguration::new("c1", ["a", "b", "c"])],
            vec![PointcutConfiguration::new("Report.*").with_cluster("c1").with_nodes(["b", "c"])],
            ReadLoadBalanceType::default(),
            WriteLoadBalanceType::default(),
        )
        .unwrap();
        SqlXConfiguration::new(topology)
    }

    #[test]
    fn test_topology_rejects_cluster_without_writer() {
        let result = Topology::new(
            vec![data_source("r1", NodeType::Read, 1), data_source("r2", NodeType::Read, 1)],
            vec![ClusterConfiguration::new("c1", ["r1", "r2"])],
            Vec::new(),
            ReadLoadBalanceType::default(),
            WriteLoadBalanceType::default(),
        );
        assert!(matches!(result, Err(SqlXError::Config(_))));
    }

    #[test]
    fn test_two_clusters_need_a_default() {
        let result = Topology::new(
            vec![data_source("a", NodeType::ReadWrite, 1), data_source("b", NodeType::ReadWrite, 1)],
            vec![ClusterConfiguration::new("c1", ["a"]), ClusterConfiguration::new("c2", ["b"])],
            Vec::new(),
            ReadLoadBalanceType::default(),
            WriteLoadBalanceType::default(),
        );
        assert!(result.unwrap_err().to_string().contains("default cluster"));
    }

    #[test]
    fn test_duplicate_data_source_rejected() {
        let configuration = configuration();
        let before = configuration.snapshot();
        let error = configuration
            .add_data_source_configuration(data_source("a", NodeType::Read, 9))
            .unwrap_err();
        assert!(error.is_rolled_back());
        assert!(error.to_string().contains("dataSources name duplicate [a]"));

        let after = configuration.snapshot();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.data_sources().len(), 3);
        assert_eq!(after.node_attribute("a").unwrap().node_type(), NodeType::Write);
    }

    #[test]
    fn test_failed_add_leaves_balancers_untouched() {
        let configuration = configuration();
        let read_before = configuration.snapshot().read_load_balance().unwrap().options();
        let mut bad = data_source("d", NodeType::Read, 1);
        bad.url = "jdbc:postgresql://d/app".to_string();
        bad.defaulted = true;
        let mut second_default = data_source("e", NodeType::Read, 1);
        second_default.defaulted = true;

        configuration.add_data_source_configuration(bad).unwrap();
        let error = configuration.add_data_source_configuration(second_default).unwrap_err();
        assert!(error.is_rolled_back());
        assert!(!configuration.contains_data_source("e"));
        let snapshot = configuration.snapshot();
        let read_after = snapshot.read_load_balance().unwrap();
        assert!(!read_after.contains("e"));
        assert_eq!(read_after.len(), read_before.len() + 1);
    }

    #[test]
    fn test_invalid_data_source_is_plain_config_error() {
        let configuration = configuration();
        let version = configuration.version();
        let error = configuration
            .add_data_source_configuration(DataSourceConfiguration::new("", "jdbc:mysql://x/app", NodeType::Read))
            .unwrap_err();
        assert!(matches!(error, SqlXError::Config(_)));
        assert_eq!(configuration.version(), version);
    }

    #[test]
    fn test_remove_node_in_cluster_updates_balancers_and_pointcuts() {
        let configuration = configuration();
        assert!(configuration.remove_node_in_cluster("c1", "c").unwrap());

        let cluster = configuration.get_cluster("c1").unwrap();
        assert!(!cluster.contains_node("c"));
        assert!(!cluster.read_load_balance().unwrap().contains("c"));
        for _ in 0..200 {
            assert_ne!(cluster.read_load_balance().unwrap().choose().unwrap().name(), "c");
        }
        let snapshot = configuration.snapshot();
        assert_eq!(snapshot.pointcuts()[0].nodes, vec!["b".to_string()]);
        assert_eq!(snapshot.version(), 1);
    }

    #[test]
    fn test_removing_last_writer_rolls_back() {
        let configuration = configuration();
        let error = configuration.remove_node_in_cluster("c1", "a").unwrap_err();
        assert!(error.is_rolled_back());
        let cluster = configuration.get_cluster("c1").unwrap();
        assert!(cluster.contains_node("a"));
        assert!(cluster.write_load_balance().unwrap().contains("a"));
    }

    #[test]
    fn test_remove_data_source_referenced_by_cluster_rolls_back() {
        let configuration = configuration();
        let error = configuration.remove_data_source_configuration("b").unwrap_err();
        assert!(error.is_rolled_back());
        assert!(configuration.contains_data_source("b"));
        assert!(!configuration.remove_data_source_configuration("ghost").unwrap());
    }

    #[test]
    fn test_add_cluster_with_missing_node() {
        let configuration = configuration();
        let cluster = ClusterConfiguration::new("c2", ["a", "ghost"]).with_defaulted(true);
        let error = configuration.add_cluster_configuration(cluster).unwrap_err();
        assert!(matches!(error, SqlXError::Config(_)));
        assert!(!configuration.contains_cluster("c2"));
    }

    #[test]
    fn test_add_and_remove_cluster() {
        let configuration = configuration();
        configuration
            .add_data_source_configuration(data_source("x", NodeType::ReadWrite, 1))
            .unwrap();
        let undefaulted = ClusterConfiguration::new("c2", ["x"]);
        assert!(configuration.add_cluster_configuration(undefaulted).unwrap_err().is_rolled_back());

        configuration
            .add_cluster_configuration(ClusterConfiguration::new("c2", ["x"]).with_defaulted(true))
            .unwrap();
        assert!(configuration.contains_cluster("c2"));
        assert_eq!(configuration.snapshot().default_cluster().unwrap().name, "c2");

        assert!(configuration.remove_cluster_configuration("c2").unwrap());
        assert!(!configuration.contains_cluster("c2"));
    }

    #[test]
    fn test_add_node_in_cluster() {
        let configuration = configuration();
        configuration
            .add_data_source_configuration(data_source("d", NodeType::Read, 1))
            .unwrap();
        configuration.add_node_in_cluster("c1", "d").unwrap();
        let cluster = configuration.get_cluster("c1").unwrap();
        assert!(cluster.read_load_balance().unwrap().contains("d"));
        assert!(configuration.add_node_in_cluster("c1", "ghost").is_err());
        assert!(configuration.add_node_in_cluster("nope", "d").is_err());
    }

    #[test]
    fn test_committed_snapshot_is_not_mutated_by_drafts() {
        let configuration = configuration();
        let before = configuration.get_cluster("c1").unwrap();
        configuration.remove_node_in_cluster("c1", "b").unwrap();
        assert!(before.contains_node("b"));
        assert!(before.read_load_balance().unwrap().contains("b"));
    }

    #[test]
    fn test_set_node_state_and_weight() {
        let configuration = configuration();
        configuration.set_node_state("b", NodeState::Down).unwrap();
        configuration.set_node_weight("c", 4).unwrap();
        assert_eq!(configuration.node_attribute("b").unwrap().state(), NodeState::Down);
        assert_eq!(configuration.node_attribute("c").unwrap().weight(), 4);
        assert!(configuration.set_node_weight("ghost", 1).is_err());
        assert_eq!(configuration.version(), 0);
    }

    #[test]
    fn test_pointcut_validation() {
        let configuration = configuration();
        let stray = PointcutConfiguration::new("Audit.*").with_cluster("c1").with_nodes(["ghost"]);
        assert!(configuration.add_pointcut(stray).unwrap_err().is_rolled_back());

        let duplicate = PointcutConfiguration::new("Report.*").with_cluster("c1");
        assert!(configuration.add_pointcut(duplicate).is_err());

        configuration
            .add_pointcut(PointcutConfiguration::new("Audit.*").with_nodes(["a"]))
            .unwrap();
        let snapshot = configuration.snapshot();
        assert_eq!(snapshot.pointcut_for("Audit.log").unwrap().nodes, vec!["a".to_string()]);
        assert!(configuration.remove_pointcut("Audit.*").unwrap());
    }

    #[test]
    fn test_duplicates_helper() {
        assert_eq!(duplicates(["a", "b", "a", "a"]), vec!["a".to_string()]);
        assert!(duplicates(["a", "b"]).is_empty());
    }
}
