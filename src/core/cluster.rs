use crate::balancer::{LoadBalancer, ReadLoadBalanceType, WriteLoadBalanceType};
use crate::core::{NodeAttribute, NodeType};
use crate::error::{SqlXError, SqlXResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::info;

/// A named group of nodes sharing one database type, with its own read and write balancers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    pub name: String,
    pub nodes: BTreeSet<String>,
    #[serde(default)]
    pub defaulted: bool,
    #[serde(default)]
    pub read_load_balance_type: ReadLoadBalanceType,
    #[serde(default)]
    pub write_load_balance_type: WriteLoadBalanceType,
    #[serde(skip)]
    node_attributes: Vec<Arc<NodeAttribute>>,
    #[serde(skip)]
    read_load_balance: Option<LoadBalancer>,
    #[serde(skip)]
    write_load_balance: Option<LoadBalancer>,
}

impl ClusterConfiguration {
    pub fn new<I, S>(name: impl Into<String>, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            nodes: nodes.into_iter().map(Into::into).collect(),
            defaulted: false,
            read_load_balance_type: ReadLoadBalanceType::default(),
            write_load_balance_type: WriteLoadBalanceType::default(),
            node_attributes: Vec::new(),
            read_load_balance: None,
            write_load_balance: None,
        }
    }

    pub fn with_defaulted(mut self, defaulted: bool) -> Self {
        self.defaulted = defaulted;
        self
    }

    pub fn with_load_balance_types(
        mut self,
        read: ReadLoadBalanceType,
        write: WriteLoadBalanceType,
    ) -> Self {
        self.read_load_balance_type = read;
        self.write_load_balance_type = write;
        self
    }

    /// Resolve member names to nodes and build both balancers.
    ///
    /// Fails on the first name `resolve` does not know or when a balancer
    /// scope is left empty.
    pub fn bind<F>(&mut self, resolve: F) -> SqlXResult<()>
    where
        F: Fn(&str) -> Option<Arc<NodeAttribute>>,
    {
        let mut attributes = Vec::with_capacity(self.nodes.len());
        for name in &self.nodes {
            let attribute = resolve(name).ok_or_else(|| {
                SqlXError::config(format!(
                    "cluster [{}] node [{}] does not match any data source",
                    self.name, name
                ))
            })?;
            attributes.push(attribute);
        }
        check_members(&self.name, &attributes)?;

        let read = LoadBalancer::new(self.read_load_balance_type, attributes.iter().cloned())?;
        let write = LoadBalancer::new(self.write_load_balance_type, attributes.iter().cloned())?;
        self.node_attributes = attributes;
        self.read_load_balance = Some(read);
        self.write_load_balance = Some(write);
        Ok(())
    }

    /// Pure check of the cluster invariants
    pub fn validate(&self) -> SqlXResult<()> {
        if self.name.trim().is_empty() {
            return Err(SqlXError::config("clusters [name] attr must not be empty"));
        }
        if self.nodes.is_empty() {
            return Err(SqlXError::config(format!(
                "clusters [{}] [nodes] attr must not be empty",
                self.name
            )));
        }
        if self.node_attributes.len() != self.nodes.len()
            || self.node_attributes.iter().any(|a| !self.nodes.contains(a.name()))
        {
            return Err(SqlXError::config(format!(
                "cluster [{}] members are not resolved to data sources",
                self.name
            )));
        }
        check_members(&self.name, &self.node_attributes)?;
        for lb in [&self.read_load_balance, &self.write_load_balance] {
            match lb {
                None => {
                    return Err(SqlXError::config(format!(
                        "cluster [{}] load balancers are not initialized",
                        self.name
                    )))
                }
                Some(lb) if lb.is_empty() => {
                    return Err(SqlXError::config(format!(
                        "cluster [{}] has no {} node left for its load balancer",
                        self.name,
                        lb.spec().scope
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Add a resolved node to the member set and both balancers
    pub fn add_node(&mut self, node: Arc<NodeAttribute>) {
        if !self.nodes.insert(node.name().to_string()) {
            return;
        }
        info!("Cluster {} add node {}", self.name, node.name());
        if let Some(lb) = &self.read_load_balance {
            lb.add_option(Arc::clone(&node));
        }
        if let Some(lb) = &self.write_load_balance {
            lb.add_option(Arc::clone(&node));
        }
        self.node_attributes.push(node);
    }

    /// Remove a node from the member set and both balancers
    pub fn remove_node(&mut self, name: &str) -> Option<Arc<NodeAttribute>> {
        if !self.nodes.remove(name) {
            return None;
        }
        info!("Cluster {} remove node {}", self.name, name);
        if let Some(lb) = &self.read_load_balance {
            lb.remove_option(name);
        }
        if let Some(lb) = &self.write_load_balance {
            lb.remove_option(name);
        }
        let index = self.node_attributes.iter().position(|a| a.name() == name)?;
        Some(self.node_attributes.remove(index))
    }

    pub fn contains_node(&self, name: &str) -> bool {
        self.nodes.contains(name)
    }

    pub fn node_attributes(&self) -> &[Arc<NodeAttribute>] {
        &self.node_attributes
    }

    pub fn node_attribute(&self, name: &str) -> Option<&Arc<NodeAttribute>> {
        self.node_attributes.iter().find(|a| a.name() == name)
    }

    pub fn writable_nodes(&self) -> Vec<Arc<NodeAttribute>> {
        self.node_attributes
            .iter()
            .filter(|a| a.node_type().can_write())
            .cloned()
            .collect()
    }

    pub fn readable_nodes(&self) -> Vec<Arc<NodeAttribute>> {
        self.node_attributes
            .iter()
            .filter(|a| a.node_type().can_read())
            .cloned()
            .collect()
    }

    pub fn read_load_balance(&self) -> Option<&LoadBalancer> {
        self.read_load_balance.as_ref()
    }

    pub fn write_load_balance(&self) -> Option<&LoadBalancer> {
        self.write_load_balance.as_ref()
    }
}

/// At least one writer and one reader, no independent nodes, one database type
fn check_members(cluster: &str, attributes: &[Arc<NodeAttribute>]) -> SqlXResult<()> {
    if !attributes.iter().any(|a| a.node_type().can_write()) {
        return Err(SqlXError::config(format!(
            "At least one writable node is included in {} cluster",
            cluster
        )));
    }
    if !attributes.iter().any(|a| a.node_type().can_read()) {
        return Err(SqlXError::config(format!(
            "At least one readable node is included in {} cluster",
            cluster
        )));
    }
    if attributes.iter().any(|a| a.node_type() == NodeType::Independent) {
        return Err(SqlXError::config(format!(
            "Independent nodes are not allowed in the {} cluster",
            cluster
        )));
    }
    let database_types: HashSet<&str> = attributes.iter().map(|a| a.database_type()).collect();
    if database_types.len() > 1 {
        let mut found: Vec<&str> = database_types.into_iter().collect();
        found.sort_unstable();
        return Err(SqlXError::config(format!(
            "All nodes in the {} cluster must have the same database type. Found different types: {}",
            cluster,
            found.join(", ")
        )));
    }
    Ok(())
}

impl PartialEq for ClusterConfiguration {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ClusterConfiguration {}
