mod common;

use common::{cluster_fixture, data_source, StubDriver};
use sqlx_router::balancer::{LoadBalancer, ReadLoadBalanceType, WriteLoadBalanceType};
use sqlx_router::core::{ClusterConfiguration, NodeAttribute, NodeType, PointcutConfiguration, SqlXConfiguration, Topology};
use sqlx_router::error::SqlXError;
use sqlx_router::routing::{RouteRule, RoutingAttribute, StickyWritePolicy};
use sqlx_router::SqlXDataSource;
use std::collections::HashMap;
use std::sync::Arc;

fn node(name: &str, node_type: NodeType, weight: u32) -> Arc<NodeAttribute> {
    Arc::new(NodeAttribute::new(name, format!("jdbc:mysql://{}/app", name), node_type, weight))
}

fn names(topology_nodes: &[Arc<NodeAttribute>]) -> Vec<String> {
    topology_nodes.iter().map(|n| n.name().to_string()).collect()
}

#[test]
fn test_cluster_without_writer_or_reader_is_rejected() {
    let readers_only = Topology::new(
        vec![data_source("r1", NodeType::Read, 1), data_source("r2", NodeType::Read, 1)],
        vec![ClusterConfiguration::new("c1", ["r1", "r2"])],
        Vec::new(),
        Default::default(),
        Default::default(),
    );
    assert!(matches!(readers_only, Err(SqlXError::Config(_))));

    let writers_only = Topology::new(
        vec![data_source("w1", NodeType::Write, 1)],
        vec![ClusterConfiguration::new("c1", ["w1"])],
        Vec::new(),
        Default::default(),
        Default::default(),
    );
    assert!(matches!(writers_only, Err(SqlXError::Config(_))));

    let (data_source, _) = cluster_fixture(&[("a", NodeType::Write, 1), ("b", NodeType::Read, 1)]);
    let version = data_source.topology_version();
    assert!(data_source.add_cluster(ClusterConfiguration::new("c2", ["b"])).is_err());
    assert!(!data_source.contains_cluster("c2"));
    assert_eq!(data_source.topology_version(), version);
}

#[test]
fn test_failed_data_source_add_leaves_topology_untouched() {
    let (data_source, driver) = cluster_fixture(&[("a", NodeType::Write, 1), ("b", NodeType::Read, 1)]);
    let before = data_source.configuration().snapshot();
    let readers_before = names(&before.read_load_balance().unwrap().options());
    let writers_before = names(&before.write_load_balance().unwrap().options());

    driver.refuse("c");
    let error = data_source.add_data_source(common::data_source("c", NodeType::Read, 1)).unwrap_err();
    assert!(matches!(error, SqlXError::Management { rolled_back: false, .. }));
    assert!(!data_source.contains_data_source("c"));

    let mut blank_url = common::data_source("d", NodeType::Read, 1);
    blank_url.url.clear();
    assert!(data_source.add_data_source(blank_url).is_err());
    assert!(!data_source.contains_data_source("d"));

    let after = data_source.configuration().snapshot();
    assert_eq!(after.version(), before.version());
    assert_eq!(names(&after.read_load_balance().unwrap().options()), readers_before);
    assert_eq!(names(&after.write_load_balance().unwrap().options()), writers_before);
}

#[test]
fn test_bound_connection_reuses_physical_connection() {
    let (data_source, driver) = cluster_fixture(&[
        ("a", NodeType::Write, 1),
        ("b", NodeType::Read, 1),
        ("c", NodeType::Read, 1),
    ]);
    let connection = data_source.get_connection();
    let mut statement = connection.create_statement().unwrap();
    statement.execute_query("select * from t").unwrap();
    for i in 0..10 {
        if i % 2 == 0 {
            statement.execute_update(&format!("update t set v = {}", i)).unwrap();
        } else {
            connection.prepare_statement("select * from t").unwrap().execute().unwrap();
        }
    }

    let executed = driver.executed();
    assert_eq!(executed.len(), 11);
    assert!(executed.iter().all(|(tag, _)| tag == &executed[0].0));
    assert_eq!(driver.connections_opened(), 1);
    let bound = connection.bound_node().unwrap();
    assert!(executed[0].0.starts_with(bound.name()));
}

#[test]
fn test_single_writer_takes_every_write() {
    let balancer = LoadBalancer::new(
        WriteLoadBalanceType::WeightRandomBalanceWritable,
        vec![node("w1", NodeType::ReadWrite, 10)],
    )
    .unwrap();
    for _ in 0..1000 {
        assert_eq!(balancer.choose().unwrap().name(), "w1");
    }
}

#[test]
fn test_readable_distribution_follows_weights() {
    for kind in [
        ReadLoadBalanceType::WeightRandomBalanceReadable,
        ReadLoadBalanceType::WeightRoundRobinBalanceReadable,
    ] {
        let balancer = LoadBalancer::new(
            kind,
            vec![node("w1", NodeType::ReadWrite, 10), node("r1", NodeType::Read, 5)],
        )
        .unwrap();
        let mut hits: HashMap<String, u32> = HashMap::new();
        for _ in 0..10_000 {
            *hits.entry(balancer.choose().unwrap().name().to_string()).or_default() += 1;
        }
        let share = hits["w1"] as f64 / 10_000.0;
        assert!((share - 10.0 / 15.0).abs() < 0.05, "{:?} gave w1 share {}", kind, share);
    }
}

#[test]
fn test_removed_node_is_never_chosen() {
    let (data_source, _) = cluster_fixture(&[
        ("a", NodeType::Write, 1),
        ("b", NodeType::Read, 1),
        ("c", NodeType::Read, 1),
    ]);
    assert!(data_source.remove_node_in_cluster("c1", "c").unwrap());

    let cluster = data_source.cluster("c1").unwrap();
    let read = cluster.read_load_balance().unwrap();
    let write = cluster.write_load_balance().unwrap();
    assert!(!read.contains("c"));
    assert!(!write.contains("c"));
    for _ in 0..1000 {
        assert_ne!(read.choose().unwrap().name(), "c");
    }
    assert!(data_source.contains_data_source("c"));
}

#[test]
fn test_duplicate_data_source_rejected() {
    let configuration = SqlXConfiguration::new(
        Topology::new(
            vec![data_source("a", NodeType::Write, 1), data_source("b", NodeType::Read, 1)],
            vec![ClusterConfiguration::new("c1", ["a", "b"])],
            Vec::new(),
            Default::default(),
            Default::default(),
        )
        .unwrap(),
    );

    let error = configuration
        .add_data_source_configuration(data_source("a", NodeType::Read, 7))
        .unwrap_err();
    assert!(error.is_rolled_back());
    let original = configuration.node_attribute("a").unwrap();
    assert_eq!(original.node_type(), NodeType::Write);
    assert_eq!(original.weight(), 1);
    assert_eq!(configuration.snapshot().data_sources().len(), 2);
    assert_eq!(configuration.version(), 0);
}

#[test]
fn test_write_after_read_sticks_to_reader() {
    let (data_source, driver) = cluster_fixture(&[("a", NodeType::Write, 1), ("b", NodeType::Read, 1)]);

    let writer = data_source.get_connection();
    let route = writer.route("insert into t values (1)").unwrap();
    assert_eq!(route.hit_node_attr.unwrap().name(), "a");
    assert_eq!(route.hit_rule, Some(RouteRule::ReadWriteSplitting));

    let connection = data_source.get_connection();
    let read = connection.route("select * from t").unwrap();
    assert_eq!(read.hit_node_attr.unwrap().name(), "b");
    let write = connection.route("update t set v = 2").unwrap();
    assert_eq!(write.hit_node_attr.unwrap().name(), "b");
    assert_eq!(write.hit_rule, Some(RouteRule::Sticky));
    assert_eq!(write.hit_routing_group.as_deref(), Some("cluster:c1"));

    let mut statement = connection.create_statement().unwrap();
    statement.execute_update("update t set v = 3").unwrap();
    assert_eq!(driver.executed().last().unwrap().0, "b-2");
}

#[test]
fn test_reject_policy_fails_write_on_reader() {
    let (data_source, _) = cluster_fixture(&[("a", NodeType::Write, 1), ("b", NodeType::Read, 1)]);
    let data_source = data_source.with_sticky_write_policy(StickyWritePolicy::Reject);

    let connection = data_source.get_connection();
    connection.route("select * from t").unwrap();
    let error = connection.route("update t set v = 2").unwrap_err();
    assert!(matches!(error, SqlXError::Routing { .. }));
    assert_eq!(connection.bound_node().unwrap().name(), "b");
    assert!(connection.route("select 1").is_ok());
}

#[test]
fn test_hint_and_override_routing() {
    let (data_source, _) = cluster_fixture(&[
        ("a", NodeType::Write, 1),
        ("b", NodeType::Read, 1),
        ("c", NodeType::Read, 1),
    ]);

    let hinted = data_source.get_connection();
    let route = hinted.route("/*!nodeName=c*/ select * from t").unwrap();
    assert_eq!(route.hit_node_attr.unwrap().name(), "c");
    assert_eq!(route.hit_rule, Some(RouteRule::DataSourceNameHint));

    let forced = data_source.get_connection_routed(RoutingAttribute::nodes(["b"]));
    let route = forced.route("select * from t").unwrap();
    assert_eq!(route.hit_node_attr.unwrap().name(), "b");
    assert_eq!(route.hit_rule, Some(RouteRule::Force));

    let forced_write = data_source.get_connection_routed(RoutingAttribute::cluster("c1").with_nodes(["b"]));
    assert!(matches!(
        forced_write.route("delete from t"),
        Err(SqlXError::Routing { .. })
    ));
}

#[test]
fn test_ungrouped_single_data_source() {
    let topology = Topology::new(
        vec![data_source("solo", NodeType::ReadWrite, 1)],
        Vec::new(),
        Vec::new(),
        Default::default(),
        Default::default(),
    )
    .unwrap();
    let data_source = SqlXDataSource::new(
        Arc::new(SqlXConfiguration::new(topology)),
        Arc::new(StubDriver::default()),
    );
    let route = data_source.get_connection().route("select 1").unwrap();
    assert_eq!(route.hit_node_attr.unwrap().name(), "solo");
    assert_eq!(route.hit_rule, Some(RouteRule::SingleDataSource));
    assert_eq!(route.hit_routing_group.as_deref(), Some("none-cluster"));
}

#[test]
fn test_force_without_cluster_reaches_node_outside_default_cluster() {
    let (data_source, _) = cluster_fixture(&[("a", NodeType::Write, 1), ("b", NodeType::Read, 1)]);
    data_source.add_data_source(common::data_source("x", NodeType::ReadWrite, 1)).unwrap();

    for sql in ["select * from t", "update t set v = 1"] {
        let connection = data_source.get_connection_routed(RoutingAttribute::nodes(["x"]));
        let route = connection.route(sql).unwrap();
        assert_eq!(route.hit_node_attr.unwrap().name(), "x", "{}", sql);
        assert_eq!(route.hit_rule, Some(RouteRule::Force));
        assert_eq!(route.hit_routing_group.as_deref(), Some("cluster:c1"));
    }

    let reader_only = data_source.get_connection_routed(RoutingAttribute::nodes(["b"]));
    assert_eq!(reader_only.route("delete from t").unwrap().hit_node_attr.unwrap().name(), "b");
}

#[test]
fn test_pointcut_with_nodes_only() {
    let (data_source, _) = cluster_fixture(&[("a", NodeType::Write, 1), ("b", NodeType::Read, 1)]);
    data_source.add_data_source(common::data_source("x", NodeType::ReadWrite, 1)).unwrap();
    data_source
        .add_pointcut(PointcutConfiguration::new("archive.*").with_nodes(["x"]))
        .unwrap();

    let read = data_source.get_connection_for("archive.scan").route("select * from t").unwrap();
    assert_eq!(read.hit_node_attr.unwrap().name(), "x");
    assert_eq!(read.hit_rule, Some(RouteRule::Force));

    let write = data_source.get_connection_for("archive.purge").route("delete from t").unwrap();
    assert_eq!(write.hit_node_attr.unwrap().name(), "x");
    assert_eq!(write.hit_rule, Some(RouteRule::Force));
}
