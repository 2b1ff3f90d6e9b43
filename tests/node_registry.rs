mod common;

use steep_core::rpc::{Coordinator, ServingStatus};
use steep_core::{CoordinatorConfig, NodeId};

fn coordinator(conn_info: &str) -> Coordinator {
    Coordinator::new(conn_info.to_string(), CoordinatorConfig::default()).unwrap()
}

#[test]
fn register_and_list_nodes_ordered_by_priority() {
    let db = common::setup_test_db();
    let coordinator = coordinator(&db.conn_info);

    coordinator
        .register_node(&NodeId::from("low"), "low-priority", "10.0.0.1", 5432, 10)
        .unwrap();
    coordinator
        .register_node(&NodeId::from("high"), "high-priority", "10.0.0.2", 5432, 90)
        .unwrap();

    let nodes = coordinator.get_nodes().unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].node_id, NodeId::from("high"));
    assert_eq!(nodes[1].node_id, NodeId::from("low"));
}

#[test]
fn register_node_rejects_out_of_range_port_and_priority() {
    let db = common::setup_test_db();
    let coordinator = coordinator(&db.conn_info);

    assert!(coordinator
        .register_node(&NodeId::from("n1"), "n1", "10.0.0.1", 0, 10)
        .is_err());
    assert!(coordinator
        .register_node(&NodeId::from("n1"), "n1", "10.0.0.1", 5432, 101)
        .is_err());
}

#[test]
fn heartbeat_updates_last_seen_and_status() {
    let db = common::setup_test_db();
    let coordinator = coordinator(&db.conn_info);
    let node_id = NodeId::from("n1");
    coordinator
        .register_node(&node_id, "n1", "10.0.0.1", 5432, 50)
        .unwrap();

    coordinator.heartbeat(&node_id).unwrap();

    let nodes = coordinator.get_nodes().unwrap();
    assert!(nodes[0].last_seen.is_some());
}

#[test]
fn health_check_reports_serving_when_database_reachable() {
    let db = common::setup_test_db();
    let coordinator = coordinator(&db.conn_info);
    let health = coordinator.health_check();
    assert_eq!(health.status, ServingStatus::Serving);
    assert!(health.postgresql);
}
