mod common;

use steep_core::fingerprint::{self, SchemaSyncMode};
use steep_core::logical_replication::Lsn;
use steep_core::rpc::Coordinator;
use steep_core::{CoordinatorConfig, NodeId};

/// Scenario 4: the source's `users` has an extra `extra` column the target
/// lacks. Under `strict` mode with the schema check enabled, `CompleteInit`
/// must fail and leave the target's schema untouched.
#[test]
fn strict_mode_rejects_a_mismatched_schema() {
    let cluster = common::TestCluster::provision();

    {
        let mut source = cluster.node_a.get_client();
        source
            .batch_execute("CREATE TABLE users (id INT PRIMARY KEY, name TEXT, extra TEXT)")
            .unwrap();
        fingerprint::capture_all(&mut *source).unwrap();
    }
    {
        let mut target = cluster.node_b.get_client();
        target
            .batch_execute("CREATE TABLE users (id INT PRIMARY KEY, name TEXT)")
            .unwrap();
        fingerprint::capture_all(&mut *target).unwrap();
    }

    let coordinator = Coordinator::new(cluster.node_b.conn_info.clone(), CoordinatorConfig::default()).unwrap();
    let target_id = NodeId::from("target");
    let source_id = NodeId::from("source");
    coordinator
        .register_node(&target_id, "target", "10.0.0.2", 5432, 50)
        .unwrap();

    let result = coordinator.complete_init(
        &target_id,
        &source_id,
        Lsn(0),
        "unused_slot",
        SchemaSyncMode::Strict,
        &cluster.node_a.conn_info,
        false,
    );

    assert!(result.is_err(), "strict schema sync should have failed");

    let mut target = cluster.node_b.get_client();
    let columns: i64 = target
        .query_one(
            "SELECT count(*) FROM information_schema.columns WHERE table_name = 'users'",
            &[],
        )
        .unwrap()
        .get(0);
    assert_eq!(columns, 2, "target schema must remain untouched on failure");
}
