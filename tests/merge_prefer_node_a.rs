mod common;

use steep_core::conflict::ResolutionStrategy;
use steep_core::rpc::{Coordinator, ExecuteMergeInput};
use steep_core::table::Table;
use steep_core::CoordinatorConfig;

fn seed_users(client: &mut postgres::Client, version: &str) {
    client
        .batch_execute("CREATE TABLE users (id INT PRIMARY KEY, name TEXT, version TEXT)")
        .unwrap();
    for (id, name) in [(1, "alice"), (2, "bob"), (3, "charlie")] {
        client
            .execute(
                "INSERT INTO users (id, name, version) VALUES ($1, $2, $3)",
                &[&id, &name, &version],
            )
            .unwrap();
    }
}

/// Scenario 5: both nodes have the same three PKs with differing `version`
/// values; `prefer_node_a` must make every row on both sides read `'A'`.
#[test]
fn prefer_node_a_strategy_converges_every_conflicting_row_to_a() {
    let cluster = common::TestCluster::provision();
    seed_users(&mut cluster.node_a.get_client(), "A");
    seed_users(&mut cluster.node_b.get_client(), "B");

    let coordinator = Coordinator::new(cluster.node_a.conn_info.clone(), CoordinatorConfig::default()).unwrap();

    let outcome = coordinator
        .execute_merge(ExecuteMergeInput {
            merge_id: "merge-1".to_string(),
            peer_conn_info: cluster.node_b.conn_info.clone(),
            strategy: ResolutionStrategy::PreferNodeA,
            dry_run: false,
            tables: vec![Table::new("public.users")],
        })
        .unwrap();

    assert_eq!(outcome.summary.conflicts, 3);

    for db in [&cluster.node_a, &cluster.node_b] {
        let mut client = db.get_client();
        let rows = client.query("SELECT version FROM users ORDER BY id", &[]).unwrap();
        assert_eq!(rows.len(), 3);
        for row in rows {
            let version: String = row.get(0);
            assert_eq!(version, "A");
        }
    }

    let mut a_client = cluster.node_a.get_client();
    let audit_rows = a_client
        .query(
            "SELECT category, resolution FROM steep_repl.merge_audit_log WHERE merge_id = 'merge-1'",
            &[],
        )
        .unwrap();
    assert_eq!(audit_rows.len(), 3);
    for row in audit_rows {
        let category: String = row.get("category");
        let resolution: String = row.get("resolution");
        assert_eq!(category, "conflict");
        assert_eq!(resolution, "kept_a");
    }
}
