mod common;

use steep_core::db::snapshots::Compression;
use steep_core::rpc::Coordinator;
use steep_core::snapshot::GenerateSnapshotInput;
use steep_core::table::Table;
use steep_core::CoordinatorConfig;

/// Scenario 1: a single 100-row table, generated with no compression, ends
/// up `complete` with a manifest covering every table and a verifiable
/// checksum.
#[test]
fn basic_generate_produces_a_complete_snapshot() {
    let db = common::setup_test_db();
    {
        let mut client = db.get_client();
        client
            .batch_execute("CREATE TABLE snapshot_test (id SERIAL PRIMARY KEY, name TEXT, value INT)")
            .unwrap();
        for i in 1..=100 {
            client
                .execute(
                    "INSERT INTO snapshot_test (id, name, value) VALUES ($1, $2, $3)",
                    &[&i, &format!("item_{i}"), &(i * 10)],
                )
                .unwrap();
        }
        client
            .batch_execute("CREATE PUBLICATION snapshot_test_pub FOR TABLE snapshot_test")
            .unwrap();
    }

    let coordinator = Coordinator::new(db.conn_info.clone(), CoordinatorConfig::default()).unwrap();
    let output_dir = tempfile::tempdir().unwrap();

    let rx = coordinator
        .generate_snapshot(GenerateSnapshotInput {
            snapshot_id: "snap-1".to_string(),
            source_node_id: "node-a".to_string(),
            output_path: output_dir.path().to_path_buf(),
            parallel_workers: 1,
            compression: Compression::None,
            tables: vec![Table::new("public.snapshot_test")],
            sequences: vec![],
        })
        .unwrap();

    let mut last_error = None;
    for update in rx {
        if let Some(err) = update.error {
            last_error = Some(err);
        }
    }
    assert!(last_error.is_none(), "generate failed: {last_error:?}");

    let mut client = db.get_client();
    let row = client
        .query_one(
            "SELECT status, table_count, checksum FROM steep_repl.snapshots WHERE snapshot_id = 'snap-1'",
            &[],
        )
        .unwrap();
    let status: String = row.get("status");
    let table_count: i32 = row.get("table_count");
    let checksum: String = row.get("checksum");
    assert_eq!(status, "complete");
    assert!(table_count >= 1);
    assert!(!checksum.is_empty());
}
