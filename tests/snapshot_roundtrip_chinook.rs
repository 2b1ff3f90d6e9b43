mod common;

use steep_core::db::snapshots::Compression;
use steep_core::fingerprint::SchemaSyncMode;
use steep_core::rpc::Coordinator;
use steep_core::snapshot::{ApplySnapshotInput, GenerateSnapshotInput};
use steep_core::table::Table;
use steep_core::{CoordinatorConfig, NodeId};

const SCHEMA_DDL: &str = "
    CREATE TABLE genre (id SERIAL PRIMARY KEY, name TEXT);
    CREATE TABLE media_type (id SERIAL PRIMARY KEY, name TEXT);
    CREATE TABLE artist (id SERIAL PRIMARY KEY, name TEXT);
    CREATE TABLE album (id SERIAL PRIMARY KEY, title TEXT, artist_id INT REFERENCES artist(id));
    CREATE TABLE track (
        id SERIAL PRIMARY KEY, name TEXT,
        album_id INT REFERENCES album(id),
        media_type_id INT REFERENCES media_type(id),
        genre_id INT REFERENCES genre(id),
        unit_price NUMERIC
    );
    CREATE TABLE playlist (id SERIAL PRIMARY KEY, name TEXT);
    CREATE TABLE playlist_track (
        playlist_id INT REFERENCES playlist(id),
        track_id INT REFERENCES track(id),
        PRIMARY KEY (playlist_id, track_id)
    );
    CREATE TABLE customer (id SERIAL PRIMARY KEY, name TEXT, email TEXT);
    CREATE TABLE employee (id SERIAL PRIMARY KEY, name TEXT, title TEXT);
    CREATE TABLE invoice (id SERIAL PRIMARY KEY, customer_id INT REFERENCES customer(id), total NUMERIC);
    CREATE TABLE invoice_line (
        id SERIAL PRIMARY KEY,
        invoice_id INT REFERENCES invoice(id),
        track_id INT REFERENCES track(id),
        unit_price NUMERIC,
        quantity INT
    );
";

const TABLE_NAMES: &[&str] = &[
    "genre",
    "media_type",
    "artist",
    "album",
    "track",
    "playlist",
    "playlist_track",
    "customer",
    "employee",
    "invoice",
    "invoice_line",
];

const SEQUENCE_TABLES: &[&str] = &[
    "genre",
    "media_type",
    "artist",
    "album",
    "track",
    "playlist",
    "customer",
    "employee",
    "invoice",
    "invoice_line",
];

fn seed_source(client: &mut postgres::Client) {
    client.batch_execute(SCHEMA_DDL).unwrap();
    client
        .batch_execute(
            "INSERT INTO genre (name) VALUES ('Rock'), ('Jazz');
             INSERT INTO media_type (name) VALUES ('MPEG audio file');
             INSERT INTO artist (name) VALUES ('The Replicators'), ('WAL Senders');
             INSERT INTO album (title, artist_id) VALUES ('Commit Log', 1), ('Snapshot Export', 2);
             INSERT INTO track (name, album_id, media_type_id, genre_id, unit_price) VALUES
                ('Repeatable Read', 1, 1, 1, 0.99),
                ('Exported Snapshot', 2, 1, 2, 1.29);
             INSERT INTO playlist (name) VALUES ('Favorites');
             INSERT INTO playlist_track (playlist_id, track_id) VALUES (1, 1), (1, 2);
             INSERT INTO customer (name, email) VALUES ('Alice', 'alice@example.com');
             INSERT INTO employee (name, title) VALUES ('Bob', 'DBA');
             INSERT INTO invoice (customer_id, total) VALUES (1, 2.28);
             INSERT INTO invoice_line (invoice_id, track_id, unit_price, quantity) VALUES
                (1, 1, 0.99, 1), (1, 2, 1.29, 1);",
        )
        .unwrap();
}

fn seed_target_schema(client: &mut postgres::Client) {
    client.batch_execute(SCHEMA_DDL).unwrap();
}

fn row_count(client: &mut postgres::Client, table: &str) -> i64 {
    client
        .query_one(&format!("SELECT count(*) FROM {table}"), &[])
        .unwrap()
        .get(0)
}

fn sequence_value(client: &mut postgres::Client, table: &str) -> i64 {
    client
        .query_one(&format!("SELECT last_value FROM {table}_id_seq"), &[])
        .unwrap()
        .get(0)
}

/// Scenario 2: an 11-table schema round-trips through generate (gzip, 4
/// workers) and apply (checksum-verified, 4 workers) with identical row
/// counts and sequence positions on both sides.
#[test]
fn chinook_like_schema_round_trips_with_matching_row_counts_and_sequences() {
    let cluster = common::TestCluster::provision();
    seed_source(&mut cluster.node_a.get_client());
    seed_target_schema(&mut cluster.node_b.get_client());

    let generator = Coordinator::new(cluster.node_a.conn_info.clone(), CoordinatorConfig::default()).unwrap();
    let output_dir = tempfile::tempdir().unwrap();

    let tables: Vec<Table> = TABLE_NAMES.iter().map(|t| Table::new(&format!("public.{t}"))).collect();
    let sequences: Vec<(String, String)> = SEQUENCE_TABLES
        .iter()
        .map(|t| ("public".to_string(), format!("{t}_id_seq")))
        .collect();

    let generate_rx = generator
        .generate_snapshot(GenerateSnapshotInput {
            snapshot_id: "snap-chinook".to_string(),
            source_node_id: "source".to_string(),
            output_path: output_dir.path().to_path_buf(),
            parallel_workers: 4,
            compression: Compression::Gzip,
            tables,
            sequences,
        })
        .unwrap();

    let mut generate_error = None;
    for update in generate_rx {
        if let Some(err) = update.error {
            generate_error = Some(err);
        }
    }
    assert!(generate_error.is_none(), "generate failed: {generate_error:?}");

    let applier = Coordinator::new(cluster.node_b.conn_info.clone(), CoordinatorConfig::default()).unwrap();
    let target_id = NodeId::from("target");
    applier.register_node(&target_id, "target", "10.0.0.2", 5432, 50).unwrap();

    let apply_rx = applier
        .apply_snapshot(ApplySnapshotInput {
            target_node_id: target_id,
            input_path: output_dir.path().to_path_buf(),
            parallel_workers: 4,
            verify_checksums: true,
            schema_sync_mode: SchemaSyncMode::Manual,
        })
        .unwrap();

    let mut apply_error = None;
    for update in apply_rx {
        if let Some(err) = update.error {
            apply_error = Some(err);
        }
    }
    assert!(apply_error.is_none(), "apply failed: {apply_error:?}");

    let mut source_client = cluster.node_a.get_client();
    let mut target_client = cluster.node_b.get_client();
    for table in TABLE_NAMES {
        let source_count = row_count(&mut source_client, table);
        let target_count = row_count(&mut target_client, table);
        assert_eq!(source_count, target_count, "row count mismatch for {table}");
    }
    for table in SEQUENCE_TABLES {
        let source_seq = sequence_value(&mut source_client, table);
        let target_seq = sequence_value(&mut target_client, table);
        assert_eq!(source_seq, target_seq, "sequence mismatch for {table}");
    }
}
