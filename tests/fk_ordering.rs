mod common;

use steep_core::fk;
use steep_core::table::Table;

fn create_chain(client: &mut postgres::Client) {
    client
        .batch_execute(
            "CREATE TABLE a (id INT PRIMARY KEY);
             CREATE TABLE b (id INT PRIMARY KEY, a_id INT REFERENCES a(id));
             CREATE TABLE c (id INT PRIMARY KEY, b_id INT REFERENCES b(id));
             CREATE TABLE d (id INT PRIMARY KEY, c_id INT REFERENCES c(id));",
        )
        .unwrap();
}

/// Scenario 6: tables `A <- B <- C <- D`, requested out of order, come back
/// topologically sorted so parents precede children.
#[test]
fn topological_sort_orders_chain_parents_before_children() {
    let db = common::setup_test_db();
    let mut client = db.get_client();
    create_chain(&mut client);

    let requested = vec![
        Table::new("public.d"),
        Table::new("public.c"),
        Table::new("public.b"),
        Table::new("public.a"),
    ];
    let deps = fk::extract_dependencies(&mut *client, &requested).unwrap();
    let ordered = fk::topological_sort(&requested, &deps).unwrap();

    let names: Vec<String> = ordered.iter().map(|t| t.name.clone()).collect();
    assert_eq!(names, vec!["a", "b", "c", "d"]);
}

/// A circular dependency (`A -> B -> C -> A`) is rejected, not silently
/// dropped or arbitrarily ordered.
#[test]
fn circular_dependency_is_rejected_with_circular_in_message() {
    let db = common::setup_test_db();
    let mut client = db.get_client();
    client
        .batch_execute(
            "CREATE TABLE x (id INT PRIMARY KEY, z_id INT);
             CREATE TABLE y (id INT PRIMARY KEY, x_id INT REFERENCES x(id));
             CREATE TABLE z (id INT PRIMARY KEY, y_id INT REFERENCES y(id));
             ALTER TABLE x ADD CONSTRAINT x_z_fk FOREIGN KEY (z_id) REFERENCES z(id);",
        )
        .unwrap();

    let tables = vec![Table::new("public.x"), Table::new("public.y"), Table::new("public.z")];
    let deps = fk::extract_dependencies(&mut *client, &tables).unwrap();
    let err = fk::topological_sort(&tables, &deps).unwrap_err();
    assert!(err.to_string().contains("circular"), "error was: {err}");
}
