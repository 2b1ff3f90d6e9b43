mod common;

use steep_core::db::nodes;
use steep_core::init_manager::ReinitScope;
use steep_core::rpc::Coordinator;
use steep_core::state_machine::InitState;
use steep_core::table::Table;
use steep_core::{CoordinatorConfig, NodeId};

fn seed_schema(client: &mut postgres::Client) {
    client
        .batch_execute(
            "CREATE TABLE customers (id INT PRIMARY KEY, name TEXT);
             CREATE TABLE products (id INT PRIMARY KEY, name TEXT);
             CREATE TABLE orders (id INT PRIMARY KEY, product_id INT);
             INSERT INTO customers VALUES (1, 'alice');
             INSERT INTO products VALUES (1, 'widget');
             INSERT INTO orders VALUES (1, 1), (2, 1);",
        )
        .unwrap();
}

/// Scenario 3: a target already synchronized over three tables has `orders`
/// corrupted; a partial reinit scoped to just `orders` truncates only that
/// table, leaves the others alone, and moves the node to `catching_up`.
#[test]
fn partial_reinit_affects_only_the_named_table() {
    let db = common::setup_test_db();
    seed_schema(&mut db.get_client());

    let target = NodeId::from("target");
    let source = NodeId::from("source");
    {
        let mut client = db.get_client();
        nodes::register_node(&mut *client, &target, "target", "10.0.0.2", 5432, 50).unwrap();
        nodes::set_init_state(&mut *client, &target, InitState::Synchronized, Some(&source)).unwrap();
    }

    let coordinator = Coordinator::new(db.conn_info.clone(), CoordinatorConfig::default()).unwrap();
    let affected = coordinator
        .start_reinit(&target, &source, ReinitScope::Tables(vec![Table::new("public.orders")]))
        .unwrap();
    assert_eq!(affected, 1);

    let mut client = db.get_client();
    let orders_count: i64 = client.query_one("SELECT count(*) FROM orders", &[]).unwrap().get(0);
    let customers_count: i64 = client.query_one("SELECT count(*) FROM customers", &[]).unwrap().get(0);
    let products_count: i64 = client.query_one("SELECT count(*) FROM products", &[]).unwrap().get(0);
    assert_eq!(orders_count, 0);
    assert_eq!(customers_count, 1);
    assert_eq!(products_count, 1);

    let node = nodes::get_node(&mut *client, &target).unwrap().unwrap();
    assert_eq!(node.init_state, InitState::CatchingUp);
}
