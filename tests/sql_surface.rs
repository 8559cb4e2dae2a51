use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};

use guestbook::engine::Engine;
use guestbook::wire;

// ── Test infrastructure ──────────────────────────────────────

static SERVER_SEQ: AtomicU32 = AtomicU32::new(0);

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!(
        "guestbook_int_test_{}_{}",
        std::process::id(),
        SERVER_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    let wal_path = dir.join("guestbook.wal");
    let _ = std::fs::remove_file(&wal_path);
    let engine = Arc::new(Engine::new(wal_path).unwrap());

    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("guestbook")
        .user("host");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn select(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

async fn setup_venue(client: &Client, tables: &[(u32, u32)]) {
    for (id, capacity) in tables {
        client
            .batch_execute(&format!(
                "INSERT INTO tables (table_id, capacity) VALUES ({id}, {capacity})"
            ))
            .await
            .unwrap();
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn reserve_arrive_depart_over_sql() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    setup_venue(&client, &[(1, 10)]).await;

    client
        .batch_execute(
            "INSERT INTO guest_list (name, table_id, accompanying_guests) VALUES ('john', 1, 2)",
        )
        .await
        .unwrap();
    client
        .batch_execute("INSERT INTO guests (name, accompanying_guests) VALUES ('john', 3)")
        .await
        .unwrap();

    let arrived = select(&client, "SELECT * FROM guests").await;
    assert_eq!(arrived.len(), 1);
    assert_eq!(arrived[0].get("name"), Some("john"));
    assert_eq!(arrived[0].get("accompanying_guests"), Some("3"));
    assert!(arrived[0].get("time_arrived").is_some());

    let seats = select(&client, "SELECT * FROM seats_empty").await;
    assert_eq!(seats[0].get("seats_empty"), Some("6"));

    client
        .batch_execute("DELETE FROM guests WHERE name = 'john'")
        .await
        .unwrap();
    assert!(select(&client, "SELECT * FROM guests").await.is_empty());

    let seats = select(&client, "SELECT * FROM seats_empty").await;
    assert_eq!(seats[0].get("seats_empty"), Some("10"));

    let info = engine.get_guest("john").await.unwrap();
    assert_eq!(info.accompanying_guests, 3);
    assert_eq!(info.num_arrived, 0);
}

#[tokio::test]
async fn guest_list_is_ordered_by_name() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    setup_venue(&client, &[(1, 10), (2, 10)]).await;

    for (name, table, acc) in [("zoe", 1, 0), ("adam", 2, 3), ("mike", 1, 1)] {
        client
            .batch_execute(&format!(
                "INSERT INTO guest_list (name, table_id, accompanying_guests) VALUES ('{name}', {table}, {acc})"
            ))
            .await
            .unwrap();
    }

    let rows = select(&client, "SELECT * FROM guest_list").await;
    let names: Vec<_> = rows.iter().map(|r| r.get("name").unwrap()).collect();
    assert_eq!(names, ["adam", "mike", "zoe"]);
    assert_eq!(rows[0].get("table_id"), Some("2"));
    assert_eq!(rows[0].get("accompanying_guests"), Some("3"));

    let one = select(&client, "SELECT * FROM guest_list WHERE name = 'mike'").await;
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].get("status"), Some("reserved"));
    assert_eq!(one[0].get("num_arrived"), Some("0"));
    assert_eq!(one[0].get("time_arrived"), None);

    let none = select(&client, "SELECT * FROM guest_list WHERE name = 'nobody'").await;
    assert!(none.is_empty());
}

#[tokio::test]
async fn parameterized_inserts() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    setup_venue(&client, &[(4, 6)]).await;

    let n = client
        .execute(
            "INSERT INTO guest_list (name, table_id, accompanying_guests) VALUES ($1, $2, $3)",
            &[&"o'brien", &"4", &"1"],
        )
        .await
        .unwrap();
    assert_eq!(n, 1);

    client
        .execute(
            "INSERT INTO guests (name, accompanying_guests) VALUES ($1, $2)",
            &[&"o'brien", &"1"],
        )
        .await
        .unwrap();
    let n = client
        .execute("DELETE FROM guests WHERE name = $1", &[&"o'brien"])
        .await
        .unwrap();
    assert_eq!(n, 1);

    let tables = select(&client, "SELECT * FROM tables").await;
    assert_eq!(tables[0].get("table_id"), Some("4"));
    assert_eq!(tables[0].get("num_reserved"), Some("2"));
    assert_eq!(tables[0].get("num_occupied"), Some("0"));
    assert_eq!(tables[0].get("empty_seats"), Some("6"));
}

#[tokio::test]
async fn bound_names_containing_placeholders_stay_intact() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    setup_venue(&client, &[(1, 6)]).await;

    let n = client
        .execute(
            "INSERT INTO guest_list (table_id, name) VALUES ($1, $2)",
            &[&"1", &"table$1vip"],
        )
        .await
        .unwrap();
    assert_eq!(n, 1);

    let info = engine.get_guest("table$1vip").await.unwrap();
    assert_eq!(info.table_id, 1);
    assert_eq!(info.accompanying_guests, 0);

    let rows = select(&client, "SELECT * FROM guest_list WHERE name = 'table$1vip'").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("table_id"), Some("1"));
}

#[tokio::test]
async fn rejections_carry_sqlstate() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    setup_venue(&client, &[(1, 5)]).await;

    client
        .batch_execute(
            "INSERT INTO guest_list (name, table_id, accompanying_guests) VALUES ('john', 1, 4)",
        )
        .await
        .unwrap();

    let err = client
        .batch_execute(
            "INSERT INTO guest_list (name, table_id, accompanying_guests) VALUES ('mike', 1, 0)",
        )
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("53400"));

    let err = client
        .batch_execute("INSERT INTO guest_list (name, table_id) VALUES ('john', 1)")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23505"));

    let err = client
        .batch_execute("INSERT INTO guest_list (name, table_id) VALUES ('anna', 9)")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0002"));

    let err = client
        .batch_execute("DELETE FROM guests WHERE name = 'john'")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("55000"));

    let err = client
        .batch_execute("INSERT INTO guests (name) VALUES ('nobody')")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0002"));

    let err = client
        .batch_execute("INSERT INTO tables (table_id, capacity) VALUES (1, 8)")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23505"));

    let err = client
        .simple_query("SELECT * FROM menu")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42P01"));

    // The connection stays usable after errors.
    assert!(select(&client, "SELECT * FROM invariant_violations").await.is_empty());
}

#[tokio::test]
async fn concurrent_clients_never_overbook() {
    let (addr, engine) = start_test_server().await;
    let setup = connect(addr).await;
    setup_venue(&setup, &[(1, 12)]).await;

    let mut handles = Vec::new();
    for i in 0..8 {
        handles.push(tokio::spawn(async move {
            let client = connect(addr).await;
            let mut admitted = 0;
            for j in 0..5 {
                let sql = format!(
                    "INSERT INTO guest_list (name, table_id, accompanying_guests) VALUES ('g{i}_{j}', 1, 1)"
                );
                if client.batch_execute(&sql).await.is_ok() {
                    admitted += 1;
                }
            }
            admitted
        }));
    }
    let mut admitted = 0;
    for h in handles {
        admitted += h.await.unwrap();
    }

    assert_eq!(admitted, 6);
    assert!(engine.check_invariants().await.is_empty());
    let tables = select(&setup, "SELECT * FROM tables").await;
    assert_eq!(tables[0].get("num_reserved"), Some("12"));
}
