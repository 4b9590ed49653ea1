use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use condobook::clock::CondoClock;
use condobook::tenant::CondoManager;
use condobook::wire::{self, CondoFactory};

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("condobook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let clock = CondoClock::new(chrono_tz::America::Sao_Paulo);
    let condos = Arc::new(CondoManager::new(dir, 1000, clock));
    let factory = Arc::new(CondoFactory::new(
        condos,
        "condobook".to_string(),
        "admin".to_string(),
    ));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    addr
}

async fn try_connect(addr: SocketAddr, user: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("residencial_aurora")
        .user(user)
        .password("condobook");

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr, user: &str) -> Client {
    try_connect(addr, user).await.unwrap()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// SQLSTATE of a failed statement.
async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.err().unwrap();
    err.as_db_error()
        .map(|e| e.code().code().to_string())
        .unwrap_or_else(|| panic!("not a server error: {err}"))
}

async fn create_area(admin: &Client, id: Ulid, name: &str) {
    admin
        .simple_query(&format!(
            "INSERT INTO areas (id, name, max_booking_hours) VALUES ('{id}', '{name}', 6)"
        ))
        .await
        .unwrap();
}

fn reservation_sql(id: Ulid, area_id: Ulid, start: &str, end: &str) -> String {
    format!(
        r#"INSERT INTO reservations (id, area_id, start, "end", reason) VALUES ('{id}', '{area_id}', '{start}', '{end}', 'birthday')"#
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn request_approve_and_conflict() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let unit_a = Ulid::new();
    let unit_b = Ulid::new();
    let resident_a = connect(addr, &format!("unit_{unit_a}")).await;
    let resident_b = connect(addr, &unit_b.to_string()).await;

    let area_id = Ulid::new();
    create_area(&admin, area_id, "Salao de festas").await;

    let first = Ulid::new();
    resident_a
        .simple_query(&reservation_sql(first, area_id, "2026-11-10 18:00", "2026-11-10 22:00"))
        .await
        .unwrap();

    let row = &rows(&admin, &format!("SELECT * FROM reservations WHERE id = '{first}'")).await[0];
    assert_eq!(row.get("status"), Some("PENDING"));
    assert_eq!(row.get("owner_id"), Some(unit_a.to_string().as_str()));
    // 18:00 in São Paulo (UTC-3)
    assert_eq!(row.get("start"), Some("1794344400000"));

    // PENDING already holds the slot
    let code = sqlstate(
        &resident_b,
        &reservation_sql(Ulid::new(), area_id, "2026-11-10 21:00", "2026-11-10 23:00"),
    )
    .await;
    assert_eq!(code, "23P01");

    // Residents cannot approve
    let approve = format!("UPDATE reservations SET status = 'CONFIRMED' WHERE id = '{first}'");
    assert_eq!(sqlstate(&resident_a, &approve).await, "42501");
    admin.simple_query(&approve).await.unwrap();

    // Back-to-back is fine
    resident_b
        .simple_query(&reservation_sql(Ulid::new(), area_id, "2026-11-10 22:00", "2026-11-10 23:00"))
        .await
        .unwrap();

    let mine = rows(&resident_a, &format!("SELECT * FROM reservations WHERE owner_id = '{unit_a}'")).await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("status"), Some("CONFIRMED"));

    // Only the owner may cancel
    let cancel = format!("DELETE FROM reservations WHERE id = '{first}'");
    assert_eq!(sqlstate(&resident_b, &cancel).await, "42501");
    resident_a.simple_query(&cancel).await.unwrap();
    assert_eq!(sqlstate(&resident_a, &cancel).await, "55000");
}

#[tokio::test]
async fn block_day_and_unblock() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let unit = Ulid::new();
    let resident = connect(addr, &format!("unit_{unit}")).await;

    let pool = Ulid::new();
    let gym = Ulid::new();
    create_area(&admin, pool, "Piscina").await;
    create_area(&admin, gym, "Academia").await;

    let block = format!(
        "INSERT INTO blocks (area_id, day, reason) VALUES ('{pool}', '2026-12-24', 'Natal'), ('{gym}', '2026-12-24', 'Natal')"
    );
    assert_eq!(sqlstate(&resident, &block).await, "42501");
    admin.simple_query(&block).await.unwrap();

    let code = sqlstate(
        &resident,
        &reservation_sql(Ulid::new(), pool, "2026-12-24 10:00", "2026-12-24 12:00"),
    )
    .await;
    assert_eq!(code, "23P02");

    let calendar = rows(
        &resident,
        &format!("SELECT * FROM calendar WHERE area_id = '{gym}' AND day = '2026-12-24'"),
    )
    .await;
    assert_eq!(calendar[0].get("status"), Some("BLOCKED"));
    assert_eq!(calendar[0].get("reason"), Some("Natal"));
    assert!(
        rows(&resident, &format!("SELECT * FROM availability WHERE area_id = '{gym}' AND day = '2026-12-24'"))
            .await
            .is_empty()
    );

    admin
        .simple_query(&format!("DELETE FROM blocks WHERE area_id = '{pool}' AND day = '2026-12-24'"))
        .await
        .unwrap();
    resident
        .simple_query(&reservation_sql(Ulid::new(), pool, "2026-12-24 10:00", "2026-12-24 12:00"))
        .await
        .unwrap();

    let free = rows(
        &resident,
        &format!("SELECT * FROM availability WHERE area_id = '{pool}' AND day = '2026-12-24'"),
    )
    .await;
    assert_eq!(free.len(), 2);

    // The gym stays blocked
    let calendar = rows(
        &resident,
        &format!("SELECT * FROM calendar WHERE area_id = '{gym}' AND day = '2026-12-24'"),
    )
    .await;
    assert_eq!(calendar[0].get("status"), Some("BLOCKED"));
}

#[tokio::test]
async fn areas_are_admin_managed() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let resident = connect(addr, &format!("unit_{}", Ulid::new())).await;

    let area_id = Ulid::new();
    let insert = format!("INSERT INTO areas (id, name) VALUES ('{area_id}', 'Churrasqueira')");
    assert_eq!(sqlstate(&resident, &insert).await, "42501");
    admin.simple_query(&insert).await.unwrap();
    assert_eq!(sqlstate(&admin, &insert).await, "23505");

    admin
        .simple_query(&format!("UPDATE areas SET price_per_hour = 35.00 WHERE id = '{area_id}'"))
        .await
        .unwrap();
    let listed = rows(&resident, "SELECT * FROM areas").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("name"), Some("Churrasqueira"));
    assert_eq!(listed[0].get("price_per_hour"), Some("35.00"));
    assert_eq!(listed[0].get("capacity"), Some("10"));

    admin
        .simple_query(&format!("DELETE FROM areas WHERE id = '{area_id}'"))
        .await
        .unwrap();
    let code = sqlstate(
        &resident,
        &reservation_sql(Ulid::new(), area_id, "2026-11-10 18:00", "2026-11-10 19:00"),
    )
    .await;
    assert_eq!(code, "22023");
}

#[tokio::test]
async fn bad_sql_and_unknown_users_are_refused() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;

    assert_eq!(sqlstate(&admin, "SELECT * FROM bookings").await, "42601");
    assert_eq!(sqlstate(&admin, "DROP TABLE areas").await, "42601");

    let refused = try_connect(addr, "postgres").await;
    assert!(refused.is_err());
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let area_id = Ulid::new();
    create_area(&admin, area_id, "Quadra").await;

    let id = Ulid::new().to_string();
    let area = area_id.to_string();
    admin
        .execute(
            r#"INSERT INTO reservations (id, area_id, start, "end") VALUES ($1, $2, $3, $4)"#,
            &[&id, &area, &"2026-11-12 08:00", &"2026-11-12 10:00"],
        )
        .await
        .unwrap();

    let found = admin
        .query("SELECT * FROM reservations WHERE id = $1", &[&id])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let status: String = found[0].get("status");
    let kind: String = found[0].get("kind");
    assert_eq!(status, "CONFIRMED");
    assert_eq!(kind, "walk_in");
}
