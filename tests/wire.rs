use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};

use slotgate::admission::AdmissionController;
use slotgate::cache::{CapacityCache, Counters, MemoryCounters};
use slotgate::ledger::Ledger;
use slotgate::pool::PoolModel;
use slotgate::wire::{self, Controller, SlotgateFactory};

const POOLS: &str = r#"{
    "pools": [
        {"id": "case_1", "capacity": 32, "resources": [{"id": "case1"}]},
        {"id": "case_23", "capacity": 41, "resources": [{"id": "case2"}, {"id": "case3"}]}
    ],
    "independent": [{"id": "keynote", "capacity": 1}],
    "grids": [{"name": "vr_day1", "rooms": ["vr1", "vr2"], "times": ["10:00", "10:30"]}]
}"#;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Controller>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let model = Arc::new(PoolModel::from_json(POOLS).unwrap());
    let cache = CapacityCache::new(Counters::Memory(MemoryCounters::new()), "it");
    let controller = Arc::new(AdmissionController::new(model, Ledger::in_memory(), cache));
    controller.resync_all().await.unwrap();

    let factory = Arc::new(SlotgateFactory::new(controller.clone(), "slotgate".into()));
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

    (addr, controller)
}

async fn connect_with(addr: SocketAddr, password: &str) -> Result<tokio_postgres::Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("slotgate")
        .user("bot")
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    connect_with(addr, "slotgate").await.unwrap()
}

/// Data rows of a simple query, as text.
async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<Vec<String>> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(
                (0..row.len())
                    .map(|i| row.get(i).unwrap_or_default().to_string())
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

/// Row count from the command tag of a simple query.
async fn affected(client: &tokio_postgres::Client, sql: &str) -> u64 {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .find_map(|msg| match msg {
            SimpleQueryMessage::CommandComplete(n) => Some(n),
            _ => None,
        })
        .unwrap()
}

async fn claim(client: &tokio_postgres::Client, user: i64, resource: &str) -> String {
    let sql = format!("INSERT INTO claims (user_id, resource_id) VALUES ({user}, '{resource}')");
    rows(client, &sql).await.remove(0).remove(0)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn claim_lifecycle_over_simple_query() {
    let (addr, _ctl) = start_test_server().await;
    let client = connect(addr).await;

    assert_eq!(affected(&client, "INSERT INTO users VALUES (1)").await, 1);
    assert_eq!(affected(&client, "INSERT INTO users VALUES (1)").await, 0);
    assert_eq!(affected(&client, "INSERT INTO users VALUES (2)").await, 1);

    assert_eq!(claim(&client, 3, "case2").await, "user_not_found");
    assert_eq!(claim(&client, 1, "case2").await, "success");
    assert_eq!(claim(&client, 1, "case2").await, "already_registered_this");
    assert_eq!(claim(&client, 1, "case3").await, "switched");

    let held = rows(&client, "SELECT * FROM claims WHERE user_id = 1").await;
    assert_eq!(held.len(), 1);
    assert_eq!(held[0][1], "case3");
    assert_eq!(held[0][2], "case_23");

    let remaining = rows(&client, "SELECT * FROM remaining WHERE pool_id = 'case_23'").await;
    assert_eq!(remaining, vec![vec!["case_23".to_string(), "41".into(), "40".into()]]);

    assert_eq!(
        affected(&client, "DELETE FROM claims WHERE user_id = 1 AND pool_id = 'case_23'").await,
        1
    );
    assert_eq!(
        affected(&client, "DELETE FROM claims WHERE user_id = 1 AND pool_id = 'case_23'").await,
        0
    );
    assert!(rows(&client, "SELECT * FROM claims WHERE user_id = 1").await.is_empty());
}

#[tokio::test]
async fn last_slot_goes_to_one_client() {
    let (addr, _ctl) = start_test_server().await;
    let a = connect(addr).await;
    let b = connect(addr).await;
    a.batch_execute("INSERT INTO users VALUES (10)").await.unwrap();
    a.batch_execute("INSERT INTO users VALUES (11)").await.unwrap();

    let (ra, rb) = tokio::join!(claim(&a, 10, "keynote"), claim(&b, 11, "keynote"));
    let mut outcomes = vec![ra, rb];
    outcomes.sort();
    assert_eq!(outcomes, vec!["group_full".to_string(), "success".to_string()]);

    let remaining = rows(&a, "SELECT * FROM remaining WHERE pool_id = 'keynote'").await;
    assert_eq!(remaining[0][2], "0");
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let (addr, _ctl) = start_test_server().await;
    let client = connect(addr).await;
    client.batch_execute("INSERT INTO users VALUES (7)").await.unwrap();

    let rows = client
        .query(
            "INSERT INTO claims (user_id, resource_id) VALUES ($1, $2)",
            &[&"7", &"case1"],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get::<_, &str>(0), "success");

    let claims = client
        .query("SELECT * FROM claims WHERE user_id = $1", &[&"7"])
        .await
        .unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].get::<_, &str>("resource_id"), "case1");
    assert_eq!(claims[0].get::<_, i64>("user_id"), 7);
}

#[tokio::test]
async fn unknown_resource_is_undefined_object() {
    let (addr, _ctl) = start_test_server().await;
    let client = connect(addr).await;
    client.batch_execute("INSERT INTO users VALUES (1)").await.unwrap();

    let err = client
        .simple_query("INSERT INTO claims (user_id, resource_id) VALUES (1, 'case9')")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::UNDEFINED_OBJECT));

    let err = client.simple_query("SELECT * FROM bookings").await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::SYNTAX_ERROR));
}

#[tokio::test]
async fn slot_grid_over_wire() {
    let (addr, _ctl) = start_test_server().await;
    let client = connect(addr).await;
    client.batch_execute("INSERT INTO users VALUES (5)").await.unwrap();

    assert_eq!(claim(&client, 5, "slot:vr_day1:vr2:10:30").await, "success");
    let slots = rows(&client, "SELECT * FROM slots WHERE room = 'vr2' AND grid = 'vr_day1'").await;
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0][2], "10:00");
    assert_eq!(slots[0][3], "f");
    assert_eq!(slots[1][3], "t");

    let err = client
        .simple_query("SELECT * FROM slots WHERE room = 'vr9'")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::UNDEFINED_OBJECT));
}

#[tokio::test]
async fn resync_command_repairs_cache() {
    let (addr, ctl) = start_test_server().await;
    let client = connect(addr).await;

    ctl.cache().resync("case_1", 30).await.unwrap();
    let before = rows(&client, "SELECT * FROM remaining WHERE pool_id = 'case_1'").await;
    assert_eq!(before[0][2], "2");

    assert_eq!(affected(&client, "RESYNC 'case_1'").await, 1);
    let after = rows(&client, "SELECT * FROM remaining WHERE pool_id = 'case_1'").await;
    assert_eq!(after[0][2], "32");

    assert_eq!(affected(&client, "RESYNC").await, ctl.model().pool_ids().count() as u64);
}

#[tokio::test]
async fn wrong_password_rejected() {
    let (addr, _ctl) = start_test_server().await;
    assert!(connect_with(addr, "nope").await.is_err());
}
