//! End to end replication between engines over the in-process transport

use std::sync::Arc;

use symsync::model::{NodeGroupLink, NodeGroupLinkAction, Router, Trigger, TriggerRouter};
use symsync::prelude::*;

const ITEM_DDL: &str =
    "CREATE TABLE item (id INTEGER PRIMARY KEY, name TEXT, price REAL, store_id TEXT);";

fn config(node_id: &str, group: &str, body: &str) -> SyncConfig {
    SyncConfig::from_str(&format!(
        r#"
[node]
group_id = "{group}"
external_id = "{node_id}"
registration_url = "internal://000"
node_password = "pw-{node_id}"

[database]
path = "unused.sqlite"

[parameters]
"num.of.ack.retries" = "1"
"time.between.ack.retries.ms" = "0"
{body}
"#
    ))
    .unwrap()
}

async fn engine(config: SyncConfig, ddl: &str, transport: &InternalTransportManager) -> Arc<SyncEngine> {
    let database = Arc::new(Database::open_in_memory().unwrap());
    database.lock().await.execute_batch(ddl).unwrap();
    let engine = Arc::new(
        SyncEngine::new(config, database, Arc::new(transport.clone()))
            .await
            .unwrap(),
    );
    let endpoint: Arc<dyn SyncEndpoint> = engine.clone();
    transport.register(&endpoint);
    engine
}

async fn add_trigger_router(engine: &SyncEngine, router: Router) {
    {
        let conn = engine.database().lock().await;
        engine
            .services()
            .trigger_routers
            .save_trigger_router(
                &conn,
                &TriggerRouter::new(Trigger::new("item", "item", "default"), router),
            )
            .unwrap();
    }
    let summary = engine.sync_triggers(false).await.unwrap();
    assert_eq!(summary.failed, 0);
}

async fn execute(engine: &SyncEngine, sql: &str) {
    engine.database().lock().await.execute_batch(sql).unwrap();
}

async fn count(engine: &SyncEngine, sql: &str) -> i64 {
    engine
        .database()
        .lock()
        .await
        .query_row(sql, [], |row| row.get(0))
        .unwrap()
}

async fn item_name(engine: &SyncEngine, id: i64) -> Option<String> {
    let conn = engine.database().lock().await;
    conn.query_row("SELECT name FROM item WHERE id = ?1", [id], |row| row.get(0))
        .ok()
}

/// Corp `000` with stores `001` and `002` pulling from it
struct Mesh {
    corp: Arc<SyncEngine>,
    stores: Vec<Arc<SyncEngine>>,
    _transport: InternalTransportManager,
}

const CORP_BODY: &str = r#"
[[peers]]
node_id = "001"
group_id = "store"
password = "pw-001"

[[peers]]
node_id = "002"
group_id = "store"
password = "pw-002"

[[links]]
source_group_id = "corp"
target_group_id = "store"
action = "W"

[[links]]
source_group_id = "store"
target_group_id = "corp"
action = "P"
"#;

const STORE_BODY: &str = r#"
[[peers]]
node_id = "000"
group_id = "corp"
password = "pw-000"

[[links]]
source_group_id = "corp"
target_group_id = "store"
action = "W"

[[links]]
source_group_id = "store"
target_group_id = "corp"
action = "P"
"#;

async fn mesh(store_ddl: &str) -> Mesh {
    let transport = InternalTransportManager::new();
    let corp = engine(config("000", "corp", CORP_BODY), ITEM_DDL, &transport).await;
    add_trigger_router(
        &corp,
        Router::new(
            "corp_2_store",
            NodeGroupLink::new("corp", "store", NodeGroupLinkAction::WaitForPull),
        ),
    )
    .await;

    let mut stores = Vec::new();
    for node_id in ["001", "002"] {
        stores.push(engine(config(node_id, "store", STORE_BODY), store_ddl, &transport).await);
    }
    Mesh {
        corp,
        stores,
        _transport: transport,
    }
}

#[tokio::test]
async fn test_changes_flow_from_corp_to_every_store() {
    let mesh = mesh(ITEM_DDL).await;
    execute(
        &mesh.corp,
        "INSERT INTO item (id, name, price) VALUES (1, 'pen', 1.5);
         INSERT INTO item (id, name, price) VALUES (2, 'ink, \"blue\"', 3.0);",
    )
    .await;
    assert_eq!(mesh.corp.route().await.unwrap(), 4);

    for store in &mesh.stores {
        let statuses = store.pull().await.unwrap();
        assert_eq!(statuses[0].status, RemoteStatus::DataProcessed);
        assert_eq!(item_name(store, 1).await.as_deref(), Some("pen"));
        assert_eq!(item_name(store, 2).await.as_deref(), Some("ink, \"blue\""));
        assert_eq!(
            count(store, "SELECT COUNT(*) FROM sym_incoming_batch WHERE status = 'OK'").await,
            1
        );
    }
    assert_eq!(
        count(&mesh.corp, "SELECT COUNT(*) FROM sym_outgoing_batch WHERE status = 'OK' AND node_id != '-1'").await,
        2
    );

    execute(
        &mesh.corp,
        "UPDATE item SET name = 'fountain pen' WHERE id = 1; DELETE FROM item WHERE id = 2;",
    )
    .await;
    mesh.corp.route().await.unwrap();
    let store = &mesh.stores[0];
    store.pull().await.unwrap();
    assert_eq!(item_name(store, 1).await.as_deref(), Some("fountain pen"));
    assert_eq!(item_name(store, 2).await, None);

    // Nothing left for a store that is up to date
    let statuses = store.pull().await.unwrap();
    assert_eq!(statuses[0].status, RemoteStatus::NoData);
}

#[tokio::test]
async fn test_store_pushes_to_corp_without_echo() {
    let mesh = mesh(ITEM_DDL).await;
    let store = &mesh.stores[0];
    add_trigger_router(
        store,
        Router::new(
            "store_2_corp",
            NodeGroupLink::new("store", "corp", NodeGroupLinkAction::Push),
        ),
    )
    .await;

    execute(store, "INSERT INTO item (id, name) VALUES (10, 'stapler')").await;
    store.route().await.unwrap();
    let statuses = store.push().await.unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].status, RemoteStatus::DataProcessed);
    assert_eq!(item_name(&mesh.corp, 10).await.as_deref(), Some("stapler"));
    assert_eq!(
        count(store, "SELECT COUNT(*) FROM sym_outgoing_batch WHERE status = 'OK' AND node_id = '000'").await,
        1
    );

    // The loaded row is not captured again on corp
    assert_eq!(count(&mesh.corp, "SELECT COUNT(*) FROM sym_data").await, 0);
}

#[tokio::test]
async fn test_failed_batch_is_redelivered_after_fix() {
    let strict = "CREATE TABLE item (id INTEGER PRIMARY KEY, name TEXT NOT NULL, price REAL, store_id TEXT);";
    let mesh = mesh(strict).await;
    execute(&mesh.corp, "INSERT INTO item (id, name) VALUES (5, NULL)").await;
    mesh.corp.route().await.unwrap();

    let store = &mesh.stores[0];
    let statuses = store.pull().await.unwrap();
    assert_eq!(statuses[0].status, RemoteStatus::DataError);
    assert_eq!(
        count(store, "SELECT COUNT(*) FROM sym_incoming_batch WHERE status = 'ER'").await,
        1
    );
    assert_eq!(
        count(&mesh.corp, "SELECT COUNT(*) FROM sym_outgoing_batch WHERE status = 'ER' AND node_id = '001'").await,
        1
    );

    {
        let conn = store.database().lock().await;
        conn.execute_batch("DROP TABLE item;").unwrap();
        conn.execute_batch(ITEM_DDL).unwrap();
        store.services().platform.reset_cache();
    }

    let statuses = store.pull().await.unwrap();
    assert_eq!(statuses[0].status, RemoteStatus::DataProcessed);
    assert_eq!(count(store, "SELECT COUNT(*) FROM item WHERE id = 5").await, 1);
    assert_eq!(
        count(&mesh.corp, "SELECT COUNT(*) FROM sym_outgoing_batch WHERE status = 'OK' AND node_id = '001'").await,
        1
    );
}

#[tokio::test]
async fn test_column_router_sends_rows_to_their_store() {
    let transport = InternalTransportManager::new();
    let corp = engine(config("000", "corp", CORP_BODY), ITEM_DDL, &transport).await;
    let mut router = Router::new(
        "corp_2_one_store",
        NodeGroupLink::new("corp", "store", NodeGroupLinkAction::WaitForPull),
    );
    router.router_type = Some("column".to_string());
    router.router_expression = Some("store_id=:EXTERNAL_ID".to_string());
    add_trigger_router(&corp, router).await;
    let first = engine(config("001", "store", STORE_BODY), ITEM_DDL, &transport).await;
    let second = engine(config("002", "store", STORE_BODY), ITEM_DDL, &transport).await;

    execute(
        &corp,
        "INSERT INTO item (id, name, store_id) VALUES (1, 'only one', '001');
         INSERT INTO item (id, name, store_id) VALUES (2, 'only two', '002');",
    )
    .await;
    corp.route().await.unwrap();
    first.pull().await.unwrap();
    second.pull().await.unwrap();

    assert_eq!(item_name(&first, 1).await.as_deref(), Some("only one"));
    assert_eq!(item_name(&first, 2).await, None);
    assert_eq!(item_name(&second, 2).await.as_deref(), Some("only two"));
    assert_eq!(item_name(&second, 1).await, None);
}

#[tokio::test]
async fn test_reload_sends_existing_rows() {
    let mesh = mesh(ITEM_DDL).await;
    // Existing rows, with their captured changes discarded
    execute(
        &mesh.corp,
        "INSERT INTO item (id, name) VALUES (1, 'a'); INSERT INTO item (id, name) VALUES (2, 'b');
         INSERT INTO item (id, name) VALUES (3, 'c'); DELETE FROM sym_data;",
    )
    .await;

    let batch_ids = mesh.corp.reload_table("001", "item", Some("id >= 2")).await.unwrap();
    assert_eq!(batch_ids.len(), 1);

    let store = &mesh.stores[0];
    let statuses = store.pull().await.unwrap();
    assert_eq!(statuses[0].status, RemoteStatus::DataProcessed);
    assert_eq!(item_name(store, 1).await, None);
    assert_eq!(item_name(store, 2).await.as_deref(), Some("b"));
    assert_eq!(item_name(store, 3).await.as_deref(), Some("c"));

    // The other store was not part of the reload
    let statuses = mesh.stores[1].pull().await.unwrap();
    assert_eq!(statuses[0].status, RemoteStatus::NoData);
}

#[tokio::test]
async fn test_dropped_engine_is_offline() {
    let transport = InternalTransportManager::new();
    let store = engine(config("001", "store", STORE_BODY), ITEM_DDL, &transport).await;
    let statuses = store.pull().await.unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].status, RemoteStatus::Offline);
}
