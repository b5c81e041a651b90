#![cfg(feature = "pg-tests")]

use fleet_store::{DocumentStore, Filter, PostgresConfig, PostgresStore, StoreError};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;

const TABLE: &str = "nodes_nfd_features";

// Tests share one table; run them one at a time.
static SERIAL: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

async fn pg_store() -> Option<Arc<PostgresStore>> {
    let url = match std::env::var("FLEET_TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
    {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping pg-tests: set FLEET_TEST_DATABASE_URL or DATABASE_URL");
            return None;
        }
    };
    let probe = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        PgPoolOptions::new().max_connections(1).connect(&url),
    )
    .await;
    if !matches!(probe, Ok(Ok(_))) {
        eprintln!("skipping pg-tests: cannot connect to postgres");
        return None;
    }
    // One store per test: a pool is tied to the runtime that created it.
    let store = async {
        let store = PostgresStore::connect(&PostgresConfig::new(url))?;
        store.health_check().await?;
        store.prepare().await?;
        Ok::<_, StoreError>(store)
    }
    .await;
    match store {
        Ok(store) => {
            sqlx::query("TRUNCATE nodes_nfd_features")
                .execute(store.pool())
                .await
                .ok()?;
            Some(Arc::new(store))
        }
        Err(err) => {
            eprintln!("skipping pg-tests: connect postgres store failed: {err}");
            None
        }
    }
}

fn feature(id: &str, node: &str, key: &str, value: &str) -> serde_json::Value {
    json!({"id": id, "node_id": node, "nfd_id": key, "nfd_value": value})
}

#[tokio::test]
async fn crud_round_trip() {
    let _guard = SERIAL.lock().await;
    let Some(store) = pg_store().await else {
        return;
    };
    store
        .insert(TABLE, "a", feature("a", "node-1", "cpu", "8"))
        .await
        .expect("insert");
    assert_eq!(
        store.get(TABLE, "a").await.expect("get"),
        Some(feature("a", "node-1", "cpu", "8"))
    );
    assert_eq!(store.get(TABLE, "missing").await.expect("get"), None);

    store
        .replace(TABLE, vec![feature("a", "node-1", "cpu", "16")])
        .await
        .expect("replace");
    let found = store
        .filter(
            TABLE,
            &[Filter::eq("node_id", "node-1"), Filter::eq("nfd_id", "cpu")],
        )
        .await
        .expect("filter");
    assert_eq!(found, vec![feature("a", "node-1", "cpu", "16")]);

    assert!(!store.remove(TABLE, "missing").await.expect("remove"));
    assert!(store.remove(TABLE, "a").await.expect("remove"));
    assert_eq!(store.get(TABLE, "a").await.expect("get"), None);
}

#[tokio::test]
async fn unique_node_key_is_enforced() {
    let _guard = SERIAL.lock().await;
    let Some(store) = pg_store().await else {
        return;
    };
    store
        .insert(TABLE, "a", feature("a", "node-1", "cpu", "8"))
        .await
        .expect("insert");
    let err = store
        .insert(TABLE, "b", feature("b", "node-1", "cpu", "8"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }), "{err}");
    let err = store
        .insert(TABLE, "a", feature("a", "node-2", "mem", "1"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }), "{err}");
}

#[tokio::test]
async fn replace_without_id_rolls_back() {
    let _guard = SERIAL.lock().await;
    let Some(store) = pg_store().await else {
        return;
    };
    store
        .insert(TABLE, "a", feature("a", "node-1", "cpu", "8"))
        .await
        .expect("insert");
    let err = store
        .replace(
            TABLE,
            vec![feature("a", "node-1", "cpu", "32"), json!({"node_id": "x"})],
        )
        .await
        .unwrap_err();
    assert!(err.is_write_error());
    assert_eq!(
        store.get(TABLE, "a").await.expect("get"),
        Some(feature("a", "node-1", "cpu", "8"))
    );
}

#[tokio::test]
async fn filter_values_are_not_interpolated() {
    let _guard = SERIAL.lock().await;
    let Some(store) = pg_store().await else {
        return;
    };
    store
        .insert(TABLE, "a", feature("a", "node-1", "cpu", "8"))
        .await
        .expect("insert");
    let found = store
        .filter(TABLE, &[Filter::eq("node_id", "x' OR '1'='1")])
        .await
        .expect("filter");
    assert!(found.is_empty());
}
