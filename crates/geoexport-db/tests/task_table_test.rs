//! Integration tests for the per-step task table.
//!
//! These spin up (or reuse) a disposable PostgreSQL instance through
//! `geoexport-test-utils` and create a throwaway database per test.

use std::sync::Arc;

use geoexport_db::task_table;
use geoexport_test_utils::{create_test_db, drop_test_db};
use tokio::task::JoinSet;

#[tokio::test]
async fn create_is_idempotent() {
    let (pool, db_name) = create_test_db().await;

    task_table::create(&pool, "public", "step_1").await.unwrap();
    // Calling create again must not error.
    task_table::create(&pool, "public", "step_1").await.unwrap();

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn insert_and_pick_next_returns_rows_in_order() {
    let (pool, db_name) = create_test_db().await;
    task_table::create(&pool, "public", "step_2").await.unwrap();

    let id_a = task_table::insert(&pool, "public", "step_2", serde_json::json!("tile-a"))
        .await
        .unwrap();
    let id_b = task_table::insert(&pool, "public", "step_2", serde_json::json!("tile-b"))
        .await
        .unwrap();
    assert!(id_b > id_a);

    let first = task_table::pick_next_and_report(&pool, "public", "step_2")
        .await
        .unwrap();
    assert_eq!(first.next_task_id, Some(id_a));
    assert_eq!(first.next_task_data, Some(serde_json::json!("tile-a")));
    assert_eq!(first.total, 2);
    assert_eq!(first.started, 1);
    assert_eq!(first.finalized, 0);

    let second = task_table::pick_next_and_report(&pool, "public", "step_2")
        .await
        .unwrap();
    assert_eq!(second.next_task_id, Some(id_b));

    let third = task_table::pick_next_and_report(&pool, "public", "step_2")
        .await
        .unwrap();
    assert_eq!(third.next_task_id, None);
    assert_eq!(third.started, 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn concurrent_pick_next_never_double_assigns() {
    let (pool, db_name) = create_test_db().await;
    task_table::create(&pool, "public", "step_3").await.unwrap();

    for i in 0..20 {
        task_table::insert(&pool, "public", "step_3", serde_json::json!(i))
            .await
            .unwrap();
    }

    let pool = Arc::new(pool);
    let mut set = JoinSet::new();
    for _ in 0..20 {
        let pool = Arc::clone(&pool);
        set.spawn(async move {
            task_table::pick_next_and_report(&pool, "public", "step_3")
                .await
                .unwrap()
        });
    }

    let mut picked_ids = Vec::new();
    while let Some(result) = set.join_next().await {
        if let Some(id) = result.unwrap().next_task_id {
            picked_ids.push(id);
        }
    }

    picked_ids.sort_unstable();
    let mut deduped = picked_ids.clone();
    deduped.dedup();
    assert_eq!(picked_ids.len(), deduped.len(), "no task_id should be picked twice");
    assert_eq!(picked_ids.len(), 20);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn record_progress_accumulates_and_finalizes() {
    let (pool, db_name) = create_test_db().await;
    task_table::create(&pool, "public", "step_4").await.unwrap();
    let task_id = task_table::insert(&pool, "public", "step_4", serde_json::json!("t"))
        .await
        .unwrap();

    task_table::record_progress(&pool, "public", "step_4", task_id, 100, 5, 1, false)
        .await
        .unwrap();
    task_table::record_progress(&pool, "public", "step_4", task_id, 50, 2, 1, true)
        .await
        .unwrap();

    let finalized = task_table::is_finalized(&pool, "public", "step_4", task_id)
        .await
        .unwrap();
    assert_eq!(finalized, Some(true));

    let stats = task_table::aggregate(&pool, "public", "step_4").await.unwrap();
    assert_eq!(stats.bytes_uploaded, 150);
    assert_eq!(stats.rows_uploaded, 7);
    assert_eq!(stats.files_uploaded, 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn is_finalized_returns_none_for_unknown_task() {
    let (pool, db_name) = create_test_db().await;
    task_table::create(&pool, "public", "step_5").await.unwrap();

    let finalized = task_table::is_finalized(&pool, "public", "step_5", 9999)
        .await
        .unwrap();
    assert_eq!(finalized, None);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn empty_task_ids_excludes_rows_with_bytes() {
    let (pool, db_name) = create_test_db().await;
    task_table::create(&pool, "public", "step_6").await.unwrap();

    let empty_tile = task_table::insert(&pool, "public", "step_6", serde_json::json!("empty-tile"))
        .await
        .unwrap();
    let full_tile = task_table::insert(&pool, "public", "step_6", serde_json::json!("full-tile"))
        .await
        .unwrap();

    task_table::record_progress(&pool, "public", "step_6", empty_tile, 0, 0, 0, true)
        .await
        .unwrap();
    task_table::record_progress(&pool, "public", "step_6", full_tile, 1024, 10, 1, true)
        .await
        .unwrap();

    let empty = task_table::empty_task_ids(&pool, "public", "step_6").await.unwrap();
    assert_eq!(empty, vec![serde_json::json!("empty-tile")]);

    // Files contributed by the empty tile are suppressed from the aggregate.
    let stats = task_table::aggregate(&pool, "public", "step_6").await.unwrap();
    assert_eq!(stats.files_uploaded, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn aggregate_on_empty_table_is_zero() {
    let (pool, db_name) = create_test_db().await;
    task_table::create(&pool, "public", "step_7").await.unwrap();

    let stats = task_table::aggregate(&pool, "public", "step_7").await.unwrap();
    assert_eq!(stats.bytes_uploaded, 0);
    assert_eq!(stats.rows_uploaded, 0);
    assert_eq!(stats.files_uploaded, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}
