//! End-to-end scenarios against a real `SqliteStore`, matching the six
//! concrete scenarios plus the producer-refill and restart-recovery
//! scenarios from `spec.md` §8.

use std::sync::Arc;
use std::time::Duration;

use labelqueue::dispatcher::{Dispatcher, DispatcherConfig};
use labelqueue::item::LabelValue;
use labelqueue::store::{Query, SqliteStore, StoreAdapter};
use serde_json::json;

const INDEX: &str = "annotations";
const DOC_TYPE: &str = "annotation";

fn temp_db_path() -> std::path::PathBuf {
    let path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
    path.keep().unwrap()
}

async fn seed_item(store: &dyn StoreAdapter, id: &str, task: &str, doc_id: &str) {
    store
        .put(
            INDEX,
            DOC_TYPE,
            id,
            json!({
                "name": task,
                "created": "2026-01-01T00:00:00Z",
                "docId": doc_id,
                "doc": { "text": doc_id },
                "numValidAnnotations": 0,
                "annotations": [],
            }),
        )
        .await
        .unwrap();
}

fn config(task: &str, n: u32, queue: usize) -> DispatcherConfig {
    DispatcherConfig {
        name: format!("test[{task}]"),
        index: INDEX.to_string(),
        annotation_type: DOC_TYPE.to_string(),
        task_name: task.to_string(),
        num_annotations_per_item: n,
        num_unannotated_items: queue,
    }
}

/// Scenario 1: fresh task, N=2, two annotators (A, B).
#[tokio::test]
async fn scenario_fresh_task_two_annotators_complete_one_item() {
    let store: Arc<dyn StoreAdapter> = Arc::new(SqliteStore::new(temp_db_path()));
    seed_item(store.as_ref(), "item-x", "task-1", "doc-x").await;

    let dispatcher = Dispatcher::new(config("task-1", 2, 10), store.clone()).start().await;

    let a_item = dispatcher.get_item("A").await.expect("A gets an item");
    assert_eq!(a_item.id, "item-x");

    let b_item = dispatcher.get_item("B").await.expect("B gets an item");
    assert_eq!(b_item.id, "item-x");

    let after_a = dispatcher
        .annotate("A", "item-x", LabelValue::Yes)
        .await
        .unwrap();
    // A has no further work until B completes the item (N=2, both slots
    // were already handed out).
    assert!(after_a.is_none() || after_a.as_ref().unwrap().id != "item-x");

    let after_b = dispatcher
        .annotate("B", "item-x", LabelValue::No)
        .await
        .unwrap();
    assert!(after_b.is_none());

    let persisted = store.get(INDEX, DOC_TYPE, "item-x").await.unwrap();
    assert_eq!(persisted["numValidAnnotations"], json!(2));
    assert_eq!(persisted["annotations"].as_array().unwrap().len(), 2);

    dispatcher.stop().await;
}

/// Scenario 2: skip returns an item to the pool for other annotators, but
/// never the annotator who skipped it.
#[tokio::test]
async fn scenario_skip_returns_item_to_pool_excluding_skipper() {
    let store: Arc<dyn StoreAdapter> = Arc::new(SqliteStore::new(temp_db_path()));
    seed_item(store.as_ref(), "item-x", "task-2", "doc-x").await;

    let dispatcher = Dispatcher::new(config("task-2", 2, 10), store.clone()).start().await;

    let a_item = dispatcher.get_item("A").await.unwrap();
    assert_eq!(a_item.id, "item-x");
    dispatcher.skip("A", "item-x").await.unwrap();

    let b_item = dispatcher.get_item("B").await.unwrap();
    assert_eq!(b_item.id, "item-x");
    dispatcher.annotate("B", "item-x", LabelValue::Yes).await.unwrap();

    let c_item = dispatcher.get_item("C").await.unwrap();
    assert_eq!(c_item.id, "item-x");
    dispatcher.annotate("C", "item-x", LabelValue::No).await.unwrap();

    let persisted = store.get(INDEX, DOC_TYPE, "item-x").await.unwrap();
    assert_eq!(persisted["numValidAnnotations"], json!(2));
    let annotations = persisted["annotations"].as_array().unwrap();
    assert_eq!(annotations.len(), 3); // A's skip + B's yes + C's no
    assert!(annotations
        .iter()
        .any(|a| a["annotatorId"] == json!("A") && a["annotation"] == json!("skip")));

    dispatcher.stop().await;
}

/// Scenario 3: invalidate short-circuits the item for every annotator,
/// purging outstanding partial slots.
#[tokio::test]
async fn scenario_invalidate_short_circuits_item() {
    let store: Arc<dyn StoreAdapter> = Arc::new(SqliteStore::new(temp_db_path()));
    seed_item(store.as_ref(), "item-x", "task-3", "doc-x").await;

    let dispatcher = Dispatcher::new(config("task-3", 2, 10), store.clone()).start().await;

    let a_item = dispatcher.get_item("A").await.unwrap();
    assert_eq!(a_item.id, "item-x");
    dispatcher
        .invalidate("A", "item-x", "deleted upstream".to_string())
        .await
        .unwrap();

    let persisted = store.get(INDEX, DOC_TYPE, "item-x").await.unwrap();
    assert_eq!(persisted["invalid"]["cause"], json!("deleted upstream"));
    assert_eq!(persisted["numValidAnnotations"], json!(0));

    // B must never see item-x: it was the only item in the task, and its
    // partial slot was purged on invalidation.
    let b_item = dispatcher.get_item("B").await;
    assert!(b_item.is_none());

    dispatcher.stop().await;
}

/// Scenario 4: producer refill at the low-water mark, then exhaustion.
#[tokio::test]
async fn scenario_producer_refills_then_reports_exhaustion() {
    let store: Arc<dyn StoreAdapter> = Arc::new(SqliteStore::new(temp_db_path()));
    for i in 0..25 {
        seed_item(store.as_ref(), &format!("item-{i:02}"), "task-4", &format!("doc-{i:02}")).await;
    }

    // numUnannotatedItems=10 -> low-water=5.
    let dispatcher = Dispatcher::new(config("task-4", 1, 10), store.clone()).start().await;

    let mut seen = std::collections::HashSet::new();
    for n in 0..25 {
        let annotator = format!("ann-{n}");
        let item = dispatcher.get_item(&annotator).await.expect("item available");
        assert!(seen.insert(item.id.clone()), "no item handed out twice");
        dispatcher
            .annotate(&annotator, &item.id, LabelValue::Yes)
            .await
            .unwrap();
    }

    assert_eq!(seen.len(), 25);

    // Everything has been served and completed (N=1): the next request must
    // observe exhaustion.
    let exhausted = dispatcher.get_item("late-comer").await;
    assert!(exhausted.is_none());

    dispatcher.stop().await;
}

/// Scenario 5: a tampered/stale request names an item the annotator does
/// not hold. The dispatcher releases the real hold and serves a fresh item,
/// writing nothing to the wrong item.
#[tokio::test]
async fn scenario_holding_inconsistency_releases_stale_hold() {
    let store: Arc<dyn StoreAdapter> = Arc::new(SqliteStore::new(temp_db_path()));
    seed_item(store.as_ref(), "item-x", "task-5", "doc-x").await;
    seed_item(store.as_ref(), "item-y", "task-5", "doc-y").await;

    let dispatcher = Dispatcher::new(config("task-5", 2, 10), store.clone()).start().await;

    let a_item = dispatcher.get_item("A").await.unwrap();
    assert_eq!(a_item.id, "item-x");

    // A's front-end posts annotate(item-y, yes) despite holding item-x.
    let result = dispatcher.annotate("A", "item-y", LabelValue::Yes).await.unwrap();

    let persisted_y = store.get(INDEX, DOC_TYPE, "item-y").await.unwrap();
    assert_eq!(persisted_y["numValidAnnotations"], json!(0));
    assert!(persisted_y["annotations"].as_array().unwrap().is_empty());

    // A gets a fresh item back (item-x, since it was released to partial,
    // or item-y's unannotated slot — either is a valid "fresh item").
    assert!(result.is_some());

    dispatcher.stop().await;
}

/// Scenario 6: process restart loses in-memory holds, but `fillPartial`
/// and `fillUnannotated` recover correctly for an item that was held but
/// never labeled.
#[tokio::test]
async fn scenario_restart_recovers_unlabeled_held_item() {
    let store: Arc<dyn StoreAdapter> = Arc::new(SqliteStore::new(temp_db_path()));
    seed_item(store.as_ref(), "item-x", "task-6", "doc-x").await;

    {
        let dispatcher = Dispatcher::new(config("task-6", 2, 10), store.clone()).start().await;
        let a_item = dispatcher.get_item("A").await.unwrap();
        assert_eq!(a_item.id, "item-x");
        // Process "crashes" here: no annotate call, no persistence, in-memory
        // state (including A's hold) is simply dropped.
        dispatcher.stop().await;
    }

    let dispatcher2 = Dispatcher::new(config("task-6", 2, 10), store.clone()).start().await;
    let a_item_again = dispatcher2.get_item("A").await;
    assert!(a_item_again.is_some());
    assert_eq!(a_item_again.unwrap().id, "item-x");

    dispatcher2.stop().await;
}

/// Idempotence: two consecutive `getItem(a)` calls with no intervening
/// mutation return the same item.
#[tokio::test]
async fn get_item_is_idempotent_for_the_same_annotator() {
    let store: Arc<dyn StoreAdapter> = Arc::new(SqliteStore::new(temp_db_path()));
    seed_item(store.as_ref(), "item-x", "task-7", "doc-x").await;

    let dispatcher = Dispatcher::new(config("task-7", 2, 10), store.clone()).start().await;

    let first = dispatcher.get_item("A").await.unwrap();
    let second = dispatcher.get_item("A").await.unwrap();
    assert_eq!(first.id, second.id);

    dispatcher.stop().await;
}

/// Completion: K items, M annotators with M >= N, a fair scheduling
/// sequence labels every item exactly N times and never more.
#[tokio::test]
async fn completion_labels_every_item_exactly_n_times() {
    let store: Arc<dyn StoreAdapter> = Arc::new(SqliteStore::new(temp_db_path()));
    const K: usize = 12;
    const N: u32 = 3;
    const M: usize = 5;

    for i in 0..K {
        seed_item(store.as_ref(), &format!("item-{i:02}"), "task-8", &format!("doc-{i:02}")).await;
    }

    let dispatcher = Dispatcher::new(config("task-8", N, 20), store.clone()).start().await;

    let mut handles = Vec::new();
    for n in 0..M {
        let dispatcher = Arc::clone(&dispatcher);
        handles.push(tokio::spawn(async move {
            let annotator = format!("ann-{n}");
            let mut labeled = 0u32;
            let mut current = dispatcher.get_item(&annotator).await;
            while let Some(item) = current {
                current = dispatcher
                    .annotate(&annotator, &item.id, LabelValue::Yes)
                    .await
                    .unwrap();
                labeled += 1;
            }
            labeled
        }));
    }

    let mut total = 0u32;
    for h in handles {
        total += h.await.unwrap();
    }
    assert_eq!(total, K as u32 * N);

    let records = store
        .scan(INDEX, DOC_TYPE, &Query::term("name", "task-8"))
        .await
        .unwrap();
    assert_eq!(records.len(), K);
    for (_, record) in records {
        assert_eq!(record["numValidAnnotations"], json!(N));
        assert_eq!(record["annotations"].as_array().unwrap().len(), N as usize);
    }

    dispatcher.stop().await;
}

/// Boundary: `stop()` during a blocked `getItem` makes it return `None`.
#[tokio::test]
async fn stop_wakes_a_blocked_get_item_with_none() {
    let store: Arc<dyn StoreAdapter> = Arc::new(SqliteStore::new(temp_db_path()));
    // No items seeded at all: unannotated starts (and stays) empty, so the
    // producer signals exhaustion almost immediately and `running` becomes
    // false on its own — but we also exercise the explicit `stop()` path in
    // case the race lands before the producer's first pass.
    let dispatcher = Dispatcher::new(config("task-9", 1, 10), store).start().await;

    let waiter = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.get_item("A").await })
    };

    dispatcher.stop().await;

    let result = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("get_item should return promptly after stop")
        .unwrap();
    assert!(result.is_none());
}
