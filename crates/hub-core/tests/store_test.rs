//! Behavioural tests for the coordination store backends.
//!
//! The memory backend is always exercised. The PostgreSQL backend runs the
//! same checks when `DATABASE_URL` points at a reachable database and is
//! skipped otherwise.

use std::collections::HashSet;

use anyhow::Result;
use chrono::Utc;
use hub_core::{
    storage::{MemoryStore, PostgresStore},
    CoordinationStore, DeadLetterRecord, Envelope,
};
use proptest::prelude::*;
use serde_json::json;

fn envelope(n: u64) -> Envelope {
    Envelope::new("order.created", json!({ "n": n }), Utc::now())
}

async fn exercise_queue_semantics(store: &dyn CoordinationStore, queue: &str) -> Result<()> {
    store.purge(queue).await?;

    let first = store.push_item(queue, &envelope(1), 0).await?;
    let second = store.push_item(queue, &envelope(2), 0).await?;
    let later = store.push_item(queue, &envelope(3), 10_000).await?;
    assert_eq!(store.count_items(queue).await?, 3);

    let a = store.claim_item(queue, 1_000, 2_000).await?.expect("first item visible");
    let b = store.claim_item(queue, 1_000, 2_000).await?.expect("second item visible");
    assert_eq!(a.id, first);
    assert_eq!(b.id, second);
    assert!(store.claim_item(queue, 1_000, 2_000).await?.is_none());

    // lease of `a` lapses, `b` is acked
    assert!(store.ack_item(queue, b.id).await?);
    let redelivered = store.claim_item(queue, 2_000, 3_000).await?.expect("lease lapsed");
    assert_eq!(redelivered.id, first);
    assert_eq!(redelivered.envelope.id, a.envelope.id);

    let delayed = store.claim_item(queue, 10_000, 11_000).await?.expect("delayed item visible");
    assert_eq!(delayed.id, later);

    assert_eq!(store.purge(queue).await?, 2);
    assert_eq!(store.count_items(queue).await?, 0);
    Ok(())
}

async fn exercise_sorted_sets(store: &dyn CoordinationStore, set: &str) -> Result<()> {
    store.upsert_member(set, "p1", 1_000).await?;
    store.upsert_member(set, "p2", 1_500).await?;
    store.upsert_member(set, "p1", 2_000).await?;

    let members = store.range_by_score(set, 1_500, 2_000).await?;
    assert_eq!(members, vec!["p2".to_string(), "p1".to_string()]);

    let stale = store.range_by_score(set, 0, 1_000).await?;
    assert!(stale.is_empty());
    Ok(())
}

#[tokio::test]
async fn memory_store_queue_semantics() -> Result<()> {
    exercise_queue_semantics(&MemoryStore::new(), "hub:test").await
}

#[tokio::test]
async fn memory_store_sorted_sets() -> Result<()> {
    exercise_sorted_sets(&MemoryStore::new(), "hub_test_alive").await
}

#[tokio::test]
async fn concurrent_claims_never_share_an_item() -> Result<()> {
    let store = MemoryStore::new();
    for n in 0..50 {
        store.push_item("hub:race", &envelope(n), 0).await?;
    }

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(item) = store.claim_item("hub:race", 1, 60_000).await? {
                claimed.push(item.id);
            }
            Ok::<_, hub_core::CoreError>(claimed)
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for id in task.await?? {
            assert!(seen.insert(id), "item {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 50);
    Ok(())
}

#[tokio::test]
async fn postgres_store_matches_memory_semantics() -> Result<()> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping PostgreSQL store test");
        return Ok(());
    };

    let pool = sqlx::PgPool::connect(&url).await?;
    let store = PostgresStore::new(pool);
    store.migrate().await?;
    store.health_check().await?;

    let suffix = uuid::Uuid::new_v4().simple().to_string();
    exercise_queue_semantics(&store, &format!("hub:test:{suffix}")).await?;
    exercise_sorted_sets(&store, &format!("hub_{suffix}_alive")).await?;

    let service = format!("svc-{suffix}");
    store
        .record_dead_letter(DeadLetterRecord::new(&service, envelope(9), "HTTP 500", Utc::now()))
        .await?;
    let records = store.list_dead_letters(&service, 10).await?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].last_error, "HTTP 500");
    Ok(())
}

proptest! {
    /// Whatever mix of pushes, claims and acks happens, every pushed item is
    /// either acked or still stored.
    #[test]
    fn items_are_never_lost(ops in prop::collection::vec(0u8..3, 1..60)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let store = MemoryStore::new();
            let mut pushed = 0u64;
            let mut acked = 0u64;
            let mut claimed = Vec::new();
            let mut now = 0i64;

            for op in ops {
                now += 10;
                match op {
                    0 => {
                        store.push_item("q", &envelope(pushed), now).await.unwrap();
                        pushed += 1;
                    },
                    1 => {
                        if let Some(item) = store.claim_item("q", now, now + 25).await.unwrap() {
                            claimed.push(item.id);
                        }
                    },
                    _ => {
                        if let Some(id) = claimed.pop() {
                            if store.ack_item("q", id).await.unwrap() {
                                acked += 1;
                            }
                        }
                    },
                }
            }

            prop_assert_eq!(store.count_items("q").await.unwrap(), pushed - acked);
            Ok(())
        })?;
    }
}
