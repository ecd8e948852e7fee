//! In-process coordination store.
//!
//! Keeps queues, sorted sets and dead letters in memory behind tokio locks.
//! Cloning the store shares its state, which lets several hub instances in
//! one test behave like processes attached to the same backend. Failures can
//! be injected to exercise the error paths of the loops built on top.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::sync::RwLock;

use super::{CoordinationStore, DeadLetterRecord, ItemId, QueueItem, StoreFuture};
use crate::{
    error::{CoreError, Result},
    models::Envelope,
};

#[derive(Debug, Clone)]
struct StoredItem {
    id: ItemId,
    seq: u64,
    envelope: Envelope,
    visible_at_ms: i64,
}

/// Memory-backed [`CoordinationStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    sorted_sets: Arc<RwLock<HashMap<String, HashMap<String, i64>>>>,
    queues: Arc<RwLock<HashMap<String, Vec<StoredItem>>>>,
    dead_letters: Arc<RwLock<Vec<DeadLetterRecord>>>,
    unavailable: Arc<RwLock<Option<String>>>,
    next_seq: Arc<AtomicU64>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail with
    /// [`CoreError::StoreUnavailable`] until [`MemoryStore::restore`] is
    /// called.
    pub async fn inject_unavailable(&self, reason: impl Into<String>) {
        *self.unavailable.write().await = Some(reason.into());
    }

    /// Clears an injected outage.
    pub async fn restore(&self) {
        *self.unavailable.write().await = None;
    }

    /// Members and scores of a sorted set, for verification.
    pub async fn members(&self, set: &str) -> HashMap<String, i64> {
        self.sorted_sets.read().await.get(set).cloned().unwrap_or_default()
    }

    /// Envelopes currently stored in `queue`, in enqueue order.
    pub async fn queued_envelopes(&self, queue: &str) -> Vec<Envelope> {
        let queues = self.queues.read().await;
        let mut items: Vec<_> = queues.get(queue).cloned().unwrap_or_default();
        items.sort_by_key(|item| item.seq);
        items.into_iter().map(|item| item.envelope).collect()
    }

    async fn ensure_available(&self) -> Result<()> {
        match self.unavailable.read().await.as_ref() {
            Some(reason) => Err(CoreError::StoreUnavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

impl CoordinationStore for MemoryStore {
    fn upsert_member(&self, set: &str, member: &str, score: i64) -> StoreFuture<'_, ()> {
        let set = set.to_string();
        let member = member.to_string();
        Box::pin(async move {
            self.ensure_available().await?;
            self.sorted_sets.write().await.entry(set).or_default().insert(member, score);
            Ok(())
        })
    }

    fn range_by_score(&self, set: &str, min: i64, max: i64) -> StoreFuture<'_, Vec<String>> {
        let set = set.to_string();
        Box::pin(async move {
            self.ensure_available().await?;
            let sets = self.sorted_sets.read().await;
            let mut members: Vec<(i64, String)> = sets
                .get(&set)
                .map(|members| {
                    members
                        .iter()
                        .filter(|(_, score)| (min..=max).contains(*score))
                        .map(|(member, score)| (*score, member.clone()))
                        .collect()
                })
                .unwrap_or_default();
            members.sort();
            Ok(members.into_iter().map(|(_, member)| member).collect())
        })
    }

    fn push_item(
        &self,
        queue: &str,
        envelope: &Envelope,
        visible_at_ms: i64,
    ) -> StoreFuture<'_, ItemId> {
        let queue = queue.to_string();
        let envelope = envelope.clone();
        Box::pin(async move {
            self.ensure_available().await?;
            let id = ItemId::new();
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            self.queues.write().await.entry(queue).or_default().push(StoredItem {
                id,
                seq,
                envelope,
                visible_at_ms,
            });
            Ok(id)
        })
    }

    fn claim_item(
        &self,
        queue: &str,
        now_ms: i64,
        lease_until_ms: i64,
    ) -> StoreFuture<'_, Option<QueueItem>> {
        let queue = queue.to_string();
        Box::pin(async move {
            self.ensure_available().await?;
            let mut queues = self.queues.write().await;
            let Some(items) = queues.get_mut(&queue) else {
                return Ok(None);
            };

            let claimed = items
                .iter_mut()
                .filter(|item| item.visible_at_ms <= now_ms)
                .min_by_key(|item| (item.visible_at_ms, item.seq));

            Ok(claimed.map(|item| {
                item.visible_at_ms = lease_until_ms;
                QueueItem {
                    id: item.id,
                    envelope: item.envelope.clone(),
                    visible_at_ms: lease_until_ms,
                }
            }))
        })
    }

    fn ack_item(&self, queue: &str, id: ItemId) -> StoreFuture<'_, bool> {
        let queue = queue.to_string();
        Box::pin(async move {
            self.ensure_available().await?;
            let mut queues = self.queues.write().await;
            let Some(items) = queues.get_mut(&queue) else {
                return Ok(false);
            };
            let before = items.len();
            items.retain(|item| item.id != id);
            Ok(items.len() < before)
        })
    }

    fn purge(&self, queue: &str) -> StoreFuture<'_, u64> {
        let queue = queue.to_string();
        Box::pin(async move {
            self.ensure_available().await?;
            let removed = self.queues.write().await.remove(&queue).map_or(0, |items| items.len());
            Ok(u64::try_from(removed).unwrap_or(u64::MAX))
        })
    }

    fn count_items(&self, queue: &str) -> StoreFuture<'_, u64> {
        let queue = queue.to_string();
        Box::pin(async move {
            self.ensure_available().await?;
            let count = self.queues.read().await.get(&queue).map_or(0, Vec::len);
            Ok(u64::try_from(count).unwrap_or(u64::MAX))
        })
    }

    fn record_dead_letter(&self, record: DeadLetterRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_available().await?;
            self.dead_letters.write().await.push(record);
            Ok(())
        })
    }

    fn list_dead_letters(
        &self,
        service: &str,
        limit: usize,
    ) -> StoreFuture<'_, Vec<DeadLetterRecord>> {
        let service = service.to_string();
        Box::pin(async move {
            self.ensure_available().await?;
            let records = self.dead_letters.read().await;
            Ok(records
                .iter()
                .rev()
                .filter(|record| record.service == service)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn health_check(&self) -> StoreFuture<'_, ()> {
        Box::pin(self.ensure_available())
    }
}
