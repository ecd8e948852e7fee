//! Coordination store shared by all hub processes.
//!
//! One store backs three concerns: durable queues with lease-based claiming,
//! sorted sets used as liveness ledgers, and the dead-letter sink. Every hub
//! process talks to the same store; no other coordination channel exists.
//!
//! Two backends are provided. [`MemoryStore`] keeps everything in process
//! and is meant for tests and single-process development. [`PostgresStore`]
//! is the shared production backend.

use std::{fmt, future::Future, pin::Pin};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::Result, models::Envelope};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Receipt identifying one stored queue item.
///
/// Distinct from the envelope's message id: fan-out copies and retries of a
/// message share a message id but each occupy their own item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId(pub Uuid);

impl ItemId {
    /// Creates a new random item ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An envelope claimed from a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    /// Receipt used to acknowledge the item.
    pub id: ItemId,
    /// The stored envelope.
    pub envelope: Envelope,
    /// Lease expiry in epoch milliseconds; unacked items reappear after it.
    pub visible_at_ms: i64,
}

/// A message that exhausted its retry schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Record identifier.
    pub id: Uuid,
    /// Subscribing service the delivery was meant for.
    pub service: String,
    /// Envelope as of the final failed attempt.
    pub envelope: Envelope,
    /// Failure reason of the final attempt.
    pub last_error: String,
    /// Total delivery attempts made.
    pub attempts: u32,
    /// When the record was written.
    pub recorded_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Creates a record for `envelope` failing with `last_error`.
    pub fn new(
        service: impl Into<String>,
        envelope: Envelope,
        last_error: impl Into<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        let attempts = envelope.attempt.saturating_add(1);
        Self {
            id: Uuid::new_v4(),
            service: service.into(),
            envelope,
            last_error: last_error.into(),
            attempts,
            recorded_at,
        }
    }
}

/// Operations the hub needs from its coordination store.
///
/// All times are epoch milliseconds supplied by the caller's clock, so the
/// store itself never consults a clock.
pub trait CoordinationStore: Send + Sync + 'static {
    /// Inserts `member` into sorted set `set` or updates its score.
    ///
    /// A member appears at most once per set.
    fn upsert_member(&self, set: &str, member: &str, score: i64) -> StoreFuture<'_, ()>;

    /// Returns the members of `set` whose score lies in `[min, max]`.
    fn range_by_score(&self, set: &str, min: i64, max: i64) -> StoreFuture<'_, Vec<String>>;

    /// Appends an envelope to `queue`, invisible until `visible_at_ms`.
    fn push_item(
        &self,
        queue: &str,
        envelope: &Envelope,
        visible_at_ms: i64,
    ) -> StoreFuture<'_, ItemId>;

    /// Claims the oldest item of `queue` visible at `now_ms`.
    ///
    /// The claimed item stays stored but becomes invisible until
    /// `lease_until_ms`. Concurrent claimers never receive the same item
    /// within one lease.
    fn claim_item(
        &self,
        queue: &str,
        now_ms: i64,
        lease_until_ms: i64,
    ) -> StoreFuture<'_, Option<QueueItem>>;

    /// Deletes a claimed item. Returns `false` if it was already gone.
    fn ack_item(&self, queue: &str, id: ItemId) -> StoreFuture<'_, bool>;

    /// Deletes every item of `queue`, returning how many were removed.
    fn purge(&self, queue: &str) -> StoreFuture<'_, u64>;

    /// Number of items stored in `queue`, visible or leased.
    fn count_items(&self, queue: &str) -> StoreFuture<'_, u64>;

    /// Durably stores a dead-letter record.
    fn record_dead_letter(&self, record: DeadLetterRecord) -> StoreFuture<'_, ()>;

    /// Most recent dead letters of `service`, newest first.
    fn list_dead_letters(&self, service: &str, limit: usize)
        -> StoreFuture<'_, Vec<DeadLetterRecord>>;

    /// Verifies the store is reachable.
    fn health_check(&self) -> StoreFuture<'_, ()>;
}
