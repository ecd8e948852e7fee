//! Durable named queues with a live concurrency limit.
//!
//! Items live in the coordination store; the admission limit lives in the
//! process. `pop` first reserves one of the limit's slots and only then
//! claims an item. A waiting pop re-checks its reservation before every
//! claim and gives it back when the limit dropped below the slots in use, so
//! a lowered limit (including zero) admits nothing new. The slot travels
//! with the popped [`QueueMessage`] and is returned when the message is
//! dropped, which also covers panicking handlers.
//!
//! Changing the limit wakes waiting consumers immediately. Lowering it never
//! affects messages already popped.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use hub_core::{time::duration_to_millis, Clock, CoordinationStore, Envelope, ItemId};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;

/// Name of the queue publishers write to.
pub const OUTBOUND_QUEUE: &str = "hub:outbound";

/// Name of a subscribing service's inbound queue.
pub fn inbound_queue_name(service: &str) -> String {
    format!("hub:in:{service}")
}

/// Converts a fractional share into whole admission slots.
///
/// Positive shares floor to at least one slot; zero, negative and NaN
/// shares admit nothing.
pub fn effective_limit(share: f64) -> usize {
    if share.is_nan() || share <= 0.0 {
        return 0;
    }
    // float to int `as` casts saturate
    (share.floor() as usize).max(1)
}

/// Timing knobs of a queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// How long a popped item stays invisible before it is redelivered.
    pub visibility_timeout: Duration,
    /// Delay between store polls while the queue is empty.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { visibility_timeout: Duration::from_secs(60), poll_interval: Duration::from_millis(100) }
    }
}

#[derive(Debug, Default)]
struct Slots {
    limit: usize,
    claimed: usize,
    reserved: usize,
}

impl Slots {
    fn occupied(&self) -> usize {
        self.claimed + self.reserved
    }
}

#[derive(Debug, Default)]
struct Admission {
    slots: Mutex<Slots>,
    changed: Notify,
}

impl Admission {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission slot held by a waiting pop or a popped message.
pub struct SlotPermit {
    admission: Arc<Admission>,
    claimed: bool,
}

impl SlotPermit {
    /// Whether the slots in use still fit the current limit.
    fn within_limit(&self) -> bool {
        let slots = self.admission.lock();
        slots.occupied() <= slots.limit
    }

    fn mark_claimed(&mut self) {
        let mut slots = self.admission.lock();
        slots.reserved = slots.reserved.saturating_sub(1);
        slots.claimed += 1;
        self.claimed = true;
    }
}

impl fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPermit").finish_non_exhaustive()
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        {
            let mut slots = self.admission.lock();
            if self.claimed {
                slots.claimed = slots.claimed.saturating_sub(1);
            } else {
                slots.reserved = slots.reserved.saturating_sub(1);
            }
        }
        self.admission.changed.notify_waiters();
    }
}

/// A message popped from a queue, awaiting acknowledgement.
#[derive(Debug)]
pub struct QueueMessage {
    /// Receipt of the stored item.
    pub receipt: ItemId,
    /// The popped envelope.
    pub envelope: Envelope,
    permit: SlotPermit,
}

/// A named queue in the coordination store.
#[derive(Clone)]
pub struct Queue {
    name: Arc<str>,
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    admission: Arc<Admission>,
    config: QueueConfig,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("limit", &self.limit())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl Queue {
    /// Opens the queue `name` admitting at most `limit` messages at once.
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        limit: usize,
        config: QueueConfig,
    ) -> Self {
        let name: String = name.into();
        let admission = Arc::new(Admission::default());
        admission.lock().limit = limit;
        Self { name: Arc::from(name), store, clock, admission, config }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends an envelope; it becomes visible at its `not_before`.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store rejects the write.
    pub async fn push(&self, envelope: &Envelope) -> Result<ItemId> {
        let visible_at = envelope.not_before.timestamp_millis();
        let id = self.store.push_item(&self.name, envelope, visible_at).await?;
        debug!(
            queue = %self.name,
            message_id = %envelope.id,
            attempt = envelope.attempt,
            "pushed message"
        );
        Ok(id)
    }

    /// Waits for a free slot and an eligible message.
    ///
    /// Returns `Ok(None)` once `cancellation_token` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if claiming fails. The slot is released.
    pub async fn pop(&self, cancellation_token: &CancellationToken) -> Result<Option<QueueMessage>> {
        'admission: loop {
            let mut permit = tokio::select! {
                permit = self.acquire_slot() => permit,
                () = cancellation_token.cancelled() => return Ok(None),
            };

            loop {
                let changed = self.admission.changed.notified();
                tokio::pin!(changed);
                changed.as_mut().enable();

                if !permit.within_limit() {
                    debug!(
                        queue = %self.name,
                        limit = self.limit(),
                        "limit lowered, waiting pop yields its slot"
                    );
                    drop(permit);
                    continue 'admission;
                }

                let now = self.clock.now_millis();
                let lease_until =
                    now.saturating_add(duration_to_millis(self.config.visibility_timeout));

                if let Some(item) = self.store.claim_item(&self.name, now, lease_until).await? {
                    permit.mark_claimed();
                    return Ok(Some(QueueMessage {
                        receipt: item.id,
                        envelope: item.envelope,
                        permit,
                    }));
                }

                tokio::select! {
                    () = self.clock.sleep(self.config.poll_interval) => {},
                    () = &mut changed => {},
                    () = cancellation_token.cancelled() => return Ok(None),
                }
            }
        }
    }

    /// Deletes a popped message and frees its slot.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store rejects the delete; the item
    /// is then redelivered after its lease.
    pub async fn ack(&self, message: QueueMessage) -> Result<()> {
        let QueueMessage { receipt, envelope, permit } = message;
        let removed = self.store.ack_item(&self.name, receipt).await?;
        if !removed {
            debug!(
                queue = %self.name,
                message_id = %envelope.id,
                "acked item was already gone, lease had lapsed"
            );
        }
        drop(permit);
        Ok(())
    }

    /// Updates the admission limit from a possibly fractional share.
    ///
    /// Returns the effective number of slots.
    pub fn set_concurrency(&self, share: f64) -> usize {
        let limit = effective_limit(share);
        let previous = std::mem::replace(&mut self.admission.lock().limit, limit);
        self.admission.changed.notify_waiters();
        if previous != limit {
            debug!(queue = %self.name, share, limit, previous, "queue concurrency changed");
        }
        limit
    }

    /// Current admission limit.
    pub fn limit(&self) -> usize {
        self.admission.lock().limit
    }

    /// Messages claimed by this process and not yet acked or dropped.
    ///
    /// Slots reserved by pops still waiting for an item are not counted.
    pub fn in_flight(&self) -> usize {
        self.admission.lock().claimed
    }

    /// Items stored in the queue, visible or leased, across all processes.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store cannot be queried.
    pub async fn len(&self) -> Result<u64> {
        Ok(self.store.count_items(&self.name).await?)
    }

    /// Whether the queue holds no items.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store cannot be queried.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Drops every stored item.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store rejects the delete.
    pub async fn purge(&self) -> Result<u64> {
        Ok(self.store.purge(&self.name).await?)
    }

    async fn acquire_slot(&self) -> SlotPermit {
        loop {
            let notified = self.admission.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut slots = self.admission.lock();
                if slots.occupied() < slots.limit {
                    slots.reserved += 1;
                    return SlotPermit { admission: self.admission.clone(), claimed: false };
                }
            }

            notified.await;
        }
    }
}
