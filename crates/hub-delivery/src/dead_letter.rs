//! Terminal sink for messages that exhausted their retry schedule.

use std::sync::Arc;

use hub_core::{Clock, CoordinationStore, DeadLetterRecord, Envelope};
use tracing::warn;

use crate::error::Result;

/// Dead-letter sink of one subscribing service.
#[derive(Clone)]
pub struct DeadLetter {
    service: String,
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
}

impl DeadLetter {
    /// Creates the sink for `service`.
    pub fn new(
        service: impl Into<String>,
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { service: service.into(), store, clock }
    }

    /// Durably records `envelope` with the reason of its last failure.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the record cannot be written.
    pub async fn record(&self, envelope: Envelope, last_error: &str) -> Result<DeadLetterRecord> {
        let record =
            DeadLetterRecord::new(&self.service, envelope, last_error, self.clock.now_utc());
        self.store.record_dead_letter(record.clone()).await?;

        warn!(
            service = %self.service,
            message_id = %record.envelope.id,
            message_type = %record.envelope.message_type,
            attempts = record.attempts,
            last_error,
            "message dead-lettered"
        );
        Ok(record)
    }

    /// Most recent records, newest first.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store cannot be queried.
    pub async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        Ok(self.store.list_dead_letters(&self.service, limit).await?)
    }
}

#[cfg(test)]
mod tests {
    use hub_core::{storage::MemoryStore, TestClock};
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn records_envelope_with_attempt_count() {
        let clock = TestClock::at_millis(1_700_000_000_000);
        let sink = DeadLetter::new("billing", Arc::new(MemoryStore::new()), Arc::new(clock.clone()));
        let envelope = Envelope::new("invoice.paid", json!({"id": 1}), clock.now_utc())
            .next_attempt(clock.now_utc())
            .next_attempt(clock.now_utc());

        let record = sink.record(envelope.clone(), "HTTP 500").await.unwrap();

        assert_eq!(record.attempts, 3);
        assert_eq!(record.recorded_at, clock.now_utc());

        let listed = sink.list(10).await.unwrap();
        assert_eq!(listed, vec![record]);
        assert_eq!(listed[0].envelope, envelope);
    }
}
