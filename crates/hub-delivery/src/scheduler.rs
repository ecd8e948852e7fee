//! Retry scheduling for failed deliveries.
//!
//! The subscriber's retry schedule fully determines timing: after the
//! failure of attempt `k` the message is re-enqueued with attempt `k + 1`,
//! invisible for `schedule[k]`. Once the schedule is exhausted the message
//! goes to the dead-letter sink. There is no backoff formula and no jitter.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use hub_core::{Clock, Envelope, RetrySchedule};
use tracing::info;

use crate::{
    dead_letter::DeadLetter,
    error::{DeliveryError, Result},
    queue::{Queue, QueueMessage},
};

/// Outcome of scheduling a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueued for another attempt.
    Retry {
        /// Attempt number of the re-enqueued envelope.
        attempt: u32,
        /// Delay taken from the schedule.
        delay: Duration,
        /// When the envelope becomes visible again.
        next_attempt_at: DateTime<Utc>,
    },
    /// Schedule exhausted, handed to the dead-letter sink.
    GiveUp {
        /// Reason recorded with the dead letter.
        reason: String,
    },
}

/// Decides the fate of an envelope whose attempt just failed at `failed_at`.
pub fn decide(
    schedule: &RetrySchedule,
    envelope: &Envelope,
    error: &DeliveryError,
    failed_at: DateTime<Utc>,
) -> RetryDecision {
    let exhausted = || RetryDecision::GiveUp {
        reason: format!(
            "{}: {error}",
            DeliveryError::schedule_exhausted(envelope.attempt.saturating_add(1))
        ),
    };

    if !error.is_retryable() {
        return RetryDecision::GiveUp { reason: format!("non-retryable error: {error}") };
    }

    let Some(delay) = schedule.delay_after(envelope.attempt) else {
        return exhausted();
    };
    let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
        return exhausted();
    };

    RetryDecision::Retry {
        attempt: envelope.attempt.saturating_add(1),
        delay,
        next_attempt_at: failed_at + chrono_delay,
    }
}

/// Applies retry decisions to one subscriber's inbound queue.
#[derive(Clone)]
pub struct Scheduler {
    service: String,
    queue: Queue,
    schedule: RetrySchedule,
    dead_letter: DeadLetter,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    /// Creates the scheduler of `service`.
    pub fn new(
        service: impl Into<String>,
        queue: Queue,
        schedule: RetrySchedule,
        dead_letter: DeadLetter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { service: service.into(), queue, schedule, dead_letter, clock }
    }

    /// Re-enqueues or dead-letters a failed message, then acks it.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the re-enqueue, the dead-letter write or
    /// the ack fails. Without an ack the message is redelivered after its
    /// lease with the same attempt number.
    pub async fn handle_failure(
        &self,
        message: QueueMessage,
        error: &DeliveryError,
    ) -> Result<RetryDecision> {
        let decision = decide(&self.schedule, &message.envelope, error, self.clock.now_utc());

        match &decision {
            RetryDecision::Retry { attempt, delay, next_attempt_at } => {
                let retry = message.envelope.next_attempt(*next_attempt_at);
                self.queue.push(&retry).await?;
                info!(
                    service = %self.service,
                    message_id = %retry.id,
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "delivery failed, retry scheduled"
                );
            },
            RetryDecision::GiveUp { reason } => {
                self.dead_letter.record(message.envelope.clone(), reason).await?;
            },
        }

        self.queue.ack(message).await?;
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn envelope_at_attempt(attempt: u32) -> Envelope {
        let mut envelope = Envelope::new("t", json!(null), Utc::now());
        envelope.attempt = attempt;
        envelope
    }

    #[test]
    fn schedule_index_follows_attempt() {
        let schedule = RetrySchedule::from_millis(&[100, 500, 2000]);
        let failed_at = Utc::now();
        let error = DeliveryError::http_status(500, "");

        for (attempt, delay_ms) in [(0, 100), (1, 500), (2, 2000)] {
            let decision = decide(&schedule, &envelope_at_attempt(attempt), &error, failed_at);
            assert_eq!(
                decision,
                RetryDecision::Retry {
                    attempt: attempt + 1,
                    delay: Duration::from_millis(delay_ms),
                    next_attempt_at: failed_at + chrono::Duration::milliseconds(delay_ms as i64),
                }
            );
        }

        let decision = decide(&schedule, &envelope_at_attempt(3), &error, failed_at);
        assert!(matches!(decision, RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn empty_schedule_gives_up_immediately() {
        let decision = decide(
            &RetrySchedule::none(),
            &envelope_at_attempt(0),
            &DeliveryError::timeout(30),
            Utc::now(),
        );

        let RetryDecision::GiveUp { reason } = decision else {
            panic!("expected give up");
        };
        assert!(reason.contains("after 1 attempts"));
    }

    #[test]
    fn non_retryable_errors_give_up() {
        let decision = decide(
            &RetrySchedule::from_millis(&[100]),
            &envelope_at_attempt(0),
            &DeliveryError::configuration("bad endpoint"),
            Utc::now(),
        );
        assert!(matches!(decision, RetryDecision::GiveUp { .. }));
    }
}
