//! Delivery of inbound messages to one subscriber.
//!
//! Performs the outbound call, classifies the outcome and either acks the
//! message (2xx) or passes it to the [`Scheduler`]. Delivery never decides
//! retry timing itself.

use std::{future::Future, pin::Pin, sync::Arc};

use tracing::{debug, error};
use url::Url;

use crate::{
    client::{DeliveryClient, DeliveryRequest},
    error::{ErrorCategory, Result},
    queue::{Queue, QueueMessage},
    scheduler::{RetryDecision, Scheduler},
    worker::MessageHandler,
};

/// Outcome of handling one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Subscriber answered 2xx, message acked.
    Delivered,
    /// Attempt failed, message re-enqueued for a later attempt.
    Rescheduled,
    /// Attempt failed and the schedule is exhausted.
    DeadLettered,
}

/// Delivers one subscriber's inbound queue.
pub struct Delivery {
    service: String,
    endpoint: Url,
    queue: Queue,
    client: Arc<DeliveryClient>,
    scheduler: Scheduler,
}

impl Delivery {
    /// Creates the delivery handler of `service`.
    pub fn new(
        service: impl Into<String>,
        endpoint: Url,
        queue: Queue,
        client: Arc<DeliveryClient>,
        scheduler: Scheduler,
    ) -> Self {
        Self { service: service.into(), endpoint, queue, client, scheduler }
    }

    /// Attempts delivery of a popped message and settles it.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the message could not be acked,
    /// re-enqueued or dead-lettered; it is then redelivered after its lease.
    pub async fn deliver(&self, message: QueueMessage) -> Result<DeliveryOutcome> {
        let request =
            DeliveryRequest::for_envelope(&self.service, self.endpoint.clone(), &message.envelope);

        let outcome =
            self.client.deliver(request).await.and_then(|response| response.error_for_status());

        match outcome {
            Ok(response) => {
                debug!(
                    service = %self.service,
                    message_id = %message.envelope.id,
                    attempt = message.envelope.attempt,
                    status = response.status_code,
                    "message delivered"
                );
                self.queue.ack(message).await?;
                Ok(DeliveryOutcome::Delivered)
            },
            Err(failure) => {
                debug!(
                    service = %self.service,
                    message_id = %message.envelope.id,
                    attempt = message.envelope.attempt,
                    error_category = %ErrorCategory::from(&failure),
                    "delivery attempt failed"
                );
                match self.scheduler.handle_failure(message, &failure).await? {
                    RetryDecision::Retry { .. } => Ok(DeliveryOutcome::Rescheduled),
                    RetryDecision::GiveUp { .. } => Ok(DeliveryOutcome::DeadLettered),
                }
            },
        }
    }
}

impl MessageHandler for Delivery {
    fn handle(&self, message: QueueMessage) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let message_id = message.envelope.id;
            if let Err(err) = self.deliver(message).await {
                error!(
                    service = %self.service,
                    message_id = %message_id,
                    error = %err,
                    "failed to settle message, it will be redelivered"
                );
            }
        })
    }
}
