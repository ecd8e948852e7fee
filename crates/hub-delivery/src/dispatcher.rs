//! Fan-out from the outbound queue to subscriber inbound queues.
//!
//! Every subscriber of a message's type receives its own copy at attempt 0.
//! The outbound item is acked only after all copies are pushed, so a failed
//! push leads to a full redelivery and possibly duplicate copies for the
//! subscribers that were already served. Subscribers see at-least-once
//! delivery and can deduplicate on the message id.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use hub_core::{Clock, Envelope, Manifest};
use tracing::{debug, info, warn};

use crate::{
    error::{DeliveryError, Result},
    queue::{Queue, QueueMessage},
    worker::MessageHandler,
};

/// Routes published messages to subscriber queues.
pub struct Dispatcher {
    manifest: Arc<Manifest>,
    outbound: Queue,
    inbound: HashMap<String, Queue>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    /// Creates a dispatcher acking on `outbound` and pushing into `inbound`,
    /// keyed by service name.
    pub fn new(
        manifest: Arc<Manifest>,
        outbound: Queue,
        inbound: HashMap<String, Queue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { manifest, outbound, inbound, clock }
    }

    /// Pushes one fresh copy of `envelope` to every subscriber of its type.
    ///
    /// Returns the number of copies pushed.
    ///
    /// # Errors
    ///
    /// - `StoreUnavailable` if a push fails
    /// - `Configuration` if a subscriber has no inbound queue
    pub async fn dispatch(&self, envelope: &Envelope) -> Result<usize> {
        let now = self.clock.now_utc();
        let mut pushed = 0;

        for service in self.manifest.subscribers_of(&envelope.message_type) {
            let queue = self.inbound.get(&service.name).ok_or_else(|| {
                DeliveryError::configuration(format!("no inbound queue for {}", service.name))
            })?;

            queue.push(&envelope.for_subscriber(now)).await?;
            pushed += 1;

            debug!(
                service = %service.name,
                message_id = %envelope.id,
                message_type = %envelope.message_type,
                "fanned out message"
            );
        }

        Ok(pushed)
    }

    async fn handle_message(&self, message: QueueMessage) {
        let envelope = &message.envelope;

        match self.dispatch(envelope).await {
            Ok(0) => {
                info!(
                    message_id = %envelope.id,
                    message_type = %envelope.message_type,
                    "no subscribers for message type, dropping"
                );
            },
            Ok(subscribers) => {
                debug!(message_id = %envelope.id, subscribers, "dispatched message");
            },
            Err(error) => {
                warn!(
                    message_id = %envelope.id,
                    message_type = %envelope.message_type,
                    error = %error,
                    "dispatch failed, message will be redelivered"
                );
                return;
            },
        }

        if let Err(error) = self.outbound.ack(message).await {
            warn!(error = %error, "failed to ack outbound message");
        }
    }
}

impl MessageHandler for Dispatcher {
    fn handle(&self, message: QueueMessage) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.handle_message(message))
    }
}
