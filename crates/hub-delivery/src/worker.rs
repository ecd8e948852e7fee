//! Queue consumer loop shared by the dispatcher and delivery.
//!
//! A consumer pops from one queue for as long as its cancellation token is
//! live and hands each message to its handler in a task of its own. The
//! queue's admission limit bounds how many such tasks exist at once. On stop
//! the loop quits popping and waits for the tasks it already spawned.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use hub_core::Clock;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::{Queue, QueueMessage};

/// Processes messages popped from a queue.
///
/// The handler owns acknowledgement: a message dropped without an ack is
/// redelivered once its lease lapses.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handles one popped message.
    fn handle(&self, message: QueueMessage) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Consumer loop over one queue.
pub struct Consumer<H> {
    name: String,
    queue: Queue,
    handler: Arc<H>,
    clock: Arc<dyn Clock>,
    error_backoff: Duration,
    cancellation_token: CancellationToken,
}

impl<H: MessageHandler> Consumer<H> {
    /// Creates a consumer feeding `queue` into `handler`.
    pub fn new(
        name: impl Into<String>,
        queue: Queue,
        handler: Arc<H>,
        clock: Arc<dyn Clock>,
        error_backoff: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            handler,
            clock,
            error_backoff,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Runs the loop until cancelled, then waits for in-flight handlers.
    pub async fn run(self) {
        info!(consumer = %self.name, queue = %self.queue.name(), "consumer starting");

        let mut in_flight = JoinSet::new();

        loop {
            while let Some(result) = in_flight.try_join_next() {
                self.log_join(result);
            }

            match self.queue.pop(&self.cancellation_token).await {
                Ok(Some(message)) => {
                    debug!(
                        consumer = %self.name,
                        message_id = %message.envelope.id,
                        attempt = message.envelope.attempt,
                        "popped message"
                    );
                    let handler = self.handler.clone();
                    in_flight.spawn(async move { handler.handle(message).await });
                },
                Ok(None) => break,
                Err(error) => {
                    error!(
                        consumer = %self.name,
                        error = %error,
                        "failed to pop message"
                    );
                    tokio::select! {
                        () = self.clock.sleep(self.error_backoff) => {
                            // avoid a tight loop while the store is down
                        }
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        let pending = in_flight.len();
        if pending > 0 {
            info!(consumer = %self.name, pending, "waiting for in-flight messages");
        }
        while let Some(result) = in_flight.join_next().await {
            self.log_join(result);
        }

        info!(consumer = %self.name, "consumer stopped");
    }

    /// Spawns the loop and returns a handle to stop it.
    pub fn spawn(self) -> ConsumerHandle {
        let name = self.name.clone();
        let cancellation_token = self.cancellation_token.clone();
        let handle = tokio::spawn(self.run());
        ConsumerHandle { name, cancellation_token, handle: tokio::sync::Mutex::new(Some(handle)) }
    }

    fn log_join(&self, result: Result<(), tokio::task::JoinError>) {
        if let Err(join_error) = result {
            warn!(
                consumer = %self.name,
                error = %join_error,
                "message handler panicked, message will be redelivered"
            );
        }
    }
}

/// Handle to a spawned consumer loop.
#[derive(Debug)]
pub struct ConsumerHandle {
    name: String,
    cancellation_token: CancellationToken,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerHandle {
    /// Consumer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signals the loop to stop popping without waiting for it.
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    /// Stops the loop and waits for in-flight messages. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the join error if the loop itself panicked.
    pub async fn stop(&self) -> Result<(), tokio::task::JoinError> {
        self.cancellation_token.cancel();
        match self.handle.lock().await.take() {
            Some(handle) => handle.await,
            None => Ok(()),
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use hub_core::{storage::MemoryStore, CoordinationStore, Envelope, RealClock};
    use serde_json::json;

    use super::*;
    use crate::queue::QueueConfig;

    struct Counting {
        queue: Queue,
        handled: AtomicUsize,
        peak: AtomicUsize,
        active: AtomicUsize,
        work: Duration,
    }

    impl MessageHandler for Counting {
        fn handle(&self, message: QueueMessage) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async move {
                let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(active, Ordering::SeqCst);
                tokio::time::sleep(self.work).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                self.queue.ack(message).await.unwrap();
                self.handled.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    fn setup(limit: usize) -> (Queue, Arc<Counting>) {
        setup_with_work(limit, Duration::from_millis(20))
    }

    fn setup_with_work(limit: usize, work: Duration) -> (Queue, Arc<Counting>) {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let queue = Queue::new(
            "hub:test",
            store,
            Arc::new(RealClock::new()),
            limit,
            QueueConfig { poll_interval: Duration::from_millis(5), ..QueueConfig::default() },
        );
        let handler = Arc::new(Counting {
            queue: queue.clone(),
            handled: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            work,
        });
        (queue, handler)
    }

    #[tokio::test]
    async fn handles_messages_within_limit() {
        let (queue, handler) = setup(3);
        for _ in 0..12 {
            queue.push(&Envelope::new("t", json!(null), Utc::now())).await.unwrap();
        }

        let consumer = Consumer::new(
            "test",
            queue.clone(),
            handler.clone(),
            Arc::new(RealClock::new()),
            Duration::from_millis(10),
        )
        .spawn();

        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.handled.load(Ordering::SeqCst) < 12 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        consumer.stop().await.unwrap();
        assert!(handler.peak.load(Ordering::SeqCst) <= 3);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_waits_for_handlers() {
        let (queue, handler) = setup(2);
        queue.push(&Envelope::new("t", json!(null), Utc::now())).await.unwrap();

        let consumer = Consumer::new(
            "test",
            queue,
            handler.clone(),
            Arc::new(RealClock::new()),
            Duration::from_millis(10),
        )
        .spawn();

        tokio::time::timeout(Duration::from_secs(1), async {
            while handler.active.load(Ordering::SeqCst) == 0
                && handler.handled.load(Ordering::SeqCst) == 0
            {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        consumer.stop().await.unwrap();
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn lowered_limit_applies_to_running_consumer() {
        let (queue, handler) = setup_with_work(3, Duration::from_millis(150));
        for _ in 0..3 {
            queue.push(&Envelope::new("t", json!(null), Utc::now())).await.unwrap();
        }

        let consumer = Consumer::new(
            "test",
            queue.clone(),
            handler.clone(),
            Arc::new(RealClock::new()),
            Duration::from_millis(10),
        )
        .spawn();

        tokio::time::timeout(Duration::from_secs(1), async {
            while handler.active.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        queue.set_concurrency(1.0);
        for _ in 0..4 {
            queue.push(&Envelope::new("t", json!(null), Utc::now())).await.unwrap();
        }

        // wait for the three admitted under the old limit
        tokio::time::timeout(Duration::from_secs(1), async {
            while handler.handled.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        handler.peak.store(handler.active.load(Ordering::SeqCst), Ordering::SeqCst);

        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.handled.load(Ordering::SeqCst) < 7 {
                assert!(handler.active.load(Ordering::SeqCst) <= 1);
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        consumer.stop().await.unwrap();
        assert!(handler.peak.load(Ordering::SeqCst) <= 1, "new work ran above the lowered limit");
        assert!(queue.is_empty().await.unwrap());
    }
}
