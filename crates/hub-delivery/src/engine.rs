//! Process-level hub engine.
//!
//! Owns everything one hub process runs against the shared coordination
//! store:
//!
//! ```text
//!  publish ──▶ outbound queue ──▶ Dispatcher ──▶ hub:in:<service> ──▶ Delivery ──▶ endpoint
//!                                                      ▲                  │
//!                                   ConcurrencyManager │                  ▼
//!                                   (limit = C / alive)│             Scheduler ──▶ DeadLetter
//!                                                      └──── retry ───────┘
//! ```
//!
//! One dispatcher consumer serves the outbound queue. Each subscribing
//! service gets an inbound queue, a concurrency manager and a delivery
//! consumer. Inbound queues start with a limit of zero and open up on the
//! manager's first tick, so a fresh process never admits more than its
//! share.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use hub_core::{
    Clock, CoordinationStore, DeadLetterRecord, Envelope, Manifest, MessageType, ProcessId,
};
use tracing::{error, info, warn};

use crate::{
    client::{ClientConfig, DeliveryClient},
    concurrency::{ConcurrencyConfig, ConcurrencyManager},
    dead_letter::DeadLetter,
    delivery::Delivery,
    dispatcher::Dispatcher,
    error::{DeliveryError, Result},
    queue::{inbound_queue_name, Queue, QueueConfig, OUTBOUND_QUEUE},
    scheduler::Scheduler,
    worker::{Consumer, ConsumerHandle},
};

/// Configuration of a hub process.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Rebalance interval and liveness window.
    pub concurrency: ConcurrencyConfig,

    /// Queue lease and polling timing.
    pub queue: QueueConfig,

    /// Pause after a failed pop before trying again.
    pub error_backoff: Duration,

    /// Outbound messages dispatched concurrently by this process.
    pub dispatch_concurrency: usize,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Maximum time to wait for loops and in-flight deliveries on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyConfig::default(),
            queue: QueueConfig::default(),
            error_backoff: Duration::from_secs(1),
            dispatch_concurrency: 10,
            client_config: ClientConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Lifecycle of a [`Hub`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    /// Wired, nothing spawned.
    Created,
    /// Loops running.
    Running,
    /// Shut down; terminal.
    Stopped,
}

impl fmt::Display for HubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

struct Subscriber {
    name: String,
    queue: Queue,
    manager: ConcurrencyManager,
    dead_letter: DeadLetter,
    delivery: Arc<Delivery>,
}

/// A running hub process.
pub struct Hub {
    process_id: ProcessId,
    manifest: Arc<Manifest>,
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    config: HubConfig,
    outbound: Queue,
    dispatcher: Arc<Dispatcher>,
    subscribers: Vec<Subscriber>,
    state: Mutex<HubState>,
    consumers: tokio::sync::Mutex<Vec<ConsumerHandle>>,
}

impl Hub {
    /// Wires a hub process for `manifest` on top of `store`.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the HTTP client cannot be built.
    pub fn new(
        manifest: Manifest,
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        config: HubConfig,
    ) -> Result<Self> {
        let process_id = ProcessId::generate();
        let manifest = Arc::new(manifest);
        let client = Arc::new(DeliveryClient::new(config.client_config.clone())?);

        let outbound = Queue::new(
            OUTBOUND_QUEUE,
            store.clone(),
            clock.clone(),
            config.dispatch_concurrency,
            config.queue,
        );

        let mut subscribers = Vec::new();
        for service in manifest.subscribers() {
            let Some(endpoint) = service.endpoint.clone() else {
                return Err(DeliveryError::configuration(format!(
                    "service {} subscribes without endpoint",
                    service.name
                )));
            };

            let queue = Queue::new(
                inbound_queue_name(&service.name),
                store.clone(),
                clock.clone(),
                0,
                config.queue,
            );
            let manager = ConcurrencyManager::new(
                &service.name,
                service.concurrency,
                process_id.clone(),
                queue.clone(),
                store.clone(),
                clock.clone(),
                config.concurrency,
            );
            let dead_letter = DeadLetter::new(&service.name, store.clone(), clock.clone());
            let scheduler = Scheduler::new(
                &service.name,
                queue.clone(),
                service.retry_schedule.clone(),
                dead_letter.clone(),
                clock.clone(),
            );
            let delivery = Arc::new(Delivery::new(
                &service.name,
                endpoint,
                queue.clone(),
                client.clone(),
                scheduler,
            ));

            subscribers.push(Subscriber {
                name: service.name.clone(),
                queue,
                manager,
                dead_letter,
                delivery,
            });
        }

        let inbound: HashMap<_, _> =
            subscribers.iter().map(|s| (s.name.clone(), s.queue.clone())).collect();
        let dispatcher =
            Arc::new(Dispatcher::new(manifest.clone(), outbound.clone(), inbound, clock.clone()));

        Ok(Self {
            process_id,
            manifest,
            store,
            clock,
            config,
            outbound,
            dispatcher,
            subscribers,
            state: Mutex::new(HubState::Created),
            consumers: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Identity this process reports in liveness sets.
    pub fn process_id(&self) -> &ProcessId {
        &self.process_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HubState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The loaded manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// The outbound queue.
    pub fn outbound_queue(&self) -> &Queue {
        &self.outbound
    }

    /// Inbound queue of a subscribing service.
    pub fn inbound_queue(&self, service: &str) -> Option<&Queue> {
        self.subscriber(service).map(|s| &s.queue)
    }

    /// Concurrency manager of a subscribing service.
    pub fn concurrency_manager(&self, service: &str) -> Option<&ConcurrencyManager> {
        self.subscriber(service).map(|s| &s.manager)
    }

    /// Accepts a message for fan-out.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the outbound push fails.
    pub async fn publish(
        &self,
        message_type: impl Into<MessageType>,
        payload: serde_json::Value,
    ) -> Result<Envelope> {
        let envelope = Envelope::new(message_type, payload, self.clock.now_utc());

        if !self.manifest.is_published(&envelope.message_type) {
            warn!(
                message_type = %envelope.message_type,
                "publishing a message type no service declares"
            );
        }

        self.outbound.push(&envelope).await?;
        info!(
            message_id = %envelope.id,
            message_type = %envelope.message_type,
            "message published"
        );
        Ok(envelope)
    }

    /// Starts the dispatcher, every concurrency manager and every delivery
    /// consumer.
    ///
    /// Starting a running hub does nothing. A hub that was shut down stays
    /// stopped: its concurrency managers cannot be restarted.
    pub async fn start(&self) {
        let mut consumers = self.consumers.lock().await;
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                HubState::Created => *state = HubState::Running,
                HubState::Running => return,
                HubState::Stopped => {
                    warn!(process_id = %self.process_id, "start ignored, hub was shut down");
                    return;
                },
            }
        }

        info!(
            process_id = %self.process_id,
            subscribers = self.subscribers.len(),
            dispatch_concurrency = self.config.dispatch_concurrency,
            "starting hub"
        );

        for subscriber in &self.subscribers {
            subscriber.manager.start().await;
            consumers.push(
                Consumer::new(
                    format!("delivery:{}", subscriber.name),
                    subscriber.queue.clone(),
                    subscriber.delivery.clone(),
                    self.clock.clone(),
                    self.config.error_backoff,
                )
                .spawn(),
            );
        }

        consumers.push(
            Consumer::new(
                "dispatcher",
                self.outbound.clone(),
                self.dispatcher.clone(),
                self.clock.clone(),
                self.config.error_backoff,
            )
            .spawn(),
        );
    }

    /// Stops every loop and waits for in-flight deliveries.
    ///
    /// Unacked messages stay in the store and are redelivered after their
    /// lease. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// - `ShutdownTimeout` if the loops outlive `shutdown_timeout`
    /// - `WorkerPanic` if a consumer loop panicked
    pub async fn shutdown(&self) -> Result<()> {
        let timeout = self.config.shutdown_timeout;
        info!(
            process_id = %self.process_id,
            timeout_seconds = timeout.as_secs(),
            "shutting down hub"
        );

        let consumers = {
            let mut consumers = self.consumers.lock().await;
            *self.state.lock().unwrap_or_else(PoisonError::into_inner) = HubState::Stopped;
            std::mem::take(&mut *consumers)
        };
        for consumer in &consumers {
            consumer.cancel();
        }

        let shutdown = async {
            let mut panics = Vec::new();
            for consumer in &consumers {
                if let Err(join_error) = consumer.stop().await {
                    error!(
                        consumer = consumer.name(),
                        error = %join_error,
                        "consumer panicked during shutdown"
                    );
                    panics.push(format!("{}: {join_error}", consumer.name()));
                }
            }
            for subscriber in &self.subscribers {
                subscriber.manager.stop().await;
            }
            panics
        };

        match tokio::time::timeout(timeout, shutdown).await {
            Ok(panics) if panics.is_empty() => {
                info!("hub shutdown completed");
                Ok(())
            },
            Ok(panics) => Err(DeliveryError::WorkerPanic { message: panics.join("; ") }),
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "hub shutdown timed out, some deliveries may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout_seconds: timeout.as_secs() })
            },
        }
    }

    /// Drops every queued message of this hub. Intended for tests and
    /// operational resets.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if a purge fails.
    pub async fn purge(&self) -> Result<u64> {
        let mut removed = self.outbound.purge().await?;
        for subscriber in &self.subscribers {
            removed += subscriber.queue.purge().await?;
        }
        info!(removed, "purged hub queues");
        Ok(removed)
    }

    /// Most recent dead letters of `service`, or `None` for an unknown or
    /// non-subscribing service.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store cannot be queried.
    pub async fn dead_letters(
        &self,
        service: &str,
        limit: usize,
    ) -> Result<Option<Vec<DeadLetterRecord>>> {
        match self.subscriber(service) {
            Some(subscriber) => Ok(Some(subscriber.dead_letter.list(limit).await?)),
            None => Ok(None),
        }
    }

    /// Verifies the coordination store is reachable.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the health check fails.
    pub async fn health_check(&self) -> Result<()> {
        Ok(self.store.health_check().await?)
    }

    fn subscriber(&self, service: &str) -> Option<&Subscriber> {
        self.subscribers.iter().find(|s| s.name == service)
    }
}
