//! Delivery pipeline of the message hub.
//!
//! Moves published messages from the outbound queue to every subscriber's
//! endpoint, retrying on the subscriber's schedule and dead-lettering what
//! cannot be delivered. Any number of hub processes may run this pipeline
//! against one coordination store; each keeps its share of a subscriber's
//! concurrency budget in proportion to the number of live peers.
//!
//! # Architecture
//!
//! 1. **Publish** - the message lands in the outbound queue
//! 2. **Dispatch** - one copy per subscriber goes to its inbound queue
//! 3. **Deliver** - inbound queues are consumed under a live concurrency
//!    limit set by the [`ConcurrencyManager`]
//! 4. **Schedule** - failed attempts are re-enqueued with a delay from the
//!    subscriber's retry schedule, or dead-lettered once it is exhausted
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hub_core::{storage::MemoryStore, Manifest, RealClock};
//! use hub_delivery::{Hub, HubConfig, DeliveryError};
//!
//! # async fn example(manifest: Manifest) -> std::result::Result<(), DeliveryError> {
//! let hub = Hub::new(manifest, Arc::new(MemoryStore::new()), Arc::new(RealClock::new()), HubConfig::default())?;
//!
//! hub.start().await;
//! hub.publish("order.created", serde_json::json!({"id": 1})).await?;
//! hub.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod concurrency;
pub mod dead_letter;
pub mod delivery;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod queue;
pub mod scheduler;
pub mod worker;

pub use concurrency::{ConcurrencyConfig, ConcurrencyManager, ManagerState};
pub use engine::{Hub, HubConfig, HubState};
pub use error::{DeliveryError, Result};
pub use queue::{Queue, QueueConfig, QueueMessage};
