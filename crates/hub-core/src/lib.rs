//! Core domain models and coordination primitives for the message hub.
//!
//! Provides strongly-typed message envelopes, the service manifest, the error
//! taxonomy and the coordination store abstraction shared by every hub
//! process. All other crates depend on these foundational types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod manifest;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, ManifestError, Result};
pub use manifest::{Manifest, RetrySchedule, ServiceDescriptor};
pub use models::{Envelope, MessageId, MessageType, ProcessId};
pub use storage::{CoordinationStore, DeadLetterRecord, ItemId, QueueItem};
pub use time::{Clock, RealClock, TestClock};
