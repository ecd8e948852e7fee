//! Core domain models and strongly-typed identifiers.
//!
//! Defines the message envelope that travels through every queue of the hub,
//! plus newtype wrappers for message ids, message types and process
//! identities.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Strongly-typed message identifier.
///
/// Assigned once at publish time. Fan-out copies and retries of the same
/// message keep this id, which makes duplicate deliveries recognisable by
/// subscribers.
///
/// # Example
///
/// ```
/// use hub_core::models::MessageId;
/// let id = MessageId::new();
/// println!("published message {id}");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Creates a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Declared message type, e.g. `"order.created"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(pub String);

impl MessageType {
    /// Creates a message type from any string-like value.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the type name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageType {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for MessageType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Opaque identity of a running hub process.
///
/// Generated once per process lifetime and used as the member of every
/// liveness set the process reports into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub String);

impl ProcessId {
    /// Generates a fresh process identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Returns the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message travelling through the hub's queues.
///
/// `attempt` counts delivery attempts already made (0 means first try) and
/// only ever grows by one per re-enqueue. The envelope is invisible to
/// consumers until `not_before`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message identifier, stable across fan-out and retries.
    pub id: MessageId,
    /// Declared message type.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Opaque JSON payload forwarded to subscribers as the request body.
    pub payload: serde_json::Value,
    /// Number of failed delivery attempts so far.
    pub attempt: u32,
    /// Earliest time at which the envelope may be consumed.
    pub not_before: DateTime<Utc>,
    /// Time the message was first published.
    pub created_at: DateTime<Utc>,
}

impl Envelope {
    /// Creates the envelope for a freshly published message.
    pub fn new(
        message_type: impl Into<MessageType>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            message_type: message_type.into(),
            payload,
            attempt: 0,
            not_before: now,
            created_at: now,
        }
    }

    /// Produces the copy pushed to a subscriber's inbound queue during
    /// fan-out: first attempt, immediately eligible.
    #[must_use]
    pub fn for_subscriber(&self, now: DateTime<Utc>) -> Self {
        Self { attempt: 0, not_before: now, ..self.clone() }
    }

    /// Produces the next attempt of this envelope, eligible at `not_before`.
    #[must_use]
    pub fn next_attempt(&self, not_before: DateTime<Utc>) -> Self {
        Self { attempt: self.attempt.saturating_add(1), not_before, ..self.clone() }
    }

    /// Whether a consumer may see the envelope at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_before
    }
}
