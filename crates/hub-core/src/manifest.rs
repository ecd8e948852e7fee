//! Static declaration of every service attached to the hub.
//!
//! The manifest is loaded once at process start and consumed read-only. It
//! maps service names to what they publish, what they subscribe to, where
//! deliveries go, how many deliveries may run concurrently across the whole
//! cluster and how failed deliveries are retried.
//!
//! # Format
//!
//! ```json
//! {
//!   "orders":  { "publishes": ["order.created"] },
//!   "billing": {
//!     "subscribes": ["order.created"],
//!     "endpoint": "https://billing.internal/hooks/orders",
//!     "concurrency": 4,
//!     "retrySchedule": [100, 500, 2000]
//!   }
//! }
//! ```
//!
//! Retry delays are milliseconds. The delay at index `k` is waited before
//! attempt `k + 1`.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    time::Duration,
};

use serde::Deserialize;
use url::Url;

use crate::{error::ManifestError, models::MessageType};

/// Concurrency applied to services that do not declare one.
pub const DEFAULT_CONCURRENCY: f64 = 10.0;

/// Ordered delays between delivery attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrySchedule(Vec<Duration>);

impl RetrySchedule {
    /// Creates a schedule from explicit delays.
    pub fn new(delays: Vec<Duration>) -> Self {
        Self(delays)
    }

    /// Creates a schedule from millisecond delays.
    pub fn from_millis(delays: &[u64]) -> Self {
        Self(delays.iter().copied().map(Duration::from_millis).collect())
    }

    /// A schedule that never retries.
    pub fn none() -> Self {
        Self(Vec::new())
    }

    /// Delay to wait after the failure of attempt `attempt` (0-based), or
    /// `None` once the schedule is exhausted.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        usize::try_from(attempt).ok().and_then(|index| self.0.get(index)).copied()
    }

    /// Number of retries the schedule allows.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the schedule allows no retry at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The configured delays.
    pub fn delays(&self) -> &[Duration] {
        &self.0
    }
}

/// One service as declared in the manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescriptor {
    /// Unique service name, also used to derive queue and liveness keys.
    pub name: String,
    /// Message types the service publishes.
    pub publishes: BTreeSet<MessageType>,
    /// Message types the service wants delivered.
    pub subscribes: BTreeSet<MessageType>,
    /// Delivery target; present iff the service subscribes to something.
    pub endpoint: Option<Url>,
    /// Target number of concurrent deliveries across all hub processes.
    pub concurrency: f64,
    /// Delays between delivery attempts.
    pub retry_schedule: RetrySchedule,
}

impl ServiceDescriptor {
    /// Declares a publisher-only service.
    pub fn publisher<I, T>(name: impl Into<String>, publishes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<MessageType>,
    {
        Self {
            name: name.into(),
            publishes: publishes.into_iter().map(Into::into).collect(),
            subscribes: BTreeSet::new(),
            endpoint: None,
            concurrency: DEFAULT_CONCURRENCY,
            retry_schedule: RetrySchedule::none(),
        }
    }

    /// Declares a subscribing service delivering to `endpoint`.
    pub fn subscriber<I, T>(name: impl Into<String>, subscribes: I, endpoint: Url) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<MessageType>,
    {
        Self {
            name: name.into(),
            publishes: BTreeSet::new(),
            subscribes: subscribes.into_iter().map(Into::into).collect(),
            endpoint: Some(endpoint),
            concurrency: DEFAULT_CONCURRENCY,
            retry_schedule: RetrySchedule::none(),
        }
    }

    /// Sets the cluster-wide concurrency target.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: f64) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the retry schedule.
    #[must_use]
    pub fn with_retry_schedule(mut self, schedule: RetrySchedule) -> Self {
        self.retry_schedule = schedule;
        self
    }

    /// Whether the service receives deliveries.
    pub fn is_subscriber(&self) -> bool {
        !self.subscribes.is_empty()
    }

    fn validate(&self) -> Result<(), ManifestError> {
        if self.is_subscriber() && self.endpoint.is_none() {
            return Err(ManifestError::MissingEndpoint {
                service: self.name.clone(),
                types: self.subscribes.iter().map(ToString::to_string).collect(),
            });
        }

        if !self.concurrency.is_finite() || self.concurrency <= 0.0 {
            return Err(ManifestError::InvalidConcurrency {
                service: self.name.clone(),
                concurrency: self.concurrency,
            });
        }

        Ok(())
    }
}

/// The full set of services attached to the hub.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    services: BTreeMap<String, ServiceDescriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawService {
    #[serde(default)]
    publishes: Vec<String>,
    #[serde(default)]
    subscribes: Vec<String>,
    #[serde(default)]
    endpoint: Option<Url>,
    #[serde(default)]
    concurrency: Option<f64>,
    #[serde(default)]
    retry_schedule: Vec<serde_json::Value>,
}

impl Manifest {
    /// Builds a manifest from descriptors, validating each one.
    ///
    /// # Errors
    ///
    /// Returns `ManifestError` if a subscriber lacks an endpoint or declares
    /// a non-positive concurrency.
    pub fn new(services: impl IntoIterator<Item = ServiceDescriptor>) -> Result<Self, ManifestError> {
        let mut map = BTreeMap::new();
        for service in services {
            service.validate()?;
            map.insert(service.name.clone(), service);
        }
        Ok(Self { services: map })
    }

    /// Parses a JSON manifest document.
    ///
    /// Services without a declared concurrency get `default_concurrency`.
    ///
    /// # Errors
    ///
    /// Returns `ManifestError` for unparsable documents and for every
    /// validation failure described on [`Manifest::new`], plus malformed
    /// retry schedules (negative, fractional or non-numeric delays).
    pub fn from_json(document: &str, default_concurrency: f64) -> Result<Self, ManifestError> {
        let raw: BTreeMap<String, RawService> = serde_json::from_str(document)?;

        let services = raw
            .into_iter()
            .map(|(name, raw)| {
                let retry_schedule = parse_retry_schedule(&name, &raw.retry_schedule)?;
                Ok(ServiceDescriptor {
                    publishes: raw.publishes.into_iter().map(MessageType::from).collect(),
                    subscribes: raw.subscribes.into_iter().map(MessageType::from).collect(),
                    endpoint: raw.endpoint,
                    concurrency: raw.concurrency.unwrap_or(default_concurrency),
                    retry_schedule,
                    name,
                })
            })
            .collect::<Result<Vec<_>, ManifestError>>()?;

        Self::new(services)
    }

    /// Reads and parses a JSON manifest file.
    ///
    /// # Errors
    ///
    /// Returns `ManifestError::Io` if the file cannot be read, otherwise the
    /// errors of [`Manifest::from_json`].
    pub fn load(path: impl AsRef<Path>, default_concurrency: f64) -> Result<Self, ManifestError> {
        let document = std::fs::read_to_string(path)?;
        Self::from_json(&document, default_concurrency)
    }

    /// Looks up a service by name.
    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name)
    }

    /// All declared services, ordered by name.
    pub fn services(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.values()
    }

    /// Services that receive deliveries.
    pub fn subscribers(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.values().filter(|service| service.is_subscriber())
    }

    /// Services subscribed to `message_type`.
    pub fn subscribers_of<'a>(
        &'a self,
        message_type: &'a MessageType,
    ) -> impl Iterator<Item = &'a ServiceDescriptor> + 'a {
        self.services.values().filter(move |service| service.subscribes.contains(message_type))
    }

    /// Whether any service declares it publishes `message_type`.
    pub fn is_published(&self, message_type: &MessageType) -> bool {
        self.services.values().any(|service| service.publishes.contains(message_type))
    }

    /// Number of declared services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the manifest declares no service.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

fn parse_retry_schedule(
    service: &str,
    delays: &[serde_json::Value],
) -> Result<RetrySchedule, ManifestError> {
    let malformed = |reason: String| ManifestError::MalformedRetrySchedule {
        service: service.to_string(),
        reason,
    };

    delays
        .iter()
        .enumerate()
        .map(|(index, value)| {
            value
                .as_u64()
                .map(Duration::from_millis)
                .ok_or_else(|| malformed(format!("delay #{index} ({value}) is not a whole number of milliseconds")))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(RetrySchedule::new)
}
