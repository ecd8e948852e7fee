//! Scenario builder for end-to-end delivery tests.
//!
//! Describes one publisher, one subscriber and what the subscriber should
//! observe:
//!
//! ```no_run
//! # use hub_testing::{ScenarioBuilder, TestEnv};
//! # async fn example(env: &TestEnv) -> anyhow::Result<()> {
//! ScenarioBuilder::new("retries")
//!     .with_subscriber("job.done")
//!     .with_status(500)
//!     .with_retry_schedule(&[100, 500])
//!     .at("/jobs")
//!     .when_sending_message(serde_json::json!({"job": 1}))
//!     .it_is_received_at("/jobs")
//!     .within_schedule(&[0, 100, 600])
//!     .run(env)
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use hub_core::{Manifest, RetrySchedule, ServiceDescriptor};
use hub_delivery::Hub;
use tracing::{debug, info, warn};
use wiremock::{matchers, Mock};

use crate::{RecordedRequest, RecordingResponder, TestEnv};

const PUBLISHER: &str = "publisher";
const SUBSCRIBER: &str = "subscriber";
const CHECK_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_DEADLINE: Duration = Duration::from_secs(15);

/// Slack granted to the first request of a schedule.
const WARMUP: Duration = Duration::from_millis(100);
/// Slack granted per position in a schedule.
const THRESHOLD: Duration = Duration::from_millis(100);

/// Subscriber half of a scenario.
pub struct SubscriberBuilder {
    scenario: ScenarioBuilder,
    message_type: String,
    concurrency: Option<f64>,
    response_taking: Option<Duration>,
    retry_schedule: Option<RetrySchedule>,
    status: u16,
}

impl SubscriberBuilder {
    /// Declared concurrency of the subscriber.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: f64) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Delays each endpoint response by `ms` milliseconds.
    #[must_use]
    pub fn with_response_taking(mut self, ms: u64) -> Self {
        self.response_taking = Some(Duration::from_millis(ms));
        self
    }

    /// Retry schedule in milliseconds.
    #[must_use]
    pub fn with_retry_schedule(mut self, delays_ms: &[u64]) -> Self {
        self.retry_schedule = Some(RetrySchedule::from_millis(delays_ms));
        self
    }

    /// Status the endpoint answers with (default 200).
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Mounts the subscriber endpoint at `path` and returns to the scenario.
    pub fn at(self, path: impl Into<String>) -> ScenarioBuilder {
        let mut scenario = self.scenario;
        scenario.subscriber = Some(SubscriberSetup {
            message_type: self.message_type,
            path: path.into(),
            concurrency: self.concurrency,
            response_taking: self.response_taking,
            retry_schedule: self.retry_schedule,
            status: self.status,
        });
        scenario
    }
}

struct SubscriberSetup {
    message_type: String,
    path: String,
    concurrency: Option<f64>,
    response_taking: Option<Duration>,
    retry_schedule: Option<RetrySchedule>,
    status: u16,
}

/// What a scenario observed.
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    /// Requests received by the subscriber, in arrival order.
    pub requests: Vec<RecordedRequest>,
    /// Most requests the subscriber endpoint served at once, across all hubs.
    pub peak_concurrency: usize,
    /// When the first message was published.
    pub started_at: Instant,
}

impl ScenarioReport {
    /// Arrival offsets relative to the first publish.
    pub fn offsets(&self) -> Vec<Duration> {
        self.requests.iter().map(|r| r.received_at.duration_since(self.started_at)).collect()
    }
}

/// End-to-end scenario: N hubs, one publisher, one subscriber.
pub struct ScenarioBuilder {
    name: String,
    instances: usize,
    subscriber: Option<SubscriberSetup>,
    message: serde_json::Value,
    times: usize,
    receiving_path: Option<String>,
    expected_requests: usize,
    after: Option<Duration>,
    schedule: Vec<Duration>,
    deadline: Duration,
}

impl ScenarioBuilder {
    /// Create a new scenario.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instances: 1,
            subscriber: None,
            message: serde_json::Value::Null,
            times: 1,
            receiving_path: None,
            expected_requests: 1,
            after: None,
            schedule: Vec::new(),
            deadline: DEFAULT_DEADLINE,
        }
    }

    /// Number of hub processes sharing the store (default 1).
    #[must_use]
    pub fn for_hub(mut self, instances: usize) -> Self {
        self.instances = instances.max(1);
        self
    }

    /// Starts describing the subscriber of `message_type`.
    pub fn with_subscriber(self, message_type: impl Into<String>) -> SubscriberBuilder {
        SubscriberBuilder {
            scenario: self,
            message_type: message_type.into(),
            concurrency: None,
            response_taking: None,
            retry_schedule: None,
            status: 200,
        }
    }

    /// Payload published once the hubs run.
    #[must_use]
    pub fn when_sending_message(mut self, payload: serde_json::Value) -> Self {
        self.message = payload;
        self
    }

    /// Publishes the message `times` times (default 1).
    #[must_use]
    pub fn times(mut self, times: usize) -> Self {
        self.times = times;
        self
    }

    /// Path the requests are expected at.
    #[must_use]
    pub fn it_is_received_at(mut self, path: impl Into<String>) -> Self {
        self.receiving_path = Some(path.into());
        self
    }

    /// Expected number of requests (default 1).
    #[must_use]
    pub fn received_times(mut self, count: usize) -> Self {
        self.expected_requests = count;
        self
    }

    /// Checks the request count exactly once, `ms` after the first publish.
    #[must_use]
    pub fn after(mut self, ms: u64) -> Self {
        self.after = Some(Duration::from_millis(ms));
        self
    }

    /// Expected arrival offsets in milliseconds from the first publish.
    #[must_use]
    pub fn within_schedule(mut self, offsets_ms: &[u64]) -> Self {
        self.schedule = offsets_ms.iter().copied().map(Duration::from_millis).collect();
        self
    }

    /// Overall time limit of the scenario (default 15s).
    #[must_use]
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Runs the scenario, then purges and stops every hub.
    ///
    /// # Errors
    ///
    /// Returns error if the scenario is incomplete, a hub fails, or the
    /// observed requests do not match the expectation before the deadline.
    pub async fn run(self, env: &TestEnv) -> Result<ScenarioReport> {
        info!("running scenario: {}", self.name);

        let Some(subscriber) = &self.subscriber else {
            bail!("scenario {} has no subscriber", self.name);
        };
        let path = self.receiving_path.clone().unwrap_or_else(|| subscriber.path.clone());

        let mut responder = RecordingResponder::new(subscriber.status);
        if let Some(delay) = subscriber.response_taking {
            responder = responder.with_delay(delay);
        }
        Mock::given(matchers::method("POST"))
            .and(matchers::path(path.as_str()))
            .respond_with(responder.clone())
            .mount(&env.server)
            .await;

        let mut hubs = Vec::with_capacity(self.instances);
        for _ in 0..self.instances {
            hubs.push(env.hub(self.manifest(env, subscriber)?)?);
        }
        for hub in &hubs {
            hub.start().await;
        }
        if hubs.len() > 1 {
            // let every process see its peers before the first delivery
            tokio::time::sleep(env.config().concurrency.polling_interval * 2).await;
        }

        let outcome = self.observe(&hubs, &responder).await;
        reset(&hubs).await?;
        outcome
    }

    fn manifest(&self, env: &TestEnv, subscriber: &SubscriberSetup) -> Result<Manifest> {
        let mut descriptor = ServiceDescriptor::subscriber(
            SUBSCRIBER,
            [subscriber.message_type.as_str()],
            env.endpoint(&subscriber.path)?,
        );
        if let Some(concurrency) = subscriber.concurrency {
            descriptor = descriptor.with_concurrency(concurrency);
        }
        if let Some(schedule) = &subscriber.retry_schedule {
            descriptor = descriptor.with_retry_schedule(schedule.clone());
        }

        Manifest::new([
            ServiceDescriptor::publisher(PUBLISHER, [subscriber.message_type.as_str()]),
            descriptor,
        ])
        .context("invalid scenario manifest")
    }

    async fn observe(&self, hubs: &[Hub], responder: &RecordingResponder) -> Result<ScenarioReport> {
        let Some(subscriber) = &self.subscriber else {
            bail!("scenario {} has no subscriber", self.name);
        };
        let Some(publisher) = hubs.first() else {
            bail!("scenario {} has no hub", self.name);
        };

        let started_at = Instant::now();
        for _ in 0..self.times {
            publisher.publish(subscriber.message_type.as_str(), self.message.clone()).await?;
        }

        loop {
            let report = ScenarioReport {
                requests: responder.requests(),
                peak_concurrency: responder.peak_concurrency(),
                started_at,
            };
            if self.check(&report)? {
                debug!(requests = report.requests.len(), "scenario expectations met");
                return Ok(report);
            }

            if started_at.elapsed() > self.deadline {
                bail!(
                    "scenario {} timed out after {:?} with {} requests",
                    self.name,
                    self.deadline,
                    responder.count()
                );
            }
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    /// `Ok(true)` once satisfied, `Ok(false)` to keep waiting.
    fn check(&self, report: &ScenarioReport) -> Result<bool> {
        let offsets = report.offsets();

        if let Some(after) = self.after {
            if report.started_at.elapsed() < after {
                return Ok(false);
            }
        }

        if !self.schedule.is_empty() {
            if offsets.len() < self.schedule.len() {
                return Ok(false);
            }
            if offsets.len() > self.schedule.len() {
                bail!("expected {} requests, got {}", self.schedule.len(), offsets.len());
            }
            for (index, (offset, expected)) in offsets.iter().zip(&self.schedule).enumerate() {
                let (from, to) = if index == 0 {
                    (Duration::ZERO, *expected + WARMUP)
                } else {
                    (*expected, *expected + THRESHOLD * u32::try_from(index).unwrap_or(u32::MAX))
                };
                if *offset < from || *offset > to {
                    warn!(?offsets, schedule = ?self.schedule, "request outside schedule");
                    bail!("#{index} at {offset:?} doesn't fall in [{from:?}..{to:?}]");
                }
            }
            return Ok(true);
        }

        let count = offsets.len();
        if self.after.is_some() {
            if count != self.expected_requests {
                bail!("expected {} requests, got {count}", self.expected_requests);
            }
            return Ok(true);
        }
        Ok(count == self.expected_requests)
    }
}

async fn reset(hubs: &[Hub]) -> Result<()> {
    if let Some(hub) = hubs.first() {
        hub.purge().await?;
    }
    for hub in hubs {
        hub.shutdown().await?;
    }
    Ok(())
}
