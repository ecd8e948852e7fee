//! Builder for [`TestEnv`](crate::TestEnv).

use std::time::Duration;

use anyhow::Result;
use hub_delivery::{ConcurrencyConfig, HubConfig, QueueConfig};
use wiremock::MockServer;

use crate::TestEnv;

/// Configures the timing of hubs built by a test environment.
pub struct TestEnvBuilder {
    polling_interval: Duration,
    queue_poll_interval: Duration,
    visibility_timeout: Duration,
    error_backoff: Duration,
    shutdown_timeout: Duration,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_millis(100),
            queue_poll_interval: Duration::from_millis(10),
            visibility_timeout: Duration::from_secs(10),
            error_backoff: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl TestEnvBuilder {
    /// Creates a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the rebalance interval of concurrency managers (default: 100ms).
    #[must_use]
    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Sets the poll interval of empty queues (default: 10ms).
    #[must_use]
    pub fn queue_poll_interval(mut self, interval: Duration) -> Self {
        self.queue_poll_interval = interval;
        self
    }

    /// Sets the lease of popped messages (default: 10s).
    #[must_use]
    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Sets the shutdown timeout for graceful termination (default: 5s).
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Starts the mock server and builds the environment.
    pub async fn build(self) -> Result<TestEnv> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
            )
            .with_test_writer()
            .try_init();

        let config = HubConfig {
            concurrency: ConcurrencyConfig {
                polling_interval: self.polling_interval,
                ..ConcurrencyConfig::default()
            },
            queue: QueueConfig {
                visibility_timeout: self.visibility_timeout,
                poll_interval: self.queue_poll_interval,
            },
            error_backoff: self.error_backoff,
            shutdown_timeout: self.shutdown_timeout,
            ..HubConfig::default()
        };

        Ok(TestEnv::from_parts(MockServer::start().await, config))
    }
}
