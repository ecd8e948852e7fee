//! Test infrastructure for the message hub.
//!
//! Provides an in-memory coordination store shared by any number of hub
//! processes, a wiremock server standing in for subscriber endpoints, and a
//! scenario DSL for end-to-end delivery tests.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hub_core::{storage::MemoryStore, Clock, Manifest, RealClock};
use hub_delivery::{Hub, HubConfig};
use url::Url;
use wiremock::MockServer;

pub mod env;
pub mod http;
pub mod scenario;

pub use env::TestEnvBuilder;
pub use http::{RecordedRequest, RecordingResponder};
pub use scenario::{ScenarioBuilder, ScenarioReport, SubscriberBuilder};

/// Test environment for hub integration tests.
///
/// Every hub built from one environment shares its store, the way separate
/// hub processes share one database in production.
pub struct TestEnv {
    /// Mock server hosting subscriber endpoints
    pub server: MockServer,
    store: MemoryStore,
    clock: Arc<dyn Clock>,
    config: HubConfig,
}

impl TestEnv {
    /// Creates an environment with fast polling defaults.
    pub async fn new() -> Result<Self> {
        TestEnvBuilder::new().build().await
    }

    /// The shared in-memory store.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// The clock handed to every hub.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Hub configuration used by [`TestEnv::hub`].
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Absolute URL of `path` on the mock server.
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        Url::parse(&format!("{}{path}", self.server.uri()))
            .with_context(|| format!("invalid endpoint path {path}"))
    }

    /// Builds an unstarted hub process over the shared store.
    pub fn hub(&self, manifest: Manifest) -> Result<Hub> {
        Hub::new(manifest, Arc::new(self.store.clone()), self.clock.clone(), self.config.clone())
            .context("failed to build hub")
    }

    /// Number of requests the mock server has received.
    pub async fn received_count(&self) -> usize {
        self.server.received_requests().await.map_or(0, |requests| requests.len())
    }

    /// Polls `condition` every 10ms until it holds or `timeout` elapses.
    pub async fn wait_until<F, Fut>(&self, timeout: Duration, mut condition: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        tokio::time::timeout(timeout, async {
            while !condition().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .with_context(|| format!("condition not reached within {timeout:?}"))
    }

    fn from_parts(server: MockServer, config: HubConfig) -> Self {
        Self {
            server,
            store: MemoryStore::new(),
            clock: Arc::new(RealClock::new()),
            config,
        }
    }
}
