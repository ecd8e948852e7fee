//! Distributed concurrency control without leader election.
//!
//! Every hub process serving a subscriber periodically stamps its identity
//! into that subscriber's liveness set, counts the peers whose stamp falls
//! in the last polling window and sets its own inbound queue limit to
//! `concurrency / alive`. Peers that stop reporting age out of the window;
//! nothing is ever deleted from the set.
//!
//! Counting is approximate during membership changes: for up to one polling
//! interval the cluster-wide total may over- or undershoot the target.

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use hub_core::{time::duration_to_millis, Clock, CoordinationStore, ProcessId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{error::Result, queue::Queue};

/// Default interval between rebalance ticks.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(5000);

/// Default allowance for peers whose clock runs slightly ahead.
pub const DEFAULT_SKEW_GUARD: Duration = Duration::from_millis(1);

/// Liveness set key of a service.
pub fn liveness_key(service: &str) -> String {
    format!("hub_{service}_alive")
}

/// Timing of the rebalance loop.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyConfig {
    /// Interval between ticks, also the width of the liveness window.
    pub polling_interval: Duration,
    /// How far into the future a peer's stamp may lie and still count.
    pub skew_guard: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { polling_interval: DEFAULT_POLLING_INTERVAL, skew_guard: DEFAULT_SKEW_GUARD }
    }
}

/// Lifecycle of a [`ConcurrencyManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Constructed, loop not started.
    Created,
    /// Loop ticking.
    Running,
    /// Stop requested, waiting for the current tick.
    Stopping,
    /// Loop finished; terminal.
    Stopped,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

struct Rebalancer {
    service: String,
    concurrency: f64,
    liveness_key: String,
    process_id: ProcessId,
    queue: Queue,
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    config: ConcurrencyConfig,
}

impl Rebalancer {
    async fn report_alive(&self) {
        let now = self.clock.now_millis();
        if let Err(error) =
            self.store.upsert_member(&self.liveness_key, self.process_id.as_str(), now).await
        {
            warn!(
                service = %self.service,
                process_id = %self.process_id,
                error = %error,
                "failed to report liveness"
            );
        }
    }

    async fn count_alive(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let min = now.saturating_sub(duration_to_millis(self.config.polling_interval));
        let max = now.saturating_add(duration_to_millis(self.config.skew_guard));

        let members = self.store.range_by_score(&self.liveness_key, min, max).await?;
        let alive = members.iter().collect::<HashSet<_>>().len();

        Ok(alive.max(1))
    }

    async fn rebalance(&self) -> Result<f64> {
        self.report_alive().await;
        let alive = self.count_alive().await?;

        #[allow(clippy::cast_precision_loss)]
        let share = self.concurrency / alive as f64;
        let limit = self.queue.set_concurrency(share);

        debug!(
            service = %self.service,
            alive_processes = alive,
            share,
            limit,
            "rebalanced concurrency"
        );
        Ok(share)
    }

    async fn run(&self, cancellation_token: CancellationToken) {
        loop {
            if let Err(error) = self.rebalance().await {
                warn!(
                    service = %self.service,
                    error = %error,
                    "rebalance skipped, keeping previous limit"
                );
            }

            tokio::select! {
                () = self.clock.sleep(self.config.polling_interval) => {},
                () = cancellation_token.cancelled() => break,
            }
        }
    }
}

/// Per-process, per-service concurrency controller.
pub struct ConcurrencyManager {
    rebalancer: Arc<Rebalancer>,
    state: Mutex<ManagerState>,
    cancellation_token: CancellationToken,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ConcurrencyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyManager")
            .field("service", &self.rebalancer.service)
            .field("process_id", &self.rebalancer.process_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConcurrencyManager {
    /// Creates a manager splitting `concurrency` across the live processes
    /// serving `service`, applying this process's share to `queue`.
    pub fn new(
        service: impl Into<String>,
        concurrency: f64,
        process_id: ProcessId,
        queue: Queue,
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        config: ConcurrencyConfig,
    ) -> Self {
        let service = service.into();
        Self {
            rebalancer: Arc::new(Rebalancer {
                liveness_key: liveness_key(&service),
                service,
                concurrency,
                process_id,
                queue,
                store,
                clock,
                config,
            }),
            state: Mutex::new(ManagerState::Created),
            cancellation_token: CancellationToken::new(),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Service this manager controls.
    pub fn service(&self) -> &str {
        &self.rebalancer.service
    }

    /// Identity this process reports under.
    pub fn process_id(&self) -> &ProcessId {
        &self.rebalancer.process_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamps this process into the service's liveness set.
    ///
    /// Store failures are logged, never returned.
    pub async fn report_alive(&self) {
        self.rebalancer.report_alive().await;
    }

    /// Number of distinct processes seen within the last polling interval,
    /// never less than one.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the liveness set cannot be read.
    pub async fn count_alive(&self) -> Result<usize> {
        self.rebalancer.count_alive().await
    }

    /// Runs one tick: report, count, apply `concurrency / alive` to the
    /// queue. Returns the computed share.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if counting fails; the queue keeps its
    /// previous limit.
    pub async fn rebalance(&self) -> Result<f64> {
        self.rebalancer.rebalance().await
    }

    /// Starts the rebalance loop. The first tick runs immediately.
    ///
    /// Starting a running manager does nothing; a stopped manager stays
    /// stopped.
    pub async fn start(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != ManagerState::Created {
                debug!(service = %self.rebalancer.service, state = %*state, "start ignored");
                return;
            }
            *state = ManagerState::Running;
        }

        info!(
            service = %self.rebalancer.service,
            process_id = %self.rebalancer.process_id,
            polling_interval_ms = self.rebalancer.config.polling_interval.as_millis(),
            "starting concurrency manager"
        );

        let rebalancer = self.rebalancer.clone();
        let cancellation_token = self.cancellation_token.clone();
        let handle = tokio::spawn(async move { rebalancer.run(cancellation_token).await });
        *self.handle.lock().await = Some(handle);
    }

    /// Stops the loop, letting an in-flight tick finish. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                ManagerState::Created => {
                    *state = ManagerState::Stopped;
                    return;
                },
                ManagerState::Running => *state = ManagerState::Stopping,
                ManagerState::Stopping | ManagerState::Stopped => {},
            }
        }

        self.cancellation_token.cancel();

        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(join_error) = handle.await {
                warn!(
                    service = %self.rebalancer.service,
                    error = %join_error,
                    "concurrency manager task ended abnormally"
                );
            }
            info!(service = %self.rebalancer.service, "concurrency manager stopped");
        }

        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = ManagerState::Stopped;
    }
}

impl Drop for ConcurrencyManager {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}
