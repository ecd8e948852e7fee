//! HTTP API of the message hub.
//!
//! Publishers post messages here; operators read health and dead letters.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod server;

use std::sync::Arc;

use hub_core::Clock;
use hub_delivery::Hub;

pub use config::{Config, StoreBackend};
pub use server::{create_router, shutdown_signal, start_server};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// The hub process serving this API.
    pub hub: Arc<Hub>,
    /// Clock used for response timestamps.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Creates handler state over a hub and clock.
    pub fn new(hub: Arc<Hub>, clock: Arc<dyn Clock>) -> Self {
        Self { hub, clock }
    }
}
