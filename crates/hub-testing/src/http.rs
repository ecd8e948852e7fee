//! Subscriber endpoint doubles.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use hub_delivery::client::ATTEMPT_HEADER;
use wiremock::{Request, Respond, ResponseTemplate};

/// A request received by a [`RecordingResponder`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// When the request arrived.
    pub received_at: Instant,
    /// Request path.
    pub path: String,
    /// Value of the attempt header, `None` when absent or malformed.
    pub attempt: Option<u32>,
    /// JSON body, `Null` when the body is not JSON.
    pub body: serde_json::Value,
}

/// Wiremock responder that records every arrival and answers with a fixed
/// status after an optional delay.
#[derive(Debug, Clone)]
pub struct RecordingResponder {
    status: u16,
    delay: Option<Duration>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl RecordingResponder {
    /// Responder answering `status` immediately.
    pub fn new(status: u16) -> Self {
        Self { status, delay: None, requests: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Delays every response by `delay`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Requests recorded so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().map(|requests| requests.clone()).unwrap_or_default()
    }

    /// Number of requests recorded so far.
    pub fn count(&self) -> usize {
        self.requests.lock().map(|requests| requests.len()).unwrap_or_default()
    }

    /// Most requests the endpoint was serving at once.
    ///
    /// A request is served from its arrival until its delayed response goes
    /// out, so without a delay every request stands alone.
    pub fn peak_concurrency(&self) -> usize {
        let arrivals: Vec<Instant> = self.requests().iter().map(|r| r.received_at).collect();
        let delay = self.delay.unwrap_or_default();
        arrivals
            .iter()
            .map(|at| {
                arrivals
                    .iter()
                    .filter(|other| **other <= *at && *at < **other + delay)
                    .count()
                    .max(1)
            })
            .max()
            .unwrap_or(0)
    }
}

impl Respond for RecordingResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let attempt = request
            .headers
            .get(ATTEMPT_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok());

        let recorded = RecordedRequest {
            received_at: Instant::now(),
            path: request.url.path().to_string(),
            attempt,
            body: serde_json::from_slice(&request.body).unwrap_or(serde_json::Value::Null),
        };
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(recorded);
        }

        let response = ResponseTemplate::new(self.status);
        match self.delay {
            Some(delay) => response.set_delay(delay),
            None => response,
        }
    }
}
