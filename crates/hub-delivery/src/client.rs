//! HTTP client performing the outbound delivery call.
//!
//! One POST per attempt, JSON payload as body, hub metadata in headers.
//! The client only reports what happened; classifying the outcome and
//! deciding about retries belongs to the consumer and the scheduler.

use std::time::{Duration, Instant};

use hub_core::{Envelope, MessageId, MessageType};
use reqwest::Response;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};
use url::Url;

use crate::error::{DeliveryError, Result};

/// Header carrying the published message id.
pub const MESSAGE_ID_HEADER: &str = "X-Hub-Message-Id";
/// Header carrying the message type.
pub const MESSAGE_TYPE_HEADER: &str = "X-Hub-Message-Type";
/// Header carrying the 0-based attempt number.
pub const ATTEMPT_HEADER: &str = "X-Hub-Attempt";

const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;
const MAX_LOGGED_BODY_SIZE: usize = 1024;

/// Configuration for the delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-call timeout.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: concat!("hub/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 3,
            verify_tls: true,
        }
    }
}

/// Pooled HTTP client shared by every delivery consumer of a process.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// One delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Subscribing service the call is made for.
    pub service: String,
    /// Destination URL.
    pub url: Url,
    /// Published message id.
    pub message_id: MessageId,
    /// Message type.
    pub message_type: MessageType,
    /// JSON body.
    pub payload: serde_json::Value,
    /// 0-based attempt number.
    pub attempt: u32,
}

impl DeliveryRequest {
    /// Builds the request delivering `envelope` to `url` for `service`.
    pub fn for_envelope(service: impl Into<String>, url: Url, envelope: &Envelope) -> Self {
        Self {
            service: service.into(),
            url,
            message_id: envelope.id,
            message_type: envelope.message_type.clone(),
            payload: envelope.payload.clone(),
            attempt: envelope.attempt,
        }
    }
}

/// Response from a delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, truncated.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
    /// Whether the status was 2xx.
    pub is_success: bool,
}

impl DeliveryResponse {
    /// Turns a non-2xx response into a retryable error.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::HttpStatus` unless the status is 2xx.
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success {
            Ok(self)
        } else {
            Err(DeliveryError::http_status(self.status_code, self.body))
        }
    }
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built with the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// See [`DeliveryClient::new`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Posts the payload to the subscriber endpoint.
    ///
    /// Any HTTP response, including non-2xx, is returned as `Ok`.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the call exceeds the configured timeout
    /// - `Network` for connection and transport failures
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let start_time = Instant::now();

        let span = info_span!(
            "hub_delivery",
            service = %request.service,
            message_id = %request.message_id,
            message_type = %request.message_type,
            url = %request.url,
            attempt = request.attempt
        );

        async move {
            tracing::debug!("posting message to subscriber");

            let result = self
                .client
                .post(request.url.clone())
                .json(&request.payload)
                .header(MESSAGE_ID_HEADER, request.message_id.to_string())
                .header(MESSAGE_TYPE_HEADER, request.message_type.as_str())
                .header(ATTEMPT_HEADER, request.attempt.to_string())
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), "request failed: {}", e);

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let delivery_response = read_response(response, start_time).await;

            if delivery_response.is_success {
                tracing::debug!(
                    status = delivery_response.status_code,
                    duration_ms = delivery_response.duration.as_millis(),
                    "subscriber accepted message"
                );
            } else {
                tracing::warn!(
                    status = delivery_response.status_code,
                    duration_ms = delivery_response.duration.as_millis(),
                    "subscriber rejected message"
                );
            }

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }
}

async fn read_response(response: Response, start_time: Instant) -> DeliveryResponse {
    let status_code = response.status().as_u16();
    let is_success = response.status().is_success();

    let body = match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_RESPONSE_BODY_SIZE => {
            let truncated = String::from_utf8_lossy(&bytes[..MAX_LOGGED_BODY_SIZE]);
            format!("{truncated}... (truncated)")
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::warn!("failed to read response body: {}", e);
            format!("[failed to read response body: {e}]")
        },
    };

    DeliveryResponse { status_code, body, duration: start_time.elapsed(), is_success }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn request_to(server: &MockServer) -> (Envelope, DeliveryRequest) {
        let envelope = Envelope::new("order.created", json!({"order": 42}), Utc::now());
        let url = Url::parse(&format!("{}/webhook", server.uri())).unwrap();
        let request = DeliveryRequest::for_envelope("billing", url, &envelope);
        (envelope, request)
    }

    #[tokio::test]
    async fn posts_payload_with_metadata_headers() {
        let server = MockServer::start().await;
        let (envelope, request) = request_to(&server);

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/webhook"))
            .and(matchers::header(MESSAGE_ID_HEADER, envelope.id.to_string().as_str()))
            .and(matchers::header(MESSAGE_TYPE_HEADER, "order.created"))
            .and(matchers::header(ATTEMPT_HEADER, "0"))
            .and(matchers::body_json(json!({"order": 42})))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .expect(1)
            .mount(&server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.deliver(request).await.unwrap();

        assert_eq!(response.status_code, 200);
        assert!(response.is_success);
        assert_eq!(response.body, "OK");
    }

    #[tokio::test]
    async fn non_success_status_is_returned_then_classified() {
        let server = MockServer::start().await;
        let (_, request) = request_to(&server);

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.deliver(request).await.unwrap();
        assert!(!response.is_success);

        let err = response.error_for_status().unwrap_err();
        assert!(matches!(err, DeliveryError::HttpStatus { status_code: 503, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn slow_subscriber_times_out() {
        let server = MockServer::start().await;
        let (_, request) = request_to(&server);

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = DeliveryClient::new(ClientConfig {
            timeout: Duration::from_millis(50),
            ..ClientConfig::default()
        })
        .unwrap();

        let err = client.deliver(request).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Timeout { .. }));
    }

    #[tokio::test]
    async fn unreachable_subscriber_is_network_error() {
        let envelope = Envelope::new("order.created", json!(null), Utc::now());
        let url = Url::parse("http://127.0.0.1:1/webhook").unwrap();
        let request = DeliveryRequest::for_envelope("billing", url, &envelope);

        let client = DeliveryClient::with_defaults().unwrap();
        let err = client.deliver(request).await.unwrap_err();

        assert!(matches!(err, DeliveryError::Network { .. }));
    }
}
