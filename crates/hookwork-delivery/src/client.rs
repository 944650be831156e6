//! HTTP transport for callback delivery.
//!
//! Redirects are never followed and, for hostnames, the connection is pinned
//! to the addresses the guard just vetted.

use std::{fmt, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use hookwork_core::RequestId;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{DeliveryError, Result};

/// Header carrying the request ID on every callback.
pub const REQUEST_ID_HEADER: &str = "x-hookwork-request-id";

/// Header carrying the 1-based attempt number.
pub const ATTEMPT_HEADER: &str = "x-hookwork-attempt";

/// Response bodies longer than this are truncated in errors and logs.
const MAX_BODY_EXCERPT: usize = 1024;

/// Configuration for the callback HTTP client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// User agent sent with callbacks.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: concat!("hookwork/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// A single callback POST.
#[derive(Debug, Clone)]
pub struct CallbackRequest {
    /// Request the callback belongs to.
    pub request_id: RequestId,
    /// Target URL.
    pub url: String,
    /// JSON payload.
    pub body: Bytes,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Addresses vetted by the guard for this attempt.
    pub addrs: Vec<SocketAddr>,
}

/// Receiver's answer to a callback POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body excerpt.
    pub body: String,
    /// Round-trip time.
    pub duration: Duration,
}

impl DeliveryResponse {
    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Sends callback POSTs.
#[async_trait]
pub trait CallbackTransport: Send + Sync + fmt::Debug {
    /// Posts `request` once.
    ///
    /// Returns the response for any status; only transport failures are
    /// errors.
    async fn post(&self, request: &CallbackRequest) -> Result<DeliveryResponse>;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpTransport {
    /// Creates a transport with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Self::builder(&config).build().map_err(|e| {
            DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
        })?;
        Ok(Self { client, config })
    }

    /// Creates a transport with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the client cannot be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    fn builder(config: &ClientConfig) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
    }

    // Hostname targets get a one-off client whose resolver only knows the
    // vetted addresses.
    fn client_for(&self, url: &Url, addrs: &[SocketAddr]) -> Result<reqwest::Client> {
        let domain = url.domain().filter(|_| !addrs.is_empty());
        let Some(domain) = domain else {
            return Ok(self.client.clone());
        };

        Self::builder(&self.config)
            .resolve_to_addrs(domain, addrs)
            .build()
            .map_err(|e| DeliveryError::network(format!("failed to build pinned HTTP client: {e}")))
    }
}

#[async_trait]
impl CallbackTransport for HttpTransport {
    async fn post(&self, request: &CallbackRequest) -> Result<DeliveryResponse> {
        let span = info_span!(
            "callback_post",
            request_id = %request.request_id,
            attempt = request.attempt,
        );

        async move {
            let url = Url::parse(&request.url)
                .map_err(|e| DeliveryError::network(format!("invalid callback URL: {e}")))?;
            let client = self.client_for(&url, &request.addrs)?;
            let started = std::time::Instant::now();

            let response = client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(REQUEST_ID_HEADER, request.request_id.to_string())
                .header(ATTEMPT_HEADER, request.attempt.to_string())
                .body(request.body.clone())
                .send()
                .await
                .map_err(|e| {
                    warn!(error = %e, "callback request failed");
                    if e.is_timeout() {
                        let timeout_ms =
                            u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX);
                        DeliveryError::timeout(timeout_ms)
                    } else if e.is_connect() {
                        DeliveryError::network(format!("connection failed: {e}"))
                    } else {
                        DeliveryError::network(e.to_string())
                    }
                })?;

            let status_code = response.status().as_u16();
            let body = match response.bytes().await {
                Ok(bytes) => excerpt(&bytes),
                Err(e) => format!("[failed to read response body: {e}]"),
            };
            let duration = started.elapsed();

            debug!(status = status_code, duration_ms = duration.as_millis(), "callback response");
            Ok(DeliveryResponse { status_code, body, duration })
        }
        .instrument(span)
        .await
    }
}

fn excerpt(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_BODY_EXCERPT {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    format!("{}... (truncated)", String::from_utf8_lossy(&bytes[..MAX_BODY_EXCERPT]))
}
