//! Network sender: one transmission attempt per call.

use crate::rate_limit::FailureClass;
use crate::{EventId, TransportResult};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Content type of JSON encoded events.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A serialized event ready to go over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub event_id: EventId,
    pub content_type: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl OutboundRequest {
    pub fn json(event_id: EventId, body: Vec<u8>) -> Self {
        Self {
            event_id,
            content_type: JSON_CONTENT_TYPE.to_string(),
            headers: BTreeMap::new(),
            body,
        }
    }
}

/// A failure worth retrying later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryableFailure {
    pub class: FailureClass,
    pub reason: String,
    /// Server-requested delay before the next attempt.
    pub retry_after: Option<Duration>,
}

/// A failure that will not improve with retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermanentFailure {
    pub status: Option<u16>,
    pub reason: String,
}

/// Result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Success,
    Retryable(RetryableFailure),
    Permanent(PermanentFailure),
}

impl AttemptResult {
    pub fn retryable(class: FailureClass, reason: impl Into<String>) -> Self {
        Self::Retryable(RetryableFailure {
            class,
            reason: reason.into(),
            retry_after: None,
        })
    }

    pub fn permanent(status: Option<u16>, reason: impl Into<String>) -> Self {
        Self::Permanent(PermanentFailure {
            status,
            reason: reason.into(),
        })
    }
}

/// Performs a single network attempt.
///
/// Implementations must not retry internally and must enforce their own
/// deadline, reporting it as a retryable failure.
#[async_trait]
pub trait NetworkSender: Send + Sync {
    async fn attempt(&self, request: OutboundRequest) -> AttemptResult;
}

/// HTTP sender configuration.
#[derive(Debug, Clone)]
pub struct HttpSenderConfig {
    /// Collector URL events are POSTed to.
    pub endpoint: String,
    /// Bearer token, if the collector requires one.
    pub auth_token: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpSenderConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/api/events".to_string(),
            auth_token: None,
            timeout_secs: 30,
            user_agent: concat!("event-transport/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// [`NetworkSender`] that POSTs each event to an HTTP collector.
pub struct HttpSender {
    config: HttpSenderConfig,
    client: Client,
}

impl HttpSender {
    pub fn new(config: HttpSenderConfig) -> TransportResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self { config, client })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }
}

#[async_trait]
impl NetworkSender for HttpSender {
    async fn attempt(&self, request: OutboundRequest) -> AttemptResult {
        let start = Instant::now();
        let event_id = request.event_id;

        let mut http_request = self
            .client
            .post(&self.config.endpoint)
            .header("content-type", &request.content_type);

        for (key, value) in &request.headers {
            if !is_managed_header(key) {
                http_request = http_request.header(key.as_str(), value.as_str());
            }
        }
        if let Some(token) = &self.config.auth_token {
            http_request = http_request.bearer_auth(token);
        }

        let response = match http_request.body(request.body).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    event_id = %event_id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    error = %e,
                    "Event request failed"
                );
                return classify_transport_error(&e);
            }
        };

        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        debug!(
            event_id = %event_id,
            status,
            duration_ms = start.elapsed().as_millis() as u64,
            "Collector responded"
        );

        classify_status(status, retry_after)
    }
}

/// Map an HTTP status to an attempt result.
pub fn classify_status(status: u16, retry_after: Option<Duration>) -> AttemptResult {
    match status {
        200..=299 => AttemptResult::Success,
        429 => AttemptResult::Retryable(RetryableFailure {
            class: FailureClass::RateLimited,
            reason: "HTTP 429".to_string(),
            retry_after,
        }),
        408 | 500..=599 => AttemptResult::Retryable(RetryableFailure {
            class: FailureClass::ServerError,
            reason: format!("HTTP {status}"),
            retry_after,
        }),
        _ => AttemptResult::permanent(Some(status), format!("HTTP {status}")),
    }
}

fn classify_transport_error(e: &reqwest::Error) -> AttemptResult {
    if e.is_connect() {
        AttemptResult::retryable(
            FailureClass::NoConnectivity,
            format!("connection failed: {e}"),
        )
    } else if e.is_timeout() {
        AttemptResult::retryable(FailureClass::NetworkFailure, format!("timed out: {e}"))
    } else if e.is_builder() {
        // Bad URL or header: retrying sends the same broken request.
        AttemptResult::permanent(None, format!("invalid request: {e}"))
    } else {
        AttemptResult::retryable(FailureClass::NetworkFailure, e.to_string())
    }
}

/// Headers the HTTP client owns; never copied from the request.
fn is_managed_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "content-length"
            | "content-type"
            | "host"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Read `Retry-After` as delta-seconds or an HTTP-date.
///
/// Unparseable or past values yield `None`, leaving the backoff policy alone.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    at.with_timezone(&chrono::Utc)
        .signed_duration_since(chrono::Utc::now())
        .to_std()
        .ok()
}
