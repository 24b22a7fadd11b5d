//! Delivery transport.
//!
//! The dispatcher never talks HTTP directly; it hands a [`TransportRequest`] to a
//! [`Transport`] and turns whatever comes back into a [`DeliveryOutcome`].
//! Production wiring uses [`HttpTransport`]; tests use [`ScriptedTransport`].
//!
//! A transport failure is an outcome, not an error: [`deliver`] always returns a
//! `DeliveryOutcome`, folding timeouts and connection errors into
//! `success = false`.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use uuid::Uuid;

/// Maximum characters of a response body kept on a delivery
pub const BODY_SNIPPET_LEN: usize = 512;

/// Header carrying the event type
pub const EVENT_HEADER: &str = "X-Hookdesk-Event";
/// Header carrying the delivery id (absent on test sends)
pub const DELIVERY_HEADER: &str = "X-Hookdesk-Delivery";

/// Transport-level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The call did not complete within the attempt timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Could not reach the target
    #[error("connection failed: {0}")]
    Connect(String),

    /// Any other client-side failure
    #[error("request failed: {0}")]
    Request(String),
}

/// One outbound call
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    /// Raw target URL
    pub url: String,
    /// JSON body
    pub payload: serde_json::Value,
    /// Custom webhook headers
    pub headers: BTreeMap<String, String>,
    /// Event type, sent as [`EVENT_HEADER`]
    pub event_type: String,
    /// Delivery id, sent as [`DELIVERY_HEADER`]
    pub delivery_id: Option<Uuid>,
}

/// What the target answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status
    pub status_code: u16,
    /// Response body (may be truncated by the transport)
    pub body: String,
}

impl TransportResponse {
    /// 2xx responses count as delivered
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Pluggable delivery mechanism
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Perform one call. Must not retry internally.
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// Result of one attempt, as reported to API callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOutcome {
    /// Whether the target accepted the delivery
    pub success: bool,
    /// HTTP status, if a response arrived
    pub status_code: Option<u16>,
    /// Truncated response body, or the transport error
    pub body_snippet: Option<String>,
    /// Wall time of the attempt
    pub duration_ms: u64,
    /// Transport error, if no response arrived
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run one send under `limit` and classify the result
pub async fn deliver(
    transport: &dyn Transport,
    request: &TransportRequest,
    limit: Duration,
) -> DeliveryOutcome {
    let start = Instant::now();
    let result = match timeout(limit, transport.send(request)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(limit)),
    };
    let duration_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(response) => DeliveryOutcome {
            success: response.is_success(),
            status_code: Some(response.status_code),
            body_snippet: Some(truncate(&response.body)),
            duration_ms,
            error: None,
        },
        Err(e) => DeliveryOutcome {
            success: false,
            status_code: None,
            body_snippet: Some(truncate(&e.to_string())),
            duration_ms,
            error: Some(e.to_string()),
        },
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(BODY_SNIPPET_LEN).collect()
}

// ============================================================================
// HTTP
// ============================================================================

/// reqwest-backed transport: POSTs the payload as JSON
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a client whose own timeout matches the attempt timeout
    pub fn new(request_timeout: Duration) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("hookdesk/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| crate::Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .post(&request.url)
            .header(EVENT_HEADER, &request.event_type)
            .json(&request.payload);
        if let Some(delivery_id) = request.delivery_id {
            builder = builder.header(DELIVERY_HEADER, delivery_id.to_string());
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(classify)?;
        let status_code = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        Ok(TransportResponse { status_code, body })
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    // URLs can carry tokens; strip them before the error reaches logs or records
    let e = e.without_url();
    if e.is_timeout() {
        TransportError::Request(format!("timed out: {e}"))
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Request(e.to_string())
    }
}

// ============================================================================
// Scripted
// ============================================================================

/// One scripted reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scripted {
    /// Answer with a status and body
    Respond(u16, String),
    /// Fail without a response
    Fail(TransportError),
    /// Never answer (exercises the attempt timeout)
    Hang,
}

/// Deterministic transport: replays queued replies in order, then a fallback
#[derive(Debug)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Scripted,
    requests: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    /// Transport that answers 200 once the script runs out
    pub fn new() -> Self {
        Self::with_fallback(Scripted::Respond(200, "ok".to_string()))
    }

    /// Transport with an explicit fallback reply
    pub fn with_fallback(fallback: Scripted) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply
    pub fn push(&self, reply: Scripted) -> &Self {
        self.script.lock().push_back(reply);
        self
    }

    /// Queue a status-only reply
    pub fn push_status(&self, status_code: u16) -> &Self {
        self.push(Scripted::Respond(status_code, String::new()))
    }

    /// Every request seen so far
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().clone()
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        self.requests.lock().push(request.clone());
        let reply = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match reply {
            Scripted::Respond(status_code, body) => Ok(TransportResponse { status_code, body }),
            Scripted::Fail(e) => Err(e),
            Scripted::Hang => {
                std::future::pending::<()>().await;
                Err(TransportError::Request("unreachable".to_string()))
            }
        }
    }
}
