use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::types::{DispatchMetadata, Task};

/// One outbound delivery, fully assembled by the engine.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,

    /// Bound on this attempt. The engine additionally enforces it with
    /// its own timer, so a transport that ignores the deadline still
    /// cannot hang a dispatch slot.
    pub deadline: Duration,
}

/// Why a delivery attempt produced no HTTP status at all.
///
/// Both variants are retryable; the engine never distinguishes them
/// beyond diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Timeout,
    Network(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "request timed out"),
            TransportError::Network(detail) => write!(f, "network error: {detail}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Issues a single outbound request and reports the status code, or a
/// transport error when no response was received.
///
/// The engine treats any status outside 200..=299 as a retryable
/// failure; the transport must not interpret status codes itself.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn deliver(&self, request: DeliveryRequest) -> Result<u16, TransportError>;
}

/// Build the header set carried on a dispatch attempt.
///
/// Task-supplied headers override the computed set on name collision;
/// the previous-response header is applied last and always reflects
/// the engine's own record.
pub(crate) fn build_dispatch_headers(
    queue_name: &str,
    task: &Task,
    metadata: &DispatchMetadata,
) -> Vec<(String, String)> {
    let eta = task.schedule_time.unwrap_or_else(now_millis);
    let mut headers = vec![
        ("Content-Type".to_string(), "application/json".to_string()),
        ("X-CloudTasks-QueueName".to_string(), queue_name.to_string()),
        ("X-CloudTasks-TaskName".to_string(), task.id.to_string()),
        (
            "X-CloudTasks-TaskRetryCount".to_string(),
            metadata.current_attempt.saturating_sub(1).to_string(),
        ),
        (
            "X-CloudTasks-TaskExecutionCount".to_string(),
            metadata.execution_count.to_string(),
        ),
        ("X-CloudTasks-TaskETA".to_string(), eta.to_string()),
    ];

    for (name, value) in &task.target.headers {
        set_header(&mut headers, name, value);
    }
    if let Some(status) = metadata.previous_response_status {
        set_header(&mut headers, "X-CloudTasks-TaskPreviousResponse", &status.to_string());
    }
    headers
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    match headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
        Some(entry) => entry.1 = value.to_string(),
        None => headers.push((name.to_string(), value.to_string())),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Real HTTP delivery over a shared `reqwest` client.
#[cfg(feature = "http")]
#[derive(Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl DeliveryTransport for HttpTransport {
    async fn deliver(&self, request: DeliveryRequest) -> Result<u16, TransportError> {
        let mut builder = self
            .client
            .post(&request.url)
            .timeout(request.deadline)
            .json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        match builder.send().await {
            Ok(response) => Ok(response.status().as_u16()),
            Err(err) if err.is_timeout() => Err(TransportError::Timeout),
            Err(err) => Err(TransportError::Network(err.to_string())),
        }
    }
}
