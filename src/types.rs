use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Deadline applied to a single delivery attempt when the task does
/// not carry one of its own.
pub const DEFAULT_DISPATCH_DEADLINE: Duration = Duration::from_secs(60);

/// Unique identifier for a task.
///
/// This is a strongly-typed wrapper to avoid accidental mixing of
/// task ids with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        TaskId(value.to_string())
    }
}

/// Where and what to deliver: URL, extra headers and a JSON body.
///
/// An empty URL is filled in from the queue's configured default at
/// admission time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryTarget {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: serde_json::Value,
}

/// A unit of work, immutable once admitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier; re-admission while this id is still in the
    /// backlog or a slot is rejected.
    pub id: TaskId,

    /// Delivery destination.
    pub target: DeliveryTarget,

    /// Optional requested execution time, epoch milliseconds. Carried
    /// through to the target as the scheduling (ETA) header.
    pub schedule_time: Option<u64>,

    /// Bound on a single delivery attempt. Defaults to 60 seconds.
    pub dispatch_deadline: Option<Duration>,
}

impl Task {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: TaskId(id.into()),
            target: DeliveryTarget::default(),
            schedule_time: None,
            dispatch_deadline: None,
        }
    }

    /// Set the delivery URL. Leave unset to use the queue default.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.target.url = url.into();
        self
    }

    /// Add a delivery header. Task headers override the engine's
    /// computed headers on name collision.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.target.headers.insert(name.into(), value.into());
        self
    }

    /// Set the JSON body posted to the target.
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.target.body = body;
        self
    }

    /// Set the requested execution time (epoch milliseconds).
    pub fn with_schedule_time(mut self, epoch_ms: u64) -> Self {
        self.schedule_time = Some(epoch_ms);
        self
    }

    /// Bound a single delivery attempt.
    pub fn with_dispatch_deadline(mut self, deadline: Duration) -> Self {
        self.dispatch_deadline = Some(deadline);
        self
    }

    pub(crate) fn deadline(&self) -> Duration {
        self.dispatch_deadline.unwrap_or(DEFAULT_DISPATCH_DEADLINE)
    }
}

/// Parse a wire-format deadline such as `"60s"`.
pub fn parse_deadline(raw: &str) -> Option<Duration> {
    let secs = raw.strip_suffix('s')?.parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

/// Lifecycle of a task occupying a dispatch slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    NotStarted,
    Running,
    Retry,
    Failed,
    Finished,
}

/// Per-task dispatch state, owned by the queue. One instance exists
/// per admitted task and lives as long as the task holds its slot.
#[derive(Debug, Clone)]
pub struct DispatchMetadata {
    pub status: TaskStatus,

    /// 1-based attempt counter; only ever increases.
    pub current_attempt: u32,

    /// Backoff applied before the next attempt.
    pub current_backoff_secs: f64,

    /// Set when the task enters its slot; bounds the wall-clock retry
    /// budget.
    pub start_time: Instant,

    /// Completion time of the most recent failed attempt. Guards
    /// against re-dispatching before the backoff window has elapsed.
    pub last_run_time: Option<Instant>,

    /// Last non-2xx HTTP status, surfaced to the target on retry.
    pub previous_response_status: Option<u16>,

    /// Attempts that received a definitive (non-5xx) response.
    pub execution_count: u32,
}

impl DispatchMetadata {
    pub(crate) fn for_admission(now: Instant) -> Self {
        Self {
            status: TaskStatus::NotStarted,
            current_attempt: 1,
            current_backoff_secs: 0.0,
            start_time: now,
            last_run_time: None,
            previous_response_status: None,
            execution_count: 0,
        }
    }
}

/// Dispatch rate and concurrency ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimits {
    pub max_dispatches_per_second: f64,
    pub max_concurrent_dispatches: usize,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            max_dispatches_per_second: 500.0,
            max_concurrent_dispatches: 1000,
        }
    }
}

/// Retry policy for failed delivery attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempt budget, including the first attempt.
    pub max_attempts: u32,

    /// Optional wall-clock cap on retrying, measured from the task's
    /// first dispatch. `None` or `Some(0)` means no cap.
    pub max_retry_seconds: Option<u64>,

    pub min_backoff_seconds: f64,
    pub max_backoff_seconds: f64,

    /// Backoff doubles this many times, then grows linearly.
    pub max_doublings: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            max_retry_seconds: None,
            min_backoff_seconds: 0.1,
            max_backoff_seconds: 3600.0,
            max_doublings: 16,
        }
    }
}

/// Full configuration for one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub rate_limits: RateLimits,
    pub retry_config: RetryConfig,

    /// Delivery URL applied to tasks admitted without one.
    pub default_delivery_url: String,

    /// Backlog bound; admission beyond this fails.
    pub backlog_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            rate_limits: RateLimits::default(),
            retry_config: RetryConfig::default(),
            default_delivery_url: String::new(),
            backlog_capacity: 10_000,
        }
    }
}

impl QueueConfig {
    pub fn with_rate_limits(mut self, rate_limits: RateLimits) -> Self {
        self.rate_limits = rate_limits;
        self
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    pub fn with_default_delivery_url(mut self, url: impl Into<String>) -> Self {
        self.default_delivery_url = url.into();
        self
    }

    pub fn with_backlog_capacity(mut self, capacity: usize) -> Self {
        self.backlog_capacity = capacity;
        self
    }
}

/// Windowed counters plus instantaneous queue state, for observability
/// only.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatistics {
    pub backlog_size: usize,

    /// Tasks admitted over the trailing 5 minutes.
    pub tasks_added: usize,

    /// Tasks that ended in terminal failure over the trailing 5 minutes.
    pub tasks_failed: usize,

    /// Tasks that left their slot (finished or failed) over the
    /// trailing minute.
    pub tasks_completed: usize,

    pub tokens: f64,
    pub max_dispatches_per_second: f64,
    pub max_concurrent_dispatches: usize,
}

/// Point-in-time view of queue internals, for diagnostics.
#[derive(Debug, Clone)]
pub struct DebugSnapshot {
    pub backlog_size: usize,
    pub active: bool,
    pub tokens: f64,

    /// Task id per slot, `None` for free slots.
    pub slots: Vec<Option<TaskId>>,

    /// Indices of the free slots.
    pub free_slots: Vec<usize>,
}
