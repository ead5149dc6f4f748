use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::delivery::{build_dispatch_headers, DeliveryRequest, DeliveryTransport, TransportError};
use crate::error::{QueueError, StoreError};
use crate::store::OrderedStore;
use crate::types::{
    DebugSnapshot, DispatchMetadata, QueueConfig, QueueStatistics, RetryConfig, Task, TaskId,
    TaskStatus,
};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[cfg(feature = "tracing")]
fn trace_warn(message: String) {
    tracing::warn!("{message}");
}

#[cfg(not(feature = "tracing"))]
fn trace_warn(_message: String) {}

const ADDED_WINDOW: Duration = Duration::from_secs(5 * 60);
const FAILED_WINDOW: Duration = Duration::from_secs(5 * 60);
const COMPLETED_WINDOW: Duration = Duration::from_secs(60);

/// One occupied dispatch slot.
///
/// The metadata lock is the only state shared between the tick path
/// and an in-flight delivery; `Running` status doubles as the mutual
/// exclusion keeping at most one delivery per slot.
struct Slot {
    task: Arc<Task>,
    metadata: Arc<Mutex<DispatchMetadata>>,
}

/// Rate- and concurrency-bounded dispatcher for one queue.
///
/// The tick operations ([`refill_tokens`](Self::refill_tokens),
/// [`admit_ready`](Self::admit_ready),
/// [`advance_slots`](Self::advance_slots)) take `&mut self` and are
/// expected to run back-to-back on a single driver tick. In-flight
/// deliveries run concurrently with ticks but each mutates only its
/// own slot's metadata, under that slot's lock.
pub struct TaskQueue {
    name: String,
    config: QueueConfig,

    backlog: OrderedStore<Arc<Task>>,

    /// Ids currently in the backlog or a slot. Kept alongside the
    /// backlog index so duplicate admission is rejected while a task
    /// occupies a slot too.
    admitted: HashSet<TaskId>,

    slots: Vec<Option<Slot>>,
    free_slots: Vec<usize>,

    tokens: f64,
    max_tokens: f64,
    last_refill: Instant,

    transport: Arc<dyn DeliveryTransport>,

    added_times: VecDeque<Instant>,
    completed_times: VecDeque<Instant>,
    failed_times: VecDeque<Instant>,
}

impl TaskQueue {
    pub fn new(
        name: impl Into<String>,
        config: QueueConfig,
        transport: Arc<dyn DeliveryTransport>,
    ) -> Self {
        let slot_count = config.rate_limits.max_concurrent_dispatches.max(1);
        let mut slots = Vec::with_capacity(slot_count);
        slots.resize_with(slot_count, || None);

        Self {
            backlog: OrderedStore::new(config.backlog_capacity),
            admitted: HashSet::new(),
            slots,
            free_slots: (0..slot_count).collect(),
            tokens: 0.0,
            // A floor slightly above one token keeps a very low
            // configured rate from starving at small time increments.
            max_tokens: config.rate_limits.max_dispatches_per_second.max(1.1),
            last_refill: Instant::now(),
            transport,
            added_times: VecDeque::new(),
            completed_times: VecDeque::new(),
            failed_times: VecDeque::new(),
            name: name.into(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Admit a task into the backlog.
    ///
    /// Rejects duplicates (anywhere in backlog or slots) and admission
    /// beyond capacity; neither mutates any state. An empty target URL
    /// is defaulted from the queue configuration.
    pub fn enqueue(&mut self, mut task: Task) -> Result<(), QueueError> {
        if self.admitted.contains(&task.id) {
            metric_inc("taskqueue.enqueue.duplicate");
            return Err(QueueError::DuplicateId { id: task.id });
        }
        if task.target.url.is_empty() {
            task.target.url = self.config.default_delivery_url.clone();
        }

        let id = task.id.clone();
        self.backlog
            .push_back(id.clone(), Arc::new(task))
            .map_err(|err| match err {
                StoreError::DuplicateId => QueueError::DuplicateId { id: id.clone() },
                _ => QueueError::CapacityExceeded {
                    capacity: self.backlog.capacity(),
                },
            })?;

        self.admitted.insert(id);
        self.added_times.push_back(Instant::now());
        metric_inc("taskqueue.enqueue.accepted");
        Ok(())
    }

    /// Cancel a task still in the backlog.
    ///
    /// A task already occupying a dispatch slot is past the point of
    /// cancellation and reports `NotFound`.
    pub fn cancel(&mut self, id: &TaskId) -> Result<(), QueueError> {
        match self.backlog.remove(id) {
            Ok(_) => {
                self.admitted.remove(id);
                metric_inc("taskqueue.cancelled");
                Ok(())
            }
            Err(_) => Err(QueueError::NotFound { id: id.clone() }),
        }
    }

    /// Credit tokens for the wall-clock time since the last refill,
    /// clamped to the bucket ceiling.
    pub fn refill_tokens(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let credit = elapsed * self.config.rate_limits.max_dispatches_per_second;
        self.tokens = (self.tokens + credit).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Move backlog heads into free slots while a slot and a whole
    /// token are both available, one token per admission.
    pub fn admit_ready(&mut self) {
        while !self.backlog.is_empty() && self.tokens >= 1.0 {
            let Some(slot_index) = self.free_slots.pop() else {
                break;
            };
            let task = match self.backlog.pop_front() {
                Ok(task) => task,
                Err(_) => {
                    self.free_slots.push(slot_index);
                    break;
                }
            };
            self.slots[slot_index] = Some(Slot {
                task,
                metadata: Arc::new(Mutex::new(DispatchMetadata::for_admission(Instant::now()))),
            });
            self.tokens -= 1.0;
            metric_inc("taskqueue.admitted");
        }
    }

    /// Advance every occupied slot one step through the state machine.
    ///
    /// Terminal tasks free their slot; idle tasks start an in-flight
    /// delivery; tasks due for retry are re-armed or failed. Delivery
    /// failures never propagate out of this call.
    pub async fn advance_slots(&mut self) {
        let now = Instant::now();
        for index in 0..self.slots.len() {
            let status = match &self.slots[index] {
                Some(slot) => slot.metadata.lock().await.status,
                None => continue,
            };
            match status {
                TaskStatus::Finished => self.release_slot(index, now, false),
                TaskStatus::Failed => self.release_slot(index, now, true),
                TaskStatus::NotStarted => self.begin_dispatch(index, now).await,
                TaskStatus::Retry => self.decide_retry(index, now).await,
                TaskStatus::Running => {}
            }
        }
    }

    /// True while any work remains queued or in a slot.
    pub fn is_active(&self) -> bool {
        !self.backlog.is_empty() || self.slots.iter().any(Option::is_some)
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Test and tooling hook mirroring the admission limiter's state.
    pub fn set_tokens(&mut self, tokens: f64) {
        self.tokens = tokens;
    }

    /// Ordered ids still waiting in the backlog.
    pub fn backlog_ids(&self) -> Vec<TaskId> {
        self.backlog.iter().map(|task| task.id.clone()).collect()
    }

    pub fn debug_snapshot(&self) -> DebugSnapshot {
        DebugSnapshot {
            backlog_size: self.backlog.len(),
            active: self.is_active(),
            tokens: self.tokens,
            slots: self
                .slots
                .iter()
                .map(|slot| slot.as_ref().map(|s| s.task.id.clone()))
                .collect(),
            free_slots: self.free_slots.clone(),
        }
    }

    /// Windowed counters for observability. Prunes expired entries as
    /// a side effect.
    pub fn statistics(&mut self) -> QueueStatistics {
        let now = Instant::now();
        prune_window(&mut self.added_times, now, ADDED_WINDOW);
        prune_window(&mut self.failed_times, now, FAILED_WINDOW);
        prune_window(&mut self.completed_times, now, COMPLETED_WINDOW);

        QueueStatistics {
            backlog_size: self.backlog.len(),
            tasks_added: self.added_times.len(),
            tasks_failed: self.failed_times.len(),
            tasks_completed: self.completed_times.len(),
            tokens: self.tokens,
            max_dispatches_per_second: self.config.rate_limits.max_dispatches_per_second,
            max_concurrent_dispatches: self.config.rate_limits.max_concurrent_dispatches,
        }
    }

    fn release_slot(&mut self, index: usize, now: Instant, failed: bool) {
        if let Some(slot) = self.slots[index].take() {
            self.admitted.remove(&slot.task.id);
            self.free_slots.push(index);
            self.completed_times.push_back(now);
            if failed {
                self.failed_times.push_back(now);
                metric_inc("taskqueue.task.failed");
            } else {
                metric_inc("taskqueue.task.finished");
            }
        }
    }

    /// Start an asynchronous delivery attempt for an idle slot.
    ///
    /// The status flips to `Running` before the spawn, under the slot
    /// lock, so a later tick cannot start a second delivery. If the
    /// backoff window since the last failed attempt has not elapsed
    /// the slot is left idle for a later tick.
    async fn begin_dispatch(&self, index: usize, now: Instant) {
        let Some(slot) = &self.slots[index] else {
            return;
        };
        let task = slot.task.clone();
        let metadata = slot.metadata.clone();

        let request = {
            let mut meta = metadata.lock().await;
            if let Some(last_run) = meta.last_run_time {
                if now.duration_since(last_run).as_secs_f64() < meta.current_backoff_secs {
                    return;
                }
            }
            meta.status = TaskStatus::Running;
            DeliveryRequest {
                url: task.target.url.clone(),
                headers: build_dispatch_headers(&self.name, &task, &meta),
                body: task.target.body.clone(),
                deadline: task.deadline(),
            }
        };

        let transport = self.transport.clone();
        metric_inc("taskqueue.dispatch.started");
        tokio::spawn(async move {
            let deadline = request.deadline;
            let outcome = match tokio::time::timeout(deadline, transport.deliver(request)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };

            let mut meta = metadata.lock().await;
            match outcome {
                Ok(status) if (200..300).contains(&status) => {
                    meta.status = TaskStatus::Finished;
                }
                Ok(status) => {
                    // 5xx responses are infrastructure retries and do
                    // not count as executions seen by the target.
                    if !(500..600).contains(&status) {
                        meta.execution_count += 1;
                    }
                    meta.previous_response_status = Some(status);
                    meta.status = TaskStatus::Retry;
                    meta.last_run_time = Some(Instant::now());
                    metric_inc("taskqueue.dispatch.rejected");
                }
                Err(err) => {
                    trace_warn(format!("task {}: delivery failed: {err}", task.id));
                    meta.status = TaskStatus::Retry;
                    meta.last_run_time = Some(Instant::now());
                    metric_inc("taskqueue.dispatch.transport_error");
                }
            }
        });
    }

    /// Either fail the task or arm the next attempt with its backoff.
    async fn decide_retry(&self, index: usize, now: Instant) {
        let Some(slot) = &self.slots[index] else {
            return;
        };
        let retry = &self.config.retry_config;
        let mut meta = slot.metadata.lock().await;

        if should_stop_retrying(&meta, retry, now) {
            meta.status = TaskStatus::Failed;
            metric_inc("taskqueue.retry.exhausted");
            return;
        }

        meta.current_backoff_secs = next_backoff_secs(meta.current_attempt, retry);
        meta.current_attempt += 1;
        meta.status = TaskStatus::NotStarted;
    }
}

/// The retry budget is exhausted once the attempt budget is spent and,
/// when a wall-clock cap is configured, that cap has elapsed too. The
/// two stopping conditions are independent on purpose: a small cap
/// with a large attempt budget stops early, and vice versa.
fn should_stop_retrying(meta: &DispatchMetadata, retry: &RetryConfig, now: Instant) -> bool {
    if meta.current_attempt < retry.max_attempts {
        return false;
    }
    match retry.max_retry_seconds {
        None | Some(0) => true,
        Some(cap) => now.duration_since(meta.start_time).as_secs_f64() > cap as f64,
    }
}

/// Backoff for the attempt after `current_attempt`: doubling up to
/// `max_doublings`, linear growth beyond, capped by the configured
/// maximum.
fn next_backoff_secs(current_attempt: u32, retry: &RetryConfig) -> f64 {
    let completed = current_attempt.saturating_sub(1);
    let doublings = completed.min(retry.max_doublings);
    let linear_steps = completed.saturating_sub(retry.max_doublings);
    let multiplier =
        2f64.powi(doublings as i32) + linear_steps as f64 * 2f64.powi(retry.max_doublings as i32);
    (multiplier * retry.min_backoff_seconds).min(retry.max_backoff_seconds)
}

fn prune_window(times: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = times.front() {
        if now.duration_since(front) > window {
            times.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry(max_attempts: u32, max_doublings: u32, min: f64, max: f64) -> RetryConfig {
        RetryConfig {
            max_attempts,
            max_retry_seconds: None,
            min_backoff_seconds: min,
            max_backoff_seconds: max,
            max_doublings,
        }
    }

    #[test]
    fn backoff_doubles_then_grows_linearly() {
        let config = retry(100, 2, 1.0, 100.0);
        assert_eq!(next_backoff_secs(1, &config), 1.0);
        assert_eq!(next_backoff_secs(2, &config), 2.0);
        assert_eq!(next_backoff_secs(3, &config), 4.0);
        assert_eq!(next_backoff_secs(4, &config), 8.0);
        assert_eq!(next_backoff_secs(5, &config), 12.0);
        assert_eq!(next_backoff_secs(6, &config), 16.0);
    }

    #[test]
    fn backoff_respects_ceiling() {
        let config = retry(100, 16, 10.0, 30.0);
        assert_eq!(next_backoff_secs(1, &config), 10.0);
        assert_eq!(next_backoff_secs(2, &config), 20.0);
        assert_eq!(next_backoff_secs(3, &config), 30.0);
        assert_eq!(next_backoff_secs(10, &config), 30.0);
    }

    #[test]
    fn stops_on_attempt_budget_without_time_cap() {
        let config = retry(3, 2, 1.0, 60.0);
        let now = Instant::now();
        let mut meta = DispatchMetadata::for_admission(now);

        meta.current_attempt = 2;
        assert!(!should_stop_retrying(&meta, &config, now));
        meta.current_attempt = 3;
        assert!(should_stop_retrying(&meta, &config, now));
    }

    #[test]
    fn time_cap_keeps_task_retrying_past_attempt_budget() {
        let mut config = retry(1, 2, 1.0, 60.0);
        config.max_retry_seconds = Some(30);
        let now = Instant::now();
        let mut meta = DispatchMetadata::for_admission(now);
        meta.current_attempt = 5;

        // Attempt budget is spent but the wall-clock cap has not
        // elapsed, so retrying continues.
        assert!(!should_stop_retrying(&meta, &config, now));
        assert!(should_stop_retrying(
            &meta,
            &config,
            now + Duration::from_secs(31)
        ));
    }

    #[test]
    fn zero_time_cap_means_no_cap() {
        let mut config = retry(2, 2, 1.0, 60.0);
        config.max_retry_seconds = Some(0);
        let now = Instant::now();
        let mut meta = DispatchMetadata::for_admission(now);
        meta.current_attempt = 2;
        assert!(should_stop_retrying(&meta, &config, now));
    }
}
