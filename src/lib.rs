//! A single-process task-queue dispatch engine.
//!
//! This crate emulates a managed, push-based task queue: tasks are
//! admitted into a **bounded, in-memory** backlog and delivered over
//! HTTP at a configured rate and concurrency ceiling, with
//! exponential-backoff retry and terminal failure once the retry
//! budget is exhausted.
//!
//! ## Guarantees
//! - Bounded backlog and a fixed number of dispatch slots
//! - Token-bucket admission at the configured dispatch rate
//! - Per-task exponential backoff with a capped doubling schedule
//! - Deadline-bounded delivery attempts (a slow target never hangs a slot)
//!
//! ## Non-Guarantees
//! - Durability across restarts
//! - Exactly-once delivery
//! - Distributed coordination
//! - Ordering of completions (FIFO admission only; retries reorder)
//!
//! The engine is driven externally: a periodic driver invokes
//! [`TaskQueue::refill_tokens`], [`TaskQueue::admit_ready`] and
//! [`TaskQueue::advance_slots`] on every tick. [`QueueDriver`] provides
//! that loop for embedders that do not bring their own.

mod delivery;
mod dispatcher;
mod driver;
mod error;
mod store;
mod types;

pub use delivery::{DeliveryRequest, DeliveryTransport, TransportError};
pub use dispatcher::TaskQueue;
pub use driver::{QueueDriver, DEFAULT_TICK_INTERVAL};
pub use error::{QueueError, StoreError};
pub use store::OrderedStore;
pub use types::{
    parse_deadline, DebugSnapshot, DeliveryTarget, DispatchMetadata, QueueConfig, QueueStatistics,
    RateLimits, RetryConfig, Task, TaskId, TaskStatus, DEFAULT_DISPATCH_DEADLINE,
};

#[cfg(feature = "http")]
pub use delivery::HttpTransport;
