use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::dispatcher::TaskQueue;

/// Tick cadence matching the reference queue emulator.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Periodic driver for a [`TaskQueue`].
///
/// Runs the tick operations in their required order (refill, admit,
/// advance) on a fixed interval. Embedders with their own scheduler
/// can skip this and invoke the tick operations directly.
pub struct QueueDriver {
    is_running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl QueueDriver {
    pub fn spawn(queue: Arc<Mutex<TaskQueue>>, tick_interval: Duration) -> Self {
        let is_running = Arc::new(AtomicBool::new(true));
        let running = is_running.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let mut queue = queue.lock().await;
                queue.refill_tokens();
                queue.admit_ready();
                queue.advance_slots().await;
            }
        });

        Self {
            is_running,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Stop ticking. Any still in-flight deliveries run to their
    /// deadline but no further ticks observe them.
    pub async fn shutdown(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}
