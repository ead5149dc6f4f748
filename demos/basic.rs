use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use taskqueue_dispatcher::{HttpTransport, QueueConfig, QueueDriver, Task, TaskQueue};

#[tokio::main]
async fn main() {
    let config = QueueConfig::default()
        .with_default_delivery_url("http://localhost:8080/handler")
        .with_backlog_capacity(1_000);

    let queue = Arc::new(Mutex::new(TaskQueue::new(
        "demo",
        config,
        Arc::new(HttpTransport::new()),
    )));

    {
        let mut queue = queue.lock().await;
        for n in 0..5 {
            let task = Task::new(format!("task-{n}"))
                .with_body(serde_json::json!({ "n": n }))
                .with_dispatch_deadline(Duration::from_secs(10));
            if let Err(err) = queue.enqueue(task) {
                eprintln!("enqueue failed: {err}");
            }
        }
    }

    let mut driver = QueueDriver::spawn(queue.clone(), Duration::from_millis(250));

    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let mut queue = queue.lock().await;
        let stats = queue.statistics();
        println!(
            "backlog={} completed={} failed={} tokens={:.1}",
            stats.backlog_size, stats.tasks_completed, stats.tasks_failed, stats.tokens
        );
        if !queue.is_active() {
            break;
        }
    }

    driver.shutdown().await;
}
