/// In-process event bus for live task-log frames
///
/// Log rows are durable in the store; the bus exists so a pending tool
/// call can stream `task_log` frames to the transport as they happen
/// instead of polling. Publishing never blocks: the bus is a
/// `tokio::sync::broadcast` channel and slow subscribers simply lag.
///
/// # Example
///
/// ```
/// use taskmill_shared::events::EventBus;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let bus = EventBus::new(64);
/// let mut rx = bus.subscribe();
/// # }
/// ```

use crate::models::task_log::{NewTaskLog, TaskLog};
use sqlx::sqlite::SqlitePool;
use tokio::sync::broadcast;

/// Broadcast bus carrying appended log rows.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TaskLog>,
}

impl EventBus {
    /// Creates a bus with the given per-subscriber buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    /// Subscribes to all future log events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskLog> {
        self.tx.subscribe()
    }

    /// Publishes a log row. Send errors (no subscribers) are ignored.
    pub fn publish(&self, log: TaskLog) {
        let _ = self.tx.send(log);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(256)
    }
}

/// Appends a log row to the store and publishes it on the bus.
pub async fn record_log(
    pool: &SqlitePool,
    bus: &EventBus,
    data: NewTaskLog,
) -> Result<TaskLog, sqlx::Error> {
    let log = TaskLog::append(pool, data).await?;
    bus.publish(log.clone());
    Ok(log)
}
