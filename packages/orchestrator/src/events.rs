// ABOUTME: Real-time task events and the durable log sink
// ABOUTME: Appends land in storage first, then broadcast best-effort to viewers

use async_trait::async_trait;
use drydock_agents::LogSink;
use drydock_tasks::{TaskMessage, TaskStatus, TaskStorage};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Event stream consumed by the notification surface
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Status {
        task_id: String,
        status: TaskStatus,
        error_message: Option<String>,
    },
    Log {
        message: TaskMessage,
    },
}

/// Broadcast channel for task events.
///
/// Durable delivery is the message log's job; fan-out here is
/// best-effort for live viewers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: TaskEvent) {
        if let Err(e) = self.tx.send(event) {
            // Only noteworthy when someone is actually listening
            if self.tx.receiver_count() > 0 {
                warn!("Failed to broadcast task event: {}", e);
            }
        }
    }
}

/// Log sink bound to one task: every line is appended to the durable
/// message log in arrival order, then echoed onto the event bus.
pub struct DbLogSink {
    storage: Arc<TaskStorage>,
    bus: EventBus,
    task_id: String,
}

impl DbLogSink {
    pub fn new(storage: Arc<TaskStorage>, bus: EventBus, task_id: String) -> Self {
        Self {
            storage,
            bus,
            task_id,
        }
    }
}

#[async_trait]
impl LogSink for DbLogSink {
    async fn append(&self, source: &str, line: &str) -> anyhow::Result<()> {
        let message = self
            .storage
            .append_message(&self.task_id, source, line)
            .await?;
        self.bus.emit(TaskEvent::Log { message });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_core::RepoRef;
    use drydock_tasks::CreateTaskInput;

    async fn task_storage() -> Arc<TaskStorage> {
        let pool = drydock_storage::memory_pool().await.unwrap();
        Arc::new(TaskStorage::new(pool))
    }

    #[tokio::test]
    async fn test_sink_appends_and_broadcasts_in_order() {
        let storage = task_storage().await;
        let task = storage
            .create_task(CreateTaskInput {
                user_id: "u1".to_string(),
                agent: "claude".to_string(),
                repo: RepoRef::parse("https://github.com/acme/widgets").unwrap(),
                instruction: "x".to_string(),
                keep_alive: false,
            })
            .await
            .unwrap();

        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let sink = DbLogSink::new(storage.clone(), bus, task.id.clone());

        for i in 0..5 {
            sink.append("agent", &format!("line {}", i)).await.unwrap();
        }

        // Durable log holds exact append order
        let messages = storage.list_messages(&task.id, None).await.unwrap();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[4].line, "line 4");

        // Broadcast mirrors it for live viewers
        for i in 0..5 {
            match rx.recv().await.unwrap() {
                TaskEvent::Log { message } => {
                    assert_eq!(message.line, format!("line {}", i));
                    assert_eq!(message.seq, i + 1);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.emit(TaskEvent::Status {
            task_id: "task_x".to_string(),
            status: TaskStatus::Queued,
            error_message: None,
        });
    }
}
