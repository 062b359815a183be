//! Fan-out of task state-change events to subscribers.
//!
//! The hub is a thin wrapper around a [`tokio::sync::broadcast`] channel.
//! Delivery is best-effort: a subscriber that falls behind loses the oldest
//! events, and late subscribers do not see history. Events for a single task
//! are always published by the single worker driving that task, so per-task
//! order is preserved; cross-task order is unspecified.

use tokio::sync::broadcast;

use crate::{prelude::*, task::TaskStatus};

/// Default capacity of the event channel.
const DEFAULT_CAPACITY: usize = 256;

/// What happened to a task.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskEventKind {
    /// A task was created and enqueued.
    Created,
    /// A task moved between statuses.
    StateChanged { from: TaskStatus, to: TaskStatus },
    /// Progress advanced within an attempt.
    Progress {
        fraction: f64,
        page: usize,
        total: usize,
    },
    /// A checkpoint was persisted.
    CheckpointCreated,
    /// An error was recorded against the task.
    ErrorRegistered { message: String },
    /// The task and its records were deleted.
    Deleted,
}

/// One event on the stream.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct TaskEvent {
    /// The task this event concerns.
    pub task_id: String,

    /// What happened.
    #[serde(flatten)]
    pub kind: TaskEventKind,

    /// When it happened.
    pub timestamp: DateTime<Utc>,
}

/// Publish-subscribe fanout of [`TaskEvent`]s.
///
/// Cloning the hub is cheap; all clones publish into the same channel.
#[derive(Clone)]
pub struct NotificationHub {
    tx: broadcast::Sender<TaskEvent>,
}

impl NotificationHub {
    /// Create a hub with the default buffer capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a hub with an explicit buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Events with no subscribers are dropped silently.
    pub fn publish(&self, task_id: &str, kind: TaskEventKind) {
        let event = TaskEvent {
            task_id: task_id.to_owned(),
            kind,
            timestamp: Utc::now(),
        };
        trace!(task_id = %event.task_id, "publishing {:?}", event.kind);
        // An error here just means nobody is listening.
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// How many subscribers are currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn per_task_order_is_preserved() {
        let hub = NotificationHub::new();
        let mut rx = hub.subscribe();

        hub.publish("t1", TaskEventKind::Created);
        hub.publish(
            "t1",
            TaskEventKind::StateChanged {
                from: TaskStatus::Queued,
                to: TaskStatus::Preprocessing,
            },
        );
        hub.publish(
            "t1",
            TaskEventKind::StateChanged {
                from: TaskStatus::Preprocessing,
                to: TaskStatus::Processing,
            },
        );

        assert_eq!(rx.recv().await.unwrap().kind, TaskEventKind::Created);
        match rx.recv().await.unwrap().kind {
            TaskEventKind::StateChanged { from, to } => {
                assert_eq!(from, TaskStatus::Queued);
                assert_eq!(to, TaskStatus::Preprocessing);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await.unwrap().kind {
            TaskEventKind::StateChanged { from, .. } => {
                assert_eq!(from, TaskStatus::Preprocessing);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_retention_for_late_subscribers() {
        let hub = NotificationHub::new();
        hub.publish("t1", TaskEventKind::Created);
        let mut rx = hub.subscribe();
        hub.publish("t1", TaskEventKind::CheckpointCreated);
        assert_eq!(
            rx.recv().await.unwrap().kind,
            TaskEventKind::CheckpointCreated
        );
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let hub = NotificationHub::new();
        hub.publish("t1", TaskEventKind::Deleted);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
