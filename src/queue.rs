//! Priority-ordered task queue with a bounded worker pool.
//!
//! The queue itself is a binary heap plus pause/active bookkeeping behind a
//! single mutex; the lock is only ever held for O(log n) heap operations,
//! never across IO. A dispatcher task watches the heap and spawns one runner
//! per eligible task, keeping at most `max_concurrent` tasks in flight.
//!
//! Scheduling guarantees:
//!
//! - A strictly higher-priority task is dequeued before any lower-priority
//!   task, regardless of enqueue order.
//! - Within a priority class, earliest `added_at` wins (FIFO).
//! - A paused task is skipped but keeps its heap position; resume makes it
//!   eligible again under the normal rules.
//! - Cancelling a queued or paused task is immediate; cancelling a running
//!   task takes effect at the next chunk boundary.

use std::{
    collections::{BTreeMap, BinaryHeap, HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::Notify;

use crate::{
    hub::{NotificationHub, TaskEventKind},
    prelude::*,
    rate_limit::AdmissionThrottle,
    store::TaskStore,
    task::{
        ApiError, ErrorKind, Priority, Task, TaskError, TaskFilter, TaskStatus,
    },
};

/// Default worker pool size.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Default hard cap on queued tasks.
pub const DEFAULT_MAX_QUEUE_LENGTH: usize = 1000;

/// Default hard deadline for one task run.
pub const DEFAULT_HARD_DEADLINE: Duration = Duration::from_secs(900);

/// Cancellation and pause signals for one running task.
///
/// The chunked processor observes these at chunk boundaries; in-flight OCR
/// calls run to completion and their results are discarded.
#[derive(Clone, Debug, Default)]
pub struct TaskControl {
    cancel: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation at the next safe point.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Request a pause at the next safe point.
    pub fn pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    /// Clear a pause request that has not yet been observed.
    pub fn clear_pause(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }
}

/// Executes one task once a worker slot is free.
///
/// The runner is responsible for the `Preprocessing → Processing → terminal`
/// transitions and for persisting everything it does. The queue only
/// backstops runs that panic, error out, or blow the hard deadline.
#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    async fn run(&self, task: Task, control: TaskControl) -> Result<()>;
}

/// One heap entry. Ordered so that the binary heap pops the highest
/// priority first, ties broken by earliest `added_at`, then by submission
/// sequence.
#[derive(Clone, Debug, Eq, PartialEq)]
struct QueueEntry {
    priority: Priority,
    added_at: DateTime<Utc>,
    seq: u64,
    task_id: String,
}

impl QueueEntry {
    fn key(&self) -> (Priority, DateTime<Utc>, u64) {
        (self.priority, self.added_at, self.seq)
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest key pops first.
        other.key().cmp(&self.key())
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Everything protected by the queue lock.
#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    /// Ids with a live heap entry. Pop discards entries not in this set.
    queued: HashSet<String>,
    /// Ids whose execution is paused (queued or running).
    paused: HashSet<String>,
    /// Controls for tasks currently held by a worker.
    active: HashMap<String, TaskControl>,
}

/// Configuration for [`TaskQueue`].
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub max_queue_length: usize,
    pub hard_deadline: Duration,
    /// Optional admission throttle for `critical` and `high` enqueues.
    pub high_priority_throttle: Option<AdmissionThrottle>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
            hard_deadline: DEFAULT_HARD_DEADLINE,
            high_priority_throttle: None,
        }
    }
}

/// Priority-ordered, pause-aware task queue.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    seq: AtomicU64,
    config: QueueConfig,
    store: TaskStore,
    hub: NotificationHub,
}

impl TaskQueue {
    pub fn new(config: QueueConfig, store: TaskStore, hub: NotificationHub) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            config,
            store,
            hub,
        })
    }

    /// Add a task to the queue.
    ///
    /// The task record is durable before anything is published or scheduled,
    /// so observers never see a state that isn't stored.
    #[instrument(level = "debug", skip_all, fields(task_id = %task.task_id))]
    pub async fn enqueue(&self, task: Task) -> Result<String, ApiError> {
        if !task.document_path.exists() {
            return Err(ApiError::InvalidInput(format!(
                "document not found: {:?}",
                task.document_path
            )));
        }
        if matches!(task.priority, Priority::Critical | Priority::High) {
            if let Some(throttle) = &self.config.high_priority_throttle {
                if !throttle.admit() {
                    return Err(ApiError::ResourceExhausted(
                        "high-priority admission rate exceeded".to_owned(),
                    ));
                }
            }
        }
        {
            let inner = self.inner.lock().expect("queue lock poisoned");
            if inner.queued.len() >= self.config.max_queue_length {
                return Err(ApiError::ResourceExhausted(format!(
                    "queue is at its cap of {} tasks",
                    self.config.max_queue_length
                )));
            }
        }

        self.store
            .put_task(&task)
            .await
            .map_err(|err| ApiError::Internal(format!("{err:#}")))?;
        self.hub.publish(&task.task_id, TaskEventKind::Created);

        self.push_entry(&task);
        info!(
            task_id = %task.task_id,
            priority = %task.priority,
            "task enqueued"
        );
        Ok(task.task_id)
    }

    fn push_entry(&self, task: &Task) {
        let entry = QueueEntry {
            priority: task.priority,
            added_at: task.added_at,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            task_id: task.task_id.clone(),
        };
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            inner.queued.insert(entry.task_id.clone());
            inner.heap.push(entry);
        }
        self.notify.notify_one();
    }

    /// Pause a task. Idempotent: pausing an already-paused task returns
    /// `false`, as does pausing a terminal task.
    pub async fn pause(&self, task_id: &str) -> Result<bool, ApiError> {
        let mut task = self.load(task_id).await?;
        if task.status.is_terminal() {
            return Ok(false);
        }

        let already_paused = {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            let already = !inner.paused.insert(task_id.to_owned());
            if !already {
                if let Some(control) = inner.active.get(task_id) {
                    control.pause();
                }
            }
            already
        };
        if already_paused {
            return Ok(false);
        }

        // Queued and waiting tasks park immediately; running tasks park at
        // the next chunk boundary, where the driver records the transition.
        if matches!(
            task.status,
            TaskStatus::Queued | TaskStatus::WaitingForResources
        ) {
            let from = task.status;
            task.transition(TaskStatus::Paused)?;
            self.persist_transition(&task, from).await?;
        }
        info!(task_id, "task paused");
        Ok(true)
    }

    /// Resume a paused task. Resuming a task that is not paused returns
    /// `false` without side effects.
    pub async fn resume(&self, task_id: &str) -> Result<bool, ApiError> {
        let mut task = self.load(task_id).await?;
        if task.status.is_terminal() {
            return Ok(false);
        }

        let was_paused = {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            let was = inner.paused.remove(task_id);
            if was {
                if let Some(control) = inner.active.get(task_id) {
                    control.clear_pause();
                }
            }
            was
        };
        if !was_paused {
            return Ok(false);
        }

        if task.status == TaskStatus::Paused {
            task.transition(TaskStatus::Queued)?;
            self.persist_transition(&task, TaskStatus::Paused).await?;
        }
        self.notify.notify_one();
        info!(task_id, "task resumed");
        Ok(true)
    }

    /// Cancel a task. Cancelling a terminal task is a no-op returning
    /// `false`. A queued or paused task cancels immediately; a running task
    /// cancels at the next safe point.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, ApiError> {
        let mut task = self.load(task_id).await?;
        if task.status.is_terminal() {
            return Ok(false);
        }

        let was_running = {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            inner.paused.remove(task_id);
            if let Some(control) = inner.active.get(task_id) {
                control.cancel();
                true
            } else {
                inner.queued.remove(task_id);
                false
            }
        };

        if was_running {
            info!(task_id, "cancellation requested at next safe point");
            return Ok(true);
        }

        let from = task.status;
        task.transition(TaskStatus::Cancelled)?;
        self.persist_transition(&task, from).await?;
        info!(task_id, "task cancelled");
        Ok(true)
    }

    /// Fetch a task's current record.
    pub async fn status(&self, task_id: &str) -> Result<Task, ApiError> {
        self.load(task_id).await
    }

    /// Aggregate statistics over the queue and the store.
    pub async fn stats(&self) -> Result<QueueStats> {
        let tasks = self.store.list_tasks(&TaskFilter::default()).await?;
        let (queue_length, active, paused) = {
            let inner = self.inner.lock().expect("queue lock poisoned");
            (inner.queued.len(), inner.active.len(), inner.paused.len())
        };

        let mut status_histogram: BTreeMap<String, usize> = TaskStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_owned(), 0))
            .collect();
        let mut priority_histogram: BTreeMap<String, usize> = Priority::ALL
            .iter()
            .map(|p| (p.as_str().to_owned(), 0))
            .collect();
        let mut completed = 0;
        let mut processing_times = vec![];
        for task in &tasks {
            *status_histogram
                .entry(task.status.as_str().to_owned())
                .or_default() += 1;
            *priority_histogram
                .entry(task.priority.as_str().to_owned())
                .or_default() += 1;
            if task.status.is_terminal() {
                completed += 1;
                if let Some(time) = task.processing_time() {
                    processing_times.push(time);
                }
            }
        }
        let avg_processing_time = if processing_times.is_empty() {
            0.0
        } else {
            processing_times.iter().sum::<f64>() / processing_times.len() as f64
        };

        Ok(QueueStats {
            queue_length,
            active,
            completed,
            paused,
            max_concurrent: self.config.max_concurrent,
            status_histogram,
            priority_histogram,
            avg_processing_time,
            timestamp: Utc::now(),
        })
    }

    /// Start the dispatcher. Tasks already on the heap begin executing.
    pub fn start(self: &Arc<Self>, runner: Arc<dyn TaskRunner>) {
        let queue = self.clone();
        tokio::spawn(async move {
            queue.dispatch_loop(runner).await;
        });
    }

    /// The dispatcher: pop eligible work while slots are free, spawn one
    /// runner per task.
    async fn dispatch_loop(self: Arc<Self>, runner: Arc<dyn TaskRunner>) {
        loop {
            while let Some(task_id) = self.try_claim() {
                if let Err(err) = self.launch(&task_id, runner.clone()).await {
                    error!(task_id, "failed to launch task: {err:#}");
                    let mut inner = self.inner.lock().expect("queue lock poisoned");
                    inner.active.remove(&task_id);
                }
            }
            self.mark_waiting_if_saturated().await;

            // Wake on explicit notifications, with a timer backstop so a
            // missed notification can't stall the queue.
            let _ = tokio::time::timeout(
                Duration::from_millis(500),
                self.notify.notified(),
            )
            .await;
        }
    }

    /// Claim the best eligible task, registering it as active. Returns
    /// `None` when the pool is saturated or nothing is eligible.
    fn try_claim(&self) -> Option<String> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.active.len() >= self.config.max_concurrent {
            return None;
        }

        // Pop entries, skipping stale ones and stashing paused ones so they
        // keep their position.
        let mut skipped = vec![];
        let mut claimed = None;
        while let Some(entry) = inner.heap.pop() {
            if !inner.queued.contains(&entry.task_id) {
                // Cancelled or otherwise removed; drop the stale entry.
                continue;
            }
            if inner.paused.contains(&entry.task_id) {
                skipped.push(entry);
                continue;
            }
            claimed = Some(entry);
            break;
        }
        for entry in skipped {
            inner.heap.push(entry);
        }

        let entry = claimed?;
        inner.queued.remove(&entry.task_id);
        inner
            .active
            .insert(entry.task_id.clone(), TaskControl::new());
        Some(entry.task_id)
    }

    /// Move the claimed task to `Preprocessing` and spawn its runner.
    async fn launch(
        self: &Arc<Self>,
        task_id: &str,
        runner: Arc<dyn TaskRunner>,
    ) -> Result<()> {
        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| anyhow!("claimed task {task_id} vanished from the store"))?;
        let from = task.status;
        task.transition(TaskStatus::Preprocessing)
            .map_err(|err| anyhow!("{err}"))?;
        self.store.put_task(&task).await?;
        self.hub.publish(
            &task.task_id,
            TaskEventKind::StateChanged {
                from,
                to: task.status,
            },
        );

        let control = {
            let inner = self.inner.lock().expect("queue lock poisoned");
            inner
                .active
                .get(task_id)
                .cloned()
                .ok_or_else(|| anyhow!("claimed task {task_id} lost its control"))?
        };

        let queue = self.clone();
        let hard_deadline = self.config.hard_deadline;
        tokio::spawn(async move {
            let task_id = task.task_id.clone();
            let run = runner.run(task, control);
            match tokio::time::timeout(hard_deadline, run).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(task_id, "task runner failed: {err:#}");
                    queue.force_fail(&task_id, ErrorKind::Unknown, &format!("{err:#}")).await;
                }
                Err(_) => {
                    error!(task_id, "hard deadline expired; releasing worker");
                    queue
                        .force_fail(
                            &task_id,
                            ErrorKind::Timeout,
                            &format!(
                                "hard deadline of {}s expired",
                                hard_deadline.as_secs()
                            ),
                        )
                        .await;
                }
            }
            queue.release(&task_id).await;
        });
        Ok(())
    }

    /// Backstop: mark a task failed when its runner errored or timed out
    /// without recording a terminal status itself.
    async fn force_fail(&self, task_id: &str, kind: ErrorKind, message: &str) {
        let Ok(Some(mut task)) = self.store.get_task(task_id).await else {
            return;
        };
        if task.status.is_terminal() {
            return;
        }
        let error = TaskError::new(kind, message, false);
        let _ = self.store.append_error(task_id, &error).await;
        task.record_error(error);
        let from = task.status;
        if task.transition(TaskStatus::Failed).is_ok() {
            let _ = self.store.put_task(&task).await;
            self.hub.publish(
                task_id,
                TaskEventKind::StateChanged {
                    from,
                    to: TaskStatus::Failed,
                },
            );
        }
    }

    /// Release a finished task's slot, re-admitting it when it parked
    /// (paused) or asked to go around again (a reprocessing verdict left it
    /// `Queued`). Re-admission happens only here, after the slot is free, so
    /// a task can never be claimed twice at once.
    async fn release(&self, task_id: &str) {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            inner.active.remove(task_id);
        }
        if let Ok(Some(task)) = self.store.get_task(task_id).await {
            if matches!(task.status, TaskStatus::Paused | TaskStatus::Queued) {
                self.push_entry(&task);
            } else if task.status.is_terminal() {
                // A pause requested too late to be observed leaves a stale
                // entry in the pause set; drop it with the task.
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                inner.paused.remove(task_id);
            }
        }
        self.notify.notify_one();
    }

    /// While the pool is saturated, flag the head of the queue as waiting.
    async fn mark_waiting_if_saturated(&self) {
        let head = {
            let inner = self.inner.lock().expect("queue lock poisoned");
            if inner.active.len() < self.config.max_concurrent {
                return;
            }
            inner
                .heap
                .peek()
                .filter(|e| {
                    inner.queued.contains(&e.task_id) && !inner.paused.contains(&e.task_id)
                })
                .map(|e| e.task_id.clone())
        };
        let Some(task_id) = head else { return };
        let Ok(Some(mut task)) = self.store.get_task(&task_id).await else {
            return;
        };
        if task.status == TaskStatus::Queued
            && task.transition(TaskStatus::WaitingForResources).is_ok()
        {
            let _ = self.persist_transition(&task, TaskStatus::Queued).await;
        }
    }

    /// Persist a transitioned task and publish the change, in that order.
    async fn persist_transition(
        &self,
        task: &Task,
        from: TaskStatus,
    ) -> Result<(), ApiError> {
        self.store
            .put_task(task)
            .await
            .map_err(|err| ApiError::Internal(format!("{err:#}")))?;
        self.hub.publish(
            &task.task_id,
            TaskEventKind::StateChanged {
                from,
                to: task.status,
            },
        );
        Ok(())
    }

    async fn load(&self, task_id: &str) -> Result<Task, ApiError> {
        self.store
            .get_task(task_id)
            .await
            .map_err(|err| ApiError::Internal(format!("{err:#}")))?
            .ok_or_else(|| ApiError::NotFound(format!("unknown task {task_id}")))
    }

    /// Poll the store until the task reaches a terminal status.
    pub async fn wait_for_terminal(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<Task> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(task) = self.store.get_task(task_id).await? {
                if task.status.is_terminal() {
                    return Ok(task);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("task {task_id} did not finish in time"));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Aggregate queue statistics.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct QueueStats {
    pub queue_length: usize,
    pub active: usize,
    pub completed: usize,
    pub paused: usize,
    pub max_concurrent: usize,
    pub status_histogram: BTreeMap<String, usize>,
    pub priority_histogram: BTreeMap<String, usize>,
    pub avg_processing_time: f64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap as Map;

    use super::*;
    use crate::task::OcrOptions;

    /// A runner that records execution order and completes every task.
    struct RecordingRunner {
        order: Mutex<Vec<String>>,
        running: Arc<std::sync::atomic::AtomicUsize>,
        max_seen: Arc<std::sync::atomic::AtomicUsize>,
        store: TaskStore,
        delay: Duration,
    }

    impl RecordingRunner {
        fn new(store: TaskStore, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                order: Mutex::new(vec![]),
                running: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
                max_seen: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
                store,
                delay,
            })
        }
    }

    #[async_trait]
    impl TaskRunner for RecordingRunner {
        async fn run(&self, mut task: Task, _control: TaskControl) -> Result<()> {
            self.order.lock().unwrap().push(task.task_id.clone());
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;

            task.transition(TaskStatus::Processing).unwrap();
            task.transition(TaskStatus::Completed).unwrap();
            self.store.put_task(&task).await?;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn make_task(dir: &Path, priority: Priority) -> Task {
        let path = dir.join(format!("{}.txt", uuid::Uuid::new_v4()));
        std::fs::write(&path, "contents").unwrap();
        Task::new(path, None, priority, OcrOptions::default(), Map::new())
    }

    fn queue_with(
        dir: &Path,
        max_concurrent: usize,
    ) -> (Arc<TaskQueue>, TaskStore) {
        let store = TaskStore::open(dir.join("store")).unwrap();
        let config = QueueConfig {
            max_concurrent,
            ..QueueConfig::default()
        };
        let queue = TaskQueue::new(config, store.clone(), NotificationHub::new());
        (queue, store)
    }

    #[tokio::test]
    async fn critical_preempts_normal() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, store) = queue_with(dir.path(), 1);
        let runner = RecordingRunner::new(store.clone(), Duration::from_millis(10));

        let a = queue.enqueue(make_task(dir.path(), Priority::Normal)).await.unwrap();
        let b = queue.enqueue(make_task(dir.path(), Priority::Critical)).await.unwrap();
        queue.start(runner.clone());

        queue.wait_for_terminal(&a, Duration::from_secs(5)).await.unwrap();
        queue.wait_for_terminal(&b, Duration::from_secs(5)).await.unwrap();

        let order = runner.order.lock().unwrap().clone();
        assert_eq!(order, vec![b, a]);
    }

    #[tokio::test]
    async fn fifo_within_a_priority_class() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, store) = queue_with(dir.path(), 1);
        let runner = RecordingRunner::new(store.clone(), Duration::from_millis(5));

        let mut ids = vec![];
        for _ in 0..3 {
            ids.push(queue.enqueue(make_task(dir.path(), Priority::Normal)).await.unwrap());
            // Distinct `added_at` stamps.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        queue.start(runner.clone());
        for id in &ids {
            queue.wait_for_terminal(id, Duration::from_secs(5)).await.unwrap();
        }
        assert_eq!(*runner.order.lock().unwrap(), ids);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, store) = queue_with(dir.path(), 2);
        let runner = RecordingRunner::new(store.clone(), Duration::from_millis(30));

        let mut ids = vec![];
        for _ in 0..5 {
            ids.push(queue.enqueue(make_task(dir.path(), Priority::Normal)).await.unwrap());
        }
        queue.start(runner.clone());
        for id in &ids {
            queue.wait_for_terminal(id, Duration::from_secs(5)).await.unwrap();
        }
        assert!(runner.max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn paused_tasks_are_skipped_until_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, store) = queue_with(dir.path(), 1);
        let runner = RecordingRunner::new(store.clone(), Duration::from_millis(5));

        let a = queue.enqueue(make_task(dir.path(), Priority::Normal)).await.unwrap();
        let b = queue.enqueue(make_task(dir.path(), Priority::Normal)).await.unwrap();
        assert!(queue.pause(&a).await.unwrap());
        // Idempotent second pause.
        assert!(!queue.pause(&a).await.unwrap());

        queue.start(runner.clone());
        queue.wait_for_terminal(&b, Duration::from_secs(5)).await.unwrap();
        assert_eq!(queue.status(&a).await.unwrap().status, TaskStatus::Paused);

        assert!(queue.resume(&a).await.unwrap());
        queue.wait_for_terminal(&a, Duration::from_secs(5)).await.unwrap();
        assert_eq!(*runner.order.lock().unwrap(), vec![b, a]);
    }

    #[tokio::test]
    async fn resume_of_non_paused_task_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, _store) = queue_with(dir.path(), 1);
        let a = queue.enqueue(make_task(dir.path(), Priority::Normal)).await.unwrap();
        assert!(!queue.resume(&a).await.unwrap());
        assert_eq!(queue.status(&a).await.unwrap().status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn cancel_of_queued_task_is_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, _store) = queue_with(dir.path(), 1);
        let a = queue.enqueue(make_task(dir.path(), Priority::Normal)).await.unwrap();
        assert!(queue.cancel(&a).await.unwrap());
        assert_eq!(queue.status(&a).await.unwrap().status, TaskStatus::Cancelled);
        // Cancelling again is a no-op on a terminal task.
        assert!(!queue.cancel(&a).await.unwrap());
        // Resume after cancel returns false and the status stays Cancelled.
        assert!(!queue.resume(&a).await.unwrap());
        assert_eq!(queue.status(&a).await.unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_of_paused_task_is_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, _store) = queue_with(dir.path(), 1);
        let a = queue.enqueue(make_task(dir.path(), Priority::Normal)).await.unwrap();
        assert!(queue.pause(&a).await.unwrap());
        assert!(queue.cancel(&a).await.unwrap());
        assert_eq!(queue.status(&a).await.unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, _store) = queue_with(dir.path(), 1);
        match queue.status("missing").await {
            Err(ApiError::NotFound(_)) => {}
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_path_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, _store) = queue_with(dir.path(), 1);
        let task = Task::new(
            dir.path().join("missing.pdf"),
            None,
            Priority::Normal,
            OcrOptions::default(),
            Map::new(),
        );
        match queue.enqueue(task).await {
            Err(ApiError::InvalidInput(_)) => {}
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn queue_cap_surfaces_as_resource_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("store")).unwrap();
        let config = QueueConfig {
            max_queue_length: 1,
            ..QueueConfig::default()
        };
        let queue = TaskQueue::new(config, store, NotificationHub::new());
        queue.enqueue(make_task(dir.path(), Priority::Normal)).await.unwrap();
        match queue.enqueue(make_task(dir.path(), Priority::Normal)).await {
            Err(ApiError::ResourceExhausted(_)) => {}
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_documents_get_distinct_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, _store) = queue_with(dir.path(), 1);
        let path = dir.path().join("same.txt");
        std::fs::write(&path, "same doc").unwrap();
        let t1 = Task::new(path.clone(), None, Priority::Normal, OcrOptions::default(), Map::new());
        let t2 = Task::new(path, None, Priority::Normal, OcrOptions::default(), Map::new());
        let a = queue.enqueue(t1).await.unwrap();
        let b = queue.enqueue(t2).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn stats_reflect_queue_state() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, _store) = queue_with(dir.path(), 3);
        queue.enqueue(make_task(dir.path(), Priority::Critical)).await.unwrap();
        queue.enqueue(make_task(dir.path(), Priority::Normal)).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.queue_length, 2);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.max_concurrent, 3);
        assert_eq!(stats.status_histogram["queued"], 2);
        assert_eq!(stats.priority_histogram["critical"], 1);
        assert_eq!(stats.priority_histogram["normal"], 1);
    }
}
