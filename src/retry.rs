//! Failure classification and the retry supervisor.
//!
//! Every attempt execution is wrapped here. Failures are classified into the
//! closed [`ErrorKind`] set, persisted to the store *before* the retry
//! decision, and retried with exponential backoff when recoverable. The
//! latest checkpoint is left untouched between retries, so the next attempt
//! restores from it. Only the final outcome ever surfaces to the caller.

use std::time::Duration;

use futures::future::BoxFuture;
use keen_retry::RetryResult;

use crate::{
    hub::{NotificationHub, TaskEventKind},
    prelude::*,
    store::TaskStore,
    task::{ErrorKind, Task, TaskError},
};

/// Default retry count.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Default cap on the exponential backoff delay.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Classify a failure into an error kind and recoverability.
///
/// By default, we assume errors are recoverable until they're been observed
/// in the wild, investigated and determined to be fatal. The two exceptions
/// are validation failures (the input will not get better on retry) and
/// non-transient system faults.
pub fn classify_error(err: &anyhow::Error) -> (ErrorKind, bool) {
    let text = format!("{err:#}").to_lowercase();

    if text.contains("deadline expired") || text.contains("timed out") {
        (ErrorKind::Timeout, true)
    } else if text.contains("out of memory")
        || text.contains("no space left")
        || text.contains("memory")
        || text.contains("disk full")
    {
        (ErrorKind::System, false)
    } else if text.contains("no such file or directory")
        || text.contains("command not found")
        || text.contains("program not found")
    {
        // Missing external tools will not appear on retry.
        (ErrorKind::System, false)
    } else if text.contains("network")
        || text.contains("connection")
        || text.contains("dns")
    {
        (ErrorKind::Network, true)
    } else if text.contains("unsupported")
        || text.contains("invalid")
        || text.contains("malformed")
        || text.contains("unknown ocr engine")
        || text.contains("document not found")
    {
        (ErrorKind::Validation, false)
    } else if text.contains("tesseract") || text.contains("ocr") {
        (ErrorKind::Ocr, true)
    } else {
        (ErrorKind::Unknown, true)
    }
}

/// Convert a [`Result`] into a [`RetryResult`] using [`classify_error`].
pub(crate) trait IntoRetryResult<T> {
    fn into_retry_result(self) -> RetryResult<(), (), T, anyhow::Error>;
}

impl<T> IntoRetryResult<T> for Result<T> {
    fn into_retry_result(self) -> RetryResult<(), (), T, anyhow::Error> {
        match self {
            Ok(output) => RetryResult::Ok {
                reported_input: (),
                output,
            },
            Err(error) => {
                let (_, recoverable) = classify_error(&error);
                if recoverable {
                    debug!("potentially transient error: {:?}", error);
                    RetryResult::Transient { input: (), error }
                } else {
                    RetryResult::Fatal { input: (), error }
                }
            }
        }
    }
}

/// Retry policy knobs.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum retries after the first attempt.
    pub max_retries: usize,

    /// Cap on the exponential backoff delay.
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

impl RetryPolicy {
    /// The delay before retry number `retry_count` (1-based): `min(cap,
    /// 2^retry_count)` seconds.
    pub fn delay_for(&self, retry_count: usize) -> Duration {
        let exp = 2u64.saturating_pow(retry_count.min(16) as u32);
        Duration::from_secs(exp).min(self.backoff_cap)
    }
}

/// Wraps attempt execution with classification, persistence, and backoff.
pub struct RetrySupervisor {
    policy: RetryPolicy,
    store: TaskStore,
    hub: NotificationHub,
}

impl RetrySupervisor {
    pub fn new(policy: RetryPolicy, store: TaskStore, hub: NotificationHub) -> Self {
        Self { policy, store, hub }
    }

    /// Run `attempt_fn` until it succeeds, fails fatally, or exhausts the
    /// retry budget. The callback takes the task by value and returns it
    /// along with the attempt's result, so attempt futures own everything
    /// they touch; the 0-based retry index comes along for logging.
    ///
    /// Every failure is appended to the task's error list and persisted
    /// before the retry decision is made, so observers never see a retry
    /// whose cause isn't durable.
    #[instrument(level = "debug", skip_all, fields(task_id = %task.task_id))]
    pub async fn supervise<T, F>(&self, mut task: Task, mut attempt_fn: F) -> (Task, Result<T>)
    where
        T: Send,
        F: FnMut(Task, usize) -> BoxFuture<'static, (Task, Result<T>)> + Send,
    {
        let mut retry_count = 0;
        loop {
            let (returned, result) = attempt_fn(task, retry_count).await;
            task = returned;
            match result.into_retry_result() {
                RetryResult::Ok { output, .. } => return (task, Ok(output)),
                RetryResult::Transient { error, .. } => {
                    let (kind, _) = classify_error(&error);
                    if let Err(store_err) = self.record(&mut task, kind, &error, true).await
                    {
                        return (task, Err(store_err));
                    }

                    if retry_count >= self.policy.max_retries {
                        warn!(
                            task_id = %task.task_id,
                            "retry budget exhausted after {} retries",
                            retry_count
                        );
                        return (task, Err(error));
                    }
                    retry_count += 1;
                    let delay = self.policy.delay_for(retry_count);
                    info!(
                        task_id = %task.task_id,
                        "retrying in {}s (attempt {}/{})",
                        delay.as_secs(),
                        retry_count,
                        self.policy.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryResult::Fatal { error, .. } => {
                    let (kind, _) = classify_error(&error);
                    if let Err(store_err) =
                        self.record(&mut task, kind, &error, false).await
                    {
                        return (task, Err(store_err));
                    }
                    return (task, Err(error));
                }
            }
        }
    }

    /// Persist one failure before deciding anything else.
    async fn record(
        &self,
        task: &mut Task,
        kind: ErrorKind,
        error: &anyhow::Error,
        recoverable: bool,
    ) -> Result<()> {
        let record = TaskError::new(kind, format!("{error:#}"), recoverable);
        self.store.append_error(&task.task_id, &record).await?;
        task.record_error(record);
        self.store.put_task(task).await?;
        self.hub.publish(
            &task.task_id,
            TaskEventKind::ErrorRegistered {
                message: format!("{error:#}"),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use futures::FutureExt as _;

    use crate::task::{OcrOptions, Priority};

    use super::*;

    #[test]
    fn timeouts_are_recoverable() {
        let err = anyhow!("soft deadline expired after 600s");
        assert_eq!(classify_error(&err), (ErrorKind::Timeout, true));
    }

    #[test]
    fn validation_failures_are_fatal() {
        let err = anyhow!("unsupported image or PDF MIME type text/html");
        assert_eq!(classify_error(&err), (ErrorKind::Validation, false));
    }

    #[test]
    fn memory_pressure_is_fatal_system() {
        let err = anyhow!("tesseract: out of memory");
        assert_eq!(classify_error(&err), (ErrorKind::System, false));
    }

    #[test]
    fn network_failures_are_recoverable() {
        let err = anyhow!("connection reset by peer");
        assert_eq!(classify_error(&err), (ErrorKind::Network, true));
    }

    #[test]
    fn unclassified_failures_default_to_recoverable_unknown() {
        let err = anyhow!("something odd happened");
        assert_eq!(classify_error(&err), (ErrorKind::Unknown, true));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
    }

    fn fixture(dir: &Path) -> (RetrySupervisor, TaskStore, Task) {
        let store = TaskStore::open(dir.join("store")).unwrap();
        let supervisor = RetrySupervisor::new(
            RetryPolicy {
                max_retries: 3,
                backoff_cap: Duration::from_millis(1),
            },
            store.clone(),
            NotificationHub::new(),
        );
        let task = Task::new(
            dir.join("doc.pdf"),
            None,
            Priority::Normal,
            OcrOptions::default(),
            BTreeMap::new(),
        );
        (supervisor, store, task)
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, store, task) = fixture(dir.path());
        store.put_task(&task).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();
        let (task, result) = supervisor
            .supervise(task, move |task, _retry| {
                let n = calls_in.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        (task, Err(anyhow!("request timed out")))
                    } else {
                        (task, Ok("done"))
                    }
                }
                .boxed()
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Both failures were persisted before the retries.
        let errors = store.load_errors(&task.task_id).await.unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.kind == ErrorKind::Timeout));
        assert!(task.last_error.is_some());
    }

    #[tokio::test]
    async fn fatal_failures_surface_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, store, task) = fixture(dir.path());
        store.put_task(&task).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();
        let (task, result): (Task, Result<()>) = supervisor
            .supervise(task, move |task, _retry| {
                calls_in.fetch_add(1, Ordering::SeqCst);
                async move { (task, Err(anyhow!("invalid document structure"))) }.boxed()
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let errors = store.load_errors(&task.task_id).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::Validation);
        assert!(!errors[0].recoverable);
    }

    #[tokio::test]
    async fn retry_budget_is_finite() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, store, task) = fixture(dir.path());
        store.put_task(&task).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();
        let (task, result): (Task, Result<()>) = supervisor
            .supervise(task, move |task, _retry| {
                calls_in.fetch_add(1, Ordering::SeqCst);
                async move { (task, Err(anyhow!("request timed out"))) }.boxed()
            })
            .await;

        assert!(result.is_err());
        // Initial attempt plus three retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(store.load_errors(&task.task_id).await.unwrap().len(), 4);
    }
}
