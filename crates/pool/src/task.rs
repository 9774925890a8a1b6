//! Tasks submitted to the pool and the results handed back.

use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tandem_agent::EventSink;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Why a task did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Task timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Task cancelled: {0}")]
    Cancelled(String),

    #[error("No eligible worker: {0}")]
    NoEligibleWorker(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Run failed: {0}")]
    Run(String),

    #[error("Result transform failed: {0}")]
    Transform(String),
}

type Transform<T> = Box<dyn FnOnce(String) -> Result<T, String> + Send>;

/// A unit of work: one message for one orchestrator run.
///
/// The final assistant text is passed through the task's result transform;
/// `AgentTask::new` starts with the identity transform, so `T = String`.
pub struct AgentTask<T = String> {
    pub id: String,
    pub message: String,
    /// Only workers carrying every one of these tags may run the task.
    pub required_tags: Vec<String>,
    /// Run on this worker when it has a free slot.
    pub preferred_worker: Option<String>,
    /// Higher runs first.
    pub priority: i32,
    /// Overrides the pool's default task timeout.
    pub timeout: Option<Duration>,
    /// Receives every event of the run as it happens.
    pub sink: Option<EventSink>,
    transform: Transform<T>,
}

impl AgentTask<String> {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message: message.into(),
            required_tags: Vec::new(),
            preferred_worker: None,
            priority: 0,
            timeout: None,
            sink: None,
            transform: Box::new(Ok::<String, String>),
        }
    }
}

impl<T: 'static> AgentTask<T> {
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn prefer_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.preferred_worker = Some(worker_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_sink(mut self, sink: EventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Map the result value.
    pub fn map_result<U, F>(self, f: F) -> AgentTask<U>
    where
        U: 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.try_map_result(move |value| Ok::<U, String>(f(value)))
    }

    /// Map the result value with a fallible function. An error fails the
    /// task with [`TaskError::Transform`].
    pub fn try_map_result<U, E, F>(self, f: F) -> AgentTask<U>
    where
        U: 'static,
        E: Display + 'static,
        F: FnOnce(T) -> Result<U, E> + Send + 'static,
    {
        let previous = self.transform;
        AgentTask {
            id: self.id,
            message: self.message,
            required_tags: self.required_tags,
            preferred_worker: self.preferred_worker,
            priority: self.priority,
            timeout: self.timeout,
            sink: self.sink,
            transform: Box::new(move |text| previous(text).and_then(|value| f(value).map_err(|e| e.to_string()))),
        }
    }
}

/// The outcome of one task. Every submitted task yields exactly one.
#[derive(Debug, Clone)]
pub struct TaskResult<T> {
    pub task_id: String,
    /// The worker that ran the task, if it was dispatched.
    pub worker_id: Option<String>,
    pub result: Result<T, TaskError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
}

impl<T> TaskResult<T> {
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn output(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.result.as_ref().err()
    }

    /// A result for a task that never reached a worker.
    pub(crate) fn unstarted(task_id: String, error: TaskError) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            worker_id: None,
            result: Err(error),
            started_at: now,
            finished_at: now,
            duration: Duration::ZERO,
        }
    }
}

/// What a worker reports back for a job.
pub(crate) struct Completion {
    pub worker_id: Option<String>,
    pub outcome: Result<String, TaskError>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

/// A task with its result type erased, as held in the queue.
pub(crate) struct Job {
    pub id: String,
    pub message: String,
    pub required_tags: Vec<String>,
    pub preferred_worker: Option<String>,
    pub priority: i32,
    pub timeout: Option<Duration>,
    pub sink: Option<EventSink>,
    resolve: Box<dyn FnOnce(Completion) -> bool + Send>,
}

impl Job {
    pub(crate) fn new<T: Send + 'static>(task: AgentTask<T>, reply: oneshot::Sender<TaskResult<T>>) -> Self {
        let AgentTask {
            id,
            message,
            required_tags,
            preferred_worker,
            priority,
            timeout,
            sink,
            transform,
        } = task;

        let task_id = id.clone();
        let resolve = Box::new(move |completion: Completion| {
            let result = completion
                .outcome
                .and_then(|text| transform(text).map_err(TaskError::Transform));
            let success = result.is_ok();
            let duration = completion.duration;
            let started_at = completion.started_at;
            let finished_at = started_at
                + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
            // The caller may have stopped waiting.
            let _ = reply.send(TaskResult {
                task_id,
                worker_id: completion.worker_id,
                result,
                started_at,
                finished_at,
                duration,
            });
            success
        });

        Self {
            id,
            message,
            required_tags,
            preferred_worker,
            priority,
            timeout,
            sink,
            resolve,
        }
    }

    /// Hand the outcome to the waiting caller. Returns whether the task
    /// succeeded after its result transform.
    pub(crate) fn resolve(self, completion: Completion) -> bool {
        (self.resolve)(completion)
    }

    /// Resolve without running.
    pub(crate) fn reject(self, error: TaskError) -> bool {
        self.resolve(Completion {
            worker_id: None,
            outcome: Err(error),
            started_at: Utc::now(),
            duration: Duration::ZERO,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(task: AgentTask<impl Send + 'static + std::fmt::Debug>, text: &str) -> String {
        let (tx, mut rx) = oneshot::channel();
        let job = Job::new(task, tx);
        job.resolve(Completion {
            worker_id: Some("w".into()),
            outcome: Ok(text.to_string()),
            started_at: Utc::now(),
            duration: Duration::from_millis(5),
        });
        format!("{:?}", rx.try_recv().unwrap().result)
    }

    #[test]
    fn new_task_defaults() {
        let task = AgentTask::new("summarize the diff");
        assert_eq!(task.message, "summarize the diff");
        assert_eq!(task.priority, 0);
        assert!(task.required_tags.is_empty());
        assert!(Uuid::parse_str(&task.id).is_ok());
        assert_ne!(task.id, AgentTask::new("x").id);
    }

    #[test]
    fn identity_transform_passes_text_through() {
        assert_eq!(run(AgentTask::new("m"), "hello"), r#"Ok("hello")"#);
    }

    #[test]
    fn transforms_compose() {
        let task = AgentTask::new("m").map_result(|s| s.len()).map_result(|n| n * 2);
        assert_eq!(run(task, "four"), "Ok(8)");
    }

    #[test]
    fn failing_transform_fails_the_task() {
        let task = AgentTask::new("m").try_map_result(|s| s.parse::<u32>());
        assert_eq!(
            run(task, "not a number"),
            r#"Err(Transform("invalid digit found in string"))"#
        );
    }

    #[test]
    fn rejected_job_reports_error() {
        let (tx, mut rx) = oneshot::channel();
        let job = Job::new(AgentTask::new("m").with_id("t-1"), tx);
        assert!(!job.reject(TaskError::Cancelled("shutdown".into())));

        let result = rx.try_recv().unwrap();
        assert_eq!(result.task_id, "t-1");
        assert!(!result.success());
        assert!(result.worker_id.is_none());
        assert_eq!(result.error().unwrap().to_string(), "Task cancelled: shutdown");
    }

    #[test]
    fn timeout_error_mentions_duration() {
        let err = TaskError::Timeout(Duration::from_millis(50));
        assert_eq!(err.to_string(), "Task timed out after 50ms");
    }
}
