//! The agent worker pool.
//!
//! Submitted tasks wait in a priority-ordered queue. A single pump task moves
//! them onto workers: it reserves a slot on a worker chosen by the balancing
//! strategy, spawns the run and immediately looks at the next task. When every
//! eligible worker is saturated the pump sleeps for the poll interval or until
//! a running task finishes, whichever comes first.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, Stream};
use serde::Serialize;
use tandem_config::{BalancingStrategy, PoolConfig};
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::strategy::{self, Candidate};
use crate::task::{AgentTask, Completion, Job, TaskError, TaskResult};
use crate::worker::{OrchestratorFactory, SlotPermit, Worker, WorkerInfo};

/// Aggregate counters for the pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub total_capacity: usize,
    /// Tasks running right now.
    pub active: usize,
    /// Tasks waiting for a worker.
    pub queued: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Mean wall time of tasks that ran on a worker.
    pub average_duration: Duration,
}

#[derive(Default)]
struct Totals {
    submitted: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    runs: u64,
    run_time: Duration,
}

enum Dispatch {
    Dispatched,
    Saturated,
    Empty,
}

/// Distributes agent tasks over a fixed set of workers.
///
/// Cloning is cheap; clones share the same workers and queue. Submitting
/// requires a running tokio runtime.
#[derive(Clone)]
pub struct AgentPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    workers: Vec<Arc<Worker>>,
    strategy: BalancingStrategy,
    default_timeout: Duration,
    poll_interval: Duration,
    queue: Mutex<VecDeque<Job>>,
    cursor: Mutex<usize>,
    pumping: AtomicBool,
    wake: Notify,
    totals: Mutex<Totals>,
}

impl AgentPool {
    pub fn new(config: &PoolConfig, factory: Arc<dyn OrchestratorFactory>) -> Self {
        let workers = config
            .workers
            .iter()
            .map(|w| Arc::new(Worker::new(w.clone(), Arc::clone(&factory))))
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                workers,
                strategy: config.strategy,
                default_timeout: config.default_task_timeout(),
                poll_interval: config.poll_interval(),
                queue: Mutex::new(VecDeque::new()),
                cursor: Mutex::new(0),
                pumping: AtomicBool::new(false),
                wake: Notify::new(),
                totals: Mutex::new(Totals::default()),
            }),
        }
    }

    /// Create every worker's first orchestrator. Returns how many workers
    /// came online; the rest report `error` status and retry on demand.
    pub fn initialize(&self) -> usize {
        let ready = self
            .inner
            .workers
            .iter()
            .filter(|w| w.initialize().is_ok())
            .count();
        info!(
            ready,
            workers = self.inner.workers.len(),
            strategy = ?self.inner.strategy,
            "Worker pool initialized"
        );
        ready
    }

    /// Queue a task. The task is enqueued right away; the returned future
    /// resolves with its result and never fails.
    pub fn submit<T: Send + 'static>(
        &self,
        task: AgentTask<T>,
    ) -> impl Future<Output = TaskResult<T>> + Send + 'static {
        let task_id = task.id.clone();
        let (tx, rx) = oneshot::channel();
        debug!(task_id = %task_id, priority = task.priority, "Task submitted");

        self.inner.enqueue(Job::new(task, tx));
        self.inner.totals().submitted += 1;
        self.inner.trigger();

        async move {
            rx.await.unwrap_or_else(|_| {
                TaskResult::unstarted(task_id, TaskError::Cancelled("task was dropped by the pool".into()))
            })
        }
    }

    /// Queue every task and wait for all of them. Results come back in
    /// submission order, one per task.
    pub fn submit_all<T, I>(&self, tasks: I) -> impl Future<Output = Vec<TaskResult<T>>> + Send + 'static
    where
        T: Send + 'static,
        I: IntoIterator<Item = AgentTask<T>>,
    {
        let pending: Vec<_> = tasks.into_iter().map(|task| self.submit(task)).collect();
        futures::future::join_all(pending)
    }

    /// Queue every task and yield results as they finish.
    pub fn submit_stream<T, I>(&self, tasks: I) -> impl Stream<Item = TaskResult<T>> + Send + 'static
    where
        T: Send + 'static,
        I: IntoIterator<Item = AgentTask<T>>,
    {
        tasks
            .into_iter()
            .map(|task| self.submit(task))
            .collect::<FuturesUnordered<_>>()
    }

    /// Drop every queued task, resolving each caller with a cancelled
    /// result. Running tasks are left alone. Returns how many were dropped.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Job> = self.inner.queue().drain(..).collect();
        let count = drained.len();
        for job in drained {
            job.reject(TaskError::Cancelled("pool queue cleared".into()));
        }
        self.inner.totals().cancelled += count as u64;
        if count > 0 {
            info!(count, "Cancelled queued tasks");
        }
        count
    }

    pub fn stats(&self) -> PoolStats {
        let queued = self.inner.queue().len();
        let totals = self.inner.totals();
        let average_duration = if totals.runs == 0 {
            Duration::ZERO
        } else {
            totals.run_time.div_f64(totals.runs as f64)
        };

        PoolStats {
            workers: self.inner.workers.len(),
            total_capacity: self.inner.workers.iter().map(|w| w.concurrency()).sum(),
            active: self.inner.workers.iter().map(|w| w.load()).sum(),
            queued,
            submitted: totals.submitted,
            completed: totals.completed,
            failed: totals.failed,
            cancelled: totals.cancelled,
            average_duration,
        }
    }

    pub fn worker_info(&self) -> Vec<WorkerInfo> {
        self.inner.workers.iter().map(|w| w.info()).collect()
    }
}

impl PoolInner {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn totals(&self) -> MutexGuard<'_, Totals> {
        self.totals.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert behind every job of equal or higher priority.
    fn enqueue(&self, job: Job) {
        let mut queue = self.queue();
        let at = queue
            .iter()
            .position(|queued| queued.priority < job.priority)
            .unwrap_or(queue.len());
        queue.insert(at, job);
    }

    /// Start the pump unless it is already running, in which case wake it.
    fn trigger(self: &Arc<Self>) {
        if self.pumping.swap(true, Ordering::AcqRel) {
            self.wake.notify_one();
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.pump().await });
    }

    async fn pump(self: Arc<Self>) {
        loop {
            match self.dispatch_next() {
                Dispatch::Dispatched => {}
                Dispatch::Saturated => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                Dispatch::Empty => {
                    self.pumping.store(false, Ordering::Release);
                    // A submit may have landed between the empty check and the store.
                    if self.queue().is_empty() || self.pumping.swap(true, Ordering::AcqRel) {
                        return;
                    }
                }
            }
        }
    }

    fn dispatch_next(self: &Arc<Self>) -> Dispatch {
        let mut queue = self.queue();
        let Some(head) = queue.front() else {
            return Dispatch::Empty;
        };

        if !self.workers.iter().any(|w| w.accepts(&head.required_tags)) {
            let reason = format!("no worker carries tags [{}]", head.required_tags.join(", "));
            let Some(job) = queue.pop_front() else {
                return Dispatch::Empty;
            };
            drop(queue);
            warn!(task_id = %job.id, %reason, "Rejecting task");
            job.reject(TaskError::NoEligibleWorker(reason));
            self.totals().failed += 1;
            return Dispatch::Dispatched;
        }

        let Some(permit) = self.reserve(head) else {
            return Dispatch::Saturated;
        };
        let Some(job) = queue.pop_front() else {
            return Dispatch::Empty;
        };
        drop(queue);

        self.spawn_job(job, permit);
        Dispatch::Dispatched
    }

    /// Reserve a slot for `job`, trying its preferred worker first.
    fn reserve(&self, job: &Job) -> Option<SlotPermit> {
        // Failing workers only get work when no healthy worker could take it.
        let healthy = self
            .workers
            .iter()
            .any(|w| w.accepts(&job.required_tags) && !w.is_failing());
        let eligible = |w: &Worker| w.accepts(&job.required_tags) && (!healthy || !w.is_failing());

        if let Some(preferred) = &job.preferred_worker {
            let permit = self
                .workers
                .iter()
                .find(|w| w.id() == preferred && eligible(w))
                .and_then(|w| w.try_reserve());
            if permit.is_some() {
                return permit;
            }
        }

        let candidates: Vec<Candidate> = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| eligible(w) && w.has_capacity())
            .map(|(position, w)| Candidate {
                position,
                priority: w.priority(),
                load: w.load(),
            })
            .collect();

        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        let position = strategy::choose(self.strategy, &candidates, &mut cursor)?;
        self.workers[position].try_reserve()
    }

    fn spawn_job(self: &Arc<Self>, job: Job, permit: SlotPermit) {
        let inner = Arc::clone(self);
        let limit = job.timeout.unwrap_or(self.default_timeout);

        tokio::spawn(async move {
            let worker = Arc::clone(permit.worker());
            let started_at = Utc::now();
            let clock = Instant::now();
            debug!(task_id = %job.id, worker = %worker.id(), "Task started");

            let outcome = match tokio::time::timeout(limit, worker.run(&job.message, job.sink.clone())).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(task_id = %job.id, worker = %worker.id(), timeout_ms = limit.as_millis() as u64, "Task timed out");
                    Err(TaskError::Timeout(limit))
                }
            };
            let duration = clock.elapsed();
            drop(permit);

            let task_id = job.id.clone();
            let success = job.resolve(Completion {
                worker_id: Some(worker.id().to_string()),
                outcome,
                started_at,
                duration,
            });
            worker.record(success);
            inner.record(success, duration);
            debug!(
                task_id = %task_id,
                worker = %worker.id(),
                success,
                duration_ms = duration.as_millis() as u64,
                "Task finished"
            );

            inner.trigger();
        });
    }

    fn record(&self, success: bool, duration: Duration) {
        let mut totals = self.totals();
        if success {
            totals.completed += 1;
        } else {
            totals.failed += 1;
        }
        totals.runs += 1;
        totals.run_time += duration;
    }
}
