//! Pool workers.
//!
//! A worker is a named slot group with a concurrency ceiling. Each occupied
//! slot runs its own [`RunOrchestrator`], since an orchestrator processes one
//! message at a time. Idle orchestrators are kept and reused; orchestrators
//! still winding down from a cancelled or timed-out run are discarded.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tandem_agent::{EventSink, RunOrchestrator};
use tandem_config::WorkerConfig;
use tracing::{debug, warn};

use crate::task::TaskError;

/// Creates the orchestrators a worker runs tasks on.
pub trait OrchestratorFactory: Send + Sync {
    fn create(&self, worker: &WorkerConfig) -> tandem_core::Result<RunOrchestrator>;
}

impl<F> OrchestratorFactory for F
where
    F: Fn(&WorkerConfig) -> tandem_core::Result<RunOrchestrator> + Send + Sync,
{
    fn create(&self, worker: &WorkerConfig) -> tandem_core::Result<RunOrchestrator> {
        self(worker)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Error,
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: String,
    pub status: WorkerStatus,
    pub active: usize,
    pub concurrency: usize,
    pub priority: i32,
    pub tags: Vec<String>,
    pub completed: u64,
    pub failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Default)]
struct Slots {
    /// Set once the first orchestrator exists.
    online: bool,
    last_error: Option<String>,
    idle: Vec<RunOrchestrator>,
}

pub struct Worker {
    config: WorkerConfig,
    factory: Arc<dyn OrchestratorFactory>,
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    slots: Mutex<Slots>,
}

impl Worker {
    pub(crate) fn new(config: WorkerConfig, factory: Arc<dyn OrchestratorFactory>) -> Self {
        Self {
            config,
            factory,
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            slots: Mutex::new(Slots::default()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn priority(&self) -> i32 {
        self.config.priority
    }

    pub fn concurrency(&self) -> usize {
        self.config.concurrency
    }

    /// Tasks currently running on this worker.
    pub fn load(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn has_capacity(&self) -> bool {
        self.load() < self.config.concurrency
    }

    /// Whether this worker could ever run a task needing `tags`.
    pub fn accepts(&self, tags: &[String]) -> bool {
        self.config.concurrency > 0 && tags.iter().all(|t| self.config.tags.contains(t))
    }

    /// The last orchestrator creation failed.
    pub fn is_failing(&self) -> bool {
        self.slots().last_error.is_some()
    }

    pub fn status(&self) -> WorkerStatus {
        let slots = self.slots();
        if slots.last_error.is_some() {
            WorkerStatus::Error
        } else if !slots.online {
            WorkerStatus::Offline
        } else if self.load() >= self.config.concurrency {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Idle
        }
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.config.id.clone(),
            status: self.status(),
            active: self.load(),
            concurrency: self.config.concurrency,
            priority: self.config.priority,
            tags: self.config.tags.clone(),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            last_error: self.slots().last_error.clone(),
        }
    }

    /// Create the first orchestrator up front.
    pub(crate) fn initialize(&self) -> tandem_core::Result<()> {
        if self.slots().online {
            return Ok(());
        }
        let orchestrator = self.create_orchestrator()?;
        self.slots().idle.push(orchestrator);
        Ok(())
    }

    fn create_orchestrator(&self) -> tandem_core::Result<RunOrchestrator> {
        match self.factory.create(&self.config) {
            Ok(orchestrator) => {
                let mut slots = self.slots();
                slots.online = true;
                slots.last_error = None;
                debug!(worker = %self.config.id, "Created orchestrator");
                Ok(orchestrator)
            }
            Err(e) => {
                warn!(worker = %self.config.id, error = %e, "Failed to create orchestrator");
                self.slots().last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Claim a slot. Fails once the ceiling is reached; the slot is released
    /// when the permit drops.
    pub(crate) fn try_reserve(self: &Arc<Self>) -> Option<SlotPermit> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.config.concurrency {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(SlotPermit {
                        worker: Arc::clone(self),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn checkout(&self) -> Result<RunOrchestrator, TaskError> {
        if let Some(orchestrator) = self.slots().idle.pop() {
            return Ok(orchestrator);
        }
        self.create_orchestrator()
            .map_err(|e| TaskError::Worker(e.to_string()))
    }

    fn checkin(&self, orchestrator: RunOrchestrator) {
        if orchestrator.is_processing() {
            debug!(worker = %self.config.id, "Discarding orchestrator that is still winding down");
            return;
        }
        self.slots().idle.push(orchestrator);
    }

    /// Run one message to completion on a free orchestrator.
    ///
    /// Dropping the returned future cancels the run and discards the
    /// orchestrator.
    pub(crate) async fn run(&self, message: &str, sink: Option<EventSink>) -> Result<String, TaskError> {
        let orchestrator = self.checkout()?;
        let stream = orchestrator
            .send(message)
            .map_err(|e| TaskError::Run(e.to_string()))?;

        let result = stream
            .final_text_with(|event| {
                if let Some(sink) = &sink {
                    sink(event.clone());
                }
            })
            .await
            .map_err(|e| TaskError::Run(e.to_string()));

        self.checkin(orchestrator);
        result
    }

    pub(crate) fn record(&self, success: bool) {
        if success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A reserved slot on a worker.
pub(crate) struct SlotPermit {
    worker: Arc<Worker>,
}

impl SlotPermit {
    pub(crate) fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.worker.active.fetch_sub(1, Ordering::AcqRel);
    }
}
