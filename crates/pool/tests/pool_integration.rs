//! End-to-end tests for the agent worker pool.
//!
//! Every worker runs real orchestrators over a sleeping agent, so these tests
//! cover dispatch, capacity, timeouts and cancellation through the whole
//! stack from `submit` down to the per-turn agent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tandem_agent::{AgentEvent, EventSink, OrchestratorOptions, RunOrchestrator, TurnAgent};
use tandem_config::{BalancingStrategy, PoolConfig, WorkerConfig};
use tandem_core::{Message, ModelSelection, Result};
use tandem_pool::{AgentPool, AgentTask, TaskError, WorkerStatus};
use tandem_providers::ProviderRegistry;
use tokio::time::Instant;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_pool=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

// ── Sleeping agent ───────────────────────────────────────────────────────

/// Concurrency seen by one worker's agents.
#[derive(Default)]
struct Tracker {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

struct InFlight<'a>(&'a Tracker);

impl Tracker {
    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Replies after sleeping for the duration named by a `sleep:<ms>` prefix.
struct SleepyAgent {
    worker: String,
    tracker: Arc<Tracker>,
    started: Arc<Mutex<Vec<String>>>,
    history: Mutex<Vec<Message>>,
}

fn delay(message: &str) -> Duration {
    message
        .strip_prefix("sleep:")
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|ms| ms.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl TurnAgent for SleepyAgent {
    async fn send(&self, message: &str, _explain_edits: bool, sink: EventSink) -> Result<String> {
        self.history.lock().unwrap().push(Message::user(message));
        self.started.lock().unwrap().push(message.to_string());
        let _slot = self.tracker.enter();

        sink(AgentEvent::MessageDelta {
            content: "working".into(),
        });
        tokio::time::sleep(delay(message)).await;

        let reply = format!("{} handled {message}", self.worker);
        self.history.lock().unwrap().push(Message::assistant(reply.clone()));
        Ok(reply)
    }

    fn load_history(&self, history: Vec<Message>) {
        *self.history.lock().unwrap() = history;
    }

    fn history(&self) -> Vec<Message> {
        self.history.lock().unwrap().clone()
    }

    fn clear_history(&self) {
        self.history.lock().unwrap().clear();
    }
}

// ── Harness ──────────────────────────────────────────────────────────────

struct Harness {
    pool: AgentPool,
    trackers: HashMap<String, Arc<Tracker>>,
    started: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    fn new(strategy: BalancingStrategy, workers: Vec<WorkerConfig>) -> Self {
        init_tracing();
        let trackers: HashMap<String, Arc<Tracker>> = workers
            .iter()
            .map(|w| (w.id.clone(), Arc::new(Tracker::default())))
            .collect();
        let started = Arc::new(Mutex::new(Vec::new()));

        let table = trackers.clone();
        let log = Arc::clone(&started);
        let factory = move |worker: &WorkerConfig| -> Result<RunOrchestrator> {
            let id = worker.id.clone();
            let tracker = table.get(&id).cloned().unwrap_or_default();
            let log = Arc::clone(&log);
            let agents = move |_: &ModelSelection| -> Result<Arc<dyn TurnAgent>> {
                Ok(Arc::new(SleepyAgent {
                    worker: id.clone(),
                    tracker: Arc::clone(&tracker),
                    started: Arc::clone(&log),
                    history: Mutex::new(Vec::new()),
                }))
            };
            Ok(RunOrchestrator::new(
                ModelSelection::new("local", "sleepy-1"),
                Arc::new(agents),
                Arc::new(ProviderRegistry::new(Vec::new())),
                OrchestratorOptions::default(),
            ))
        };

        let config = PoolConfig {
            strategy,
            workers,
            ..PoolConfig::default()
        };
        let pool = AgentPool::new(&config, Arc::new(factory));
        pool.initialize();

        Self {
            pool,
            trackers,
            started,
        }
    }

    fn peak(&self, worker: &str) -> usize {
        self.trackers[worker].peak()
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

fn two_workers() -> Vec<WorkerConfig> {
    vec![WorkerConfig::new("w1", 1), WorkerConfig::new("w2", 2)]
}

fn task(id: &str, message: &str) -> AgentTask {
    AgentTask::new(message).with_id(id)
}

// ── Dispatch ─────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submit_all_returns_one_result_per_task_within_ceilings() {
    let harness = Harness::new(BalancingStrategy::LeastBusy, two_workers());

    let tasks: Vec<_> = (0..9).map(|i| task(&format!("t{i}"), "sleep:20")).collect();
    let results = harness.pool.submit_all(tasks).await;

    assert_eq!(results.len(), 9);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.task_id, format!("t{i}"));
        assert!(result.success(), "{:?}", result.error());
        assert!(result.finished_at >= result.started_at);
    }
    assert!(harness.peak("w1") <= 1);
    assert!(harness.peak("w2") <= 2);

    let stats = harness.pool.stats();
    assert_eq!(stats.submitted, 9);
    assert_eq!(stats.completed, 9);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.queued, 0);
    assert!(stats.average_duration >= Duration::from_millis(20));

    let info = harness.pool.worker_info();
    assert_eq!(info.iter().map(|w| w.completed).sum::<u64>(), 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_strategy_respects_ceilings() {
    for strategy in [
        BalancingStrategy::RoundRobin,
        BalancingStrategy::Random,
        BalancingStrategy::Priority,
        BalancingStrategy::LeastBusy,
    ] {
        let harness = Harness::new(
            strategy,
            vec![
                WorkerConfig::new("a", 1).with_priority(5),
                WorkerConfig::new("b", 2),
                WorkerConfig::new("c", 3).with_priority(1),
            ],
        );
        let tasks: Vec<_> = (0..18).map(|i| task(&format!("t{i}"), "sleep:10")).collect();
        let results = harness.pool.submit_all(tasks).await;

        assert!(results.iter().all(|r| r.success()), "{strategy:?}");
        assert!(harness.peak("a") <= 1, "{strategy:?}");
        assert!(harness.peak("b") <= 2, "{strategy:?}");
        assert!(harness.peak("c") <= 3, "{strategy:?}");
    }
}

#[tokio::test]
async fn least_busy_spills_onto_the_larger_worker() {
    let harness = Harness::new(BalancingStrategy::LeastBusy, two_workers());

    let results = harness
        .pool
        .submit_all(vec![
            task("t1", "sleep:100"),
            task("t2", "sleep:100"),
            task("t3", "sleep:100"),
        ])
        .await;

    let placed: Vec<_> = results.iter().map(|r| r.worker_id.as_deref().unwrap()).collect();
    assert_eq!(placed, vec!["w1", "w2", "w2"]);
    assert_eq!(harness.peak("w2"), 2);
}

#[tokio::test]
async fn round_robin_alternates() {
    let harness = Harness::new(
        BalancingStrategy::RoundRobin,
        vec![WorkerConfig::new("w1", 2), WorkerConfig::new("w2", 2)],
    );

    let results = harness
        .pool
        .submit_all((0..4).map(|i| task(&format!("t{i}"), "sleep:50")))
        .await;

    let placed: Vec<_> = results.iter().map(|r| r.worker_id.as_deref().unwrap()).collect();
    assert_eq!(placed, vec!["w1", "w2", "w1", "w2"]);
}

#[tokio::test]
async fn priority_strategy_prefers_high_priority_workers() {
    let harness = Harness::new(
        BalancingStrategy::Priority,
        vec![WorkerConfig::new("low", 2), WorkerConfig::new("high", 1).with_priority(10)],
    );

    let results = harness
        .pool
        .submit_all(vec![task("t1", "sleep:50"), task("t2", "sleep:50")])
        .await;

    assert_eq!(results[0].worker_id.as_deref(), Some("high"));
    assert_eq!(results[1].worker_id.as_deref(), Some("low"));
}

#[tokio::test]
async fn tags_and_preferred_worker_steer_placement() {
    let harness = Harness::new(
        BalancingStrategy::LeastBusy,
        vec![
            WorkerConfig::new("rust", 1).with_tags(["rust"]),
            WorkerConfig::new("py", 1).with_tags(["python"]),
        ],
    );

    let tagged = harness
        .pool
        .submit(task("tagged", "hello").with_tags(["python"]))
        .await;
    assert_eq!(tagged.worker_id.as_deref(), Some("py"));

    let preferred = harness.pool.submit(task("preferred", "hello").prefer_worker("py")).await;
    assert_eq!(preferred.worker_id.as_deref(), Some("py"));

    let impossible = harness
        .pool
        .submit(task("impossible", "hello").with_tags(["rust", "python"]))
        .await;
    assert!(matches!(impossible.error(), Some(TaskError::NoEligibleWorker(_))));
    assert!(impossible.worker_id.is_none());

    // The rejected task does not hold up the queue.
    let after = harness.pool.submit(task("after", "hello")).await;
    assert!(after.success());
}

#[tokio::test]
async fn higher_priority_tasks_start_first() {
    let harness = Harness::new(BalancingStrategy::LeastBusy, vec![WorkerConfig::new("w", 1)]);

    let blocker = harness.pool.submit(task("blocker", "sleep:80 blocker"));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let low = harness.pool.submit(task("low", "sleep:1 low"));
    let mid = harness.pool.submit(task("mid", "sleep:1 mid").with_priority(1));
    let high = harness.pool.submit(task("high", "sleep:1 high").with_priority(5));
    let (_, low, mid, high) = tokio::join!(blocker, low, mid, high);

    assert!(low.success() && mid.success() && high.success());
    assert_eq!(
        harness.started(),
        vec!["sleep:80 blocker", "sleep:1 high", "sleep:1 mid", "sleep:1 low"]
    );
}

#[tokio::test]
async fn submit_stream_yields_in_completion_order() {
    let harness = Harness::new(
        BalancingStrategy::LeastBusy,
        vec![WorkerConfig::new("w1", 1), WorkerConfig::new("w2", 1)],
    );

    let order: Vec<String> = harness
        .pool
        .submit_stream(vec![task("slow", "sleep:150"), task("fast", "sleep:10")])
        .map(|result| result.task_id)
        .collect()
        .await;

    assert_eq!(order, vec!["fast", "slow"]);
}

// ── Timeouts and cancellation ────────────────────────────────────────────

#[tokio::test]
async fn slow_task_times_out_and_pool_recovers() {
    let harness = Harness::new(BalancingStrategy::LeastBusy, vec![WorkerConfig::new("w", 1)]);

    let begun = Instant::now();
    let result = harness
        .pool
        .submit(task("slow", "sleep:200").with_timeout(Duration::from_millis(50)))
        .await;
    let waited = begun.elapsed();

    assert!(!result.success());
    assert_eq!(result.error(), Some(&TaskError::Timeout(Duration::from_millis(50))));
    assert!(result.error().unwrap().to_string().contains("timed out"));
    assert!(waited < Duration::from_millis(150), "waited {waited:?}");
    assert_eq!(result.worker_id.as_deref(), Some("w"));

    let next = harness.pool.submit(task("next", "sleep:5")).await;
    assert!(next.success(), "{:?}", next.error());

    let stats = harness.pool.stats();
    assert_eq!((stats.completed, stats.failed), (1, 1));
    assert_eq!(harness.pool.worker_info()[0].failed, 1);
}

#[tokio::test]
async fn cancel_all_resolves_queued_tasks() {
    let harness = Harness::new(BalancingStrategy::LeastBusy, vec![WorkerConfig::new("w", 1)]);

    let running = harness.pool.submit(task("running", "sleep:100"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let queued_a = harness.pool.submit(task("a", "sleep:100"));
    let queued_b = harness.pool.submit(task("b", "sleep:100"));

    assert_eq!(harness.pool.stats().queued, 2);
    assert_eq!(harness.pool.cancel_all(), 2);
    assert_eq!(harness.pool.cancel_all(), 0);

    let (running, a, b) = tokio::join!(running, queued_a, queued_b);
    assert!(running.success());
    for cancelled in [a, b] {
        assert!(matches!(cancelled.error(), Some(TaskError::Cancelled(_))));
        assert!(cancelled.worker_id.is_none());
    }
    assert_eq!(harness.pool.stats().cancelled, 2);
    assert_eq!(harness.started(), vec!["sleep:100"]);
}

// ── Results and events ───────────────────────────────────────────────────

#[tokio::test]
async fn sink_receives_run_events() {
    let harness = Harness::new(BalancingStrategy::LeastBusy, vec![WorkerConfig::new("w", 1)]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let sink: EventSink = Arc::new(move |event: AgentEvent| log.lock().unwrap().push(event.event_type()));

    let result = harness.pool.submit(task("t", "hello").with_sink(sink)).await;

    assert_eq!(result.output().map(String::as_str), Some("w handled hello"));
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["message.start", "message.delta", "message.complete"]
    );
}

#[tokio::test]
async fn result_transforms_apply() {
    let harness = Harness::new(BalancingStrategy::LeastBusy, vec![WorkerConfig::new("w", 2)]);

    let words = harness
        .pool
        .submit(task("words", "hello").map_result(|text| text.split_whitespace().count()))
        .await;
    assert_eq!(words.output(), Some(&3));

    let number = harness
        .pool
        .submit(task("number", "hello").try_map_result(|text| text.parse::<u64>()))
        .await;
    assert!(matches!(number.error(), Some(TaskError::Transform(_))));
    assert_eq!(number.worker_id.as_deref(), Some("w"));
    assert_eq!(harness.pool.stats().failed, 1);
}

// ── Worker lifecycle ─────────────────────────────────────────────────────

#[tokio::test]
async fn worker_status_follows_lifecycle() {
    init_tracing();
    let config = PoolConfig {
        workers: vec![WorkerConfig::new("w", 1)],
        ..PoolConfig::default()
    };
    let factory = |_: &WorkerConfig| -> Result<RunOrchestrator> {
        Ok(RunOrchestrator::new(
            ModelSelection::new("local", "sleepy-1"),
            Arc::new(|_: &ModelSelection| -> Result<Arc<dyn TurnAgent>> {
                Ok(Arc::new(SleepyAgent {
                    worker: "w".into(),
                    tracker: Arc::new(Tracker::default()),
                    started: Arc::new(Mutex::new(Vec::new())),
                    history: Mutex::new(Vec::new()),
                }))
            }),
            Arc::new(ProviderRegistry::new(Vec::new())),
            OrchestratorOptions::default(),
        ))
    };
    let pool = AgentPool::new(&config, Arc::new(factory));

    assert_eq!(pool.worker_info()[0].status, WorkerStatus::Offline);
    assert_eq!(pool.initialize(), 1);
    assert_eq!(pool.worker_info()[0].status, WorkerStatus::Idle);

    let running = pool.submit(task("t", "sleep:80"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let info = &pool.worker_info()[0];
    assert_eq!(info.status, WorkerStatus::Busy);
    assert_eq!(info.active, 1);

    assert!(running.await.success());
    assert_eq!(pool.worker_info()[0].status, WorkerStatus::Idle);
}

#[tokio::test]
async fn failing_factory_reports_worker_errors() {
    init_tracing();
    let config = PoolConfig {
        workers: vec![WorkerConfig::new("w", 1)],
        ..PoolConfig::default()
    };
    let factory = |_: &WorkerConfig| -> Result<RunOrchestrator> {
        Err(tandem_core::Error::Config {
            message: "no providers configured".into(),
        })
    };
    let pool = AgentPool::new(&config, Arc::new(factory));

    assert_eq!(pool.initialize(), 0);
    let info = &pool.worker_info()[0];
    assert_eq!(info.status, WorkerStatus::Error);
    assert_eq!(
        info.last_error.as_deref(),
        Some("Configuration error: no providers configured")
    );

    let result = pool.submit(task("t", "hello")).await;
    assert!(matches!(result.error(), Some(TaskError::Worker(_))));
    assert_eq!(result.worker_id.as_deref(), Some("w"));
    assert_eq!(pool.stats().failed, 1);
    assert_eq!(pool.stats().active, 0);
}

#[tokio::test]
async fn broken_worker_is_skipped_while_a_healthy_one_exists() {
    init_tracing();
    let config = PoolConfig {
        strategy: BalancingStrategy::LeastBusy,
        workers: vec![WorkerConfig::new("broken", 1), WorkerConfig::new("good", 1)],
        ..PoolConfig::default()
    };
    let factory = |worker: &WorkerConfig| -> Result<RunOrchestrator> {
        if worker.id == "broken" {
            return Err(tandem_core::Error::Config {
                message: "missing api key".into(),
            });
        }
        Ok(RunOrchestrator::new(
            ModelSelection::new("local", "sleepy-1"),
            Arc::new(|_: &ModelSelection| -> Result<Arc<dyn TurnAgent>> {
                Ok(Arc::new(SleepyAgent {
                    worker: "good".into(),
                    tracker: Arc::new(Tracker::default()),
                    started: Arc::new(Mutex::new(Vec::new())),
                    history: Mutex::new(Vec::new()),
                }))
            }),
            Arc::new(ProviderRegistry::new(Vec::new())),
            OrchestratorOptions::default(),
        ))
    };
    let pool = AgentPool::new(&config, Arc::new(factory));
    assert_eq!(pool.initialize(), 1);

    let tasks: Vec<_> = (0..6).map(|i| task(&format!("t{i}"), "sleep:5")).collect();
    let results = pool.submit_all(tasks).await;

    assert_eq!(results.len(), 6);
    for result in &results {
        assert!(result.success(), "{:?}", result.error());
        assert_eq!(result.worker_id.as_deref(), Some("good"));
    }
    let broken = &pool.worker_info()[0];
    assert_eq!(broken.status, WorkerStatus::Error);
    assert_eq!(broken.failed, 0);
    assert_eq!(pool.stats().failed, 0);
}

#[tokio::test]
async fn broken_worker_retries_when_it_is_the_only_match() {
    init_tracing();
    let attempts = Arc::new(AtomicUsize::new(0));
    let config = PoolConfig {
        workers: vec![
            WorkerConfig::new("flaky", 1).with_tags(["gpu"]),
            WorkerConfig::new("plain", 1),
        ],
        ..PoolConfig::default()
    };
    let counter = Arc::clone(&attempts);
    let factory = move |worker: &WorkerConfig| -> Result<RunOrchestrator> {
        if worker.id == "flaky" {
            counter.fetch_add(1, Ordering::SeqCst);
            return Err(tandem_core::Error::Config {
                message: "driver not loaded".into(),
            });
        }
        Err(tandem_core::Error::Config {
            message: "no providers configured".into(),
        })
    };
    let pool = AgentPool::new(&config, Arc::new(factory));
    pool.initialize();
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    let result = pool.submit(task("t", "render").with_tags(["gpu"])).await;
    assert!(matches!(result.error(), Some(TaskError::Worker(_))));
    assert_eq!(result.worker_id.as_deref(), Some("flaky"));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}
