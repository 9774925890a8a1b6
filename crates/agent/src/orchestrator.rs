//! Run orchestrator: drives one conversation's turns.
//!
//! The orchestrator owns the conversation state (model selection, cached
//! history, the lazily created per-turn agent) and turns each `send` into a
//! stream of [`AgentEvent`]s. Only one run may be in flight at a time.
//!
//! A run is a sequence of attempts. Each attempt gets its own event channel
//! and starts with `message.start`. Recoverable provider failures switch to
//! the next configured provider in preference order and retry the same
//! message; the consumer sees a `provider.fallback` event and then the next
//! attempt's events, in order.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use tandem_config::{FallbackTarget, OrchestratorConfig};
use tandem_core::{Error, Message, ModelSelection, Result};
use tandem_providers::{classify, FailoverReason, ProviderRegistry};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::channel::{event_channel, ChannelError, EventReceiver, EventSender};
use crate::event::AgentEvent;
use crate::history::sanitize_history;
use crate::turn::{AgentFactory, EventSink, TurnAgent};

/// Errors returned by the orchestrator's own API. Failures inside a run are
/// reported as `error` events instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Orchestrator is already processing a message")]
    AlreadyProcessing,

    #[error("{0}")]
    Run(String),
}

/// Run-level knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Attempts per send, including fallback retries.
    pub max_attempts: u32,
    /// Deadline for a whole send.
    pub run_timeout: Duration,
    /// Ask the agent to explain file edits.
    pub explain_edits: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

impl OrchestratorOptions {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            run_timeout: config.run_timeout(),
            explain_edits: config.explain_edits,
        }
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }
}

struct ActiveRun {
    id: u64,
    token: CancellationToken,
    channel: EventSender<AgentEvent>,
    agent: Option<Arc<dyn TurnAgent>>,
    cancel_reason: Option<String>,
}

struct RunState {
    selection: ModelSelection,
    agent: Option<Arc<dyn TurnAgent>>,
    /// History as of the last finished run; loaded into new agents.
    history: Vec<Message>,
    failed_providers: HashSet<String>,
    active: Option<ActiveRun>,
}

impl RunState {
    /// Whether `run` is still the active run. A run superseded by
    /// `force_reset` must not touch the conversation state again.
    fn owns(&self, run: u64) -> bool {
        self.active.as_ref().is_some_and(|a| a.id == run)
    }

    fn repair_history(&mut self) -> usize {
        let mut history = match &self.agent {
            Some(agent) => agent.history(),
            None => self.history.clone(),
        };
        let repaired = sanitize_history(&mut history);
        if let Some(agent) = &self.agent {
            agent.load_history(history.clone());
        }
        self.history = history;
        repaired
    }
}

struct Inner {
    factory: Arc<dyn AgentFactory>,
    providers: Arc<ProviderRegistry>,
    options: OrchestratorOptions,
    /// 0 when idle, otherwise the id of the run holding the slot.
    processing: AtomicU64,
    next_run: AtomicU64,
    state: Mutex<RunState>,
}

/// Handle to one conversation. Clones share the same state.
#[derive(Clone)]
pub struct RunOrchestrator {
    inner: Arc<Inner>,
}

impl RunOrchestrator {
    pub fn new(
        selection: ModelSelection,
        factory: Arc<dyn AgentFactory>,
        providers: Arc<ProviderRegistry>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                providers,
                options,
                processing: AtomicU64::new(0),
                next_run: AtomicU64::new(0),
                state: Mutex::new(RunState {
                    selection,
                    agent: None,
                    history: Vec::new(),
                    failed_providers: HashSet::new(),
                    active: None,
                }),
            }),
        }
    }

    /// Start processing `message`.
    ///
    /// Fails with [`OrchestratorError::AlreadyProcessing`] while another run
    /// is in flight. Must be called from within a tokio runtime. Dropping the
    /// returned stream cancels the run.
    pub fn send(&self, message: impl Into<String>) -> std::result::Result<EventStream, OrchestratorError> {
        let run = self.inner.next_run.fetch_add(1, Ordering::Relaxed) + 1;
        if self
            .inner
            .processing
            .compare_exchange(0, run, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(OrchestratorError::AlreadyProcessing);
        }

        let token = CancellationToken::new();
        let (channel, reader) = event_channel();
        let (attempts_tx, attempts_rx) = mpsc::unbounded_channel();
        let _ = attempts_tx.send(reader);

        self.inner.lock().active = Some(ActiveRun {
            id: run,
            token: token.clone(),
            channel: channel.clone(),
            agent: None,
            cancel_reason: None,
        });

        let message = message.into();
        debug!(run, chars = message.len(), "Run accepted");
        tokio::spawn(Arc::clone(&self.inner).drive(run, message, token.clone(), channel, attempts_tx));

        Ok(EventStream::new(attempts_rx, token.drop_guard()))
    }

    /// Cancel the in-flight run, if any. The consumer sees one `error` event
    /// carrying `reason`. Returns whether a run was cancelled.
    ///
    /// The run winds down asynchronously; `is_processing` turns false once
    /// it has.
    pub fn cancel(&self, reason: &str) -> bool {
        let mut state = self.inner.lock();
        let Some(active) = state.active.as_mut() else {
            return false;
        };
        if active.cancel_reason.is_some() {
            return false;
        }

        info!(run = active.id, reason, "Cancelling run");
        active.cancel_reason = Some(reason.to_string());
        active.channel.fail(ChannelError::Cancelled(reason.to_string()));
        active.token.cancel();
        if let Some(agent) = active.agent.take() {
            agent.cancel(reason);
        }
        true
    }

    /// Switch to another provider/model. The current agent's history is kept
    /// and copied into the agent created for the next send.
    pub fn switch_model(&self, selection: ModelSelection) {
        let mut state = self.inner.lock();
        if let Some(agent) = state.agent.take() {
            state.history = agent.history();
        }
        info!(
            from = %state.selection.model,
            to = %selection.model,
            provider = %selection.provider,
            "Switching model"
        );
        state.selection = selection;
    }

    pub fn selection(&self) -> ModelSelection {
        self.inner.lock().selection.clone()
    }

    /// Current conversation history.
    pub fn history(&self) -> Vec<Message> {
        let state = self.inner.lock();
        match &state.agent {
            Some(agent) => agent.history(),
            None => state.history.clone(),
        }
    }

    pub fn clear_history(&self) {
        let mut state = self.inner.lock();
        state.history.clear();
        if let Some(agent) = &state.agent {
            agent.clear_history();
        }
    }

    /// Answer orphaned tool calls in the history. Returns how many results
    /// were synthesized.
    pub fn sanitize_history(&self) -> usize {
        self.inner.lock().repair_history()
    }

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::Acquire) != 0
    }

    /// Cancel, drop the agent and release the processing slot immediately.
    pub fn force_reset(&self) {
        self.cancel("orchestrator reset");
        let mut state = self.inner.lock();
        let mut history = match state.agent.take() {
            Some(agent) => agent.history(),
            None => std::mem::take(&mut state.history),
        };
        let repaired = sanitize_history(&mut history);
        if repaired > 0 {
            warn!(repaired, "Answered interrupted tool calls in history");
        }
        state.history = history;
        state.active = None;
        self.inner.processing.store(0, Ordering::Release);
        warn!("Orchestrator force-reset");
    }
}

/// Releases the run's slot and fails its current channel if `drive` ends
/// without doing so itself, e.g. when the agent panics.
struct RunGuard<'a> {
    inner: &'a Inner,
    run: u64,
    channel: EventSender<AgentEvent>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.inner.finish(self.run);
        if self
            .channel
            .fail(ChannelError::Failed("run aborted unexpectedly".into()))
        {
            warn!(run = self.run, "Run aborted before reaching a terminal event");
        }
    }
}

/// How a run ends on its last channel.
enum Outcome {
    Complete(String),
    Failed(ChannelError),
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn drive(
        self: Arc<Self>,
        run: u64,
        message: String,
        token: CancellationToken,
        first: EventSender<AgentEvent>,
        attempts: mpsc::UnboundedSender<EventReceiver<AgentEvent>>,
    ) {
        let mut guard = RunGuard {
            inner: &self,
            run,
            channel: first,
        };
        self.lock().failed_providers.clear();

        let deadline = Instant::now().checked_add(self.options.run_timeout);
        let max_attempts = self.options.max_attempts.max(1);
        let mut attempt = 1;

        let outcome = loop {
            let selection = self.lock().selection.clone();
            let channel = &guard.channel;
            channel.push(AgentEvent::MessageStart {
                provider: selection.provider.clone(),
                model: selection.model.clone(),
            });
            info!(run, attempt, provider = %selection.provider, model = %selection.model, "Starting attempt");

            let error = match self.attempt(run, &message, &selection, &token, deadline, channel).await {
                Ok(content) => {
                    let mut state = self.lock();
                    if state.owns(run) {
                        if let Some(history) = state.agent.as_ref().map(|agent| agent.history()) {
                            state.history = history;
                        }
                    }
                    break Outcome::Complete(content);
                }
                Err(e) => e,
            };

            if error.is_interruption() {
                warn!(run, error = %error, "Run interrupted");
                self.preserve_partial_history(run);
                break Outcome::Failed(match error {
                    Error::Cancelled(reason) => ChannelError::Cancelled(reason),
                    other => ChannelError::Failed(other.to_string()),
                });
            }

            let Some((target, reason)) = self.fallback_target(run, &selection, &error, attempt < max_attempts)
            else {
                warn!(run, attempt, error = %error, "Run failed");
                self.preserve_partial_history(run);
                break Outcome::Failed(ChannelError::Failed(error.to_string()));
            };

            warn!(
                run,
                from = %selection.provider,
                to = %target.provider,
                reason = %reason,
                error = %error,
                "Provider failed, falling back"
            );
            channel.push(AgentEvent::ProviderFallback {
                from_provider: selection.provider.clone(),
                from_model: selection.model.clone(),
                to_provider: target.provider.clone(),
                to_model: target.model.clone(),
                reason: reason.to_string(),
                error: error.to_string(),
            });
            channel.close();

            let (next, reader) = event_channel();
            if attempts.send(reader).is_err() {
                // Stream dropped; the token is already cancelled.
                break Outcome::Failed(ChannelError::Cancelled("event stream dropped".into()));
            }
            self.rotate_channel(run, &next);
            guard.channel = next;
            attempt += 1;
        };

        // Release the slot before the consumer can observe the end of the run.
        self.finish(run);
        let channel = &guard.channel;
        match outcome {
            Outcome::Complete(content) => {
                info!(run, chars = content.len(), "Run complete");
                channel.push(AgentEvent::MessageComplete { content });
                channel.close();
            }
            Outcome::Failed(error) => {
                channel.fail(error);
            }
        }
    }

    async fn attempt(
        &self,
        run: u64,
        message: &str,
        selection: &ModelSelection,
        token: &CancellationToken,
        deadline: Option<Instant>,
        channel: &EventSender<AgentEvent>,
    ) -> Result<String> {
        let agent = self.agent_for(run, selection)?;

        let forward = channel.clone();
        let sink: EventSink = Arc::new(move |event: AgentEvent| {
            if event.is_framing() {
                debug!(event = event.event_type(), "Dropping framing event from agent");
                return;
            }
            forward.push(event);
        });

        let expiry = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                let reason = self.cancel_reason(run);
                agent.cancel(&reason);
                Err(Error::Cancelled(reason))
            }
            _ = expiry => {
                agent.cancel("run timed out");
                Err(Error::Timeout(self.options.run_timeout))
            }
            result = agent.send(message, self.options.explain_edits, sink) => result,
        }
    }

    /// The current agent, or a fresh one loaded with the cached history.
    fn agent_for(&self, run: u64, selection: &ModelSelection) -> Result<Arc<dyn TurnAgent>> {
        let existing = {
            let state = self.lock();
            if !state.owns(run) {
                return Err(Error::Cancelled("run superseded".into()));
            }
            state.agent.clone()
        };
        let agent = match existing {
            Some(agent) => agent,
            None => {
                let agent = self.factory.create(selection)?;
                debug!(provider = %selection.provider, model = %selection.model, "Created agent");
                let mut state = self.lock();
                agent.load_history(state.history.clone());
                state.agent = Some(agent.clone());
                agent
            }
        };

        if let Some(active) = self.lock().active.as_mut().filter(|a| a.id == run) {
            active.agent = Some(agent.clone());
        }
        Ok(agent)
    }

    /// Mark the failing provider and switch the selection to the next one.
    fn fallback_target(
        &self,
        run: u64,
        selection: &ModelSelection,
        error: &Error,
        attempts_left: bool,
    ) -> Option<(FallbackTarget, FailoverReason)> {
        let reason = classify(error)?;
        if !attempts_left {
            return None;
        }

        let mut state = self.lock();
        if !state.owns(run) {
            return None;
        }
        state.failed_providers.insert(selection.provider.clone());
        let target = self
            .providers
            .next_fallback(&selection.provider, &state.failed_providers)?
            .clone();

        state.selection = state.selection.switched_to(&target.provider, &target.model);
        // The failed agent's partial history is discarded; the retry starts
        // from the cached history.
        state.agent = None;
        Some((target, reason))
    }

    fn rotate_channel(&self, run: u64, channel: &EventSender<AgentEvent>) {
        let mut state = self.lock();
        if let Some(active) = state.active.as_mut().filter(|a| a.id == run) {
            active.channel = channel.clone();
            active.agent = None;
        }
    }

    fn cancel_reason(&self, run: u64) -> String {
        self.lock()
            .active
            .as_ref()
            .filter(|a| a.id == run)
            .and_then(|a| a.cancel_reason.clone())
            .unwrap_or_else(|| "cancelled by caller".into())
    }

    fn preserve_partial_history(&self, run: u64) {
        let mut state = self.lock();
        if !state.owns(run) {
            debug!(run, "Run superseded, leaving history alone");
            return;
        }
        let repaired = state.repair_history();
        if repaired > 0 {
            warn!(run, repaired, "Answered interrupted tool calls in history");
        }
    }

    fn finish(&self, run: u64) {
        let mut state = self.lock();
        if state.active.as_ref().is_some_and(|a| a.id == run) {
            state.active = None;
        }
        drop(state);
        let _ = self
            .processing
            .compare_exchange(run, 0, Ordering::AcqRel, Ordering::Acquire);
    }
}

struct Reader {
    attempts: mpsc::UnboundedReceiver<EventReceiver<AgentEvent>>,
    current: Option<EventReceiver<AgentEvent>>,
    done: bool,
}

/// The events of one run, across all of its attempts.
///
/// A failed run ends with exactly one [`AgentEvent::Error`]; a successful one
/// with [`AgentEvent::MessageComplete`].
pub struct EventStream {
    inner: BoxStream<'static, AgentEvent>,
    _cancel_on_drop: DropGuard,
}

impl EventStream {
    fn new(attempts: mpsc::UnboundedReceiver<EventReceiver<AgentEvent>>, guard: DropGuard) -> Self {
        let reader = Reader {
            attempts,
            current: None,
            done: false,
        };
        let inner = stream::unfold(reader, |mut reader| async move {
            loop {
                if reader.done {
                    return None;
                }
                let current = match reader.current.as_mut() {
                    Some(current) => current,
                    None => reader.current.insert(reader.attempts.recv().await?),
                };
                match current.recv().await {
                    Some(Ok(event)) => {
                        reader.done = event.is_terminal();
                        return Some((event, reader));
                    }
                    Some(Err(error)) => {
                        reader.done = true;
                        return Some((AgentEvent::Error { message: error.to_string() }, reader));
                    }
                    // Attempt closed; move on to the next one.
                    None => reader.current = None,
                }
            }
        });

        Self {
            inner: inner.boxed(),
            _cancel_on_drop: guard,
        }
    }

    /// Drain the stream, passing every event to `observe`, and return the
    /// final text.
    pub async fn final_text_with(
        mut self,
        mut observe: impl FnMut(&AgentEvent) + Send,
    ) -> std::result::Result<String, OrchestratorError> {
        while let Some(event) = self.next().await {
            observe(&event);
            match event {
                AgentEvent::MessageComplete { content } => return Ok(content),
                AgentEvent::Error { message } => return Err(OrchestratorError::Run(message)),
                _ => {}
            }
        }
        Err(OrchestratorError::Run("event stream ended without a result".into()))
    }

    /// Drain the stream and return the final text.
    pub async fn final_text(self) -> std::result::Result<String, OrchestratorError> {
        self.final_text_with(|_| {}).await
    }
}

impl Stream for EventStream {
    type Item = AgentEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
