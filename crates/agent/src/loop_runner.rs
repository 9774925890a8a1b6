//! The tool-loop agent: think, call tools, observe, repeat.

use std::sync::{Arc, Mutex, MutexGuard};
use async_trait::async_trait;
use tandem_config::CompactionConfig;
use tandem_core::error::{Error, ProviderError};
use tandem_core::message::Message;
use tandem_core::provider::{Provider, ProviderRequest};
use tandem_core::selection::ModelSelection;
use tandem_core::tool::{ToolCall, ToolRegistry};
use tandem_core::Result;
use tandem_providers::ProviderRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{Compactor, SessionSummary};
use crate::event::AgentEvent;
use crate::turn::{AgentFactory, EventSink, TurnAgent};

const DEFAULT_MAX_ITERATIONS: u32 = 25;

const MAX_ITERATIONS_REPLY: &str =
    "I've reached the maximum number of tool call iterations. Please provide further guidance.";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-turn agent that streams from one provider and executes tool calls
/// through a shared registry until the model answers in plain text.
pub struct ToolLoopAgent {
    provider: Arc<dyn Provider>,
    selection: ModelSelection,
    tools: Arc<ToolRegistry>,
    max_iterations: u32,
    compactor: Option<Arc<Compactor>>,
    history: Mutex<Vec<Message>>,
    summary: Mutex<SessionSummary>,
    cancel: Mutex<CancellationToken>,
}

impl ToolLoopAgent {
    pub fn new(provider: Arc<dyn Provider>, selection: ModelSelection, tools: Arc<ToolRegistry>) -> Self {
        Self {
            provider,
            selection,
            tools,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            compactor: None,
            history: Mutex::new(Vec::new()),
            summary: Mutex::new(SessionSummary::default()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Set the maximum number of tool call iterations.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Compact history before each provider request.
    pub fn with_compactor(mut self, compactor: Arc<Compactor>) -> Self {
        self.compactor = Some(compactor);
        self
    }

    pub fn selection(&self) -> &ModelSelection {
        &self.selection
    }

    pub fn summary(&self) -> SessionSummary {
        lock(&self.summary).clone()
    }

    fn push(&self, message: Message) {
        lock(&self.history).push(message);
    }

    fn check(&self, token: &CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            return Err(Error::Cancelled("agent stopped".into()));
        }
        Ok(())
    }

    async fn compact(&self) {
        let Some(compactor) = &self.compactor else {
            return;
        };
        let history = self.history();
        if !compactor.needs_compaction(&history) {
            return;
        }

        let mut summary = self.summary();
        let compacted = compactor.compact(&mut summary, history).await;
        *lock(&self.summary) = summary;
        *lock(&self.history) = compacted;
    }

    /// One provider round-trip. Returns the assistant text and any tool calls.
    async fn stream_reply(
        &self,
        sink: &EventSink,
    ) -> Result<(String, Vec<tandem_core::message::MessageToolCall>)> {
        let mut request =
            ProviderRequest::for_selection(&self.selection, self.history(), self.tools.definitions());
        request.stream = true;

        let mut rx = self.provider.stream(request).await?;
        let mut content = String::new();
        let mut calls = Vec::new();

        while let Some(chunk) = rx.recv().await {
            let chunk = chunk?;
            if let Some(delta) = chunk.content.filter(|c| !c.is_empty()) {
                content.push_str(&delta);
                sink(AgentEvent::MessageDelta { content: delta });
            }
            if let Some(reasoning) = chunk.reasoning.filter(|r| !r.is_empty()) {
                sink(AgentEvent::Reasoning { content: reasoning });
            }
            if let Some(usage) = chunk.usage {
                sink(AgentEvent::Usage { usage });
            }
            calls.extend(chunk.tool_calls);
            if chunk.done {
                break;
            }
        }
        Ok((content, calls))
    }
}

#[async_trait]
impl TurnAgent for ToolLoopAgent {
    async fn send(&self, message: &str, explain_edits: bool, sink: EventSink) -> Result<String> {
        let token = CancellationToken::new();
        *lock(&self.cancel) = token.clone();

        info!(
            provider = %self.selection.provider,
            model = %self.selection.model,
            "Processing message"
        );
        self.push(Message::user(message));

        for iteration in 1..=self.max_iterations {
            self.check(&token)?;
            debug!(iteration, "Agent loop iteration");

            self.compact().await;
            let (content, calls) = self.stream_reply(&sink).await?;
            self.check(&token)?;

            if calls.is_empty() {
                self.push(Message::assistant(&content));
                return Ok(content);
            }

            debug!(tool_count = calls.len(), "Executing tool calls");
            self.push(Message::assistant_with_tools(&content, calls.clone()));

            for tc in &calls {
                // Remaining calls stay unanswered; the orchestrator repairs them.
                self.check(&token)?;

                let arguments: serde_json::Value =
                    serde_json::from_str(&tc.arguments).unwrap_or_default();
                sink(AgentEvent::ToolStart {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    arguments: arguments.clone(),
                });

                let call = ToolCall {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    arguments,
                };
                match self.tools.execute(&call).await {
                    Ok(result) if result.success => {
                        sink(AgentEvent::ToolComplete {
                            id: tc.id.clone(),
                            name: tc.name.clone(),
                            output: result.output.clone(),
                        });
                        let mutates = self.tools.get(&tc.name).is_some_and(|t| t.mutates_files());
                        if explain_edits && mutates && !content.trim().is_empty() {
                            sink(AgentEvent::EditExplanation {
                                tool: tc.name.clone(),
                                explanation: content.trim().to_string(),
                            });
                        }
                        self.push(Message::tool_result(&tc.id, &tc.name, result.output));
                    }
                    Ok(result) => {
                        warn!(tool = %tc.name, "Tool reported failure");
                        sink(AgentEvent::ToolError {
                            id: tc.id.clone(),
                            name: tc.name.clone(),
                            error: result.output.clone(),
                        });
                        self.push(Message::tool_result(&tc.id, &tc.name, format!("Error: {}", result.output)));
                    }
                    Err(e) => {
                        warn!(tool = %tc.name, error = %e, "Tool execution failed");
                        sink(AgentEvent::ToolError {
                            id: tc.id.clone(),
                            name: tc.name.clone(),
                            error: e.to_string(),
                        });
                        // Report error to the LLM so it can recover
                        self.push(Message::tool_result(&tc.id, &tc.name, format!("Error: {e}")));
                    }
                }
            }
        }

        warn!(iterations = self.max_iterations, "Max tool iterations reached");
        Ok(MAX_ITERATIONS_REPLY.into())
    }

    fn load_history(&self, history: Vec<Message>) {
        let recovered = SessionSummary::from_history(&history);
        {
            let mut summary = lock(&self.summary);
            if summary.text != recovered.text {
                *summary = recovered;
            }
        }
        *lock(&self.history) = history;
    }

    fn history(&self) -> Vec<Message> {
        lock(&self.history).clone()
    }

    fn clear_history(&self) {
        lock(&self.history).clear();
        *lock(&self.summary) = SessionSummary::default();
    }

    fn cancel(&self, reason: &str) {
        debug!(reason, "Cancelling agent");
        lock(&self.cancel).cancel();
    }
}

/// Builds [`ToolLoopAgent`]s from the provider registry.
pub struct ToolLoopFactory {
    providers: Arc<ProviderRegistry>,
    tools: Arc<ToolRegistry>,
    compaction: Option<CompactionConfig>,
    max_iterations: u32,
}

impl ToolLoopFactory {
    pub fn new(providers: Arc<ProviderRegistry>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            providers,
            tools,
            compaction: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Attach a compactor (summarizing with the agent's own provider) to
    /// every agent created.
    pub fn with_compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = Some(config);
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }
}

impl AgentFactory for ToolLoopFactory {
    fn create(&self, selection: &ModelSelection) -> Result<Arc<dyn TurnAgent>> {
        let provider = self
            .providers
            .get(&selection.provider)
            .ok_or_else(|| ProviderError::NotConfigured(selection.provider.clone()))?;

        let mut agent = ToolLoopAgent::new(provider.clone(), selection.clone(), self.tools.clone())
            .with_max_iterations(self.max_iterations);
        if let Some(config) = &self.compaction {
            agent = agent.with_compactor(Arc::new(Compactor::from_config(
                provider,
                selection.model.clone(),
                config,
            )));
        }
        Ok(Arc::new(agent))
    }
}
