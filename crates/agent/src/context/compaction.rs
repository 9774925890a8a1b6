//! History compaction.
//!
//! Keeps a session's history within a token budget by summarizing the oldest
//! messages. Overflow is rendered as one line per message, grouped into chunks
//! under a character budget, and folded chunk by chunk into a running summary.
//! The summary survives across compactions: each new batch starts with the
//! previous summary, so nothing summarized earlier is lost.

use std::sync::Arc;
use tandem_config::CompactionConfig;
use tandem_core::message::{Message, Role};
use tandem_core::provider::{Provider, ProviderRequest};
use tracing::{debug, info, warn};

use super::token::estimate_messages_tokens;

/// Marks the system message that carries the session summary.
pub const SUMMARY_PREFIX: &str = "[Session summary]";

const SUMMARIZER_PROMPT: &str = "You compress transcripts of a coding assistant's sessions. \
Preserve file paths, decisions and unresolved errors. Reply with the summary text only.";

/// The continuously updated summary for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub text: String,
    /// How many times history has been compacted.
    pub compactions: u32,
    /// Total messages folded into the summary.
    pub messages_summarized: usize,
}

impl SessionSummary {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// The summary carried by a history's summary message, if it has one.
    /// Counters start from zero.
    pub fn from_history(history: &[Message]) -> Self {
        let text = history
            .iter()
            .find(|m| is_summary(m))
            .map(|m| m.content[SUMMARY_PREFIX.len()..].trim().to_string())
            .unwrap_or_default();
        Self {
            text,
            ..Self::default()
        }
    }
}

/// Render one message as a single role-tagged line of at most `max_chars`
/// characters.
pub fn serialize_message(message: &Message, max_chars: usize) -> String {
    let mut line = match (&message.role, &message.tool_name) {
        (Role::Tool, Some(name)) => format!("tool[{name}]: {}", message.content),
        (role, _) => format!("{role}: {}", message.content),
    };
    if !message.tool_calls.is_empty() {
        let calls: Vec<String> = message
            .tool_calls
            .iter()
            .map(|c| format!("{}({})", c.name, c.arguments))
            .collect();
        line.push_str(&format!(" [calls: {}]", calls.join(", ")));
    }

    let flat = line.replace(['\r', '\n'], " ");
    match flat.char_indices().nth(max_chars) {
        Some((cut, _)) => flat[..cut].to_string(),
        None => flat,
    }
}

/// Group lines into newline-joined chunks of at most `budget` characters.
/// A single line longer than the budget becomes its own chunk.
pub fn chunk_lines(lines: &[String], budget: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0;

    for line in lines {
        let line_chars = line.chars().count();
        if !current.is_empty() && current_chars + 1 + line_chars > budget {
            chunks.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        if !current.is_empty() {
            current.push('\n');
            current_chars += 1;
        }
        current.push_str(line);
        current_chars += line_chars;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn is_summary(message: &Message) -> bool {
    message.role == Role::System && message.content.starts_with(SUMMARY_PREFIX)
}

/// Summarizes overflow history through a provider.
pub struct Compactor {
    provider: Arc<dyn Provider>,
    model: String,
    max_context_tokens: usize,
    chunk_chars: usize,
    summary_words: usize,
}

impl Compactor {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self::from_config(provider, model, &CompactionConfig::default())
    }

    /// Build from config. `model` is used unless the config overrides it.
    pub fn from_config(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        config: &CompactionConfig,
    ) -> Self {
        Self {
            provider,
            model: config.model.clone().unwrap_or_else(|| model.into()),
            max_context_tokens: config.max_context_tokens,
            chunk_chars: config.chunk_chars.max(1),
            summary_words: config.summary_words,
        }
    }

    pub fn with_max_context_tokens(mut self, tokens: usize) -> Self {
        self.max_context_tokens = tokens;
        self
    }

    pub fn with_chunk_chars(mut self, chars: usize) -> Self {
        self.chunk_chars = chars.max(1);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn needs_compaction(&self, history: &[Message]) -> bool {
        estimate_messages_tokens(history) > self.max_context_tokens
    }

    /// Fold `batch` into a summary, one chunk per provider call.
    ///
    /// Provider failures do not abort: the running summary records a marker
    /// for the messages that could not be summarized and the next chunk
    /// continues from there.
    pub async fn summarize(&self, batch: &[Message]) -> String {
        let lines: Vec<String> = batch
            .iter()
            .map(|m| serialize_message(m, self.chunk_chars))
            .collect();
        let chunks = chunk_lines(&lines, self.chunk_chars);

        let mut running: Option<String> = None;
        for (index, chunk) in chunks.iter().enumerate() {
            let request = ProviderRequest {
                model: self.model.clone(),
                messages: vec![
                    Message::system(SUMMARIZER_PROMPT),
                    Message::user(self.chunk_prompt(running.as_deref(), chunk)),
                ],
                temperature: 0.2,
                max_tokens: u32::try_from(self.summary_words * 2).ok(),
                tools: Vec::new(),
                stream: false,
                reasoning: None,
            };

            match self.provider.complete(request).await {
                Ok(response) => {
                    debug!(chunk = index, "Summarized history chunk");
                    running = Some(response.message.content.trim().to_string());
                }
                Err(e) => {
                    let count = chunk.lines().count();
                    warn!(chunk = index, messages = count, error = %e, "History summarization failed");
                    let marker = format!("[summary unavailable for {count} messages: {e}]");
                    running = Some(match running {
                        Some(text) if !text.is_empty() => format!("{text}\n{marker}"),
                        _ => marker,
                    });
                }
            }
        }
        running.unwrap_or_default()
    }

    fn chunk_prompt(&self, running: Option<&str>, chunk: &str) -> String {
        let words = self.summary_words;
        match running {
            Some(summary) => format!(
                "Summary so far:\n{summary}\n\nNext part of the conversation:\n{chunk}\n\n\
                 Merge the new part into the summary. Stay under {words} words."
            ),
            None => format!(
                "Conversation:\n{chunk}\n\nSummarize this conversation in under {words} words."
            ),
        }
    }

    /// Bring `history` back under the token budget.
    ///
    /// Returns the history unchanged when it fits. Otherwise the oldest
    /// non-system messages are summarized into `summary` and the result is
    /// `[system messages] + [summary message] + retained`.
    pub async fn compact(&self, summary: &mut SessionSummary, history: Vec<Message>) -> Vec<Message> {
        if !self.needs_compaction(&history) {
            return history;
        }

        // History copied in from another agent carries its summary only as
        // a message.
        if summary.is_empty() {
            summary.text = SessionSummary::from_history(&history).text;
        }

        let (system, rest): (Vec<Message>, Vec<Message>) = history
            .into_iter()
            .filter(|m| !is_summary(m))
            .partition(|m| m.role == Role::System);

        let split = self.split_point(&system, &rest);
        if split == 0 {
            debug!("Nothing old enough to compact");
            return self.assemble(system, summary, rest);
        }

        let mut rest = rest;
        let retained = rest.split_off(split);
        let overflow = rest;

        let mut batch = Vec::with_capacity(overflow.len() + 1);
        if !summary.is_empty() {
            batch.push(Message::system(format!("{SUMMARY_PREFIX}\n{}", summary.text)));
        }
        batch.extend(overflow.iter().cloned());

        summary.text = self.summarize(&batch).await;
        summary.compactions += 1;
        summary.messages_summarized += overflow.len();

        info!(
            summarized = overflow.len(),
            retained = retained.len(),
            compactions = summary.compactions,
            "Compacted session history"
        );

        self.assemble(system, summary, retained)
    }

    /// Index into `rest` where the retained tail begins.
    fn split_point(&self, system: &[Message], rest: &[Message]) -> usize {
        // Leave room for the summary and the next reply.
        let target = (self.max_context_tokens / 2).saturating_sub(estimate_messages_tokens(system));

        let mut split = rest.len();
        let mut used = 0;
        while split > 0 {
            let cost = estimate_messages_tokens(&rest[split - 1..split]);
            if used + cost > target {
                break;
            }
            used += cost;
            split -= 1;
        }

        // Always keep the newest message.
        if split == rest.len() && split > 0 {
            split -= 1;
        }

        // Tool results stay with the call that produced them.
        while split > 0 && rest[split].role == Role::Tool {
            split -= 1;
        }
        split
    }

    fn assemble(&self, system: Vec<Message>, summary: &SessionSummary, retained: Vec<Message>) -> Vec<Message> {
        let mut out = system;
        if !summary.is_empty() {
            out.push(Message::system(format!("{SUMMARY_PREFIX}\n{}", summary.text)));
        }
        out.extend(retained);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tandem_core::error::ProviderError;
    use tandem_core::message::MessageToolCall;
    use tandem_core::provider::ProviderResponse;

    /// Replies "summary #N" and records every prompt it receives.
    #[derive(Default)]
    struct RecordingSummarizer {
        prompts: Mutex<Vec<String>>,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl Provider for RecordingSummarizer {
        fn name(&self) -> &str {
            "recording"
        }

        async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            let mut prompts = self.prompts.lock().unwrap();
            prompts.push(request.messages[1].content.clone());
            let n = prompts.len();
            if self.fail_on == Some(n) {
                return Err(ProviderError::Network("connection reset".into()));
            }
            Ok(ProviderResponse {
                message: Message::assistant(format!("summary #{n}")),
                usage: None,
                model: request.model,
            })
        }
    }

    fn long_turns(count: usize) -> Vec<Message> {
        (0..count)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("question {i} {}", "x".repeat(200)))
                } else {
                    Message::assistant(format!("answer {i} {}", "y".repeat(200)))
                }
            })
            .collect()
    }

    #[test]
    fn serialize_message_flattens_and_caps() {
        let msg = Message::user("line one\nline two");
        assert_eq!(serialize_message(&msg, 100), "user: line one line two");
        assert_eq!(serialize_message(&msg, 8), "user: li");

        let tool = Message::tool_result("c1", "grep", "3 matches");
        assert_eq!(serialize_message(&tool, 100), "tool[grep]: 3 matches");

        let call = Message::assistant_with_tools(
            "checking",
            vec![MessageToolCall {
                id: "c1".into(),
                name: "read_file".into(),
                arguments: r#"{"path":"a.rs"}"#.into(),
            }],
        );
        assert_eq!(
            serialize_message(&call, 200),
            r#"assistant: checking [calls: read_file({"path":"a.rs"})]"#
        );
    }

    #[test]
    fn chunk_lines_respects_budget() {
        let lines: Vec<String> = vec!["aaaa".into(), "bbbb".into(), "cccc".into()];
        assert_eq!(chunk_lines(&lines, 9), vec!["aaaa\nbbbb", "cccc"]);
        assert_eq!(chunk_lines(&lines, 100), vec!["aaaa\nbbbb\ncccc"]);
        assert_eq!(chunk_lines(&lines, 2).len(), 3);
        assert!(chunk_lines(&[], 10).is_empty());
    }

    #[test]
    fn chunk_budget_counts_characters() {
        let lines: Vec<String> = vec!["ééé".into(), "üüü".into()];
        // 7 characters, 13 bytes.
        assert_eq!(chunk_lines(&lines, 7), vec!["ééé\nüüü"]);
        assert_eq!(chunk_lines(&lines, 6).len(), 2);
    }

    #[test]
    fn summary_recovered_from_history() {
        let history = vec![
            Message::system("be careful"),
            Message::system(format!("{SUMMARY_PREFIX}\nrefactored the lexer")),
            Message::user("next"),
        ];
        assert_eq!(SessionSummary::from_history(&history).text, "refactored the lexer");
        assert!(SessionSummary::from_history(&history[2..]).is_empty());
    }

    #[tokio::test]
    async fn summarize_folds_chunks_into_running_summary() {
        let provider = Arc::new(RecordingSummarizer::default());
        let compactor = Compactor::new(provider.clone(), "m").with_chunk_chars(300);

        let summary = compactor.summarize(&long_turns(3)).await;
        assert_eq!(summary, "summary #3");

        let prompts = provider.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 3);
        assert!(!prompts[0].contains("Summary so far"));
        assert!(prompts[1].contains("Summary so far:\nsummary #1"));
        assert!(prompts[2].contains("summary #2"));
    }

    #[tokio::test]
    async fn summarize_failure_leaves_marker_and_continues() {
        let provider = Arc::new(RecordingSummarizer {
            fail_on: Some(2),
            ..Default::default()
        });
        let compactor = Compactor::new(provider.clone(), "m").with_chunk_chars(300);

        let summary = compactor.summarize(&long_turns(3)).await;
        assert_eq!(summary, "summary #3");

        let prompts = provider.prompts.lock().unwrap();
        assert!(prompts[2].contains("summary #1"));
        assert!(prompts[2].contains("[summary unavailable for 1 messages: Network error: connection reset]"));
    }

    #[tokio::test]
    async fn compact_leaves_small_history_alone() {
        let provider = Arc::new(RecordingSummarizer::default());
        let compactor = Compactor::new(provider.clone(), "m");
        let mut summary = SessionSummary::default();

        let history = vec![Message::user("hi"), Message::assistant("hello")];
        let out = compactor.compact(&mut summary, history).await;
        assert_eq!(out.len(), 2);
        assert!(summary.is_empty());
        assert!(provider.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn compact_summarizes_oldest_and_keeps_system_first() {
        let provider = Arc::new(RecordingSummarizer::default());
        let compactor = Compactor::new(provider.clone(), "m").with_max_context_tokens(300);
        let mut summary = SessionSummary::default();

        let mut history = vec![Message::system("be careful")];
        history.extend(long_turns(10));
        let out = compactor.compact(&mut summary, history).await;

        assert_eq!(out[0].content, "be careful");
        assert!(out[1].content.starts_with(SUMMARY_PREFIX));
        assert!(out[1].content.contains("summary #1"));
        assert_eq!(summary.compactions, 1);
        assert!(summary.messages_summarized > 0);
        assert_eq!(out.len(), 2 + 10 - summary.messages_summarized);
        assert!(out.last().unwrap().content.starts_with("answer 9"));
    }

    #[tokio::test]
    async fn compact_carries_previous_summary_forward() {
        let provider = Arc::new(RecordingSummarizer::default());
        let compactor = Compactor::new(provider.clone(), "m").with_max_context_tokens(300);
        let mut summary = SessionSummary {
            text: "earlier work on the parser".into(),
            compactions: 1,
            messages_summarized: 4,
        };

        let out = compactor.compact(&mut summary, long_turns(10)).await;
        assert_eq!(summary.compactions, 2);
        assert!(provider.prompts.lock().unwrap()[0].contains("earlier work on the parser"));
        assert_eq!(out.iter().filter(|m| is_summary(m)).count(), 1);
    }

    #[tokio::test]
    async fn compact_keeps_summary_from_copied_history() {
        let provider = Arc::new(RecordingSummarizer::default());
        let compactor = Compactor::new(provider.clone(), "m").with_max_context_tokens(300);

        let mut first = SessionSummary::default();
        let compacted = compactor.compact(&mut first, long_turns(10)).await;
        assert_eq!(first.text, "summary #1");

        // A new owner of the history starts without the summary state.
        let mut carried = compacted;
        carried.extend(long_turns(10));
        let mut second = SessionSummary::default();
        let out = compactor.compact(&mut second, carried).await;

        let prompts = provider.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("summary #1"));
        assert_eq!(second.text, "summary #2");
        assert_eq!(out.iter().filter(|m| is_summary(m)).count(), 1);
    }

    #[tokio::test]
    async fn compact_never_orphans_tool_results() {
        let provider = Arc::new(RecordingSummarizer::default());
        let compactor = Compactor::new(provider, "m").with_max_context_tokens(200);
        let mut summary = SessionSummary::default();

        let mut history = long_turns(6);
        history.push(Message::assistant_with_tools(
            "",
            vec![MessageToolCall {
                id: "c1".into(),
                name: "read_file".into(),
                arguments: "{}".into(),
            }],
        ));
        history.push(Message::tool_result("c1", "read_file", "z".repeat(300)));
        history.push(Message::assistant("done"));

        let out = compactor.compact(&mut summary, history).await;
        let first_retained = out.iter().find(|m| m.role != Role::System).unwrap();
        assert_ne!(first_retained.role, Role::Tool);
    }
}
