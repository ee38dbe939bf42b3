//! Completion provider seam
//!
//! The runtime never talks to an LLM API directly. It is handed an
//! `Arc<dyn CompletionProvider>` and drains the chunk stream it returns.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ConversationEntry;

/// Tool schema offered to the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Why the model stopped generating
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolUse,
    Length,
    Other(String),
}

impl FinishReason {
    pub fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse)
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::ToolUse => write!(f, "tool_use"),
            Self::Length => write!(f, "length"),
            Self::Other(reason) => write!(f, "{}", reason),
        }
    }
}

/// One piece of a streamed completion
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionChunk {
    /// Text delta, appended to what came before
    Text(String),
    ToolCall(ToolCall),
    Finish(FinishReason),
}

pub type CompletionStream = BoxStream<'static, Result<CompletionChunk>>;

/// Trait that all completion backends implement
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Human-readable provider name (e.g. "anthropic", "scripted")
    fn provider_name(&self) -> &str;

    /// Model identifier
    fn model(&self) -> &str {
        "unknown"
    }

    /// Start a completion over `history`, which begins with the system prompt
    async fn complete(
        &self,
        history: &[ConversationEntry],
        tools: &[ToolDefinition],
    ) -> Result<CompletionStream>;
}

/// Wrap an already-complete response as a stream, for non-streaming backends
pub fn stream_from_chunks(chunks: Vec<CompletionChunk>) -> CompletionStream {
    stream::iter(chunks.into_iter().map(Ok)).boxed()
}

/// Scripted providers shared by the runtime and session tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays one script entry per `complete` call; repeats the last entry
    /// once the script runs out.
    pub struct ScriptedProvider {
        script: Mutex<VecDeque<Vec<CompletionChunk>>>,
        last: Mutex<Vec<CompletionChunk>>,
        delay: Duration,
        pub calls: Mutex<Vec<Vec<ConversationEntry>>>,
    }

    impl ScriptedProvider {
        pub fn new(script: Vec<Vec<CompletionChunk>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(vec![CompletionChunk::Finish(FinishReason::Stop)]),
                delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Every call answers with the same text
        pub fn replying(text: &str) -> Self {
            Self::new(vec![vec![
                CompletionChunk::Text(text.to_string()),
                CompletionChunk::Finish(FinishReason::Stop),
            ]])
        }

        /// Sleep before answering, to keep a task in flight
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        fn provider_name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            history: &[ConversationEntry],
            _tools: &[ToolDefinition],
        ) -> Result<CompletionStream> {
            self.calls.lock().unwrap().push(history.to_vec());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            let chunks = match next {
                Some(chunks) => {
                    *self.last.lock().unwrap() = chunks.clone();
                    chunks
                }
                None => self.last.lock().unwrap().clone(),
            };
            Ok(stream_from_chunks(chunks))
        }
    }

    /// Always fails
    pub struct FailingProvider;

    #[async_trait]
    impl CompletionProvider for FailingProvider {
        fn provider_name(&self) -> &str {
            "failing"
        }

        async fn complete(
            &self,
            _history: &[ConversationEntry],
            _tools: &[ToolDefinition],
        ) -> Result<CompletionStream> {
            Err(anyhow::anyhow!("upstream unavailable"))
        }
    }
}
