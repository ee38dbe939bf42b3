//! One user turn: completion → routing → tools → continuation, until stop

use anyhow::{Context, Result};
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::continuation::{ContinuationEngine, IterationState, ToolOutcome};
use crate::events::{EventSink, RuntimeEvent, emit};
use crate::provider::{CompletionChunk, CompletionProvider, ToolCall};
use crate::router::ChannelRouter;
use crate::tools::{ToolExecutor, truncate_output};
use crate::types::{Channel, ChannelMessage, ConversationEntry, Role};

/// What a finished turn produced
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// User-facing answer: the Final channel content, joined
    pub output: String,
    /// Every non-partial message routed during the turn
    pub messages: Vec<ChannelMessage>,
    pub iterations: u32,
    pub stop_reason: String,
    pub forced_stop: bool,
}

/// Drives the iteration loop for one agent. Holds the agent's router so
/// sequence numbers keep increasing across tasks.
pub struct TurnRunner {
    agent_id: String,
    system_prompt: String,
    provider: Arc<dyn CompletionProvider>,
    tools: Arc<dyn ToolExecutor>,
    router: ChannelRouter,
    engine: ContinuationEngine,
    max_tool_output: usize,
    stream_partials: bool,
    events: Option<Arc<dyn EventSink>>,
}

impl TurnRunner {
    pub fn new(
        agent_id: impl Into<String>,
        system_prompt: impl Into<String>,
        provider: Arc<dyn CompletionProvider>,
        tools: Arc<dyn ToolExecutor>,
        engine: ContinuationEngine,
    ) -> Self {
        let agent_id = agent_id.into();
        Self {
            router: ChannelRouter::new(agent_id.clone()),
            agent_id,
            system_prompt: system_prompt.into(),
            provider,
            tools,
            engine,
            max_tool_output: crate::config::DEFAULT_MAX_TOOL_OUTPUT,
            stream_partials: true,
            events: None,
        }
    }

    pub fn with_max_tool_output(mut self, max: usize) -> Self {
        self.max_tool_output = max;
        self
    }

    pub fn with_stream_partials(mut self, enabled: bool) -> Self {
        self.stream_partials = enabled;
        self
    }

    pub fn with_events(mut self, events: Option<Arc<dyn EventSink>>) -> Self {
        self.events = events;
        self
    }

    pub fn router(&self) -> &ChannelRouter {
        &self.router
    }

    /// Run one user turn. Provider failures end the turn with an error;
    /// tool failures are fed back to the model as error results.
    pub async fn run(&self, prompt: &str, context: &[ConversationEntry]) -> Result<TurnOutcome> {
        let mut history = Vec::with_capacity(context.len() + 2);
        history.push(ConversationEntry::new(Role::System, self.system_prompt.clone()));
        history.extend(context.iter().cloned());
        history.push(ConversationEntry::user(prompt));

        let tool_defs = self.tools.list_tools();
        let mut state = IterationState::new();
        let mut messages = Vec::new();

        loop {
            state.record_iteration();
            debug!("Agent {} iteration {}", self.agent_id, state.iterations());

            let mut stream = self
                .provider
                .complete(&history, &tool_defs)
                .await
                .with_context(|| format!("{} completion failed", self.provider.provider_name()))?;

            let mut text = String::new();
            let mut native_calls = Vec::new();
            while let Some(chunk) = stream.next().await {
                match chunk.context("completion stream failed")? {
                    CompletionChunk::Text(delta) => {
                        text.push_str(&delta);
                        if self.stream_partials {
                            self.publish(self.router.route_response(&text, true));
                        }
                    }
                    CompletionChunk::ToolCall(call) => native_calls.push(call),
                    CompletionChunk::Finish(reason) => {
                        debug!("Agent {} completion finished: {}", self.agent_id, reason);
                        break;
                    }
                }
            }

            let routed = self.router.route_response(&text, false);
            self.publish(routed.clone());

            let calls = if native_calls.is_empty() {
                embedded_tool_calls(&routed)
            } else {
                native_calls
            };

            if !text.trim().is_empty() {
                history.push(ConversationEntry::assistant(text.clone()));
            }

            let mut outcomes = Vec::with_capacity(calls.len());
            for call in calls {
                let outcome = self.execute_tool(call).await;
                history.push(ConversationEntry::new(
                    Role::Tool,
                    format!("[{}] {}", outcome.name, outcome.output),
                ));
                outcomes.push(outcome);
            }
            messages.extend(routed);

            let decision = self.engine.evaluate(&text, &outcomes, &state);
            if decision.should_continue {
                debug!("Agent {} continuing: {}", self.agent_id, decision.reason);
                continue;
            }

            if decision.is_forced_stop() {
                warn!(
                    "Agent {} stopped by safety limit after {} iterations",
                    self.agent_id,
                    state.iterations()
                );
            } else {
                info!(
                    "Agent {} finished turn after {} iteration(s): {}",
                    self.agent_id,
                    state.iterations(),
                    decision.reason
                );
            }

            return Ok(TurnOutcome {
                output: final_output(&messages),
                messages,
                iterations: state.iterations(),
                stop_reason: decision.reason.clone(),
                forced_stop: decision.is_forced_stop(),
            });
        }
    }

    async fn execute_tool(&self, call: ToolCall) -> ToolOutcome {
        debug!("Agent {} executing tool {} ({})", self.agent_id, call.name, call.id);
        match self.tools.execute(&call.name, call.arguments).await {
            Ok(output) => ToolOutcome {
                call_id: call.id,
                name: call.name,
                output: truncate_output(output, self.max_tool_output),
                is_error: false,
            },
            Err(e) => {
                warn!("Agent {} tool {} failed: {}", self.agent_id, call.name, e);
                ToolOutcome {
                    call_id: call.id,
                    name: call.name,
                    output: format!("Error: {}", e),
                    is_error: true,
                }
            }
        }
    }

    fn publish(&self, messages: Vec<ChannelMessage>) {
        for message in messages {
            emit(&self.events, RuntimeEvent::ChannelMessage { message });
        }
    }
}

/// Tool calls written into Commentary text rather than sent natively
fn embedded_tool_calls(messages: &[ChannelMessage]) -> Vec<ToolCall> {
    messages
        .iter()
        .filter(|m| m.channel == Channel::Commentary)
        .flat_map(|m| m.metadata.tool_calls.iter())
        .filter_map(|payload| {
            let name = payload.get("tool").and_then(Value::as_str)?;
            let arguments = ["args", "arguments", "input"]
                .iter()
                .find_map(|key| payload.get(*key).cloned())
                .unwrap_or(Value::Object(Default::default()));
            Some(ToolCall {
                id: uuid::Uuid::new_v4().to_string(),
                name: name.to_string(),
                arguments,
            })
        })
        .collect()
}

fn final_output(messages: &[ChannelMessage]) -> String {
    messages
        .iter()
        .filter(|m| m.channel == Channel::Final)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
