//! Continuation engine: decides whether an agent runs another turn without
//! new user input.
//!
//! The engine is a pure decision function. After every model/tool iteration
//! the runtime asks [`ContinuationEngine::evaluate`] whether to go again; the
//! engine looks for an explicit signal in the response, falls back to the
//! configured [`ContinuationPolicy`], and finally applies the per-turn
//! iteration ceiling, which no signal can override.
//!
//! A signal is either the bare `[CONTINUE]` token or a JSON object carrying a
//! `continuation` key:
//!
//! ```text
//! {"continuation": "continue", "reason": "need the second file"}
//! {"continuation": {"status": "terminate", "reason": "answered"}}
//! ```

use std::ops::Range;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Implicit continue signal
pub const CONTINUE_TOKEN: &str = "[CONTINUE]";

/// Terminal marker: the model declares the turn finished
pub const DONE_TOKEN: &str = "[DONE]";

/// A `[FINAL]` block also counts as terminal for the default policy
const FINAL_MARKER: &str = "[FINAL]";

const SIGNAL_KEY: &str = "continuation";

/// Reason reported when the iteration ceiling forces a stop
pub const SAFETY_LIMIT_REASON: &str = "safety limit reached";

/// Default per-turn iteration ceiling
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// What to do when the response carries no explicit signal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationPolicy {
    /// Continue only if a tool just ran and no terminal marker was present
    #[default]
    AfterToolCall,
    AlwaysStop,
    AlwaysContinue,
}

impl ContinuationPolicy {
    pub fn from_string(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "after_tool_call" => Some(Self::AfterToolCall),
            "always_stop" => Some(Self::AlwaysStop),
            "always_continue" => Some(Self::AlwaysContinue),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContinuationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AfterToolCall => write!(f, "after_tool_call"),
            Self::AlwaysStop => write!(f, "always_stop"),
            Self::AlwaysContinue => write!(f, "always_continue"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Continue,
    Terminate,
}

/// An explicit continuation signal found in model output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContinuationSignal {
    pub status: SignalStatus,
    #[serde(default)]
    pub reason: String,
}

/// Where a decision came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Signal,
    Policy,
    SafetyLimit,
}

/// Outcome of one evaluation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    #[serde(rename = "continue")]
    pub should_continue: bool,
    pub reason: String,
    pub source: DecisionSource,
}

impl Decision {
    fn safety_limit() -> Self {
        Self {
            should_continue: false,
            reason: SAFETY_LIMIT_REASON.to_string(),
            source: DecisionSource::SafetyLimit,
        }
    }

    /// True when the ceiling, not the model or policy, ended the turn
    pub fn is_forced_stop(&self) -> bool {
        self.source == DecisionSource::SafetyLimit
    }
}

/// Result of one tool invocation, fed back into history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolOutcome {
    pub call_id: String,
    pub name: String,
    pub output: String,
    pub is_error: bool,
}

/// Iterations executed so far in the current user turn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationState {
    iterations: u32,
}

impl IterationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one executed model/tool iteration, however many tools it ran
    pub fn record_iteration(&mut self) {
        self.iterations = self.iterations.saturating_add(1);
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }
}

/// Pure continuation decision function
#[derive(Debug, Clone)]
pub struct ContinuationEngine {
    max_iterations: u32,
    policy: ContinuationPolicy,
}

impl Default for ContinuationEngine {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            policy: ContinuationPolicy::default(),
        }
    }
}

impl ContinuationEngine {
    /// A ceiling of zero is raised to one; every turn runs at least once
    pub fn new(max_iterations: u32, policy: ContinuationPolicy) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
            policy,
        }
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn policy(&self) -> ContinuationPolicy {
        self.policy
    }

    /// Decide whether another iteration should run.
    ///
    /// `state` must already include the iteration that produced `response`.
    pub fn evaluate(
        &self,
        response: &str,
        tool_results: &[ToolOutcome],
        state: &IterationState,
    ) -> Decision {
        let decision = match find_signal(response) {
            Some(signal) => Decision {
                should_continue: signal.status == SignalStatus::Continue,
                reason: if signal.reason.is_empty() {
                    format!("model signalled {:?}", signal.status).to_lowercase()
                } else {
                    signal.reason
                },
                source: DecisionSource::Signal,
            },
            None => self.apply_policy(response, tool_results),
        };

        if decision.should_continue && state.iterations() >= self.max_iterations {
            return Decision::safety_limit();
        }
        decision
    }

    fn apply_policy(&self, response: &str, tool_results: &[ToolOutcome]) -> Decision {
        let (should_continue, reason) = match self.policy {
            ContinuationPolicy::AlwaysStop => (false, "policy: always stop"),
            ContinuationPolicy::AlwaysContinue => (true, "policy: always continue"),
            ContinuationPolicy::AfterToolCall => {
                if tool_results.is_empty() {
                    (false, "no tool call executed")
                } else if has_terminal_marker(response) {
                    (false, "terminal marker present")
                } else {
                    (true, "tool call executed")
                }
            }
        };
        Decision {
            should_continue,
            reason: reason.to_string(),
            source: DecisionSource::Policy,
        }
    }
}

/// Find the first continuation signal in `text`, token or object, whichever
/// appears earlier.
pub fn find_signal(text: &str) -> Option<ContinuationSignal> {
    let token_at = text.to_ascii_uppercase().find(CONTINUE_TOKEN);
    let object = signal_objects(text).into_iter().next();

    match (token_at, object) {
        (Some(t), Some((span, _))) if t < span.start => Some(token_signal()),
        (_, Some((_, signal))) => Some(signal),
        (Some(_), None) => Some(token_signal()),
        (None, None) => None,
    }
}

/// Whether the first signal in `text` asks for another iteration
pub fn contains_continuation_hint(text: &str) -> bool {
    find_signal(text).is_some_and(|signal| signal.status == SignalStatus::Continue)
}

/// `text` with every signal object cut out
pub fn strip_signal_objects(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (span, _) in signal_objects(text) {
        out.push_str(&text[cursor..span.start]);
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Whether the model marked its output as finished
pub fn has_terminal_marker(text: &str) -> bool {
    let upper = text.to_ascii_uppercase();
    upper.contains(FINAL_MARKER) || upper.contains(DONE_TOKEN)
}

fn token_signal() -> ContinuationSignal {
    ContinuationSignal {
        status: SignalStatus::Continue,
        reason: "continue token".to_string(),
    }
}

/// Top-level JSON objects in `text` that carry a signal, in textual order.
/// Each parsed object is skipped as a whole, so the scan stays linear on
/// brace-heavy text; a signal nested anywhere inside counts for the object.
fn signal_objects(text: &str) -> Vec<(Range<usize>, ContinuationSignal)> {
    let mut found = Vec::new();
    if !text.contains(SIGNAL_KEY) {
        return found;
    }

    let mut from = 0;
    while let Some(offset) = text[from..].find('{') {
        let start = from + offset;
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value @ Value::Object(_))) => {
                let end = start + stream.byte_offset();
                if let Some(signal) = signal_in(&value) {
                    found.push((start..end, signal));
                }
                from = end;
            }
            _ => from = start + 1,
        }
    }
    found
}

fn signal_in(value: &Value) -> Option<ContinuationSignal> {
    match value {
        Value::Object(map) => signal_from_object(map).or_else(|| map.values().find_map(signal_in)),
        Value::Array(items) => items.iter().find_map(signal_in),
        _ => None,
    }
}

fn signal_from_object(map: &Map<String, Value>) -> Option<ContinuationSignal> {
    let value = map.get(SIGNAL_KEY)?;
    let outer_reason = map.get("reason").and_then(Value::as_str);

    let (status, reason) = match value {
        Value::String(s) => (parse_status(s)?, outer_reason),
        Value::Bool(b) => (
            if *b {
                SignalStatus::Continue
            } else {
                SignalStatus::Terminate
            },
            outer_reason,
        ),
        Value::Object(inner) => {
            let status = inner.get("status").and_then(Value::as_str).and_then(parse_status)?;
            let reason = inner.get("reason").and_then(Value::as_str).or(outer_reason);
            (status, reason)
        }
        _ => return None,
    };

    Some(ContinuationSignal {
        status,
        reason: reason.unwrap_or_default().to_string(),
    })
}

fn parse_status(s: &str) -> Option<SignalStatus> {
    match s.trim().to_lowercase().as_str() {
        "continue" => Some(SignalStatus::Continue),
        "terminate" | "stop" | "done" => Some(SignalStatus::Terminate),
        _ => None,
    }
}
