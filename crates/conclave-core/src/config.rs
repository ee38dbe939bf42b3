//! Runtime and session configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::continuation::{ContinuationEngine, ContinuationPolicy, DEFAULT_MAX_ITERATIONS};

/// Tool output beyond this many bytes is truncated before it reaches history
pub const DEFAULT_MAX_TOOL_OUTPUT: usize = 100_000;

/// Per-agent runtime settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    /// Iteration ceiling per user turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub continuation_policy: ContinuationPolicy,
    /// How long `stop()` waits for an in-flight task before aborting it
    #[serde(default = "default_stop_grace", with = "duration_millis")]
    pub stop_grace: Duration,
    /// Finished task results kept per agent
    #[serde(default = "default_result_history")]
    pub result_history: usize,
    #[serde(default = "default_max_tool_output")]
    pub max_tool_output: usize,
    /// Route and publish partial text while a completion streams
    #[serde(default = "default_true")]
    pub stream_partials: bool,
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_stop_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_result_history() -> usize {
    32
}

fn default_max_tool_output() -> usize {
    DEFAULT_MAX_TOOL_OUTPUT
}

fn default_true() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            continuation_policy: ContinuationPolicy::default(),
            stop_grace: default_stop_grace(),
            result_history: default_result_history(),
            max_tool_output: default_max_tool_output(),
            stream_partials: true,
        }
    }
}

impl RuntimeConfig {
    /// Continuation engine for one agent
    pub fn engine(&self) -> ContinuationEngine {
        ContinuationEngine::new(self.max_iterations, self.continuation_policy)
    }
}

/// Settings for a session and every runtime it spawns
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Agent made active when the session opens
    #[serde(default)]
    pub default_agent: Option<String>,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
