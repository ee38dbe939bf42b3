use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use conclave_core::config::DEFAULT_MAX_TOOL_OUTPUT;
use conclave_core::continuation::DEFAULT_MAX_ITERATIONS;
use conclave_core::{AgentProfile, ContinuationPolicy, RuntimeConfig, SessionConfig, StaticRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConclaveConfig {
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub agents: Vec<AgentSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub continuation_policy: ContinuationPolicy,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_result_history")]
    pub result_history: usize,
    #[serde(default = "default_max_tool_output")]
    pub max_tool_output: usize,
    #[serde(default = "default_true")]
    pub stream_partials: bool,
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_stop_grace_ms() -> u64 {
    5_000
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

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            continuation_policy: ContinuationPolicy::default(),
            stop_grace_ms: default_stop_grace_ms(),
            result_history: default_result_history(),
            max_tool_output: default_max_tool_output(),
            stream_partials: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default)]
    pub default_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_event_capacity() -> usize {
    256
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub denied_tools: Vec<String>,
    #[serde(default)]
    pub handoff_keywords: Vec<String>,
}

impl AgentSection {
    fn profile(&self) -> AgentProfile {
        let name = self.name.clone().unwrap_or_else(|| self.id.clone());
        let mut profile = AgentProfile::new(&self.id, name);
        profile.description = self.description.clone();
        // An unset ${VAR} leaves an empty string behind
        profile.model = self.model.clone().filter(|m| !m.trim().is_empty());
        profile.system_prompt = self.system_prompt.clone().filter(|p| !p.trim().is_empty());
        profile.tools = self.tools.clone();
        profile.denied_tools = self.denied_tools.clone();
        profile.handoff_keywords = self.handoff_keywords.clone();
        profile
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".conclave")
}

/// Default config written by `conclave init`
pub const DEFAULT_CONFIG: &str = include_str!("../../../config/default.toml");

impl ConclaveConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `conclave init` first.",
                path.display()
            )
        })?;

        Self::parse(&content).with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    /// Parse TOML text, expanding allowlisted `${VAR}` references first
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.runtime.max_iterations == 0 {
            bail!("runtime.max_iterations must be at least 1");
        }
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                bail!("agent ids must not be empty");
            }
            if !seen.insert(agent.id.as_str()) {
                bail!("duplicate agent id '{}'", agent.id);
            }
        }
        if let Some(default_agent) = &self.session.default_agent
            && !seen.contains(default_agent.as_str())
        {
            bail!("session.default_agent '{}' is not a configured agent", default_agent);
        }
        Ok(())
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            max_iterations: self.runtime.max_iterations,
            continuation_policy: self.runtime.continuation_policy,
            stop_grace: Duration::from_millis(self.runtime.stop_grace_ms),
            result_history: self.runtime.result_history,
            max_tool_output: self.runtime.max_tool_output,
            stream_partials: self.runtime.stream_partials,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            runtime: self.runtime_config(),
            default_agent: self.session.default_agent.clone(),
        }
    }

    pub fn profiles(&self) -> Vec<AgentProfile> {
        self.agents.iter().map(AgentSection::profile).collect()
    }

    pub fn registry(&self) -> StaticRegistry {
        StaticRegistry::from_profiles(self.profiles())
    }
}

/// Allowlist of environment variable names that may be expanded in config files.
const ALLOWED_ENV_VARS: &[&str] = &["CONCLAVE_DEFAULT_AGENT", "CONCLAVE_MODEL", "HOME", "USER"];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            // Leave the ${VAR} unexpanded so it's obvious
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        result = format!("{}{}{}", &result[..abs_start], value, &result[abs_start + end + 1..]);
        pos = abs_start + value.len();
    }
    result
}
