//! Agent profile: an agent's identity, prompt, tool permissions and handoff cues

use serde::{Deserialize, Serialize};

/// Read-only description of an agent the registry can hand out
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
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
    /// Words in a user message that suggest handing the conversation to this agent
    #[serde(default)]
    pub handoff_keywords: Vec<String>,
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            model: None,
            system_prompt: None,
            tools: Vec::new(),
            denied_tools: Vec::new(),
            handoff_keywords: Vec::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_handoff_keywords(mut self, keywords: &[&str]) -> Self {
        self.handoff_keywords = keywords.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Check if a tool is allowed for this agent
    pub fn is_tool_allowed(&self, tool_name: &str) -> bool {
        if self.denied_tools.iter().any(|t| t == tool_name) {
            return false;
        }
        if self.tools.is_empty() {
            return true; // empty allowlist = all tools allowed
        }
        self.tools.iter().any(|t| t == tool_name)
    }

    /// System prompt used when none is configured
    pub fn effective_system_prompt(&self) -> String {
        match &self.system_prompt {
            Some(prompt) => prompt.clone(),
            None if self.description.is_empty() => format!("You are {}.", self.name),
            None => format!("You are {}. {}", self.name, self.description),
        }
    }

    /// Whether `text` mentions any of this agent's handoff keywords
    pub fn matches_handoff(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.handoff_keywords
            .iter()
            .any(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
    }
}
