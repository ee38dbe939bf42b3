//! Shared types for conclave-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Output channel of a routed model response
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Internal reasoning, never shown to the user
    Analysis,
    /// Tool activity
    Commentary,
    /// Direct user-facing answer
    Final,
}

impl Channel {
    /// Whether messages on this channel are shown to the user
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::Analysis)
    }

    /// Parse a channel name, as written in markers or config
    pub fn from_string(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "analysis" | "thinking" => Some(Self::Analysis),
            "commentary" | "tool_call" => Some(Self::Commentary),
            "final" => Some(Self::Final),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Analysis => write!(f, "analysis"),
            Self::Commentary => write!(f, "commentary"),
            Self::Final => write!(f, "final"),
        }
    }
}

/// Metadata attached to every routed message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    /// Strictly increasing per router instance, across partial and final calls
    pub sequence: u64,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub is_partial: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub custom: Map<String, Value>,
}

/// A piece of model output classified onto one channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelMessage {
    pub channel: Channel,
    pub content: String,
    pub metadata: MessageMetadata,
}

impl ChannelMessage {
    pub fn is_user_visible(&self) -> bool {
        self.channel.is_user_visible()
    }

    /// True when the router saw a continuation hint in this message
    pub fn contains_continuation(&self) -> bool {
        self.metadata
            .custom
            .get("contains_continuation")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Who authored a conversation entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn from_string(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// One entry in an agent's conversation history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_visibility() {
        assert!(!Channel::Analysis.is_user_visible());
        assert!(Channel::Commentary.is_user_visible());
        assert!(Channel::Final.is_user_visible());
    }

    #[test]
    fn test_channel_from_string() {
        assert_eq!(Channel::from_string("ANALYSIS"), Some(Channel::Analysis));
        assert_eq!(Channel::from_string("thinking"), Some(Channel::Analysis));
        assert_eq!(Channel::from_string("tool_call"), Some(Channel::Commentary));
        assert_eq!(Channel::from_string("final"), Some(Channel::Final));
        assert_eq!(Channel::from_string("summary"), None);
    }

    #[test]
    fn test_channel_serde_lowercase() {
        let json = serde_json::to_string(&Channel::Commentary).unwrap();
        assert_eq!(json, "\"commentary\"");
    }

    #[test]
    fn test_metadata_skips_empty_collections() {
        let meta = MessageMetadata {
            sequence: 1,
            agent_id: "a".to_string(),
            timestamp: Utc::now(),
            is_partial: false,
            tool_calls: Vec::new(),
            custom: Map::new(),
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert!(!json.contains("tool_calls"));
        assert!(!json.contains("custom"));
    }

    #[test]
    fn test_role_round_trip_names() {
        assert_eq!(Role::from_string("Assistant"), Some(Role::Assistant));
        assert_eq!(Role::Tool.to_string(), "tool");
        assert_eq!(Role::from_string("narrator"), None);
    }
}
