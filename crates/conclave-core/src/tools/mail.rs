//! Mail tools: let agents message each other through their own tool calls

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::{ToolHandler, ToolRegistry, json_schema};
use crate::mailbox::{Envelope, MailPriority, MailQuery, PostOffice};

fn required_str<'a>(input: &'a Value, key: &str) -> Result<&'a str> {
    input
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("Missing '{}' parameter", key))
}

fn envelope_from_input(from: &str, input: &Value) -> Result<Envelope> {
    let to = required_str(input, "to")?;
    let body = required_str(input, "body")?;
    let subject = input.get("subject").and_then(|v| v.as_str()).unwrap_or("");
    let priority = match input.get("priority").and_then(|v| v.as_str()) {
        Some(p) => MailPriority::from_string(p).ok_or_else(|| anyhow!("Invalid priority '{}'", p))?,
        None => MailPriority::Normal,
    };
    Ok(Envelope::new(from, to, subject, body).with_priority(priority))
}

fn send_schema() -> Value {
    json_schema(
        serde_json::json!({
            "to": {
                "type": "string",
                "description": "Recipient agent id"
            },
            "subject": {
                "type": "string",
                "description": "Short subject line"
            },
            "body": {
                "type": "string",
                "description": "Message body"
            },
            "priority": {
                "type": "string",
                "enum": ["low", "normal", "high", "urgent"],
                "description": "Message priority (default: normal)"
            }
        }),
        vec!["to", "body"],
    )
}

/// Send mail to another agent
pub struct SendMailTool {
    agent_id: String,
    post_office: PostOffice,
}

impl SendMailTool {
    pub fn new(agent_id: impl Into<String>, post_office: PostOffice) -> Self {
        Self {
            agent_id: agent_id.into(),
            post_office,
        }
    }
}

#[async_trait]
impl ToolHandler for SendMailTool {
    fn name(&self) -> &str {
        "send_mail"
    }

    fn description(&self) -> &str {
        "Send a message to another agent's mailbox. The recipient reads it with check_mail."
    }

    fn input_schema(&self) -> Value {
        send_schema()
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let envelope = envelope_from_input(&self.agent_id, &input)?;
        let to = envelope.to.clone();
        let message_id = self.post_office.send(envelope)?;
        Ok(format!("Mail {} sent to {}", message_id, to))
    }
}

/// Send mail and hand the conversation over to the recipient
pub struct SendMailWithSwitchTool {
    agent_id: String,
    post_office: PostOffice,
}

impl SendMailWithSwitchTool {
    pub fn new(agent_id: impl Into<String>, post_office: PostOffice) -> Self {
        Self {
            agent_id: agent_id.into(),
            post_office,
        }
    }
}

#[async_trait]
impl ToolHandler for SendMailWithSwitchTool {
    fn name(&self) -> &str {
        "send_mail_with_switch"
    }

    fn description(&self) -> &str {
        "Send a message to another agent and make that agent the active one for the user. \
         Use this to hand off a conversation."
    }

    fn input_schema(&self) -> Value {
        send_schema()
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let envelope = envelope_from_input(&self.agent_id, &input)?;
        let to = envelope.to.clone();
        let message_id = self.post_office.send_with_switch(envelope)?;
        Ok(format!("Mail {} sent to {}; switch requested", message_id, to))
    }
}

/// Read this agent's mailbox
pub struct CheckMailTool {
    agent_id: String,
    post_office: PostOffice,
}

impl CheckMailTool {
    pub fn new(agent_id: impl Into<String>, post_office: PostOffice) -> Self {
        Self {
            agent_id: agent_id.into(),
            post_office,
        }
    }
}

#[async_trait]
impl ToolHandler for CheckMailTool {
    fn name(&self) -> &str {
        "check_mail"
    }

    fn description(&self) -> &str {
        "Read messages from your mailbox in arrival order. Returned messages are marked read \
         unless mark_read is false."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            serde_json::json!({
                "unread_only": {
                    "type": "boolean",
                    "description": "Only return unread mail (default: true)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of messages to return"
                },
                "mark_read": {
                    "type": "boolean",
                    "description": "Mark returned messages read (default: true)"
                }
            }),
            vec![],
        )
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let query = MailQuery {
            unread_only: input.get("unread_only").and_then(|v| v.as_bool()).unwrap_or(true),
            limit: input.get("limit").and_then(|v| v.as_u64()).map(|n| n as usize),
            mark_read: input.get("mark_read").and_then(|v| v.as_bool()).unwrap_or(true),
        };
        let check = self.post_office.check_mail(&self.agent_id, &query)?;
        debug!("Agent {} checked mail: {} returned", self.agent_id, check.count);
        Ok(serde_json::to_string_pretty(&check)?)
    }
}

/// Mark messages read without returning them
pub struct AcknowledgeMailTool {
    agent_id: String,
    post_office: PostOffice,
}

impl AcknowledgeMailTool {
    pub fn new(agent_id: impl Into<String>, post_office: PostOffice) -> Self {
        Self {
            agent_id: agent_id.into(),
            post_office,
        }
    }
}

#[async_trait]
impl ToolHandler for AcknowledgeMailTool {
    fn name(&self) -> &str {
        "acknowledge_mail"
    }

    fn description(&self) -> &str {
        "Mark the given message ids in your mailbox as read."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            serde_json::json!({
                "message_ids": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Ids of the messages to mark read"
                }
            }),
            vec!["message_ids"],
        )
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let ids: Vec<String> = input
            .get("message_ids")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow!("Missing 'message_ids' parameter"))?
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect();
        let marked = self.post_office.acknowledge(&self.agent_id, &ids)?;
        Ok(format!("Marked {} message(s) read", marked))
    }
}

/// All mail tools bound to one agent
pub fn mail_tools(agent_id: &str, post_office: &PostOffice) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(SendMailTool::new(agent_id, post_office.clone())));
    registry.register(Arc::new(SendMailWithSwitchTool::new(agent_id, post_office.clone())));
    registry.register(Arc::new(CheckMailTool::new(agent_id, post_office.clone())));
    registry.register(Arc::new(AcknowledgeMailTool::new(agent_id, post_office.clone())));
    registry
}
