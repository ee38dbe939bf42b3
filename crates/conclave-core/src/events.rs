//! Events published by runtimes and sessions

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::agents::{AgentState, TaskResult};
use crate::types::ChannelMessage;

/// Something observable happened inside a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    StateChanged {
        agent_id: String,
        from: AgentState,
        to: AgentState,
        reason: String,
    },
    TaskQueued {
        agent_id: String,
        task_id: String,
        queue_depth: usize,
    },
    TaskStarted {
        agent_id: String,
        task_id: String,
    },
    TaskFinished {
        agent_id: String,
        result: TaskResult,
    },
    ChannelMessage {
        message: ChannelMessage,
    },
    MailDelivered {
        from: String,
        to: String,
        message_id: String,
    },
    AgentSwitched {
        from: Option<String>,
        to: String,
    },
}

impl RuntimeEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state_changed",
            Self::TaskQueued { .. } => "task_queued",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskFinished { .. } => "task_finished",
            Self::ChannelMessage { .. } => "channel_message",
            Self::MailDelivered { .. } => "mail_delivered",
            Self::AgentSwitched { .. } => "agent_switched",
        }
    }

    /// Agent the event concerns, if any
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::StateChanged { agent_id, .. }
            | Self::TaskQueued { agent_id, .. }
            | Self::TaskStarted { agent_id, .. }
            | Self::TaskFinished { agent_id, .. } => Some(agent_id),
            Self::ChannelMessage { message } => Some(&message.metadata.agent_id),
            Self::MailDelivered { to, .. } => Some(to),
            Self::AgentSwitched { to, .. } => Some(to),
        }
    }
}

/// Receives runtime events. Must not block.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: RuntimeEvent);
}

impl EventSink for mpsc::UnboundedSender<RuntimeEvent> {
    fn publish(&self, event: RuntimeEvent) {
        if self.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}

/// Publish to an optional sink
pub(crate) fn emit(sink: &Option<Arc<dyn EventSink>>, event: RuntimeEvent) {
    if let Some(sink) = sink {
        sink.publish(event);
    }
}
