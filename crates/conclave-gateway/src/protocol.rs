//! Gateway protocol: JSON messages between clients and the control plane

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use conclave_core::ConclaveError;

/// Client → Gateway request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Optional request ID for correlating responses
    #[serde(default)]
    pub id: Option<String>,
}

/// Gateway → Client response (to a specific request)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    /// Echoed from the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayError>,
}

/// Error in a gateway response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayError {
    pub code: i32,
    pub message: String,
}

/// Gateway → Client event (broadcast, no request ID)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

// ── Well-known methods ──

/// Methods the client can call
pub mod methods {
    pub const SESSION_CREATE: &str = "session.create";
    pub const SESSION_CLOSE: &str = "session.close";
    pub const SESSION_LIST: &str = "session.list";
    pub const STATUS_GET: &str = "status.get";

    pub const AGENT_CREATE: &str = "agent.create";
    pub const AGENT_SEND_TASK: &str = "agent.send_task";
    pub const AGENT_STATES: &str = "agent.states";
    pub const AGENT_SLEEP: &str = "agent.sleep";
    pub const AGENT_WAKE: &str = "agent.wake";
    pub const AGENT_STOP: &str = "agent.stop";
    pub const AGENT_SWITCH: &str = "agent.switch";
    pub const AGENT_RESULTS: &str = "agent.results";
    pub const AGENT_HISTORY: &str = "agent.history";

    pub const EVENT_BROADCAST: &str = "event.broadcast";

    pub const MAIL_SEND: &str = "mail.send";
    pub const MAIL_CHECK: &str = "mail.check";
    pub const MAIL_SEND_WITH_SWITCH: &str = "mail.send_with_switch";
    pub const MAIL_ACK: &str = "mail.ack";
}

/// Events the gateway emits itself; runtime events keep their own names
pub mod events {
    pub const SESSION_CREATED: &str = "session.created";
    pub const SESSION_CLOSED: &str = "session.closed";
}

// ── Error codes ──

pub const ERR_INVALID_METHOD: i32 = -32601;
pub const ERR_INVALID_PARAMS: i32 = -32602;
pub const ERR_INTERNAL: i32 = -32603;
pub const ERR_MAILBOX_UNAVAILABLE: i32 = -32004;

/// Wire code for a core error
pub fn error_code(err: &ConclaveError) -> i32 {
    match err {
        ConclaveError::MailboxUnavailable(_) => ERR_MAILBOX_UNAVAILABLE,
        ConclaveError::Validation(_)
        | ConclaveError::UnknownAgent(_)
        | ConclaveError::UnknownSession(_)
        | ConclaveError::AgentNotCreated(_)
        | ConclaveError::AgentStopped(_)
        | ConclaveError::NoActiveAgent => ERR_INVALID_PARAMS,
    }
}

impl GatewayResponse {
    pub fn ok(id: Option<String>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(GatewayError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn from_error(id: Option<String>, err: &ConclaveError) -> Self {
        Self::err(id, error_code(err), err.to_string())
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl GatewayEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            session_id: None,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn for_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}
