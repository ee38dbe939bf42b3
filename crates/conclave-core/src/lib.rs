//! conclave-core - concurrent agents sharing one user session
//!
//! This crate provides:
//! - Per-agent runtimes with a task queue, sleep/wake and graceful stop
//! - A channel router that splits model output into analysis, commentary and final messages
//! - A continuation engine that bounds multi-step turns with a hard iteration ceiling
//! - Mailboxes for inter-agent mail, including mail that hands the user over to the recipient
//! - Sessions that own the agents and keep per-agent conversation history across switches

pub mod agents;
pub mod config;
pub mod continuation;
pub mod error;
pub mod events;
pub mod mailbox;
pub mod provider;
pub mod router;
pub mod session;
pub mod tools;
pub mod types;

// Re-export main types for convenience
pub use agents::{
    AgentHandle, AgentProfile, AgentRegistry, AgentRuntime, AgentSnapshot, AgentState, HandoffAdvisor,
    KeywordHandoffAdvisor, StaticRegistry, TaskResult, TaskStatus, TurnRunner,
};
pub use config::{RuntimeConfig, SessionConfig};
pub use continuation::{ContinuationEngine, ContinuationPolicy, Decision};
pub use error::{ConclaveError, Result};
pub use events::{EventSink, RuntimeEvent};
pub use mailbox::{Envelope, Mail, MailCheck, MailPriority, MailQuery, MailStatus, PostOffice};
pub use provider::{CompletionChunk, CompletionProvider, CompletionStream, FinishReason, ToolCall, ToolDefinition};
pub use router::ChannelRouter;
pub use session::{Session, SessionBuilder};
pub use tools::{ToolExecutor, ToolHandler, ToolRegistry};
pub use types::{Channel, ChannelMessage, ConversationEntry, MessageMetadata, Role};
