//! Agents: profiles, registry, handoff advice and the per-agent runtime
//!
//! Each agent runs as its own tokio task ([`AgentRuntime`]) and executes one
//! user turn at a time through a [`TurnRunner`].

pub mod handoff;
pub mod profile;
pub mod registry;
pub mod runtime;
pub mod turn;

pub use handoff::{HandoffAdvisor, KeywordHandoffAdvisor};
pub use profile::AgentProfile;
pub use registry::{AgentRegistry, StaticRegistry};
pub use runtime::{
    AgentHandle, AgentRuntime, AgentSnapshot, AgentState, CurrentTask, Task, TaskResult, TaskStatus,
};
pub use turn::{TurnOutcome, TurnRunner};
