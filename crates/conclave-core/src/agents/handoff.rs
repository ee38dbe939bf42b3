//! Handoff advice: which agent should take over a conversation

use std::sync::Arc;
use tracing::debug;

use super::registry::AgentRegistry;
use crate::types::{ConversationEntry, Role};

/// Suggests a target agent. Advisory only; the session performs the switch.
pub trait HandoffAdvisor: Send + Sync {
    fn can_handoff(&self, conversation: &[ConversationEntry]) -> Option<String>;
}

/// Matches the latest user message against each profile's handoff keywords
pub struct KeywordHandoffAdvisor {
    registry: Arc<dyn AgentRegistry>,
}

impl KeywordHandoffAdvisor {
    pub fn new(registry: Arc<dyn AgentRegistry>) -> Self {
        Self { registry }
    }
}

impl HandoffAdvisor for KeywordHandoffAdvisor {
    fn can_handoff(&self, conversation: &[ConversationEntry]) -> Option<String> {
        let last_user = conversation.iter().rev().find(|e| e.role == Role::User)?;
        let target = self
            .registry
            .list()
            .into_iter()
            .find(|profile| profile.matches_handoff(&last_user.content))?;
        debug!("Handoff advised → agent '{}'", target.id);
        Some(target.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentProfile, StaticRegistry};

    fn advisor() -> KeywordHandoffAdvisor {
        let registry = StaticRegistry::from_profiles([
            AgentProfile::new("billing", "Billing").with_handoff_keywords(&["invoice", "refund"]),
            AgentProfile::new("support", "Support").with_handoff_keywords(&["broken", "error"]),
            AgentProfile::new("general", "General"),
        ]);
        KeywordHandoffAdvisor::new(Arc::new(registry))
    }

    #[test]
    fn test_advises_on_last_user_message() {
        let advisor = advisor();
        let conversation = vec![
            ConversationEntry::user("I need a refund"),
            ConversationEntry::assistant("Sure"),
            ConversationEntry::user("Actually the app is broken"),
        ];
        assert_eq!(advisor.can_handoff(&conversation).as_deref(), Some("support"));
    }

    #[test]
    fn test_no_match_no_advice() {
        let advisor = advisor();
        assert!(advisor.can_handoff(&[ConversationEntry::user("hello")]).is_none());
        assert!(advisor.can_handoff(&[]).is_none());
        assert!(advisor.can_handoff(&[ConversationEntry::assistant("refund")]).is_none());
    }
}
