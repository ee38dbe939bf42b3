//! Agent registry: read-only lookup of agent profiles

use std::collections::BTreeMap;
use tracing::{info, warn};

use super::profile::AgentProfile;

/// Source of agent profiles. Sessions only read from it.
pub trait AgentRegistry: Send + Sync {
    fn get(&self, agent_id: &str) -> Option<AgentProfile>;

    /// All profiles, ordered by id
    fn list(&self) -> Vec<AgentProfile>;

    fn contains(&self, agent_id: &str) -> bool {
        self.get(agent_id).is_some()
    }
}

/// In-memory registry built once at startup
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    profiles: BTreeMap<String, AgentProfile>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_profiles(profiles: impl IntoIterator<Item = AgentProfile>) -> Self {
        let mut registry = Self::new();
        for profile in profiles {
            registry.add_profile(profile);
        }
        registry
    }

    /// Add an agent profile, replacing any profile with the same id
    pub fn add_profile(&mut self, profile: AgentProfile) {
        info!(
            "StaticRegistry: added agent '{}' ({}) with {} allowed tools",
            profile.id,
            profile.name,
            profile.tools.len()
        );
        if let Some(previous) = self.profiles.insert(profile.id.clone(), profile) {
            warn!("StaticRegistry: replaced existing agent '{}'", previous.id);
        }
    }

    pub fn remove_profile(&mut self, id: &str) -> bool {
        self.profiles.remove(id).is_some()
    }

    pub fn count(&self) -> usize {
        self.profiles.len()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.profiles.keys().map(|k| k.as_str()).collect()
    }
}

impl AgentRegistry for StaticRegistry {
    fn get(&self, agent_id: &str) -> Option<AgentProfile> {
        self.profiles.get(agent_id).cloned()
    }

    fn list(&self) -> Vec<AgentProfile> {
        self.profiles.values().cloned().collect()
    }

    fn contains(&self, agent_id: &str) -> bool {
        self.profiles.contains_key(agent_id)
    }
}
