//! Record-store interfaces — agent and spell definitions.
//!
//! The persistent store is an external collaborator; the fleet only performs
//! lookups. [`MemoryAgentStore`] and [`MemorySpellStore`] back the
//! single-process binary and tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FleetError;
use crate::spell::Spell;

/// Authoritative definition of one agent, as persisted.
///
/// `secrets` stays JSON-encoded at rest; the worker decodes it when applying
/// the record (see `AgentConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub root_spell_id: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub name: Option<String>,
    /// JSON-encoded map of secret name to value.
    #[serde(default)]
    pub secrets: Option<String>,
    #[serde(default)]
    pub public_variables: HashMap<String, Value>,
}

/// Lookup capability over agent records.
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn find(&self, agent_id: &str) -> Result<Option<AgentRecord>, FleetError>;
}

/// Lookup capability over spell definitions.
#[async_trait]
pub trait SpellStore: Send + Sync {
    async fn find(&self, project_id: &str, spell_id: &str) -> Result<Option<Spell>, FleetError>;
}

/// HashMap-backed [`AgentStore`].
#[derive(Default)]
pub struct MemoryAgentStore {
    records: RwLock<HashMap<String, AgentRecord>>,
}

impl MemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: AgentRecord) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(record.id.clone(), record);
    }

    pub fn remove(&self, agent_id: &str) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.remove(agent_id);
    }

    /// Flip the `enabled` flag on an existing record. No-op when absent.
    pub fn set_enabled(&self, agent_id: &str, enabled: bool) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = records.get_mut(agent_id) {
            record.enabled = enabled;
        }
    }
}

#[async_trait]
impl AgentStore for MemoryAgentStore {
    async fn find(&self, agent_id: &str) -> Result<Option<AgentRecord>, FleetError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(agent_id).cloned())
    }
}

/// HashMap-backed [`SpellStore`], keyed by spell id.
#[derive(Default)]
pub struct MemorySpellStore {
    spells: RwLock<HashMap<String, Spell>>,
}

impl MemorySpellStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, spell: Spell) {
        let mut spells = self.spells.write().unwrap_or_else(|e| e.into_inner());
        spells.insert(spell.id.clone(), spell);
    }
}

#[async_trait]
impl SpellStore for MemorySpellStore {
    async fn find(&self, project_id: &str, spell_id: &str) -> Result<Option<Spell>, FleetError> {
        let spells = self.spells.read().unwrap_or_else(|e| e.into_inner());
        Ok(spells
            .get(spell_id)
            .filter(|s| s.project_id == project_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, enabled: bool) -> AgentRecord {
        AgentRecord {
            id: id.into(),
            project_id: "p1".into(),
            root_spell_id: None,
            enabled,
            name: Some("test".into()),
            secrets: None,
            public_variables: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn find_returns_inserted_record() {
        let store = MemoryAgentStore::new();
        store.insert(record("a1", true));

        let found = store.find("a1").await.unwrap().unwrap();
        assert_eq!(found.id, "a1");
        assert!(store.find("a2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_enabled_updates_record() {
        let store = MemoryAgentStore::new();
        store.insert(record("a1", true));
        store.set_enabled("a1", false);

        let found = store.find("a1").await.unwrap().unwrap();
        assert!(!found.enabled);
    }

    #[tokio::test]
    async fn spell_lookup_scoped_to_project() {
        let store = MemorySpellStore::new();
        store.insert(Spell {
            id: "s1".into(),
            project_id: "p1".into(),
            name: "echo".into(),
            graph: serde_json::json!({}),
        });

        assert!(store.find("p1", "s1").await.unwrap().is_some());
        assert!(store.find("p2", "s1").await.unwrap().is_none());
    }

    #[test]
    fn record_wire_shape_is_camel_case() {
        let json = serde_json::to_value(record("a1", true)).unwrap();
        assert!(json.get("projectId").is_some());
        assert!(json.get("rootSpellId").is_some());
        assert!(json.get("publicVariables").is_some());
    }
}
