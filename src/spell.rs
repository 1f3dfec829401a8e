//! Spell runner interfaces — the external execution capability.
//!
//! The workflow engine that actually runs a spell's graph lives outside this
//! crate. Workers consume it through [`SpellEngine`] (load a definition into
//! something runnable) and [`SpellRunner`] (`run(input) -> output`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FleetError;

/// A workflow definition, loaded on demand by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spell {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub graph: Value,
}

/// Everything a single spell invocation receives.
///
/// Secrets and public variables are copied in per run — never shared by
/// reference — so one run cannot mutate state visible to a concurrent run of
/// the same agent.
#[derive(Debug, Clone)]
pub struct SpellInput {
    pub inputs: Value,
    pub secrets: HashMap<String, String>,
    pub public_variables: HashMap<String, Value>,
    pub session_id: Option<String>,
    pub component_name: String,
    pub run_subspell: bool,
}

/// Loads a spell definition into a runnable handle.
#[async_trait]
pub trait SpellEngine: Send + Sync {
    async fn load(&self, spell: &Spell) -> Result<Arc<dyn SpellRunner>, FleetError>;
}

/// A loaded spell, ready to execute.
#[async_trait]
pub trait SpellRunner: Send + Sync {
    async fn run(&self, input: SpellInput) -> Result<Value, FleetError>;
}

/// Engine whose runners echo their inputs back. Used by the single-process
/// binary's demo mode and by tests.
#[derive(Default)]
pub struct EchoEngine;

#[async_trait]
impl SpellEngine for EchoEngine {
    async fn load(&self, _spell: &Spell) -> Result<Arc<dyn SpellRunner>, FleetError> {
        Ok(Arc::new(EchoRunner))
    }
}

struct EchoRunner;

#[async_trait]
impl SpellRunner for EchoRunner {
    async fn run(&self, input: SpellInput) -> Result<Value, FleetError> {
        Ok(input.inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn echo_runner_returns_inputs() {
        let engine = EchoEngine;
        let spell = Spell {
            id: "s1".into(),
            project_id: "p1".into(),
            name: "echo".into(),
            graph: json!({}),
        };
        let runner = engine.load(&spell).await.unwrap();
        let out = runner
            .run(SpellInput {
                inputs: json!({"text": "hello"}),
                secrets: HashMap::new(),
                public_variables: HashMap::new(),
                session_id: None,
                component_name: "default".into(),
                run_subspell: false,
            })
            .await
            .unwrap();
        assert_eq!(out, json!({"text": "hello"}));
    }
}
