//! Wire shapes carried over the fabric.
//!
//! Field names are camelCase on the wire — external schedulers and observers
//! depend on them exactly as written here.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unit of work instructing one agent to execute one spell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunJob {
    pub inputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub job_id: String,
    pub agent_id: String,
    pub spell_id: String,
    pub component_name: String,
    pub run_subspell: bool,
    pub secrets: HashMap<String, String>,
    pub public_variables: HashMap<String, Value>,
}

/// Published on `agent:<id>:result` for every finished run.
///
/// Error runs carry `result: {"error": "<message>"}`; successful runs carry
/// the spell output verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub job_id: String,
    pub agent_id: String,
    pub project_id: String,
    pub original_data: RunJob,
    pub result: Value,
}

impl RunOutcome {
    pub fn success(job: &RunJob, project_id: &str, result: Value) -> Self {
        Self {
            job_id: job.job_id.clone(),
            agent_id: job.agent_id.clone(),
            project_id: project_id.to_string(),
            original_data: job.clone(),
            result,
        }
    }

    pub fn error(job: &RunJob, project_id: &str, message: &str) -> Self {
        Self::success(job, project_id, serde_json::json!({ "error": message }))
    }

    /// Extract the error message, if this outcome is an error.
    pub fn error_message(&self) -> Option<&str> {
        self.result.get("error").and_then(Value::as_str)
    }
}

/// Severity of a published agent log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Log,
    Warn,
    Error,
}

/// Structured log event published on `agent:<id>:log`, mirroring the local
/// tracing output so remote observers see the same signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentLogEvent {
    pub agent_id: String,
    pub project_id: String,
    #[serde(rename = "type")]
    pub severity: LogSeverity,
    pub message: String,
    pub data: Value,
    pub timestamp: String,
}

impl AgentLogEvent {
    pub fn new(agent_id: &str, project_id: &str, severity: LogSeverity, message: &str, data: Value) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            project_id: project_id.to_string(),
            severity,
            message: message.to_string(),
            data,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Control-queue payload triggering reconciliation for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateJob {
    pub agent_id: String,
}

/// Cluster-inventory pong payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetPong {
    pub id: uuid::Uuid,
    pub current_agents: Vec<String>,
}
