//! Channel and queue names — the wire contract shared with collaborators.
//!
//! Agent channels follow `agent:<agentId>:<messageType>`. The relay's
//! pattern subscription on [`AGENT_PATTERN`] depends on this shape; parse
//! with [`split_agent_channel`] rather than ad-hoc string handling.

/// Pattern matching every agent channel.
pub const AGENT_PATTERN: &str = "agent*";

/// Fleet-wide broadcast ordering removal of an agent everywhere.
pub const AGENT_DELETE: &str = "agent:delete";

/// Liveness ping / pong carrying the locally-owned agent ids.
pub const HEARTBEAT_PING: &str = "heartbeat-ping";
pub const HEARTBEAT_PONG: &str = "heartbeat-pong";

/// Cluster-inventory ping / pong carrying `{id, currentAgents}`.
pub const FLEET_PING: &str = "cloud-agents:ping";
pub const FLEET_PONG: &str = "cloud-agents:pong";

/// Control queue; `{agentId}` payloads trigger reconciliation.
pub const CONTROL_QUEUE: &str = "agent:new";

/// Message types relayed to external observers as-is.
pub const AGENT_MESSAGE_TYPES: [&str; 4] = ["log", "result", "spell", "run"];

pub fn run_job(agent_id: &str) -> String {
    format!("agent:{agent_id}:run")
}

pub fn run_result(agent_id: &str) -> String {
    format!("agent:{agent_id}:result")
}

pub fn agent_log(agent_id: &str) -> String {
    format!("agent:{agent_id}:log")
}

pub fn agent_spell(agent_id: &str) -> String {
    format!("agent:{agent_id}:spell")
}

pub fn agent_update(agent_id: &str) -> String {
    format!("agent:{agent_id}:update")
}

pub fn agent_delete(agent_id: &str) -> String {
    format!("agent:{agent_id}:delete")
}

pub fn plugin_event(agent_id: &str, plugin: &str) -> String {
    format!("agent:{agent_id}:{plugin}:event")
}

pub fn plugin_action(agent_id: &str, plugin: &str) -> String {
    format!("agent:{agent_id}:{plugin}:action")
}

/// Parse `agent:<agentId>:<messageType>` into `(agent_id, message_type)`.
///
/// Returns `None` when the channel has fewer than three segments. Extra
/// segments (plugin channels) fold into the message type slot untouched —
/// callers treat unrecognised types as unknown.
pub fn split_agent_channel(channel: &str) -> Option<(&str, &str)> {
    let mut parts = channel.splitn(3, ':');
    let _prefix = parts.next()?;
    let agent_id = parts.next()?;
    let message_type = parts.next()?;
    Some((agent_id, message_type))
}
