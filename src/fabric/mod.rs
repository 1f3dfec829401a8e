//! Messaging fabric — pub/sub channels and durable job queues.
//!
//! The fabric is an external collaborator; the fleet only depends on the
//! [`PubSub`] and [`JobQueue`] traits. [`memory::MemoryFabric`] implements
//! both in-process and backs single-process deployments and every test.
//!
//! # Channel naming
//!
//! Other collaborators depend on the exact channel names produced by
//! [`topics`]; treat them as a wire contract, not an implementation detail.

pub mod memory;
pub mod topics;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::error::FleetError;

/// Handler for messages on an exact-match subscription.
pub type MessageHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handler for a pattern subscription — also receives the concrete channel.
pub type PatternHandler = Arc<dyn Fn(String, Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handler for jobs delivered from a named queue.
pub type JobHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Publish/subscribe channel service.
///
/// Pattern subscriptions use a `*`-suffix glob (`"agent*"` matches every
/// channel starting with `agent`); anything else is an exact match.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, message: Value) -> Result<(), FleetError>;

    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<(), FleetError>;

    async fn pattern_subscribe(
        &self,
        pattern: &str,
        handler: PatternHandler,
    ) -> Result<(), FleetError>;

    /// Drop every exact-match subscription on `channel`. No-op when none exist.
    async fn unsubscribe(&self, channel: &str) -> Result<(), FleetError>;
}

/// Durable job queue with at-least-once, in-order delivery to a single
/// registered handler per queue per process.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn add_job(&self, queue: &str, payload: Value) -> Result<(), FleetError>;

    /// Register the handler for `queue`. Jobs enqueued before registration
    /// are delivered once a handler exists. Registering a second handler for
    /// the same queue replaces the first.
    async fn register_handler(&self, queue: &str, handler: JobHandler) -> Result<(), FleetError>;

    /// Stop delivery for `queue`. No-op when no handler is registered.
    async fn remove_handler(&self, queue: &str) -> Result<(), FleetError>;
}

/// True when `channel` matches `pattern` (`*`-suffix glob or exact string).
pub fn matches_pattern(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => channel == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_suffix_matches_prefix() {
        assert!(matches_pattern("agent*", "agent:a1:log"));
        assert!(matches_pattern("agent*", "agent"));
        assert!(!matches_pattern("agent*", "fleet:a1:log"));
    }

    #[test]
    fn bare_pattern_is_exact() {
        assert!(matches_pattern("heartbeat-ping", "heartbeat-ping"));
        assert!(!matches_pattern("heartbeat-ping", "heartbeat-pong"));
    }
}
