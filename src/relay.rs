//! Event relay — bridges agent channels to in-process observers.
//!
//! One pattern subscription over every `agent*` channel feeds a broadcast
//! stream that observers tap with [`EventRelay::subscribe`]. Messages are
//! sanitized before fan-out so oversized or sensitive payload fields never
//! reach observers.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::FleetError;
use crate::fabric::{topics, PubSub};

/// Payload fields stripped from every relayed message.
const STRIPPED_FIELDS: &[&str] = &["embedding", "spell"];

/// Additional fields stripped from events bound for analytics tracking.
const TRACKED_STRIPPED_FIELDS: &[&str] = &["content", "embedding", "rawData", "entities"];

/// One agent event as seen by observers.
#[derive(Debug, Clone)]
pub struct RelayedEvent {
    pub channel: String,
    pub agent_id: String,
    pub message_type: String,
    pub message: Value,
}

pub struct EventRelay {
    sender: broadcast::Sender<RelayedEvent>,
}

impl EventRelay {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity);
        Arc::new(Self { sender })
    }

    /// Subscribe the relay to every agent channel on `pubsub`.
    pub async fn start(self: &Arc<Self>, pubsub: Arc<dyn PubSub>) -> Result<(), FleetError> {
        let relay = self.clone();
        pubsub
            .pattern_subscribe(
                topics::AGENT_PATTERN,
                Arc::new(move |channel, message| {
                    let relay = relay.clone();
                    Box::pin(async move {
                        relay.handle(&channel, message);
                    })
                }),
            )
            .await
    }

    /// Tap the relayed stream. Slow receivers lag and drop, they never block
    /// the relay.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayedEvent> {
        self.sender.subscribe()
    }

    fn handle(&self, channel: &str, mut message: Value) {
        let Some((agent_id, message_type)) = topics::split_agent_channel(channel) else {
            debug!(channel = %channel, "unparseable agent channel, skipping");
            return;
        };

        // Unknown types are relayed anyway; the warn is the only difference.
        if !topics::AGENT_MESSAGE_TYPES.contains(&message_type) {
            warn!(channel = %channel, message_type = %message_type, "unknown agent message type");
        }

        sanitize(&mut message);

        let event = RelayedEvent {
            channel: channel.to_string(),
            agent_id: agent_id.to_string(),
            message_type: message_type.to_string(),
            message,
        };
        // Err means no live receivers; the stream simply has no audience.
        let _ = self.sender.send(event);
    }
}

/// Strip oversized payload fields from a relayed message, recursing into
/// nested objects and arrays.
pub fn sanitize(message: &mut Value) {
    strip_fields(message, STRIPPED_FIELDS);
}

/// Stricter sanitization for events bound for analytics tracking: also drops
/// message content and raw platform data.
pub fn sanitize_tracked(message: &mut Value) {
    strip_fields(message, STRIPPED_FIELDS);
    strip_fields(message, TRACKED_STRIPPED_FIELDS);
}

fn strip_fields(value: &mut Value, fields: &[&str]) {
    match value {
        Value::Object(map) => {
            for field in fields {
                map.remove(*field);
            }
            for nested in map.values_mut() {
                strip_fields(nested, fields);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_fields(item, fields);
            }
        }
        _ => {}
    }
}
