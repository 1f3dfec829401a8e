//! In-process messaging fabric.
//!
//! Backs single-process deployments and tests. Pub/sub delivery is awaited
//! inline in `publish` (so a returned `publish` means every current
//! subscriber ran); queue delivery runs on one consumer task per queue, which
//! preserves per-queue ordering and decouples producers from handlers.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::FleetError;
use crate::fabric::{matches_pattern, JobHandler, JobQueue, MessageHandler, PatternHandler, PubSub};

/// Tokio-channel implementation of [`PubSub`] and [`JobQueue`].
pub struct MemoryFabric {
    queue_depth: usize,
    subs: Mutex<HashMap<String, Vec<MessageHandler>>>,
    pattern_subs: Mutex<Vec<(String, PatternHandler)>>,
    queues: Mutex<HashMap<String, QueueSlot>>,
}

struct QueueSlot {
    tx: mpsc::Sender<Value>,
    handler_tx: watch::Sender<Option<JobHandler>>,
    task: JoinHandle<()>,
}

impl MemoryFabric {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            queue_depth,
            subs: Mutex::new(HashMap::new()),
            pattern_subs: Mutex::new(Vec::new()),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Lazily create the consumer task for `queue`.
    ///
    /// The task idles until a handler is registered, then drains jobs in
    /// order, awaiting the handler for each so delivery never reorders.
    fn slot_tx(&self, queue: &str) -> mpsc::Sender<Value> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let slot = queues.entry(queue.to_string()).or_insert_with(|| {
            let (tx, mut rx) = mpsc::channel::<Value>(self.queue_depth);
            let (handler_tx, mut handler_rx) = watch::channel::<Option<JobHandler>>(None);
            let name = queue.to_string();
            let task = tokio::spawn(async move {
                loop {
                    let handler = loop {
                        let current = handler_rx.borrow().clone();
                        match current {
                            Some(h) => break h,
                            None => {
                                if handler_rx.changed().await.is_err() {
                                    return;
                                }
                            }
                        }
                    };
                    tokio::select! {
                        changed = handler_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        job = rx.recv() => match job {
                            Some(payload) => {
                                debug!(queue = %name, "delivering job");
                                handler(payload).await;
                            }
                            None => return,
                        },
                    }
                }
            });
            QueueSlot { tx, handler_tx, task }
        });
        slot.tx.clone()
    }
}

impl Drop for MemoryFabric {
    fn drop(&mut self) {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        for slot in queues.values() {
            slot.task.abort();
        }
    }
}

#[async_trait]
impl PubSub for MemoryFabric {
    async fn publish(&self, channel: &str, message: Value) -> Result<(), FleetError> {
        let exact: Vec<MessageHandler> = {
            let subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
            subs.get(channel).cloned().unwrap_or_default()
        };
        let patterns: Vec<PatternHandler> = {
            let pats = self.pattern_subs.lock().unwrap_or_else(|e| e.into_inner());
            pats.iter()
                .filter(|(p, _)| matches_pattern(p, channel))
                .map(|(_, h)| h.clone())
                .collect()
        };

        for handler in exact {
            handler(message.clone()).await;
        }
        for handler in patterns {
            handler(channel.to_string(), message.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<(), FleetError> {
        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        subs.entry(channel.to_string()).or_default().push(handler);
        Ok(())
    }

    async fn pattern_subscribe(
        &self,
        pattern: &str,
        handler: PatternHandler,
    ) -> Result<(), FleetError> {
        let mut pats = self.pattern_subs.lock().unwrap_or_else(|e| e.into_inner());
        pats.push((pattern.to_string(), handler));
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), FleetError> {
        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        subs.remove(channel);
        Ok(())
    }
}

#[async_trait]
impl JobQueue for MemoryFabric {
    async fn add_job(&self, queue: &str, payload: Value) -> Result<(), FleetError> {
        let tx = self.slot_tx(queue);
        tx.send(payload)
            .await
            .map_err(|_| FleetError::Fabric(format!("queue {queue} is closed")))
    }

    async fn register_handler(&self, queue: &str, handler: JobHandler) -> Result<(), FleetError> {
        // Ensure the consumer task exists, then hand it the handler.
        let _ = self.slot_tx(queue);
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = queues.get(queue) {
            let _ = slot.handler_tx.send(Some(handler));
        }
        Ok(())
    }

    async fn remove_handler(&self, queue: &str) -> Result<(), FleetError> {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = queues.get(queue) {
            let _ = slot.handler_tx.send(None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn collector() -> (Arc<Mutex<Vec<Value>>>, MessageHandler) {
        let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: MessageHandler = Arc::new(move |msg| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().unwrap().push(msg);
            })
        });
        (seen, handler)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn publish_reaches_exact_subscriber() {
        let fabric = MemoryFabric::new(8);
        let (seen, handler) = collector();
        fabric.subscribe("agent:a1:log", handler).await.unwrap();

        fabric
            .publish("agent:a1:log", json!({"message": "hi"}))
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let fabric = MemoryFabric::new(8);
        let (seen, handler) = collector();
        fabric.subscribe("agent:a1:log", handler).await.unwrap();
        fabric.unsubscribe("agent:a1:log").await.unwrap();

        fabric.publish("agent:a1:log", json!({})).await.unwrap();

        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pattern_subscriber_sees_channel_name() {
        let fabric = MemoryFabric::new(8);
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: PatternHandler = Arc::new(move |channel, _msg| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().unwrap().push(channel);
            })
        });
        fabric.pattern_subscribe("agent*", handler).await.unwrap();

        fabric.publish("agent:a1:result", json!({})).await.unwrap();
        fabric.publish("fleet:other", json!({})).await.unwrap();

        assert_eq!(seen.lock().unwrap().as_slice(), ["agent:a1:result"]);
    }

    #[tokio::test]
    async fn queue_delivers_in_order() {
        let fabric = MemoryFabric::new(8);
        let (seen, handler) = collector();
        fabric.register_handler("a1", handler).await.unwrap();

        for i in 0..3 {
            fabric.add_job("a1", json!({"n": i})).await.unwrap();
        }
        settle().await;

        let seen = seen.lock().unwrap();
        let ns: Vec<i64> = seen.iter().map(|v| v["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn jobs_buffer_until_handler_registered() {
        let fabric = MemoryFabric::new(8);
        fabric.add_job("a1", json!({"n": 0})).await.unwrap();
        fabric.add_job("a1", json!({"n": 1})).await.unwrap();

        let (seen, handler) = collector();
        fabric.register_handler("a1", handler).await.unwrap();
        settle().await;

        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn remove_handler_stops_delivery() {
        let fabric = MemoryFabric::new(8);
        let (seen, handler) = collector();
        fabric.register_handler("a1", handler).await.unwrap();
        fabric.remove_handler("a1").await.unwrap();

        fabric.add_job("a1", json!({})).await.unwrap();
        settle().await;

        assert!(seen.lock().unwrap().is_empty());
    }
}
