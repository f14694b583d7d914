//! Subscriber registry, replay buffer, and broadcast fan-out
//!
//! The hub owns every subscriber's outbound channel and the trailing
//! ring of recent stream events. Broadcasts are best-effort per
//! subscriber: order is preserved per subscriber, nothing is ever
//! duplicated, and a closed peer is deregistered on the next write.

use chrono::{DateTime, Utc};
use heapwatch_common::{AgentEvent, MetricRing};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

/// Outbound queue depth per subscriber; overflow drops (best-effort).
const SUBSCRIBER_QUEUE: usize = 256;

/// One framed event on the wire and in the replay ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub payload: serde_json::Value,
}

impl StreamEvent {
    pub fn new(channel: &str, payload: serde_json::Value) -> Self {
        let event_type = payload
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("message")
            .to_string();
        Self {
            id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            channel: channel.to_string(),
            payload,
        }
    }
}

/// Client-supplied predicate applied per subscriber.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamFilter {
    pub min_severity: Option<f64>,
    /// Whitelist of event `type` values.
    pub types: Option<Vec<String>>,
    /// Any-match against the event payload's `tags`.
    pub tags: Option<Vec<String>>,
}

impl StreamFilter {
    pub fn matches(&self, event: &StreamEvent) -> bool {
        if let Some(min) = self.min_severity {
            let severity = event
                .payload
                .get("severity")
                .and_then(|s| s.as_f64())
                .unwrap_or(0.0);
            if severity < min {
                return false;
            }
        }
        if let Some(types) = &self.types {
            if !types.iter().any(|t| t == &event.event_type) {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            let event_tags: Vec<String> = event
                .payload
                .get("tags")
                .and_then(|t| t.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            if !tags.iter().any(|t| event_tags.contains(t)) {
                return false;
            }
        }
        true
    }
}

struct Subscriber {
    channels: Vec<String>,
    filter: StreamFilter,
    tx: mpsc::Sender<StreamEvent>,
    connected_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
}

impl Subscriber {
    fn wants(&self, event: &StreamEvent) -> bool {
        self.channels.iter().any(|c| c == &event.channel) && self.filter.matches(event)
    }
}

/// Transport counters served by `/stats`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub subscribers: usize,
    pub total_connections: u64,
    pub events_broadcast: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
    pub buffered_events: usize,
}

/// Per-channel view served by `/channels`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub subscribers: usize,
    pub messages: u64,
    pub last_broadcast: Option<DateTime<Utc>>,
}

struct HubState {
    subscribers: HashMap<Uuid, Subscriber>,
    replay: MetricRing<StreamEvent>,
    channel_messages: HashMap<String, (u64, DateTime<Utc>)>,
    total_connections: u64,
    events_broadcast: u64,
    events_delivered: u64,
    events_dropped: u64,
}

/// The stream hub. Clone-cheap handle over shared state.
#[derive(Clone)]
pub struct StreamHub {
    state: std::sync::Arc<Mutex<HubState>>,
    events: broadcast::Sender<AgentEvent>,
}

impl StreamHub {
    pub fn new(buffer_size: usize, events: broadcast::Sender<AgentEvent>) -> Self {
        Self {
            state: std::sync::Arc::new(Mutex::new(HubState {
                subscribers: HashMap::new(),
                replay: MetricRing::new(buffer_size.max(1)),
                channel_messages: HashMap::new(),
                total_connections: 0,
                events_broadcast: 0,
                events_delivered: 0,
                events_dropped: 0,
            })),
            events,
        }
    }

    /// Register a subscriber; returns its id, the live receiver, and the
    /// replay-buffer suffix matching its subscription.
    pub fn subscribe(
        &self,
        channels: Vec<String>,
        filter: StreamFilter,
    ) -> (Uuid, mpsc::Receiver<StreamEvent>, Vec<StreamEvent>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let now = Utc::now();
        let subscriber = Subscriber {
            channels,
            filter,
            tx,
            connected_at: now,
            last_heartbeat: now,
        };

        let mut state = self.state.lock();
        let replay: Vec<StreamEvent> = state
            .replay
            .iter()
            .filter(|e| subscriber.wants(e))
            .cloned()
            .collect();
        state.subscribers.insert(id, subscriber);
        state.total_connections += 1;
        drop(state);

        info!(subscriber = %id, "stream client connected");
        let _ = self
            .events
            .send(AgentEvent::StreamingClientConnected { id });
        (id, rx, replay)
    }

    pub fn unsubscribe(&self, id: Uuid) {
        let removed = self.state.lock().subscribers.remove(&id).is_some();
        if removed {
            info!(subscriber = %id, "stream client disconnected");
            let _ = self
                .events
                .send(AgentEvent::StreamingClientDisconnected { id });
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Stamp and fan out one event. Returns the stamped event.
    pub fn broadcast(&self, payload: serde_json::Value, channel: &str) -> StreamEvent {
        let event = StreamEvent::new(channel, payload);
        let mut closed = Vec::new();

        let mut state = self.state.lock();
        state.replay.push(event.clone());
        state.events_broadcast += 1;
        let entry = state
            .channel_messages
            .entry(channel.to_string())
            .or_insert((0, event.timestamp));
        entry.0 += 1;
        entry.1 = event.timestamp;

        let mut delivered = 0u64;
        let mut dropped = 0u64;
        for (id, subscriber) in state.subscribers.iter() {
            if !subscriber.wants(&event) {
                continue;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow consumer: best-effort, no per-consumer queueing
                    // beyond the channel buffer.
                    dropped += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(*id);
                }
            }
        }
        state.events_delivered += delivered;
        state.events_dropped += dropped;
        for id in &closed {
            state.subscribers.remove(id);
        }
        drop(state);

        for id in closed {
            debug!(subscriber = %id, "removing closed stream client");
            let _ = self
                .events
                .send(AgentEvent::StreamingClientDisconnected { id });
        }
        event
    }

    /// Send a heartbeat frame to every subscriber and reap closed peers.
    pub fn heartbeat(&self) {
        let stats = self.stats();
        let payload = serde_json::json!({
            "type": "heartbeat",
            "stats": stats,
        });

        let mut closed = Vec::new();
        let now = Utc::now();
        let mut state = self.state.lock();
        for (id, subscriber) in state.subscribers.iter_mut() {
            let event = StreamEvent {
                id: Uuid::new_v4(),
                event_type: "heartbeat".into(),
                timestamp: now,
                channel: "system".into(),
                payload: payload.clone(),
            };
            match subscriber.tx.try_send(event) {
                Ok(()) => subscriber.last_heartbeat = now,
                Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in &closed {
            state.subscribers.remove(id);
        }
        drop(state);

        for id in closed {
            let _ = self
                .events
                .send(AgentEvent::StreamingClientDisconnected { id });
        }
    }

    pub fn stats(&self) -> HubStats {
        let state = self.state.lock();
        HubStats {
            subscribers: state.subscribers.len(),
            total_connections: state.total_connections,
            events_broadcast: state.events_broadcast,
            events_delivered: state.events_delivered,
            events_dropped: state.events_dropped,
            buffered_events: state.replay.len(),
        }
    }

    pub fn channels(&self) -> HashMap<String, ChannelInfo> {
        let state = self.state.lock();
        let mut info: HashMap<String, ChannelInfo> = HashMap::new();
        for (channel, (messages, last)) in &state.channel_messages {
            info.insert(
                channel.clone(),
                ChannelInfo {
                    subscribers: 0,
                    messages: *messages,
                    last_broadcast: Some(*last),
                },
            );
        }
        for subscriber in state.subscribers.values() {
            for channel in &subscriber.channels {
                info.entry(channel.clone())
                    .or_insert(ChannelInfo {
                        subscribers: 0,
                        messages: 0,
                        last_broadcast: None,
                    })
                    .subscribers += 1;
            }
        }
        info
    }

    /// Age of each subscriber's connection, for diagnostics.
    pub fn subscriber_ages(&self) -> HashMap<Uuid, chrono::TimeDelta> {
        let now = Utc::now();
        self.state
            .lock()
            .subscribers
            .iter()
            .map(|(id, s)| (*id, now - s.connected_at))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub(buffer: usize) -> StreamHub {
        let (tx, _rx) = broadcast::channel(64);
        StreamHub::new(buffer, tx)
    }

    #[tokio::test]
    async fn routes_by_channel() {
        let hub = hub(16);
        let (_a, mut rx_a, _) = hub.subscribe(vec!["alerts".into()], StreamFilter::default());
        let (_b, mut rx_b, _) = hub.subscribe(vec!["metrics".into()], StreamFilter::default());

        hub.broadcast(serde_json::json!({"type": "alert"}), "alerts");
        hub.broadcast(serde_json::json!({"type": "metric"}), "metrics");

        let got_a = rx_a.recv().await.unwrap();
        assert_eq!(got_a.channel, "alerts");
        assert!(rx_a.try_recv().is_err());

        let got_b = rx_b.recv().await.unwrap();
        assert_eq!(got_b.channel, "metrics");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn severity_filter_gates_delivery() {
        let hub = hub(16);
        let (_id, mut rx, _) = hub.subscribe(
            vec!["metrics".into()],
            StreamFilter {
                min_severity: Some(5.0),
                ..Default::default()
            },
        );

        hub.broadcast(serde_json::json!({"type": "metric", "severity": 6}), "metrics");
        hub.broadcast(serde_json::json!({"type": "metric", "severity": 3}), "metrics");
        hub.broadcast(serde_json::json!({"type": "metric", "severity": 9}), "metrics");

        assert_eq!(rx.recv().await.unwrap().payload["severity"], 6);
        assert_eq!(rx.recv().await.unwrap().payload["severity"], 9);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn type_and_tag_filters() {
        let hub = hub(16);
        let (_id, mut rx, _) = hub.subscribe(
            vec!["default".into()],
            StreamFilter {
                types: Some(vec!["leak".into()]),
                tags: Some(vec!["prod".into()]),
                ..Default::default()
            },
        );

        hub.broadcast(
            serde_json::json!({"type": "leak", "tags": ["prod"]}),
            "default",
        );
        hub.broadcast(
            serde_json::json!({"type": "leak", "tags": ["dev"]}),
            "default",
        );
        hub.broadcast(
            serde_json::json!({"type": "warning", "tags": ["prod"]}),
            "default",
        );

        let only = rx.recv().await.unwrap();
        assert_eq!(only.payload["tags"][0], "prod");
        assert_eq!(only.event_type, "leak");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn replay_buffer_serves_matching_suffix() {
        let hub = hub(3);
        for i in 0..5 {
            hub.broadcast(serde_json::json!({"type": "metric", "seq": i}), "metrics");
        }
        hub.broadcast(serde_json::json!({"type": "alert", "seq": 99}), "alerts");

        // Ring capacity 3: the two newest metric events plus the alert.
        let (_id, _rx, replay) =
            hub.subscribe(vec!["metrics".into()], StreamFilter::default());
        let seqs: Vec<i64> = replay
            .iter()
            .map(|e| e.payload["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[tokio::test]
    async fn per_subscriber_fifo_order() {
        let hub = hub(64);
        let (_id, mut rx, _) = hub.subscribe(vec!["metrics".into()], StreamFilter::default());

        for i in 0..20 {
            hub.broadcast(serde_json::json!({"type": "metric", "seq": i}), "metrics");
        }
        for i in 0..20 {
            assert_eq!(rx.recv().await.unwrap().payload["seq"], i);
        }
    }

    #[tokio::test]
    async fn closed_subscribers_are_reaped_on_write() {
        let hub = hub(16);
        let (_id, rx, _) = hub.subscribe(vec!["metrics".into()], StreamFilter::default());
        assert_eq!(hub.subscriber_count(), 1);

        drop(rx);
        hub.broadcast(serde_json::json!({"type": "metric"}), "metrics");
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn heartbeat_reaches_subscribers_and_reaps() {
        let hub = hub(16);
        let (_a, mut rx_a, _) = hub.subscribe(vec!["metrics".into()], StreamFilter::default());
        let (_b, rx_b, _) = hub.subscribe(vec!["alerts".into()], StreamFilter::default());
        drop(rx_b);

        hub.heartbeat();
        let beat = rx_a.recv().await.unwrap();
        assert_eq!(beat.event_type, "heartbeat");
        assert!(beat.payload["stats"]["subscribers"].is_number());
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn stats_and_channels_reflect_traffic() {
        let hub = hub(16);
        let (_id, _rx, _) = hub.subscribe(vec!["metrics".into()], StreamFilter::default());
        hub.broadcast(serde_json::json!({"type": "metric"}), "metrics");
        hub.broadcast(serde_json::json!({"type": "metric"}), "metrics");

        let stats = hub.stats();
        assert_eq!(stats.subscribers, 1);
        assert_eq!(stats.events_broadcast, 2);
        assert_eq!(stats.events_delivered, 2);

        let channels = hub.channels();
        let metrics = channels.get("metrics").unwrap();
        assert_eq!(metrics.subscribers, 1);
        assert_eq!(metrics.messages, 2);
        assert!(metrics.last_broadcast.is_some());
    }
}
