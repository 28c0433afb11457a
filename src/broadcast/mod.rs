//! Progress broadcasting.
//!
//! ```text
//! OrchestrationEngine ──► ProgressBroadcaster ──► mpsc per subscriber ──► client session
//! ```
//!
//! Subscribers are grouped by [`ChannelKey`]. Publishing sends to every
//! live subscriber of the key under the registry lock; sends never block,
//! so per-key order is publish order. A subscriber whose receiver is gone
//! is evicted during the publish that discovers it.

pub mod session;

use crate::models::AnalysisStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

pub use session::ClientSession;

// ============================================================================
// Channel keys
// ============================================================================

/// Routing key for progress events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ChannelKey {
    Analysis(String),
    Project(String),
    User(String),
}

impl ChannelKey {
    pub fn analysis(contract_id: impl Into<String>) -> Self {
        ChannelKey::Analysis(contract_id.into())
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKey::Analysis(id) => write!(f, "analysis:{}", id),
            ChannelKey::Project(id) => write!(f, "project:{}", id),
            ChannelKey::User(id) => write!(f, "user:{}", id),
        }
    }
}

impl FromStr for ChannelKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid channel key: {}", s))?;
        if id.is_empty() {
            return Err(format!("channel key has no id: {}", s));
        }
        match kind {
            "analysis" => Ok(ChannelKey::Analysis(id.to_string())),
            "project" => Ok(ChannelKey::Project(id.to_string())),
            "user" => Ok(ChannelKey::User(id.to_string())),
            other => Err(format!("unknown channel kind: {}", other)),
        }
    }
}

impl From<ChannelKey> for String {
    fn from(key: ChannelKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for ChannelKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Server-to-client message bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    /// First message to a new subscriber
    ConnectionEstablished { subscription_id: u64 },

    /// Run status with a milestone percentage
    AnalysisProgress {
        status: AnalysisStatus,
        progress: u8,
        message: String,
    },

    /// Terminal success event
    #[serde(rename_all = "camelCase")]
    AnalysisComplete {
        risk_score: f64,
        summary: String,
        findings_count: usize,
        risks_count: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<i64>,
    },

    /// Error text, never a raw internal error
    Error { message: String },

    /// Keepalive reply
    Pong,

    /// Acknowledges a topic subscription
    Subscribed { events: Vec<String> },

    /// Acknowledges a topic removal
    Unsubscribed { events: Vec<String> },
}

impl EventPayload {
    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::ConnectionEstablished { .. } => "connection_established",
            EventPayload::AnalysisProgress { .. } => "analysis_progress",
            EventPayload::AnalysisComplete { .. } => "analysis_complete",
            EventPayload::Error { .. } => "error",
            EventPayload::Pong => "pong",
            EventPayload::Subscribed { .. } => "subscribed",
            EventPayload::Unsubscribed { .. } => "unsubscribed",
        }
    }
}

/// A message as delivered to subscribers: `{type, key, payload, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    #[serde(flatten)]
    pub payload: EventPayload,
    /// Absent for global broadcasts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<ChannelKey>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(key: Option<ChannelKey>, payload: EventPayload) -> Self {
        Self {
            payload,
            key,
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

// ============================================================================
// Registry
// ============================================================================

struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<ProgressEvent>,
    connected_at: DateTime<Utc>,
}

/// Receiving end handed to one subscriber.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub key: ChannelKey,
    receiver: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl Subscription {
    /// Wait for the next event; `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.recv().await
    }

    /// Next already-delivered event, if any.
    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.try_recv().ok()
    }

    /// Drain everything delivered so far.
    #[cfg(test)]
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Subscriber counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastStats {
    pub per_key: BTreeMap<String, usize>,
    pub total_subscribers: usize,
    pub total_keys: usize,
    /// Connection time of the longest-lived subscriber.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_connection: Option<DateTime<Utc>>,
}

/// Per-key publish/subscribe hub for progress events.
#[derive(Default)]
pub struct ProgressBroadcaster {
    subscribers: Mutex<HashMap<ChannelKey, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<ChannelKey, Vec<Subscriber>>> {
        // Registry state stays consistent even if a holder panicked.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a subscriber; it receives `connection_established` first.
    pub fn subscribe(&self, key: ChannelKey) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = mpsc::unbounded_channel();

        let welcome = ProgressEvent::new(
            Some(key.clone()),
            EventPayload::ConnectionEstablished {
                subscription_id: id,
            },
        );
        // The receiver is alive right here.
        let _ = sender.send(welcome);

        self.registry().entry(key.clone()).or_default().push(Subscriber {
            id,
            sender,
            connected_at: Utc::now(),
        });

        debug!("Subscriber {} joined {}", id, key);
        Subscription { id, key, receiver }
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription_id: u64) -> bool {
        let mut registry = self.registry();
        let mut removed = false;

        registry.retain(|_, subscribers| {
            let before = subscribers.len();
            subscribers.retain(|s| s.id != subscription_id);
            removed |= subscribers.len() != before;
            !subscribers.is_empty()
        });

        if removed {
            debug!("Subscriber {} left", subscription_id);
        }
        removed
    }

    /// Deliver to every live subscriber of `key`. Returns the delivery count.
    pub fn publish(&self, key: &ChannelKey, payload: EventPayload) -> usize {
        let event = ProgressEvent::new(Some(key.clone()), payload);
        let mut registry = self.registry();

        let Some(subscribers) = registry.get_mut(key) else {
            return 0;
        };

        let delivered = deliver(subscribers, &event);
        if subscribers.is_empty() {
            registry.remove(key);
        }
        delivered
    }

    /// Deliver to every live subscriber of every key.
    #[allow(dead_code)] // service-wide notices have no sender in the CLI
    pub fn publish_global(&self, payload: EventPayload) -> usize {
        let event = ProgressEvent::new(None, payload);
        let mut registry = self.registry();

        let mut delivered = 0;
        registry.retain(|_, subscribers| {
            delivered += deliver(subscribers, &event);
            !subscribers.is_empty()
        });
        delivered
    }

    /// Deliver to a single subscriber. Returns false if it is gone.
    pub fn send_to(&self, subscription_id: u64, payload: EventPayload) -> bool {
        let mut registry = self.registry();

        let Some((key, subscribers)) = registry
            .iter_mut()
            .find(|(_, subscribers)| subscribers.iter().any(|s| s.id == subscription_id))
        else {
            return false;
        };

        let event = ProgressEvent::new(Some(key.clone()), payload);
        let mut sent = false;
        subscribers.retain(|s| {
            if s.id != subscription_id {
                return true;
            }
            sent = s.sender.send(event.clone()).is_ok();
            sent
        });

        if subscribers.is_empty() {
            let key = key.clone();
            registry.remove(&key);
        }
        sent
    }

    pub fn stats(&self) -> BroadcastStats {
        let registry = self.registry();

        let per_key: BTreeMap<String, usize> = registry
            .iter()
            .map(|(key, subscribers)| (key.to_string(), subscribers.len()))
            .collect();

        BroadcastStats {
            total_subscribers: per_key.values().sum(),
            total_keys: per_key.len(),
            oldest_connection: registry
                .values()
                .flat_map(|subscribers| subscribers.iter().map(|s| s.connected_at))
                .min(),
            per_key,
        }
    }
}

/// Send to each subscriber, dropping those whose receiver is gone.
fn deliver(subscribers: &mut Vec<Subscriber>, event: &ProgressEvent) -> usize {
    let mut delivered = 0;
    subscribers.retain(|subscriber| match subscriber.sender.send(event.clone()) {
        Ok(()) => {
            delivered += 1;
            true
        }
        Err(_) => {
            debug!("Evicting closed subscriber {}", subscriber.id);
            false
        }
    });
    delivered
}
