//! Client session handling for progress subscribers.
//!
//! Transport-independent: a transport feeds text frames in and forwards
//! whatever arrives on the [`Subscription`] out.

use super::{EventPayload, ProgressBroadcaster, ProgressEvent, Subscription};
use serde::Deserialize;
use std::collections::BTreeSet;
use tracing::debug;

/// Client-to-server commands.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keepalive
    Ping,

    /// Only forward the named event types
    Subscribe {
        #[serde(default)]
        events: Vec<String>,
    },

    /// Stop forwarding the named event types
    Unsubscribe {
        #[serde(default)]
        events: Vec<String>,
    },
}

/// One connected client.
pub struct ClientSession {
    subscription: Subscription,
    /// Event types the client asked for; empty means everything.
    topics: BTreeSet<String>,
}

impl ClientSession {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription,
            topics: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.subscription.id
    }

    pub fn topics(&self) -> &BTreeSet<String> {
        &self.topics
    }

    /// Answer one incoming text frame.
    pub fn reply_to(&mut self, text: &str) -> EventPayload {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(_) => {
                return EventPayload::Error {
                    message: format!("Unknown message type: {}", message_type(text)),
                }
            }
        };

        debug!("Session {} received {:?}", self.id(), message);
        match message {
            ClientMessage::Ping => EventPayload::Pong,
            ClientMessage::Subscribe { events } => {
                self.topics.extend(events.iter().cloned());
                EventPayload::Subscribed { events }
            }
            ClientMessage::Unsubscribe { events } => {
                for event in &events {
                    self.topics.remove(event);
                }
                EventPayload::Unsubscribed { events }
            }
        }
    }

    /// Answer a frame through the broadcaster, to this client only.
    pub fn handle(&mut self, broadcaster: &ProgressBroadcaster, text: &str) -> bool {
        let reply = self.reply_to(text);
        broadcaster.send_to(self.id(), reply)
    }

    /// Whether an event passes this client's topic filter. Control
    /// replies always pass.
    pub fn wants(&self, event: &ProgressEvent) -> bool {
        match event.payload {
            EventPayload::AnalysisProgress { .. } | EventPayload::AnalysisComplete { .. } => {
                self.topics.is_empty() || self.topics.contains(event.payload.kind())
            }
            _ => true,
        }
    }

    /// Next event the client wants; `None` once the subscription closes.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        loop {
            let event = self.subscription.recv().await?;
            if self.wants(&event) {
                return Some(event);
            }
        }
    }

    /// Leave the broadcaster.
    pub fn close(self, broadcaster: &ProgressBroadcaster) {
        broadcaster.unsubscribe(self.subscription.id);
    }
}

/// Best-effort `type` field of a frame, for error messages.
fn message_type(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_else(|| "invalid".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ChannelKey;
    use crate::models::AnalysisStatus;

    fn session(hub: &ProgressBroadcaster) -> ClientSession {
        let mut sub = hub.subscribe(ChannelKey::analysis("c1"));
        sub.drain();
        ClientSession::new(sub)
    }

    #[test]
    fn test_ping_pong() {
        let hub = ProgressBroadcaster::new();
        let mut s = session(&hub);
        assert_eq!(s.reply_to(r#"{"type": "ping"}"#), EventPayload::Pong);
    }

    #[test]
    fn test_subscribe_and_unsubscribe_topics() {
        let hub = ProgressBroadcaster::new();
        let mut s = session(&hub);

        let reply = s.reply_to(r#"{"type": "subscribe", "events": ["analysis_complete"]}"#);
        assert_eq!(
            reply,
            EventPayload::Subscribed {
                events: vec!["analysis_complete".to_string()]
            }
        );
        assert!(s.topics().contains("analysis_complete"));

        let reply = s.reply_to(r#"{"type": "unsubscribe", "events": ["analysis_complete"]}"#);
        assert!(matches!(reply, EventPayload::Unsubscribed { .. }));
        assert!(s.topics().is_empty());
    }

    #[test]
    fn test_unknown_or_invalid_message_is_error() {
        let hub = ProgressBroadcaster::new();
        let mut s = session(&hub);

        assert_eq!(
            s.reply_to(r#"{"type": "get_status"}"#),
            EventPayload::Error {
                message: "Unknown message type: get_status".to_string()
            }
        );
        assert!(matches!(s.reply_to("not json"), EventPayload::Error { .. }));
    }

    #[tokio::test]
    async fn test_replies_go_only_to_requester() {
        let hub = ProgressBroadcaster::new();
        let mut requester = session(&hub);
        let mut bystander = hub.subscribe(ChannelKey::analysis("c1"));
        bystander.drain();

        assert!(requester.handle(&hub, r#"{"type": "ping"}"#));
        let event = requester.next_event().await.unwrap();
        assert_eq!(event.payload, EventPayload::Pong);
        assert!(bystander.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_topic_filter_skips_unwanted_events() {
        let hub = ProgressBroadcaster::new();
        let key = ChannelKey::analysis("c1");
        let mut s = session(&hub);
        s.reply_to(r#"{"type": "subscribe", "events": ["analysis_complete"]}"#);

        hub.publish(
            &key,
            EventPayload::AnalysisProgress {
                status: AnalysisStatus::Analyzing,
                progress: 10,
                message: "running".to_string(),
            },
        );
        hub.publish(
            &key,
            EventPayload::AnalysisComplete {
                risk_score: 0.0,
                summary: String::new(),
                findings_count: 0,
                risks_count: 0,
                duration: None,
            },
        );

        let event = s.next_event().await.unwrap();
        assert_eq!(event.payload.kind(), "analysis_complete");

        s.close(&hub);
        assert_eq!(hub.stats().total_subscribers, 0);
    }
}
