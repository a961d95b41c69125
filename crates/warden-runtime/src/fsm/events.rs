//! Transition events, the publish sink and observers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use warden_core::Failure;

/// Emitted after every applied transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub fsm_id: String,
    pub from: String,
    pub to: String,
    /// 1-based position in the machine's history
    pub sequence: u64,
    pub at: DateTime<Utc>,
}

/// Destination for transition events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &TransitionEvent) -> Result<(), Failure>;
}

/// Notified after every applied transition, in registration order.
#[async_trait]
pub trait Observer: Send + Sync {
    fn name(&self) -> &str;

    async fn on_notify(&self, event: &TransitionEvent) -> Result<(), Failure>;
}

/// Sink fanning events out to broadcast subscribers.
///
/// Publishing with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: broadcast::Sender<TransitionEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn publish(&self, event: &TransitionEvent) -> Result<(), Failure> {
        // send only fails when nobody is listening
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> TransitionEvent {
        TransitionEvent {
            fsm_id: "door".to_string(),
            from: "closed".to_string(),
            to: "open".to_string(),
            sequence: 1,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let sink = ChannelSink::new(8);
        let mut rx = sink.subscribe();

        sink.publish(&event()).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.to, "open");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let sink = ChannelSink::new(1);
        assert!(sink.publish(&event()).await.is_ok());
    }
}
