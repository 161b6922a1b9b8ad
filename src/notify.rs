use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::ExternalId;
use crate::observability;

const CHANNEL_CAPACITY: usize = 256;

/// What pressing a button asks the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    AcceptReschedule { negotiation_id: Ulid },
    DeclineReschedule { negotiation_id: Ulid },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyboard {
    pub rows: Vec<Vec<Button>>,
}

impl Keyboard {
    /// The Accept / Decline pair sent to an organizer with a reschedule request.
    pub fn decision(negotiation_id: Ulid) -> Self {
        Self {
            rows: vec![vec![
                Button {
                    label: "Accept".into(),
                    action: Action::AcceptReschedule { negotiation_id },
                },
                Button {
                    label: "Decline".into(),
                    action: Action::DeclineReschedule { negotiation_id },
                },
            ]],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub recipient: ExternalId,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<Keyboard>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The participant has no chat identity to deliver to.
    NoContact,
    /// Nobody is listening for this recipient right now.
    Unreachable(ExternalId),
    Sink(String),
}

impl DeliveryError {
    pub fn reason(&self) -> &'static str {
        match self {
            DeliveryError::NoContact => "no_contact",
            DeliveryError::Unreachable(_) => "unreachable",
            DeliveryError::Sink(_) => "sink",
        }
    }
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::NoContact => write!(f, "recipient has no contact"),
            DeliveryError::Unreachable(id) => write!(f, "recipient {id} is not connected"),
            DeliveryError::Sink(e) => write!(f, "sink error: {e}"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Outbound message channel. Implementations must not assume they are called
/// inside any engine lock; delivery always happens after a commit.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, message: Message) -> Result<(), DeliveryError>;
}

/// In-process sink: one broadcast channel per recipient.
pub struct NotifyHub {
    channels: DashMap<ExternalId, broadcast::Sender<Message>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to messages for a recipient. Creates the channel if needed.
    pub fn subscribe(&self, recipient: ExternalId) -> broadcast::Receiver<Message> {
        let sender = self
            .channels
            .entry(recipient)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Drop a recipient's channel once its last subscriber is gone.
    pub fn release(&self, recipient: &ExternalId) {
        self.channels
            .remove_if(recipient, |_, sender| sender.receiver_count() == 0);
    }
}

#[async_trait]
impl MessageSink for NotifyHub {
    async fn deliver(&self, message: Message) -> Result<(), DeliveryError> {
        let recipient = message.recipient;
        let Some(sender) = self.channels.get(&recipient) else {
            return Err(DeliveryError::Unreachable(recipient));
        };
        sender
            .send(message)
            .map(|_| ())
            .map_err(|_| DeliveryError::Unreachable(recipient))
    }
}

/// Best-effort notifier in front of a [`MessageSink`]. Failures are logged and
/// counted, never returned.
#[derive(Clone)]
pub struct Dispatcher {
    sink: Arc<dyn MessageSink>,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self { sink }
    }

    /// Returns whether the message was handed to the sink.
    pub async fn notify(
        &self,
        recipient: Option<ExternalId>,
        text: String,
        keyboard: Option<Keyboard>,
    ) -> bool {
        let result = match recipient {
            None => Err(DeliveryError::NoContact),
            Some(recipient) => {
                self.sink
                    .deliver(Message {
                        recipient,
                        text,
                        keyboard,
                    })
                    .await
            }
        };
        match result {
            Ok(()) => {
                metrics::counter!(observability::NOTIFICATIONS_SENT_TOTAL).increment(1);
                debug!(?recipient, "notification delivered");
                true
            }
            Err(e) => {
                metrics::counter!(observability::NOTIFICATIONS_FAILED_TOTAL, "reason" => e.reason())
                    .increment(1);
                warn!(?recipient, "notification not delivered: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenSink;

    #[async_trait]
    impl MessageSink for BrokenSink {
        async fn deliver(&self, _message: Message) -> Result<(), DeliveryError> {
            Err(DeliveryError::Sink("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = Arc::new(NotifyHub::new());
        let mut rx = hub.subscribe(42);
        let dispatcher = Dispatcher::new(hub.clone());

        assert!(dispatcher.notify(Some(42), "hello".into(), None).await);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.recipient, 42);
        assert_eq!(received.text, "hello");
        assert_eq!(received.keyboard, None);
    }

    #[tokio::test]
    async fn unreachable_recipient_reports_false() {
        let hub = Arc::new(NotifyHub::new());
        let dispatcher = Dispatcher::new(hub.clone());
        assert!(!dispatcher.notify(Some(7), "anyone?".into(), None).await);

        // A channel whose subscribers all left is unreachable too.
        let rx = hub.subscribe(7);
        drop(rx);
        assert_eq!(
            hub.deliver(Message {
                recipient: 7,
                text: "x".into(),
                keyboard: None
            })
            .await,
            Err(DeliveryError::Unreachable(7))
        );
    }

    #[tokio::test]
    async fn missing_contact_reports_false() {
        let dispatcher = Dispatcher::new(Arc::new(NotifyHub::new()));
        assert!(!dispatcher.notify(None, "lost".into(), None).await);
    }

    #[tokio::test]
    async fn sink_errors_are_swallowed() {
        let dispatcher = Dispatcher::new(Arc::new(BrokenSink));
        assert!(!dispatcher.notify(Some(1), "x".into(), None).await);
    }

    #[test]
    fn release_keeps_live_channels() {
        let hub = NotifyHub::new();
        let rx = hub.subscribe(5);
        hub.release(&5);
        assert!(hub.channels.contains_key(&5));
        drop(rx);
        hub.release(&5);
        assert!(!hub.channels.contains_key(&5));
    }

    #[test]
    fn decision_keyboard_encodes_actions() {
        let id = Ulid::new();
        let kb = Keyboard::decision(id);
        let json = serde_json::to_value(&kb).unwrap();
        assert_eq!(json["rows"][0][0]["label"], "Accept");
        assert_eq!(json["rows"][0][0]["action"], "accept_reschedule");
        assert_eq!(json["rows"][0][1]["action"], "decline_reschedule");
        assert_eq!(json["rows"][0][1]["negotiation_id"], id.to_string());
    }
}
