//! Messenger abstraction: deliver a notification with inline actions and
//! surface the user's button presses as decision events. The router only
//! sees the trait; production wires in the Telegram implementation.

pub mod format;
pub mod telegram;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::store::DecisionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    /// Retry with backoff: network trouble, 5xx, throttling.
    Transient,
    /// Recipient unreachable (blocked the bot, dead chat): mark inactive.
    Permanent,
}

#[derive(Debug, Error)]
#[error("messenger error ({kind:?}): {message}")]
pub struct SendError {
    pub kind: SendErrorKind,
    pub message: String,
}

impl SendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: SendErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: SendErrorKind::Permanent,
            message: message.into(),
        }
    }
}

/// One button under an outbound message.
#[derive(Debug, Clone)]
pub struct InlineAction {
    pub label: String,
    pub callback_data: String,
}

/// A user's response to a delivered signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionEvent {
    pub chat_id: String,
    pub signal_id: Uuid,
    pub user_id: String,
    pub action: DecisionKind,
}

#[async_trait]
pub trait Messenger: Send + Sync {
    /// Deliver `text` with action buttons; returns the provider message id.
    async fn send(
        &self,
        chat_id: &str,
        text: &str,
        actions: &[InlineAction],
    ) -> Result<i64, SendError>;

    /// Drain pending action callbacks (long-poll where supported).
    async fn poll_callbacks(&self) -> Result<Vec<DecisionEvent>, SendError>;
}

/// Standard [Place, Ignore] pair for a signal notification.
pub fn signal_actions(signal_id: Uuid, user_id: &str) -> Vec<InlineAction> {
    vec![
        InlineAction {
            label: "✅ Place Trade".to_string(),
            callback_data: format!("place:{signal_id}:{user_id}"),
        },
        InlineAction {
            label: "❌ Ignore".to_string(),
            callback_data: format!("ignore:{signal_id}:{user_id}"),
        },
    ]
}

/// Decode a callback payload produced by `signal_actions`.
pub fn parse_callback(chat_id: &str, data: &str) -> Option<DecisionEvent> {
    let mut parts = data.splitn(3, ':');
    let action = match parts.next()? {
        "place" => DecisionKind::Placed,
        "ignore" => DecisionKind::Ignored,
        _ => return None,
    };
    let signal_id = parts.next()?.parse::<Uuid>().ok()?;
    let user_id = parts.next()?;
    if user_id.is_empty() {
        return None;
    }
    Some(DecisionEvent {
        chat_id: chat_id.to_string(),
        signal_id,
        user_id: user_id.to_string(),
        action,
    })
}
