//! Telegram Bot API messenger: sendMessage with an inline keyboard for
//! delivery, getUpdates long-polling for the [Place, Ignore] callbacks.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::MESSENGER_TIMEOUT_SECS;
use crate::messenger::{
    parse_callback, DecisionEvent, InlineAction, Messenger, SendError,
};

pub const TELEGRAM_BASE_URL: &str = "https://api.telegram.org";

/// getUpdates long-poll hold (seconds); must sit under the client timeout.
const POLL_HOLD_SECS: u64 = 10;

pub struct TelegramMessenger {
    client: reqwest::Client,
    base_url: String,
    token: String,
    /// Next update_id to request; advances as updates are consumed.
    update_offset: AtomicI64,
}

impl TelegramMessenger {
    pub fn new(token: String) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(MESSENGER_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: std::env::var("TELEGRAM_BASE_URL")
                .unwrap_or_else(|_| TELEGRAM_BASE_URL.to_string()),
            token,
            update_offset: AtomicI64::new(0),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.base_url, self.token)
    }

    async fn call(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, SendError> {
        let resp = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::transient(format!("{method} request failed: {e}")))?;

        let status = resp.status();
        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SendError::transient(format!("{method} bad response body: {e}")))?;

        if payload.get("ok").and_then(|v| v.as_bool()) == Some(true) {
            return Ok(payload.get("result").cloned().unwrap_or(serde_json::Value::Null));
        }

        let description = payload
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or("unknown")
            .to_string();
        // 403 = bot blocked by the user, 400 = chat not found / malformed
        // chat id: the recipient is gone, not the network.
        if status.as_u16() == 403 || status.as_u16() == 400 {
            return Err(SendError::permanent(format!("{method}: {description}")));
        }
        Err(SendError::transient(format!(
            "{method} failed ({status}): {description}"
        )))
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send(
        &self,
        chat_id: &str,
        text: &str,
        actions: &[InlineAction],
    ) -> Result<i64, SendError> {
        let keyboard_row: Vec<serde_json::Value> = actions
            .iter()
            .map(|a| json!({"text": a.label, "callback_data": a.callback_data}))
            .collect();
        let body = json!({
            "chat_id": chat_id,
            "text": text,
            "reply_markup": {"inline_keyboard": [keyboard_row]},
        });

        let result = self.call("sendMessage", body).await?;
        result
            .get("message_id")
            .and_then(|m| m.as_i64())
            .ok_or_else(|| SendError::transient("sendMessage result missing message_id"))
    }

    async fn poll_callbacks(&self) -> Result<Vec<DecisionEvent>, SendError> {
        let offset = self.update_offset.load(Ordering::Relaxed);
        let body = json!({
            "offset": offset,
            "timeout": POLL_HOLD_SECS,
            "allowed_updates": ["callback_query"],
        });
        let result = self.call("getUpdates", body).await?;

        let (events, acks, next_offset) = extract_callbacks(&result);
        if let Some(next) = next_offset {
            self.update_offset.store(next, Ordering::Relaxed);
        }

        // Ack every callback so the client stops its spinner; a failed ack
        // is cosmetic and never blocks decision recording.
        for callback_id in acks {
            if let Err(e) = self
                .call("answerCallbackQuery", json!({"callback_query_id": callback_id}))
                .await
            {
                warn!("answerCallbackQuery failed: {e}");
            }
        }

        debug!(count = events.len(), "polled messenger callbacks");
        Ok(events)
    }
}

/// Pull decision events out of a getUpdates result. Returns the events, the
/// callback-query ids to ack, and the next update offset.
fn extract_callbacks(result: &serde_json::Value) -> (Vec<DecisionEvent>, Vec<String>, Option<i64>) {
    let mut events = Vec::new();
    let mut acks = Vec::new();
    let mut max_update_id: Option<i64> = None;

    let Some(updates) = result.as_array() else {
        return (events, acks, None);
    };

    for update in updates {
        if let Some(update_id) = update.get("update_id").and_then(|v| v.as_i64()) {
            max_update_id = Some(max_update_id.map_or(update_id, |m| m.max(update_id)));
        }
        let Some(callback) = update.get("callback_query") else {
            continue;
        };
        if let Some(id) = callback.get("id").and_then(|v| v.as_str()) {
            acks.push(id.to_string());
        }
        let chat_id = callback
            .get("message")
            .and_then(|m| m.get("chat"))
            .and_then(|c| c.get("id"))
            .map(|id| match id.as_i64() {
                Some(n) => n.to_string(),
                None => id.as_str().unwrap_or("").to_string(),
            })
            .unwrap_or_default();
        let Some(data) = callback.get("data").and_then(|d| d.as_str()) else {
            continue;
        };
        match parse_callback(&chat_id, data) {
            Some(event) => events.push(event),
            None => debug!(data, "ignoring unrecognised callback payload"),
        }
    }

    (events, acks, max_update_id.map(|m| m + 1))
}
