//! Reload notifications over Redis pub/sub.
//!
//! Accepted message payloads:
//!
//! ```text
//! 42                                      reload partition 42
//! {"fid": 42, ...}                        reload partition 42
//! {"rule_id": 7, "type": "DELETE"}        reconcile every partition
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use deadpool_redis::redis::Client;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::content::PartitionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadEvent {
    Partition(PartitionKey),
    /// Reconcile every partition against the repository.
    Full,
}

pub fn parse_reload_message(payload: &str) -> Option<ReloadEvent> {
    let payload = payload.trim();
    if let Ok(partition) = payload.parse::<PartitionKey>() {
        return Some(ReloadEvent::Partition(partition));
    }

    let Value::Object(message) = serde_json::from_str::<Value>(payload).ok()? else {
        return None;
    };

    match message.get("fid") {
        Some(Value::Number(fid)) => return fid.as_i64().map(ReloadEvent::Partition),
        Some(Value::String(fid)) => return fid.parse().ok().map(ReloadEvent::Partition),
        Some(Value::Null) | None => {}
        Some(_) => return None,
    }

    message
        .contains_key("rule_id")
        .then_some(ReloadEvent::Full)
}

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Subscribes to the rules channel and forwards parsed events.
pub struct RedisReloadListener {
    redis_url: String,
    channel: String,
}

enum SessionEnd {
    Cancelled,
    Disconnected,
}

impl RedisReloadListener {
    pub fn new(redis_url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            channel: channel.into(),
        }
    }

    /// Listen until `cancel` fires or `sender` is closed, reconnecting with
    /// backoff. After a reconnect a [`ReloadEvent::Full`] is sent, since
    /// messages published while disconnected are lost.
    pub async fn run(
        self,
        sender: mpsc::Sender<ReloadEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut backoff = INITIAL_BACKOFF;
        let mut reconnecting = false;

        loop {
            match self.session(&sender, &cancel, reconnecting).await {
                Ok(SessionEnd::Cancelled) => return Ok(()),
                Ok(SessionEnd::Disconnected) => {
                    warn!(channel = %self.channel, "Reload subscription closed, reconnecting");
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    warn!(channel = %self.channel, error = ?e, delay_secs = backoff.as_secs(), "Reload subscription failed");
                }
            }
            reconnecting = true;

            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn session(
        &self,
        sender: &mpsc::Sender<ReloadEvent>,
        cancel: &CancellationToken,
        resync: bool,
    ) -> Result<SessionEnd> {
        let client = Client::open(self.redis_url.as_str()).context("Invalid Redis URL")?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .context("Failed to connect for pub/sub")?;
        pubsub
            .subscribe(&self.channel)
            .await
            .context("Failed to subscribe to rules channel")?;
        info!(channel = %self.channel, "Subscribed to rule reload notifications");

        if resync && sender.send(ReloadEvent::Full).await.is_err() {
            return Ok(SessionEnd::Cancelled);
        }

        let mut messages = pubsub.on_message();
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                message = messages.next() => message,
            };
            let Some(message) = message else {
                return Ok(SessionEnd::Disconnected);
            };

            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = ?e, "Unreadable reload notification");
                    continue;
                }
            };

            match parse_reload_message(&payload) {
                Some(event) => {
                    debug!(?event, "Reload notification received");
                    if sender.send(event).await.is_err() {
                        return Ok(SessionEnd::Cancelled);
                    }
                }
                None => warn!(payload = %payload, "Ignoring malformed reload notification"),
            }
        }
    }
}
