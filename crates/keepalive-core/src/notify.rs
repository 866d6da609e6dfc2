use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a task stopped being kept alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalReason {
    DeletedByUser,
    ReplacedByNewTask,
    TooManyFailures { failures: u32 },
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalReason::DeletedByUser => f.write_str("deleted by user"),
            RemovalReason::ReplacedByNewTask => f.write_str("replaced by a newer task"),
            RemovalReason::TooManyFailures { failures } => {
                write!(f, "heartbeat failed {failures} times in a row")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    HeartbeatSucceeded,
    HeartbeatFailed { reason: String },
    TaskRemoved { reason: RemovalReason },
}

impl Notification {
    /// HTML body for the bot API.
    pub fn render(&self, uuid: Uuid) -> String {
        match self {
            Notification::HeartbeatSucceeded => format!(
                "✅ <b>Keepalive succeeded</b>\n\nTask: <code>{uuid}</code>\nStatus: heartbeat ok"
            ),
            Notification::HeartbeatFailed { reason } => format!(
                "⚠️ <b>Keepalive failed</b>\n\nTask: <code>{uuid}</code>\nReason: {}",
                escape_html(reason)
            ),
            Notification::TaskRemoved { reason } => format!(
                "🗑️ <b>Task removed</b>\n\nTask: <code>{uuid}</code>\nReason: {reason}\n\n\
                 This account is no longer kept alive."
            ),
        }
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Outbound status channel. Delivery is best effort and never fails the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, target: i64, uuid: Uuid, notification: Notification);
}

/// Notifier used when no bot is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, target: i64, uuid: Uuid, notification: Notification) {
        info!(
            target_chat = target,
            uuid = %uuid,
            ?notification,
            "notification (no bot configured)"
        );
    }
}

/// Sends notifications through the chat platform's bot HTTP API.
pub struct BotNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl BotNotifier {
    pub fn new(bot_token: &str) -> Result<Self> {
        Self::with_api_base(DEFAULT_API_BASE, bot_token)
    }

    pub fn with_api_base(api_base: &str, bot_token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(format!("tg-keepalive/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build bot http client")?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/bot{bot_token}/sendMessage",
                api_base.trim_end_matches('/')
            ),
        })
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .context("bot api request failed")?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            bail!("bot token rejected (401)");
        }
        let description = resp
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v["description"].as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown error".to_string());
        bail!("bot api returned {status}: {description}")
    }
}

#[async_trait]
impl Notifier for BotNotifier {
    async fn notify(&self, target: i64, uuid: Uuid, notification: Notification) {
        let text = notification.render(uuid);
        match self.send_message(target, &text).await {
            Ok(()) => info!(target_chat = target, uuid = %uuid, "notification sent"),
            Err(e) => {
                let msg = format!("{e:#}");
                let lower = msg.to_lowercase();
                if lower.contains("chat not found") || lower.contains("blocked") {
                    warn!(target_chat = target, "user has not started or blocked the bot: {msg}");
                } else {
                    error!(
                        target_chat = target,
                        uuid = %uuid,
                        "failed to send notification: {msg}"
                    );
                }
            }
        }
    }
}
