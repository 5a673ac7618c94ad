use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::db::FeedGap;
use crate::models::{short_addr, AttemptOutcome, ExecutionAttempt, OrderStatus, UserId};

/// One user- or operator-facing event. Each terminal execution outcome and
/// each closed limit order is reported exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Execution(ExecutionAttempt),
    OrderClosed {
        order_id: Uuid,
        owner_user_id: UserId,
        instrument: String,
        status: OrderStatus,
    },
    FeedGap(FeedGap),
}

/// Where notifications go. Delivery failures are the sink's problem and
/// never block the caller.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Telegram notification service. Failures are logged but never block the main flow.
#[derive(Debug, Clone)]
pub struct Notifier {
    http: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

impl Notifier {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token,
            chat_id,
        }
    }

    /// Send a Telegram message. Failures are logged as warnings.
    pub async fn send(&self, message: &str) {
        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            self.bot_token
        );

        let body = json!({
            "chat_id": self.chat_id,
            "text": message,
            "parse_mode": "Markdown",
        });

        match self.http.post(&url).json(&body).send().await {
            Ok(resp) => {
                if !resp.status().is_success() {
                    tracing::warn!(
                        status = %resp.status(),
                        "Telegram sendMessage returned non-2xx"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to send Telegram notification");
            }
        }
    }
}

#[async_trait]
impl NotificationSink for Notifier {
    async fn notify(&self, notification: Notification) {
        self.send(&format_notification(&notification)).await;
    }
}

/// Logs notifications. Used when no Telegram bot is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, notification: Notification) {
        tracing::info!(notification = %format_notification(&notification), "Notification");
    }
}

/// Forwards notifications into a channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            tracing::warn!("Notification channel closed");
        }
    }
}

pub fn format_notification(notification: &Notification) -> String {
    match notification {
        Notification::Execution(attempt) => format_execution(attempt),
        Notification::OrderClosed {
            order_id,
            owner_user_id,
            instrument,
            status,
        } => format!(
            "*Limit Order {}*\nOrder: `{}`\nUser: {}\nToken: `{}`",
            capitalize(status.as_str()),
            order_id,
            owner_user_id,
            short_addr(instrument),
        ),
        Notification::FeedGap(gap) => format!(
            "*Feed Gap*\nSource: {}\nMissing seq: {}..{}\nEvents in this range will not be evaluated.",
            gap.source_id, gap.expected_seq, gap.resumed_seq,
        ),
    }
}

fn format_execution(attempt: &ExecutionAttempt) -> String {
    let title = match attempt.outcome {
        AttemptOutcome::Succeeded => "Trade Executed",
        AttemptOutcome::Failed => "Trade Failed",
        AttemptOutcome::Abandoned => "Trade Abandoned",
        AttemptOutcome::Pending => "Trade Pending",
    };

    let mut msg = format!(
        "*{}*\nUser: {}\nSide: {}\nAmount: {}\nToken: `{}`\nSource: {}",
        title,
        attempt.owner_user_id,
        attempt.side,
        attempt.amount,
        short_addr(&attempt.instrument),
        attempt.target.kind(),
    );
    if let Some(tx) = &attempt.external_tx_ref {
        msg.push_str(&format!("\nTx: `{tx}`"));
    }
    if let Some(err) = &attempt.error_message {
        msg.push_str(&format!("\nError: {err}"));
    }
    msg
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
