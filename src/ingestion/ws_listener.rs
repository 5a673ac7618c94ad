use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::{self, SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::feed::{EventStream, FeedError, FeedSource};
use crate::models::{EntityKey, EventPayload, PriceTick, Side, SwapDetails, TradeEvent};
use crate::registry::SubscriptionRegistry;

const PING_INTERVAL: Duration = Duration::from_secs(25);
const SESSION_BUFFER: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Swaps,
    Prices,
}

#[derive(Debug, Serialize)]
struct SubscribeMessage<'a> {
    op: &'static str,
    channel: Channel,
    chain_id: &'a str,
    keys: Vec<String>,
    from_seq: Option<u64>,
}

/// Registry keys this channel should carry: wallets for swaps, instruments
/// for prices, on our chain only.
fn channel_keys(channel: Channel, chain_id: &str, keys: &[EntityKey]) -> Vec<String> {
    let mut out: Vec<String> = keys
        .iter()
        .filter_map(|key| match (channel, key) {
            (Channel::Swaps, EntityKey::Wallet { chain_id: c, address }) if c == chain_id => {
                Some(address.clone())
            }
            (Channel::Prices, EntityKey::Instrument { chain_id: c, instrument }) if c == chain_id => {
                Some(instrument.clone())
            }
            _ => None,
        })
        .collect();
    out.sort();
    out
}

fn build_subscribe_message(
    channel: Channel,
    chain_id: &str,
    keys: &[EntityKey],
    from_seq: Option<u64>,
) -> Option<String> {
    let msg = SubscribeMessage {
        op: "subscribe",
        channel,
        chain_id,
        keys: channel_keys(channel, chain_id, keys),
        from_seq,
    };
    serde_json::to_string(&msg).ok()
}

/// JSON-over-WebSocket feed of wallet swaps or price ticks.
///
/// Subscribes to whatever the registry currently watches and re-subscribes
/// each time the registry changes.
pub struct WsFeedSource {
    source_id: String,
    url: String,
    channel: Channel,
    chain_id: String,
    registry: Arc<SubscriptionRegistry>,
}

impl WsFeedSource {
    pub fn new(
        source_id: impl Into<String>,
        url: impl Into<String>,
        channel: Channel,
        chain_id: impl Into<String>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            channel,
            chain_id: chain_id.into(),
            registry,
        }
    }

    fn subscribe_message(&self, from_seq: Option<u64>) -> Result<String, FeedError> {
        build_subscribe_message(self.channel, &self.chain_id, &self.registry.watched_keys(), from_seq)
            .ok_or_else(|| FeedError::Connect("failed to encode subscribe message".into()))
    }
}

#[async_trait]
impl FeedSource for WsFeedSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn connect(&self, from_seq: Option<u64>) -> Result<EventStream, FeedError> {
        tracing::info!(source = %self.source_id, url = %self.url, from_seq = ?from_seq, "Connecting to feed WebSocket...");

        let (ws_stream, _response) = connect_async(&self.url)
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;
        let (mut write, read) = ws_stream.split();

        let subscribe = self.subscribe_message(from_seq)?;
        write
            .send(Message::Text(subscribe.into()))
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;

        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        let session = Session {
            source_id: self.source_id.clone(),
            channel: self.channel,
            chain_id: self.chain_id.clone(),
            registry: self.registry.clone(),
            changes: self.registry.changes(),
        };
        tokio::spawn(session.run(write, read, tx));

        let events = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        Ok(events.boxed())
    }
}

struct Session {
    source_id: String,
    channel: Channel,
    chain_id: String,
    registry: Arc<SubscriptionRegistry>,
    changes: watch::Receiver<u64>,
}

impl Session {
    async fn run(mut self, mut write: WsWrite, mut read: WsRead, tx: mpsc::Sender<Result<TradeEvent, FeedError>>) {
        let mut ping_timer = interval(PING_INTERVAL);
        ping_timer.tick().await; // consume the first immediate tick

        let reason = loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            for item in parse_frames(&self.source_id, text.as_ref()) {
                                if tx.send(item).await.is_err() {
                                    // Adapter dropped the stream.
                                    return;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                break format!("failed to send pong: {e}");
                            }
                        }
                        Some(Ok(Message::Close(_))) => break "server sent close frame".to_string(),
                        Some(Ok(_)) => {} // Binary, Pong, Frame
                        Some(Err(e)) => break format!("read error: {e}"),
                        None => break "stream ended".to_string(),
                    }
                }
                _ = ping_timer.tick() => {
                    if let Err(e) = write.send(Message::Ping(vec![].into())).await {
                        break format!("failed to send ping: {e}");
                    }
                }
                changed = self.changes.changed() => {
                    if changed.is_err() {
                        break "registry closed".to_string();
                    }
                    let keys = self.registry.watched_keys();
                    let Some(msg) = build_subscribe_message(self.channel, &self.chain_id, &keys, None) else {
                        continue;
                    };
                    tracing::info!(source = %self.source_id, keys = keys.len(), "Registry changed, resubscribing");
                    if let Err(e) = write.send(Message::Text(msg.into())).await {
                        break format!("failed to resubscribe: {e}");
                    }
                }
                _ = tx.closed() => return,
            }
        };

        tracing::warn!(source = %self.source_id, reason = %reason, "Feed session ended");
        let _ = tx.send(Err(FeedError::Disconnected(reason))).await;
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireFrame {
    Swap {
        seq: u64,
        ts: Value,
        chain_id: String,
        wallet: String,
        tx: String,
        token: String,
        side: String,
        token_amount: Value,
        quote_amount: Value,
    },
    Price {
        seq: u64,
        ts: Value,
        chain_id: String,
        instrument: String,
        price: Value,
    },
    HistoryUnavailable {
        requested: u64,
        earliest: u64,
    },
}

const KNOWN_KINDS: [&str; 3] = ["swap", "price", "history_unavailable"];

/// Split a text message into feed items. A message may be one frame, an
/// array of frames, or `{"data": [...]}`. Frames of other kinds (acks,
/// heartbeats) are ignored.
pub fn parse_frames(source_id: &str, text: &str) -> Vec<Result<TradeEvent, FeedError>> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return vec![Err(FeedError::Malformed(truncate(text)))],
    };

    let frames = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("data") {
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
            None => vec![Value::Object(obj)],
        },
        _ => Vec::new(),
    };

    frames
        .into_iter()
        .filter(|frame| {
            frame
                .get("kind")
                .and_then(Value::as_str)
                .is_some_and(|k| KNOWN_KINDS.contains(&k))
        })
        .map(|frame| {
            let raw = truncate(&frame.to_string());
            match serde_json::from_value::<WireFrame>(frame) {
                Ok(WireFrame::HistoryUnavailable { requested, earliest }) => {
                    Err(FeedError::HistoryUnavailable { requested, earliest })
                }
                Ok(wire) => convert_frame(source_id, wire).map_err(|e| FeedError::Malformed(format!("{e}: {raw}"))),
                Err(e) => Err(FeedError::Malformed(format!("{e}: {raw}"))),
            }
        })
        .collect()
}

fn convert_frame(source_id: &str, frame: WireFrame) -> Result<TradeEvent, String> {
    match frame {
        WireFrame::Swap {
            seq,
            ts,
            chain_id,
            wallet,
            tx,
            token,
            side,
            token_amount,
            quote_amount,
        } => {
            let side = Side::from_api_str(&side).ok_or_else(|| format!("unknown side {side}"))?;
            Ok(TradeEvent {
                source_id: source_id.to_string(),
                sequence: seq,
                observed_at: parse_timestamp(&ts).ok_or("bad ts")?,
                payload: EventPayload::Swap(SwapDetails {
                    chain_id,
                    wallet,
                    tx_hash: tx,
                    token,
                    side,
                    token_amount: parse_decimal(&token_amount).ok_or("bad token_amount")?,
                    quote_amount: parse_decimal(&quote_amount).ok_or("bad quote_amount")?,
                }),
            })
        }
        WireFrame::Price {
            seq,
            ts,
            chain_id,
            instrument,
            price,
        } => Ok(TradeEvent {
            source_id: source_id.to_string(),
            sequence: seq,
            observed_at: parse_timestamp(&ts).ok_or("bad ts")?,
            payload: EventPayload::PriceTick(PriceTick {
                chain_id,
                instrument,
                price: parse_decimal(&price).ok_or("bad price")?,
            }),
        }),
        WireFrame::HistoryUnavailable { .. } => Err("not an event".into()),
    }
}

/// Epoch seconds, epoch millis (numbers above 10^12) or RFC 3339.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let from_epoch = |n: i64| {
        if n > 1_000_000_000_000 {
            Utc.timestamp_millis_opt(n).single()
        } else {
            Utc.timestamp_opt(n, 0).single()
        }
    };

    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_epoch),
        Value::String(s) => match s.parse::<i64>() {
            Ok(n) => from_epoch(n),
            Err(_) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        },
        _ => None,
    }
}

fn parse_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .ok()
            .or_else(|| n.as_f64().and_then(|f| Decimal::try_from(f).ok())),
        _ => None,
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(200).collect()
}
