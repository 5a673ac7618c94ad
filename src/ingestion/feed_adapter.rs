use chrono::Utc;
use futures_util::stream::{self, Stream, StreamExt};
use metrics::counter;
use std::sync::Arc;
use tokio::time::sleep;
use uuid::Uuid;

use super::feed::{Backoff, EventStream, FeedError, FeedSource};
use crate::db::FeedGap;
use crate::models::TradeEvent;

#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Event(TradeEvent),
    /// Sequence numbers `expected_seq..resumed_seq` will never be delivered.
    Gap(FeedGap),
}

/// Turns a reconnecting `FeedSource` into one gap-aware, duplicate-free,
/// strictly ordered stream.
///
/// Sequence numbers only have to increase; a subscription filtered by key
/// legitimately skips numbers. A gap is reported only when the source says
/// it cannot replay from the cursor. The stream ends if a source ever
/// delivers `u64::MAX`, since no cursor can follow it.
pub struct FeedAdapter {
    source: Arc<dyn FeedSource>,
    next_seq: Option<u64>,
    backoff: Backoff,
}

struct AdapterState {
    source: Arc<dyn FeedSource>,
    backoff: Backoff,
    stream: Option<EventStream>,
    next_seq: Option<u64>,
    connected_once: bool,
    exhausted: bool,
}

impl FeedAdapter {
    /// `next_seq` is the first sequence number not yet processed, as loaded
    /// from the cursor store. `None` starts from whatever the source offers.
    pub fn new(source: Arc<dyn FeedSource>, next_seq: Option<u64>) -> Self {
        Self {
            source,
            next_seq,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn into_stream(self) -> impl Stream<Item = FeedItem> + Send + 'static {
        let state = AdapterState {
            source: self.source,
            backoff: self.backoff,
            stream: None,
            next_seq: self.next_seq,
            connected_once: false,
            exhausted: false,
        };

        stream::unfold(state, |mut state| async move {
            let item = state.next_item().await?;
            Some((item, state))
        })
    }
}

impl AdapterState {
    fn gap(&self, expected_seq: u64, resumed_seq: u64) -> FeedGap {
        let source_id = self.source.source_id().to_string();
        tracing::error!(
            source = %source_id,
            expected_seq,
            resumed_seq,
            "Feed gap detected: events cannot be replayed"
        );
        counter!("feed_gaps_total", "source" => source_id.clone()).increment(1);
        FeedGap {
            id: Uuid::new_v4(),
            source_id,
            expected_seq,
            resumed_seq,
            detected_at: Utc::now(),
        }
    }

    async fn disconnect(&mut self, reason: &str) {
        self.stream = None;
        let delay = self.backoff.next_delay();
        tracing::warn!(
            source = %self.source.source_id(),
            reason,
            delay_ms = delay.as_millis() as u64,
            attempt = self.backoff.attempt(),
            "Feed disconnected, reconnecting..."
        );
        sleep(delay).await;
    }

    /// Open a session at the current cursor. Returns a gap when the source
    /// refuses to replay from there.
    async fn connect(&mut self) -> Option<FeedGap> {
        if self.connected_once {
            counter!("feed_reconnects_total", "source" => self.source.source_id().to_string())
                .increment(1);
        }
        self.connected_once = true;

        match self.source.connect(self.next_seq).await {
            Ok(s) => {
                tracing::info!(
                    source = %self.source.source_id(),
                    from_seq = ?self.next_seq,
                    "Feed connected"
                );
                self.backoff.reset();
                self.stream = Some(s);
                None
            }
            Err(FeedError::HistoryUnavailable { requested, earliest }) => {
                self.next_seq = Some(earliest);
                Some(self.gap(requested, earliest))
            }
            Err(e) => {
                self.disconnect(&e.to_string()).await;
                None
            }
        }
    }

    /// Move the cursor past a delivered event.
    fn advance_past(&mut self, seq: u64) {
        match seq.checked_add(1) {
            Some(next) => self.next_seq = Some(next),
            None => {
                tracing::error!(
                    source = %self.source.source_id(),
                    seq,
                    "Feed sequence space exhausted; closing stream"
                );
                self.exhausted = true;
            }
        }
    }

    async fn next_item(&mut self) -> Option<FeedItem> {
        if self.exhausted {
            return None;
        }

        loop {
            if self.stream.is_none() {
                if let Some(gap) = self.connect().await {
                    return Some(FeedItem::Gap(gap));
                }
                continue;
            }

            let next = match self.stream.as_mut() {
                Some(stream) => stream.next().await,
                None => continue,
            };

            match next {
                Some(Ok(event)) => {
                    if let Some(expected) = self.next_seq {
                        if event.sequence < expected {
                            tracing::debug!(
                                source = %event.source_id,
                                seq = event.sequence,
                                expected,
                                "Dropping replayed event"
                            );
                            counter!("feed_duplicates_total", "source" => event.source_id.clone())
                                .increment(1);
                            continue;
                        }
                    }
                    counter!("feed_events_total", "source" => event.source_id.clone()).increment(1);
                    self.advance_past(event.sequence);
                    return Some(FeedItem::Event(event));
                }
                Some(Err(FeedError::Malformed(raw))) => {
                    tracing::warn!(source = %self.source.source_id(), raw = %raw, "Malformed feed event discarded");
                    counter!("feed_malformed_total", "source" => self.source.source_id().to_string())
                        .increment(1);
                }
                Some(Err(FeedError::HistoryUnavailable { requested, earliest })) => {
                    self.next_seq = Some(earliest);
                    return Some(FeedItem::Gap(self.gap(requested, earliest)));
                }
                Some(Err(e)) => {
                    self.disconnect(&e.to_string()).await;
                }
                None => {
                    self.disconnect("stream ended").await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventPayload, PriceTick};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use std::collections::VecDeque;
    use std::time::Duration;

    fn tick(seq: u64) -> TradeEvent {
        TradeEvent {
            source_id: "prices".into(),
            sequence: seq,
            observed_at: Utc::now(),
            payload: EventPayload::PriceTick(PriceTick {
                chain_id: "solana".into(),
                instrument: "BONK".into(),
                price: Decimal::from(seq),
            }),
        }
    }

    /// Each connect pops the next scripted session.
    struct Sessions {
        sessions: Mutex<VecDeque<Result<Vec<Result<TradeEvent, FeedError>>, FeedError>>>,
        requested: Mutex<Vec<Option<u64>>>,
    }

    #[async_trait]
    impl FeedSource for Sessions {
        fn source_id(&self) -> &str {
            "prices"
        }

        async fn connect(&self, from_seq: Option<u64>) -> Result<EventStream, FeedError> {
            self.requested.lock().push(from_seq);
            match self.sessions.lock().pop_front() {
                Some(Ok(items)) => Ok(stream::iter(items).boxed()),
                Some(Err(e)) => Err(e),
                None => Ok(stream::pending().boxed()),
            }
        }
    }

    fn adapter(
        sessions: Vec<Result<Vec<Result<TradeEvent, FeedError>>, FeedError>>,
        from: Option<u64>,
    ) -> (Arc<Sessions>, impl Stream<Item = FeedItem>) {
        let source = Arc::new(Sessions {
            sessions: Mutex::new(sessions.into()),
            requested: Mutex::new(Vec::new()),
        });
        let stream = FeedAdapter::new(source.clone(), from)
            .with_backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(2)))
            .into_stream();
        (source, stream)
    }

    fn seqs(items: &[FeedItem]) -> Vec<u64> {
        items
            .iter()
            .filter_map(|i| match i {
                FeedItem::Event(e) => Some(e.sequence),
                FeedItem::Gap(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_reconnect_resumes_after_last_delivered() {
        let (source, stream) = adapter(
            vec![
                Ok(vec![Ok(tick(1)), Ok(tick(2)), Err(FeedError::Disconnected("reset".into()))]),
                Err(FeedError::Connect("refused".into())),
                // Source replays 2 again; the adapter must drop it.
                Ok(vec![Ok(tick(2)), Ok(tick(3)), Ok(tick(4))]),
            ],
            None,
        );

        let items: Vec<_> = stream.take(4).collect().await;
        assert_eq!(seqs(&items), vec![1, 2, 3, 4]);
        assert_eq!(*source.requested.lock(), vec![None, Some(3), Some(3)]);
    }

    #[tokio::test]
    async fn test_history_unavailable_signals_gap() {
        let (_, stream) = adapter(
            vec![
                Err(FeedError::HistoryUnavailable {
                    requested: 10,
                    earliest: 15,
                }),
                Ok(vec![Ok(tick(15)), Ok(tick(16))]),
            ],
            Some(10),
        );

        let items: Vec<_> = stream.take(3).collect().await;
        match &items[0] {
            FeedItem::Gap(gap) => {
                assert_eq!(gap.expected_seq, 10);
                assert_eq!(gap.resumed_seq, 15);
            }
            other => panic!("expected gap, got {other:?}"),
        }
        assert_eq!(seqs(&items), vec![15, 16]);
    }

    #[tokio::test]
    async fn test_sparse_sequences_are_not_gaps() {
        let (source, stream) = adapter(
            vec![
                Ok(vec![Ok(tick(1)), Ok(tick(5)), Err(FeedError::Disconnected("reset".into()))]),
                Ok(vec![Ok(tick(9))]),
            ],
            None,
        );

        let items: Vec<_> = stream.take(3).collect().await;
        assert!(items.iter().all(|i| matches!(i, FeedItem::Event(_))));
        assert_eq!(seqs(&items), vec![1, 5, 9]);
        assert_eq!(*source.requested.lock(), vec![None, Some(6)]);
    }

    #[tokio::test]
    async fn test_last_possible_sequence_ends_stream() {
        let (_, stream) = adapter(
            vec![Ok(vec![Ok(tick(u64::MAX - 1)), Ok(tick(u64::MAX)), Ok(tick(3))])],
            None,
        );

        let items: Vec<_> = stream.collect().await;
        assert_eq!(seqs(&items), vec![u64::MAX - 1, u64::MAX]);
    }

    #[tokio::test]
    async fn test_malformed_events_are_skipped() {
        let (_, stream) = adapter(
            vec![Ok(vec![
                Ok(tick(1)),
                Err(FeedError::Malformed("{garbage".into())),
                Ok(tick(2)),
            ])],
            None,
        );

        let items: Vec<_> = stream.take(2).collect().await;
        assert_eq!(seqs(&items), vec![1, 2]);
    }
}
