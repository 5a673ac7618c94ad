use chrono::Utc;
use futures_util::StreamExt;
use metrics::{counter, histogram};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;

use super::feed_adapter::{FeedAdapter, FeedItem};
use super::watermark::WatermarkTracker;
use crate::db::StateStore;
use crate::execution::dispatcher::QueuedIntent;
use crate::execution::idempotency::{Admission, IdempotencyGuard};
use crate::models::{EntityKey, ExecutionIntent, IntentTarget, TradeEvent};
use crate::registry::SubscriptionRegistry;
use crate::services::notifier::{Notification, NotificationSink};
use crate::trigger::{Decision, EvaluatorSettings, TriggerEvaluator};

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Two events from one source arrived at a worker out of sequence
    /// order. Fatal for the worker.
    #[error("out-of-order event for {entity} from {source_id}: seq {got} after {last}")]
    OutOfOrder {
        source_id: String,
        entity: EntityKey,
        last: u64,
        got: u64,
    },

    #[error("downstream channel closed")]
    ChannelClosed,
}

/// Routes events to evaluator workers by hashing the entity key, so every
/// event for one wallet or instrument is evaluated by the same worker in
/// arrival order. Sends wait when a worker's queue is full.
pub struct EventRouter {
    workers: Vec<mpsc::Sender<TradeEvent>>,
}

impl EventRouter {
    pub fn worker_for(&self, key: &EntityKey) -> usize {
        shard(key, self.workers.len())
    }

    pub async fn route(&self, event: TradeEvent) -> Result<(), PipelineError> {
        let idx = self.worker_for(&event.entity_key());
        self.workers[idx]
            .send(event)
            .await
            .map_err(|_| PipelineError::ChannelClosed)
    }
}

fn shard(key: &EntityKey, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

/// Shared pieces every evaluator worker needs.
#[derive(Clone)]
pub struct WorkerContext {
    pub registry: Arc<SubscriptionRegistry>,
    pub guard: Arc<IdempotencyGuard>,
    pub watermarks: Arc<WatermarkTracker>,
    pub intents: mpsc::Sender<QueuedIntent>,
}

pub struct EvaluatorWorker {
    id: usize,
    evaluator: TriggerEvaluator,
    ctx: WorkerContext,
    /// Highest sequence handled per source. A worker sees an ordered
    /// subsequence of each source, so one entry per source is enough.
    last_seen: HashMap<String, u64>,
}

impl EvaluatorWorker {
    pub fn new(id: usize, settings: EvaluatorSettings, ctx: WorkerContext) -> Self {
        Self {
            id,
            evaluator: TriggerEvaluator::new(settings),
            ctx,
            last_seen: HashMap::new(),
        }
    }

    /// Evaluate one event and hand every admitted intent downstream.
    /// Returns the number of intents emitted.
    pub async fn handle(&mut self, event: TradeEvent) -> Result<usize, PipelineError> {
        let started = Instant::now();
        let key = event.entity_key();

        if let Some(&last) = self.last_seen.get(&event.source_id) {
            if event.sequence <= last {
                return Err(PipelineError::OutOfOrder {
                    source_id: event.source_id.clone(),
                    entity: key,
                    last,
                    got: event.sequence,
                });
            }
        }
        self.last_seen.insert(event.source_id.clone(), event.sequence);

        let watchers = self.ctx.registry.lookup(&key);
        let decisions = self.evaluator.evaluate(&event, &watchers, Utc::now());
        let mut emitted = 0;

        for decision in decisions {
            match decision {
                Decision::Fire(intent) => {
                    if self.admit(&event, &intent).await? {
                        emitted += 1;
                    }
                }
                Decision::Skip { target, reason } => {
                    counter!("triggers_skipped_total", "reason" => reason.as_str()).increment(1);
                    tracing::debug!(
                        worker = self.id,
                        event = %event,
                        target = %target,
                        reason = %reason,
                        "Trigger skipped"
                    );
                }
            }
        }

        let watermark = self.ctx.watermarks.ack(&event.source_id, event.sequence);
        self.ctx.guard.advance_watermark(&event.source_id, watermark);
        histogram!("evaluation_latency_seconds").record(started.elapsed().as_secs_f64());

        Ok(emitted)
    }

    pub fn tracked_sources(&self) -> usize {
        self.last_seen.len()
    }

    async fn admit(&mut self, event: &TradeEvent, intent: &ExecutionIntent) -> Result<bool, PipelineError> {
        match self.ctx.guard.admit(intent) {
            Admission::Admitted => {}
            refused => {
                tracing::debug!(
                    fingerprint = %intent.fingerprint,
                    admission = ?refused,
                    "Intent not admitted"
                );
                counter!("intents_deduplicated_total", "stage" => "guard").increment(1);
                return Ok(false);
            }
        }

        self.evaluator.record_accepted(intent.target, event.observed_at);
        if let IntentTarget::LimitOrder(order_id) = intent.target {
            self.ctx.registry.retire_order(order_id);
        }

        tracing::info!(
            worker = self.id,
            event = %event,
            target = %intent.target,
            amount = %intent.computed_amount,
            fingerprint = %intent.fingerprint,
            "Intent emitted"
        );
        counter!("intents_emitted_total", "kind" => intent.target.kind()).increment(1);

        // Released by the dispatcher once the attempt is in the store.
        let hold = self.ctx.watermarks.hold(&event.source_id, event.sequence);
        self.ctx
            .intents
            .send(QueuedIntent::new(intent.clone(), hold))
            .await
            .map_err(|_| PipelineError::ChannelClosed)?;
        Ok(true)
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<TradeEvent>) -> Result<(), PipelineError> {
        tracing::info!(worker = self.id, "Evaluator worker started");
        while let Some(event) = rx.recv().await {
            if let Err(e) = self.handle(event).await {
                tracing::error!(worker = self.id, error = %e, "Evaluator worker halted");
                return Err(e);
            }
        }
        tracing::info!(worker = self.id, "Evaluator worker stopped");
        Ok(())
    }
}

/// Spawn `workers` evaluator workers, each behind a queue of
/// `queue_capacity`, and return the router feeding them.
pub fn spawn_workers(
    workers: usize,
    queue_capacity: usize,
    settings: EvaluatorSettings,
    ctx: WorkerContext,
) -> (Arc<EventRouter>, Vec<JoinHandle<Result<(), PipelineError>>>) {
    let mut senders = Vec::with_capacity(workers.max(1));
    let mut handles = Vec::with_capacity(workers.max(1));

    for id in 0..workers.max(1) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let worker = EvaluatorWorker::new(id, settings, ctx.clone());
        senders.push(tx);
        handles.push(tokio::spawn(worker.run(rx)));
    }

    (Arc::new(EventRouter { workers: senders }), handles)
}

/// Drive one feed source into the router. Gaps are recorded and reported,
/// then processing continues from where the source resumed.
pub async fn run_feed(
    adapter: FeedAdapter,
    router: Arc<EventRouter>,
    watermarks: Arc<WatermarkTracker>,
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn NotificationSink>,
) -> Result<(), PipelineError> {
    let stream = adapter.into_stream();
    tokio::pin!(stream);

    while let Some(item) = stream.next().await {
        match item {
            FeedItem::Event(event) => {
                watermarks.deliver(&event.source_id, event.sequence);
                router.route(event).await?;
            }
            FeedItem::Gap(gap) => {
                watermarks.seed(&gap.source_id, gap.resumed_seq);
                if let Err(e) = store.record_gap(&gap).await {
                    tracing::error!(source = %gap.source_id, error = %e, "Failed to record feed gap");
                }
                notifier.notify(Notification::FeedGap(gap)).await;
            }
        }
    }

    Err(PipelineError::ChannelClosed)
}

/// Persist every source's watermark as its resume cursor.
pub async fn checkpoint_cursors(store: &dyn StateStore, watermarks: &WatermarkTracker) -> usize {
    let mut saved = 0;
    for (source_id, next_seq) in watermarks.snapshot() {
        match store.save_cursor(&source_id, next_seq).await {
            Ok(()) => saved += 1,
            Err(e) => tracing::warn!(source = %source_id, error = %e, "Failed to checkpoint feed cursor"),
        }
    }
    saved
}

pub async fn run_cursor_checkpoints(
    store: Arc<dyn StateStore>,
    watermarks: Arc<WatermarkTracker>,
    interval_secs: u64,
) {
    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
    tracing::info!(interval_secs, "Cursor checkpointing started");
    loop {
        ticker.tick().await;
        checkpoint_cursors(store.as_ref(), &watermarks).await;
    }
}
