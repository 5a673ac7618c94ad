use chrono::Utc;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};

use super::venue::{ExecutionVenue, Submission, SubmissionStatus, TradeRequest, VenueError};
use crate::db::{BeginAttempt, Completion, StateStore};
use crate::ingestion::WatermarkHold;
use crate::models::{
    AttemptOutcome, ExecutionAttempt, ExecutionIntent, Fingerprint, IntentTarget, OrderStatus,
    UserId,
};
use crate::services::notifier::{Notification, NotificationSink};

const PAUSE_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("state store error: {0}")]
    Store(#[from] anyhow::Error),

    /// Must never happen under correct operation; the dispatcher halts.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("dispatcher halted")]
    Halted,
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Concurrent executions across all users.
    pub workers: usize,
    /// Retries after the first submission for transient failures.
    pub max_retries: u32,
    /// Retry n waits `retry_unit * n^2`.
    pub retry_unit: Duration,
    /// Status polls for a submission the venue answered Pending.
    pub pending_polls: u32,
    pub pending_poll_interval: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            workers: 8,
            max_retries: 3,
            retry_unit: Duration::from_secs(1),
            pending_polls: 5,
            pending_poll_interval: Duration::from_secs(2),
        }
    }
}

impl DispatcherSettings {
    pub fn retry_delay(&self, retry: u32) -> Duration {
        self.retry_unit * retry.saturating_mul(retry)
    }
}

/// Terminal result for one attempt, before it is written.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub outcome: AttemptOutcome,
    pub tx_ref: Option<String>,
    pub error: Option<String>,
}

impl Settlement {
    pub fn succeeded(tx_ref: String) -> Self {
        Self {
            outcome: AttemptOutcome::Succeeded,
            tx_ref: Some(tx_ref),
            error: None,
        }
    }

    pub fn failed(tx_ref: Option<String>, error: impl Into<String>) -> Self {
        Self {
            outcome: AttemptOutcome::Failed,
            tx_ref,
            error: Some(error.into()),
        }
    }

    pub fn abandoned(error: impl Into<String>) -> Self {
        Self {
            outcome: AttemptOutcome::Abandoned,
            tx_ref: None,
            error: Some(error.into()),
        }
    }
}

/// An admitted intent on its way to the dispatcher. The hold keeps the
/// trigger event's sequence below the resume cursor until the attempt is in
/// the store.
#[derive(Debug)]
pub struct QueuedIntent {
    pub intent: ExecutionIntent,
    pub hold: Option<WatermarkHold>,
}

impl QueuedIntent {
    pub fn new(intent: ExecutionIntent, hold: WatermarkHold) -> Self {
        Self {
            intent,
            hold: Some(hold),
        }
    }
}

impl From<ExecutionIntent> for QueuedIntent {
    fn from(intent: ExecutionIntent) -> Self {
        Self { intent, hold: None }
    }
}

type Lane = VecDeque<(ExecutionIntent, ExecutionAttempt)>;

/// Executes admitted intents against the venue.
///
/// Every user has a lane: their recorded attempts run one at a time, in
/// arrival order. Lanes of different users share `workers` permits, taken
/// only once a lane is ready to submit, so a busy user never holds a permit
/// while waiting on their own backlog. Every outcome is persisted before the
/// notification goes out.
pub struct Dispatcher {
    store: Arc<dyn StateStore>,
    venue: Arc<dyn ExecutionVenue>,
    notifier: Arc<dyn NotificationSink>,
    settings: DispatcherSettings,
    permits: Arc<Semaphore>,
    lanes: Mutex<HashMap<UserId, Lane>>,
    user_locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
    pause_flag: Arc<AtomicBool>,
    halted: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn StateStore>,
        venue: Arc<dyn ExecutionVenue>,
        notifier: Arc<dyn NotificationSink>,
        settings: DispatcherSettings,
        pause_flag: Arc<AtomicBool>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.workers.max(1)));
        Self {
            store,
            venue,
            notifier,
            settings,
            permits,
            lanes: Mutex::new(HashMap::new()),
            user_locks: Mutex::new(HashMap::new()),
            pause_flag,
            halted: AtomicBool::new(false),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Users with queued or running executions.
    pub fn active_lanes(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Users currently holding a serialization lock entry.
    pub fn tracked_users(&self) -> usize {
        self.user_locks.lock().len()
    }

    fn user_lock(&self, user: UserId) -> Arc<tokio::sync::Mutex<()>> {
        self.user_locks.lock().entry(user).or_default().clone()
    }

    /// Drop our handle on a user's lock and forget the entry once nobody
    /// else holds or waits on it. Clones happen under the map lock, so the
    /// count check is exact.
    fn release_user_lock(&self, user: UserId, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.user_locks.lock();
        drop(lock);
        if locks.get(&user).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&user);
        }
    }

    async fn wait_while_paused(&self) {
        while self.pause_flag.load(Ordering::SeqCst) {
            tokio::time::sleep(PAUSE_POLL).await;
        }
    }

    /// Pull intents until the channel closes or an invariant violation halts
    /// the dispatcher. Pausing holds intents in the queue.
    ///
    /// Each intent is recorded as a Pending attempt before its watermark hold
    /// is released, then queued on its owner's lane. The loop itself never
    /// waits on an execution.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<QueuedIntent>) {
        tracing::info!(workers = self.settings.workers, "Execution dispatcher started");

        loop {
            self.wait_while_paused().await;
            if self.is_halted() {
                break;
            }
            let Some(QueuedIntent { intent, hold }) = rx.recv().await else {
                break;
            };
            self.wait_while_paused().await;

            let begun = match self.record(&intent).await {
                Ok(begun) => begun,
                Err(e) => {
                    // The hold stays, so the event is replayed after a restart.
                    tracing::error!(fingerprint = %intent.fingerprint, error = %e, "Failed to record attempt");
                    continue;
                }
            };
            if let Some(hold) = hold {
                hold.release();
            }
            if let BeginAttempt::Started(attempt) = begun {
                self.clone().enqueue(intent, attempt);
            }
        }

        if self.is_halted() {
            tracing::error!("Execution dispatcher halted; operator investigation required");
        } else {
            tracing::info!("Execution dispatcher stopped");
        }
    }

    fn enqueue(self: Arc<Self>, intent: ExecutionIntent, attempt: ExecutionAttempt) {
        let user = intent.owner_user_id;
        {
            let mut lanes = self.lanes.lock();
            if let Some(lane) = lanes.get_mut(&user) {
                lane.push_back((intent, attempt));
                return;
            }
            lanes.insert(user, VecDeque::new());
        }
        tokio::spawn(self.drain_lane(user, intent, attempt));
    }

    /// Work through one user's lane, then retire it.
    async fn drain_lane(self: Arc<Self>, user: UserId, mut intent: ExecutionIntent, mut attempt: ExecutionAttempt) {
        loop {
            let fingerprint = intent.fingerprint.clone();
            let lock = self.user_lock(user);
            let result = {
                let _serialized = lock.lock().await;
                match self.permits.clone().acquire_owned().await {
                    Ok(_permit) => self.execute_recorded(&intent, attempt).await,
                    Err(_) => Err(DispatchError::Halted),
                }
            };
            self.release_user_lock(user, lock);
            if let Err(e) = result {
                tracing::error!(fingerprint = %fingerprint, error = %e, "Execution failed to settle");
            }

            let next = {
                let mut lanes = self.lanes.lock();
                let next = lanes.get_mut(&user).and_then(VecDeque::pop_front);
                if next.is_none() {
                    lanes.remove(&user);
                }
                next
            };
            match next {
                Some((i, a)) => {
                    intent = i;
                    attempt = a;
                }
                None => return,
            }
        }
    }

    /// Durably record the attempt for an intent. `Existing` means a replay of
    /// an intent that was already recorded; it is never resubmitted.
    pub async fn record(&self, intent: &ExecutionIntent) -> Result<BeginAttempt, DispatchError> {
        let begun = self.store.begin_attempt(&ExecutionAttempt::pending(intent)).await?;
        if let BeginAttempt::Existing(existing) = &begun {
            tracing::info!(
                fingerprint = %intent.fingerprint,
                outcome = %existing.outcome,
                "Attempt already recorded; not resubmitting"
            );
            counter!("intents_deduplicated_total", "stage" => "dispatcher").increment(1);
        }
        Ok(begun)
    }

    /// Execute one intent to a persisted outcome.
    ///
    /// Returns the stored attempt. An attempt that the venue still reports as
    /// in flight is returned Pending; the reconciler settles it later.
    pub async fn execute(&self, intent: ExecutionIntent) -> Result<ExecutionAttempt, DispatchError> {
        if self.is_halted() {
            return Err(DispatchError::Halted);
        }

        let user = intent.owner_user_id;
        let lock = self.user_lock(user);
        let result = {
            let _serialized = lock.lock().await;
            match self.record(&intent).await {
                Ok(BeginAttempt::Started(attempt)) => self.execute_recorded(&intent, attempt).await,
                Ok(BeginAttempt::Existing(existing)) => Ok(existing),
                Err(e) => Err(e),
            }
        };
        self.release_user_lock(user, lock);
        result
    }

    /// Execute an attempt that `record` already started. Callers serialize
    /// per user.
    pub async fn execute_recorded(
        &self,
        intent: &ExecutionIntent,
        attempt: ExecutionAttempt,
    ) -> Result<ExecutionAttempt, DispatchError> {
        if self.is_halted() {
            return Err(DispatchError::Halted);
        }
        let started = Instant::now();
        let fp = intent.fingerprint.clone();

        if let Some(reason) = self.final_guard(intent).await? {
            tracing::info!(fingerprint = %fp, target = %intent.target, reason, "Final guard refused intent");
            return self
                .finish(&fp, intent.target, Settlement::failed(None, reason), started)
                .await;
        }

        if Utc::now() > intent.deadline {
            tracing::warn!(fingerprint = %fp, deadline = %intent.deadline, "Intent deadline passed before submission");
            return self
                .finish(&fp, intent.target, Settlement::abandoned("deadline exceeded"), started)
                .await;
        }

        let request = TradeRequest::from(intent);
        match self.submit_with_retries(&request, attempt.attempt_number).await? {
            Some(settlement) => self.finish(&fp, intent.target, settlement, started).await,
            None => {
                tracing::warn!(fingerprint = %fp, "Attempt not settled here; leaving it to reconciliation");
                self.store
                    .get_attempt(&fp)
                    .await?
                    .ok_or_else(|| DispatchError::Store(anyhow::anyhow!("attempt {fp} vanished")))
            }
        }
    }

    /// Time-of-use status check: limit order still open, or copy config live
    /// and within its budget and per-token cap. Returns a refusal reason, or
    /// None to proceed.
    async fn final_guard(&self, intent: &ExecutionIntent) -> Result<Option<&'static str>, DispatchError> {
        match intent.target {
            IntentTarget::LimitOrder(id) => {
                let moved = self
                    .store
                    .transition_limit_order(id, OrderStatus::Open, OrderStatus::Triggered, None)
                    .await?;
                Ok((!moved).then_some("order no longer open"))
            }
            IntentTarget::CopyConfig(id) => {
                if !self.store.copy_config_is_live(id).await? {
                    return Ok(Some("copy config inactive"));
                }
                let Some(config) = self.store.get_copy_config(id).await? else {
                    return Ok(Some("copy config inactive"));
                };
                if !config.has_usage_limits() {
                    return Ok(None);
                }
                // Executions of one user are serialized, so usage cannot move
                // under us before submission.
                let usage = self.store.copy_usage(id, &intent.trade.instrument).await?;
                Ok(config.limit_refusal(&usage, intent.computed_amount))
            }
        }
    }

    /// Submit with bounded retries for transient failures. `None` means the
    /// venue accepted the trade but has not settled it yet, or the attempt
    /// was settled elsewhere before this submission.
    async fn submit_with_retries(
        &self,
        request: &TradeRequest,
        prior_submissions: u32,
    ) -> Result<Option<Settlement>, DispatchError> {
        let fp = &request.client_ref;
        let mut attempt_number = prior_submissions;
        let mut retries = 0u32;

        loop {
            attempt_number += 1;
            if !self.store.record_submission(fp, attempt_number).await? {
                tracing::warn!(fingerprint = %fp, "Attempt no longer pending; not submitting");
                return Ok(None);
            }

            let err = match self.venue.submit(request).await {
                Ok(submission) => return self.follow(fp, submission).await,
                Err(e) => e,
            };

            match err {
                VenueError::Rejected(reason) => {
                    tracing::warn!(fingerprint = %fp, reason = %reason, "Venue rejected swap");
                    return Ok(Some(Settlement::failed(None, reason.to_string())));
                }
                VenueError::Transient(msg) => {
                    // The request may have landed before the failure surfaced.
                    match self.venue.find_by_client_ref(fp).await {
                        Ok(Some(submission)) => {
                            tracing::info!(fingerprint = %fp, tx_ref = %submission.tx_ref, "Previous submission found at venue");
                            return self.follow(fp, submission).await;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(fingerprint = %fp, error = %e, "Venue lookup by client_ref failed");
                        }
                    }

                    if retries >= self.settings.max_retries {
                        tracing::error!(fingerprint = %fp, attempts = attempt_number, error = %msg, "Retries exhausted");
                        return Ok(Some(Settlement::failed(None, format!("retries exhausted: {msg}"))));
                    }

                    retries += 1;
                    let delay = self.settings.retry_delay(retries);
                    counter!("execution_retries_total").increment(1);
                    tracing::warn!(
                        fingerprint = %fp,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %msg,
                        "Transient venue failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Persist the tx ref and wait a bounded time for a terminal status.
    async fn follow(&self, fp: &Fingerprint, submission: Submission) -> Result<Option<Settlement>, DispatchError> {
        self.store.record_tx_ref(fp, &submission.tx_ref).await?;

        let mut status = submission.status;
        let mut polls = 0u32;
        loop {
            match status {
                SubmissionStatus::Confirmed => return Ok(Some(Settlement::succeeded(submission.tx_ref))),
                SubmissionStatus::Failed(reason) => {
                    return Ok(Some(Settlement::failed(Some(submission.tx_ref), reason)))
                }
                SubmissionStatus::Pending if polls >= self.settings.pending_polls => return Ok(None),
                SubmissionStatus::Pending => {
                    polls += 1;
                    tokio::time::sleep(self.settings.pending_poll_interval).await;
                    status = match self.venue.query(&submission.tx_ref).await {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!(tx_ref = %submission.tx_ref, error = %e, "Status query failed");
                            SubmissionStatus::Pending
                        }
                    };
                }
            }
        }
    }

    async fn finish(
        &self,
        fp: &Fingerprint,
        target: IntentTarget,
        settlement: Settlement,
        started: Instant,
    ) -> Result<ExecutionAttempt, DispatchError> {
        let result = settle(self.store.as_ref(), self.notifier.as_ref(), fp, target, settlement).await;
        histogram!("execution_latency_seconds").record(started.elapsed().as_secs_f64());
        if let Err(DispatchError::InvariantViolation(msg)) = &result {
            self.halted.store(true, Ordering::SeqCst);
            tracing::error!(fingerprint = %fp, violation = %msg, "Halting dispatcher");
        }
        result
    }
}

/// Write a terminal outcome, close the limit order it fired, and notify once.
///
/// Shared by the dispatcher and the reconciler. Notification happens only for
/// the writer that actually moved the attempt out of Pending.
pub async fn settle(
    store: &dyn StateStore,
    notifier: &dyn NotificationSink,
    fp: &Fingerprint,
    target: IntentTarget,
    settlement: Settlement,
) -> Result<ExecutionAttempt, DispatchError> {
    let completion = store
        .complete_attempt(
            fp,
            settlement.outcome,
            settlement.tx_ref.as_deref(),
            settlement.error.as_deref(),
        )
        .await?;

    let attempt = match completion {
        Completion::Recorded(attempt) => attempt,
        Completion::AlreadyTerminal(existing) => {
            let conflicting = existing.outcome == AttemptOutcome::Succeeded
                && settlement.outcome == AttemptOutcome::Succeeded
                && existing.external_tx_ref != settlement.tx_ref;
            if conflicting {
                return Err(DispatchError::InvariantViolation(format!(
                    "second success for {fp}: {:?} vs {:?}",
                    existing.external_tx_ref, settlement.tx_ref
                )));
            }
            tracing::debug!(fingerprint = %fp, outcome = %existing.outcome, "Attempt already settled");
            return Ok(existing);
        }
    };

    match attempt.outcome {
        AttemptOutcome::Succeeded => counter!("executions_succeeded_total").increment(1),
        AttemptOutcome::Failed => counter!("executions_failed_total").increment(1),
        AttemptOutcome::Abandoned => counter!("executions_abandoned_total").increment(1),
        AttemptOutcome::Pending => {}
    }

    tracing::info!(
        fingerprint = %fp,
        target = %target,
        outcome = %attempt.outcome,
        tx_ref = ?attempt.external_tx_ref,
        error = ?attempt.error_message,
        "Execution settled"
    );

    let mut order_closed = None;
    if let IntentTarget::LimitOrder(order_id) = target {
        let to = if attempt.outcome == AttemptOutcome::Succeeded {
            OrderStatus::Filled
        } else {
            OrderStatus::Cancelled
        };
        let moved = store
            .transition_limit_order(order_id, OrderStatus::Triggered, to, attempt.external_tx_ref.as_deref())
            .await?;
        if moved && to == OrderStatus::Cancelled {
            order_closed = Some(Notification::OrderClosed {
                order_id,
                owner_user_id: attempt.owner_user_id,
                instrument: attempt.instrument.clone(),
                status: to,
            });
        }
    }

    notifier.notify(Notification::Execution(attempt.clone())).await;
    if let Some(n) = order_closed {
        notifier.notify(n).await;
    }

    Ok(attempt)
}
