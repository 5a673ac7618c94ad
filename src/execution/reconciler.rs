use chrono::{Duration, Utc};
use metrics::counter;
use std::sync::Arc;
use tokio::time::interval;

use super::dispatcher::{settle, DispatchError, Settlement};
use super::venue::{ExecutionVenue, SubmissionStatus};
use crate::db::StateStore;
use crate::models::ExecutionAttempt;
use crate::services::notifier::NotificationSink;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub settled: usize,
    pub still_pending: usize,
    pub errors: usize,
}

/// Settles attempts left Pending by a crash or a slow venue. Asks the venue
/// what happened; never submits.
pub struct Reconciler {
    store: Arc<dyn StateStore>,
    venue: Arc<dyn ExecutionVenue>,
    notifier: Arc<dyn NotificationSink>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn StateStore>,
        venue: Arc<dyn ExecutionVenue>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            venue,
            notifier,
        }
    }

    /// One pass over Pending attempts untouched since `now - stale_after`.
    pub async fn reconcile_once(&self, stale_after: Duration) -> Result<ReconcileReport, DispatchError> {
        let cutoff = Utc::now() - stale_after;
        let pending = self.store.stale_pending_attempts(cutoff).await?;
        let mut report = ReconcileReport::default();

        if pending.is_empty() {
            tracing::debug!("Reconciler: no pending attempts");
            return Ok(report);
        }
        tracing::info!(count = pending.len(), "Reconciler: checking pending attempts");

        for attempt in &pending {
            match self.reconcile_attempt(attempt).await {
                Ok(true) => report.settled += 1,
                Ok(false) => report.still_pending += 1,
                Err(e @ DispatchError::InvariantViolation(_)) => return Err(e),
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(fingerprint = %attempt.fingerprint, error = %e, "Reconciler: attempt not settled");
                }
            }
        }

        Ok(report)
    }

    /// Returns true when the attempt reached a terminal outcome.
    pub async fn reconcile_attempt(&self, attempt: &ExecutionAttempt) -> Result<bool, DispatchError> {
        let fp = &attempt.fingerprint;

        let settlement = match &attempt.external_tx_ref {
            Some(tx_ref) => match self.venue.query(tx_ref).await {
                Ok(SubmissionStatus::Confirmed) => Settlement::succeeded(tx_ref.clone()),
                Ok(SubmissionStatus::Failed(reason)) => Settlement::failed(Some(tx_ref.clone()), reason),
                Ok(SubmissionStatus::Pending) => return Ok(false),
                Err(e) => {
                    tracing::warn!(fingerprint = %fp, tx_ref, error = %e, "Reconciler: status query failed");
                    return Ok(false);
                }
            },
            None => match self.venue.find_by_client_ref(fp).await {
                Ok(Some(submission)) => {
                    self.store.record_tx_ref(fp, &submission.tx_ref).await?;
                    match submission.status {
                        SubmissionStatus::Confirmed => Settlement::succeeded(submission.tx_ref),
                        SubmissionStatus::Failed(reason) => Settlement::failed(Some(submission.tx_ref), reason),
                        SubmissionStatus::Pending => return Ok(false),
                    }
                }
                // The venue never saw it: the process died before submission landed.
                Ok(None) => Settlement::abandoned("not found at venue during reconciliation"),
                Err(e) => {
                    tracing::warn!(fingerprint = %fp, error = %e, "Reconciler: venue lookup failed");
                    return Ok(false);
                }
            },
        };

        tracing::info!(fingerprint = %fp, outcome = %settlement.outcome, "Reconciler: settling attempt");
        settle(
            self.store.as_ref(),
            self.notifier.as_ref(),
            fp,
            attempt.target,
            settlement,
        )
        .await?;
        counter!("reconciled_attempts_total").increment(1);
        Ok(true)
    }
}

/// Periodic reconciliation loop. Stops on an invariant violation.
pub async fn run_reconciler(reconciler: Arc<Reconciler>, interval_secs: u64, stale_secs: i64) {
    let mut ticker = interval(std::time::Duration::from_secs(interval_secs.max(1)));
    tracing::info!(interval_secs, stale_secs, "Reconciler started");

    loop {
        ticker.tick().await;
        match reconciler.reconcile_once(Duration::seconds(stale_secs)).await {
            Ok(report) if report.settled > 0 || report.errors > 0 => {
                tracing::info!(
                    settled = report.settled,
                    still_pending = report.still_pending,
                    errors = report.errors,
                    "Reconciler pass complete"
                );
            }
            Ok(_) => {}
            Err(DispatchError::InvariantViolation(msg)) => {
                tracing::error!(violation = %msg, "Reconciler halted on invariant violation");
                break;
            }
            Err(e) => tracing::error!(error = %e, "Reconciler pass failed"),
        }
    }
}
