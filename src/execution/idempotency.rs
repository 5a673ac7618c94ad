use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

use crate::models::{ExecutionIntent, Fingerprint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Already admitted once.
    Duplicate,
    /// The trigger event sits below its source's watermark and can only be a replay.
    BelowWatermark,
    /// The target was cancelled, expired or unsubscribed.
    Revoked,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

#[derive(Default)]
struct GuardState {
    admitted: HashSet<Fingerprint>,
    /// Per source: trigger sequence -> fingerprints derived from it.
    by_source: HashMap<String, BTreeMap<u64, Vec<Fingerprint>>>,
    watermarks: HashMap<String, u64>,
    revoked: HashMap<Uuid, DateTime<Utc>>,
}

/// In-memory at-most-once gate for execution intents.
///
/// A fingerprint is retained until the watermark of the source that produced
/// its trigger event moves past that event; after that the event cannot be
/// redelivered and the fingerprint is dropped. The durable copy of the same
/// key is the primary key of the attempts table.
pub struct IdempotencyGuard {
    state: Mutex<GuardState>,
    soft_capacity: usize,
    revocation_ttl: Duration,
}

impl IdempotencyGuard {
    pub fn new(soft_capacity: usize, revocation_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(GuardState::default()),
            soft_capacity,
            revocation_ttl,
        }
    }

    pub fn admit(&self, intent: &ExecutionIntent) -> Admission {
        let source = &intent.trigger_event_id.source_id;
        let seq = intent.trigger_event_id.sequence;
        let now = Utc::now();
        let mut state = self.state.lock();

        let target = intent.target.id();
        if let Some(&revoked_at) = state.revoked.get(&target) {
            if now - revoked_at < self.revocation_ttl {
                return Admission::Revoked;
            }
            state.revoked.remove(&target);
        }
        if state.admitted.contains(&intent.fingerprint) {
            return Admission::Duplicate;
        }
        if state.watermarks.get(source).is_some_and(|wm| seq < *wm) {
            return Admission::BelowWatermark;
        }

        state.admitted.insert(intent.fingerprint.clone());
        state
            .by_source
            .entry(source.clone())
            .or_default()
            .entry(seq)
            .or_default()
            .push(intent.fingerprint.clone());

        let size = state.admitted.len();
        metrics::gauge!("guard_entries").set(size as f64);
        if size > self.soft_capacity {
            tracing::warn!(
                entries = size,
                soft_capacity = self.soft_capacity,
                "Idempotency guard above soft capacity; is a watermark stuck?"
            );
        }

        Admission::Admitted
    }

    /// Evict every fingerprint whose trigger sequence is below `watermark`.
    /// Watermarks never move backwards.
    pub fn advance_watermark(&self, source_id: &str, watermark: u64) -> usize {
        let mut state = self.state.lock();
        let current = state.watermarks.entry(source_id.to_string()).or_insert(0);
        if watermark <= *current {
            return 0;
        }
        *current = watermark;

        let evicted: Vec<Fingerprint> = match state.by_source.get_mut(source_id) {
            Some(per_seq) => {
                let keep = per_seq.split_off(&watermark);
                let old = std::mem::replace(per_seq, keep);
                old.into_values().flatten().collect()
            }
            None => Vec::new(),
        };
        for fp in &evicted {
            state.admitted.remove(fp);
        }

        metrics::gauge!("guard_entries").set(state.admitted.len() as f64);
        evicted.len()
    }

    /// Refuse every future intent for `target_id`.
    pub fn revoke(&self, target_id: Uuid) {
        let now = Utc::now();
        let mut state = self.state.lock();
        state.revoked.insert(target_id, now);
        let ttl = self.revocation_ttl;
        state.revoked.retain(|_, at| now - *at < ttl);
    }

    /// Lift a revocation, for a config that was switched back on.
    pub fn reinstate(&self, target_id: Uuid) -> bool {
        self.state.lock().revoked.remove(&target_id).is_some()
    }

    pub fn is_revoked(&self, target_id: Uuid) -> bool {
        let ttl = self.revocation_ttl;
        self.state
            .lock()
            .revoked
            .get(&target_id)
            .is_some_and(|at| Utc::now() - *at < ttl)
    }

    pub fn len(&self) -> usize {
        self.state.lock().admitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
