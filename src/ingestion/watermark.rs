use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Default)]
struct SourceMark {
    /// Outstanding holds per sequence: one for evaluation plus one per
    /// admitted intent not yet durably recorded.
    in_flight: BTreeMap<u64, usize>,
    /// One past the highest sequence delivered so far.
    next_unseen: u64,
}

impl SourceMark {
    fn watermark(&self) -> u64 {
        self.in_flight.keys().next().copied().unwrap_or(self.next_unseen)
    }
}

/// Per-source low watermark: the lowest sequence number that has been
/// delivered but not yet fully evaluated and recorded, or one past the
/// highest delivered sequence when nothing is in flight.
///
/// Nothing below the watermark can be seen again, so it doubles as the
/// resume cursor and as the eviction bound of the idempotency guard.
#[derive(Debug, Default)]
pub struct WatermarkTracker {
    sources: Mutex<HashMap<String, SourceMark>>,
}

impl WatermarkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a source at its persisted cursor.
    pub fn seed(&self, source_id: &str, next_seq: u64) {
        let mut sources = self.sources.lock();
        let mark = sources.entry(source_id.to_string()).or_default();
        mark.next_unseen = mark.next_unseen.max(next_seq);
    }

    /// Called before an event is handed to an evaluator worker.
    pub fn deliver(&self, source_id: &str, seq: u64) {
        let mut sources = self.sources.lock();
        let mark = sources.entry(source_id.to_string()).or_default();
        *mark.in_flight.entry(seq).or_default() += 1;
        mark.next_unseen = mark.next_unseen.max(seq.saturating_add(1));
    }

    /// Keep `seq` in flight until the returned hold is released. Taken for
    /// every admitted intent so the cursor never passes an event whose
    /// intents are still only in memory.
    pub fn hold(self: &Arc<Self>, source_id: &str, seq: u64) -> WatermarkHold {
        let mut sources = self.sources.lock();
        let mark = sources.entry(source_id.to_string()).or_default();
        *mark.in_flight.entry(seq).or_default() += 1;
        WatermarkHold {
            tracker: self.clone(),
            source_id: source_id.to_string(),
            seq,
        }
    }

    /// Drop one hold on `seq`: the evaluation hold taken by `deliver` or an
    /// intent hold. Returns the source's watermark after the ack.
    pub fn ack(&self, source_id: &str, seq: u64) -> u64 {
        let mut sources = self.sources.lock();
        let mark = sources.entry(source_id.to_string()).or_default();
        if let Some(count) = mark.in_flight.get_mut(&seq) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                mark.in_flight.remove(&seq);
            }
        }
        mark.watermark()
    }

    pub fn watermark(&self, source_id: &str) -> Option<u64> {
        self.sources.lock().get(source_id).map(SourceMark::watermark)
    }

    /// Current watermark of every known source.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut marks: Vec<_> = self
            .sources
            .lock()
            .iter()
            .map(|(id, mark)| (id.clone(), mark.watermark()))
            .collect();
        marks.sort();
        marks
    }
}

/// Keeps one event sequence in flight. Released once the intent it covers
/// is in the store; an unreleased hold pins the cursor so the event is
/// replayed after a restart.
#[derive(Debug)]
#[must_use = "an unreleased hold pins the watermark"]
pub struct WatermarkHold {
    tracker: Arc<WatermarkTracker>,
    source_id: String,
    seq: u64,
}

impl WatermarkHold {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn sequence(&self) -> u64 {
        self.seq
    }

    /// Returns the source's watermark after the release.
    pub fn release(self) -> u64 {
        self.tracker.ack(&self.source_id, self.seq)
    }
}
