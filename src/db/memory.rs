use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{BeginAttempt, Completion, FeedGap, StateStore};
use crate::models::{
    AttemptOutcome, CopyTradeConfig, CopyUsage, CopyWatcher, ExecutionAttempt, Fingerprint,
    IntentTarget, LimitOrder, OrderStatus, UserId, WalletSubscription,
};

#[derive(Default)]
struct Tables {
    subscriptions: HashMap<Uuid, WalletSubscription>,
    configs: HashMap<Uuid, CopyTradeConfig>,
    orders: HashMap<Uuid, LimitOrder>,
    attempts: HashMap<Fingerprint, ExecutionAttempt>,
    cursors: HashMap<String, u64>,
    gaps: Vec<FeedGap>,
}

impl Tables {
    fn config_for_subscription(&self, subscription_id: Uuid) -> Option<&CopyTradeConfig> {
        self.configs
            .values()
            .find(|c| c.subscription_id == subscription_id)
    }
}

/// In-process `StateStore` for dry runs and tests. Every method takes the
/// single table lock once, so each call is atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attempts that reached Succeeded.
    pub fn succeeded_count(&self) -> usize {
        self.tables
            .lock()
            .attempts
            .values()
            .filter(|a| a.outcome == AttemptOutcome::Succeeded)
            .count()
    }

    pub fn all_attempts(&self) -> Vec<ExecutionAttempt> {
        let mut attempts: Vec<_> = self.tables.lock().attempts.values().cloned().collect();
        attempts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        attempts
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn insert_subscription(&self, sub: &WalletSubscription) -> anyhow::Result<()> {
        let mut t = self.tables.lock();
        if t.subscriptions.contains_key(&sub.id) {
            anyhow::bail!("subscription {} already exists", sub.id);
        }
        t.subscriptions.insert(sub.id, sub.clone());
        Ok(())
    }

    async fn get_subscription(&self, id: Uuid) -> anyhow::Result<Option<WalletSubscription>> {
        Ok(self.tables.lock().subscriptions.get(&id).cloned())
    }

    async fn list_subscriptions(&self, owner: UserId) -> anyhow::Result<Vec<WalletSubscription>> {
        let mut subs: Vec<_> = self
            .tables
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.owner_user_id == owner)
            .cloned()
            .collect();
        subs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(subs)
    }

    async fn deactivate_subscription(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut t = self.tables.lock();
        let changed = match t.subscriptions.get_mut(&id) {
            Some(sub) if sub.active => {
                sub.active = false;
                true
            }
            _ => false,
        };
        let now = Utc::now();
        for config in t.configs.values_mut().filter(|c| c.subscription_id == id) {
            config.active = false;
            config.updated_at = now;
        }
        Ok(changed)
    }

    async fn upsert_copy_config(&self, config: &CopyTradeConfig) -> anyhow::Result<CopyTradeConfig> {
        let mut t = self.tables.lock();
        if !t.subscriptions.contains_key(&config.subscription_id) {
            anyhow::bail!("subscription {} not found", config.subscription_id);
        }

        let id = t
            .config_for_subscription(config.subscription_id)
            .map(|c| c.id)
            .unwrap_or(config.id);

        let stored = CopyTradeConfig {
            id,
            updated_at: Utc::now(),
            ..config.clone()
        };
        t.configs.insert(id, stored.clone());
        Ok(stored)
    }

    async fn get_copy_config(&self, id: Uuid) -> anyhow::Result<Option<CopyTradeConfig>> {
        Ok(self.tables.lock().configs.get(&id).cloned())
    }

    async fn get_copy_config_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> anyhow::Result<Option<CopyTradeConfig>> {
        Ok(self
            .tables
            .lock()
            .config_for_subscription(subscription_id)
            .cloned())
    }

    async fn load_active_copy_watchers(&self) -> anyhow::Result<Vec<CopyWatcher>> {
        let t = self.tables.lock();
        Ok(t.configs
            .values()
            .filter(|c| c.active)
            .filter_map(|c| {
                let sub = t.subscriptions.get(&c.subscription_id)?;
                sub.active.then(|| CopyWatcher {
                    subscription: sub.clone(),
                    config: c.clone(),
                })
            })
            .collect())
    }

    async fn copy_config_is_live(&self, config_id: Uuid) -> anyhow::Result<bool> {
        let t = self.tables.lock();
        Ok(t.configs
            .get(&config_id)
            .and_then(|c| {
                let sub = t.subscriptions.get(&c.subscription_id)?;
                Some(c.active && sub.active)
            })
            .unwrap_or(false))
    }

    async fn insert_limit_order(&self, order: &LimitOrder) -> anyhow::Result<()> {
        let mut t = self.tables.lock();
        if t.orders.contains_key(&order.id) {
            anyhow::bail!("limit order {} already exists", order.id);
        }
        t.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_limit_order(&self, id: Uuid) -> anyhow::Result<Option<LimitOrder>> {
        Ok(self.tables.lock().orders.get(&id).cloned())
    }

    async fn load_open_limit_orders(&self) -> anyhow::Result<Vec<LimitOrder>> {
        let mut orders: Vec<_> = self
            .tables
            .lock()
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Open)
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(orders)
    }

    async fn transition_limit_order(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        tx_ref: Option<&str>,
    ) -> anyhow::Result<bool> {
        if !from.can_transition_to(to) {
            anyhow::bail!("illegal limit order transition {from} -> {to}");
        }

        let mut t = self.tables.lock();
        let Some(order) = t.orders.get_mut(&id) else {
            return Ok(false);
        };
        if order.status != from {
            return Ok(false);
        }

        order.status = to;
        if to.is_terminal() {
            order.closed_at = Some(Utc::now());
        }
        if let Some(tx_ref) = tx_ref {
            order.external_tx_ref = Some(tx_ref.to_string());
        }
        Ok(true)
    }

    async fn due_limit_orders(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<LimitOrder>> {
        let mut due: Vec<_> = self
            .tables
            .lock()
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Open && o.is_expired_at(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.expiry.cmp(&b.expiry));
        Ok(due)
    }

    async fn begin_attempt(&self, attempt: &ExecutionAttempt) -> anyhow::Result<BeginAttempt> {
        let mut t = self.tables.lock();
        if let Some(existing) = t.attempts.get(&attempt.fingerprint) {
            return Ok(BeginAttempt::Existing(existing.clone()));
        }

        let now = Utc::now();
        let fresh = ExecutionAttempt {
            attempt_number: 0,
            outcome: AttemptOutcome::Pending,
            external_tx_ref: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            ..attempt.clone()
        };
        t.attempts.insert(fresh.fingerprint.clone(), fresh.clone());
        Ok(BeginAttempt::Started(fresh))
    }

    async fn record_submission(&self, fingerprint: &Fingerprint, attempt_number: u32) -> anyhow::Result<bool> {
        let mut t = self.tables.lock();
        match t.attempts.get_mut(fingerprint) {
            Some(a) if a.outcome == AttemptOutcome::Pending => {
                a.attempt_number = attempt_number;
                a.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_tx_ref(&self, fingerprint: &Fingerprint, tx_ref: &str) -> anyhow::Result<()> {
        let mut t = self.tables.lock();
        if let Some(a) = t.attempts.get_mut(fingerprint) {
            if a.outcome == AttemptOutcome::Pending {
                a.external_tx_ref = Some(tx_ref.to_string());
                a.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn complete_attempt(
        &self,
        fingerprint: &Fingerprint,
        outcome: AttemptOutcome,
        tx_ref: Option<&str>,
        error: Option<&str>,
    ) -> anyhow::Result<Completion> {
        if !outcome.is_terminal() {
            anyhow::bail!("complete_attempt requires a terminal outcome, got {outcome}");
        }

        let mut t = self.tables.lock();
        let Some(a) = t.attempts.get_mut(fingerprint) else {
            anyhow::bail!("attempt {fingerprint} not found");
        };
        if a.outcome.is_terminal() {
            return Ok(Completion::AlreadyTerminal(a.clone()));
        }

        a.outcome = outcome;
        if let Some(tx_ref) = tx_ref {
            a.external_tx_ref = Some(tx_ref.to_string());
        }
        a.error_message = error.map(str::to_string);
        a.updated_at = Utc::now();
        Ok(Completion::Recorded(a.clone()))
    }

    async fn get_attempt(&self, fingerprint: &Fingerprint) -> anyhow::Result<Option<ExecutionAttempt>> {
        Ok(self.tables.lock().attempts.get(fingerprint).cloned())
    }

    async fn stale_pending_attempts(
        &self,
        older_than: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ExecutionAttempt>> {
        let mut stale: Vec<_> = self
            .tables
            .lock()
            .attempts
            .values()
            .filter(|a| a.outcome == AttemptOutcome::Pending && a.updated_at <= older_than)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(stale)
    }

    async fn recent_attempts(&self, limit: i64) -> anyhow::Result<Vec<ExecutionAttempt>> {
        let mut attempts = self.all_attempts();
        attempts.reverse();
        attempts.truncate(usize::try_from(limit.max(0))?);
        Ok(attempts)
    }

    async fn copy_usage(&self, config_id: Uuid, instrument: &str) -> anyhow::Result<CopyUsage> {
        let t = self.tables.lock();
        let mut usage = CopyUsage::default();
        for a in t.attempts.values() {
            if a.target != IntentTarget::CopyConfig(config_id) || a.outcome != AttemptOutcome::Succeeded {
                continue;
            }
            usage.spent = usage.spent.saturating_add(a.amount);
            if a.instrument == instrument {
                usage.copies_of_token += 1;
            }
        }
        Ok(usage)
    }

    async fn load_cursor(&self, source_id: &str) -> anyhow::Result<Option<u64>> {
        Ok(self.tables.lock().cursors.get(source_id).copied())
    }

    async fn save_cursor(&self, source_id: &str, next_seq: u64) -> anyhow::Result<()> {
        let mut t = self.tables.lock();
        let cursor = t.cursors.entry(source_id.to_string()).or_insert(next_seq);
        *cursor = (*cursor).max(next_seq);
        Ok(())
    }

    async fn record_gap(&self, gap: &FeedGap) -> anyhow::Result<()> {
        self.tables.lock().gaps.push(gap.clone());
        Ok(())
    }

    async fn recent_gaps(&self, limit: i64) -> anyhow::Result<Vec<FeedGap>> {
        let t = self.tables.lock();
        Ok(t.gaps
            .iter()
            .rev()
            .take(usize::try_from(limit.max(0))?)
            .cloned()
            .collect())
    }
}
