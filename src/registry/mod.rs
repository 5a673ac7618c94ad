use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::models::{CopyWatcher, EntityKey, LimitOrder, OrderStatus, UserId};

/// Something that reacts to events on one entity key.
#[derive(Debug, Clone)]
pub enum Watcher {
    Copy(Arc<CopyWatcher>),
    Limit(Arc<LimitOrder>),
}

impl Watcher {
    pub fn id(&self) -> Uuid {
        match self {
            Watcher::Copy(w) => w.config.id,
            Watcher::Limit(o) => o.id,
        }
    }

    pub fn owner(&self) -> UserId {
        match self {
            Watcher::Copy(w) => w.subscription.owner_user_id,
            Watcher::Limit(o) => o.owner_user_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("copy watcher {0} is not live")]
    Inactive(Uuid),

    #[error("limit order {id} is {status}, only open orders can be registered")]
    NotOpen { id: Uuid, status: OrderStatus },
}

#[derive(Default)]
struct Index {
    by_entity: HashMap<EntityKey, Arc<[Watcher]>>,
    /// Where each watcher id currently lives.
    locations: HashMap<Uuid, EntityKey>,
}

impl Index {
    fn remove(&mut self, id: Uuid) -> bool {
        let Some(key) = self.locations.remove(&id) else {
            return false;
        };
        if let Some(current) = self.by_entity.get(&key) {
            let remaining: Vec<Watcher> = current.iter().filter(|w| w.id() != id).cloned().collect();
            if remaining.is_empty() {
                self.by_entity.remove(&key);
            } else {
                self.by_entity.insert(key, remaining.into());
            }
        }
        true
    }

    fn insert(&mut self, key: EntityKey, watcher: Watcher) {
        let id = watcher.id();
        self.remove(id);
        let mut next: Vec<Watcher> = self
            .by_entity
            .get(&key)
            .map(|ws| ws.to_vec())
            .unwrap_or_default();
        next.push(watcher);
        self.by_entity.insert(key.clone(), next.into());
        self.locations.insert(id, key);
    }
}

/// In-memory index of live copy configs and open limit orders, keyed by the
/// wallet or instrument they watch.
///
/// Each entity's watcher list is an immutable `Arc<[Watcher]>` replaced
/// wholesale on write, so a reader either sees the list before or after a
/// write and never a partial one. The index lock is only held for the swap.
/// Writers for the same owner are serialized through `lock_owner`.
pub struct SubscriptionRegistry {
    index: RwLock<Index>,
    owner_locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
    version: watch::Sender<u64>,
    empty: Arc<[Watcher]>,
}

/// Held while one owner's subscriptions are being written. The owner's lock
/// entry is dropped on release once nobody else holds or awaits it.
pub struct OwnerGuard<'a> {
    registry: &'a SubscriptionRegistry,
    owner: UserId,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.registry.owner_locks.lock();
        drop(self.guard.take());
        if locks.get(&self.owner).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&self.owner);
        }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            index: RwLock::new(Index::default()),
            owner_locks: Mutex::new(HashMap::new()),
            version,
            empty: Arc::from(Vec::new()),
        }
    }

    /// Snapshot of everything watching `key`. Empty when nothing does.
    pub fn lookup(&self, key: &EntityKey) -> Arc<[Watcher]> {
        self.index
            .read()
            .by_entity
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.empty.clone())
    }

    /// Serialize writes for one owner. Hold the guard across the store write
    /// and the registry update.
    pub async fn lock_owner(&self, owner: UserId) -> OwnerGuard<'_> {
        let lock = self
            .owner_locks
            .lock()
            .entry(owner)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        OwnerGuard {
            registry: self,
            owner,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Owners with a lock entry, held or awaited.
    pub fn owner_lock_count(&self) -> usize {
        self.owner_locks.lock().len()
    }

    pub fn upsert_copy(&self, watcher: CopyWatcher) -> Result<(), RegistryError> {
        if !watcher.is_live() {
            return Err(RegistryError::Inactive(watcher.config.id));
        }
        let key = watcher.subscription.entity_key();
        self.index.write().insert(key, Watcher::Copy(Arc::new(watcher)));
        self.bump();
        Ok(())
    }

    /// Drop a copy config from the index. Returns false if it was not there.
    pub fn deactivate_copy(&self, config_id: Uuid) -> bool {
        let removed = self.index.write().remove(config_id);
        if removed {
            self.bump();
        }
        removed
    }

    pub fn upsert_order(&self, order: LimitOrder) -> Result<(), RegistryError> {
        if order.status != OrderStatus::Open {
            return Err(RegistryError::NotOpen {
                id: order.id,
                status: order.status,
            });
        }
        let key = order.entity_key();
        self.index.write().insert(key, Watcher::Limit(Arc::new(order)));
        self.bump();
        Ok(())
    }

    /// Remove an order once it triggered, was cancelled or expired.
    pub fn retire_order(&self, order_id: Uuid) -> bool {
        let removed = self.index.write().remove(order_id);
        if removed {
            self.bump();
        }
        removed
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.index.read().locations.contains_key(&id)
    }

    /// Every entity key that currently has at least one watcher.
    pub fn watched_keys(&self) -> Vec<EntityKey> {
        self.index.read().by_entity.keys().cloned().collect()
    }

    pub fn entity_count(&self) -> usize {
        self.index.read().by_entity.len()
    }

    /// Ticks whenever the set of watchers changes.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
        metrics::gauge!("registry_entities").set(self.entity_count() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CopyTradeConfig, Side, SizingRule, WalletSubscription};
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    fn copy_watcher(owner: UserId, wallet: &str) -> CopyWatcher {
        let subscription = WalletSubscription::new(owner, wallet, "solana");
        let config = CopyTradeConfig {
            id: Uuid::new_v4(),
            subscription_id: subscription.id,
            name: None,
            sizing_rule: SizingRule::Fixed { amount: Decimal::ONE },
            max_slippage_bps: 100,
            per_trade_capital_limit: Decimal::TEN,
            cooldown_seconds: 0,
            min_amount: None,
            total_amount: None,
            max_copies_per_token: None,
            copy_sells: true,
            excluded_tokens: vec![],
            active: true,
            updated_at: Utc::now(),
        };
        CopyWatcher {
            subscription,
            config,
        }
    }

    fn order(instrument: &str) -> LimitOrder {
        LimitOrder {
            id: Uuid::new_v4(),
            owner_user_id: 9,
            chain_id: "solana".into(),
            instrument: instrument.into(),
            side: Side::Sell,
            trigger_price: Decimal::from(100),
            amount: Decimal::ONE,
            max_slippage_bps: 100,
            expiry: Utc::now() + Duration::hours(1),
            status: OrderStatus::Open,
            created_at: Utc::now(),
            closed_at: None,
            external_tx_ref: None,
        }
    }

    #[test]
    fn test_lookup_unknown_key_is_empty() {
        let reg = SubscriptionRegistry::new();
        assert!(reg.lookup(&EntityKey::wallet("solana", "nobody")).is_empty());
    }

    #[test]
    fn test_many_owners_can_watch_one_wallet() {
        let reg = SubscriptionRegistry::new();
        reg.upsert_copy(copy_watcher(1, "leader")).unwrap();
        reg.upsert_copy(copy_watcher(2, "leader")).unwrap();
        reg.upsert_copy(copy_watcher(2, "other")).unwrap();

        assert_eq!(reg.lookup(&EntityKey::wallet("solana", "leader")).len(), 2);
        assert_eq!(reg.entity_count(), 2);
    }

    #[test]
    fn test_upsert_replaces_existing_watcher() {
        let reg = SubscriptionRegistry::new();
        let mut w = copy_watcher(1, "leader");
        reg.upsert_copy(w.clone()).unwrap();
        w.config.cooldown_seconds = 60;
        reg.upsert_copy(w.clone()).unwrap();

        let found = reg.lookup(&w.subscription.entity_key());
        assert_eq!(found.len(), 1);
        match &found[0] {
            Watcher::Copy(c) => assert_eq!(c.config.cooldown_seconds, 60),
            other => panic!("unexpected watcher {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_survives_concurrent_removal() {
        let reg = SubscriptionRegistry::new();
        let w = copy_watcher(1, "leader");
        let key = w.subscription.entity_key();
        reg.upsert_copy(w.clone()).unwrap();

        let snapshot = reg.lookup(&key);
        assert!(reg.deactivate_copy(w.config.id));
        assert_eq!(snapshot.len(), 1);
        assert!(reg.lookup(&key).is_empty());
        assert!(!reg.deactivate_copy(w.config.id));
    }

    #[test]
    fn test_inactive_watchers_are_rejected() {
        let reg = SubscriptionRegistry::new();
        let mut w = copy_watcher(1, "leader");
        w.config.active = false;
        assert!(matches!(reg.upsert_copy(w), Err(RegistryError::Inactive(_))));

        let mut o = order("BONK");
        o.status = OrderStatus::Filled;
        assert!(matches!(reg.upsert_order(o), Err(RegistryError::NotOpen { .. })));
    }

    #[test]
    fn test_retire_order_and_change_notifications() {
        let reg = SubscriptionRegistry::new();
        let rx = reg.changes();
        let o = order("BONK");
        reg.upsert_order(o.clone()).unwrap();
        assert!(reg.contains(o.id));
        assert!(reg.retire_order(o.id));
        assert!(!reg.contains(o.id));
        assert_eq!(*rx.borrow(), 2);
        assert!(reg.watched_keys().is_empty());
    }

    #[tokio::test]
    async fn test_owner_lock_serializes_same_owner() {
        let reg = Arc::new(SubscriptionRegistry::new());
        let guard = reg.lock_owner(1).await;

        let other_owner = tokio::time::timeout(std::time::Duration::from_millis(50), reg.lock_owner(2)).await;
        assert!(other_owner.is_ok(), "different owners must not block each other");

        let same_owner = tokio::time::timeout(std::time::Duration::from_millis(50), reg.lock_owner(1)).await;
        assert!(same_owner.is_err(), "same owner must wait");
        drop(guard);
    }

    #[tokio::test]
    async fn test_owner_lock_entries_are_dropped_when_released() {
        let reg = Arc::new(SubscriptionRegistry::new());
        for owner in 0..100 {
            let _guard = reg.lock_owner(owner).await;
        }
        assert_eq!(reg.owner_lock_count(), 0);

        let first = reg.lock_owner(7).await;
        let waiter = {
            let reg = reg.clone();
            tokio::spawn(async move {
                let _guard = reg.lock_owner(7).await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(first);
        assert_eq!(reg.owner_lock_count(), 1, "entry stays while another writer waits");

        waiter.await.unwrap();
        assert_eq!(reg.owner_lock_count(), 0);
    }
}
