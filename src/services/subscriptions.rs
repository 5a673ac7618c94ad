use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::notifier::{Notification, NotificationSink};
use crate::db::StateStore;
use crate::execution::IdempotencyGuard;
use crate::models::subscription::ConfigValidationError;
use crate::models::{
    CopyTradeConfig, CopyWatcher, LimitOrder, OrderStatus, Side, SizingRule, UserId,
    WalletSubscription,
};
use crate::registry::{RegistryError, SubscriptionRegistry};

pub const DEFAULT_SLIPPAGE_BPS: u32 = 100;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Validation(#[from] ConfigValidationError),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

fn default_slippage() -> u32 {
    DEFAULT_SLIPPAGE_BPS
}

fn default_true() -> bool {
    true
}

/// Copy settings as submitted by the owner.
#[derive(Debug, Clone, Deserialize)]
pub struct CopyConfigInput {
    #[serde(default)]
    pub name: Option<String>,
    pub sizing_rule: SizingRule,
    #[serde(default = "default_slippage")]
    pub max_slippage_bps: u32,
    pub per_trade_capital_limit: Decimal,
    #[serde(default)]
    pub cooldown_seconds: u32,
    #[serde(default)]
    pub min_amount: Option<Decimal>,
    #[serde(default)]
    pub total_amount: Option<Decimal>,
    #[serde(default)]
    pub max_copies_per_token: Option<u32>,
    #[serde(default = "default_true")]
    pub copy_sells: bool,
    #[serde(default)]
    pub excluded_tokens: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl CopyConfigInput {
    fn into_config(self, subscription_id: Uuid) -> CopyTradeConfig {
        CopyTradeConfig {
            id: Uuid::new_v4(),
            subscription_id,
            name: self.name,
            sizing_rule: self.sizing_rule,
            max_slippage_bps: self.max_slippage_bps,
            per_trade_capital_limit: self.per_trade_capital_limit,
            cooldown_seconds: self.cooldown_seconds,
            min_amount: self.min_amount,
            total_amount: self.total_amount,
            max_copies_per_token: self.max_copies_per_token,
            copy_sells: self.copy_sells,
            excluded_tokens: self
                .excluded_tokens
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            active: self.active,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewLimitOrder {
    pub owner_user_id: UserId,
    pub chain_id: String,
    pub instrument: String,
    pub side: Side,
    pub trigger_price: Decimal,
    pub amount: Decimal,
    #[serde(default = "default_slippage")]
    pub max_slippage_bps: u32,
    pub expiry: DateTime<Utc>,
}

impl NewLimitOrder {
    fn into_order(self, now: DateTime<Utc>) -> Result<LimitOrder, ServiceError> {
        if self.instrument.trim().is_empty() {
            return Err(ServiceError::Invalid("instrument is required".into()));
        }
        if self.trigger_price <= Decimal::ZERO {
            return Err(ServiceError::Invalid("trigger_price must be positive".into()));
        }
        if self.amount <= Decimal::ZERO {
            return Err(ServiceError::Invalid("amount must be positive".into()));
        }
        if self.max_slippage_bps > 10_000 {
            return Err(ServiceError::Invalid("max_slippage_bps must be within 0..=10000".into()));
        }
        if self.expiry <= now {
            return Err(ServiceError::Invalid("expiry must be in the future".into()));
        }

        Ok(LimitOrder {
            id: Uuid::new_v4(),
            owner_user_id: self.owner_user_id,
            chain_id: self.chain_id.trim().to_string(),
            instrument: self.instrument.trim().to_string(),
            side: self.side,
            trigger_price: self.trigger_price,
            amount: self.amount,
            max_slippage_bps: self.max_slippage_bps,
            expiry: self.expiry,
            status: OrderStatus::Open,
            created_at: now,
            closed_at: None,
            external_tx_ref: None,
        })
    }
}

/// The write path for subscriptions, copy configs and limit orders.
///
/// Writes for one owner are serialized. The store is written first; the
/// registry and the idempotency guard follow only once the store accepted
/// the change.
pub struct SubscriptionService {
    store: Arc<dyn StateStore>,
    registry: Arc<SubscriptionRegistry>,
    guard: Arc<IdempotencyGuard>,
    notifier: Arc<dyn NotificationSink>,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<SubscriptionRegistry>,
        guard: Arc<IdempotencyGuard>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            registry,
            guard,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Load live copy configs and open orders into the registry.
    pub async fn bootstrap(&self) -> anyhow::Result<(usize, usize)> {
        let watchers = self.store.load_active_copy_watchers().await?;
        let orders = self.store.load_open_limit_orders().await?;
        let (mut copies, mut opens) = (0, 0);

        for watcher in watchers {
            match self.registry.upsert_copy(watcher) {
                Ok(()) => copies += 1,
                Err(e) => tracing::warn!(error = %e, "Skipping copy config at bootstrap"),
            }
        }
        for order in orders {
            match self.registry.upsert_order(order) {
                Ok(()) => opens += 1,
                Err(e) => tracing::warn!(error = %e, "Skipping limit order at bootstrap"),
            }
        }

        tracing::info!(copy_configs = copies, limit_orders = opens, "Registry loaded");
        Ok((copies, opens))
    }

    pub async fn subscribe(
        &self,
        owner_user_id: UserId,
        watched_address: &str,
        chain_id: &str,
        config: Option<CopyConfigInput>,
    ) -> Result<(WalletSubscription, Option<CopyTradeConfig>), ServiceError> {
        if watched_address.trim().is_empty() || chain_id.trim().is_empty() {
            return Err(ServiceError::Invalid("watched_address and chain_id are required".into()));
        }
        let sub = WalletSubscription::new(owner_user_id, watched_address, chain_id);
        let config = config.map(|c| c.into_config(sub.id));
        if let Some(c) = &config {
            c.validate()?;
        }

        let _owner = self.registry.lock_owner(owner_user_id).await;
        self.store.insert_subscription(&sub).await?;

        let stored = match config {
            Some(c) => Some(self.apply_config(&sub, c).await?),
            None => None,
        };

        tracing::info!(
            subscription_id = %sub.id,
            owner = owner_user_id,
            wallet = %sub.watched_address,
            chain = %sub.chain_id,
            "Wallet subscription created"
        );
        Ok((sub, stored))
    }

    /// Deactivate a subscription and the config that hangs off it.
    pub async fn unsubscribe(&self, subscription_id: Uuid) -> Result<bool, ServiceError> {
        let sub = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("subscription {subscription_id}")))?;

        let _owner = self.registry.lock_owner(sub.owner_user_id).await;
        let config = self.store.get_copy_config_for_subscription(subscription_id).await?;
        let changed = self.store.deactivate_subscription(subscription_id).await?;

        if let Some(c) = config {
            self.guard.revoke(c.id);
            self.registry.deactivate_copy(c.id);
        }

        if changed {
            tracing::info!(subscription_id = %subscription_id, owner = sub.owner_user_id, "Wallet subscription deactivated");
        }
        Ok(changed)
    }

    pub async fn upsert_config(
        &self,
        subscription_id: Uuid,
        input: CopyConfigInput,
    ) -> Result<CopyTradeConfig, ServiceError> {
        let sub = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("subscription {subscription_id}")))?;
        if !sub.active {
            return Err(ServiceError::Conflict(format!("subscription {subscription_id} is inactive")));
        }

        let config = input.into_config(subscription_id);
        config.validate()?;

        let _owner = self.registry.lock_owner(sub.owner_user_id).await;
        self.apply_config(&sub, config).await
    }

    /// Caller holds the owner lock.
    async fn apply_config(
        &self,
        sub: &WalletSubscription,
        config: CopyTradeConfig,
    ) -> Result<CopyTradeConfig, ServiceError> {
        let stored = self.store.upsert_copy_config(&config).await?;

        if stored.active {
            if self.guard.reinstate(stored.id) {
                tracing::info!(config_id = %stored.id, "Copy config reactivated");
            }
            self.registry.upsert_copy(CopyWatcher {
                subscription: sub.clone(),
                config: stored.clone(),
            })?;
        } else {
            self.guard.revoke(stored.id);
            self.registry.deactivate_copy(stored.id);
        }

        tracing::info!(
            config_id = %stored.id,
            subscription_id = %sub.id,
            sizing = stored.sizing_rule.kind(),
            active = stored.active,
            "Copy config saved"
        );
        Ok(stored)
    }

    pub async fn list_subscriptions(&self, owner: UserId) -> Result<Vec<(WalletSubscription, Option<CopyTradeConfig>)>, ServiceError> {
        let subs = self.store.list_subscriptions(owner).await?;
        let mut out = Vec::with_capacity(subs.len());
        for sub in subs {
            let config = self.store.get_copy_config_for_subscription(sub.id).await?;
            out.push((sub, config));
        }
        Ok(out)
    }

    pub async fn place_limit_order(&self, input: NewLimitOrder) -> Result<LimitOrder, ServiceError> {
        let order = input.into_order(Utc::now())?;

        let _owner = self.registry.lock_owner(order.owner_user_id).await;
        self.store.insert_limit_order(&order).await?;
        self.registry.upsert_order(order.clone())?;

        tracing::info!(
            order_id = %order.id,
            owner = order.owner_user_id,
            instrument = %order.instrument,
            side = %order.side,
            trigger_price = %order.trigger_price,
            amount = %order.amount,
            "Limit order placed"
        );
        Ok(order)
    }

    pub async fn cancel_limit_order(&self, order_id: Uuid) -> Result<LimitOrder, ServiceError> {
        self.close_limit_order(order_id, OrderStatus::Cancelled).await
    }

    /// Expire an Open order. Returns false when it was no longer Open.
    pub async fn expire_limit_order(&self, order_id: Uuid) -> Result<bool, ServiceError> {
        match self.close_limit_order(order_id, OrderStatus::Expired).await {
            Ok(_) => Ok(true),
            Err(ServiceError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn close_limit_order(&self, order_id: Uuid, to: OrderStatus) -> Result<LimitOrder, ServiceError> {
        let order = self
            .store
            .get_limit_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("limit order {order_id}")))?;

        let _owner = self.registry.lock_owner(order.owner_user_id).await;
        let moved = self
            .store
            .transition_limit_order(order_id, OrderStatus::Open, to, None)
            .await?;
        if !moved {
            let current = self
                .store
                .get_limit_order(order_id)
                .await?
                .map(|o| o.status)
                .unwrap_or(order.status);
            return Err(ServiceError::Conflict(format!("limit order {order_id} is {current}")));
        }

        self.guard.revoke(order_id);
        self.registry.retire_order(order_id);

        tracing::info!(order_id = %order_id, owner = order.owner_user_id, status = %to, "Limit order closed");
        self.notifier
            .notify(Notification::OrderClosed {
                order_id,
                owner_user_id: order.owner_user_id,
                instrument: order.instrument.clone(),
                status: to,
            })
            .await;

        Ok(self
            .store
            .get_limit_order(order_id)
            .await?
            .unwrap_or(LimitOrder { status: to, ..order }))
    }
}
