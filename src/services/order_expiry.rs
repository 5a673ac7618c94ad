use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::{interval, Duration};

use super::subscriptions::SubscriptionService;

/// Expire every Open order whose expiry is at or before `now`.
pub async fn sweep_once(service: &SubscriptionService, now: DateTime<Utc>) -> anyhow::Result<usize> {
    let due = service.store().due_limit_orders(now).await?;
    let mut expired = 0;

    for order in &due {
        match service.expire_limit_order(order.id).await {
            Ok(true) => expired += 1,
            // Triggered or cancelled in the meantime.
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(order_id = %order.id, error = %e, "Expiry sweep: failed to expire order");
            }
        }
    }

    if expired > 0 {
        tracing::info!(expired, "Expiry sweep: limit orders expired");
    }
    Ok(expired)
}

pub async fn run_order_expiry(service: Arc<SubscriptionService>, interval_secs: u64) {
    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
    tracing::info!(interval_secs, "Limit order expiry sweeper started");

    loop {
        ticker.tick().await;
        if let Err(e) = sweep_once(&service, Utc::now()).await {
            tracing::error!(error = %e, "Expiry sweep failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, StateStore};
    use crate::execution::IdempotencyGuard;
    use crate::models::{LimitOrder, OrderStatus, Side};
    use crate::registry::SubscriptionRegistry;
    use crate::services::notifier::{ChannelSink, Notification};
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn order(expiry: DateTime<Utc>) -> LimitOrder {
        LimitOrder {
            id: Uuid::new_v4(),
            owner_user_id: 3,
            chain_id: "solana".into(),
            instrument: "JUP".into(),
            side: Side::Buy,
            trigger_price: dec!(0.8),
            amount: dec!(2),
            max_slippage_bps: 100,
            expiry,
            status: OrderStatus::Open,
            created_at: Utc::now(),
            closed_at: None,
            external_tx_ref: None,
        }
    }

    #[tokio::test]
    async fn test_sweep_expires_due_orders_only() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(SubscriptionRegistry::new());
        let guard = Arc::new(IdempotencyGuard::new(100, ChronoDuration::minutes(10)));
        let (sink, mut rx) = ChannelSink::new();
        let service = SubscriptionService::new(store.clone(), registry.clone(), guard.clone(), Arc::new(sink));

        let now = Utc::now();
        let due = order(now - ChronoDuration::seconds(1));
        let at_boundary = order(now);
        let later = order(now + ChronoDuration::hours(1));
        for o in [&due, &at_boundary, &later] {
            store.insert_limit_order(o).await.unwrap();
            registry.upsert_order(o.clone()).unwrap();
        }

        assert_eq!(sweep_once(&service, now).await.unwrap(), 2);
        assert_eq!(sweep_once(&service, now).await.unwrap(), 0);

        let stored = store.get_limit_order(due.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Expired);
        assert!(stored.closed_at.is_some());
        assert!(guard.is_revoked(at_boundary.id));
        assert!(registry.contains(later.id));
        assert!(!registry.contains(due.id));

        let mut closed = 0;
        while let Ok(n) = rx.try_recv() {
            assert!(matches!(n, Notification::OrderClosed { status: OrderStatus::Expired, .. }));
            closed += 1;
        }
        assert_eq!(closed, 2);
    }
}
