use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use super::sizing::{size_copy, SizeOutcome};
use crate::models::{
    CopyWatcher, EventPayload, ExecutionIntent, IntentTarget, LimitOrder, OrderStatus, Side,
    TradeEvent, TradeSpec,
};
use crate::registry::Watcher;

pub const DEFAULT_STALENESS_SECS: i64 = 30;
pub const DEFAULT_INTENT_TTL_SECS: i64 = 120;

#[derive(Debug, Clone, Copy)]
pub struct EvaluatorSettings {
    /// Wallet activity older than this is never copied.
    pub staleness: Duration,
    /// How long an intent may wait before its first submission.
    pub intent_ttl: Duration,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self {
            staleness: Duration::seconds(DEFAULT_STALENESS_SECS),
            intent_ttl: Duration::seconds(DEFAULT_INTENT_TTL_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Inactive,
    Stale,
    Cooldown,
    NotASwap,
    ExcludedToken,
    SellsDisabled,
    BelowMinimum,
    ZeroAmount,
    AmountOverflow,
    PriceNotCrossed,
    OrderNotOpen,
    OrderExpired,
    InstrumentMismatch,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Inactive => "inactive",
            SkipReason::Stale => "stale",
            SkipReason::Cooldown => "cooldown",
            SkipReason::NotASwap => "not_a_swap",
            SkipReason::ExcludedToken => "excluded_token",
            SkipReason::SellsDisabled => "sells_disabled",
            SkipReason::BelowMinimum => "below_minimum",
            SkipReason::ZeroAmount => "zero_amount",
            SkipReason::AmountOverflow => "amount_overflow",
            SkipReason::PriceNotCrossed => "price_not_crossed",
            SkipReason::OrderNotOpen => "order_not_open",
            SkipReason::OrderExpired => "order_expired",
            SkipReason::InstrumentMismatch => "instrument_mismatch",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Fire(ExecutionIntent),
    Skip { target: IntentTarget, reason: SkipReason },
}

/// Matches one event against the watchers of its entity.
///
/// Evaluation is pure apart from the cooldown clock, which only moves when
/// the caller reports an intent as accepted via `record_accepted`. One
/// evaluator lives on each pipeline worker; since every event for a wallet
/// lands on the same worker, so does every cooldown for configs watching it.
#[derive(Debug, Default)]
pub struct TriggerEvaluator {
    settings: EvaluatorSettings,
    last_accepted: HashMap<Uuid, DateTime<Utc>>,
}

impl TriggerEvaluator {
    pub fn new(settings: EvaluatorSettings) -> Self {
        Self {
            settings,
            last_accepted: HashMap::new(),
        }
    }

    pub fn evaluate(&self, event: &TradeEvent, watchers: &[Watcher], now: DateTime<Utc>) -> Vec<Decision> {
        watchers
            .iter()
            .map(|w| match w {
                Watcher::Copy(c) => self.evaluate_copy(event, c, now),
                Watcher::Limit(o) => self.evaluate_limit(event, o, now),
            })
            .collect()
    }

    /// Start the cooldown of a copy config at the accepted event's time.
    pub fn record_accepted(&mut self, target: IntentTarget, observed_at: DateTime<Utc>) {
        if let IntentTarget::CopyConfig(id) = target {
            let entry = self.last_accepted.entry(id).or_insert(observed_at);
            *entry = (*entry).max(observed_at);
        }
    }

    fn in_cooldown(&self, watcher: &CopyWatcher, observed_at: DateTime<Utc>) -> bool {
        let cooldown = Duration::seconds(i64::from(watcher.config.cooldown_seconds));
        match self.last_accepted.get(&watcher.config.id) {
            Some(last) => observed_at - *last < cooldown,
            None => false,
        }
    }

    fn evaluate_copy(&self, event: &TradeEvent, watcher: &CopyWatcher, now: DateTime<Utc>) -> Decision {
        let target = IntentTarget::CopyConfig(watcher.config.id);
        let skip = |reason| Decision::Skip { target, reason };

        if !watcher.is_live() {
            return skip(SkipReason::Inactive);
        }

        let EventPayload::Swap(swap) = &event.payload else {
            return skip(SkipReason::NotASwap);
        };
        if swap.wallet.trim() != watcher.subscription.watched_address
            || swap.chain_id.trim() != watcher.subscription.chain_id
        {
            return skip(SkipReason::NotASwap);
        }

        if event.age_at(now) > self.settings.staleness {
            return skip(SkipReason::Stale);
        }

        let config = &watcher.config;
        if swap.side == Side::Sell && !config.copy_sells {
            return skip(SkipReason::SellsDisabled);
        }
        if config.excludes(&swap.token) {
            return skip(SkipReason::ExcludedToken);
        }
        if self.in_cooldown(watcher, event.observed_at) {
            return skip(SkipReason::Cooldown);
        }

        let amount = match size_copy(config, swap) {
            SizeOutcome::Amount(a) => a,
            SizeOutcome::Zero => return skip(SkipReason::ZeroAmount),
            SizeOutcome::BelowMinimum { .. } => return skip(SkipReason::BelowMinimum),
            SizeOutcome::Overflow => return skip(SkipReason::AmountOverflow),
        };

        Decision::Fire(ExecutionIntent::new(
            event.id(),
            target,
            watcher.subscription.owner_user_id,
            TradeSpec {
                chain_id: swap.chain_id.clone(),
                instrument: swap.token.clone(),
                side: swap.side,
                max_slippage_bps: config.max_slippage_bps,
            },
            amount,
            now + self.settings.intent_ttl,
        ))
    }

    fn evaluate_limit(&self, event: &TradeEvent, order: &LimitOrder, now: DateTime<Utc>) -> Decision {
        let target = IntentTarget::LimitOrder(order.id);
        let skip = |reason| Decision::Skip { target, reason };

        if order.status != OrderStatus::Open {
            return skip(SkipReason::OrderNotOpen);
        }

        let EventPayload::PriceTick(tick) = &event.payload else {
            return skip(SkipReason::InstrumentMismatch);
        };
        if tick.instrument.trim() != order.instrument || tick.chain_id.trim() != order.chain_id {
            return skip(SkipReason::InstrumentMismatch);
        }

        if order.is_expired_at(now) {
            return skip(SkipReason::OrderExpired);
        }
        if !order.crosses(tick.price) {
            return skip(SkipReason::PriceNotCrossed);
        }
        if order.amount.is_zero() {
            return skip(SkipReason::ZeroAmount);
        }

        Decision::Fire(ExecutionIntent::new(
            event.id(),
            target,
            order.owner_user_id,
            TradeSpec {
                chain_id: order.chain_id.clone(),
                instrument: order.instrument.clone(),
                side: order.side,
                max_slippage_bps: order.max_slippage_bps,
            },
            order.amount,
            now + self.settings.intent_ttl,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CopyTradeConfig, PriceTick, SizingRule, SwapDetails, WalletSubscription};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn copy(cooldown: u32) -> Watcher {
        let subscription = WalletSubscription::new(1, "leader", "solana");
        Watcher::Copy(Arc::new(CopyWatcher {
            config: CopyTradeConfig {
                id: Uuid::new_v4(),
                subscription_id: subscription.id,
                name: None,
                sizing_rule: SizingRule::Proportional { percent: dec!(50) },
                max_slippage_bps: 300,
                per_trade_capital_limit: dec!(5),
                cooldown_seconds: cooldown,
                min_amount: None,
                total_amount: None,
                max_copies_per_token: None,
                copy_sells: true,
                excluded_tokens: vec![],
                active: true,
                updated_at: Utc::now(),
            },
            subscription,
        }))
    }

    fn limit(side: Side, trigger: Decimal) -> Watcher {
        Watcher::Limit(Arc::new(LimitOrder {
            id: Uuid::new_v4(),
            owner_user_id: 2,
            chain_id: "solana".into(),
            instrument: "BONK".into(),
            side,
            trigger_price: trigger,
            amount: dec!(1.5),
            max_slippage_bps: 100,
            expiry: Utc::now() + Duration::hours(1),
            status: OrderStatus::Open,
            created_at: Utc::now(),
            closed_at: None,
            external_tx_ref: None,
        }))
    }

    fn swap(seq: u64, observed_at: DateTime<Utc>, side: Side, token: &str) -> TradeEvent {
        TradeEvent {
            source_id: "wallets".into(),
            sequence: seq,
            observed_at,
            payload: EventPayload::Swap(SwapDetails {
                chain_id: "solana".into(),
                wallet: "leader".into(),
                tx_hash: format!("sig{seq}"),
                token: token.into(),
                side,
                token_amount: dec!(1000),
                quote_amount: dec!(4),
            }),
        }
    }

    fn tick(seq: u64, price: Decimal) -> TradeEvent {
        TradeEvent {
            source_id: "prices".into(),
            sequence: seq,
            observed_at: Utc::now(),
            payload: EventPayload::PriceTick(PriceTick {
                chain_id: "solana".into(),
                instrument: "BONK".into(),
                price,
            }),
        }
    }

    fn fires(decisions: &[Decision]) -> bool {
        matches!(decisions, [Decision::Fire(_)])
    }

    fn skipped(decisions: &[Decision]) -> Option<SkipReason> {
        match decisions {
            [Decision::Skip { reason, .. }] => Some(*reason),
            _ => None,
        }
    }

    #[test]
    fn test_copy_fires_with_sized_amount() {
        let ev = TriggerEvaluator::default();
        let now = Utc::now();
        let out = ev.evaluate(&swap(1, now, Side::Buy, "BONK"), &[copy(0)], now);
        match &out[..] {
            [Decision::Fire(intent)] => {
                assert_eq!(intent.computed_amount, dec!(2));
                assert_eq!(intent.trade.instrument, "BONK");
                assert_eq!(intent.trade.max_slippage_bps, 300);
                assert_eq!(intent.deadline, now + Duration::seconds(DEFAULT_INTENT_TTL_SECS));
            }
            other => panic!("expected one intent, got {other:?}"),
        }
    }

    #[test]
    fn test_stale_swap_is_skipped() {
        let ev = TriggerEvaluator::default();
        let now = Utc::now();
        let old = swap(1, now - Duration::seconds(31), Side::Buy, "BONK");
        assert_eq!(skipped(&ev.evaluate(&old, &[copy(0)], now)), Some(SkipReason::Stale));

        let fresh = swap(2, now - Duration::seconds(30), Side::Buy, "BONK");
        assert!(fires(&ev.evaluate(&fresh, &[copy(0)], now)));
    }

    #[test]
    fn test_cooldown_blocks_second_event_30s_later() {
        let mut ev = TriggerEvaluator::default();
        let w = copy(60);
        let t0 = Utc::now();

        let first = ev.evaluate(&swap(1, t0, Side::Buy, "BONK"), &[w.clone()], t0);
        let Decision::Fire(intent) = &first[0] else {
            panic!("first event must fire");
        };
        ev.record_accepted(intent.target, t0);

        let t1 = t0 + Duration::seconds(30);
        let second = ev.evaluate(&swap(2, t1, Side::Buy, "BONK"), &[w.clone()], t1);
        assert_eq!(skipped(&second), Some(SkipReason::Cooldown));

        let t2 = t0 + Duration::seconds(60);
        assert!(fires(&ev.evaluate(&swap(3, t2, Side::Buy, "BONK"), &[w], t2)));
    }

    #[test]
    fn test_sells_and_excluded_tokens() {
        let ev = TriggerEvaluator::default();
        let now = Utc::now();
        let Watcher::Copy(base) = copy(0) else { unreachable!() };

        let mut no_sells = (*base).clone();
        no_sells.config.copy_sells = false;
        let out = ev.evaluate(&swap(1, now, Side::Sell, "BONK"), &[Watcher::Copy(Arc::new(no_sells))], now);
        assert_eq!(skipped(&out), Some(SkipReason::SellsDisabled));

        let mut excluding = (*base).clone();
        excluding.config.excluded_tokens = vec!["SCAM".into()];
        let w = Watcher::Copy(Arc::new(excluding));
        assert_eq!(
            skipped(&ev.evaluate(&swap(2, now, Side::Buy, "SCAM"), &[w.clone()], now)),
            Some(SkipReason::ExcludedToken)
        );
        assert!(fires(&ev.evaluate(&swap(3, now, Side::Buy, "BONK"), &[w], now)));
    }

    #[test]
    fn test_below_minimum_skips() {
        let ev = TriggerEvaluator::default();
        let now = Utc::now();
        let Watcher::Copy(base) = copy(0) else { unreachable!() };
        let mut w = (*base).clone();
        w.config.min_amount = Some(dec!(3));
        let out = ev.evaluate(&swap(1, now, Side::Buy, "BONK"), &[Watcher::Copy(Arc::new(w))], now);
        assert_eq!(skipped(&out), Some(SkipReason::BelowMinimum));
    }

    #[test]
    fn test_unscalable_leader_amount_skips_without_panic() {
        let ev = TriggerEvaluator::default();
        let now = Utc::now();
        let Watcher::Copy(base) = copy(0) else { unreachable!() };
        let mut w = (*base).clone();
        w.config.sizing_rule = SizingRule::Proportional { percent: dec!(1000) };

        let mut event = swap(1, now, Side::Buy, "BONK");
        if let EventPayload::Swap(details) = &mut event.payload {
            details.quote_amount = Decimal::MAX;
        }
        let out = ev.evaluate(&event, &[Watcher::Copy(Arc::new(w))], now);
        assert_eq!(skipped(&out), Some(SkipReason::AmountOverflow));
    }

    #[test]
    fn test_sell_limit_boundary() {
        let ev = TriggerEvaluator::default();
        let now = Utc::now();
        let sell = limit(Side::Sell, dec!(100));

        assert!(fires(&ev.evaluate(&tick(1, dec!(100.0)), &[sell.clone()], now)));
        assert!(fires(&ev.evaluate(&tick(2, dec!(100.1)), &[sell.clone()], now)));
        assert_eq!(
            skipped(&ev.evaluate(&tick(3, dec!(99.9)), &[sell], now)),
            Some(SkipReason::PriceNotCrossed)
        );
    }

    #[test]
    fn test_buy_limit_boundary() {
        let ev = TriggerEvaluator::default();
        let now = Utc::now();
        let buy = limit(Side::Buy, dec!(100));

        assert!(fires(&ev.evaluate(&tick(1, dec!(100.0)), &[buy.clone()], now)));
        assert!(fires(&ev.evaluate(&tick(2, dec!(99.9)), &[buy.clone()], now)));
        assert_eq!(
            skipped(&ev.evaluate(&tick(3, dec!(100.1)), &[buy], now)),
            Some(SkipReason::PriceNotCrossed)
        );
    }

    #[test]
    fn test_limit_amount_passes_through() {
        let ev = TriggerEvaluator::default();
        let out = ev.evaluate(&tick(1, dec!(50)), &[limit(Side::Buy, dec!(100))], Utc::now());
        let [Decision::Fire(intent)] = &out[..] else {
            panic!("expected fire");
        };
        assert_eq!(intent.computed_amount, dec!(1.5));
        assert!(matches!(intent.target, IntentTarget::LimitOrder(_)));
    }

    #[test]
    fn test_expired_order_does_not_fire() {
        let ev = TriggerEvaluator::default();
        let o = limit(Side::Buy, dec!(100));
        let later = Utc::now() + Duration::hours(2);
        assert_eq!(
            skipped(&ev.evaluate(&tick(1, dec!(50)), &[o], later)),
            Some(SkipReason::OrderExpired)
        );
    }

    #[test]
    fn test_each_matching_watcher_evaluated_independently() {
        let ev = TriggerEvaluator::default();
        let now = Utc::now();
        let out = ev.evaluate(&swap(1, now, Side::Buy, "BONK"), &[copy(0), copy(0)], now);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|d| matches!(d, Decision::Fire(_))));
    }
}
