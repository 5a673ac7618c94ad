use rust_decimal::Decimal;

use crate::models::{CopyTradeConfig, SizingRule, SwapDetails};

/// Outcome of sizing a copied trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeOutcome {
    Amount(Decimal),
    /// Sizing produced nothing to trade (zero leader amount or zero rule).
    Zero,
    /// Below the config's minimum; never rounded up.
    BelowMinimum { amount: Decimal, min: Decimal },
    /// The leader's amount is too large to scale.
    Overflow,
}

/// Apply the config's sizing rule to the leader's swap and clamp to the
/// per-trade capital limit.
pub fn size_copy(config: &CopyTradeConfig, swap: &SwapDetails) -> SizeOutcome {
    let Some(raw) = raw_size(config.sizing_rule, swap.quote_amount) else {
        return SizeOutcome::Overflow;
    };
    let clamped = raw.max(Decimal::ZERO).min(config.per_trade_capital_limit);

    if clamped.is_zero() {
        return SizeOutcome::Zero;
    }

    match config.min_amount {
        Some(min) if clamped < min => SizeOutcome::BelowMinimum {
            amount: clamped,
            min,
        },
        _ => SizeOutcome::Amount(clamped),
    }
}

fn raw_size(rule: SizingRule, leader_quote_amount: Decimal) -> Option<Decimal> {
    match rule {
        SizingRule::Fixed { amount } => Some(amount),
        SizingRule::Proportional { percent } => {
            let fraction = percent.checked_div(Decimal::ONE_HUNDRED)?;
            leader_quote_amount.checked_mul(fraction)
        }
    }
}
