// Sizing Rules (§4.4): translates one leader trade into a follower
// `intendedSize`, in USD for BUY/MERGE and tokens for SELL.
use crate::config::{Config, SizingMode};
use crate::model::Side;
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeClass {
    Buy,
    Sell,
    Merge,
}

pub struct SizingInput {
    pub class: TradeClass,
    pub leader_usdc_size: Decimal,
    pub leader_trade_tokens: Decimal,
    pub leader_position_after: Decimal,
    pub follower_balance: Decimal,
    pub follower_position_value_usd: Decimal,
    pub follower_position_tokens: Decimal,
    pub follower_equity_usd: Decimal,
    pub tracked_bought_tokens: Decimal,
}

fn base_amount(cfg: &Config, leader_usdc_size: Decimal) -> Decimal {
    match cfg.strategy.mode {
        SizingMode::Percentage => leader_usdc_size * cfg.strategy.copy_percent,
        SizingMode::Fixed => cfg.strategy.fixed_amount_usd,
        SizingMode::Adaptive => leader_usdc_size * adaptive_fraction(leader_usdc_size),
    }
}

/// Piecewise-linear schedule: small leader trades are copied near 1:1 by
/// percent, large ones are scaled down so a single outsized leader bet
/// doesn't dominate the follower's book.
fn adaptive_fraction(leader_usdc_size: Decimal) -> Decimal {
    let hundred = Decimal::from(100);
    let thousand = Decimal::from(1_000);
    if leader_usdc_size <= hundred {
        Decimal::new(20, 2) // 0.20
    } else if leader_usdc_size <= thousand {
        // linear taper from 0.20 at $100 down to 0.05 at $1000
        let span = thousand - hundred;
        let frac = (leader_usdc_size - hundred) / span;
        Decimal::new(20, 2) - frac * Decimal::new(15, 2)
    } else {
        Decimal::new(5, 2) // 0.05 floor for very large trades
    }
}

fn tiered_multiplier(cfg: &Config, leader_usdc_size: Decimal) -> Decimal {
    if cfg.strategy.tiers.is_empty() {
        return Decimal::ONE;
    }
    let mut multiplier = cfg.strategy.tiers[0].multiplier;
    for tier in &cfg.strategy.tiers {
        if leader_usdc_size >= tier.leader_usdc_size {
            multiplier = tier.multiplier;
        }
    }
    multiplier
}

/// Applies the cap chain in order: hard max, then position-value cap, then
/// balance cap, then the minimum floor. Returns
/// `None` if the final amount falls below `MIN_ORDER_SIZE_USD`.
fn apply_caps(cfg: &Config, base: Decimal, input: &SizingInput) -> Option<Decimal> {
    let mut amount = base.min(cfg.max_order_size_usd);

    let position_cap = cfg.position_value_cap_pct * input.follower_equity_usd;
    let room_under_position_cap = (position_cap - input.follower_position_value_usd).max(Decimal::ZERO);
    amount = amount.min(room_under_position_cap);

    let balance_cap = cfg.balance_cap_pct * input.follower_balance;
    amount = amount.min(balance_cap);

    if amount < cfg.min_order_size_usd {
        None
    } else {
        Some(amount)
    }
}

/// Computes `intendedSize` for a BUY, in USD.
pub fn size_buy(cfg: &Config, input: &SizingInput) -> Option<Decimal> {
    let base = base_amount(cfg, input.leader_usdc_size) * tiered_multiplier(cfg, input.leader_usdc_size);
    apply_caps(cfg, base, input)
}

/// Computes `intendedSize` for a SELL, in tokens, following the
/// proportional-to-leader-exit formula with fallbacks. Caps at the
/// follower's current position.
pub fn size_sell(cfg: &Config, input: &SizingInput) -> Option<Decimal> {
    let leader_position_before = input.leader_position_after + input.leader_trade_tokens;

    let raw = if input.leader_position_after <= Decimal::ZERO {
        // Leader fully exited: follower exits fully too.
        input.follower_position_tokens
    } else if input.tracked_bought_tokens > Decimal::ZERO && leader_position_before > Decimal::ZERO {
        input.tracked_bought_tokens * (input.leader_trade_tokens / leader_position_before)
    } else {
        input.follower_position_tokens * cfg.strategy.sell_ratio
    };

    let capped = raw.min(input.follower_position_tokens).max(Decimal::ZERO);
    if capped < cfg.min_order_size_tokens {
        None
    } else {
        Some(capped)
    }
}

/// MERGE sells the entire remaining follower position.
pub fn size_merge(cfg: &Config, follower_position_tokens: Decimal) -> Option<Decimal> {
    if follower_position_tokens < cfg.min_order_size_tokens {
        None
    } else {
        Some(follower_position_tokens)
    }
}

/// Classifies a raw leader activity entry into BUY/SELL/MERGE. MERGE is a
/// side classification only (§9): a SELL in a settled market where the
/// follower holds the losing outcome.
pub fn classify(side: Side, is_settlement_merge: bool) -> TradeClass {
    match (side, is_settlement_merge) {
        (_, true) => TradeClass::Merge,
        (Side::Buy, false) => TradeClass::Buy,
        (Side::Sell, false) => TradeClass::Sell,
    }
}
