use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a `TradeRecord`. Detection is at-least-once, execution
/// is exactly-once per record — see the legal-transition table this mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TradeState {
    Detected,
    Claimed,
    Executing,
    Executed,
    Skipped,
    Failed,
    Reconciled,
}

impl TradeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeState::Detected => "detected",
            TradeState::Claimed => "claimed",
            TradeState::Executing => "executing",
            TradeState::Executed => "executed",
            TradeState::Skipped => "skipped",
            TradeState::Failed => "failed",
            TradeState::Reconciled => "reconciled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

/// The atomic unit this whole system operates on: one observed leader trade
/// plus the bookkeeping needed to replicate it at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub id: String,
    pub leader_address: String,
    pub transaction_hash: String,
    pub token_id: String,
    pub condition_id: String,
    pub timestamp: i64,

    pub side: Side,
    pub size: Decimal,
    pub usdc_size: Decimal,
    pub price: Decimal,

    pub title: Option<String>,
    pub slug: Option<String>,
    pub outcome: Option<String>,
    pub outcome_index: Option<i32>,
    pub end_date: Option<DateTime<Utc>>,

    pub state: TradeState,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub skip_reason: Option<String>,
    pub failure_reason: Option<String>,

    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    pub idempotency_key: Option<String>,
    pub clob_order_id: Option<String>,

    pub intended_size: Option<Decimal>,
    pub filled_size: Option<Decimal>,
    pub actual_tokens: Option<Decimal>,
    pub avg_fill_price: Option<Decimal>,
    pub expected_tokens: Option<Decimal>,
    pub executed_at: Option<DateTime<Utc>>,
    pub needs_manual_review: bool,

    /// BUY only; tokens still attributable to this purchase. Decremented by
    /// SELL accounting in the executor loop as later sells close it out.
    pub my_bought_size: Option<Decimal>,
}

impl TradeRecord {
    /// The natural key a record is deduplicated on. Detection is
    /// at-least-once; this is what makes re-observing the same leader trade
    /// on the next poll a no-op instead of a duplicate insert.
    pub fn natural_key(leader_address: &str, transaction_hash: &str) -> String {
        format!("{leader_address}:{transaction_hash}")
    }

    pub fn is_lease_live(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, TradeState::Claimed | TradeState::Executing)
            && self.lease_expires_at.map(|exp| exp > now).unwrap_or(false)
    }
}

/// The exchange's view of tokens the follower holds for a `tokenId`, used by
/// sizing and reconciliation. A read-through cache of the positions feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowerPosition {
    pub leader_address: String,
    pub token_id: String,
    pub condition_id: String,
    pub size: Decimal,
    pub avg_price: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconciliationSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResult {
    pub leader_address: String,
    pub token_id: String,
    pub expected: Decimal,
    pub actual: Decimal,
    pub pct_diff: Decimal,
    pub severity: ReconciliationSeverity,
    /// True iff `|expected - actual| <= max(1% of expected, 0.1 tokens)` —
    /// the existence test for "no discrepancy at all", distinct from
    /// `severity`, which only classifies how bad an already-existing
    /// discrepancy is.
    pub matches: bool,
    pub checked_at: DateTime<Utc>,
}

/// One entry from the leader's activity feed (§6), close to the wire shape;
/// conversion into a `TradeRecord` happens in the detector.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub transaction_hash: String,
    pub condition_id: String,
    pub asset: String,
    pub side: Side,
    pub size: Decimal,
    pub usdc_size: Decimal,
    pub price: Decimal,
    pub timestamp: i64,
    pub outcome_index: Option<i32>,
    pub slug: Option<String>,
    pub title: Option<String>,
    pub outcome: Option<String>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionEntry {
    pub asset: String,
    pub condition_id: String,
    pub size: Decimal,
    pub avg_price: Decimal,
    pub cur_price: Option<Decimal>,
    pub slug: Option<String>,
    pub end_date: Option<DateTime<Utc>>,
    pub redeemable: Option<bool>,
    pub mergeable: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderBookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OrderBook {
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<&OrderBookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&OrderBookLevel> {
        self.asks.first()
    }

    pub fn spread_bps(&self) -> Option<Decimal> {
        let bid = self.best_bid()?.price;
        let ask = self.best_ask()?.price;
        if bid <= Decimal::ZERO {
            return None;
        }
        Some((ask - bid) / bid * Decimal::from(10_000))
    }

    /// USD depth on the side relevant to the trade direction: asks for a BUY,
    /// bids for a SELL/MERGE.
    pub fn relevant_depth_usd(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.asks.iter().map(|l| l.price * l.size).sum(),
            Side::Sell => self.bids.iter().map(|l| l.price * l.size).sum(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSubmitResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub filled_size: Option<Decimal>,
    pub filled_tokens: Option<Decimal>,
    pub avg_fill_price: Option<Decimal>,
}
