use serde::Deserialize;

/// The exchange's error responses are not a single fixed shape — some
/// endpoints return a bare string, others a nested `{ "error": { "message": ... } }`
/// object. `ExchangeError::Nested` captures whichever of those fields showed
/// up; `extract_reason` picks the first one present.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExchangeError {
    #[error("{0}")]
    Message(String),

    #[error("{}", .0.extract_reason())]
    Nested(NestedErrorBody),

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited (429)")]
    RateLimited,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NestedErrorBody {
    pub error: Option<String>,
    pub message: Option<String>,
    pub error_msg: Option<String>,
}

impl NestedErrorBody {
    pub fn extract_reason(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .or_else(|| self.error_msg.clone())
            .unwrap_or_else(|| "unknown exchange error".to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("lease already held by another worker")]
    LeaseConflict,
}

/// Why a `GuardedExecutor` gate refused to proceed. Every variant corresponds
/// to one gate in the pipeline; the executor loop records the matching one as
/// the record's `skip_reason` and moves on without a side effect.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum GateError {
    #[error("activity timestamp {0} is stale")]
    StaleTimestamp(i64),

    #[error("idempotency key already recorded")]
    DuplicateIdempotencyKey,

    #[error("lease could not be acquired")]
    LeaseUnavailable,

    #[error("market not viable: {0}")]
    MarketNotViable(String),

    #[error("position delta below minimum")]
    BelowMinDelta,

    #[error("sell requires an existing follower position")]
    SellRequiresPosition,

    #[error("trade size below minimum order size")]
    BelowMinOrderSize,

    #[error("trade size above maximum order size")]
    AboveMaxOrderSize,
}
