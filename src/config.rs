use rust_decimal::Decimal;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingMode {
    Percentage,
    Fixed,
    Adaptive,
}

impl FromStr for SizingMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PERCENTAGE" => Ok(SizingMode::Percentage),
            "FIXED" => Ok(SizingMode::Fixed),
            "ADAPTIVE" => Ok(SizingMode::Adaptive),
            other => Err(format!("unknown sizing mode: {other}")),
        }
    }
}

/// One point of a piecewise-linear ADAPTIVE schedule: above
/// `leader_usdc_size`, the multiplier applied to `base` is `multiplier`.
/// Larger leader trades get scaled down, the way a single fixed percent
/// would over-expose the follower to a leader's biggest bets.
#[derive(Debug, Clone)]
pub struct SizingTier {
    pub leader_usdc_size: Decimal,
    pub multiplier: Decimal,
}

#[derive(Debug, Clone)]
pub struct CopyStrategyConfig {
    pub mode: SizingMode,
    pub copy_percent: Decimal,
    pub fixed_amount_usd: Decimal,
    pub tiers: Vec<SizingTier>,
    pub sell_ratio: Decimal,
}

impl CopyStrategyConfig {
    /// `COPY_STRATEGY_CONFIG` is a single JSON-ish env var in the source
    /// system; here it is decomposed into discrete env vars with the same
    /// names joined by underscores, which is friendlier to plain
    /// `docker run -e` deployment and matches how the rest of this crate's
    /// configuration is built.
    fn from_env() -> Self {
        let mode = std::env::var("COPY_STRATEGY_MODE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(SizingMode::Percentage);

        let tiers = std::env::var("COPY_STRATEGY_TIERS")
            .ok()
            .map(|raw| {
                raw.split(';')
                    .filter_map(|pair| {
                        let (threshold, mult) = pair.split_once(':')?;
                        Some(SizingTier {
                            leader_usdc_size: Decimal::from_str(threshold.trim()).ok()?,
                            multiplier: Decimal::from_str(mult.trim()).ok()?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            mode,
            copy_percent: env_decimal("COPY_STRATEGY_PERCENT", "0.2"),
            fixed_amount_usd: env_decimal("COPY_STRATEGY_FIXED_AMOUNT_USD", "10.0"),
            tiers,
            sell_ratio: env_decimal("COPY_STRATEGY_SELL_RATIO", "1.0"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViabilityConfig {
    pub price_limit: Decimal,
    pub min_time_before_end_minutes: i64,
    pub max_spread_bps: Decimal,
    pub min_depth_usd: Decimal,
}

impl ViabilityConfig {
    fn from_env() -> Self {
        let price_limit = env_decimal("VIABILITY_PRICE_LIMIT", "0.95").min(Decimal::new(95, 2));
        let min_time_before_end_minutes =
            env_or("VIABILITY_MIN_TIME_BEFORE_END_MINUTES", 60i64).max(5);
        let max_spread_bps = env_decimal("VIABILITY_MAX_SPREAD_BPS", "500")
            .min(Decimal::from(2000));
        let min_depth_usd = env_decimal("VIABILITY_MIN_DEPTH_USD", "5.0").max(Decimal::new(50, 2));
        Self {
            price_limit,
            min_time_before_end_minutes,
            max_spread_bps,
            min_depth_usd,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EdgeFilterConfig {
    pub min_position_delta_usd: Decimal,
    pub require_position_for_sell: bool,
    pub min_trade_percent_of_position: Decimal,
}

impl EdgeFilterConfig {
    fn from_env() -> Self {
        Self {
            min_position_delta_usd: env_decimal("EDGE_MIN_POSITION_DELTA_USD", "1.0")
                .max(Decimal::new(50, 2)),
            require_position_for_sell: std::env::var("EDGE_REQUIRE_POSITION_FOR_SELL")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            min_trade_percent_of_position: env_decimal("EDGE_MIN_TRADE_PERCENT_OF_POSITION", "2.0")
                .max(Decimal::ONE),
        }
    }
}

/// Process-wide configuration, built once in `main` from the environment and
/// handed down to every component by reference — no global config singleton.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub activity_host: String,
    pub data_host: String,
    pub clob_host: String,

    pub user_addresses: Vec<String>,
    pub proxy_wallet: String,
    pub private_key: String,

    pub fetch_interval_secs: u64,
    pub too_old_timestamp_hours: i64,
    pub retry_limit: u32,
    pub max_slippage_bps: Decimal,

    pub executor_batch_size: usize,
    pub executor_tick_ms: u64,
    pub lease_timeout_ms: i64,
    pub reconcile_interval_secs: u64,

    pub max_order_size_usd: Decimal,
    pub min_order_size_usd: Decimal,
    pub min_order_size_tokens: Decimal,
    pub position_value_cap_pct: Decimal,
    pub balance_cap_pct: Decimal,

    pub strategy: CopyStrategyConfig,
    pub viability: ViabilityConfig,
    pub edge: EdgeFilterConfig,

    pub shadow_mode: bool,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_decimal(key: &str, default: &str) -> Decimal {
    std::env::var(key)
        .ok()
        .and_then(|v| Decimal::from_str(&v).ok())
        .unwrap_or_else(|| Decimal::from_str(default).expect("valid default decimal literal"))
}

impl Config {
    pub fn from_env() -> Self {
        let user_addresses = std::env::var("USER_ADDRESSES")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/copytrade".to_string()),
            activity_host: std::env::var("ACTIVITY_HOST")
                .unwrap_or_else(|_| "https://data-api.polymarket.com".to_string()),
            data_host: std::env::var("DATA_HOST")
                .unwrap_or_else(|_| "https://data-api.polymarket.com".to_string()),
            clob_host: std::env::var("CLOB_HOST")
                .unwrap_or_else(|_| "https://clob.polymarket.com".to_string()),

            user_addresses,
            proxy_wallet: std::env::var("PROXY_WALLET").unwrap_or_default(),
            private_key: std::env::var("PRIVATE_KEY").unwrap_or_default(),

            fetch_interval_secs: env_or("FETCH_INTERVAL", 5),
            too_old_timestamp_hours: env_or("TOO_OLD_TIMESTAMP_HOURS", 24),
            retry_limit: env_or("RETRY_LIMIT", 3),
            max_slippage_bps: env_decimal("MAX_SLIPPAGE_BPS", "500").min(Decimal::from(1000)),

            executor_batch_size: env_or("EXECUTOR_BATCH_SIZE", 10),
            executor_tick_ms: env_or("EXECUTOR_TICK_MS", 300),
            lease_timeout_ms: env_or("LEASE_TIMEOUT_MS", 30_000),
            reconcile_interval_secs: env_or("RECONCILE_INTERVAL_SECS", 120),

            max_order_size_usd: env_decimal("MAX_ORDER_SIZE_USD", "500.0"),
            min_order_size_usd: env_decimal("MIN_ORDER_SIZE_USD", "1.0"),
            min_order_size_tokens: env_decimal("MIN_ORDER_SIZE_TOKENS", "1.0"),
            position_value_cap_pct: env_decimal("POSITION_VALUE_CAP_PCT", "0.25"),
            balance_cap_pct: env_decimal("BALANCE_CAP_PCT", "0.99"),

            strategy: CopyStrategyConfig::from_env(),
            viability: ViabilityConfig::from_env(),
            edge: EdgeFilterConfig::from_env(),

            shadow_mode: std::env::var("SHADOW_MODE")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viability_hard_caps_clamp_even_aggressive_env_overrides() {
        std::env::set_var("VIABILITY_PRICE_LIMIT", "0.99");
        std::env::set_var("VIABILITY_MAX_SPREAD_BPS", "5000");
        std::env::set_var("VIABILITY_MIN_DEPTH_USD", "0.01");
        std::env::set_var("VIABILITY_MIN_TIME_BEFORE_END_MINUTES", "1");

        let v = ViabilityConfig::from_env();
        assert_eq!(v.price_limit, Decimal::new(95, 2));
        assert_eq!(v.max_spread_bps, Decimal::from(2000));
        assert_eq!(v.min_depth_usd, Decimal::new(50, 2));
        assert_eq!(v.min_time_before_end_minutes, 5);

        std::env::remove_var("VIABILITY_PRICE_LIMIT");
        std::env::remove_var("VIABILITY_MAX_SPREAD_BPS");
        std::env::remove_var("VIABILITY_MIN_DEPTH_USD");
        std::env::remove_var("VIABILITY_MIN_TIME_BEFORE_END_MINUTES");
    }

    #[test]
    fn strategy_tiers_parse_from_semicolon_list() {
        std::env::set_var("COPY_STRATEGY_TIERS", "100:1.0;500:0.5");
        let cfg = CopyStrategyConfig::from_env();
        assert_eq!(cfg.tiers.len(), 2);
        assert_eq!(cfg.tiers[0].multiplier, Decimal::ONE);
        std::env::remove_var("COPY_STRATEGY_TIERS");
    }
}
