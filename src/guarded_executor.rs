// Guarded Executor (§4.5) — THE ONLY site permitted to submit orders to the
// exchange. Every gate returns a structured verdict; nothing here throws for
// an expected rejection. The exchange client type is never re-exported
// from this crate's public surface, so nothing outside this module can reach
// `ExchangeClient::submit_order` directly.
use crate::config::Config;
use crate::errors::{GateError, StoreError};
use crate::exchange::ExchangeClient;
use crate::lease::{LeaseManager, LeaseStore};
use crate::model::{OrderSubmitResult, Side, TradeRecord, TradeState};
use crate::store::TradeStore;
use crate::viability::{check_edge_filters, check_min_size, check_viability, sell_requires_position};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

/// The two durable operations the Guarded Executor needs from the store: a
/// fresh read (gate 2's idempotency pre-check) and the atomic CAS reservation
/// (the idempotency key write). Kept as a trait so the gate pipeline and the
/// fill-or-kill loop can be exercised against an in-memory double.
#[async_trait]
pub trait ExecutionRecordStore: Send + Sync {
    async fn get(&self, record_id: &str) -> Result<TradeRecord, StoreError>;
    async fn mark_executing(&self, record_id: &str, idempotency_key: &str) -> Result<bool, StoreError>;
}

#[async_trait]
impl ExecutionRecordStore for TradeStore {
    async fn get(&self, record_id: &str) -> Result<TradeRecord, StoreError> {
        TradeStore::get(self, record_id).await
    }
    async fn mark_executing(&self, record_id: &str, idempotency_key: &str) -> Result<bool, StoreError> {
        TradeStore::mark_executing(self, record_id, idempotency_key).await
    }
}

pub struct OrderRequest {
    pub side: Side,
    pub token_id: String,
    /// USD for BUY/MERGE, tokens for SELL.
    pub amount: Decimal,
    pub trader_price: Option<Decimal>,
    pub end_date: Option<chrono::DateTime<Utc>>,
    pub my_position_size: Decimal,
    pub my_position_value: Decimal,
    pub trade_id: Option<String>,
    pub trade_usdc_size: Decimal,
    pub trade_timestamp: Option<i64>,
    pub leader_trade_tokens: Decimal,
    pub leader_position_before: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderOutcome {
    Executed {
        filled_size: Decimal,
        filled_tokens: Decimal,
        avg_fill_price: Decimal,
        order_id: Option<String>,
        idempotency_key: String,
        needs_manual_review: bool,
    },
    Skipped {
        reason: String,
        order_id: Option<String>,
    },
    Failed {
        reason: String,
        is_retryable: bool,
    },
}

pub struct GuardedExecutor<'a, E: ExchangeClient + ?Sized, S: LeaseStore, T: ExecutionRecordStore + ?Sized> {
    exchange: &'a E,
    store: &'a T,
    lease: LeaseManager<'a, S>,
    cfg: &'a Config,
}

impl<'a, E: ExchangeClient + ?Sized, S: LeaseStore, T: ExecutionRecordStore + ?Sized> GuardedExecutor<'a, E, S, T> {
    pub fn new(exchange: &'a E, store: &'a T, lease: LeaseManager<'a, S>, cfg: &'a Config) -> Self {
        Self { exchange, store, lease, cfg }
    }

    pub async fn execute(&self, record_id: &str, req: OrderRequest) -> OrderOutcome {
        macro_rules! release_and_return {
            ($outcome:expr) => {{
                if let Some(trade_id) = &req.trade_id {
                    let _ = self.lease.release(trade_id).await;
                }
                return $outcome;
            }};
        }

        // Gate 1: timestamp freshness.
        if req.trade_id.is_some() {
            match req.trade_timestamp {
                None => release_and_return!(OrderOutcome::Skipped {
                    reason: GateError::StaleTimestamp(0).to_string(),
                    order_id: None,
                }),
                Some(ts) => {
                    let age_hours = (Utc::now().timestamp() - ts) as f64 / 3600.0;
                    if age_hours > self.cfg.too_old_timestamp_hours as f64 {
                        release_and_return!(OrderOutcome::Skipped {
                            reason: format!("timestamp {ts} is {age_hours:.1}h old, exceeds freshness window"),
                            order_id: None,
                        });
                    }
                }
            }
        }

        // Gate 2: idempotency pre-check — a durable read, not memory-only.
        let record = match self.store.get(record_id).await {
            Ok(r) => r,
            Err(e) => release_and_return!(OrderOutcome::Failed {
                reason: format!("store read failed: {e}"),
                is_retryable: true,
            }),
        };
        if record.idempotency_key.is_some() || record.clob_order_id.is_some() || record.state == TradeState::Executed {
            release_and_return!(OrderOutcome::Skipped {
                reason: "idempotency_already_executed".to_string(),
                order_id: record.clob_order_id.clone(),
            });
        }

        // Gate 3: lease acquisition.
        if let Some(trade_id) = &req.trade_id {
            if record.claimed_by.is_none() || !record.is_lease_live(Utc::now()) {
                match self.lease.acquire(trade_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        return OrderOutcome::Failed {
                            reason: "lease_acquisition_failed".to_string(),
                            is_retryable: true,
                        };
                    }
                    Err(e) => {
                        return OrderOutcome::Failed {
                            reason: format!("lease_acquisition_failed: {e}"),
                            is_retryable: true,
                        };
                    }
                }
            }
        }

        // Gate 4: market viability.
        let book = match self.exchange.get_order_book(&req.token_id).await {
            Ok(b) => b,
            Err(e) => release_and_return!(OrderOutcome::Failed {
                reason: format!("order book fetch failed: {e}"),
                is_retryable: true,
            }),
        };
        let viability = check_viability(&self.cfg.viability, &book, req.side, req.end_date, Utc::now());
        for w in &viability.warnings {
            log::warn!("[GATE] {} {} viability warning: {w}", req.token_id, record_id);
        }
        if !viability.viable {
            release_and_return!(OrderOutcome::Skipped {
                reason: viability.reason.unwrap_or_else(|| "market_not_viable".to_string()),
                order_id: None,
            });
        }

        // Gate 5: edge filters.
        let edge = check_edge_filters(
            &self.cfg.edge,
            req.side,
            req.trade_usdc_size,
            req.my_position_size,
            req.leader_trade_tokens,
            req.leader_position_before,
        );
        if !edge.viable {
            release_and_return!(OrderOutcome::Skipped {
                reason: edge.reason.unwrap_or_else(|| "edge_filter".to_string()),
                order_id: None,
            });
        }

        // Gate 6: sell requires position.
        if matches!(req.side, Side::Sell) {
            if let Err(reason) = sell_requires_position(req.my_position_size) {
                release_and_return!(OrderOutcome::Skipped { reason, order_id: None });
            }
        }

        // Gate 7: min/max sizing.
        if let Err(reason) = check_min_size(self.cfg, req.side, req.amount) {
            release_and_return!(OrderOutcome::Skipped { reason, order_id: None });
        }

        // Idempotency reservation: only the worker that wins this race
        // proceeds to place an order.
        let idempotency_key = uuid::Uuid::new_v4().to_string();
        match self.store.mark_executing(record_id, &idempotency_key).await {
            Ok(true) => {}
            Ok(false) => release_and_return!(OrderOutcome::Skipped {
                reason: "idempotency_in_progress".to_string(),
                order_id: None,
            }),
            Err(e) => release_and_return!(OrderOutcome::Failed {
                reason: format!("idempotency reservation failed: {e}"),
                is_retryable: true,
            }),
        }

        let outcome = self.run_sub_order_loop(&req, &idempotency_key).await;

        if let Some(trade_id) = &req.trade_id {
            let _ = self.lease.release(trade_id).await;
        }
        outcome
    }

    /// Fill-or-kill sub-order loop. Repeats until `remaining` falls below
    /// the configured minimum or the retry budget is exhausted.
    async fn run_sub_order_loop(&self, req: &OrderRequest, idempotency_key: &str) -> OrderOutcome {
        let mut remaining = req.amount;
        let mut filled_size = Decimal::ZERO;
        let mut filled_tokens = Decimal::ZERO;
        let mut last_order_id: Option<String> = None;
        let mut retry_count = 0u32;
        let mut hard_abort: Option<String> = None;
        let mut slippage_hit = false;

        let min_remaining = match req.side {
            Side::Buy => self.cfg.min_order_size_usd,
            Side::Sell => self.cfg.min_order_size_tokens,
        };

        loop {
            if remaining < min_remaining || retry_count >= self.cfg.retry_limit {
                break;
            }

            let book = match self.exchange.get_order_book(&req.token_id).await {
                Ok(b) => b,
                Err(_) => {
                    retry_count += 1;
                    continue;
                }
            };

            let (quote_price, quote_size, trader_price) = match req.side {
                Side::Buy => {
                    let Some(ask) = book.best_ask() else { break };
                    (ask.price, ask.size, req.trader_price.unwrap_or(ask.price))
                }
                Side::Sell => {
                    let Some(bid) = book.best_bid() else { break };
                    (bid.price, bid.size, req.trader_price.unwrap_or(bid.price))
                }
            };

            if trader_price <= Decimal::ZERO {
                break;
            }
            let slippage_bps = match req.side {
                Side::Buy => (quote_price - trader_price) / trader_price * Decimal::from(10_000),
                Side::Sell => (trader_price - quote_price) / trader_price * Decimal::from(10_000),
            };
            if slippage_bps > self.cfg.max_slippage_bps {
                log::warn!(
                    "[GUARDED EXEC] slippage {slippage_bps}bps exceeds max {}bps for {}",
                    self.cfg.max_slippage_bps, req.token_id
                );
                slippage_hit = true;
                break;
            }

            let sub_amount = match req.side {
                Side::Buy => remaining.min(quote_size * quote_price),
                Side::Sell => remaining.min(quote_size),
            };

            match self.exchange.submit_order(&req.token_id, req.side, sub_amount, quote_price).await {
                Ok(OrderSubmitResult { success: true, order_id, filled_size: fs, filled_tokens: ft, .. }) => {
                    let fs = fs.unwrap_or(Decimal::ZERO);
                    let ft = ft.unwrap_or(Decimal::ZERO);
                    filled_size += fs;
                    filled_tokens += ft;
                    remaining -= match req.side {
                        Side::Buy => fs,
                        Side::Sell => ft,
                    };
                    last_order_id = order_id.or(last_order_id);
                    retry_count = 0;
                }
                Ok(OrderSubmitResult { success: false, .. }) => {
                    retry_count += 1;
                }
                Err(e) => {
                    let msg = e.to_string().to_lowercase();
                    if msg.contains("not enough balance") || msg.contains("allowance") {
                        hard_abort = Some(e.to_string());
                        break;
                    }
                    retry_count += 1;
                }
            }
        }

        if let Some(reason) = hard_abort {
            return OrderOutcome::Failed {
                reason: format!("insufficient_funds_or_allowance: {reason}"),
                is_retryable: false,
            };
        }

        if filled_tokens == Decimal::ZERO && filled_size == Decimal::ZERO {
            if retry_count >= self.cfg.retry_limit {
                return OrderOutcome::Failed {
                    reason: "max_retries_exceeded".to_string(),
                    is_retryable: true,
                };
            }
            if slippage_hit {
                return OrderOutcome::Skipped {
                    reason: format!("slippage exceeds max {}bps", self.cfg.max_slippage_bps),
                    order_id: None,
                };
            }
        }

        if filled_tokens > Decimal::ZERO || filled_size > Decimal::ZERO {
            let avg_fill_price = if filled_tokens > Decimal::ZERO { filled_size / filled_tokens } else { Decimal::ZERO };
            // `req.amount` is USD for BUY but tokens for SELL; compare each
            // against the filled quantity denominated the same way.
            let filled_in_request_units = match req.side {
                Side::Buy => filled_size,
                Side::Sell => filled_tokens,
            };
            let ratio = if req.amount > Decimal::ZERO { filled_in_request_units / req.amount } else { Decimal::ZERO };
            let needs_manual_review = ratio < Decimal::new(80, 2) || ratio > Decimal::new(120, 2);
            return OrderOutcome::Executed {
                filled_size,
                filled_tokens,
                avg_fill_price,
                order_id: last_order_id,
                idempotency_key: idempotency_key.to_string(),
                needs_manual_review,
            };
        }

        OrderOutcome::Failed {
            reason: "max_retries_exceeded".to_string(),
            is_retryable: true,
        }
    }
}

/// Derives `skip_reason`/`failure_reason` text for persistence, matching
/// the record-keeping shape the Trade Executor Loop writes back.
pub fn classify_record(record: &TradeRecord, outcome: &OrderOutcome) -> (TradeState, Option<String>, Option<String>) {
    let _ = record;
    match outcome {
        OrderOutcome::Executed { .. } => (TradeState::Executed, None, None),
        OrderOutcome::Skipped { reason, .. } => (TradeState::Skipped, Some(reason.clone()), None),
        OrderOutcome::Failed { reason, .. } => (TradeState::Failed, None, Some(reason.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CopyStrategyConfig, EdgeFilterConfig, SizingMode, ViabilityConfig};
    use crate::exchange::SimExchange;
    use crate::model::{OrderBook, OrderBookLevel};
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::Mutex as StdMutex;

    /// In-memory stand-in for the two durable record operations the Guarded
    /// Executor needs, doubling as a `LeaseStore` so a single instance backs
    /// both the idempotency gate and the lease gate in these tests.
    #[derive(Default)]
    struct InMemoryStore {
        records: StdMutex<HashMap<String, TradeRecord>>,
    }

    impl InMemoryStore {
        fn seed(&self, record: TradeRecord) {
            self.records.lock().unwrap().insert(record.id.clone(), record);
        }
    }

    #[async_trait]
    impl ExecutionRecordStore for InMemoryStore {
        async fn get(&self, record_id: &str) -> Result<TradeRecord, StoreError> {
            self.records
                .lock()
                .unwrap()
                .get(record_id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(record_id.to_string()))
        }

        async fn mark_executing(&self, record_id: &str, idempotency_key: &str) -> Result<bool, StoreError> {
            let mut records = self.records.lock().unwrap();
            let Some(r) = records.get_mut(record_id) else { return Ok(false) };
            if r.idempotency_key.is_some() {
                return Ok(false);
            }
            r.idempotency_key = Some(idempotency_key.to_string());
            r.state = TradeState::Executing;
            Ok(true)
        }
    }

    #[async_trait]
    impl LeaseStore for InMemoryStore {
        async fn try_claim(
            &self,
            record_id: &str,
            worker_id: &str,
            now: chrono::DateTime<Utc>,
            lease_timeout_ms: i64,
        ) -> Result<bool, StoreError> {
            let mut records = self.records.lock().unwrap();
            let Some(r) = records.get_mut(record_id) else { return Ok(false) };
            let available = r.claimed_by.is_none()
                || r.claimed_by.as_deref() == Some(worker_id)
                || r.lease_expires_at.map(|exp| exp < now).unwrap_or(true);
            if available {
                r.claimed_by = Some(worker_id.to_string());
                r.claimed_at = Some(now);
                r.lease_expires_at = Some(now + chrono::Duration::milliseconds(lease_timeout_ms));
            }
            Ok(available)
        }

        async fn release(&self, record_id: &str, worker_id: &str) -> Result<(), StoreError> {
            let mut records = self.records.lock().unwrap();
            if let Some(r) = records.get_mut(record_id) {
                if r.claimed_by.as_deref() == Some(worker_id) {
                    r.claimed_by = None;
                    r.lease_expires_at = None;
                }
            }
            Ok(())
        }

        async fn extend_lease(
            &self,
            _record_id: &str,
            _worker_id: &str,
            _now: chrono::DateTime<Utc>,
            _lease_timeout_ms: i64,
        ) -> Result<bool, StoreError> {
            Ok(true)
        }

        async fn clear_expired(&self, _leader_address: &str, _now: chrono::DateTime<Utc>) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    fn test_config() -> Config {
        Config {
            database_url: String::new(),
            activity_host: String::new(),
            data_host: String::new(),
            clob_host: String::new(),
            user_addresses: vec![],
            proxy_wallet: String::new(),
            private_key: String::new(),
            fetch_interval_secs: 5,
            too_old_timestamp_hours: 24,
            retry_limit: 3,
            max_slippage_bps: Decimal::from(500),
            executor_batch_size: 10,
            executor_tick_ms: 300,
            lease_timeout_ms: 30_000,
            reconcile_interval_secs: 120,
            max_order_size_usd: Decimal::from(500),
            min_order_size_usd: Decimal::ONE,
            min_order_size_tokens: Decimal::ONE,
            position_value_cap_pct: Decimal::new(25, 2),
            balance_cap_pct: Decimal::new(99, 2),
            strategy: CopyStrategyConfig {
                mode: SizingMode::Percentage,
                copy_percent: Decimal::new(2, 1),
                fixed_amount_usd: Decimal::from(10),
                tiers: vec![],
                sell_ratio: Decimal::ONE,
            },
            viability: ViabilityConfig {
                price_limit: Decimal::new(95, 2),
                min_time_before_end_minutes: 60,
                max_spread_bps: Decimal::from(500),
                min_depth_usd: Decimal::from(5),
            },
            edge: EdgeFilterConfig {
                min_position_delta_usd: Decimal::ONE,
                require_position_for_sell: true,
                min_trade_percent_of_position: Decimal::from(2),
            },
            shadow_mode: true,
        }
    }

    fn deep_book(bid: &str, ask: &str) -> OrderBook {
        OrderBook {
            bids: vec![OrderBookLevel { price: Decimal::from_str(bid).unwrap(), size: Decimal::from(1000) }],
            asks: vec![OrderBookLevel { price: Decimal::from_str(ask).unwrap(), size: Decimal::from(1000) }],
        }
    }

    fn seeded_record(id: &str, side: Side, state: TradeState) -> TradeRecord {
        TradeRecord {
            id: id.to_string(),
            leader_address: "0xleader".to_string(),
            transaction_hash: format!("tx-{id}"),
            token_id: "token-1".to_string(),
            condition_id: "cond-1".to_string(),
            timestamp: Utc::now().timestamp(),
            side,
            size: Decimal::from(10),
            usdc_size: Decimal::from(50),
            price: Decimal::new(5, 1),
            title: None,
            slug: None,
            outcome: None,
            outcome_index: None,
            end_date: None,
            state,
            retry_count: 0,
            last_retry_at: None,
            skip_reason: None,
            failure_reason: None,
            claimed_by: None,
            claimed_at: None,
            lease_expires_at: None,
            idempotency_key: None,
            clob_order_id: None,
            intended_size: None,
            filled_size: None,
            actual_tokens: None,
            avg_fill_price: None,
            expected_tokens: None,
            executed_at: None,
            needs_manual_review: false,
            my_bought_size: None,
        }
    }

    fn base_request(side: Side, amount: Decimal, trade_id: &str) -> OrderRequest {
        OrderRequest {
            side,
            token_id: "token-1".to_string(),
            amount,
            trader_price: Some(Decimal::new(5, 1)),
            end_date: None,
            my_position_size: Decimal::from(100),
            my_position_value: Decimal::from(50),
            trade_id: Some(trade_id.to_string()),
            trade_usdc_size: Decimal::from(50),
            trade_timestamp: Some(Utc::now().timestamp()),
            leader_trade_tokens: Decimal::from(10),
            leader_position_before: Decimal::from(100),
        }
    }

    // S1: happy-path BUY — every gate passes and the sub-order loop fills.
    #[tokio::test]
    async fn s1_happy_path_buy_executes_and_fills() {
        let exchange = SimExchange::new();
        exchange.set_book("token-1", deep_book("0.50", "0.505"));
        let cfg = test_config();
        let store = InMemoryStore::default();
        store.seed(seeded_record("trade-1", Side::Buy, TradeState::Detected));

        let lease = LeaseManager::new(&store, "worker-a".to_string(), cfg.lease_timeout_ms);
        let guarded = GuardedExecutor::new(&exchange, &store, lease, &cfg);
        let req = base_request(Side::Buy, Decimal::from(50), "trade-1");

        match guarded.execute("trade-1", req).await {
            OrderOutcome::Executed { filled_size, needs_manual_review, .. } => {
                assert!(filled_size > Decimal::ZERO);
                assert!(!needs_manual_review);
            }
            other => panic!("expected Executed, got {other:?}"),
        }
    }

    // S2: idempotent replay — a record already carrying an idempotency key
    // and marked executed is never re-submitted to the exchange.
    #[tokio::test]
    async fn s2_idempotent_replay_of_an_already_executed_record_is_skipped() {
        let exchange = SimExchange::new();
        exchange.set_book("token-1", deep_book("0.50", "0.505"));
        let cfg = test_config();
        let store = InMemoryStore::default();
        let mut record = seeded_record("trade-2", Side::Buy, TradeState::Executed);
        record.idempotency_key = Some("already-done".to_string());
        record.clob_order_id = Some("sim-order-1".to_string());
        store.seed(record);

        let lease = LeaseManager::new(&store, "worker-a".to_string(), cfg.lease_timeout_ms);
        let guarded = GuardedExecutor::new(&exchange, &store, lease, &cfg);
        let req = base_request(Side::Buy, Decimal::from(50), "trade-2");

        match guarded.execute("trade-2", req).await {
            OrderOutcome::Skipped { reason, order_id } => {
                assert_eq!(reason, "idempotency_already_executed");
                assert_eq!(order_id.as_deref(), Some("sim-order-1"));
            }
            other => panic!("expected Skipped, got {other:?}"),
        }
    }

    // S3: leader exit — a SELL for a follower with no held position is
    // refused rather than attempting to short.
    #[tokio::test]
    async fn s3_sell_on_leader_exit_with_no_follower_position_is_skipped() {
        let exchange = SimExchange::new();
        exchange.set_book("token-1", deep_book("0.50", "0.505"));
        let cfg = test_config();
        let store = InMemoryStore::default();
        store.seed(seeded_record("trade-3", Side::Sell, TradeState::Detected));

        let lease = LeaseManager::new(&store, "worker-a".to_string(), cfg.lease_timeout_ms);
        let guarded = GuardedExecutor::new(&exchange, &store, lease, &cfg);
        let mut req = base_request(Side::Sell, Decimal::from(10), "trade-3");
        req.my_position_size = Decimal::ZERO;

        match guarded.execute("trade-3", req).await {
            OrderOutcome::Skipped { reason, .. } => assert_eq!(reason, "no_position_to_sell"),
            other => panic!("expected Skipped, got {other:?}"),
        }
    }

    // S4: slippage block — a stale trader price far from the live quote
    // trips the slippage gate and the order is never filled.
    #[tokio::test]
    async fn s4_excessive_slippage_against_a_stale_trader_price_skips() {
        let exchange = SimExchange::new();
        exchange.set_book("token-1", deep_book("0.50", "0.505"));
        let cfg = test_config();
        let store = InMemoryStore::default();
        store.seed(seeded_record("trade-4", Side::Buy, TradeState::Detected));

        let lease = LeaseManager::new(&store, "worker-a".to_string(), cfg.lease_timeout_ms);
        let guarded = GuardedExecutor::new(&exchange, &store, lease, &cfg);
        let mut req = base_request(Side::Buy, Decimal::from(50), "trade-4");
        req.trader_price = Some(Decimal::new(30, 2)); // 0.30, stale against a 0.505 ask

        match guarded.execute("trade-4", req).await {
            OrderOutcome::Skipped { reason, order_id } => {
                assert!(reason.contains("slippage"), "{reason}");
                assert!(order_id.is_none());
            }
            other => panic!("expected Skipped for slippage, got {other:?}"),
        }
    }

    // S5: market-end-imminent — a BUY this close to `end_date` hard-skips at
    // the viability gate (a SELL in the same situation would only warn).
    #[tokio::test]
    async fn s5_buy_blocked_when_market_end_is_imminent() {
        let exchange = SimExchange::new();
        exchange.set_book("token-1", deep_book("0.50", "0.505"));
        let cfg = test_config();
        let store = InMemoryStore::default();
        store.seed(seeded_record("trade-5", Side::Buy, TradeState::Detected));

        let lease = LeaseManager::new(&store, "worker-a".to_string(), cfg.lease_timeout_ms);
        let guarded = GuardedExecutor::new(&exchange, &store, lease, &cfg);
        let mut req = base_request(Side::Buy, Decimal::from(50), "trade-5");
        req.end_date = Some(Utc::now() + chrono::Duration::minutes(10));

        match guarded.execute("trade-5", req).await {
            OrderOutcome::Skipped { reason, .. } => assert!(reason.contains("time to end"), "{reason}"),
            other => panic!("expected Skipped for imminent market end, got {other:?}"),
        }
    }

    // S6: crash during execution — a record whose idempotency key was
    // already reserved before the process died is never re-executed on
    // the next pass, only re-observed as already in flight.
    #[tokio::test]
    async fn s6_crash_recovery_does_not_re_execute_an_already_reserved_record() {
        let exchange = SimExchange::new();
        exchange.set_book("token-1", deep_book("0.50", "0.505"));
        let cfg = test_config();
        let store = InMemoryStore::default();
        let mut record = seeded_record("trade-6", Side::Buy, TradeState::Executing);
        record.idempotency_key = Some("reserved-before-crash".to_string());
        store.seed(record);

        let lease = LeaseManager::new(&store, "worker-a".to_string(), cfg.lease_timeout_ms);
        let guarded = GuardedExecutor::new(&exchange, &store, lease, &cfg);
        let req = base_request(Side::Buy, Decimal::from(50), "trade-6");

        match guarded.execute("trade-6", req).await {
            OrderOutcome::Skipped { reason, .. } => assert_eq!(reason, "idempotency_already_executed"),
            other => panic!("expected Skipped (not re-executed), got {other:?}"),
        }
    }
}
