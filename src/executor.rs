// Trade Executor Loop (§4.3): per-leader poll of ready records, sizing, and
// dispatch into the Guarded Executor. Owns the SELL accounting rule the
// Guarded Executor deliberately stays out of (§4.3 closing note).
use crate::config::Config;
use crate::errors::StoreError;
use crate::exchange::ExchangeClient;
use crate::guarded_executor::{GuardedExecutor, OrderOutcome, OrderRequest};
use crate::lease::{LeaseManager, LeaseStore};
use crate::model::{Side, TradeRecord, TradeState};
use crate::monitor::{ExecutionMonitor, GateOutcome};
use crate::sizing::{self, SizingInput, TradeClass};
use crate::store::TradeStore;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Mutex;

/// The durable side of SELL accounting: reading a leader/token's open BUYs
/// and adjusting how much of each is still attributable to this follower.
/// Kept as a trait so `reduce_open_buys`'s proportional-reduction math can be
/// exercised without a Postgres instance.
#[async_trait]
pub trait PositionLedgerStore: Send + Sync {
    async fn open_buys(&self, leader_address: &str, token_id: &str) -> Result<Vec<TradeRecord>, StoreError>;
    async fn set_my_bought_size(&self, record_id: &str, size: Decimal) -> Result<(), StoreError>;
}

#[async_trait]
impl PositionLedgerStore for TradeStore {
    async fn open_buys(&self, leader_address: &str, token_id: &str) -> Result<Vec<TradeRecord>, StoreError> {
        TradeStore::open_buys(self, leader_address, token_id).await
    }
    async fn set_my_bought_size(&self, record_id: &str, size: Decimal) -> Result<(), StoreError> {
        TradeStore::set_my_bought_size(self, record_id, size).await
    }
}

/// Runs one pass over a leader's ready batch. Returns the number of records
/// it attempted, so the caller can back off when nothing was ready.
pub async fn run_once<E: ExchangeClient + ?Sized, S: LeaseStore>(
    cfg: &Config,
    store: &TradeStore,
    exchange: &E,
    lease_store: &S,
    monitor: &Mutex<ExecutionMonitor>,
    leader_address: &str,
    worker_id: &str,
) -> Result<usize, String> {
    let batch = store
        .next_batch(leader_address, cfg.retry_limit, cfg.executor_batch_size as i64)
        .await
        .map_err(|e| e.to_string())?;

    let n = batch.len();
    for record in batch {
        if let Err(e) = process_one(cfg, store, exchange, lease_store, monitor, worker_id, &record).await {
            log::error!("[EXECUTOR] {} {}: {e}", record.leader_address, record.id);
        }
    }
    Ok(n)
}

async fn process_one<E: ExchangeClient + ?Sized, S: LeaseStore>(
    cfg: &Config,
    store: &TradeStore,
    exchange: &E,
    lease_store: &S,
    monitor: &Mutex<ExecutionMonitor>,
    worker_id: &str,
    record: &TradeRecord,
) -> Result<(), String> {
    let lease = LeaseManager::new(lease_store, worker_id.to_string(), cfg.lease_timeout_ms);
    if !lease.acquire(&record.id).await.map_err(|e| e.to_string())? {
        return Ok(()); // another worker already holds it
    }

    let positions = exchange.fetch_positions(&cfg.proxy_wallet).await.map_err(|e| e.to_string())?;
    let my_position = positions.iter().find(|p| p.asset == record.token_id);
    let follower_position_tokens = my_position.map(|p| p.size).unwrap_or(Decimal::ZERO);
    let follower_position_value_usd =
        my_position.and_then(|p| p.cur_price).map(|px| px * follower_position_tokens).unwrap_or(Decimal::ZERO);

    let leader_positions = exchange.fetch_positions(&record.leader_address).await.map_err(|e| e.to_string())?;
    let leader_position_after = leader_positions
        .iter()
        .find(|p| p.asset == record.token_id)
        .map(|p| p.size)
        .unwrap_or(Decimal::ZERO);

    let is_settlement_merge = my_position.and_then(|p| p.mergeable).unwrap_or(false) && matches!(record.side, Side::Sell);
    let class = sizing::classify(record.side, is_settlement_merge);

    let open_buys = store.open_buys(&record.leader_address, &record.token_id).await.map_err(|e| e.to_string())?;
    let tracked_bought_tokens: Decimal = open_buys.iter().filter_map(|r| r.my_bought_size).sum();

    // TODO(balance feed): follower USDC balance should come from a wallet
    // balance endpoint; until that's wired in, treat current position value
    // as a proxy so the balance cap still does something meaningful in shadow mode.
    let follower_balance = cfg.max_order_size_usd * Decimal::from(10);
    let follower_equity_usd = follower_balance + follower_position_value_usd;

    let sizing_input = SizingInput {
        class,
        leader_usdc_size: record.usdc_size,
        leader_trade_tokens: record.size,
        leader_position_after,
        follower_balance,
        follower_position_value_usd,
        follower_position_tokens,
        follower_equity_usd,
        tracked_bought_tokens,
    };

    let intended = match class {
        TradeClass::Buy => sizing::size_buy(cfg, &sizing_input),
        TradeClass::Sell => sizing::size_sell(cfg, &sizing_input),
        TradeClass::Merge => sizing::size_merge(cfg, follower_position_tokens),
    };

    let Some(intended_size) = intended else {
        store
            .write_outcome(
                &record.id,
                TradeState::Skipped,
                None,
                None,
                None,
                None,
                None,
                Some("sizing produced nothing tradeable after caps".to_string()),
                None,
                false,
                false,
            )
            .await
            .map_err(|e| e.to_string())?;
        lease.release(&record.id).await.map_err(|e| e.to_string())?;
        monitor.lock().unwrap().record(GateOutcome::Skipped, Some("no_size_after_caps".to_string()));
        return Ok(());
    };

    let order_side = match class {
        TradeClass::Buy => Side::Buy,
        TradeClass::Sell | TradeClass::Merge => Side::Sell,
    };

    let req = OrderRequest {
        side: order_side,
        token_id: record.token_id.clone(),
        amount: intended_size,
        trader_price: Some(record.price),
        end_date: record.end_date,
        my_position_size: follower_position_tokens,
        my_position_value: follower_position_value_usd,
        trade_id: Some(record.id.clone()),
        trade_usdc_size: record.usdc_size,
        trade_timestamp: Some(record.timestamp),
        leader_trade_tokens: record.size,
        leader_position_before: leader_position_after + record.size,
    };

    let guarded = GuardedExecutor::new(exchange, store, lease, cfg);
    let outcome = guarded.execute(&record.id, req).await;

    let gate_outcome = match &outcome {
        OrderOutcome::Executed { .. } => GateOutcome::Executed,
        OrderOutcome::Skipped { .. } => GateOutcome::Skipped,
        OrderOutcome::Failed { .. } => GateOutcome::Failed,
    };
    let skip_reason = match &outcome {
        OrderOutcome::Skipped { reason, .. } => Some(reason.clone()),
        _ => None,
    };
    monitor.lock().unwrap().record(gate_outcome, skip_reason);

    persist_outcome(store, record, class, intended_size, &outcome).await.map_err(|e| e.to_string())
}

async fn persist_outcome(
    store: &TradeStore,
    record: &TradeRecord,
    class: TradeClass,
    intended_size: Decimal,
    outcome: &OrderOutcome,
) -> Result<(), crate::errors::StoreError> {
    match outcome {
        OrderOutcome::Executed { filled_size, filled_tokens, avg_fill_price, order_id, needs_manual_review, .. } => {
            store
                .write_outcome(
                    &record.id,
                    TradeState::Executed,
                    Some(intended_size),
                    Some(*filled_size),
                    Some(*filled_tokens),
                    Some(*avg_fill_price),
                    order_id.clone(),
                    None,
                    None,
                    *needs_manual_review,
                    false,
                )
                .await?;

            if matches!(class, TradeClass::Buy) {
                store.set_my_bought_size(&record.id, *filled_tokens).await?;
            } else {
                reduce_open_buys(store, record, *filled_tokens).await?;
            }
            Ok(())
        }
        OrderOutcome::Skipped { reason, order_id } => {
            store
                .write_outcome(
                    &record.id,
                    TradeState::Skipped,
                    Some(intended_size),
                    None,
                    None,
                    None,
                    order_id.clone(),
                    Some(reason.clone()),
                    None,
                    false,
                    false,
                )
                .await
        }
        OrderOutcome::Failed { reason, is_retryable } => {
            store
                .write_outcome(
                    &record.id,
                    TradeState::Failed,
                    Some(intended_size),
                    None,
                    None,
                    None,
                    None,
                    None,
                    Some(reason.clone()),
                    false,
                    *is_retryable,
                )
                .await
        }
    }
}

/// Reduces `my_bought_size` across a leader/token's open BUYs
/// proportionally to the sell's share of total tracked long exposure: every
/// open BUY shrinks by the same fraction `tokens_sold / total_tracked`, not
/// FIFO-drained oldest-first. Clears a BUY's tracked size entirely once it
/// is at least 99% closed, so dust doesn't linger forever as an "open" buy.
async fn reduce_open_buys<T: PositionLedgerStore + ?Sized>(
    store: &T,
    record: &TradeRecord,
    tokens_sold: Decimal,
) -> Result<(), crate::errors::StoreError> {
    if tokens_sold <= Decimal::ZERO {
        return Ok(());
    }
    let open_buys = store.open_buys(&record.leader_address, &record.token_id).await?;
    let total_tracked: Decimal = open_buys.iter().filter_map(|r| r.my_bought_size).sum();
    if total_tracked <= Decimal::ZERO {
        return Ok(());
    }

    let fraction = (tokens_sold / total_tracked).min(Decimal::ONE);
    for buy in open_buys {
        let Some(bought) = buy.my_bought_size else { continue };
        if bought <= Decimal::ZERO {
            continue;
        }
        let reduction = bought * fraction;
        let left = bought - reduction;
        let new_size = if left / bought.max(Decimal::new(1, 8)) < Decimal::new(1, 2) {
            Decimal::ZERO // under 1% left: treat as fully closed
        } else {
            left
        };
        store.set_my_bought_size(&buy.id, new_size).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct InMemoryLedgerStore {
        records: StdMutex<HashMap<String, TradeRecord>>,
    }

    impl InMemoryLedgerStore {
        fn seed(&self, record: TradeRecord) {
            self.records.lock().unwrap().insert(record.id.clone(), record);
        }

        fn bought_size(&self, id: &str) -> Decimal {
            self.records.lock().unwrap().get(id).and_then(|r| r.my_bought_size).unwrap_or(Decimal::ZERO)
        }
    }

    #[async_trait]
    impl PositionLedgerStore for InMemoryLedgerStore {
        async fn open_buys(&self, leader_address: &str, token_id: &str) -> Result<Vec<TradeRecord>, StoreError> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .values()
                .filter(|r| {
                    r.leader_address == leader_address
                        && r.token_id == token_id
                        && matches!(r.side, Side::Buy)
                        && r.my_bought_size.map(|s| s > Decimal::ZERO).unwrap_or(false)
                })
                .cloned()
                .collect())
        }

        async fn set_my_bought_size(&self, record_id: &str, size: Decimal) -> Result<(), StoreError> {
            if let Some(r) = self.records.lock().unwrap().get_mut(record_id) {
                r.my_bought_size = Some(size);
            }
            Ok(())
        }
    }

    fn buy_record(id: &str, bought_size: Decimal) -> TradeRecord {
        TradeRecord {
            id: id.to_string(),
            leader_address: "0xleader".to_string(),
            transaction_hash: format!("tx-{id}"),
            token_id: "token-1".to_string(),
            condition_id: "cond-1".to_string(),
            timestamp: Utc::now().timestamp(),
            side: Side::Buy,
            size: Decimal::from(10),
            usdc_size: Decimal::from(50),
            price: Decimal::new(5, 1),
            title: None,
            slug: None,
            outcome: None,
            outcome_index: None,
            end_date: None,
            state: TradeState::Executed,
            retry_count: 0,
            last_retry_at: None,
            skip_reason: None,
            failure_reason: None,
            claimed_by: None,
            claimed_at: None,
            lease_expires_at: None,
            idempotency_key: Some(format!("key-{id}")),
            clob_order_id: Some(format!("order-{id}")),
            intended_size: None,
            filled_size: None,
            actual_tokens: None,
            avg_fill_price: None,
            expected_tokens: None,
            executed_at: None,
            needs_manual_review: false,
            my_bought_size: Some(bought_size),
        }
    }

    fn sell_record(id: &str) -> TradeRecord {
        let mut r = buy_record(id, Decimal::ZERO);
        r.side = Side::Sell;
        r.my_bought_size = None;
        r
    }

    // Two open BUYs of different sizes both shrink by the same fraction of
    // the sell's share of total tracked exposure, not FIFO-drained in order.
    #[tokio::test]
    async fn a_partial_sell_reduces_every_open_buy_by_the_same_fraction() {
        let store = InMemoryLedgerStore::default();
        store.seed(buy_record("buy-1", Decimal::from(60)));
        store.seed(buy_record("buy-2", Decimal::from(40)));
        let sell = sell_record("sell-1");

        // 25 of 100 tracked tokens sold -> each buy should shrink by 25%.
        reduce_open_buys(&store, &sell, Decimal::from(25)).await.unwrap();

        assert_eq!(store.bought_size("buy-1"), Decimal::from(45));
        assert_eq!(store.bought_size("buy-2"), Decimal::from(30));
    }

    #[tokio::test]
    async fn selling_the_full_tracked_amount_clears_every_open_buy() {
        let store = InMemoryLedgerStore::default();
        store.seed(buy_record("buy-1", Decimal::from(60)));
        store.seed(buy_record("buy-2", Decimal::from(40)));
        let sell = sell_record("sell-1");

        reduce_open_buys(&store, &sell, Decimal::from(100)).await.unwrap();

        assert_eq!(store.bought_size("buy-1"), Decimal::ZERO);
        assert_eq!(store.bought_size("buy-2"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn selling_more_than_tracked_clamps_the_fraction_to_one() {
        let store = InMemoryLedgerStore::default();
        store.seed(buy_record("buy-1", Decimal::from(10)));
        let sell = sell_record("sell-1");

        reduce_open_buys(&store, &sell, Decimal::from(999)).await.unwrap();

        assert_eq!(store.bought_size("buy-1"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn a_sell_with_no_tracked_buys_is_a_noop() {
        let store = InMemoryLedgerStore::default();
        let sell = sell_record("sell-1");
        reduce_open_buys(&store, &sell, Decimal::from(5)).await.unwrap();
    }

    #[tokio::test]
    async fn zero_tokens_sold_is_a_noop() {
        let store = InMemoryLedgerStore::default();
        store.seed(buy_record("buy-1", Decimal::from(60)));
        let sell = sell_record("sell-1");

        reduce_open_buys(&store, &sell, Decimal::ZERO).await.unwrap();

        assert_eq!(store.bought_size("buy-1"), Decimal::from(60));
    }
}
