// Exchange client (§6): activity feed, positions feed, order book, and
// order submission. `GuardedExecutor` is the only caller of `submit_order`
// — structurally enforced by keeping this module's types private to the
// crate boundary the Guarded Executor owns.
use crate::errors::ExchangeError;
use crate::model::{ActivityEntry, OrderBook, OrderSubmitResult, PositionEntry, Side};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn fetch_activity(&self, leader: &str) -> Result<Vec<ActivityEntry>, ExchangeError>;
    async fn fetch_positions(&self, address: &str) -> Result<Vec<PositionEntry>, ExchangeError>;
    async fn get_order_book(&self, token_id: &str) -> Result<OrderBook, ExchangeError>;
    async fn submit_order(
        &self,
        token_id: &str,
        side: Side,
        amount: Decimal,
        price: Decimal,
    ) -> Result<OrderSubmitResult, ExchangeError>;
}

// ─── Sim Exchange (in-memory, deterministic) ───────────────────────────────

/// Deterministic in-memory exchange used by tests and `SHADOW_MODE`. Fills
/// are always full at the requested price, up to a configured per-token
/// liquidity ceiling.
pub struct SimExchange {
    pub books: std::sync::Mutex<HashMap<String, OrderBook>>,
    pub activity: std::sync::Mutex<HashMap<String, Vec<ActivityEntry>>>,
    pub positions: std::sync::Mutex<HashMap<String, Vec<PositionEntry>>>,
    pub fill_ratio: Decimal,
}

impl SimExchange {
    pub fn new() -> Self {
        Self {
            books: std::sync::Mutex::new(HashMap::new()),
            activity: std::sync::Mutex::new(HashMap::new()),
            positions: std::sync::Mutex::new(HashMap::new()),
            fill_ratio: Decimal::ONE,
        }
    }

    pub fn set_book(&self, token_id: &str, book: OrderBook) {
        self.books.lock().unwrap().insert(token_id.to_string(), book);
    }

    pub fn set_activity(&self, leader: &str, entries: Vec<ActivityEntry>) {
        self.activity.lock().unwrap().insert(leader.to_string(), entries);
    }

    pub fn set_positions(&self, address: &str, entries: Vec<PositionEntry>) {
        self.positions.lock().unwrap().insert(address.to_string(), entries);
    }
}

impl Default for SimExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeClient for SimExchange {
    async fn fetch_activity(&self, leader: &str) -> Result<Vec<ActivityEntry>, ExchangeError> {
        Ok(self.activity.lock().unwrap().get(leader).cloned().unwrap_or_default())
    }

    async fn fetch_positions(&self, address: &str) -> Result<Vec<PositionEntry>, ExchangeError> {
        Ok(self.positions.lock().unwrap().get(address).cloned().unwrap_or_default())
    }

    async fn get_order_book(&self, token_id: &str) -> Result<OrderBook, ExchangeError> {
        self.books
            .lock()
            .unwrap()
            .get(token_id)
            .cloned()
            .ok_or_else(|| ExchangeError::Message(format!("no sim book for {token_id}")))
    }

    async fn submit_order(
        &self,
        token_id: &str,
        _side: Side,
        amount: Decimal,
        price: Decimal,
    ) -> Result<OrderSubmitResult, ExchangeError> {
        let filled = amount * self.fill_ratio;
        Ok(OrderSubmitResult {
            success: true,
            order_id: Some(format!("sim-{token_id}-{}", uuid::Uuid::new_v4())),
            filled_size: Some(filled),
            filled_tokens: Some(if price > Decimal::ZERO { filled / price } else { Decimal::ZERO }),
            avg_fill_price: Some(price),
        })
    }
}

// ─── Live Exchange (HTTP, against the real data/activity/CLOB hosts) ──────

pub struct LiveExchange {
    pub activity_host: String,
    pub data_host: String,
    pub clob_host: String,
    pub client: reqwest::Client,
    pub private_key: String,
}

impl LiveExchange {
    pub fn new(activity_host: String, data_host: String, clob_host: String, private_key: String) -> Self {
        Self {
            activity_host,
            data_host,
            clob_host,
            client: reqwest::Client::new(),
            private_key,
        }
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, ExchangeError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        if resp.status().as_u16() == 429 {
            return Err(ExchangeError::RateLimited);
        }

        resp.json().await.map_err(|e| ExchangeError::Network(e.to_string()))
    }
}

#[async_trait]
impl ExchangeClient for LiveExchange {
    async fn fetch_activity(&self, leader: &str) -> Result<Vec<ActivityEntry>, ExchangeError> {
        let url = format!("{}/activity?user={leader}", self.activity_host);
        let data = self.get_json(&url).await?;
        log::debug!("[EXCHANGE] activity fetch for {leader}: {} bytes", data.to_string().len());
        serde_json::from_value(data).map_err(|e| ExchangeError::Message(e.to_string()))
    }

    async fn fetch_positions(&self, address: &str) -> Result<Vec<PositionEntry>, ExchangeError> {
        let url = format!("{}/positions?user={address}", self.data_host);
        let data = self.get_json(&url).await?;
        serde_json::from_value(data).map_err(|e| ExchangeError::Message(e.to_string()))
    }

    async fn get_order_book(&self, token_id: &str) -> Result<OrderBook, ExchangeError> {
        let url = format!("{}/book?token_id={token_id}", self.clob_host);
        let data = self.get_json(&url).await?;
        serde_json::from_value(data).map_err(|e| ExchangeError::Message(e.to_string()))
    }

    async fn submit_order(
        &self,
        token_id: &str,
        side: Side,
        amount: Decimal,
        price: Decimal,
    ) -> Result<OrderSubmitResult, ExchangeError> {
        let signed = crate::signing::sign_order(&self.private_key, token_id, side, amount, price)
            .await
            .map_err(|e| ExchangeError::Message(e.to_string()))?;

        let resp = self
            .client
            .post(format!("{}/order", self.clob_host))
            .json(&signed)
            .send()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        if resp.status().as_u16() == 429 {
            return Err(ExchangeError::RateLimited);
        }

        let data: serde_json::Value = resp.json().await.map_err(|e| ExchangeError::Network(e.to_string()))?;

        if data["success"].as_bool() == Some(false) {
            if let Some(err_str) = data["error"].as_str() {
                return Err(ExchangeError::Message(err_str.to_string()));
            }
            if let Ok(nested) = serde_json::from_value::<crate::errors::NestedErrorBody>(data["error"].clone()) {
                return Err(ExchangeError::Nested(nested));
            }
            return Err(ExchangeError::Message("order rejected".to_string()));
        }

        serde_json::from_value(data).map_err(|e| ExchangeError::Message(e.to_string()))
    }
}
