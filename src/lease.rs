// Lease Manager (§4.2): atomic claim/release of `TradeRecord`s with expiring
// leases. The atomicity lives in the store's compare-and-set `UPDATE`
// (`TradeStore::try_claim`) rather than an in-process mutex — per §5,
// workers in the same process must behave identically to workers in
// different processes, so there is deliberately no `std::sync::Mutex` here.
use crate::errors::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn try_claim(&self, record_id: &str, worker_id: &str, now: DateTime<Utc>, lease_timeout_ms: i64) -> Result<bool, StoreError>;
    async fn release(&self, record_id: &str, worker_id: &str) -> Result<(), StoreError>;
    async fn extend_lease(&self, record_id: &str, worker_id: &str, now: DateTime<Utc>, lease_timeout_ms: i64) -> Result<bool, StoreError>;
    async fn clear_expired(&self, leader_address: &str, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
impl LeaseStore for crate::store::TradeStore {
    async fn try_claim(&self, record_id: &str, worker_id: &str, now: DateTime<Utc>, lease_timeout_ms: i64) -> Result<bool, StoreError> {
        crate::store::TradeStore::try_claim(self, record_id, worker_id, now, lease_timeout_ms).await
    }
    async fn release(&self, record_id: &str, worker_id: &str) -> Result<(), StoreError> {
        crate::store::TradeStore::release(self, record_id, worker_id).await
    }
    async fn extend_lease(&self, record_id: &str, worker_id: &str, now: DateTime<Utc>, lease_timeout_ms: i64) -> Result<bool, StoreError> {
        crate::store::TradeStore::extend_lease(self, record_id, worker_id, now, lease_timeout_ms).await
    }
    async fn clear_expired(&self, leader_address: &str, now: DateTime<Utc>) -> Result<u64, StoreError> {
        crate::store::TradeStore::clear_expired(self, leader_address, now).await
    }
}

pub struct LeaseManager<'a, S: LeaseStore> {
    store: &'a S,
    worker_id: String,
    lease_timeout_ms: i64,
}

impl<'a, S: LeaseStore> LeaseManager<'a, S> {
    pub fn new(store: &'a S, worker_id: String, lease_timeout_ms: i64) -> Self {
        Self { store, worker_id, lease_timeout_ms }
    }

    pub async fn acquire(&self, record_id: &str) -> Result<bool, StoreError> {
        self.store
            .try_claim(record_id, &self.worker_id, Utc::now(), self.lease_timeout_ms)
            .await
    }

    pub async fn release(&self, record_id: &str) -> Result<(), StoreError> {
        self.store.release(record_id, &self.worker_id).await
    }

    pub async fn extend(&self, record_id: &str) -> Result<bool, StoreError> {
        self.store
            .extend_lease(record_id, &self.worker_id, Utc::now(), self.lease_timeout_ms)
            .await
    }

    /// Resets stuck `claimed` records for a leader back to `detected`.
    /// `executing` records are never touched here — see `TradeStore::clear_expired`.
    pub async fn clear_expired(&self, leader_address: &str) -> Result<u64, StoreError> {
        self.store.clear_expired(leader_address, Utc::now()).await
    }
}
