// Durable store for `TradeRecord`/`FollowerPosition`. The source system
// places records in one Mongo-style collection per leader
// (`user_activities_<leaderAddress>`); this normalizes that into two
// Postgres tables with a `leader_address` column and a composite index,
// which spec.md §9 says is behavior-identical as long as the natural-key
// uniqueness constraint stays leader-scoped.
use crate::errors::StoreError;
use crate::model::{FollowerPosition, TradeRecord, TradeState};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

pub struct TradeStore {
    pool: PgPool,
}

impl TradeStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Creates the schema if absent. Production deployments are expected to
    /// run migrations separately; this exists so a fresh dev database can
    /// come up with `cargo run` alone and no separate migration step.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_records (
                id TEXT PRIMARY KEY,
                leader_address TEXT NOT NULL,
                transaction_hash TEXT NOT NULL,
                token_id TEXT NOT NULL,
                condition_id TEXT NOT NULL,
                timestamp BIGINT NOT NULL,
                side TEXT NOT NULL,
                size NUMERIC NOT NULL,
                usdc_size NUMERIC NOT NULL,
                price NUMERIC NOT NULL,
                title TEXT,
                slug TEXT,
                outcome TEXT,
                outcome_index INT,
                end_date TIMESTAMPTZ,
                state TEXT NOT NULL,
                retry_count INT NOT NULL DEFAULT 0,
                last_retry_at TIMESTAMPTZ,
                skip_reason TEXT,
                failure_reason TEXT,
                claimed_by TEXT,
                claimed_at TIMESTAMPTZ,
                lease_expires_at TIMESTAMPTZ,
                idempotency_key TEXT,
                clob_order_id TEXT,
                intended_size NUMERIC,
                filled_size NUMERIC,
                actual_tokens NUMERIC,
                avg_fill_price NUMERIC,
                expected_tokens NUMERIC,
                executed_at TIMESTAMPTZ,
                needs_manual_review BOOLEAN NOT NULL DEFAULT FALSE,
                my_bought_size NUMERIC,
                UNIQUE (leader_address, transaction_hash)
            );
            CREATE INDEX IF NOT EXISTS idx_trade_records_state_claimed
                ON trade_records (state, claimed_at);
            CREATE INDEX IF NOT EXISTS idx_trade_records_asset
                ON trade_records (token_id, condition_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_trade_records_idempotency
                ON trade_records (idempotency_key) WHERE idempotency_key IS NOT NULL;

            CREATE TABLE IF NOT EXISTS follower_positions (
                leader_address TEXT NOT NULL,
                token_id TEXT NOT NULL,
                condition_id TEXT NOT NULL,
                size NUMERIC NOT NULL,
                avg_price NUMERIC NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (leader_address, token_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Whether any record (of any state) has ever been filed for this
    /// leader — the durable test for "not first run", independent of
    /// process restarts.
    pub async fn has_any_record(&self, leader_address: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM trade_records WHERE leader_address = $1 LIMIT 1")
            .bind(leader_address)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn exists_by_natural_key(
        &self,
        leader_address: &str,
        transaction_hash: &str,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 FROM trade_records WHERE leader_address = $1 AND transaction_hash = $2",
        )
        .bind(leader_address)
        .bind(transaction_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Insert a `detected` (or `skipped` historical-bootstrap) record.
    /// Relies on the `(leader_address, transaction_hash)` unique index to
    /// make this a no-op if the natural key already exists — the feed is
    /// polled at-least-once, so duplicate inserts are expected.
    pub async fn insert_new(&self, record: &TradeRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO trade_records (
                id, leader_address, transaction_hash, token_id, condition_id, timestamp,
                side, size, usdc_size, price, title, slug, outcome, outcome_index, end_date,
                state, retry_count, skip_reason, needs_manual_review
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19)
            ON CONFLICT (leader_address, transaction_hash) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(&record.leader_address)
        .bind(&record.transaction_hash)
        .bind(&record.token_id)
        .bind(&record.condition_id)
        .bind(record.timestamp)
        .bind(side_str(record.side))
        .bind(record.size)
        .bind(record.usdc_size)
        .bind(record.price)
        .bind(&record.title)
        .bind(&record.slug)
        .bind(&record.outcome)
        .bind(record.outcome_index)
        .bind(record.end_date)
        .bind(record.state.as_str())
        .bind(record.retry_count as i32)
        .bind(&record.skip_reason)
        .bind(record.needs_manual_review)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomic compare-and-set claim. Succeeds iff `claimed_by IS NULL OR
    /// lease_expires_at < now`, or the current holder is `worker_id` already
    /// (re-acquire is idempotent). On success the row moves to `claimed`.
    pub async fn try_claim(
        &self,
        record_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_timeout_ms: i64,
    ) -> Result<bool, StoreError> {
        let expires = now + chrono::Duration::milliseconds(lease_timeout_ms);
        let result = sqlx::query(
            r#"
            UPDATE trade_records
            SET claimed_by = $2, claimed_at = $3, lease_expires_at = $4, state = 'claimed'
            WHERE id = $1
              AND (claimed_by IS NULL OR lease_expires_at < $3 OR claimed_by = $2)
              AND state IN ('detected', 'failed')
            "#,
        )
        .bind(record_id)
        .bind(worker_id)
        .bind(now)
        .bind(expires)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Releases the lease only if `worker_id` is the current holder.
    pub async fn release(&self, record_id: &str, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE trade_records SET claimed_by = NULL, lease_expires_at = NULL \
             WHERE id = $1 AND claimed_by = $2",
        )
        .bind(record_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn extend_lease(
        &self,
        record_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_timeout_ms: i64,
    ) -> Result<bool, StoreError> {
        let expires = now + chrono::Duration::milliseconds(lease_timeout_ms);
        let result = sqlx::query(
            "UPDATE trade_records SET lease_expires_at = $3 \
             WHERE id = $1 AND claimed_by = $2",
        )
        .bind(record_id)
        .bind(worker_id)
        .bind(expires)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_executing(&self, record_id: &str, idempotency_key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE trade_records SET state = 'executing', idempotency_key = $2 \
             WHERE id = $1 AND idempotency_key IS NULL",
        )
        .bind(record_id)
        .bind(idempotency_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Resets records stuck in `claimed` whose lease has expired back to
    /// `detected`. `executing` records are intentionally left alone — an
    /// order may have been accepted by the exchange without the writeback
    /// completing, so they are surfaced instead (see `stuck_executing`).
    pub async fn clear_expired(&self, leader_address: &str, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE trade_records SET state = 'detected', claimed_by = NULL, lease_expires_at = NULL \
             WHERE leader_address = $1 AND state = 'claimed' AND lease_expires_at < $2",
        )
        .bind(leader_address)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn stuck_executing(&self, now: DateTime<Utc>) -> Result<Vec<TradeRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM trade_records WHERE state = 'executing' AND lease_expires_at < $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    pub async fn needs_manual_review(&self) -> Result<Vec<TradeRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM trade_records WHERE needs_manual_review = TRUE")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    /// Up to `batch` records ready for the executor loop: `detected`, or
    /// `failed` with budget remaining, oldest leader trade first.
    pub async fn next_batch(
        &self,
        leader_address: &str,
        retry_limit: u32,
        batch: i64,
    ) -> Result<Vec<TradeRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM trade_records \
             WHERE leader_address = $1 \
               AND (state = 'detected' OR (state = 'failed' AND retry_count < $2)) \
             ORDER BY timestamp ASC LIMIT $3",
        )
        .bind(leader_address)
        .bind(retry_limit as i32)
        .bind(batch)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    pub async fn get(&self, record_id: &str) -> Result<TradeRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM trade_records WHERE id = $1")
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(record_id.to_string()))?;
        row_to_record(&row)
    }

    /// Persists the outcome of a Guarded Executor run. This is the only
    /// write path that moves a record into a terminal state.
    #[allow(clippy::too_many_arguments)]
    pub async fn write_outcome(
        &self,
        record_id: &str,
        state: TradeState,
        intended_size: Option<Decimal>,
        filled_size: Option<Decimal>,
        actual_tokens: Option<Decimal>,
        avg_fill_price: Option<Decimal>,
        clob_order_id: Option<String>,
        skip_reason: Option<String>,
        failure_reason: Option<String>,
        needs_manual_review: bool,
        retry_increment: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE trade_records SET
                state = $2, intended_size = $3, filled_size = $4, actual_tokens = $5,
                avg_fill_price = $6, clob_order_id = $7, skip_reason = $8, failure_reason = $9,
                needs_manual_review = $10,
                retry_count = retry_count + CASE WHEN $11 THEN 1 ELSE 0 END,
                last_retry_at = CASE WHEN $11 THEN now() ELSE last_retry_at END,
                executed_at = CASE WHEN $2 = 'executed' THEN now() ELSE executed_at END
            WHERE id = $1
            "#,
        )
        .bind(record_id)
        .bind(state.as_str())
        .bind(intended_size)
        .bind(filled_size)
        .bind(actual_tokens)
        .bind(avg_fill_price)
        .bind(clob_order_id)
        .bind(skip_reason)
        .bind(failure_reason)
        .bind(needs_manual_review)
        .bind(retry_increment)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_my_bought_size(&self, record_id: &str, size: Decimal) -> Result<(), StoreError> {
        sqlx::query("UPDATE trade_records SET my_bought_size = $2 WHERE id = $1")
            .bind(record_id)
            .bind(size)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Surviving BUYs for a leader/token with tracked exposure still open.
    pub async fn open_buys(&self, leader_address: &str, token_id: &str) -> Result<Vec<TradeRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM trade_records \
             WHERE leader_address = $1 AND token_id = $2 AND side = 'BUY' \
               AND state = 'executed' AND my_bought_size > 0",
        )
        .bind(leader_address)
        .bind(token_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    /// Expected follower exposure for `token_id`, derived purely from this
    /// store's executed trades — used by the reconciler as "expected".
    pub async fn expected_position(&self, leader_address: &str, token_id: &str) -> Result<Decimal, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(
                CASE WHEN side = 'BUY' THEN COALESCE(actual_tokens, 0)
                     ELSE -COALESCE(actual_tokens, 0) END
            ), 0) AS net
            FROM trade_records
            WHERE leader_address = $1 AND token_id = $2 AND state IN ('executed', 'reconciled')
            "#,
        )
        .bind(leader_address)
        .bind(token_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("net")?)
    }

    pub async fn mark_reconciled(&self, leader_address: &str, token_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE trade_records SET state = 'reconciled' \
             WHERE leader_address = $1 AND token_id = $2 AND state = 'executed'",
        )
        .bind(leader_address)
        .bind(token_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn distinct_token_ids(&self, leader_address: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT token_id FROM trade_records WHERE leader_address = $1",
        )
        .bind(leader_address)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| Ok(r.try_get("token_id")?)).collect()
    }

    pub async fn upsert_follower_position(&self, pos: &FollowerPosition) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO follower_positions (leader_address, token_id, condition_id, size, avg_price, updated_at)
            VALUES ($1,$2,$3,$4,$5,$6)
            ON CONFLICT (leader_address, token_id) DO UPDATE SET
                condition_id = EXCLUDED.condition_id,
                size = EXCLUDED.size,
                avg_price = EXCLUDED.avg_price,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&pos.leader_address)
        .bind(&pos.token_id)
        .bind(&pos.condition_id)
        .bind(pos.size)
        .bind(pos.avg_price)
        .bind(pos.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_follower_position(
        &self,
        leader_address: &str,
        token_id: &str,
    ) -> Result<Option<FollowerPosition>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM follower_positions WHERE leader_address = $1 AND token_id = $2",
        )
        .bind(leader_address)
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_position(&r)).transpose()
    }
}

fn side_str(side: crate::model::Side) -> &'static str {
    match side {
        crate::model::Side::Buy => "BUY",
        crate::model::Side::Sell => "SELL",
    }
}

fn parse_side(s: &str) -> Result<crate::model::Side, StoreError> {
    match s {
        "BUY" => Ok(crate::model::Side::Buy),
        "SELL" => Ok(crate::model::Side::Sell),
        other => Err(StoreError::NotFound(format!("unknown side in row: {other}"))),
    }
}

fn parse_state(s: &str) -> Result<TradeState, StoreError> {
    Ok(match s {
        "detected" => TradeState::Detected,
        "claimed" => TradeState::Claimed,
        "executing" => TradeState::Executing,
        "executed" => TradeState::Executed,
        "skipped" => TradeState::Skipped,
        "failed" => TradeState::Failed,
        "reconciled" => TradeState::Reconciled,
        other => return Err(StoreError::NotFound(format!("unknown state in row: {other}"))),
    })
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<TradeRecord, StoreError> {
    Ok(TradeRecord {
        id: row.try_get("id")?,
        leader_address: row.try_get("leader_address")?,
        transaction_hash: row.try_get("transaction_hash")?,
        token_id: row.try_get("token_id")?,
        condition_id: row.try_get("condition_id")?,
        timestamp: row.try_get("timestamp")?,
        side: parse_side(row.try_get::<String, _>("side")?.as_str())?,
        size: row.try_get("size")?,
        usdc_size: row.try_get("usdc_size")?,
        price: row.try_get("price")?,
        title: row.try_get("title")?,
        slug: row.try_get("slug")?,
        outcome: row.try_get("outcome")?,
        outcome_index: row.try_get("outcome_index")?,
        end_date: row.try_get("end_date")?,
        state: parse_state(row.try_get::<String, _>("state")?.as_str())?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        last_retry_at: row.try_get("last_retry_at")?,
        skip_reason: row.try_get("skip_reason")?,
        failure_reason: row.try_get("failure_reason")?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: row.try_get("claimed_at")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        idempotency_key: row.try_get("idempotency_key")?,
        clob_order_id: row.try_get("clob_order_id")?,
        intended_size: row.try_get("intended_size")?,
        filled_size: row.try_get("filled_size")?,
        actual_tokens: row.try_get("actual_tokens")?,
        avg_fill_price: row.try_get("avg_fill_price")?,
        expected_tokens: row.try_get("expected_tokens")?,
        executed_at: row.try_get("executed_at")?,
        needs_manual_review: row.try_get("needs_manual_review")?,
        my_bought_size: row.try_get("my_bought_size")?,
    })
}

fn row_to_position(row: &sqlx::postgres::PgRow) -> Result<FollowerPosition, StoreError> {
    Ok(FollowerPosition {
        leader_address: row.try_get("leader_address")?,
        token_id: row.try_get("token_id")?,
        condition_id: row.try_get("condition_id")?,
        size: row.try_get("size")?,
        avg_price: row.try_get("avg_price")?,
        updated_at: row.try_get("updated_at")?,
    })
}
