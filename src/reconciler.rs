// Reconciler (§4.6): periodically diffs each leader/tokenId's expected
// follower exposure (derived from executed trades) against the exchange's
// actual positions feed, and surfaces drift by severity.
use crate::errors::StoreError;
use crate::exchange::ExchangeClient;
use crate::model::{ReconciliationResult, ReconciliationSeverity};
use crate::store::TradeStore;
use chrono::Utc;
use rust_decimal::Decimal;

/// Runs one reconciliation pass for every tokenId this leader has trade
/// history for, and marks clean matches `reconciled`.
pub async fn run_once<E: ExchangeClient + ?Sized>(
    store: &TradeStore,
    exchange: &E,
    proxy_wallet: &str,
    leader_address: &str,
) -> Result<Vec<ReconciliationResult>, String> {
    let token_ids = store.distinct_token_ids(leader_address).await.map_err(|e| e.to_string())?;
    let actual_positions = exchange.fetch_positions(proxy_wallet).await.map_err(|e| e.to_string())?;

    let mut results = Vec::new();
    for token_id in token_ids {
        let expected = store.expected_position(leader_address, &token_id).await.map_err(|e| e.to_string())?;
        let actual = actual_positions
            .iter()
            .find(|p| p.asset == token_id)
            .map(|p| p.size)
            .unwrap_or(Decimal::ZERO);

        let result = diff(leader_address, &token_id, expected, actual);

        match result.severity {
            ReconciliationSeverity::Critical => log::error!("[RECONCILE] {leader_address} {token_id}: {result:?}"),
            ReconciliationSeverity::Warning => log::warn!("[RECONCILE] {leader_address} {token_id}: {result:?}"),
            ReconciliationSeverity::Info => log::debug!("[RECONCILE] {leader_address} {token_id}: {result:?}"),
        }

        if result.matches {
            mark_clean(store, leader_address, &token_id).await.map_err(|e| e.to_string())?;
        }

        results.push(result);
    }

    for p in &actual_positions {
        if !store
            .expected_position(leader_address, &p.asset)
            .await
            .map(|e| e != Decimal::ZERO)
            .unwrap_or(false)
            && p.size > Decimal::ZERO
        {
            log::warn!("[RECONCILE] {leader_address} holds unexpected position in {}: {}", p.asset, p.size);
        }
    }

    Ok(results)
}

/// Pure diff: expected (from our own ledger) vs actual (from the exchange).
/// Severity follows a three-tier split on absolute percent difference
/// relative to the larger of the two sides, but `matches` — the gate for
/// transitioning a tokenId to `reconciled` — uses the tighter absolute bar
/// `|expected - actual| <= max(1% of expected, 0.1 tokens)` rather than the
/// severity buckets, since up to 5% drift still counts as a real
/// discrepancy for the purpose of declaring a position fully matched.
pub fn diff(leader_address: &str, token_id: &str, expected: Decimal, actual: Decimal) -> ReconciliationResult {
    let denom = expected.abs().max(actual.abs());
    let pct_diff = if denom == Decimal::ZERO {
        Decimal::ZERO
    } else {
        (expected - actual).abs() / denom * Decimal::from(100)
    };

    let severity = if pct_diff > Decimal::from(20) {
        ReconciliationSeverity::Critical
    } else if pct_diff > Decimal::from(5) {
        ReconciliationSeverity::Warning
    } else {
        ReconciliationSeverity::Info
    };

    let abs_diff = (expected - actual).abs();
    let tolerance = (expected.abs() * Decimal::new(1, 2)).max(Decimal::new(1, 1));
    let matches = abs_diff <= tolerance;

    ReconciliationResult {
        leader_address: leader_address.to_string(),
        token_id: token_id.to_string(),
        expected,
        actual,
        pct_diff,
        severity,
        matches,
        checked_at: Utc::now(),
    }
}

async fn mark_clean(store: &TradeStore, leader_address: &str, token_id: &str) -> Result<(), StoreError> {
    store.mark_reconciled(leader_address, token_id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_is_info_severity_and_matches() {
        let r = diff("0xleader", "token-1", Decimal::from(100), Decimal::from(100));
        assert_eq!(r.severity, ReconciliationSeverity::Info);
        assert!(r.matches);
    }

    #[test]
    fn ten_percent_drift_is_warning_and_does_not_match() {
        let r = diff("0xleader", "token-1", Decimal::from(100), Decimal::from(90));
        assert_eq!(r.severity, ReconciliationSeverity::Warning);
        assert!(!r.matches);
    }

    #[test]
    fn thirty_percent_drift_is_critical_and_does_not_match() {
        let r = diff("0xleader", "token-1", Decimal::from(100), Decimal::from(70));
        assert_eq!(r.severity, ReconciliationSeverity::Critical);
        assert!(!r.matches);
    }

    #[test]
    fn three_percent_drift_is_info_severity_but_still_does_not_match() {
        // Severity buckets classify an existing discrepancy's badness; the
        // existence test for "no discrepancy" is the tighter absolute bar.
        let r = diff("0xleader", "token-1", Decimal::from(100), Decimal::from(97));
        assert_eq!(r.severity, ReconciliationSeverity::Info);
        assert!(!r.matches);
    }

    #[test]
    fn drift_within_one_percent_of_expected_matches() {
        let r = diff("0xleader", "token-1", Decimal::from(100), Decimal::new(9991, 2));
        assert!(r.matches);
    }

    #[test]
    fn tiny_expected_position_uses_the_point_one_token_floor() {
        // 1% of 1.0 is 0.01, well under the 0.1-token floor; a 0.05 diff
        // should still count as matching.
        let r = diff("0xleader", "token-1", Decimal::ONE, Decimal::new(95, 2));
        assert!(r.matches);
        let r = diff("0xleader", "token-1", Decimal::ONE, Decimal::new(8, 1));
        assert!(!r.matches);
    }

    #[test]
    fn both_sides_zero_is_info_not_a_division_error() {
        let r = diff("0xleader", "token-1", Decimal::ZERO, Decimal::ZERO);
        assert_eq!(r.severity, ReconciliationSeverity::Info);
        assert!(r.matches);
        assert_eq!(r.pct_diff, Decimal::ZERO);
    }
}
